//! Realtime job stream modules.
//!
//! - `client`: websocket transport, handler fan-out and reconnect handling.
//! - `handlers`: observer lists for message, error, open and close events.
//! - `monitor`: folds stream events into a per-job snapshot.
//! - `proto`: frames pushed by the compression backend.
//! - `reconnect`: connection state machine.

/// Reconnecting websocket client bound to one job.
pub mod client;
/// Lifecycle and message observers.
pub mod handlers;
/// Job snapshot maintained from stream events.
pub mod monitor;
/// Stream protocol messages.
pub mod proto;
/// Connection phases and reconnect decisions.
pub mod reconnect;
