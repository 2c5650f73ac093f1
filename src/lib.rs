//! Rust SDK for the QCompress Tensor-Train compression backend.
//!
//! The crate is organized by transport surface:
//! - `stream`: realtime per-job websocket client, event types and the job
//!   monitor built on top of it.
//! - `job_api`: HTTP client for starting, inspecting and cancelling jobs.
//! - `retry`: request retry and reconnect backoff policies.

/// Job-control REST client and request/response types.
pub mod job_api;
/// Retry and backoff policies used across the SDK.
pub mod retry;
/// Realtime job stream client, protocol types, and monitor.
pub mod stream;

