//! Observer lists for realtime client lifecycle and message events.
//!
//! Each event class keeps an ordered list of callbacks. Registration appends;
//! there is no unregistration. Callbacks run synchronously on the client's
//! background task, in registration order, once per occurrence.

use std::fmt;
use std::sync::Arc;

use crate::stream::client::StreamClientError;
use crate::stream::proto::InboundEvent;

/// Normal closure, as sent by [`RealtimeJobClient::disconnect`](crate::stream::client::RealtimeJobClient::disconnect).
pub const CLOSE_NORMAL: u16 = 1000;
/// Connection dropped without a close frame.
pub const CLOSE_ABNORMAL: u16 = 1006;

/// Details passed to close handlers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloseInfo {
    /// Websocket close code, if one is known.
    pub code: Option<u16>,
    /// Human-readable reason.
    pub reason: String,
    /// `true` when the owner closed the connection.
    pub initiated_locally: bool,
}

impl CloseInfo {
    pub fn manual() -> Self {
        Self {
            code: Some(CLOSE_NORMAL),
            reason: "client disconnect".to_string(),
            initiated_locally: true,
        }
    }

    pub fn abnormal(reason: impl Into<String>) -> Self {
        Self {
            code: Some(CLOSE_ABNORMAL),
            reason: reason.into(),
            initiated_locally: false,
        }
    }

    pub fn remote(code: Option<u16>, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
            initiated_locally: false,
        }
    }
}

impl fmt::Display for CloseInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "{} (code: {code})", self.reason),
            None => f.write_str(&self.reason),
        }
    }
}

pub type MessageHandler = Arc<dyn Fn(&InboundEvent) + Send + Sync>;
pub type ErrorHandler = Arc<dyn Fn(&StreamClientError) + Send + Sync>;
pub type OpenHandler = Arc<dyn Fn() + Send + Sync>;
pub type CloseHandler = Arc<dyn Fn(&CloseInfo) + Send + Sync>;

/// Registered observers, grouped by event class.
///
/// Can be assembled up front and handed to
/// [`RealtimeJobClient::connect_with_handlers`](crate::stream::client::RealtimeJobClient::connect_with_handlers)
/// so that no event of the first connection attempt is missed.
#[derive(Clone, Default)]
pub struct EventHandlers {
    pub(crate) message: Vec<MessageHandler>,
    pub(crate) error: Vec<ErrorHandler>,
    pub(crate) open: Vec<OpenHandler>,
    pub(crate) close: Vec<CloseHandler>,
}

impl fmt::Debug for EventHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHandlers")
            .field("message", &self.message.len())
            .field("error", &self.error.len())
            .field("open", &self.open.len())
            .field("close", &self.close.len())
            .finish()
    }
}

impl EventHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_message(mut self, handler: impl Fn(&InboundEvent) + Send + Sync + 'static) -> Self {
        self.message.push(Arc::new(handler));
        self
    }

    pub fn on_error(
        mut self,
        handler: impl Fn(&StreamClientError) + Send + Sync + 'static,
    ) -> Self {
        self.error.push(Arc::new(handler));
        self
    }

    pub fn on_open(mut self, handler: impl Fn() + Send + Sync + 'static) -> Self {
        self.open.push(Arc::new(handler));
        self
    }

    pub fn on_close(mut self, handler: impl Fn(&CloseInfo) + Send + Sync + 'static) -> Self {
        self.close.push(Arc::new(handler));
        self
    }

    /// Appends every handler of `other` after the ones already registered.
    pub fn extend(&mut self, other: EventHandlers) {
        self.message.extend(other.message);
        self.error.extend(other.error);
        self.open.extend(other.open);
        self.close.extend(other.close);
    }

    pub(crate) fn emit_message(&self, event: &InboundEvent) {
        for handler in &self.message {
            handler(event);
        }
    }

    pub(crate) fn emit_error(&self, error: &StreamClientError) {
        for handler in &self.error {
            handler(error);
        }
    }

    pub(crate) fn emit_open(&self) {
        for handler in &self.open {
            handler();
        }
    }

    pub(crate) fn emit_close(&self, info: &CloseInfo) {
        for handler in &self.close {
            handler(info);
        }
    }
}
