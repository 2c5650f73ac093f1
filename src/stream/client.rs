//! Reconnecting websocket client for a single compression job.
//!
//! [`RealtimeJobClient`] owns one connection to `<base>/ws/compression/<job_id>`.
//! A background task opens the socket, decodes inbound frames into
//! [`InboundEvent`]s and fans them out to registered handlers. When the
//! connection closes without an explicit [`RealtimeJobClient::disconnect`],
//! the task reconnects following the configured [`ReconnectPolicy`].

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Notify};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::retry::ReconnectPolicy;
use crate::stream::handlers::{CloseInfo, EventHandlers};
use crate::stream::proto::InboundEvent;
use crate::stream::reconnect::{CloseOutcome, ConnectionPhase, ReconnectState};

/// Stream base address used when nothing is configured.
pub const DEFAULT_STREAM_BASE_URL: &str = "ws://localhost:8000";
/// Environment variable read by [`StreamConfig::from_env`].
pub const STREAM_BASE_URL_ENV: &str = "QCOMPRESS_WS_URL";

const JOB_STREAM_PATH: &str = "/ws/compression";

type JobSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Where and how the realtime client connects.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamConfig {
    base_url: String,
    reconnect: ReconnectPolicy,
}

impl StreamConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim().to_string(),
            reconnect: ReconnectPolicy::default(),
        }
    }

    /// Reads the base address from `QCOMPRESS_WS_URL`, falling back to
    /// [`DEFAULT_STREAM_BASE_URL`].
    pub fn from_env() -> Self {
        std::env::var(STREAM_BASE_URL_ENV)
            .ok()
            .filter(|value| !value.trim().is_empty())
            .map(Self::new)
            .unwrap_or_default()
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim().to_string();
        self
    }

    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        self.reconnect
    }

    /// Resolves the stream address for `job_id`.
    pub fn job_endpoint(&self, job_id: &str) -> Result<String, StreamClientError> {
        job_stream_url(&self.base_url, job_id)
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self::new(DEFAULT_STREAM_BASE_URL)
    }
}

/// Builds `<base>/ws/compression/<job_id>`, rewriting `http(s)` to `ws(s)`.
pub fn job_stream_url(base_url: &str, job_id: &str) -> Result<String, StreamClientError> {
    let base = base_url.trim().trim_end_matches('/');
    let base = if let Some(rest) = strip_scheme(base, "https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = strip_scheme(base, "http://") {
        format!("ws://{rest}")
    } else if strip_scheme(base, "ws://").is_some() || strip_scheme(base, "wss://").is_some() {
        base.to_string()
    } else {
        return Err(StreamClientError::InvalidEndpoint(format!(
            "unsupported stream base url: {base_url:?}"
        )));
    };
    Ok(format!("{base}{JOB_STREAM_PATH}/{job_id}"))
}

fn strip_scheme<'a>(url: &'a str, scheme: &str) -> Option<&'a str> {
    let prefix = url.get(..scheme.len())?;
    prefix
        .eq_ignore_ascii_case(scheme)
        .then(|| &url[scheme.len()..])
}

/// Errors surfaced to `on_error` handlers.
#[derive(Debug, Error)]
pub enum StreamClientError {
    /// Websocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    /// The stream address could not be built.
    #[error("invalid stream endpoint: {0}")]
    InvalidEndpoint(String),
}

#[derive(Debug, PartialEq)]
enum Outbound {
    Frame(String),
    Close,
}

#[derive(Debug)]
struct LiveConnection {
    generation: u64,
    outbound: mpsc::UnboundedSender<Outbound>,
}

impl LiveConnection {
    fn is_open(&self) -> bool {
        !self.outbound.is_closed()
    }

    fn close(self) {
        let _ = self.outbound.send(Outbound::Close);
    }
}

#[derive(Debug)]
struct ConnectionSlot {
    state: ReconnectState,
    live: Option<LiveConnection>,
}

struct Shared {
    job_id: String,
    handlers: RwLock<EventHandlers>,
    slot: Mutex<ConnectionSlot>,
    shutdown: Notify,
    /// Flips to `true` once the background task has exited.
    finished: watch::Sender<bool>,
}

impl Shared {
    fn new(job_id: String, policy: ReconnectPolicy, handlers: EventHandlers) -> Self {
        Self {
            job_id,
            handlers: RwLock::new(handlers),
            slot: Mutex::new(ConnectionSlot {
                state: ReconnectState::new(policy),
                live: None,
            }),
            shutdown: Notify::new(),
            finished: watch::Sender::new(false),
        }
    }

    fn slot(&self) -> MutexGuard<'_, ConnectionSlot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot so handlers run without holding any client lock.
    fn handlers(&self) -> EventHandlers {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn register(&self, f: impl FnOnce(&mut EventHandlers)) {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut handlers);
    }

    fn begin_attempt(&self) -> Option<u64> {
        self.slot().state.begin_attempt()
    }

    fn handle_open(&self, generation: u64, outbound: mpsc::UnboundedSender<Outbound>) -> bool {
        {
            let mut slot = self.slot();
            if !slot.state.opened(generation) {
                return false;
            }
            let live = LiveConnection {
                generation,
                outbound,
            };
            if let Some(previous) = slot.live.replace(live) {
                previous.close();
            }
        }

        info!(event = "job_stream_open", job_id = %self.job_id, generation);
        self.handlers().emit_open();
        true
    }

    fn handle_frame(&self, text: &str) {
        match InboundEvent::from_text(text) {
            Ok(event) => {
                debug!(
                    event = "job_stream_message",
                    job_id = %self.job_id,
                    kind = event.kind()
                );
                self.handlers().emit_message(&event);
            }
            Err(err) => {
                warn!(
                    event = "job_stream_frame_dropped",
                    job_id = %self.job_id,
                    error = %err
                );
            }
        }
    }

    fn handle_error(&self, error: StreamClientError) {
        warn!(event = "job_stream_error", job_id = %self.job_id, error = %error);
        self.handlers().emit_error(&error);
    }

    /// Setup failures are reported but never retried.
    fn fail_setup(&self, error: StreamClientError) {
        self.slot().state.abandon();
        warn!(event = "job_stream_setup_failed", job_id = %self.job_id, error = %error);
        self.handlers().emit_error(&error);
    }

    fn handle_close(&self, generation: u64, info: CloseInfo) -> CloseOutcome {
        {
            let mut slot = self.slot();
            if slot.state.generation() != generation {
                return CloseOutcome::Stale;
            }
            if slot
                .live
                .as_ref()
                .is_some_and(|live| live.generation == generation)
            {
                slot.live = None;
            }
        }

        debug!(event = "job_stream_closed", job_id = %self.job_id, reason = %info);
        self.handlers().emit_close(&info);

        // Decided after the handlers ran so a disconnect issued from inside a
        // close handler suppresses the retry.
        let outcome = self.slot().state.closed(generation);
        match outcome {
            CloseOutcome::Retry { attempt, delay } => info!(
                event = "job_stream_reconnect_scheduled",
                job_id = %self.job_id,
                attempt,
                delay_ms = saturating_millis(delay)
            ),
            CloseOutcome::Exhausted => warn!(
                event = "job_stream_reconnect_exhausted",
                job_id = %self.job_id
            ),
            CloseOutcome::Manual | CloseOutcome::Stale => {}
        }
        outcome
    }

    fn send_text(&self, text: String) -> bool {
        let slot = self.slot();
        let live = slot
            .live
            .as_ref()
            .filter(|live| slot.state.phase() == ConnectionPhase::Open && live.is_open());
        match live {
            Some(live) => live.outbound.send(Outbound::Frame(text)).is_ok(),
            None => {
                warn!(event = "job_stream_send_while_closed", job_id = %self.job_id);
                false
            }
        }
    }

    fn is_connected(&self) -> bool {
        let slot = self.slot();
        slot.state.phase() == ConnectionPhase::Open
            && slot.live.as_ref().is_some_and(LiveConnection::is_open)
    }

    fn disconnect(&self) {
        let live = {
            let mut slot = self.slot();
            if slot.state.is_manually_closed() {
                return;
            }
            slot.state.close_manually();
            slot.live.take()
        };
        if let Some(live) = live {
            live.close();
        }
        self.shutdown.notify_one();
        info!(event = "job_stream_disconnect", job_id = %self.job_id);
    }
}

/// Reconnecting event-stream client bound to one job.
///
/// Dropping the client disconnects it.
pub struct RealtimeJobClient {
    shared: Arc<Shared>,
}

impl RealtimeJobClient {
    /// Creates a client for `job_id` and starts the first connection attempt.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn connect(config: &StreamConfig, job_id: impl Into<String>) -> Self {
        Self::connect_with_handlers(config, job_id, EventHandlers::new())
    }

    /// Like [`connect`](Self::connect), with handlers registered before the
    /// first attempt starts.
    pub fn connect_with_handlers(
        config: &StreamConfig,
        job_id: impl Into<String>,
        handlers: EventHandlers,
    ) -> Self {
        let job_id = job_id.into();
        let endpoint = config.job_endpoint(&job_id);
        let shared = Arc::new(Shared::new(job_id, config.reconnect_policy(), handlers));
        tokio::spawn(connection_worker(Arc::clone(&shared), endpoint));
        Self { shared }
    }

    pub fn job_id(&self) -> &str {
        &self.shared.job_id
    }

    pub fn on_message(&self, handler: impl Fn(&InboundEvent) + Send + Sync + 'static) {
        self.shared
            .register(|handlers| handlers.message.push(Arc::new(handler)));
    }

    pub fn on_error(&self, handler: impl Fn(&StreamClientError) + Send + Sync + 'static) {
        self.shared
            .register(|handlers| handlers.error.push(Arc::new(handler)));
    }

    pub fn on_open(&self, handler: impl Fn() + Send + Sync + 'static) {
        self.shared
            .register(|handlers| handlers.open.push(Arc::new(handler)));
    }

    pub fn on_close(&self, handler: impl Fn(&CloseInfo) + Send + Sync + 'static) {
        self.shared
            .register(|handlers| handlers.close.push(Arc::new(handler)));
    }

    /// Registers a prepared handler set after the existing handlers.
    pub fn register_handlers(&self, handlers: EventHandlers) {
        self.shared.register(|existing| existing.extend(handlers));
    }

    /// Sends `payload` as a JSON text frame if the connection is open.
    ///
    /// Returns `false` without sending when the connection is not open or the
    /// payload cannot be encoded. Nothing is queued for later delivery.
    pub fn send<T>(&self, payload: &T) -> bool
    where
        T: Serialize + ?Sized,
    {
        match serde_json::to_string(payload) {
            Ok(text) => self.shared.send_text(text),
            Err(err) => {
                warn!(
                    event = "job_stream_send_encode_failed",
                    job_id = %self.shared.job_id,
                    error = %err
                );
                false
            }
        }
    }

    /// Closes the connection and stops reconnecting. Terminal.
    pub fn disconnect(&self) {
        self.shared.disconnect();
    }

    pub fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.shared.slot().state.phase()
    }

    /// Consecutive reconnection attempts since the last successful open.
    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.slot().state.attempts()
    }

    /// Waits until the background task has stopped for good: after
    /// `disconnect`, an exhausted retry budget, or a setup failure.
    ///
    /// Any number of callers may wait; a cancelled wait does not affect
    /// later ones.
    pub async fn closed(&self) {
        let mut finished = self.shared.finished.subscribe();
        // The sender lives in `shared`, which outlives this borrow.
        let _ = finished.wait_for(|done| *done).await;
    }
}

impl Drop for RealtimeJobClient {
    fn drop(&mut self) {
        self.shared.disconnect();
    }
}

impl fmt::Debug for RealtimeJobClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RealtimeJobClient")
            .field("job_id", &self.shared.job_id)
            .field("phase", &self.phase())
            .field("reconnect_attempts", &self.reconnect_attempts())
            .finish()
    }
}

fn saturating_millis(delay: Duration) -> u64 {
    u64::try_from(delay.as_millis()).unwrap_or(u64::MAX)
}

/// Marks the worker finished on every exit path, including a panicking handler.
struct FinishedGuard(Arc<Shared>);

impl Drop for FinishedGuard {
    fn drop(&mut self) {
        self.0.finished.send_replace(true);
        debug!(event = "job_stream_worker_exit", job_id = %self.0.job_id);
    }
}

async fn connection_worker(shared: Arc<Shared>, endpoint: Result<String, StreamClientError>) {
    let _finished = FinishedGuard(Arc::clone(&shared));
    let endpoint = match endpoint {
        Ok(endpoint) => endpoint,
        Err(err) => {
            shared.fail_setup(err);
            return;
        }
    };

    while let Some(generation) = shared.begin_attempt() {
        let request = match endpoint.as_str().into_client_request() {
            Ok(request) => request,
            Err(err) => {
                shared.fail_setup(err.into());
                return;
            }
        };

        debug!(
            event = "job_stream_connecting",
            job_id = %shared.job_id,
            endpoint = %endpoint,
            generation
        );
        let connected = tokio::select! {
            _ = shared.shutdown.notified() => {
                shared.handle_close(generation, CloseInfo::manual());
                return;
            }
            result = connect_async(request) => result,
        };

        let close = match connected {
            Ok((mut socket, _)) => {
                let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
                if shared.handle_open(generation, outbound_tx) {
                    pump_socket(socket, outbound_rx, &shared).await
                } else {
                    let _ = socket.close(None).await;
                    CloseInfo::manual()
                }
            }
            Err(WsError::Url(err)) => {
                shared.fail_setup(WsError::Url(err).into());
                return;
            }
            Err(err) => {
                shared.handle_error(err.into());
                CloseInfo::abnormal("connection attempt failed")
            }
        };

        match shared.handle_close(generation, close) {
            CloseOutcome::Retry { delay, .. } => {
                tokio::select! {
                    _ = shared.shutdown.notified() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            CloseOutcome::Exhausted | CloseOutcome::Manual | CloseOutcome::Stale => return,
        }
    }
}

async fn pump_socket(
    mut socket: JobSocket,
    mut outbound_rx: mpsc::UnboundedReceiver<Outbound>,
    shared: &Shared,
) -> CloseInfo {
    loop {
        tokio::select! {
            command = outbound_rx.recv() => {
                match command {
                    Some(Outbound::Frame(text)) => {
                        if let Err(err) = socket.send(Message::Text(text)).await {
                            shared.handle_error(err.into());
                            return CloseInfo::abnormal("send failed");
                        }
                    }
                    Some(Outbound::Close) | None => {
                        let _ = socket.close(None).await;
                        return CloseInfo::manual();
                    }
                }
            }
            inbound = socket.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => shared.handle_frame(&text),
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                        Ok(text) => shared.handle_frame(&text),
                        Err(_) => warn!(
                            event = "job_stream_frame_dropped",
                            job_id = %shared.job_id,
                            error = "binary frame is not utf-8"
                        ),
                    },
                    Some(Ok(Message::Ping(payload))) => {
                        if let Err(err) = socket.send(Message::Pong(payload)).await {
                            shared.handle_error(err.into());
                            return CloseInfo::abnormal("pong failed");
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        return match frame {
                            Some(frame) => {
                                CloseInfo::remote(Some(u16::from(frame.code)), frame.reason.into_owned())
                            }
                            None => CloseInfo::remote(None, "closed by server"),
                        };
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        shared.handle_error(err.into());
                        return CloseInfo::abnormal("connection lost");
                    }
                    None => return CloseInfo::abnormal("stream ended"),
                }
            }
        }
    }
}

#[cfg(test)]
impl RealtimeJobClient {
    /// Client without a background task; tests drive the socket events.
    fn detached(job_id: &str, policy: ReconnectPolicy) -> Self {
        let shared = Shared::new(job_id.to_string(), policy, EventHandlers::new());
        shared.finished.send_replace(true);
        Self {
            shared: Arc::new(shared),
        }
    }

    /// Runs one successful open and returns the stub transport's receiver.
    fn simulate_open(&self) -> (u64, mpsc::UnboundedReceiver<Outbound>) {
        let generation = self.shared.begin_attempt().expect("attempt allowed");
        let (tx, rx) = mpsc::unbounded_channel();
        assert!(self.shared.handle_open(generation, tx));
        (generation, rx)
    }
}
