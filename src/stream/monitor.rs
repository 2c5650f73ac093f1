//! Job monitor folding the realtime stream into dashboard state.
//!
//! `JobMonitor` registers handlers on a [`RealtimeJobClient`] and keeps a
//! [`JobSnapshot`] current: lifecycle status, a bounded metrics history, the
//! latest tensor-core sample, benchmark outcomes and the last reported error.

use std::collections::VecDeque;
use std::sync::{Arc, PoisonError, RwLock};

use serde_json::Value;
use tokio::sync::watch;
use tracing::debug;

use crate::stream::client::RealtimeJobClient;
use crate::stream::handlers::EventHandlers;
use crate::stream::proto::{CompressionMetrics, InboundEvent, JobStatus};

/// Metrics samples kept per job unless configured otherwise.
pub const DEFAULT_METRICS_HISTORY: usize = 500;

/// One `metrics` frame, with its typed view when the payload matches.
#[derive(Clone, Debug, PartialEq)]
pub struct MetricsSample {
    pub raw: Value,
    pub metrics: Option<CompressionMetrics>,
}

/// Point-in-time view of a monitored job.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct JobSnapshot {
    pub job_id: String,
    pub status: Option<JobStatus>,
    /// Extra payload attached to the latest status frame.
    pub status_detail: Option<Value>,
    pub connected: bool,
    pub metrics: VecDeque<MetricsSample>,
    pub latest_tensor_cores: Option<Value>,
    pub tensor_core_samples: u64,
    pub benchmarks: Vec<Value>,
    pub last_error: Option<String>,
    pub transport_errors: u64,
    pub events_received: u64,
}

impl JobSnapshot {
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            ..Self::default()
        }
    }

    /// Most recent sample that decoded as [`CompressionMetrics`].
    pub fn latest_metrics(&self) -> Option<&CompressionMetrics> {
        self.metrics
            .iter()
            .rev()
            .find_map(|sample| sample.metrics.as_ref())
    }

    pub fn is_finished(&self) -> bool {
        self.status.as_ref().is_some_and(JobStatus::is_terminal)
    }

    /// Applies one inbound event. `history_limit` bounds `metrics`.
    pub fn apply(&mut self, event: &InboundEvent, history_limit: usize) {
        if let Some(other) = foreign_job_id(event, &self.job_id) {
            debug!(
                event = "job_monitor_foreign_event",
                job_id = %self.job_id,
                other_job_id = %other
            );
            return;
        }
        self.events_received += 1;

        match event {
            InboundEvent::Status { status, data, .. } => {
                self.status = Some(status.clone());
                self.status_detail = data.clone();
            }
            InboundEvent::Metrics { data, .. } => {
                self.metrics.push_back(MetricsSample {
                    raw: data.clone(),
                    metrics: CompressionMetrics::from_value(data),
                });
                while self.metrics.len() > history_limit {
                    self.metrics.pop_front();
                }
            }
            InboundEvent::TensorCoreData { data, .. } => {
                self.latest_tensor_cores = Some(data.clone());
                self.tensor_core_samples += 1;
            }
            InboundEvent::BenchmarkResult { data, .. } => {
                self.benchmarks.push(data.clone());
            }
            InboundEvent::Error { error, .. } => {
                self.last_error = Some(error.clone());
                self.status = Some(JobStatus::Failed);
            }
            InboundEvent::Pong { .. } => {}
        }
    }
}

fn foreign_job_id<'a>(event: &'a InboundEvent, job_id: &str) -> Option<&'a str> {
    let event_job = match event {
        InboundEvent::Status { job_id, .. } => Some(job_id.as_str()),
        InboundEvent::Metrics { job_id, .. }
        | InboundEvent::TensorCoreData { job_id, .. }
        | InboundEvent::BenchmarkResult { job_id, .. }
        | InboundEvent::Error { job_id, .. } => job_id.as_deref(),
        InboundEvent::Pong { .. } => None,
    }?;
    (!job_id.is_empty() && event_job != job_id).then_some(event_job)
}

/// Live [`JobSnapshot`] fed by a realtime client.
#[derive(Clone, Debug)]
pub struct JobMonitor {
    snapshot: Arc<RwLock<JobSnapshot>>,
    status: watch::Receiver<Option<JobStatus>>,
}

impl JobMonitor {
    pub fn attach(client: &RealtimeJobClient) -> Self {
        Self::attach_with_history(client, DEFAULT_METRICS_HISTORY)
    }

    pub fn attach_with_history(client: &RealtimeJobClient, history_limit: usize) -> Self {
        let (monitor, handlers) =
            Self::with_handlers(client.job_id(), history_limit, EventHandlers::new());
        client.register_handlers(handlers);
        monitor
    }

    /// Builds a monitor before the client exists.
    ///
    /// The monitor's handlers are appended to `handlers`; pass the result to
    /// [`RealtimeJobClient::connect_with_handlers`] so the monitor sees the
    /// first frames of the first connection.
    pub fn with_handlers(
        job_id: &str,
        history_limit: usize,
        handlers: EventHandlers,
    ) -> (Self, EventHandlers) {
        let snapshot = Arc::new(RwLock::new(JobSnapshot::new(job_id)));
        let (status_tx, status_rx) = watch::channel(None);

        let on_message = Arc::clone(&snapshot);
        let on_open = Arc::clone(&snapshot);
        let on_close = Arc::clone(&snapshot);
        let on_error = Arc::clone(&snapshot);

        let handlers = handlers
            .on_message(move |event| {
                let status = {
                    let mut guard = on_message.write().unwrap_or_else(PoisonError::into_inner);
                    guard.apply(event, history_limit);
                    guard.status.clone()
                };
                status_tx.send_if_modified(|current| {
                    if *current == status {
                        return false;
                    }
                    *current = status;
                    true
                });
            })
            .on_open(move || {
                on_open
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .connected = true;
            })
            .on_close(move |_| {
                on_close
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .connected = false;
            })
            .on_error(move |_| {
                on_error
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .transport_errors += 1;
            });

        let monitor = Self {
            snapshot,
            status: status_rx,
        };
        (monitor, handlers)
    }

    pub fn snapshot(&self) -> JobSnapshot {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Waits for a terminal job status.
    ///
    /// Returns the last known status if the client is dropped first.
    pub async fn wait_for_terminal(&self) -> Option<JobStatus> {
        let mut status = self.status.clone();
        loop {
            let current = status.borrow_and_update().clone();
            if current.as_ref().is_some_and(JobStatus::is_terminal) {
                return current;
            }
            if status.changed().await.is_err() {
                return status.borrow().clone();
            }
        }
    }
}
