use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle status reported for a compression job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    /// Status name this client does not know about.
    Other(String),
}

impl JobStatus {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Other(name) => name,
        }
    }

    /// Whether the job can no longer make progress.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl From<String> for JobStatus {
    fn from(value: String) -> Self {
        match value.as_str() {
            "pending" => Self::Pending,
            "running" => Self::Running,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "cancelled" | "canceled" => Self::Cancelled,
            _ => Self::Other(value),
        }
    }
}

impl From<JobStatus> for String {
    fn from(value: JobStatus) -> Self {
        match value {
            JobStatus::Other(name) => name,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Frame pushed by the backend on `/ws/compression/{job_id}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundEvent {
    Metrics {
        data: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        job_id: Option<String>,
    },
    Status {
        status: JobStatus,
        job_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },
    #[serde(alias = "tt_core_data")]
    TensorCoreData {
        data: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        job_id: Option<String>,
    },
    BenchmarkResult {
        data: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        job_id: Option<String>,
    },
    Error {
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        job_id: Option<String>,
    },
    /// Heartbeat echo of a client frame.
    Pong {
        #[serde(default)]
        data: Value,
    },
}

impl InboundEvent {
    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Wire name of the `type` discriminator.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Metrics { .. } => "metrics",
            Self::Status { .. } => "status",
            Self::TensorCoreData { .. } => "tensor_core_data",
            Self::BenchmarkResult { .. } => "benchmark_result",
            Self::Error { .. } => "error",
            Self::Pong { .. } => "pong",
        }
    }
}

/// Typed view of a `metrics` payload produced during compression.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct CompressionMetrics {
    #[serde(default)]
    pub step: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loss: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression_ratio: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<f64>,
}

impl CompressionMetrics {
    /// Decodes a metrics payload; `None` when it has none of the known fields.
    pub fn from_value(data: &Value) -> Option<Self> {
        let object = data.as_object()?;
        let known = ["step", "loss", "compression_ratio", "parameters", "timestamp"];
        if !known.iter().any(|field| object.contains_key(*field)) {
            return None;
        }
        serde_json::from_value(data.clone()).ok()
    }
}
