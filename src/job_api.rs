use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::retry::{retry_async, RetryPolicy};
use crate::stream::client::StreamConfig;
use crate::stream::proto::JobStatus;

const ERROR_BODY_SNIPPET_LEN: usize = 220;
pub const DEFAULT_API_BASE_URL: &str = "http://localhost:8000";
pub const API_BASE_URL_ENV: &str = "QCOMPRESS_API_URL";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct JobApiDefaults;

impl JobApiDefaults {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
    pub const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(15);
}

#[derive(Clone, Debug)]
pub struct JobApiClientOptions {
    pub base_url: String,
    pub connect_timeout: Duration,
    pub attempt_timeout: Duration,
    /// Applied to GET requests only; job-creating POSTs are sent once.
    pub retry_policy: RetryPolicy,
}

impl JobApiClientOptions {
    /// Default options with the base URL taken from `QCOMPRESS_API_URL`.
    pub fn from_env() -> Self {
        let mut options = Self::default();
        if let Some(base_url) = std::env::var(API_BASE_URL_ENV)
            .ok()
            .filter(|value| !value.trim().is_empty())
        {
            options.base_url = base_url;
        }
        options
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

impl Default for JobApiClientOptions {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_API_BASE_URL.to_string(),
            connect_timeout: JobApiDefaults::CONNECT_TIMEOUT,
            attempt_timeout: JobApiDefaults::ATTEMPT_TIMEOUT,
            retry_policy: RetryPolicy::job_api(),
        }
    }
}

/// Client for the job-control endpoints of the compression backend.
#[derive(Clone, Debug)]
pub struct JobApiClient {
    http: Client,
    base_url: String,
    attempt_timeout: Duration,
    retry_policy: RetryPolicy,
}

impl JobApiClient {
    pub fn new() -> Result<Self, JobApiError> {
        Self::with_options(JobApiClientOptions::default())
    }

    pub fn with_options(options: JobApiClientOptions) -> Result<Self, JobApiError> {
        let http = Client::builder()
            .connect_timeout(options.connect_timeout)
            .build()
            .map_err(JobApiError::Transport)?;

        Ok(Self {
            http,
            base_url: options.base_url.trim().trim_end_matches('/').to_string(),
            attempt_timeout: options.attempt_timeout,
            retry_policy: options.retry_policy,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Stream configuration pointing at the same backend.
    pub fn stream_config(&self) -> StreamConfig {
        StreamConfig::new(self.base_url.clone())
    }

    pub async fn list_models(&self) -> Result<Vec<ModelInfo>, JobApiError> {
        self.get_json("/api/models").await
    }

    /// Submits a compression job. The result carries the new job id with
    /// status `pending`.
    pub async fn start_compression(
        &self,
        request: &CompressionRequest,
    ) -> Result<CompressionResult, JobApiError> {
        self.post_json("/api/compress", Some(request)).await
    }

    pub async fn job_status(&self, job_id: &str) -> Result<JobStatusResponse, JobApiError> {
        self.get_json(&format!("/api/status/{job_id}")).await
    }

    pub async fn job_results(&self, job_id: &str) -> Result<CompressionResult, JobApiError> {
        self.get_json(&format!("/api/results/{job_id}")).await
    }

    pub async fn cancel_job(&self, job_id: &str) -> Result<JobStatusResponse, JobApiError> {
        self.post_json::<(), _>(&format!("/api/jobs/{job_id}/cancel"), None)
            .await
    }

    /// Starts benchmark evaluation for a completed job.
    pub async fn start_benchmark(&self, job_id: &str) -> Result<BenchmarkStarted, JobApiError> {
        self.post_json::<(), _>(&format!("/api/benchmark/{job_id}"), None)
            .await
    }

    /// Benchmark results, or a pending envelope while evaluation runs.
    pub async fn benchmark_results(&self, job_id: &str) -> Result<Value, JobApiError> {
        self.get_json(&format!("/api/benchmark/{job_id}/results"))
            .await
    }

    pub async fn export_metadata(&self, job_id: &str) -> Result<Value, JobApiError> {
        self.get_json(&format!("/api/jobs/{job_id}/export/metadata"))
            .await
    }

    /// Downloads the compressed model of a completed job.
    ///
    /// The backend answers 400 while the job is still running and 404 for an
    /// unknown job; both surface as [`JobApiError::HttpStatus`].
    pub async fn export_model(
        &self,
        job_id: &str,
        format: ExportFormat,
    ) -> Result<Bytes, JobApiError> {
        let endpoint = self.endpoint(&format!("/api/jobs/{job_id}/export/{format}"));

        retry_async(
            &self.retry_policy,
            |attempt| {
                let endpoint = endpoint.clone();
                async move {
                    debug!(event = "job_api_export", endpoint = %endpoint, attempt);
                    let response = self
                        .http
                        .get(&endpoint)
                        .timeout(self.attempt_timeout)
                        .send()
                        .await
                        .map_err(JobApiError::Transport)?;
                    read_bytes(response).await
                }
            },
            JobApiError::is_retryable,
        )
        .await
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get_json<R: DeserializeOwned>(&self, path: &str) -> Result<R, JobApiError> {
        let endpoint = self.endpoint(path);

        retry_async(
            &self.retry_policy,
            |attempt| {
                let endpoint = endpoint.clone();
                async move {
                    debug!(event = "job_api_get", endpoint = %endpoint, attempt);
                    let response = self
                        .http
                        .get(&endpoint)
                        .timeout(self.attempt_timeout)
                        .send()
                        .await
                        .map_err(JobApiError::Transport)?;
                    read_json(response).await
                }
            },
            JobApiError::is_retryable,
        )
        .await
    }

    async fn post_json<B, R>(&self, path: &str, body: Option<&B>) -> Result<R, JobApiError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let endpoint = self.endpoint(path);
        debug!(event = "job_api_post", endpoint = %endpoint);

        let mut builder = self.http.post(&endpoint).timeout(self.attempt_timeout);
        if let Some(body) = body {
            builder = builder.json(body);
        }
        let response = builder.send().await.map_err(JobApiError::Transport)?;
        read_json(response).await
    }
}

async fn read_bytes(response: Response) -> Result<Bytes, JobApiError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.map_err(JobApiError::Transport)?;
        return Err(JobApiError::HttpStatus {
            status,
            body: summarize_error_body(&body),
        });
    }
    response.bytes().await.map_err(JobApiError::Transport)
}

async fn read_json<R: DeserializeOwned>(response: Response) -> Result<R, JobApiError> {
    let status = response.status();
    let body = response.text().await.map_err(JobApiError::Transport)?;

    if !status.is_success() {
        return Err(JobApiError::HttpStatus {
            status,
            body: summarize_error_body(&body),
        });
    }

    serde_json::from_str(&body).map_err(|err| JobApiError::Parse(err.to_string()))
}

/// File format for [`JobApiClient::export_model`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ExportFormat {
    Pytorch,
    Safetensors,
    Onnx,
}

impl ExportFormat {
    /// Path segment used by the export endpoint.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pytorch => "pytorch",
            Self::Safetensors => "safetensors",
            Self::Onnx => "onnx",
        }
    }

    /// Extension of the file the backend produces.
    pub fn file_extension(self) -> &'static str {
        match self {
            Self::Pytorch => "pt",
            Self::Safetensors => "safetensors",
            Self::Onnx => "onnx",
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ModelInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_mb: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Compression job submission.
///
/// `compression_configs` maps layer names to per-layer settings (ranks,
/// penalty weights, ...), passed through to the backend untouched.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CompressionRequest {
    pub model_name: String,
    #[serde(default)]
    pub compression_configs: BTreeMap<String, Value>,
}

impl CompressionRequest {
    pub fn new(model_name: impl Into<String>) -> Self {
        Self {
            model_name: model_name.into(),
            compression_configs: BTreeMap::new(),
        }
    }

    pub fn with_layer(mut self, layer: impl Into<String>, config: Value) -> Self {
        self.compression_configs.insert(layer.into(), config);
        self
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CompressionResult {
    pub job_id: String,
    pub status: JobStatus,
    #[serde(default)]
    pub original_params: u64,
    #[serde(default)]
    pub compressed_params: u64,
    #[serde(default)]
    pub compression_ratio: f64,
    #[serde(default)]
    pub original_size_mb: f64,
    #[serde(default)]
    pub compressed_size_mb: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct JobStatusResponse {
    pub job_id: String,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<CompressionResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct BenchmarkStarted {
    pub benchmark_id: String,
    pub job_id: String,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Error)]
pub enum JobApiError {
    #[error("request failed: {0}")]
    Transport(reqwest::Error),

    #[error("http status {status}: {body}")]
    HttpStatus { status: StatusCode, body: String },

    #[error("failed to parse response: {0}")]
    Parse(String),
}

impl JobApiError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(err) => err.is_timeout() || err.is_connect(),
            Self::HttpStatus { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Self::Parse(_) => false,
        }
    }

    /// `true` for a 404, which the backend returns for unknown job ids.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::HttpStatus { status, .. } if *status == StatusCode::NOT_FOUND)
    }
}

fn summarize_error_body(body: &str) -> String {
    #[derive(Debug, Deserialize)]
    struct ErrorBody {
        #[serde(default)]
        detail: Option<Value>,
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        message: Option<String>,
    }

    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        let detail = parsed.detail.and_then(|detail| match detail {
            Value::String(text) => Some(text),
            Value::Null => None,
            // Validation errors arrive as a list of objects.
            other => Some(other.to_string()),
        });
        if let Some(message) = detail.or(parsed.error).or(parsed.message) {
            return message;
        }
    }

    body.chars().take(ERROR_BODY_SNIPPET_LEN).collect()
}

#[cfg(test)]
mod tests {
    use reqwest::StatusCode;
    use serde_json::json;

    use super::{
        summarize_error_body, CompressionRequest, CompressionResult, ExportFormat, JobApiClient,
        JobApiClientOptions, JobApiError, JobStatusResponse, DEFAULT_API_BASE_URL,
    };
    use crate::stream::proto::JobStatus;

    #[test]
    fn error_body_prefers_fastapi_detail() {
        assert_eq!(
            summarize_error_body(r#"{"detail":"Job abc not found"}"#),
            "Job abc not found"
        );
        assert_eq!(
            summarize_error_body(r#"{"error":"backend busy"}"#),
            "backend busy"
        );
        assert!(summarize_error_body(
            r#"{"detail":[{"loc":["body","model_name"],"msg":"field required"}]}"#
        )
        .contains("field required"));
    }

    #[test]
    fn error_body_falls_back_to_truncated_text() {
        let body = "x".repeat(500);
        assert_eq!(summarize_error_body(&body).len(), 220);
    }

    #[test]
    fn compression_request_serializes_layer_configs() {
        let request = CompressionRequest::new("distilgpt2")
            .with_layer("transformer.h.0.mlp.c_fc", json!({"rank": 8, "lambda": 0.01}));

        let value = serde_json::to_value(request).expect("serialize request");
        assert_eq!(
            value,
            json!({
                "model_name": "distilgpt2",
                "compression_configs": {
                    "transformer.h.0.mlp.c_fc": {"rank": 8, "lambda": 0.01}
                }
            })
        );
    }

    #[test]
    fn status_response_decodes_backend_shape() {
        let payload = r#"{
            "job_id": "abc123",
            "status": "completed",
            "result": {
                "job_id": "abc123",
                "status": "completed",
                "original_params": 81912576,
                "compressed_params": 20478144,
                "compression_ratio": 4.0,
                "original_size_mb": 312.5,
                "compressed_size_mb": 78.1,
                "error": null
            },
            "error": null
        }"#;
        let parsed: JobStatusResponse = serde_json::from_str(payload).expect("decode");
        assert_eq!(parsed.status, JobStatus::Completed);
        let result: CompressionResult = parsed.result.expect("result");
        assert_eq!(result.compressed_params, 20_478_144);
        assert_eq!(result.error, None);
    }

    #[test]
    fn retry_classification() {
        let server_error = JobApiError::HttpStatus {
            status: StatusCode::SERVICE_UNAVAILABLE,
            body: String::new(),
        };
        let throttled = JobApiError::HttpStatus {
            status: StatusCode::TOO_MANY_REQUESTS,
            body: String::new(),
        };
        let missing = JobApiError::HttpStatus {
            status: StatusCode::NOT_FOUND,
            body: "Job x not found".to_string(),
        };
        assert!(server_error.is_retryable());
        assert!(throttled.is_retryable());
        assert!(!missing.is_retryable());
        assert!(missing.is_not_found());
        assert!(!JobApiError::Parse("bad".to_string()).is_retryable());
    }

    #[test]
    fn client_normalizes_base_url_and_derives_stream_config() {
        let client = JobApiClient::with_options(
            JobApiClientOptions::default().with_base_url("https://qcompress.example.com/ "),
        )
        .expect("build client");
        assert_eq!(client.base_url(), "https://qcompress.example.com");
        assert_eq!(
            client.stream_config().job_endpoint("abc").expect("url"),
            "wss://qcompress.example.com/ws/compression/abc"
        );
    }

    #[test]
    fn export_formats_map_to_endpoint_segments() {
        let segments: Vec<String> = [
            ExportFormat::Pytorch,
            ExportFormat::Safetensors,
            ExportFormat::Onnx,
        ]
        .iter()
        .map(ToString::to_string)
        .collect();
        assert_eq!(segments, vec!["pytorch", "safetensors", "onnx"]);
        assert_eq!(ExportFormat::Pytorch.file_extension(), "pt");
    }

    #[test]
    fn default_options_target_local_backend() {
        assert_eq!(JobApiClientOptions::default().base_url, DEFAULT_API_BASE_URL);
    }
}
