use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use qcompress_sdk::job_api::{
    CompressionRequest, ExportFormat, JobApiClient, JobApiClientOptions, JobApiError,
};
use qcompress_sdk::retry::RetryPolicy;
use qcompress_sdk::stream::proto::JobStatus;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Mutex};
use tokio::time::timeout;

const TEST_JOB_ID: &str = "0b7c2f4e";
const RUNNING_JOB_ID: &str = "5d1e9a03";
const MODEL_BYTES: &[u8] = b"\x80\x02compressed-tt-cores";

#[derive(Clone, Default)]
struct ApiState {
    submitted: Arc<Mutex<Option<Value>>>,
    status_calls: Arc<AtomicUsize>,
    benchmark_calls: Arc<AtomicUsize>,
    exports: Arc<Mutex<Vec<String>>>,
}

fn client_for(addr: SocketAddr) -> JobApiClient {
    let options = JobApiClientOptions {
        retry_policy: RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(20),
            jitter: Duration::ZERO,
        },
        ..JobApiClientOptions::default().with_base_url(format!("http://{addr}/"))
    };
    JobApiClient::with_options(options).expect("build job api client")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn submits_job_and_reads_status_after_transient_failure() {
    let state = ApiState::default();
    let (addr, shutdown_tx, server_task) = spawn_server(router(state.clone())).await;
    let client = client_for(addr);

    let request = CompressionRequest::new("distilgpt2")
        .with_layer("transformer.h.0.mlp.c_fc", json!({"rank": 8}));
    let started = timeout(Duration::from_secs(5), client.start_compression(&request))
        .await
        .expect("start_compression in time")
        .expect("start_compression should succeed");
    assert_eq!(started.job_id, TEST_JOB_ID);
    assert_eq!(started.status, JobStatus::Pending);

    let submitted = state.submitted.lock().await.clone().expect("request body seen");
    assert_eq!(
        submitted.get("model_name").and_then(Value::as_str),
        Some("distilgpt2")
    );
    assert_eq!(
        submitted.pointer("/compression_configs/transformer.h.0.mlp.c_fc/rank"),
        Some(&json!(8))
    );

    let status = timeout(Duration::from_secs(5), client.job_status(TEST_JOB_ID))
        .await
        .expect("job_status in time")
        .expect("job_status should succeed after a retry");
    assert_eq!(status.status, JobStatus::Running);
    assert_eq!(state.status_calls.load(Ordering::SeqCst), 2);

    let _ = shutdown_tx.send(());
    server_task.await.expect("mock http server task should join");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_job_maps_to_not_found_without_retry() {
    let state = ApiState::default();
    let (addr, shutdown_tx, server_task) = spawn_server(router(state.clone())).await;
    let client = client_for(addr);

    let err = client
        .job_results("missing")
        .await
        .expect_err("unknown job should fail");
    match &err {
        JobApiError::HttpStatus { status, body } => {
            assert_eq!(*status, StatusCode::NOT_FOUND);
            assert_eq!(body, "Job missing not found");
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert!(err.is_not_found());

    let _ = shutdown_tx.send(());
    server_task.await.expect("mock http server task should join");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn benchmark_start_is_not_retried() {
    let state = ApiState::default();
    let (addr, shutdown_tx, server_task) = spawn_server(router(state.clone())).await;
    let client = client_for(addr);

    let err = client
        .start_benchmark(TEST_JOB_ID)
        .await
        .expect_err("benchmark start fails on the mock");
    assert!(err.is_retryable());
    assert_eq!(state.benchmark_calls.load(Ordering::SeqCst), 1);

    let _ = shutdown_tx.send(());
    server_task.await.expect("mock http server task should join");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn exports_completed_model_and_rejects_running_job() {
    let state = ApiState::default();
    let (addr, shutdown_tx, server_task) = spawn_server(router(state.clone())).await;
    let client = client_for(addr);

    let model = timeout(
        Duration::from_secs(5),
        client.export_model(TEST_JOB_ID, ExportFormat::Safetensors),
    )
    .await
    .expect("export_model in time")
    .expect("completed job should export");
    assert_eq!(&model[..], MODEL_BYTES);

    let err = client
        .export_model(RUNNING_JOB_ID, ExportFormat::Pytorch)
        .await
        .expect_err("running job cannot be exported");
    match &err {
        JobApiError::HttpStatus { status, body } => {
            assert_eq!(*status, StatusCode::BAD_REQUEST);
            assert_eq!(body, &format!("Job {RUNNING_JOB_ID} is not completed yet"));
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert!(!err.is_retryable());
    assert_eq!(
        *state.exports.lock().await,
        vec![
            format!("{TEST_JOB_ID}/safetensors"),
            format!("{RUNNING_JOB_ID}/pytorch"),
        ]
    );

    let _ = shutdown_tx.send(());
    server_task.await.expect("mock http server task should join");
}

fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/compress", post(compress_handler))
        .route("/api/status/{job_id}", get(status_handler))
        .route("/api/results/{job_id}", get(results_handler))
        .route("/api/benchmark/{job_id}", post(benchmark_handler))
        .route("/api/jobs/{job_id}/export/{format}", get(export_handler))
        .with_state(state)
}

async fn compress_handler(
    State(state): State<ApiState>,
    Json(payload): Json<Value>,
) -> impl IntoResponse {
    *state.submitted.lock().await = Some(payload);
    Json(json!({
        "job_id": TEST_JOB_ID,
        "status": "pending",
        "original_params": 0,
        "compressed_params": 0,
        "compression_ratio": 0.0,
        "original_size_mb": 0.0,
        "compressed_size_mb": 0.0,
        "error": null
    }))
}

async fn status_handler(
    State(state): State<ApiState>,
    Path(job_id): Path<String>,
) -> impl IntoResponse {
    if state.status_calls.fetch_add(1, Ordering::SeqCst) == 0 {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"detail": "warming up"})),
        );
    }
    (
        StatusCode::OK,
        Json(json!({
            "job_id": job_id,
            "status": "running",
            "result": null,
            "error": null
        })),
    )
}

async fn results_handler(Path(job_id): Path<String>) -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"detail": format!("Job {job_id} not found")})),
    )
}

async fn benchmark_handler(State(state): State<ApiState>) -> impl IntoResponse {
    state.benchmark_calls.fetch_add(1, Ordering::SeqCst);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"detail": "benchmark service unavailable"})),
    )
}

async fn export_handler(
    State(state): State<ApiState>,
    Path((job_id, format)): Path<(String, String)>,
) -> axum::response::Response {
    state.exports.lock().await.push(format!("{job_id}/{format}"));
    if job_id != TEST_JOB_ID {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"detail": format!("Job {job_id} is not completed yet")})),
        )
            .into_response();
    }
    (
        [(header::CONTENT_TYPE, "application/octet-stream")],
        MODEL_BYTES,
    )
        .into_response()
}

async fn spawn_server(
    app: Router,
) -> (
    SocketAddr,
    oneshot::Sender<()>,
    tokio::task::JoinHandle<()>,
) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock server listener");
    let addr = listener.local_addr().expect("mock server local addr");
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let server_task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .expect("mock server should run");
    });
    (addr, shutdown_tx, server_task)
}
