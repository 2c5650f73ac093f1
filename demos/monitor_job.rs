use std::error::Error;

use qcompress_sdk::job_api::{CompressionRequest, ExportFormat, JobApiClient, JobApiClientOptions};
use qcompress_sdk::stream::client::RealtimeJobClient;
use qcompress_sdk::stream::handlers::EventHandlers;
use qcompress_sdk::stream::monitor::{JobMonitor, DEFAULT_METRICS_HISTORY};
use qcompress_sdk::stream::proto::JobStatus;
use serde_json::json;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let model_name = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "distilgpt2".to_string());

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let api = JobApiClient::with_options(JobApiClientOptions::from_env())?;
        let request = CompressionRequest::new(model_name)
            .with_layer("transformer.h.0.mlp.c_fc", json!({"rank": 8}));
        let started = api.start_compression(&request).await?;
        println!("job_id={} status={}", started.job_id, started.status);

        let handlers = EventHandlers::new().on_message(|event| println!("{} event", event.kind()));
        let (monitor, handlers) =
            JobMonitor::with_handlers(&started.job_id, DEFAULT_METRICS_HISTORY, handlers);
        let client =
            RealtimeJobClient::connect_with_handlers(&api.stream_config(), &started.job_id, handlers);

        let status = tokio::select! {
            status = monitor.wait_for_terminal() => status,
            _ = client.closed() => monitor.snapshot().status,
        };
        let snapshot = monitor.snapshot();
        println!(
            "final status={:?} metrics_samples={} last_error={:?}",
            status.as_ref().map(ToString::to_string),
            snapshot.metrics.len(),
            snapshot.last_error
        );
        client.disconnect();

        if let Ok(result) = api.job_results(&started.job_id).await {
            println!(
                "compression_ratio={:.2} params {} -> {}",
                result.compression_ratio, result.original_params, result.compressed_params
            );
        }

        if status == Some(JobStatus::Completed) {
            let format = ExportFormat::Safetensors;
            let model = api.export_model(&started.job_id, format).await?;
            let path = format!("{}_model.{}", started.job_id, format.file_extension());
            tokio::fs::write(&path, &model).await?;
            println!("exported {} bytes to {path}", model.len());
        }

        Ok::<(), Box<dyn Error>>(())
    })
}
