use std::error::Error;

use qcompress_sdk::stream::client::{RealtimeJobClient, StreamConfig};
use qcompress_sdk::stream::handlers::EventHandlers;
use qcompress_sdk::stream::proto::InboundEvent;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let job_id = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "REPLACE_WITH_JOB_ID".to_string());

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let handlers = EventHandlers::new()
            .on_open(|| println!("connected"))
            .on_message(|event| match event {
                InboundEvent::Status { status, .. } => println!("status={status}"),
                InboundEvent::Metrics { data, .. } => println!("metrics={data}"),
                InboundEvent::Error { error, .. } => println!("job error: {error}"),
                other => println!("{} event", other.kind()),
            })
            .on_error(|err| eprintln!("stream error: {err}"))
            .on_close(|info| println!("closed: {info}"));

        let client = RealtimeJobClient::connect_with_handlers(
            &StreamConfig::from_env(),
            job_id,
            handlers,
        );

        tokio::select! {
            _ = client.closed() => {}
            _ = tokio::signal::ctrl_c() => client.disconnect(),
        }

        Ok::<(), Box<dyn Error>>(())
    })
}
