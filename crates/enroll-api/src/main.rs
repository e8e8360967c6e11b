use enroll_api::{setup, telemetry};
use enroll_core::Config;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let config = Config::from_env()?;
    telemetry::init_telemetry(&config.log_format)?;

    let app = setup::initialize_app(&config).await?;

    let processor_handle = app.processor.start(Some(app.pool.clone()));
    let relay_handle = app.relay.as_ref().map(|relay| relay.start());

    let served = setup::server::start_server(&config, app.router).await;

    app.processor.shutdown();
    if let Some(relay) = &app.relay {
        relay.shutdown();
    }
    if let Err(e) = processor_handle.await {
        tracing::error!(error = %e, "Task processor terminated abnormally");
    }
    if let Some(handle) = relay_handle {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "Outbox relay terminated abnormally");
        }
    }

    app.pool.close().await;
    tracing::info!("Shutdown complete");
    served
}
