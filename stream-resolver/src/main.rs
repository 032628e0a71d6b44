use stream_resolver::api::{ApiServer, AppState};
use stream_resolver::config::ResolverConfig;
use stream_resolver::logging::init_logging;
use stream_resolver::services::ServiceContainer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = ResolverConfig::from_env_or_default();

    // Keep the guard alive so buffered file logs are flushed on exit.
    let (logging_config, _log_guard) = init_logging(&config.log_dir)?;

    let container = ServiceContainer::new(config.clone())?;
    container.initialize();
    logging_config.start_retention_cleanup(container.cancellation_token());

    let state = AppState::from_container(&container).with_logging_config(logging_config);
    let server = ApiServer::with_state(config.server.clone(), state);

    let server_token = server.cancel_token();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for shutdown signal");
            return;
        }
        tracing::info!("Shutdown signal received");
        server_token.cancel();
    });

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        providers = container.providers.len(),
        "stream-resolver started"
    );

    let served = server.run().await;
    container.shutdown().await?;
    served?;

    tracing::info!("stream-resolver stopped");
    Ok(())
}
