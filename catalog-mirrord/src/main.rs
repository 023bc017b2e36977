use std::sync::Arc;
use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use catalog_mirrord::config::{Config, LogFormat, LoggingConfig};
use catalog_mirrord::handler::Handlers;
use catalog_mirrord::scheduler::SchedulerOptions;
use catalog_mirrord::watch::consul::ConsulSource;

fn init_tracing(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.filter));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match config.format {
        LogFormat::Full => builder.init(),
        LogFormat::Compact => builder.compact().init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load config
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/etc/catalog-mirrord/config.toml".to_string());

    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;

    init_tracing(&config.logging);
    tracing::info!("Starting catalog-mirrord");
    tracing::info!("Loaded config from {}", config_path);

    let source = ConsulSource::new(&config.consul)?;
    tracing::info!("Mirroring catalog from {}", config.consul.address);

    let handlers = Handlers::from_config(&config)?;
    if handlers.is_empty() {
        tracing::warn!("No update handlers configured, changes will only be logged");
    }

    // Create cancellation token for graceful shutdown
    let cancel = CancellationToken::new();

    let mirror = catalog_mirrord::start(
        Arc::new(source),
        handlers,
        SchedulerOptions::from(&config.update),
        cancel.clone(),
    );

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutdown signal received");

    cancel.cancel();
    mirror.join().await;

    tracing::info!("Shutdown complete");
    Ok(())
}
