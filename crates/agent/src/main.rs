//! Glidein controller
//!
//! Runs the advertisement registry, the job queue, the metrics aggregator
//! and a fleet of local glideins scaled to queue demand, and serves them
//! over HTTP.

use anyhow::Result;
use glidein_agent::{api, GlideinConfig, Service};
use glidein_lib::observability::StructuredLogger;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    let config = GlideinConfig::load()?;
    info!(site = %config.site, partition = %config.partition, "Glidein controller configured");

    let logger = StructuredLogger::new(&config.site);
    logger.log_startup(VERSION, &config.partition);

    let api_port = config.api_port;
    let grace = Duration::from_secs(config.controller.shutdown_grace_secs + 5);
    let mut service = Service::build(config).await?;
    let (shutdown_tx, _) = broadcast::channel(4);

    let handles = service.start(&shutdown_tx);
    let api_handle = tokio::spawn(api::serve(
        api_port,
        service.app_state(),
        shutdown_tx.subscribe(),
    ));
    service.health.set_ready(true).await;

    tokio::signal::ctrl_c().await?;
    logger.log_shutdown("SIGINT received");
    service.health.set_ready(false).await;
    let _ = shutdown_tx.send(());

    let drained = tokio::time::timeout(grace, async {
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Background task failed");
            }
        }
    })
    .await;
    if drained.is_err() {
        warn!("Timed out waiting for the fleet to drain");
    }

    match api_handle.await {
        Ok(Err(e)) => warn!(error = %e, "API server exited with error"),
        Err(e) => warn!(error = %e, "API server task failed"),
        Ok(Ok(())) => {}
    }
    info!("Shutdown complete");
    Ok(())
}
