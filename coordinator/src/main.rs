//! BankLock Coordinator Binary
//!
//! Serves the worker lock protocol and the admin HTTP surface.

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use banklock_coordinator::{server, Coordinator, CoordinatorConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = CoordinatorConfig::from_env();

    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone()),
        ))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting BankLock Coordinator");

    if let Err(e) = config.validate() {
        error!(error = %e, "Invalid configuration");
        return Err(anyhow::anyhow!("Configuration error: {}", e));
    }
    info!(
        secret_fingerprint = %banklock_crypto::fingerprint(config.auth_config.secret.as_bytes()),
        "Worker token secret loaded"
    );
    if !config.secret_from_env {
        warn!("COORDINATOR_SECRET not set, generated an ephemeral secret; tokens will not survive a restart");
    }

    let addr = format!("{}:{}", config.listen_addr, config.listen_port);
    let coordinator = Arc::new(Coordinator::new(config)?);
    coordinator.start().await?;

    let listener = TcpListener::bind(&addr).await?;
    info!(listen_addr = %addr, "Coordinator running");

    server::serve(coordinator, listener).await?;

    info!("Coordinator shutdown complete");
    Ok(())
}
