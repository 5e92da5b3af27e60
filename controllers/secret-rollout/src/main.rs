//! Secret Rollout Controller
//!
//! Watches one Secret and, whenever it is updated, restarts one Deployment
//! after a configurable delay by bumping the `restartedAt` annotation on its
//! pod template.
//!
//! The control loop is watch -> debounce -> conflict-safe write -> record:
//! - `watcher`: Secret change feed with an initial cache sync
//! - `scheduler`: delay and coalescing of changes into restart cycles
//! - `reconciler`: read-modify-write of the Deployment with bounded retry
//! - `metrics`: `deployment_rollouts_total` counter and `/metrics` endpoint

mod backoff;
mod config;
mod controller;
mod error;
mod metrics;
mod reconciler;
mod retry;
mod scheduler;
#[cfg(test)]
mod test_utils;
mod watcher;

use clap::Parser;
use config::{Args, ControllerConfig};
use controller::Controller;
use crate::error::ControllerError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    // Exits with usage before anything touches the cluster
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if rustls::crypto::ring::default_provider().install_default().is_err() {
        warn!("A rustls crypto provider was already installed");
    }

    info!("Starting Secret Rollout Controller");
    let config = ControllerConfig::from(args);

    info!("Configuration:");
    info!("  Secret: {}", config.watch);
    info!("  Deployment: {}", config.mutation);
    info!("  Credentials: {:?}", config.credentials);
    info!("  Delay: {:?}", config.delay);
    info!("  Max conflict retries: {}", config.retry.max_attempts);
    info!("  Metrics: {}", config.metrics_addr);

    // Initialize and run controller
    let controller = Controller::new(config).await?;
    controller.run().await?;

    Ok(())
}
