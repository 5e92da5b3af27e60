//! Main controller implementation.
//!
//! This module contains the `Controller` struct that wires the Secret
//! change feed, the restart scheduler and the metrics endpoint together and
//! owns their lifecycle.

use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::metrics::{self, PrometheusRecorder};
use crate::reconciler::Reconciler;
use crate::scheduler::RestartScheduler;
use crate::watcher::ChangeFeed;
use rollout_client::DeploymentClient;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Buffered change notifications between the feed and the scheduler.
const CHANGE_BUFFER: usize = 16;

/// Main controller for one Secret -> Deployment relationship.
pub struct Controller {
    feed: JoinHandle<Result<(), ControllerError>>,
    scheduler: JoinHandle<()>,
    metrics_server: JoinHandle<Result<(), ControllerError>>,
    shutdown: CancellationToken,
}

impl Controller {
    /// Creates a new controller instance.
    ///
    /// Returns only after the initial Secret sync; every failure here is fatal.
    pub async fn new(config: ControllerConfig) -> Result<Self, ControllerError> {
        info!("Initializing Secret Rollout Controller");
        let shutdown = CancellationToken::new();

        // Create Kubernetes client
        let kube_client = config.credentials.client().await?;

        // Register the outcome counter and expose it
        let recorder = Arc::new(PrometheusRecorder::new()?);
        let metrics_server =
            metrics::serve(config.metrics_addr, recorder.clone(), shutdown.clone()).await?;

        // Create reconciler and scheduler
        let deployments =
            DeploymentClient::new(kube_client.clone(), config.mutation.namespace.clone());
        let reconciler =
            Reconciler::new(deployments, config.mutation.clone(), config.retry.clone());
        let scheduler = RestartScheduler::new(
            Arc::new(reconciler),
            recorder,
            config.watch.clone(),
            config.delay,
        );

        // Start the feed and block until its cache is synced
        let (events_tx, events_rx) = mpsc::channel(CHANGE_BUFFER);
        let feed = match ChangeFeed::new(kube_client, config.watch.clone())
            .start(events_tx, shutdown.clone(), config.sync_timeout)
            .await
        {
            Ok(feed) => feed,
            Err(e) => {
                shutdown.cancel();
                return Err(e);
            }
        };

        let scheduler = tokio::spawn(scheduler.run(events_rx, shutdown.clone()));

        info!("Watching secret {}", config.watch);
        Ok(Self {
            feed,
            scheduler,
            metrics_server,
            shutdown,
        })
    }

    /// Runs the controller until shutdown.
    pub async fn run(mut self) -> Result<(), ControllerError> {
        info!("Secret Rollout Controller running");

        let result = tokio::select! {
            () = shutdown_signal() => {
                info!("Shutdown signal received");
                Ok(())
            }
            result = &mut self.feed => {
                result
                    .map_err(|e| ControllerError::Watch(format!("Secret watcher panicked: {}", e)))
                    .and_then(|inner| inner)
            }
        };

        self.shutdown.cancel();

        // Lets a restart already in its write loop finish
        if let Err(e) = self.scheduler.await {
            error!("Restart scheduler panicked: {}", e);
        }
        match self.metrics_server.await {
            Ok(Err(e)) => error!("Metrics server error: {}", e),
            Err(e) => error!("Metrics server panicked: {}", e),
            Ok(Ok(())) => {}
        }

        info!("Secret Rollout Controller stopped");
        result
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
