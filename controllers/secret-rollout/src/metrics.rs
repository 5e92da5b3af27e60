//! Restart outcome recording and the Prometheus endpoint.
//!
//! Every completed restart cycle produces one [`RestartOutcome`], handed to
//! an [`OutcomeRecorder`]. The production recorder increments the
//! `deployment_rollouts_total` counter on a registry owned by the process,
//! which an axum server exposes at `/metrics`.

use crate::config::{MutationTarget, WatchTarget};
use crate::error::ControllerError;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use prometheus::{IntCounterVec, Opts, Registry, TextEncoder};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// One completed restart cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartOutcome {
    pub namespace: String,
    pub secret: String,
    pub deployment: String,
    pub succeeded: bool,
}

impl RestartOutcome {
    pub fn new(watch: &WatchTarget, mutation: &MutationTarget, succeeded: bool) -> Self {
        Self {
            namespace: watch.namespace.clone(),
            secret: watch.secret_name.clone(),
            deployment: mutation.deployment_name.clone(),
            succeeded,
        }
    }
}

/// Sink for restart outcomes.
///
/// Called inline on the restart task, so implementations must return
/// promptly and never wait on I/O.
pub trait OutcomeRecorder: Send + Sync {
    fn record(&self, outcome: &RestartOutcome);
}

/// Counter-backed recorder with its own registry.
#[derive(Clone)]
pub struct PrometheusRecorder {
    registry: Registry,
    rollouts: IntCounterVec,
}

impl std::fmt::Debug for PrometheusRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrometheusRecorder").finish_non_exhaustive()
    }
}

impl PrometheusRecorder {
    /// Create the counter and register it.
    pub fn new() -> Result<Self, ControllerError> {
        let rollouts = IntCounterVec::new(
            Opts::new("deployment_rollouts_total", "Total number of deployment rollouts"),
            &["namespace", "secret", "deployment", "restarted"],
        )
        .map_err(|e| ControllerError::Metrics(e.to_string()))?;

        let registry = Registry::new();
        registry
            .register(Box::new(rollouts.clone()))
            .map_err(|e| ControllerError::Metrics(e.to_string()))?;

        Ok(Self { registry, rollouts })
    }

    /// Current counter value for one label set.
    #[cfg(test)]
    pub fn count(&self, namespace: &str, secret: &str, deployment: &str, restarted: bool) -> u64 {
        self.rollouts
            .with_label_values(&[namespace, secret, deployment, bool_label(restarted)])
            .get()
    }

    /// Render the registry in the Prometheus text format.
    pub fn render(&self) -> Result<String, ControllerError> {
        TextEncoder::new()
            .encode_to_string(&self.registry.gather())
            .map_err(|e| ControllerError::Metrics(e.to_string()))
    }
}

impl OutcomeRecorder for PrometheusRecorder {
    fn record(&self, outcome: &RestartOutcome) {
        self.rollouts
            .with_label_values(&[
                outcome.namespace.as_str(),
                outcome.secret.as_str(),
                outcome.deployment.as_str(),
                bool_label(outcome.succeeded),
            ])
            .inc();
    }
}

fn bool_label(value: bool) -> &'static str {
    if value { "true" } else { "false" }
}

async fn metrics_handler(State(recorder): State<Arc<PrometheusRecorder>>) -> Response {
    match recorder.render() {
        Ok(body) => ([(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)], body).into_response(),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

async fn healthz() -> &'static str {
    "ok"
}

/// Routes served by the metrics endpoint.
pub fn router(recorder: Arc<PrometheusRecorder>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz))
        .with_state(recorder)
}

/// Bind `addr` and serve metrics until `shutdown` is cancelled.
///
/// Binding happens before returning, so an unusable address is a startup error.
pub async fn serve(
    addr: SocketAddr,
    recorder: Arc<PrometheusRecorder>,
    shutdown: CancellationToken,
) -> Result<JoinHandle<Result<(), ControllerError>>, ControllerError> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| ControllerError::Metrics(format!("failed to bind {}: {}", addr, e)))?;
    info!(%addr, "Prometheus metrics endpoint started");

    Ok(tokio::spawn(async move {
        axum::serve(listener, router(recorder))
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
            .map_err(|e| ControllerError::Metrics(e.to_string()))
    }))
}
