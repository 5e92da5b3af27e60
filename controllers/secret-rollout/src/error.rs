//! Controller-specific error types.
//!
//! Every variant here is a startup-phase or process-level failure. Failures
//! inside a single restart cycle are reported as a failed outcome instead
//! and never surface as a `ControllerError`.

use thiserror::Error;
use kube::Error as KubeError;

/// Errors that can occur in the Secret Rollout Controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Cluster credentials could not be resolved
    #[error("Credential resolution failed: {0}")]
    Credentials(String),

    /// Initial cache synchronization did not complete
    #[error("Initial sync failed: {0}")]
    InitialSync(String),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),

    /// Metrics registry or endpoint failure
    #[error("Metrics error: {0}")]
    Metrics(String),
}
