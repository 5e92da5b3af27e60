//! DeploymentClient trait for mocking
//!
//! This trait abstracts the Deployment API to enable mocking in unit tests.
//! The concrete `DeploymentClient` implements this trait, and tests can use
//! the in-memory mock behind the `test-util` feature.

use crate::error::RolloutError;
use k8s_openapi::api::apps::v1::Deployment;

/// Trait for Deployment read/replace operations
///
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait::async_trait]
pub trait DeploymentClientTrait: Send + Sync {
    /// Namespace every call is scoped to
    fn namespace(&self) -> &str;

    /// Fetch the latest stored version of a Deployment.
    async fn get_deployment(&self, name: &str) -> Result<Deployment, RolloutError>;

    /// Replace a Deployment, conditioned on `metadata.resourceVersion`.
    ///
    /// Fails with [`RolloutError::Conflict`] when the stored object has moved
    /// on since the version carried by `deployment` was read.
    async fn replace_deployment(&self, deployment: &Deployment) -> Result<Deployment, RolloutError>;
}
