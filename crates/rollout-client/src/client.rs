//! kube-rs backed Deployment client

use crate::deployment_trait::DeploymentClientTrait;
use crate::error::RolloutError;
use k8s_openapi::api::apps::v1::Deployment;
use kube::api::{Api, PostParams};
use kube::Client;
use tracing::debug;

/// Deployment client scoped to a single namespace
#[derive(Clone)]
pub struct DeploymentClient {
    api: Api<Deployment>,
    namespace: String,
}

impl std::fmt::Debug for DeploymentClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeploymentClient")
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

impl DeploymentClient {
    /// Create a new client for Deployments in `namespace`
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        let namespace = namespace.into();
        Self {
            api: Api::namespaced(client, &namespace),
            namespace,
        }
    }
}

#[async_trait::async_trait]
impl DeploymentClientTrait for DeploymentClient {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn get_deployment(&self, name: &str) -> Result<Deployment, RolloutError> {
        debug!("GET deployment {}/{}", self.namespace, name);
        self.api
            .get(name)
            .await
            .map_err(|e| RolloutError::from_kube(e, name))
    }

    async fn replace_deployment(
        &self,
        deployment: &Deployment,
    ) -> Result<Deployment, RolloutError> {
        let name = deployment.metadata.name.as_deref().ok_or_else(|| {
            RolloutError::InvalidObject("deployment has no metadata.name".to_string())
        })?;
        // Writes are always conditioned on the version that was read
        let version = deployment.metadata.resource_version.as_deref().ok_or_else(|| {
            let reason = format!("deployment {} has no metadata.resourceVersion", name);
            RolloutError::InvalidObject(reason)
        })?;

        debug!("PUT deployment {}/{} at resourceVersion {}", self.namespace, name, version);
        self.api
            .replace(name, &PostParams::default(), deployment)
            .await
            .map_err(|e| RolloutError::from_kube(e, name))
    }
}
