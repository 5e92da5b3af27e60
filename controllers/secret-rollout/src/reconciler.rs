//! Conflict-safe restart of the target Deployment.
//!
//! A restart is a read-modify-write of the Deployment: fetch the latest
//! version, stamp the pod template with the `restartedAt` annotation and
//! replace it conditioned on the version that was read. The Deployment
//! controller sees a template change and rolls the pods.
//!
//! Only version conflicts on the write are retried, under the configured
//! [`RetryPolicy`]. A failed fetch or any other write error ends the cycle.

use crate::config::MutationTarget;
use crate::retry::{retry_on_conflict, Attempt, RetryError, RetryPolicy};
use chrono::{DateTime, SecondsFormat, Utc};
use k8s_openapi::api::apps::v1::Deployment;
use rollout_client::{DeploymentClientTrait, RolloutError};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, error, info};

/// Pod template annotation `kubectl rollout restart` uses.
pub const RESTARTED_AT_ANNOTATION: &str = "kubectl.kubernetes.io/restartedAt";

/// Failure of a single read-modify-write attempt.
#[derive(Debug, Error)]
pub enum RestartError {
    #[error("failed to get latest version of deployment: {0}")]
    Fetch(RolloutError),

    #[error("failed to update deployment: {0}")]
    Write(RolloutError),
}

/// Terminal result of one restart cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestartResult {
    /// The annotated template was written on the given attempt
    Succeeded { attempts: u32 },
    /// No write was accepted
    Failed { reason: String },
}

impl RestartResult {
    pub fn succeeded(&self) -> bool {
        matches!(self, RestartResult::Succeeded { .. })
    }
}

/// Stamp the pod template with `now`, overwriting any previous stamp.
pub fn apply_restart_annotation(deployment: &mut Deployment, now: DateTime<Utc>) {
    let template_meta = deployment
        .spec
        .get_or_insert_with(Default::default)
        .template
        .metadata
        .get_or_insert_with(Default::default);

    template_meta
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(
            RESTARTED_AT_ANNOTATION.to_string(),
            now.to_rfc3339_opts(SecondsFormat::Secs, true),
        );
}

/// Restarts one Deployment through a [`DeploymentClientTrait`].
pub struct Reconciler<C> {
    client: C,
    target: MutationTarget,
    policy: RetryPolicy,
}

impl<C> std::fmt::Debug for Reconciler<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("target", &self.target)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl<C: DeploymentClientTrait> Reconciler<C> {
    /// Creates a new reconciler instance.
    pub fn new(client: C, target: MutationTarget, policy: RetryPolicy) -> Self {
        Self { client, target, policy }
    }

    pub fn target(&self) -> &MutationTarget {
        &self.target
    }

    /// Run one restart cycle to completion.
    pub async fn restart_deployment(&self) -> RestartResult {
        let name = self.target.deployment_name.as_str();

        let attempt_restart = move |attempt: u32| async move {
            // Never reuse a copy from a previous attempt
            let mut deployment = match self.client.get_deployment(name).await {
                Ok(deployment) => deployment,
                Err(e) => return Err(Attempt::Abort(RestartError::Fetch(e))),
            };

            apply_restart_annotation(&mut deployment, Utc::now());
            debug!(
                deployment = %self.target,
                attempt = attempt,
                resource_version = deployment
                    .metadata
                    .resource_version
                    .as_deref()
                    .unwrap_or("<none>"),
                "Writing restart annotation"
            );

            match self.client.replace_deployment(&deployment).await {
                Ok(_) => Ok(()),
                Err(e) if e.is_conflict() => Err(Attempt::Retry(RestartError::Write(e))),
                Err(e) => Err(Attempt::Abort(RestartError::Write(e))),
            }
        };
        let result = retry_on_conflict(&self.policy, "restart_deployment", attempt_restart).await;

        match result {
            Ok(((), attempts)) => {
                info!(
                    deployment = %self.target,
                    attempts = attempts,
                    "Deployment restarted successfully"
                );
                RestartResult::Succeeded { attempts }
            }
            Err(e) => {
                let reason = match &e {
                    RetryError::Exhausted { .. } => format!("version conflicts persisted: {}", e),
                    RetryError::Aborted { .. } => e.to_string(),
                };
                error!(deployment = %self.target, error = %reason, "Failed to restart deployment");
                RestartResult::Failed { reason }
            }
        }
    }
}
