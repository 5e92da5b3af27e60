//! Mock DeploymentClient for unit testing
//!
//! This module provides an in-memory implementation of `DeploymentClientTrait`
//! that enforces optimistic concurrency the way the API server does: every
//! successful replace bumps `metadata.resourceVersion`, and a replace carrying
//! a stale version is rejected with [`RolloutError::Conflict`].
//!
//! Tests can script concurrent writers and failures ahead of time.

use crate::deployment_trait::DeploymentClientTrait;
use crate::error::RolloutError;
use k8s_openapi::api::apps::v1::Deployment;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

/// Mock DeploymentClient for testing
#[derive(Clone)]
pub struct MockDeploymentClient {
    namespace: String,
    // In-memory storage keyed by name
    deployments: Arc<Mutex<HashMap<String, Deployment>>>,
    // Counter for generating resource versions
    next_version: Arc<Mutex<u64>>,
    // Concurrent writes to simulate just before upcoming replace calls
    concurrent_writes: Arc<Mutex<u32>>,
    get_failures: Arc<Mutex<VecDeque<RolloutError>>>,
    replace_failures: Arc<Mutex<VecDeque<RolloutError>>>,
    get_calls: Arc<Mutex<usize>>,
    replace_calls: Arc<Mutex<usize>>,
    // Objects as accepted by successful replace calls, in order
    writes: Arc<Mutex<Vec<Deployment>>>,
}

impl std::fmt::Debug for MockDeploymentClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockDeploymentClient")
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

impl MockDeploymentClient {
    /// Create a new, empty mock client
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            deployments: Arc::new(Mutex::new(HashMap::new())),
            next_version: Arc::new(Mutex::new(1)),
            concurrent_writes: Arc::new(Mutex::new(0)),
            get_failures: Arc::new(Mutex::new(VecDeque::new())),
            replace_failures: Arc::new(Mutex::new(VecDeque::new())),
            get_calls: Arc::new(Mutex::new(0)),
            replace_calls: Arc::new(Mutex::new(0)),
            writes: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn bump_version(&self) -> String {
        let mut next = self.next_version.lock().unwrap();
        let version = next.to_string();
        *next += 1;
        version
    }

    /// Add a deployment to the mock store (for test setup)
    ///
    /// The stored copy gets a fresh resource version.
    pub fn add_deployment(&self, mut deployment: Deployment) {
        let name = deployment.metadata.name.clone().unwrap_or_default();
        deployment.metadata.namespace = Some(self.namespace.clone());
        deployment.metadata.resource_version = Some(self.bump_version());
        self.deployments.lock().unwrap().insert(name, deployment);
    }

    /// Current stored copy of a deployment
    pub fn deployment(&self, name: &str) -> Option<Deployment> {
        self.deployments.lock().unwrap().get(name).cloned()
    }

    /// Make the next `count` replace calls lose a race against another writer
    ///
    /// Each simulated writer bumps the stored resource version just before
    /// the replace is evaluated, so the replace carries a stale version.
    pub fn simulate_concurrent_writes(&self, count: u32) {
        *self.concurrent_writes.lock().unwrap() = count;
    }

    /// Fail the next get call with `error`
    pub fn fail_next_get(&self, error: RolloutError) {
        self.get_failures.lock().unwrap().push_back(error);
    }

    /// Fail the next replace call with `error`
    pub fn fail_next_replace(&self, error: RolloutError) {
        self.replace_failures.lock().unwrap().push_back(error);
    }

    /// Number of get calls observed
    pub fn get_calls(&self) -> usize {
        *self.get_calls.lock().unwrap()
    }

    /// Number of replace calls observed (accepted or rejected)
    pub fn replace_calls(&self) -> usize {
        *self.replace_calls.lock().unwrap()
    }

    /// Objects accepted by successful replace calls, in order
    pub fn writes(&self) -> Vec<Deployment> {
        self.writes.lock().unwrap().clone()
    }

    fn take_concurrent_write(&self) -> bool {
        let mut remaining = self.concurrent_writes.lock().unwrap();
        if *remaining == 0 {
            return false;
        }
        *remaining -= 1;
        true
    }
}

fn not_found(name: &str) -> RolloutError {
    RolloutError::NotFound(format!("{}: deployments.apps \"{}\" not found", name, name))
}

#[async_trait::async_trait]
impl DeploymentClientTrait for MockDeploymentClient {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn get_deployment(&self, name: &str) -> Result<Deployment, RolloutError> {
        *self.get_calls.lock().unwrap() += 1;
        if let Some(err) = self.get_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        self.deployments
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| not_found(name))
    }

    async fn replace_deployment(
        &self,
        deployment: &Deployment,
    ) -> Result<Deployment, RolloutError> {
        *self.replace_calls.lock().unwrap() += 1;
        if let Some(err) = self.replace_failures.lock().unwrap().pop_front() {
            return Err(err);
        }

        let name = deployment
            .metadata
            .name
            .clone()
            .ok_or_else(|| {
                RolloutError::InvalidObject("deployment has no metadata.name".to_string())
            })?;

        if self.take_concurrent_write() {
            let version = self.bump_version();
            if let Some(stored) = self.deployments.lock().unwrap().get_mut(&name) {
                stored.metadata.resource_version = Some(version);
            }
        }

        let version = self.bump_version();
        let mut store = self.deployments.lock().unwrap();
        let stored = store
            .get_mut(&name)
            .ok_or_else(|| not_found(&name))?;

        if stored.metadata.resource_version != deployment.metadata.resource_version {
            return Err(RolloutError::Conflict(format!(
                "{}: the object has been modified; please apply your changes to the latest version and try again",
                name
            )));
        }

        let mut accepted = deployment.clone();
        accepted.metadata.resource_version = Some(version);
        *stored = accepted.clone();
        self.writes.lock().unwrap().push(accepted.clone());
        Ok(accepted)
    }
}
