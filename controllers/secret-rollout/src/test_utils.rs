//! Test utilities for unit testing the restart loop
//!
//! This module provides helpers for creating test objects and an in-memory
//! outcome recorder.

use crate::metrics::{OutcomeRecorder, RestartOutcome};
use crate::reconciler::RESTARTED_AT_ANNOTATION;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{PodTemplateSpec, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;
use std::sync::Mutex;

/// Helper to create a test Deployment, optionally already restarted once
pub fn create_test_deployment(name: &str, restarted_at: Option<&str>) -> Deployment {
    let annotations = restarted_at.map(|stamp| {
        BTreeMap::from([(RESTARTED_AT_ANNOTATION.to_string(), stamp.to_string())])
    });
    Deployment {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    annotations,
                    ..Default::default()
                }),
                spec: None,
            },
            ..Default::default()
        }),
        status: None,
    }
}

/// Restart annotation value on a Deployment's pod template, if any
pub fn restarted_at(deployment: &Deployment) -> Option<String> {
    deployment
        .spec
        .as_ref()?
        .template
        .metadata
        .as_ref()?
        .annotations
        .as_ref()?
        .get(RESTARTED_AT_ANNOTATION)
        .cloned()
}

/// Helper to create a test Secret at a given resource version
pub fn create_test_secret(name: &str, namespace: &str, resource_version: &str) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            resource_version: Some(resource_version.to_string()),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Outcome recorder that keeps everything in memory
#[derive(Debug, Default)]
pub struct MemoryRecorder {
    outcomes: Mutex<Vec<RestartOutcome>>,
}

impl MemoryRecorder {
    pub fn outcomes(&self) -> Vec<RestartOutcome> {
        self.outcomes.lock().unwrap().clone()
    }
}

impl OutcomeRecorder for MemoryRecorder {
    fn record(&self, outcome: &RestartOutcome) {
        self.outcomes.lock().unwrap().push(outcome.clone());
    }
}
