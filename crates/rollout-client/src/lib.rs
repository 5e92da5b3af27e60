//! Deployment Rollout Client
//!
//! A thin client for reading and conditionally replacing `apps/v1`
//! Deployments, with errors classified for optimistic-concurrency retry.
//!
//! # Example
//!
//! ```no_run
//! use rollout_client::{DeploymentClient, DeploymentClientTrait};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let kube_client = kube::Client::try_default().await?;
//! let client = DeploymentClient::new(kube_client, "prod");
//!
//! // Read the latest version, then write it back conditioned on that version
//! let deployment = client.get_deployment("app").await?;
//! match client.replace_deployment(&deployment).await {
//!     Ok(_) => {}
//!     Err(e) if e.is_conflict() => { /* re-read and try again */ }
//!     Err(e) => return Err(e.into()),
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! - **Conflict classification**: HTTP 409 responses surface as
//!   [`RolloutError::Conflict`], 404 as [`RolloutError::NotFound`]
//! - **Mocking**: [`DeploymentClientTrait`] abstracts the API; the
//!   `test-util` feature ships an in-memory `MockDeploymentClient`

pub mod client;
pub mod error;
#[path = "trait.rs"]
pub mod deployment_trait;
#[cfg(feature = "test-util")]
pub mod mock;

pub use client::DeploymentClient;
pub use deployment_trait::DeploymentClientTrait;
pub use error::RolloutError;
#[cfg(feature = "test-util")]
pub use mock::MockDeploymentClient;
