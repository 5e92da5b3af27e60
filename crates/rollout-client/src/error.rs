//! Deployment client errors

use thiserror::Error;

/// Errors that can occur when reading or writing a Deployment
#[derive(Debug, Error)]
pub enum RolloutError {
    /// The write was rejected because the object changed since it was read
    #[error("Version conflict: {0}")]
    Conflict(String),

    /// Deployment does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Object cannot be written as given (e.g., no name or resource version)
    #[error("Invalid object: {0}")]
    InvalidObject(String),

    /// Any other Kubernetes API or transport error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),
}

impl RolloutError {
    /// Classify a raw kube error returned for the Deployment `name`.
    pub fn from_kube(err: kube::Error, name: &str) -> Self {
        match err {
            kube::Error::Api(ref ae) if ae.code == 409 => {
                Self::Conflict(format!("{}: {}", name, ae.message))
            }
            kube::Error::Api(ref ae) if ae.code == 404 => {
                Self::NotFound(format!("{}: {}", name, ae.message))
            }
            other => Self::Kube(other),
        }
    }

    /// Whether this error is an optimistic-concurrency conflict worth retrying.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_is_retryable() {
        assert!(RolloutError::Conflict("app".to_string()).is_conflict());
    }

    #[test]
    fn test_other_errors_are_not_conflicts() {
        assert!(!RolloutError::NotFound("app".to_string()).is_conflict());
        assert!(!RolloutError::InvalidObject("app".to_string()).is_conflict());
    }
}
