//! Bounded optimistic-concurrency retry.
//!
//! [`retry_on_conflict`] runs an operation until it succeeds, fails with a
//! non-retryable error, or uses up the attempt budget. Only errors the
//! operation itself classifies as [`Attempt::Retry`] are retried; the cap and
//! backoff live in [`RetryPolicy`] so tests can pin them down.

use crate::backoff::FibonacciBackoff;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Attempt limit and backoff for conflict retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first (at least 1)
    pub max_attempts: u32,
    /// Backoff before the second attempt
    pub initial_backoff: Duration,
    /// Ceiling for the backoff between attempts
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Default backoff with a custom attempt limit
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Default::default()
        }
    }
}

/// Classification of a failed attempt.
#[derive(Debug)]
pub enum Attempt<E> {
    /// Transient failure; the operation may be run again
    Retry(E),
    /// Failure that must not be retried
    Abort(E),
}

/// Why [`retry_on_conflict`] gave up.
#[derive(Debug)]
pub enum RetryError<E> {
    /// Every attempt hit a retryable failure
    Exhausted { attempts: u32, last: E },
    /// An attempt failed with a non-retryable error
    Aborted { attempt: u32, error: E },
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryError::Exhausted { attempts, last } => {
                write!(f, "gave up after {} attempts: {}", attempts, last)
            }
            RetryError::Aborted { attempt, error } => {
                write!(f, "attempt {} failed: {}", attempt, error)
            }
        }
    }
}

/// Run `operation` under `policy`, returning its value and the attempt that produced it.
///
/// The operation receives the 1-based attempt number.
pub async fn retry_on_conflict<F, Fut, T, E>(
    policy: &RetryPolicy,
    operation_name: &str,
    mut operation: F,
) -> Result<(T, u32), RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, Attempt<E>>>,
    E: fmt::Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut backoff = FibonacciBackoff::new(policy.initial_backoff, policy.max_backoff);
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        match operation(attempt).await {
            Ok(value) => return Ok((value, attempt)),
            Err(Attempt::Abort(error)) => return Err(RetryError::Aborted { attempt, error }),
            Err(Attempt::Retry(error)) => {
                if attempt >= max_attempts {
                    return Err(RetryError::Exhausted { attempts: attempt, last: error });
                }

                let delay = backoff.next_backoff();
                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %error,
                    delay_ms = delay.as_millis(),
                    "Conflict, retrying"
                );
                tokio::time::sleep(delay).await;
                debug!(operation = %operation_name, attempt = attempt + 1, "Retrying");
            }
        }
    }
}
