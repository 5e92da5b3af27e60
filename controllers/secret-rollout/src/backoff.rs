//! # Fibonacci Backoff
//!
//! Provides a Fibonacci-based backoff between optimistic-concurrency retries.
//! It grows more slowly than doubling.
//!
//! Sequence with the defaults: 10ms, 10ms, 20ms, 30ms, 50ms, 80ms, 130ms, ...
//! capped at 1s.

use std::time::Duration;

/// Fibonacci backoff calculator
///
/// Each backoff is the sum of the previous two, capped at `max`.
#[derive(Debug, Clone)]
pub struct FibonacciBackoff {
    /// Previous backoff value in milliseconds
    prev_millis: u64,
    /// Current backoff value in milliseconds
    current_millis: u64,
    /// Maximum backoff value in milliseconds
    max_millis: u64,
}

impl FibonacciBackoff {
    /// Create a new Fibonacci backoff between `min` and `max`
    #[must_use]
    pub fn new(min: Duration, max: Duration) -> Self {
        let min_millis = u64::try_from(min.as_millis()).unwrap_or(u64::MAX);
        let max_millis = u64::try_from(max.as_millis()).unwrap_or(u64::MAX).max(min_millis);
        Self {
            prev_millis: 0,
            current_millis: min_millis,
            max_millis,
        }
    }

    /// Get the next backoff duration and advance the sequence
    pub fn next_backoff(&mut self) -> Duration {
        let result = Duration::from_millis(self.current_millis);

        let next_millis = self.prev_millis.saturating_add(self.current_millis);
        self.prev_millis = self.current_millis;
        self.current_millis = std::cmp::min(next_millis, self.max_millis);

        result
    }
}
