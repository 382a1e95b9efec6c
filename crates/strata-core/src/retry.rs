//! Retry policies for the aggregate command cycle.

use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio::time::Instant;

/// The policy has no attempts left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("retry limit of {limit} attempts reached")]
pub struct RetryExhausted {
    /// Number of retries the policy allowed.
    pub limit: u32,
}

/// Decides when the next attempt may run.
///
/// A policy is an immutable value: `next` returns the wake-up time together
/// with the policy to consult on the following conflict.
pub trait RetryPolicy: Clone + Send + Sync {
    /// Advances the policy by one attempt.
    ///
    /// # Errors
    ///
    /// Returns [`RetryExhausted`] when no further attempt is allowed.
    fn next(&self) -> Result<(Instant, Self), RetryExhausted>;

    /// Number of retries granted so far.
    fn attempt(&self) -> u32;
}

/// Fixed delay with random jitter, bounded by an attempt limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DefaultRetry {
    attempt: u32,
    limit: u32,
    delay: Duration,
    jitter: Duration,
}

impl DefaultRetry {
    /// Creates a policy allowing `limit` retries, each `delay` plus up to
    /// `jitter` after the conflict.
    #[must_use]
    pub fn new(limit: u32, delay: Duration, jitter: Duration) -> Self {
        Self {
            attempt: 0,
            limit,
            delay,
            jitter,
        }
    }

    /// Maximum number of retries.
    #[must_use]
    pub fn limit(&self) -> u32 {
        self.limit
    }
}

impl Default for DefaultRetry {
    fn default() -> Self {
        Self::new(8, Duration::from_millis(10), Duration::from_millis(5))
    }
}

impl RetryPolicy for DefaultRetry {
    fn next(&self) -> Result<(Instant, Self), RetryExhausted> {
        if self.attempt >= self.limit {
            return Err(RetryExhausted { limit: self.limit });
        }
        let jitter = if self.jitter.is_zero() {
            Duration::ZERO
        } else {
            self.jitter.mul_f64(rand::rng().random_range(0.0..1.0))
        };
        let wake = Instant::now() + self.delay + jitter;
        Ok((
            wake,
            Self {
                attempt: self.attempt + 1,
                ..*self
            },
        ))
    }

    fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_advances_until_limit() {
        // Arrange
        let policy = DefaultRetry::new(2, Duration::ZERO, Duration::ZERO);

        // Act
        let (_, second) = policy.next().unwrap();
        let (_, third) = second.next().unwrap();
        let exhausted = third.next();

        // Assert
        assert_eq!(policy.attempt(), 0);
        assert_eq!(second.attempt(), 1);
        assert_eq!(third.attempt(), 2);
        assert_eq!(exhausted, Err(RetryExhausted { limit: 2 }));
    }

    #[test]
    fn test_zero_limit_never_retries() {
        let policy = DefaultRetry::new(0, Duration::from_millis(1), Duration::ZERO);
        assert!(policy.next().is_err());
    }

    #[test]
    fn test_wake_time_respects_delay_and_jitter_bounds() {
        // Arrange
        let delay = Duration::from_millis(20);
        let jitter = Duration::from_millis(10);
        let policy = DefaultRetry::new(1, delay, jitter);
        let before = Instant::now();

        // Act
        let (wake, _) = policy.next().unwrap();

        // Assert
        assert!(wake >= before + delay);
        assert!(wake <= Instant::now() + delay + jitter);
    }
}
