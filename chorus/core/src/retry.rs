//! Retry Policy
//!
//! Exponential backoff configuration for the upstream call. Only
//! connection-level failures are retried; the classification itself lives
//! on [`crate::error::ChorusError::is_retryable`]. The backoff base doubles
//! per attempt (configurable) and is capped, so delays are non-decreasing
//! across attempts; jitter adds up to 25% on top to avoid thundering herds.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Retry configuration for failed upstream requests
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt
    pub max_retries: u32,

    /// Initial backoff delay
    pub initial_backoff_ms: u64,

    /// Maximum backoff delay
    pub max_backoff_ms: u64,

    /// Backoff multiplier
    pub backoff_multiplier: f32,

    /// Add jitter to backoff
    pub use_jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 15_000,
            backoff_multiplier: 2.0,
            use_jitter: true,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Total number of attempts (the first call plus retries)
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    /// Calculate backoff duration before retry N (0-indexed)
    #[must_use]
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_backoff_ms as f64
            * f64::from(self.backoff_multiplier).powi(attempt.min(16) as i32);
        let capped = base.min(self.max_backoff_ms as f64);

        let duration_ms = if self.use_jitter {
            // Up to 25% jitter on top of the deterministic delay
            let jitter = rand::random::<f64>() * 0.25;
            (capped * (1.0 + jitter)) as u64
        } else {
            capped as u64
        };

        Duration::from_millis(duration_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.max_attempts(), 4);
    }

    #[test]
    fn test_backoff_is_non_decreasing() {
        let policy = RetryPolicy {
            use_jitter: false,
            ..Default::default()
        };

        let mut previous = Duration::ZERO;
        for attempt in 0..10 {
            let delay = policy.backoff_for_attempt(attempt);
            assert!(
                delay >= previous,
                "attempt {attempt}: {delay:?} < {previous:?}"
            );
            previous = delay;
        }
    }

    #[test]
    fn test_backoff_doubles_then_caps() {
        let policy = RetryPolicy {
            max_retries: 8,
            initial_backoff_ms: 100,
            max_backoff_ms: 1_000,
            backoff_multiplier: 2.0,
            use_jitter: false,
        };

        assert_eq!(policy.backoff_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.backoff_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.backoff_for_attempt(2), Duration::from_millis(400));
        assert_eq!(policy.backoff_for_attempt(5), Duration::from_millis(1_000));
        assert_eq!(policy.backoff_for_attempt(9), Duration::from_millis(1_000));
    }

    #[test]
    fn test_jitter_stays_bounded() {
        let policy = RetryPolicy {
            initial_backoff_ms: 400,
            use_jitter: true,
            ..Default::default()
        };

        for _ in 0..64 {
            let delay = policy.backoff_for_attempt(0).as_millis() as u64;
            assert!(delay >= 400, "jitter must never shorten the delay");
            assert!(delay <= 500, "jitter is capped at 25%");
        }
    }

    #[test]
    fn test_none_policy() {
        let policy = RetryPolicy::none();
        assert_eq!(policy.max_attempts(), 1);
    }
}
