//! Heal retry bookkeeping.
//!
//! Tracks consecutive failed attempts for one heal trigger and yields the
//! doubling backoff to wait before the next one.

use std::time::Duration;

use tracing::debug;

use meshgrid_core::RetryPolicy;

/// Attempt counter and backoff for a single heal.
#[derive(Debug)]
pub struct HealBackoff {
    policy: RetryPolicy,
    /// Failed attempts so far.
    failures: u32,
    /// Delay before the next attempt.
    current_backoff: Duration,
}

impl HealBackoff {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            failures: 0,
            current_backoff: policy.initial_backoff,
        }
    }

    /// 1-based number of the attempt about to run.
    pub fn attempt(&self) -> u32 {
        self.failures + 1
    }

    /// Record a failed attempt.
    ///
    /// Returns the delay before the next attempt, or `None` once the policy
    /// is exhausted.
    pub fn record_failure(&mut self) -> Option<Duration> {
        self.failures += 1;
        if self.failures >= self.policy.max_attempts {
            debug!(
                failures = self.failures,
                max_attempts = self.policy.max_attempts,
                "heal retries exhausted"
            );
            return None;
        }

        let delay = self.current_backoff;
        self.current_backoff = self
            .current_backoff
            .saturating_mul(2)
            .min(self.policy.max_backoff);
        Some(delay)
    }
}
