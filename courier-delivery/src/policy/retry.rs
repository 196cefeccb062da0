//! Retry policy for queued messages.
//!
//! Decides how long a message waits before its next attempt. Whether it gets one
//! at all depends on the failure being temporary and on the message's own retry
//! budget (see [`QueueEntry::can_retry`](crate::QueueEntry::can_retry)).

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::queue::retry::{backoff_delay, with_jitter};

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries allowed per message unless overridden at enqueue time.
    ///
    /// Default: 3
    #[serde(default = "defaults::max_retries")]
    pub max_retries: u32,

    /// Delay before the first retry (in seconds).
    ///
    /// Each further retry doubles it: `base * 2^(retry_count - 1)`.
    ///
    /// Default: 60 seconds
    #[serde(default = "defaults::base_retry_delay_secs")]
    pub base_retry_delay_secs: u64,

    /// Upper bound for the doubled delay (in seconds).
    ///
    /// Default: 3600 seconds (1 hour)
    #[serde(default = "defaults::max_retry_delay_secs")]
    pub max_retry_delay_secs: u64,

    /// Randomise each delay within ±`retry_jitter_factor`.
    ///
    /// Default: 0.0 (no jitter)
    #[serde(default)]
    pub retry_jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: defaults::max_retries(),
            base_retry_delay_secs: defaults::base_retry_delay_secs(),
            max_retry_delay_secs: defaults::max_retry_delay_secs(),
            retry_jitter_factor: 0.0,
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay before retry number `retry_count` (1-indexed).
    #[must_use]
    pub fn retry_delay(&self, retry_count: u32) -> Duration {
        let delay = backoff_delay(
            retry_count,
            Duration::from_secs(self.base_retry_delay_secs),
            Duration::from_secs(self.max_retry_delay_secs),
        );
        with_jitter(delay, self.retry_jitter_factor)
    }
}

mod defaults {
    pub const fn max_retries() -> u32 {
        3
    }

    pub const fn base_retry_delay_secs() -> u64 {
        60
    }

    pub const fn max_retry_delay_secs() -> u64 {
        3600
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_policy_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.base_retry_delay_secs, 60);
        assert_eq!(policy.max_retry_delay_secs, 3600);
        assert!(policy.retry_jitter_factor.abs() < f64::EPSILON);
    }

    #[test]
    fn test_retry_delay_doubles_until_capped() {
        let policy = RetryPolicy {
            base_retry_delay_secs: 10,
            max_retry_delay_secs: 50,
            ..RetryPolicy::default()
        };

        assert_eq!(policy.retry_delay(1), Duration::from_secs(10));
        assert_eq!(policy.retry_delay(2), Duration::from_secs(20));
        assert_eq!(policy.retry_delay(3), Duration::from_secs(40));
        assert_eq!(policy.retry_delay(4), Duration::from_secs(50));
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let policy: RetryPolicy = ron::from_str("(max_retries: 5)").unwrap();
        assert_eq!(policy.max_retries, 5);
        assert_eq!(policy.base_retry_delay_secs, 60);
    }
}
