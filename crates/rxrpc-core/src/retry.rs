//! Retry policy and exponential backoff calculation.
//!
//! Only the math lives here. The async loop that sleeps between attempts
//! belongs to whoever owns the operation (e.g. the polling transport).

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default number of retries after the initial attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 5;
/// Default delay before the first retry, in milliseconds.
pub const DEFAULT_INITIAL_DELAY_MS: u64 = 500;
/// Default cap on a single delay, in milliseconds.
pub const DEFAULT_MAX_DELAY_MS: u64 = 30_000;

/// Bounded exponential backoff.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries allowed after the initial attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before the first retry in ms.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Upper bound for any single delay in ms.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}
fn default_initial_delay_ms() -> u64 {
    DEFAULT_INITIAL_DELAY_MS
}
fn default_max_delay_ms() -> u64 {
    DEFAULT_MAX_DELAY_MS
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            initial_delay_ms: DEFAULT_INITIAL_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait before retry number `retry` (zero-based), or `None`
    /// once the budget is spent.
    pub fn delay_for(&self, retry: u32) -> Option<Duration> {
        (retry < self.max_retries).then(|| {
            Duration::from_millis(calculate_backoff_delay(
                retry,
                self.initial_delay_ms,
                self.max_delay_ms,
            ))
        })
    }
}

/// `min(max_delay, base_delay * 2^attempt)`, saturating.
#[must_use]
pub fn calculate_backoff_delay(attempt: u32, base_delay_ms: u64, max_delay_ms: u64) -> u64 {
    base_delay_ms
        .saturating_mul(1u64 << attempt.min(31))
        .min(max_delay_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 5);
        assert_eq!(policy.initial_delay_ms, 500);
        assert_eq!(policy.max_delay_ms, 30_000);
    }

    #[test]
    fn policy_serde_defaults() {
        let policy: RetryPolicy = serde_json::from_str(r#"{"max_retries": 2}"#).unwrap();
        assert_eq!(policy.max_retries, 2);
        assert_eq!(policy.initial_delay_ms, 500);
    }

    #[test]
    fn backoff_exponential_growth() {
        assert_eq!(calculate_backoff_delay(0, 100, 60_000), 100);
        assert_eq!(calculate_backoff_delay(1, 100, 60_000), 200);
        assert_eq!(calculate_backoff_delay(2, 100, 60_000), 400);
        assert_eq!(calculate_backoff_delay(3, 100, 60_000), 800);
    }

    #[test]
    fn backoff_caps_at_max() {
        assert_eq!(calculate_backoff_delay(10, 1000, 60_000), 60_000);
    }

    #[test]
    fn backoff_high_attempt_no_overflow() {
        assert_eq!(calculate_backoff_delay(100, u64::MAX / 2, u64::MAX), u64::MAX);
    }

    #[test]
    fn delay_for_stops_after_budget() {
        let policy = RetryPolicy {
            max_retries: 3,
            initial_delay_ms: 10,
            max_delay_ms: 1000,
        };
        assert_eq!(policy.delay_for(0), Some(Duration::from_millis(10)));
        assert_eq!(policy.delay_for(1), Some(Duration::from_millis(20)));
        assert_eq!(policy.delay_for(2), Some(Duration::from_millis(40)));
        assert_eq!(policy.delay_for(3), None);
    }

    #[test]
    fn zero_retries_never_delays() {
        let policy = RetryPolicy {
            max_retries: 0,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_for(0), None);
    }
}
