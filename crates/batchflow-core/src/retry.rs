//! Error classification, bounded exponential backoff with full jitter, and
//! the retry-or-DLQ decision (spec.md §4.4).

use crate::error::{BatchflowError, Categorizable, ErrorClass};
use chrono::{DateTime, Duration, Utc};

#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub max_attempts: i32,
    pub base_delay_ms: i64,
    pub max_delay_ms: i64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 500,
            max_delay_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Retry,
    Dlq,
}

pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Delegates to the error's own classification; `RetryPolicy` owns the
    /// attempt-count bookkeeping, not the taxonomy.
    pub fn classify(&self, error: &BatchflowError) -> ErrorClass {
        error.classify()
    }

    /// `raw = min(cap, base * 2^(attempt_count - 1))`, `delay =
    /// uniform_random(0, raw)`. `attempt_count` is 1-indexed (the count
    /// already incremented by `Store::claim`).
    pub fn next_attempt(&self, attempt_count: i32, now: DateTime<Utc>) -> DateTime<Utc> {
        let exponent = (attempt_count - 1).max(0) as u32;
        let raw = self
            .config
            .base_delay_ms
            .saturating_mul(1i64 << exponent.min(32))
            .min(self.config.max_delay_ms);
        let delay_ms = if raw <= 0 { 0 } else { fastrand::i64(0..=raw) };
        now + Duration::milliseconds(delay_ms)
    }

    /// Permanent errors always go to DLQ. Transient errors retry until
    /// `attempt_count` reaches `max_attempts`, after which they also go to
    /// DLQ.
    pub fn decide(&self, classification: ErrorClass, attempt_count: i32) -> Decision {
        match classification {
            ErrorClass::Permanent => Decision::Dlq,
            ErrorClass::Transient if attempt_count < self.config.max_attempts => Decision::Retry,
            ErrorClass::Transient => Decision::Dlq,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permanent_errors_never_retry() {
        let policy = RetryPolicy::new(RetryConfig::default());
        assert_eq!(policy.decide(ErrorClass::Permanent, 1), Decision::Dlq);
    }

    #[test]
    fn transient_retries_until_max_attempts_then_dlq() {
        let policy = RetryPolicy::new(RetryConfig {
            max_attempts: 5,
            ..Default::default()
        });
        assert_eq!(policy.decide(ErrorClass::Transient, 4), Decision::Retry);
        assert_eq!(policy.decide(ErrorClass::Transient, 5), Decision::Dlq);
    }

    #[test]
    fn backoff_is_bounded_by_cap() {
        let policy = RetryPolicy::new(RetryConfig {
            max_attempts: 20,
            base_delay_ms: 1000,
            max_delay_ms: 5000,
        });
        let now = Utc::now();
        for attempt in 1..20 {
            let next = policy.next_attempt(attempt, now);
            let delay = (next - now).num_milliseconds();
            assert!(delay >= 0 && delay <= 5000, "delay {delay} out of bounds");
        }
    }

    #[test]
    fn backoff_grows_with_attempt_before_cap() {
        let policy = RetryPolicy::new(RetryConfig {
            max_attempts: 20,
            base_delay_ms: 100,
            max_delay_ms: 1_000_000,
        });
        let now = Utc::now();
        // raw bound for attempt 1 is 100ms, for attempt 4 is 800ms.
        let mut saw_large = false;
        for _ in 0..200 {
            let next = policy.next_attempt(4, now);
            let delay = (next - now).num_milliseconds();
            assert!(delay <= 800);
            if delay > 100 {
                saw_large = true;
            }
        }
        assert!(saw_large, "jitter never exceeded the attempt-1 bound");
    }
}
