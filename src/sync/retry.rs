//! Retry backoff schedule.
//!
//! An explicit state machine (attempt count in, next delay out) rather
//! than a nested retry loop, so the policy is testable by inspecting
//! delays instead of waiting them out. The dispatcher owns the sleep.

use std::time::Duration;

use crate::config::RateLimitConfig;

#[derive(Debug, Clone)]
pub struct RetrySchedule {
    max_retries: u32,
    base: Duration,
    cap: Duration,
    failures: u32,
}

impl RetrySchedule {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self::with_limits(
            config.max_retries,
            Duration::from_millis(config.backoff_base_ms),
            Duration::from_millis(config.backoff_max_ms),
        )
    }

    pub fn with_limits(max_retries: u32, base: Duration, cap: Duration) -> Self {
        Self {
            max_retries,
            base,
            cap,
            failures: 0,
        }
    }

    /// Transient failures recorded so far.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Record a transient failure and return how long to wait before
    /// the next attempt, or `None` once the retry budget is spent.
    ///
    /// Backoff doubles per failure and is capped; a provider-supplied
    /// retry-after hint acts as a floor on the wait, never a ceiling.
    pub fn next_delay(&mut self, retry_after: Option<Duration>) -> Option<Duration> {
        if self.failures >= self.max_retries {
            return None;
        }
        self.failures += 1;

        let exp = self
            .base
            .saturating_mul(2u32.saturating_pow(self.failures - 1))
            .min(self.cap);

        Some(exp.max(retry_after.unwrap_or(Duration::ZERO)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_progression() {
        let mut schedule =
            RetrySchedule::with_limits(4, Duration::from_secs(1), Duration::from_secs(30));

        assert_eq!(schedule.next_delay(None), Some(Duration::from_secs(1)));
        assert_eq!(schedule.next_delay(None), Some(Duration::from_secs(2)));
        assert_eq!(schedule.next_delay(None), Some(Duration::from_secs(4)));
        assert_eq!(schedule.next_delay(None), Some(Duration::from_secs(8)));
        assert_eq!(schedule.next_delay(None), None);
        assert_eq!(schedule.failures(), 4);
    }

    #[test]
    fn test_backoff_is_capped() {
        let mut schedule =
            RetrySchedule::with_limits(10, Duration::from_secs(10), Duration::from_secs(25));

        assert_eq!(schedule.next_delay(None), Some(Duration::from_secs(10)));
        assert_eq!(schedule.next_delay(None), Some(Duration::from_secs(20)));
        // 40s exponential, capped at 25s.
        assert_eq!(schedule.next_delay(None), Some(Duration::from_secs(25)));
        assert_eq!(schedule.next_delay(None), Some(Duration::from_secs(25)));
    }

    #[test]
    fn test_retry_after_is_a_floor() {
        let mut schedule =
            RetrySchedule::with_limits(3, Duration::from_secs(1), Duration::from_secs(30));

        // Hint above the computed backoff wins.
        assert_eq!(
            schedule.next_delay(Some(Duration::from_secs(12))),
            Some(Duration::from_secs(12))
        );
        // Hint below the computed backoff loses.
        assert_eq!(
            schedule.next_delay(Some(Duration::from_millis(100))),
            Some(Duration::from_secs(2))
        );
    }

    #[test]
    fn test_exhaustion_ignores_hint() {
        let mut schedule =
            RetrySchedule::with_limits(1, Duration::from_secs(1), Duration::from_secs(30));

        assert!(schedule.next_delay(None).is_some());
        assert_eq!(schedule.next_delay(Some(Duration::from_secs(60))), None);
    }

    #[test]
    fn test_zero_retries_never_waits() {
        let mut schedule =
            RetrySchedule::with_limits(0, Duration::from_secs(1), Duration::from_secs(30));
        assert_eq!(schedule.next_delay(None), None);
    }
}
