//! Process-wide outbound rate limiter.
//!
//! Every dispatch call across every watch pipeline shares one limiter,
//! since they all target the same external CRM account. Callers wait
//! for capacity (`until_ready`) instead of erroring or dropping.

use std::num::NonZeroU32;
use std::sync::Arc;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};

use crate::config::RateLimitConfig;

pub type SharedLimiter = Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>;

/// One limiter per process, injected into the dispatcher as a
/// constructor dependency. The quota caps requests inside a rolling
/// 60-second window; keep the configured ceiling strictly below the
/// provider's published limit.
pub fn create_rate_limiter(config: &RateLimitConfig) -> SharedLimiter {
    let per_minute =
        NonZeroU32::new(config.requests_per_minute).unwrap_or(NonZeroU32::new(50).unwrap());

    let quota = Quota::per_minute(per_minute).allow_burst(per_minute);
    Arc::new(RateLimiter::direct(quota))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(requests_per_minute: u32) -> RateLimitConfig {
        RateLimitConfig {
            requests_per_minute,
            max_retries: 3,
            backoff_base_ms: 1000,
            backoff_max_ms: 30000,
        }
    }

    #[test]
    fn test_limiter_allows_up_to_ceiling() {
        let limiter = create_rate_limiter(&test_config(2));
        assert!(limiter.check().is_ok());
        assert!(limiter.check().is_ok());
        // Ceiling reached: the next call would have to wait, never error.
        assert!(limiter.check().is_err());
    }

    #[test]
    fn test_zero_ceiling_falls_back() {
        let limiter = create_rate_limiter(&test_config(0));
        assert!(limiter.check().is_ok());
    }

    #[tokio::test]
    async fn test_until_ready_passes_with_capacity() {
        let limiter = create_rate_limiter(&test_config(10));
        // Plenty of capacity: must not block.
        limiter.until_ready().await;
    }
}
