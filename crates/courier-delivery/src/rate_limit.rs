//! Token-bucket rate limiting per subscription.
//!
//! Buckets live in the shared store under `ratelimit:{subscription}` and are
//! refilled lazily on each check. A store outage lets traffic through.

use std::sync::Arc;

use courier_core::{Clock, Subscription};
use tracing::{debug, warn};

use crate::shared_store::{SharedStore, TokenBucket};

/// Admission control for outbound deliveries.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    store: Arc<dyn SharedStore>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// Creates a limiter over the shared store.
    pub fn new(store: Arc<dyn SharedStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Takes `cost` tokens from the bucket at `key`.
    ///
    /// Returns `false` when the bucket is empty. Store failures fail open.
    pub async fn allow(&self, key: &str, capacity: u32, refill_rate: f64, cost: u32) -> bool {
        let bucket = TokenBucket {
            capacity: f64::from(capacity),
            refill_per_second: refill_rate.max(0.0),
            cost: f64::from(cost),
        };

        match self.store.take_tokens(key, bucket, self.clock.unix_millis()).await {
            Ok(allowed) => {
                if !allowed {
                    debug!(key, capacity, refill_rate, "rate limit bucket empty");
                }
                allowed
            },
            Err(e) => {
                warn!(
                    target: "courier::degraded",
                    key,
                    error = %e,
                    "rate limiter unavailable, allowing request"
                );
                true
            },
        }
    }

    /// Checks the subscription's configured bucket. Subscriptions without a
    /// limit are always allowed.
    pub async fn allow_subscription(&self, subscription: &Subscription) -> bool {
        let Some(limit) = subscription.rate_limit else {
            return true;
        };
        self.allow(&bucket_key(subscription), limit.burst, limit.rate_per_second, 1).await
    }
}

fn bucket_key(subscription: &Subscription) -> String {
    format!("ratelimit:{}", subscription.id)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use courier_core::{RateLimitConfig, SigningConfig, TestClock};

    use super::*;
    use crate::shared_store::InMemorySharedStore;

    fn limiter() -> (RateLimiter, InMemorySharedStore, TestClock) {
        let clock = TestClock::new();
        let store = InMemorySharedStore::new(Arc::new(clock.clone()));
        (RateLimiter::new(Arc::new(store.clone()), Arc::new(clock.clone())), store, clock)
    }

    #[tokio::test]
    async fn burst_then_deny() {
        let (limiter, _, _) = limiter();

        for _ in 0..3 {
            assert!(limiter.allow("k", 3, 1.0, 1).await);
        }
        assert!(!limiter.allow("k", 3, 1.0, 1).await);
    }

    #[tokio::test]
    async fn tokens_refill_over_time() {
        let (limiter, _, clock) = limiter();

        assert!(limiter.allow("k", 1, 2.0, 1).await);
        assert!(!limiter.allow("k", 1, 2.0, 1).await);

        clock.advance(Duration::from_millis(500));
        assert!(limiter.allow("k", 1, 2.0, 1).await);
    }

    #[tokio::test]
    async fn cost_above_capacity_is_always_denied() {
        let (limiter, _, _) = limiter();
        assert!(!limiter.allow("k", 2, 1.0, 3).await);
    }

    #[tokio::test]
    async fn store_outage_fails_open() {
        let (limiter, store, _) = limiter();
        assert!(limiter.allow("k", 1, 0.0, 1).await);

        store.set_unavailable(true);
        assert!(limiter.allow("k", 1, 0.0, 1).await);
    }

    #[tokio::test]
    async fn subscriptions_without_limit_are_unlimited() {
        let (limiter, _, _) = limiter();
        let mut subscription = Subscription::new("https://example.com", SigningConfig::hmac_sha256("k"));

        for _ in 0..100 {
            assert!(limiter.allow_subscription(&subscription).await);
        }

        subscription.rate_limit = Some(RateLimitConfig { rate_per_second: 0.0, burst: 1 });
        assert!(limiter.allow_subscription(&subscription).await);
        assert!(!limiter.allow_subscription(&subscription).await);
    }
}
