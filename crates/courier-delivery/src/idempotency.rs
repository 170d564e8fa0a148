//! Duplicate trigger suppression.
//!
//! Callers may attach an idempotency key to a trigger. The first trigger for
//! a key within the retention window proceeds; later ones are no-ops. Keys
//! are scoped per subscription.

use std::{sync::Arc, time::Duration};

use courier_core::SubscriptionId;
use tracing::warn;

use crate::shared_store::SharedStore;

/// Default retention of idempotency markers.
pub const DEFAULT_IDEMPOTENCY_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Marks idempotency keys in the shared store.
#[derive(Debug, Clone)]
pub struct IdempotencyGuard {
    store: Arc<dyn SharedStore>,
    ttl: Duration,
}

impl IdempotencyGuard {
    /// Creates a guard retaining markers for `ttl`.
    pub fn new(store: Arc<dyn SharedStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Marks `key` for `subscription_id` and reports whether it was new.
    ///
    /// Returns `true` when the caller should proceed. If the store is
    /// unreachable the trigger proceeds; delivery stays at-least-once.
    pub async fn check_and_mark(&self, subscription_id: SubscriptionId, key: &str) -> bool {
        let scoped = scoped_key(subscription_id, key);
        match self.store.set_if_absent(&scoped, "1", Some(self.ttl)).await {
            Ok(fresh) => fresh,
            Err(e) => {
                warn!(
                    target: "courier::degraded",
                    subscription_id = %subscription_id,
                    error = %e,
                    "idempotency store unavailable, allowing trigger"
                );
                true
            },
        }
    }
}

/// Shared store key for an idempotency marker.
pub fn scoped_key(subscription_id: SubscriptionId, key: &str) -> String {
    format!("idempotency:{subscription_id}:{key}")
}

#[cfg(test)]
mod tests {
    use courier_core::TestClock;

    use super::*;
    use crate::shared_store::InMemorySharedStore;

    fn guard() -> (IdempotencyGuard, InMemorySharedStore, TestClock) {
        let clock = TestClock::new();
        let store = InMemorySharedStore::new(Arc::new(clock.clone()));
        (IdempotencyGuard::new(Arc::new(store.clone()), DEFAULT_IDEMPOTENCY_TTL), store, clock)
    }

    #[tokio::test]
    async fn second_trigger_with_same_key_is_duplicate() {
        let (guard, _, _) = guard();
        let subscription = SubscriptionId::new();

        assert!(guard.check_and_mark(subscription, "order-1").await);
        assert!(!guard.check_and_mark(subscription, "order-1").await);
        assert!(guard.check_and_mark(subscription, "order-2").await);
    }

    #[tokio::test]
    async fn keys_are_scoped_per_subscription() {
        let (guard, _, _) = guard();

        assert!(guard.check_and_mark(SubscriptionId::new(), "k").await);
        assert!(guard.check_and_mark(SubscriptionId::new(), "k").await);
    }

    #[tokio::test]
    async fn markers_expire_after_ttl() {
        let (guard, _, clock) = guard();
        let subscription = SubscriptionId::new();

        assert!(guard.check_and_mark(subscription, "k").await);
        clock.advance(DEFAULT_IDEMPOTENCY_TTL);
        assert!(guard.check_and_mark(subscription, "k").await);
    }

    #[tokio::test]
    async fn store_outage_allows_trigger() {
        let (guard, store, _) = guard();
        let subscription = SubscriptionId::new();
        assert!(guard.check_and_mark(subscription, "k").await);

        store.set_unavailable(true);
        assert!(guard.check_and_mark(subscription, "k").await);
    }
}
