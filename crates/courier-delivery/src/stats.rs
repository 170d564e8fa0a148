//! Engine counters and per-subscription delivery health.

use std::{sync::Arc, time::Duration};

use courier_core::{Clock, SubscriptionId, SubscriptionStats};
use serde::Serialize;

use crate::{error::Result, storage::DeliveryStorage};

/// Default window for [`StatsCollector::subscription_stats`].
pub const DEFAULT_STATS_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// Process-local counters since startup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    /// Number of running background tasks.
    pub active_workers: usize,
    /// Delivery records created by triggers and replays.
    pub deliveries_scheduled: u64,
    /// Attempts that reached the subscriber or failed before sending.
    pub attempts_executed: u64,
    /// Deliveries that ended in success.
    pub successful_deliveries: u64,
    /// Failed attempts that were rescheduled.
    pub retries_scheduled: u64,
    /// Deliveries moved to the dead letter queue.
    pub dead_lettered: u64,
    /// Attempts currently waiting on a subscriber.
    pub in_flight_attempts: u64,
    /// Triggers ignored because their idempotency key was seen.
    pub duplicates_ignored: u64,
    /// Triggers dropped by the rate limiter.
    pub rate_limited: u64,
    /// Triggers and due retries held back by an open circuit.
    pub circuit_rejections: u64,
    /// Triggers whose payload could not be transformed.
    pub transform_failures: u64,
}

/// Reads delivery health from recorded attempts.
#[derive(Clone)]
pub struct StatsCollector {
    storage: Arc<dyn DeliveryStorage>,
    clock: Arc<dyn Clock>,
    window: Duration,
}

impl StatsCollector {
    /// Creates a collector aggregating over `window`.
    pub fn new(storage: Arc<dyn DeliveryStorage>, clock: Arc<dyn Clock>, window: Duration) -> Self {
        Self { storage, clock, window }
    }

    /// Attempts, success rate and mean latency over the window ending now.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError` if the aggregate query fails.
    pub async fn subscription_stats(&self, subscription_id: SubscriptionId) -> Result<SubscriptionStats> {
        let window = chrono::Duration::from_std(self.window).unwrap_or_else(|_| chrono::Duration::days(1));
        let since = self.clock.now_utc() - window;
        Ok(self.storage.subscription_stats(subscription_id, since, self.window.as_secs()).await?)
    }
}

#[cfg(test)]
mod tests {
    use courier_core::{
        AttemptOutcome, DeliveryAttemptRecord, DeliveryRecord, DeliveryTransition, PayloadSnapshot, TestClock,
    };
    use serde_json::json;
    use uuid::Uuid;

    use super::*;
    use crate::storage::mock::MockDeliveryStorage;

    #[tokio::test]
    async fn attempts_outside_window_are_ignored() {
        let storage = MockDeliveryStorage::new();
        let clock = TestClock::new();
        let collector = StatsCollector::new(Arc::new(storage.clone()), Arc::new(clock.clone()), DEFAULT_STATS_WINDOW);
        let subscription_id = SubscriptionId::new();

        let record = DeliveryRecord::pending(
            subscription_id,
            "user.created",
            PayloadSnapshot::new(json!({})),
            None,
            clock.now_utc(),
        );
        let delivery_id = storage.create_delivery(record).await.unwrap();
        let attempt = DeliveryAttemptRecord {
            id: Uuid::new_v4(),
            delivery_id,
            attempt_number: 1,
            outcome: AttemptOutcome::Success,
            http_status: Some(204),
            duration_ms: 12,
            error: None,
            attempted_at: clock.now_utc(),
        };
        storage
            .complete_attempt(delivery_id, attempt, DeliveryTransition::Succeeded, clock.now_utc())
            .await
            .unwrap();

        let stats = collector.subscription_stats(subscription_id).await.unwrap();
        assert_eq!(stats.total_attempts, 1);
        assert_eq!(stats.window_secs, 86_400);

        clock.advance(DEFAULT_STATS_WINDOW + Duration::from_secs(1));
        let stats = collector.subscription_stats(subscription_id).await.unwrap();
        assert_eq!(stats.total_attempts, 0);
        assert!(stats.success_rate.abs() < f64::EPSILON);
    }
}
