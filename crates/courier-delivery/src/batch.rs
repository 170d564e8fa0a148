//! Per-subscription event batching.
//!
//! Subscriptions with a batch configuration collect events in a shared store
//! list (`batch:{subscription}`) and receive them as one `batch.events`
//! delivery once the list reaches the batch size or its oldest event has
//! waited longer than the configured maximum.

use std::{sync::Arc, time::Duration};

use courier_core::{Clock, Subscription, SubscriptionId};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    error::{DeliveryError, Result},
    orchestrator::{DeliveryOrchestrator, TriggerOutcome},
    shared_store::SharedStore,
    storage::DeliveryStorage,
};

/// Event type of a flushed batch.
pub const BATCH_EVENT_TYPE: &str = "batch.events";

const BATCH_KEY_PREFIX: &str = "batch:";

/// One buffered event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchItem {
    /// Generated id of the buffered event.
    pub event_id: String,
    /// Event type as triggered.
    pub event_type: String,
    /// Original payload.
    pub payload: Value,
    /// When the event was buffered, unix milliseconds.
    pub enqueued_at_ms: i64,
}

/// Result of [`BatchBuffer::queue_event`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueOutcome {
    /// The event is waiting in the buffer.
    Queued {
        /// Events now buffered for the subscription
        buffered: usize,
    },
    /// The event filled the buffer, which was flushed.
    Flushed(TriggerOutcome),
    /// The event was triggered on its own.
    DeliveredDirectly(TriggerOutcome),
}

/// Buffers events for subscriptions that accept batches.
pub struct BatchBuffer {
    store: Arc<dyn SharedStore>,
    storage: Arc<dyn DeliveryStorage>,
    orchestrator: Arc<DeliveryOrchestrator>,
    clock: Arc<dyn Clock>,
    default_max_wait: Duration,
}

impl BatchBuffer {
    /// Creates a buffer; `default_max_wait` applies to subscriptions whose
    /// batch configuration sets no wait.
    pub fn new(
        store: Arc<dyn SharedStore>,
        storage: Arc<dyn DeliveryStorage>,
        orchestrator: Arc<DeliveryOrchestrator>,
        clock: Arc<dyn Clock>,
        default_max_wait: Duration,
    ) -> Self {
        Self { store, storage, orchestrator, clock, default_max_wait }
    }

    /// Buffers an event, flushing when the batch is full.
    ///
    /// Subscriptions without batching are triggered directly, as is every
    /// event while the shared store is unreachable.
    ///
    /// # Errors
    ///
    /// - `SubscriptionNotFound` for an unknown subscription
    /// - errors from the resulting trigger
    pub async fn queue_event(
        &self,
        subscription_id: SubscriptionId,
        event_type: &str,
        payload: Value,
    ) -> Result<QueueOutcome> {
        let subscription = self
            .storage
            .find_subscription(subscription_id)
            .await?
            .ok_or_else(|| DeliveryError::subscription_not_found(subscription_id))?;

        let Some(batch) = subscription.batch else {
            let outcome = self.orchestrator.trigger(subscription_id, event_type, payload, None).await?;
            return Ok(QueueOutcome::DeliveredDirectly(outcome));
        };

        let item = BatchItem {
            event_id: Uuid::new_v4().to_string(),
            event_type: event_type.to_string(),
            payload,
            enqueued_at_ms: self.clock.unix_millis(),
        };
        let encoded = serde_json::to_string(&item)
            .map_err(|e| DeliveryError::internal(format!("batch item serialization failed: {e}")))?;

        let buffered = match self.store.push(&batch_key(subscription_id), &encoded).await {
            Ok(buffered) => buffered,
            Err(e) => {
                warn!(
                    target: "courier::degraded",
                    subscription_id = %subscription_id,
                    error = %e,
                    "batch buffer unavailable, delivering event directly"
                );
                let outcome =
                    self.orchestrator.trigger(subscription_id, event_type, item.payload, None).await?;
                return Ok(QueueOutcome::DeliveredDirectly(outcome));
            },
        };

        debug!(subscription_id = %subscription_id, buffered, batch_size = batch.size, "event buffered");

        if buffered >= batch.size.max(1) {
            return Ok(match self.flush(subscription_id).await? {
                Some(outcome) => QueueOutcome::Flushed(outcome),
                None => QueueOutcome::Queued { buffered: 0 },
            });
        }

        Ok(QueueOutcome::Queued { buffered })
    }

    /// Drains the subscription's buffer into one delivery.
    ///
    /// Returns `None` when the buffer was empty. The batch id doubles as the
    /// idempotency key. If the trigger fails the drained events go back to
    /// the head of the buffer for the next flush.
    ///
    /// # Errors
    ///
    /// Returns `StoreUnavailable` if the buffer cannot be drained, or the
    /// trigger's error.
    pub async fn flush(&self, subscription_id: SubscriptionId) -> Result<Option<TriggerOutcome>> {
        let key = batch_key(subscription_id);
        let raw = self.store.drain(&key).await?;
        let mut drained = Vec::with_capacity(raw.len());
        let mut events = Vec::with_capacity(raw.len());
        for entry in raw {
            match serde_json::from_str::<BatchItem>(&entry) {
                Ok(item) => {
                    events.push(item);
                    drained.push(entry);
                },
                Err(e) => {
                    warn!(subscription_id = %subscription_id, error = %e, "dropping unreadable batch item");
                },
            }
        }

        if events.is_empty() {
            return Ok(None);
        }

        let batch_id = Uuid::new_v4().to_string();
        let count = events.len();
        let payload = json!({ "batch_id": batch_id, "count": count, "events": events });

        let triggered = self.orchestrator.trigger(subscription_id, BATCH_EVENT_TYPE, payload, Some(&batch_id)).await;
        let outcome = match triggered {
            Ok(outcome) => outcome,
            Err(e) => {
                self.requeue(subscription_id, &key, &drained).await;
                return Err(e);
            },
        };
        info!(subscription_id = %subscription_id, batch_id = %batch_id, count, "batch flushed");

        Ok(Some(outcome))
    }

    async fn requeue(&self, subscription_id: SubscriptionId, key: &str, drained: &[String]) {
        match self.store.restore(key, drained).await {
            Ok(buffered) => {
                warn!(
                    subscription_id = %subscription_id,
                    requeued = drained.len(),
                    buffered,
                    "batch flush failed, events requeued"
                );
            },
            Err(e) => {
                error!(
                    subscription_id = %subscription_id,
                    lost = drained.len(),
                    error = %e,
                    "batch flush failed and events could not be requeued"
                );
            },
        }
    }

    /// Flushes every buffer whose oldest event has waited at least its
    /// subscription's maximum wait. Returns the number of batches flushed.
    ///
    /// # Errors
    ///
    /// Returns `StoreUnavailable` if the buffers cannot be listed. A buffer
    /// that fails to flush is logged and left for the next sweep.
    pub async fn flush_stale(&self) -> Result<usize> {
        let now_ms = self.clock.unix_millis();
        let mut flushed = 0;

        for key in self.store.keys_with_prefix(BATCH_KEY_PREFIX).await? {
            let Some(subscription_id) = parse_batch_key(&key) else {
                warn!(key = %key, "ignoring malformed batch key");
                continue;
            };

            match self.flush_if_stale(subscription_id, &key, now_ms).await {
                Ok(true) => flushed += 1,
                Ok(false) => {},
                Err(e) => {
                    warn!(subscription_id = %subscription_id, error = %e, "stale batch flush failed");
                },
            }
        }

        Ok(flushed)
    }

    async fn flush_if_stale(&self, subscription_id: SubscriptionId, key: &str, now_ms: i64) -> Result<bool> {
        let Some(oldest) = self.store.range(key).await?.into_iter().next() else {
            return Ok(false);
        };
        let Ok(oldest) = serde_json::from_str::<BatchItem>(&oldest) else {
            return Ok(self.flush(subscription_id).await?.is_some());
        };

        let subscription = self.storage.find_subscription(subscription_id).await?;
        let max_wait = self.max_wait(subscription.as_ref());
        let waited_ms = now_ms.saturating_sub(oldest.enqueued_at_ms);
        if u128::try_from(waited_ms).unwrap_or(0) < max_wait.as_millis() {
            return Ok(false);
        }

        if subscription.is_none() {
            warn!(subscription_id = %subscription_id, "discarding batch of deleted subscription");
            self.store.delete(key).await?;
            return Ok(false);
        }

        Ok(self.flush(subscription_id).await?.is_some())
    }

    fn max_wait(&self, subscription: Option<&Subscription>) -> Duration {
        subscription
            .and_then(|s| s.batch.as_ref())
            .map(|batch| batch.max_wait())
            .filter(|wait| !wait.is_zero())
            .unwrap_or(self.default_max_wait)
    }
}

fn batch_key(subscription_id: SubscriptionId) -> String {
    format!("{BATCH_KEY_PREFIX}{subscription_id}")
}

fn parse_batch_key(key: &str) -> Option<SubscriptionId> {
    key.strip_prefix(BATCH_KEY_PREFIX)?.parse::<Uuid>().ok().map(SubscriptionId)
}

#[cfg(test)]
mod tests {
    use courier_core::{BatchConfig, DeliveryRecord, SigningConfig, TestClock};
    use tokio::sync::RwLock;

    use super::*;
    use crate::{
        engine::DeliveryConfig, shared_store::InMemorySharedStore, stats::EngineStats,
        storage::mock::MockDeliveryStorage,
    };

    struct Harness {
        buffer: BatchBuffer,
        storage: MockDeliveryStorage,
        store: InMemorySharedStore,
        clock: TestClock,
    }

    fn harness() -> Harness {
        let clock = TestClock::new();
        let storage = MockDeliveryStorage::new();
        let store = InMemorySharedStore::new(Arc::new(clock.clone()));
        let orchestrator = DeliveryOrchestrator::new(
            Arc::new(storage.clone()),
            Arc::new(store.clone()),
            &DeliveryConfig::default(),
            Arc::new(clock.clone()),
            Arc::new(RwLock::new(EngineStats::default())),
        )
        .unwrap();
        let buffer = BatchBuffer::new(
            Arc::new(store.clone()),
            Arc::new(storage.clone()),
            Arc::new(orchestrator),
            Arc::new(clock.clone()),
            Duration::from_secs(5),
        );
        Harness { buffer, storage, store, clock }
    }

    async fn subscribe(h: &Harness, batch: Option<BatchConfig>) -> SubscriptionId {
        let mut subscription = Subscription::new("https://example.com/hook", SigningConfig::hmac_sha256("k"));
        subscription.batch = batch;
        let id = subscription.id;
        h.storage.add_subscription(subscription).await;
        id
    }

    async fn only_delivery(h: &Harness, id: SubscriptionId) -> DeliveryRecord {
        let records = h.storage.deliveries_for(id).await;
        assert_eq!(records.len(), 1);
        records.into_iter().next().unwrap()
    }

    #[tokio::test]
    async fn full_batch_flushes_in_insertion_order() {
        let h = harness();
        let id = subscribe(&h, Some(BatchConfig { size: 3, max_wait_ms: 60_000 })).await;

        for i in 0..2 {
            let outcome = h.buffer.queue_event(id, "metric.recorded", json!({"n": i})).await.unwrap();
            assert_eq!(outcome, QueueOutcome::Queued { buffered: i + 1 });
        }
        let outcome = h.buffer.queue_event(id, "metric.recorded", json!({"n": 2})).await.unwrap();
        assert!(matches!(outcome, QueueOutcome::Flushed(TriggerOutcome::Scheduled { .. })));

        let record = only_delivery(&h, id).await;
        assert_eq!(record.event_type, BATCH_EVENT_TYPE);
        let body = record.payload.data();
        assert_eq!(body["count"], 3);
        let order: Vec<i64> = body["events"].as_array().unwrap().iter().map(|e| e["payload"]["n"].as_i64().unwrap()).collect();
        assert_eq!(order, vec![0, 1, 2]);
        assert_eq!(record.idempotency_key.as_deref(), body["batch_id"].as_str());
    }

    #[tokio::test]
    async fn unbatched_subscription_triggers_directly() {
        let h = harness();
        let id = subscribe(&h, None).await;

        let outcome = h.buffer.queue_event(id, "x", json!({})).await.unwrap();

        assert!(matches!(outcome, QueueOutcome::DeliveredDirectly(TriggerOutcome::Scheduled { .. })));
        assert_eq!(only_delivery(&h, id).await.event_type, "x");
    }

    #[tokio::test]
    async fn store_outage_triggers_directly() {
        let h = harness();
        let id = subscribe(&h, Some(BatchConfig { size: 10, max_wait_ms: 1_000 })).await;
        h.store.set_unavailable(true);

        let outcome = h.buffer.queue_event(id, "x", json!({"solo": true})).await.unwrap();

        assert!(matches!(outcome, QueueOutcome::DeliveredDirectly(TriggerOutcome::Scheduled { .. })));
        assert_eq!(only_delivery(&h, id).await.payload.data(), &json!({"solo": true}));
    }

    #[tokio::test]
    async fn stale_batches_flush_after_max_wait() {
        let h = harness();
        let id = subscribe(&h, Some(BatchConfig { size: 10, max_wait_ms: 2_000 })).await;
        h.buffer.queue_event(id, "x", json!({})).await.unwrap();

        h.clock.advance(Duration::from_millis(1_999));
        assert_eq!(h.buffer.flush_stale().await.unwrap(), 0);

        h.clock.advance(Duration::from_millis(1));
        assert_eq!(h.buffer.flush_stale().await.unwrap(), 1);
        assert_eq!(only_delivery(&h, id).await.payload.data()["count"], 1);

        assert_eq!(h.buffer.flush_stale().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn failed_flush_keeps_events_buffered() {
        let h = harness();
        let id = subscribe(&h, Some(BatchConfig { size: 3, max_wait_ms: 60_000 })).await;
        for i in 0..2 {
            h.buffer.queue_event(id, "metric.recorded", json!({"n": i})).await.unwrap();
        }
        h.storage.inject_create_error("connection reset").await;

        assert!(h.buffer.queue_event(id, "metric.recorded", json!({"n": 2})).await.is_err());
        assert_eq!(h.store.range(&batch_key(id)).await.unwrap().len(), 3);
        assert!(h.storage.deliveries_for(id).await.is_empty());

        let outcome = h.buffer.flush(id).await.unwrap();
        assert!(matches!(outcome, Some(TriggerOutcome::Scheduled { .. })));
        let body = only_delivery(&h, id).await.payload.data().clone();
        let order: Vec<i64> =
            body["events"].as_array().unwrap().iter().map(|e| e["payload"]["n"].as_i64().unwrap()).collect();
        assert_eq!(order, vec![0, 1, 2]);
        assert!(h.store.range(&batch_key(id)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_flush_is_a_no_op() {
        let h = harness();
        let id = subscribe(&h, Some(BatchConfig { size: 2, max_wait_ms: 0 })).await;

        assert_eq!(h.buffer.flush(id).await.unwrap(), None);
        assert!(h.storage.deliveries_for(id).await.is_empty());
    }

    #[test]
    fn batch_keys_round_trip() {
        let id = SubscriptionId::new();
        assert_eq!(parse_batch_key(&batch_key(id)), Some(id));
        assert_eq!(parse_batch_key("batch:nope"), None);
        assert_eq!(parse_batch_key("circuit:x"), None);
    }
}
