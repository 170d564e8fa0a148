//! Public entry point of the delivery engine.
//!
//! [`DeliveryEngine`] owns the pipeline, the background tasks and the
//! operator surface (dead letters, stats, circuits).

use std::{sync::Arc, time::Duration};

use courier_core::{
    Clock, DeadLetterEntry, DeadLetterId, DeadLetterQuery, DeliveryId, SubscriptionId, SubscriptionStats,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{
    batch::{BatchBuffer, QueueOutcome},
    broadcaster::{BroadcastSummary, EventBroadcaster},
    circuit::{CircuitConfig, CircuitSnapshot},
    client::ClientConfig,
    error::Result,
    idempotency::DEFAULT_IDEMPOTENCY_TTL,
    orchestrator::{AttemptDisposition, DeliveryOrchestrator, TriggerOutcome},
    retry::RetryPolicy,
    shared_store::SharedStore,
    stats::{EngineStats, StatsCollector, DEFAULT_STATS_WINDOW},
    storage::DeliveryStorage,
    worker_pool::WorkerPool,
};

/// Configuration for the delivery engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Maximum attempts in flight at once.
    pub worker_count: usize,

    /// How often the retry poller looks for due deliveries.
    pub poll_interval: Duration,

    /// Maximum deliveries claimed per poll.
    pub claim_batch_size: usize,

    /// How long a claimed delivery is hidden from other pollers.
    pub claim_lease: Duration,

    /// Backoff and timeout tiers.
    pub retry: RetryPolicy,

    /// Circuit breaker thresholds.
    pub circuit: CircuitConfig,

    /// Retention of idempotency keys.
    pub idempotency_ttl: Duration,

    /// Maximum wait for batches whose subscription sets none.
    pub default_batch_max_wait: Duration,

    /// How often stale batches are flushed.
    pub batch_sweep_interval: Duration,

    /// Outbound HTTP client settings.
    pub client: ClientConfig,

    /// Maximum time to wait for background tasks on shutdown.
    pub shutdown_timeout: Duration,

    /// Window for subscription stats.
    pub stats_window: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            worker_count: crate::DEFAULT_WORKER_COUNT,
            poll_interval: Duration::from_secs(2),
            claim_batch_size: crate::DEFAULT_CLAIM_BATCH_SIZE,
            claim_lease: Duration::from_secs(60),
            retry: RetryPolicy::default(),
            circuit: CircuitConfig::default(),
            idempotency_ttl: DEFAULT_IDEMPOTENCY_TTL,
            default_batch_max_wait: Duration::from_secs(5),
            batch_sweep_interval: Duration::from_secs(1),
            client: ClientConfig::default(),
            shutdown_timeout: Duration::from_secs(30),
            stats_window: DEFAULT_STATS_WINDOW,
        }
    }
}

/// Webhook delivery engine.
pub struct DeliveryEngine {
    config: DeliveryConfig,
    orchestrator: Arc<DeliveryOrchestrator>,
    broadcaster: EventBroadcaster,
    batches: Arc<BatchBuffer>,
    stats_collector: StatsCollector,
    stats: Arc<RwLock<EngineStats>>,
    clock: Arc<dyn Clock>,
    cancellation_token: CancellationToken,
    worker_pool: Option<WorkerPool>,
}

impl DeliveryEngine {
    /// Wires the engine over durable storage and the shared store.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError` if the HTTP client cannot be built.
    pub fn new(
        storage: Arc<dyn DeliveryStorage>,
        store: Arc<dyn SharedStore>,
        config: DeliveryConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let stats = Arc::new(RwLock::new(EngineStats::default()));
        let orchestrator = Arc::new(DeliveryOrchestrator::new(
            storage.clone(),
            store.clone(),
            &config,
            clock.clone(),
            stats.clone(),
        )?);
        let broadcaster = EventBroadcaster::new(storage.clone(), orchestrator.clone());
        let batches = Arc::new(BatchBuffer::new(
            store,
            storage.clone(),
            orchestrator.clone(),
            clock.clone(),
            config.default_batch_max_wait,
        ));
        let stats_collector = StatsCollector::new(storage, clock.clone(), config.stats_window);

        Ok(Self {
            config,
            orchestrator,
            broadcaster,
            batches,
            stats_collector,
            stats,
            clock,
            cancellation_token: CancellationToken::new(),
            worker_pool: None,
        })
    }

    /// Configuration in use.
    pub fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    /// Starts the retry poller and the stale-batch sweeper.
    ///
    /// Returns immediately after spawning. Use `shutdown()` to stop
    /// gracefully.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError` if the engine is already running.
    pub async fn start(&mut self) -> Result<()> {
        if self.worker_pool.is_some() {
            return Err(crate::DeliveryError::configuration("delivery engine already started"));
        }

        info!(
            worker_count = self.config.worker_count,
            poll_interval_ms = self.config.poll_interval.as_millis(),
            claim_batch_size = self.config.claim_batch_size,
            "starting webhook delivery engine"
        );

        let mut worker_pool = WorkerPool::new(
            self.orchestrator.clone(),
            self.batches.clone(),
            self.config.clone(),
            self.stats.clone(),
            self.cancellation_token.clone(),
            self.clock.clone(),
        );
        worker_pool.spawn_workers().await;
        self.worker_pool = Some(worker_pool);

        info!("delivery engine started");
        Ok(())
    }

    /// Stops background tasks and waits for in-flight attempts.
    ///
    /// # Errors
    ///
    /// Returns `ShutdownTimeout` if tasks do not finish within the shutdown
    /// timeout, or `WorkerPanic` if one panicked.
    pub async fn shutdown(mut self) -> Result<()> {
        info!("shutting down delivery engine");

        if let Some(worker_pool) = self.worker_pool.take() {
            worker_pool.shutdown_graceful(self.config.shutdown_timeout).await?;
        } else {
            info!("delivery engine was not started, shutdown completed immediately");
        }
        Ok(())
    }

    /// Admits one event for one subscription.
    ///
    /// # Errors
    ///
    /// See [`DeliveryOrchestrator::trigger`].
    pub async fn trigger(
        &self,
        subscription_id: SubscriptionId,
        event_type: &str,
        payload: Value,
        idempotency_key: Option<&str>,
    ) -> Result<TriggerOutcome> {
        self.orchestrator.trigger(subscription_id, event_type, payload, idempotency_key).await
    }

    /// Sends an event to every matching subscription.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError` if subscriptions cannot be listed.
    pub async fn broadcast(&self, event_type: &str, payload: Value) -> Result<BroadcastSummary> {
        self.broadcaster.broadcast(event_type, payload).await
    }

    /// Buffers an event for a batching subscription.
    ///
    /// # Errors
    ///
    /// See [`BatchBuffer::queue_event`].
    pub async fn queue_event(
        &self,
        subscription_id: SubscriptionId,
        event_type: &str,
        payload: Value,
    ) -> Result<QueueOutcome> {
        self.batches.queue_event(subscription_id, event_type, payload).await
    }

    /// Flushes a subscription's batch now.
    ///
    /// # Errors
    ///
    /// See [`BatchBuffer::flush`].
    pub async fn flush_batch(&self, subscription_id: SubscriptionId) -> Result<Option<TriggerOutcome>> {
        self.batches.flush(subscription_id).await
    }

    /// Flushes every batch that has waited too long.
    ///
    /// # Errors
    ///
    /// See [`BatchBuffer::flush_stale`].
    pub async fn flush_stale_batches(&self) -> Result<usize> {
        self.batches.flush_stale().await
    }

    /// Claims one batch of due deliveries without the background poller and
    /// waits for their attempts. Returns the number of records claimed.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError` if claiming fails.
    pub async fn process_due(&self) -> Result<usize> {
        self.orchestrator.process_due().await
    }

    /// Runs the next attempt of one delivery immediately.
    ///
    /// # Errors
    ///
    /// See [`DeliveryOrchestrator::execute_attempt`].
    pub async fn execute_attempt(&self, delivery_id: DeliveryId) -> Result<AttemptDisposition> {
        self.orchestrator.execute_attempt(delivery_id).await
    }

    /// Lists dead letters, newest first.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError` if the query fails.
    pub async fn list_dead_letters(&self, query: DeadLetterQuery) -> Result<Vec<DeadLetterEntry>> {
        self.orchestrator.dead_letters().list(query).await
    }

    /// Re-delivers a dead-lettered payload as a new delivery.
    ///
    /// # Errors
    ///
    /// See [`DeliveryOrchestrator::replay_dead_letter`].
    pub async fn replay_dead_letter(&self, entry_id: DeadLetterId) -> Result<TriggerOutcome> {
        self.orchestrator.replay_dead_letter(entry_id).await
    }

    /// Archives a dead letter.
    ///
    /// # Errors
    ///
    /// Returns `DeadLetterNotFound` for an unknown entry.
    pub async fn discard_dead_letter(&self, entry_id: DeadLetterId) -> Result<()> {
        self.orchestrator.dead_letters().discard(entry_id).await
    }

    /// Delivery health over the stats window.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError` if the aggregate query fails.
    pub async fn subscription_stats(&self, subscription_id: SubscriptionId) -> Result<SubscriptionStats> {
        self.stats_collector.subscription_stats(subscription_id).await
    }

    /// Circuit state and counters for a subscription.
    ///
    /// # Errors
    ///
    /// Returns `StoreUnavailable` if the shared store cannot be read.
    pub async fn circuit_snapshot(&self, subscription_id: SubscriptionId) -> Result<CircuitSnapshot> {
        Ok(self.orchestrator.circuit().snapshot(subscription_id).await?)
    }

    /// Current engine counters.
    pub async fn stats(&self) -> EngineStats {
        self.stats.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use courier_core::{SigningConfig, Subscription, TestClock};
    use serde_json::json;

    use super::*;
    use crate::{shared_store::InMemorySharedStore, storage::mock::MockDeliveryStorage};

    fn engine(storage: &MockDeliveryStorage) -> DeliveryEngine {
        let clock = TestClock::new();
        DeliveryEngine::new(
            Arc::new(storage.clone()),
            Arc::new(InMemorySharedStore::new(Arc::new(clock.clone()))),
            DeliveryConfig::default(),
            Arc::new(clock),
        )
        .unwrap()
    }

    #[test]
    fn default_config_uses_documented_constants() {
        let config = DeliveryConfig::default();

        assert_eq!(config.claim_batch_size, 50);
        assert_eq!(config.poll_interval, Duration::from_secs(2));
        assert_eq!(config.idempotency_ttl, Duration::from_secs(86_400));
        assert_eq!(config.circuit.failure_threshold, 5);
        assert_eq!(config.retry.timeouts.len(), 3);
    }

    #[tokio::test]
    async fn duplicate_idempotency_key_is_counted() {
        let storage = MockDeliveryStorage::new();
        let engine = engine(&storage);
        let subscription = Subscription::new("https://example.com", SigningConfig::hmac_sha256("k"));
        storage.add_subscription(subscription.clone()).await;

        let first = engine.trigger(subscription.id, "x", json!({}), Some("k-1")).await.unwrap();
        let second = engine.trigger(subscription.id, "x", json!({}), Some("k-1")).await.unwrap();

        assert!(first.is_scheduled());
        assert_eq!(second, TriggerOutcome::Duplicate);
        let stats = engine.stats().await;
        assert_eq!(stats.deliveries_scheduled, 1);
        assert_eq!(stats.duplicates_ignored, 1);
    }

    #[tokio::test]
    async fn unstarted_engine_shuts_down_immediately() {
        let storage = MockDeliveryStorage::new();

        engine(&storage).shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn starting_twice_is_rejected() {
        let storage = MockDeliveryStorage::new();
        let mut engine = DeliveryEngine::new(
            Arc::new(storage.clone()),
            Arc::new(InMemorySharedStore::new(Arc::new(courier_core::RealClock::new()))),
            DeliveryConfig { poll_interval: Duration::from_millis(10), ..Default::default() },
            Arc::new(courier_core::RealClock::new()),
        )
        .unwrap();

        engine.start().await.unwrap();
        assert!(engine.start().await.is_err());
        engine.shutdown().await.unwrap();
    }
}
