//! Admission and execution of deliveries.
//!
//! A trigger passes through idempotency, subscription, circuit, rate-limit
//! and transformation gates before a pending record is persisted. The retry
//! poller then claims due records and runs one attempt each:
//!
//! 1. **Claim** - due pending records are leased so no other poller takes them
//! 2. **Circuit check** - an open circuit defers the attempt without using it
//! 3. **Sign and send** - the stored payload is signed and POSTed
//! 4. **Record** - the attempt and the record transition are written together,
//!    guarded by the attempt count
//! 5. **Report** - the breaker learns the outcome; failures that spent the
//!    attempt budget go to the dead letter queue in the same write as the
//!    final attempt
//!
//! Claimed attempts run on a task tracker, so the poller returns as soon as
//! they are dispatched.
//!
//! The first attempt of a delivery goes through the same path as every retry.

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use courier_core::{
    AttemptOutcome, Clock, DeadLetterId, DeliveryAttemptRecord, DeliveryId, DeliveryRecord, DeliveryStatus,
    DeliveryTransition, PayloadSnapshot, Subscription, SubscriptionId,
};
use courier_signing::SignatureService;
use serde_json::Value;
use tokio::sync::{Notify, RwLock, Semaphore};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    circuit::{CircuitBreakerManager, CircuitState},
    client::{DeliveryClient, DeliveryRequest, DeliveryResponse},
    dead_letter::DeadLetterStore,
    engine::DeliveryConfig,
    error::{DeliveryError, Result},
    idempotency::IdempotencyGuard,
    rate_limit::RateLimiter,
    retry::{RetryContext, RetryDecision, RetryPolicy},
    shared_store::SharedStore,
    stats::EngineStats,
    storage::DeliveryStorage,
    transform::PayloadTransformer,
};

/// What happened to a trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// A pending delivery was persisted.
    Scheduled {
        /// The new record
        delivery_id: DeliveryId,
    },
    /// The idempotency key was already used for this subscription.
    Duplicate,
    /// The subscription is inactive.
    Inactive,
    /// The subscription's circuit is open.
    CircuitOpen,
    /// The subscription's token bucket is empty.
    RateLimited,
    /// The payload could not be transformed for the subscription.
    TransformFailed {
        /// Transformation error message
        error: String,
    },
}

impl TriggerOutcome {
    /// Delivery created by the trigger, if any.
    pub fn delivery_id(&self) -> Option<DeliveryId> {
        match self {
            Self::Scheduled { delivery_id } => Some(*delivery_id),
            _ => None,
        }
    }

    /// Whether a delivery was created.
    pub fn is_scheduled(&self) -> bool {
        matches!(self, Self::Scheduled { .. })
    }
}

/// What happened to one claimed delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptDisposition {
    /// The subscriber accepted the delivery.
    Delivered,
    /// The attempt failed and another is scheduled.
    RetryScheduled {
        /// When the next attempt becomes due
        next_retry_at: DateTime<Utc>,
    },
    /// The delivery permanently failed.
    DeadLettered,
    /// The circuit was open; the attempt was postponed without being used.
    Deferred {
        /// New due time
        until: DateTime<Utc>,
    },
    /// The record was not pending.
    Skipped,
    /// Another executor already recorded this attempt.
    Stale,
}

struct AttemptResult {
    outcome: AttemptOutcome,
    http_status: Option<u16>,
    duration: Duration,
    error: Option<DeliveryError>,
    retry_after: Option<Duration>,
}

impl AttemptResult {
    fn from_response(response: &DeliveryResponse) -> Self {
        Self {
            outcome: if response.is_success { AttemptOutcome::Success } else { AttemptOutcome::HttpError },
            http_status: Some(response.status_code),
            duration: response.duration,
            error: response.error(),
            retry_after: response.retry_after_seconds().map(Duration::from_secs),
        }
    }

    fn from_error(error: DeliveryError, duration: Duration) -> Self {
        let outcome = match error {
            DeliveryError::Timeout { .. } => AttemptOutcome::Timeout,
            _ => AttemptOutcome::ConnectionError,
        };
        Self { outcome, http_status: None, duration, error: Some(error), retry_after: None }
    }
}

/// Runs the delivery pipeline for every subscription.
pub struct DeliveryOrchestrator {
    storage: Arc<dyn DeliveryStorage>,
    client: DeliveryClient,
    signer: SignatureService,
    circuit: CircuitBreakerManager,
    rate_limiter: RateLimiter,
    idempotency: IdempotencyGuard,
    transformer: PayloadTransformer,
    dead_letters: DeadLetterStore,
    policy: RetryPolicy,
    stats: Arc<RwLock<EngineStats>>,
    clock: Arc<dyn Clock>,
    wake: Notify,
    permits: Arc<Semaphore>,
    attempts: TaskTracker,
    claim_batch_size: usize,
    claim_lease: Duration,
}

impl DeliveryOrchestrator {
    /// Wires the pipeline from configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError` if the HTTP client cannot be built.
    pub fn new(
        storage: Arc<dyn DeliveryStorage>,
        store: Arc<dyn SharedStore>,
        config: &DeliveryConfig,
        clock: Arc<dyn Clock>,
        stats: Arc<RwLock<EngineStats>>,
    ) -> Result<Self> {
        let client = DeliveryClient::new(&config.client)?;

        Ok(Self {
            circuit: CircuitBreakerManager::new(config.circuit.clone(), store.clone(), clock.clone()),
            rate_limiter: RateLimiter::new(store.clone(), clock.clone()),
            idempotency: IdempotencyGuard::new(store, config.idempotency_ttl),
            transformer: PayloadTransformer::default(),
            dead_letters: DeadLetterStore::new(storage.clone(), clock.clone()),
            signer: SignatureService::default(),
            policy: config.retry.clone(),
            permits: Arc::new(Semaphore::new(config.worker_count.max(1))),
            attempts: TaskTracker::new(),
            claim_batch_size: config.claim_batch_size.max(1),
            claim_lease: config.claim_lease,
            wake: Notify::new(),
            storage,
            client,
            stats,
            clock,
        })
    }

    /// Circuit breakers shared with the engine.
    pub fn circuit(&self) -> &CircuitBreakerManager {
        &self.circuit
    }

    /// Dead letter store shared with the engine.
    pub fn dead_letters(&self) -> &DeadLetterStore {
        &self.dead_letters
    }

    /// Maximum records claimed per poll.
    pub fn claim_batch_size(&self) -> usize {
        self.claim_batch_size
    }

    /// Resolves when a trigger has scheduled new work.
    pub async fn notified(&self) {
        self.wake.notified().await;
    }

    /// Admits one event for one subscription.
    ///
    /// # Errors
    ///
    /// - `SubscriptionNotFound` for an unknown subscription
    /// - `Signing` if the subscription's key material is unusable
    /// - `DatabaseError` if the record cannot be persisted
    pub async fn trigger(
        &self,
        subscription_id: SubscriptionId,
        event_type: &str,
        payload: Value,
        idempotency_key: Option<&str>,
    ) -> Result<TriggerOutcome> {
        if let Some(key) = idempotency_key {
            if !self.idempotency.check_and_mark(subscription_id, key).await {
                debug!(subscription_id = %subscription_id, idempotency_key = key, "duplicate trigger ignored");
                self.stats.write().await.duplicates_ignored += 1;
                return Ok(TriggerOutcome::Duplicate);
            }
        }

        let subscription = self.load_subscription(subscription_id).await?;
        if !subscription.is_active {
            debug!(subscription_id = %subscription_id, "subscription inactive, trigger ignored");
            return Ok(TriggerOutcome::Inactive);
        }

        self.admit(&subscription, event_type, payload, idempotency_key.map(str::to_string), true).await
    }

    /// Re-admits a dead-lettered payload as a new delivery.
    ///
    /// The stored payload was already transformed and is sent as is. The
    /// entry is stamped as replayed only when a delivery was scheduled.
    ///
    /// # Errors
    ///
    /// - `DeadLetterNotFound` or `DeadLetterArchived` for the entry
    /// - `SubscriptionNotFound` if the subscription was deleted
    pub async fn replay_dead_letter(&self, entry_id: DeadLetterId) -> Result<TriggerOutcome> {
        let entry = self.dead_letters.get(entry_id).await?;
        if entry.archived {
            return Err(DeliveryError::DeadLetterArchived { id: entry_id.to_string() });
        }

        let subscription = self.load_subscription(entry.subscription_id).await?;
        if !subscription.is_active {
            return Ok(TriggerOutcome::Inactive);
        }

        let key = format!("replay:{entry_id}:{}", Uuid::new_v4());
        self.idempotency.check_and_mark(subscription.id, &key).await;

        let outcome = self.admit(&subscription, &entry.event_type, entry.payload.into_data(), Some(key), false).await?;
        if outcome.is_scheduled() {
            self.dead_letters.mark_replayed(entry_id).await?;
        }
        Ok(outcome)
    }

    async fn load_subscription(&self, subscription_id: SubscriptionId) -> Result<Subscription> {
        self.storage
            .find_subscription(subscription_id)
            .await?
            .ok_or_else(|| DeliveryError::subscription_not_found(subscription_id))
    }

    async fn admit(
        &self,
        subscription: &Subscription,
        event_type: &str,
        payload: Value,
        idempotency_key: Option<String>,
        transform: bool,
    ) -> Result<TriggerOutcome> {
        if self.circuit.get_status(subscription.id).await == CircuitState::Open {
            debug!(subscription_id = %subscription.id, event_type, "circuit open, trigger rejected");
            self.stats.write().await.circuit_rejections += 1;
            return Ok(TriggerOutcome::CircuitOpen);
        }

        if !self.rate_limiter.allow_subscription(subscription).await {
            info!(subscription_id = %subscription.id, event_type, "rate limit exceeded, trigger dropped");
            self.stats.write().await.rate_limited += 1;
            return Ok(TriggerOutcome::RateLimited);
        }

        subscription.signing.signing_key()?;

        let payload = if transform {
            match self.transformer.apply(subscription, &payload) {
                Ok(transformed) => transformed,
                Err(e) => {
                    warn!(
                        subscription_id = %subscription.id,
                        event_type,
                        error = %e,
                        "payload transformation failed, trigger dropped"
                    );
                    self.stats.write().await.transform_failures += 1;
                    return Ok(TriggerOutcome::TransformFailed { error: e.to_string() });
                },
            }
        } else {
            payload
        };

        let record = DeliveryRecord::pending(
            subscription.id,
            event_type,
            PayloadSnapshot::new(payload),
            idempotency_key,
            self.clock.now_utc(),
        );
        let delivery_id = self.storage.create_delivery(record).await?;

        debug!(
            delivery_id = %delivery_id,
            subscription_id = %subscription.id,
            event_type,
            "delivery scheduled"
        );
        self.stats.write().await.deliveries_scheduled += 1;
        self.wake.notify_one();

        Ok(TriggerOutcome::Scheduled { delivery_id })
    }

    /// Claims due deliveries and starts their attempts in the background.
    ///
    /// Never claims more records than there are idle workers, so a slow
    /// subscriber ties up only the workers running its own attempts.
    /// Returns the number of records claimed without waiting for the
    /// attempts; see [`Self::wait_for_attempts`].
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError` if claiming fails. Failures of individual
    /// attempts are logged; their lease expires and they become due again.
    pub async fn dispatch_due(self: &Arc<Self>) -> Result<usize> {
        let capacity = self.permits.available_permits().min(self.claim_batch_size);
        if capacity == 0 {
            return Ok(0);
        }

        let now = self.clock.now_utc();
        let lease = chrono::Duration::from_std(self.claim_lease).unwrap_or_else(|_| chrono::Duration::seconds(60));
        let records = self.storage.claim_due_deliveries(now, now + lease, capacity).await?;
        let claimed = records.len();

        if claimed > 0 {
            debug!(claimed, capacity, "claimed due deliveries");
        }

        // Idle workers capped the claim, so more may be due; each finished
        // attempt wakes the poller to claim it.
        let refill = claimed == capacity && capacity < self.claim_batch_size;

        for record in records {
            let permit = self
                .permits
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| DeliveryError::internal(format!("attempt permits closed: {e}")))?;
            let this = Arc::clone(self);

            self.attempts.spawn(async move {
                let delivery_id = record.id;
                if let Err(e) = this.run_attempt(record).await {
                    error!(delivery_id = %delivery_id, error = %e, "delivery attempt failed to complete");
                }
                drop(permit);
                if refill {
                    this.wake.notify_one();
                }
            });
        }

        Ok(claimed)
    }

    /// Claims due deliveries and waits until their attempts have finished.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError` if claiming fails.
    pub async fn process_due(self: &Arc<Self>) -> Result<usize> {
        let claimed = self.dispatch_due().await?;
        self.wait_for_attempts().await;
        Ok(claimed)
    }

    /// Waits until every attempt started so far has finished.
    pub async fn wait_for_attempts(&self) {
        self.attempts.close();
        self.attempts.wait().await;
        self.attempts.reopen();
    }

    /// Attempts currently running.
    pub fn running_attempts(&self) -> usize {
        self.attempts.len()
    }

    /// Runs the next attempt of a delivery.
    ///
    /// # Errors
    ///
    /// - `DeliveryNotFound` for an unknown delivery
    /// - `DatabaseError` if the outcome cannot be recorded
    pub async fn execute_attempt(&self, delivery_id: DeliveryId) -> Result<AttemptDisposition> {
        let record = self
            .storage
            .find_delivery(delivery_id)
            .await?
            .ok_or_else(|| DeliveryError::DeliveryNotFound { delivery_id: delivery_id.to_string() })?;
        self.run_attempt(record).await
    }

    async fn run_attempt(&self, record: DeliveryRecord) -> Result<AttemptDisposition> {
        if record.status != DeliveryStatus::Pending {
            debug!(delivery_id = %record.id, status = ?record.status, "delivery no longer pending, skipping");
            return Ok(AttemptDisposition::Skipped);
        }

        let Some(subscription) = self.storage.find_subscription(record.subscription_id).await? else {
            let error = DeliveryError::subscription_not_found(record.subscription_id);
            return self.fail_before_send(record, &error).await;
        };

        if self.circuit.get_status(subscription.id).await == CircuitState::Open {
            return self.defer(&record).await;
        }

        let attempt_number = record.next_attempt_number();
        let request = match self.build_request(&record, &subscription, attempt_number) {
            Ok(request) => request,
            Err(e) => return self.fail_before_send(record, &e).await,
        };

        debug!(
            delivery_id = %record.id,
            subscription_id = %subscription.id,
            attempt = attempt_number,
            "attempting delivery"
        );

        self.stats.write().await.in_flight_attempts += 1;
        let started = std::time::Instant::now();
        let result = match self.client.deliver(request).await {
            Ok(response) => AttemptResult::from_response(&response),
            Err(e) => AttemptResult::from_error(e, started.elapsed()),
        };
        {
            let mut stats = self.stats.write().await;
            stats.in_flight_attempts = stats.in_flight_attempts.saturating_sub(1);
            stats.attempts_executed += 1;
        }

        self.process_result(record, &subscription, attempt_number, result).await
    }

    fn build_request(
        &self,
        record: &DeliveryRecord,
        subscription: &Subscription,
        attempt_number: u32,
    ) -> Result<DeliveryRequest> {
        let body = record
            .payload
            .to_body()
            .map_err(|e| DeliveryError::internal(format!("payload serialization failed: {e}")))?;
        let key = subscription.signing.signing_key()?;
        let signature = self.signer.signature_header(&body, &key, self.clock.unix_seconds())?;

        Ok(DeliveryRequest {
            delivery_id: record.id,
            subscription_id: subscription.id,
            url: subscription.url.clone(),
            event_type: record.event_type.clone(),
            body: Bytes::from(body),
            signature: signature.to_string(),
            attempt_number,
            idempotency_key: record.idempotency_key.clone(),
            timeout: self.policy.timeout_for_attempt(attempt_number),
        })
    }

    async fn defer(&self, record: &DeliveryRecord) -> Result<AttemptDisposition> {
        let now = self.clock.now_utc();
        let reset = chrono::Duration::from_std(self.circuit.config().reset_timeout)
            .unwrap_or_else(|_| chrono::Duration::seconds(30));
        let until = now + reset;

        if !self.storage.reschedule_delivery(record.id, record.attempt_count, until, now).await? {
            return Ok(AttemptDisposition::Stale);
        }

        debug!(
            delivery_id = %record.id,
            subscription_id = %record.subscription_id,
            until = %until,
            "circuit open, attempt deferred"
        );
        self.stats.write().await.circuit_rejections += 1;
        Ok(AttemptDisposition::Deferred { until })
    }

    async fn fail_before_send(&self, record: DeliveryRecord, error: &DeliveryError) -> Result<AttemptDisposition> {
        warn!(
            delivery_id = %record.id,
            subscription_id = %record.subscription_id,
            error = %error,
            "delivery cannot be sent"
        );

        let attempt_number = record.next_attempt_number();
        let result = AttemptResult {
            outcome: AttemptOutcome::ConnectionError,
            http_status: None,
            duration: Duration::ZERO,
            error: Some(error.clone()),
            retry_after: None,
        };
        let attempt = attempt_record(record.id, attempt_number, &result, self.clock.now_utc());

        if !self.dead_letter(&record, attempt, &error.to_string()).await? {
            return Ok(AttemptDisposition::Stale);
        }
        Ok(AttemptDisposition::DeadLettered)
    }

    /// Records an attempt outcome and decides what happens next.
    ///
    /// Nothing is reported to the breaker when another executor already
    /// recorded this attempt.
    async fn process_result(
        &self,
        record: DeliveryRecord,
        subscription: &Subscription,
        attempt_number: u32,
        result: AttemptResult,
    ) -> Result<AttemptDisposition> {
        let now = self.clock.now_utc();
        let attempt = attempt_record(record.id, attempt_number, &result, now);

        let transition = match &result.error {
            None => DeliveryTransition::Succeeded,
            Some(error) => {
                let context = RetryContext::new(attempt_number, subscription.max_retries, error.clone(), now);
                match context.decide_retry(&self.policy) {
                    RetryDecision::Retry { next_attempt_at } => DeliveryTransition::Retry {
                        next_retry_at: self.honor_retry_after(next_attempt_at, result.retry_after, now),
                        error: error.to_string(),
                    },
                    RetryDecision::GiveUp { reason } => DeliveryTransition::Failed { error: reason },
                }
            },
        };

        let applied = match &transition {
            DeliveryTransition::Failed { error } => self.dead_letter(&record, attempt, error).await?,
            _ => self.storage.complete_attempt(record.id, attempt, transition.clone(), now).await?,
        };
        if !applied {
            debug!(
                delivery_id = %record.id,
                attempt = attempt_number,
                "attempt already recorded elsewhere, discarding result"
            );
            return Ok(AttemptDisposition::Stale);
        }

        match transition {
            DeliveryTransition::Succeeded => {
                self.circuit.record_success(subscription.id).await;
                self.stats.write().await.successful_deliveries += 1;
                info!(
                    delivery_id = %record.id,
                    subscription_id = %subscription.id,
                    attempt = attempt_number,
                    duration_ms = result.duration.as_millis(),
                    "delivery succeeded"
                );
                Ok(AttemptDisposition::Delivered)
            },
            DeliveryTransition::Retry { next_retry_at, error } => {
                self.circuit.record_failure(subscription.id).await;
                self.stats.write().await.retries_scheduled += 1;
                warn!(
                    delivery_id = %record.id,
                    subscription_id = %subscription.id,
                    attempt = attempt_number,
                    next_retry_at = %next_retry_at,
                    error = %error,
                    "delivery attempt failed, retry scheduled"
                );
                Ok(AttemptDisposition::RetryScheduled { next_retry_at })
            },
            DeliveryTransition::Failed { error } => {
                self.circuit.record_failure(subscription.id).await;
                warn!(
                    delivery_id = %record.id,
                    subscription_id = %subscription.id,
                    attempt = attempt_number,
                    error = %error,
                    "delivery permanently failed"
                );
                Ok(AttemptDisposition::DeadLettered)
            },
        }
    }

    /// Records the final attempt together with the dead letter. Returns
    /// `false` if the attempt was already recorded elsewhere.
    async fn dead_letter(
        &self,
        record: &DeliveryRecord,
        attempt: DeliveryAttemptRecord,
        error: &str,
    ) -> Result<bool> {
        if self.dead_letters.store(record, attempt, error).await?.is_none() {
            return Ok(false);
        }
        self.stats.write().await.dead_lettered += 1;
        Ok(true)
    }

    /// Later of the backoff and the subscriber's `Retry-After`, which is
    /// capped at the maximum backoff delay.
    fn honor_retry_after(
        &self,
        backoff_at: DateTime<Utc>,
        retry_after: Option<Duration>,
        now: DateTime<Utc>,
    ) -> DateTime<Utc> {
        let Some(hint) = retry_after else {
            return backoff_at;
        };
        let hint = hint.min(self.policy.max_delay);
        chrono::Duration::from_std(hint).map_or(backoff_at, |hint| backoff_at.max(now + hint))
    }
}

fn attempt_record(
    delivery_id: DeliveryId,
    attempt_number: u32,
    result: &AttemptResult,
    now: DateTime<Utc>,
) -> DeliveryAttemptRecord {
    DeliveryAttemptRecord {
        id: Uuid::new_v4(),
        delivery_id,
        attempt_number,
        outcome: result.outcome,
        http_status: result.http_status,
        duration_ms: u64::try_from(result.duration.as_millis()).unwrap_or(u64::MAX),
        error: result.error.as_ref().map(ToString::to_string),
        attempted_at: now,
    }
}
