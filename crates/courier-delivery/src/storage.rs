//! Storage abstraction layer for the delivery engine.
//!
//! The engine talks to durable storage only through [`DeliveryStorage`].
//! Production wraps `courier_core::storage::Storage` (PostgreSQL); tests use
//! [`mock::MockDeliveryStorage`], which enforces the same guards in memory.

use std::{future::Future, pin::Pin, sync::Arc};

use chrono::{DateTime, Utc};
use courier_core::{
    error::Result,
    DeadLetterEntry, DeadLetterId, DeadLetterQuery, DeliveryAttemptRecord, DeliveryId, DeliveryRecord,
    DeliveryTransition, Subscription, SubscriptionId, SubscriptionStats,
};

/// Boxed future returned by storage operations.
pub type StorageFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Durable operations required by the delivery engine.
///
/// Every mutation of a delivery record is guarded by its status and attempt
/// count so concurrent or repeated processing cannot apply twice.
pub trait DeliveryStorage: Send + Sync + 'static {
    /// Finds a subscription by id.
    fn find_subscription(&self, id: SubscriptionId) -> StorageFuture<'_, Option<Subscription>>;

    /// Lists active subscriptions.
    fn find_active_subscriptions(&self) -> StorageFuture<'_, Vec<Subscription>>;

    /// Persists a new delivery record.
    fn create_delivery(&self, record: DeliveryRecord) -> StorageFuture<'_, DeliveryId>;

    /// Finds a delivery record by id.
    fn find_delivery(&self, id: DeliveryId) -> StorageFuture<'_, Option<DeliveryRecord>>;

    /// Claims up to `limit` pending records due at `now`.
    ///
    /// Claimed records have `next_retry_at` pushed to `lease_until`, so no
    /// other poller claims them while the attempt runs.
    fn claim_due_deliveries(
        &self,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
        limit: usize,
    ) -> StorageFuture<'_, Vec<DeliveryRecord>>;

    /// Appends the attempt and applies the transition atomically.
    ///
    /// Returns `false` and writes nothing if the record is no longer pending
    /// with `attempt.attempt_number - 1` attempts.
    fn complete_attempt(
        &self,
        delivery_id: DeliveryId,
        attempt: DeliveryAttemptRecord,
        transition: DeliveryTransition,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, bool>;

    /// Appends the final attempt, marks the record `Failed` and stores its
    /// dead letter atomically.
    ///
    /// Returns `None` and writes nothing if the record is no longer pending
    /// with `attempt.attempt_number - 1` attempts. If the dead letter cannot
    /// be written, neither can the rest.
    fn fail_delivery(
        &self,
        delivery_id: DeliveryId,
        attempt: DeliveryAttemptRecord,
        entry: DeadLetterEntry,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, Option<DeadLetterEntry>>;

    /// Moves a pending record's due time without consuming an attempt.
    fn reschedule_delivery(
        &self,
        id: DeliveryId,
        expected_attempt_count: u32,
        next_retry_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, bool>;

    /// Lists attempts for a delivery in attempt order.
    fn find_attempts(&self, delivery_id: DeliveryId) -> StorageFuture<'_, Vec<DeliveryAttemptRecord>>;

    /// Finds a dead letter by id.
    fn find_dead_letter(&self, id: DeadLetterId) -> StorageFuture<'_, Option<DeadLetterEntry>>;

    /// Lists dead letters, newest first.
    fn list_dead_letters(&self, query: DeadLetterQuery) -> StorageFuture<'_, Vec<DeadLetterEntry>>;

    /// Stamps `replayed_at`. Returns whether the entry exists.
    fn mark_dead_letter_replayed(&self, id: DeadLetterId, at: DateTime<Utc>) -> StorageFuture<'_, bool>;

    /// Archives an entry. Returns whether the entry exists.
    fn archive_dead_letter(&self, id: DeadLetterId) -> StorageFuture<'_, bool>;

    /// Aggregates attempts made since `since`.
    fn subscription_stats(
        &self,
        subscription_id: SubscriptionId,
        since: DateTime<Utc>,
        window_secs: u64,
    ) -> StorageFuture<'_, SubscriptionStats>;
}

/// Production storage implementation using PostgreSQL.
pub struct PostgresDeliveryStorage {
    storage: Arc<courier_core::storage::Storage>,
}

impl PostgresDeliveryStorage {
    /// Creates a new PostgreSQL storage adapter.
    pub fn new(storage: Arc<courier_core::storage::Storage>) -> Self {
        Self { storage }
    }
}

impl DeliveryStorage for PostgresDeliveryStorage {
    fn find_subscription(&self, id: SubscriptionId) -> StorageFuture<'_, Option<Subscription>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.subscriptions.find_by_id(id).await })
    }

    fn find_active_subscriptions(&self) -> StorageFuture<'_, Vec<Subscription>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.subscriptions.find_active().await })
    }

    fn create_delivery(&self, record: DeliveryRecord) -> StorageFuture<'_, DeliveryId> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.deliveries.create(&record).await })
    }

    fn find_delivery(&self, id: DeliveryId) -> StorageFuture<'_, Option<DeliveryRecord>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.deliveries.find_by_id(id).await })
    }

    fn claim_due_deliveries(
        &self,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
        limit: usize,
    ) -> StorageFuture<'_, Vec<DeliveryRecord>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.deliveries.claim_due(now, lease_until, limit).await })
    }

    fn complete_attempt(
        &self,
        delivery_id: DeliveryId,
        attempt: DeliveryAttemptRecord,
        transition: DeliveryTransition,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, bool> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.complete_attempt(delivery_id, &attempt, &transition, now).await })
    }

    fn fail_delivery(
        &self,
        delivery_id: DeliveryId,
        attempt: DeliveryAttemptRecord,
        entry: DeadLetterEntry,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, Option<DeadLetterEntry>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.fail_delivery(delivery_id, &attempt, &entry, now).await })
    }

    fn reschedule_delivery(
        &self,
        id: DeliveryId,
        expected_attempt_count: u32,
        next_retry_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, bool> {
        let storage = self.storage.clone();
        Box::pin(async move {
            storage.deliveries.reschedule(id, expected_attempt_count, next_retry_at, now).await
        })
    }

    fn find_attempts(&self, delivery_id: DeliveryId) -> StorageFuture<'_, Vec<DeliveryAttemptRecord>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.delivery_attempts.find_by_delivery(delivery_id).await })
    }

    fn find_dead_letter(&self, id: DeadLetterId) -> StorageFuture<'_, Option<DeadLetterEntry>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.dead_letters.find_by_id(id).await })
    }

    fn list_dead_letters(&self, query: DeadLetterQuery) -> StorageFuture<'_, Vec<DeadLetterEntry>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.dead_letters.list(&query).await })
    }

    fn mark_dead_letter_replayed(&self, id: DeadLetterId, at: DateTime<Utc>) -> StorageFuture<'_, bool> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.dead_letters.mark_replayed(id, at).await })
    }

    fn archive_dead_letter(&self, id: DeadLetterId) -> StorageFuture<'_, bool> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.dead_letters.archive(id).await })
    }

    fn subscription_stats(
        &self,
        subscription_id: SubscriptionId,
        since: DateTime<Utc>,
        window_secs: u64,
    ) -> StorageFuture<'_, SubscriptionStats> {
        let storage = self.storage.clone();
        Box::pin(async move {
            storage.delivery_attempts.stats_for_subscription(subscription_id, since, window_secs).await
        })
    }
}

pub mod mock {
    //! In-memory storage for testing delivery logic without a database.
    //!
    //! Applies the same status and attempt-count guards as the PostgreSQL
    //! repositories and supports injecting failures.

    use std::{collections::HashMap, sync::Arc};

    use chrono::{DateTime, Utc};
    use courier_core::{
        error::{CoreError, Result},
        AttemptOutcome, DeadLetterEntry, DeadLetterId, DeadLetterQuery, DeliveryAttemptRecord, DeliveryId,
        DeliveryRecord, DeliveryStatus, DeliveryTransition, Subscription, SubscriptionId, SubscriptionStats,
    };
    use tokio::sync::RwLock;

    use super::{DeliveryStorage, StorageFuture};

    /// Mock storage for testing delivery logic without database.
    #[derive(Clone, Default)]
    pub struct MockDeliveryStorage {
        subscriptions: Arc<RwLock<HashMap<SubscriptionId, Subscription>>>,
        deliveries: Arc<RwLock<HashMap<DeliveryId, DeliveryRecord>>>,
        attempts: Arc<RwLock<Vec<DeliveryAttemptRecord>>>,
        dead_letters: Arc<RwLock<Vec<DeadLetterEntry>>>,
        claim_error: Arc<RwLock<Option<String>>>,
        create_error: Arc<RwLock<Option<String>>>,
        dead_letter_error: Arc<RwLock<Option<String>>>,
    }

    impl MockDeliveryStorage {
        /// Creates a new mock storage with empty state.
        pub fn new() -> Self {
            Self::default()
        }

        /// Adds or replaces a subscription.
        pub async fn add_subscription(&self, subscription: Subscription) {
            self.subscriptions.write().await.insert(subscription.id, subscription);
        }

        /// Replaces a subscription's active flag.
        pub async fn set_subscription_active(&self, id: SubscriptionId, is_active: bool) {
            if let Some(subscription) = self.subscriptions.write().await.get_mut(&id) {
                subscription.is_active = is_active;
            }
        }

        /// Injects an error for the next claim operation.
        pub async fn inject_claim_error(&self, error: impl Into<String>) {
            *self.claim_error.write().await = Some(error.into());
        }

        /// Injects an error for the next delivery insert.
        pub async fn inject_create_error(&self, error: impl Into<String>) {
            *self.create_error.write().await = Some(error.into());
        }

        /// Injects an error for the next dead letter write.
        pub async fn inject_dead_letter_error(&self, error: impl Into<String>) {
            *self.dead_letter_error.write().await = Some(error.into());
        }

        /// All deliveries for a subscription, oldest first.
        pub async fn deliveries_for(&self, subscription_id: SubscriptionId) -> Vec<DeliveryRecord> {
            let mut records: Vec<DeliveryRecord> = self
                .deliveries
                .read()
                .await
                .values()
                .filter(|record| record.subscription_id == subscription_id)
                .cloned()
                .collect();
            records.sort_by_key(|record| record.created_at);
            records
        }

        /// Number of stored deliveries.
        pub async fn delivery_count(&self) -> usize {
            self.deliveries.read().await.len()
        }

        /// All recorded attempts in insertion order.
        pub async fn recorded_attempts(&self) -> Vec<DeliveryAttemptRecord> {
            self.attempts.read().await.clone()
        }

        /// All dead letters in insertion order.
        pub async fn dead_letters(&self) -> Vec<DeadLetterEntry> {
            self.dead_letters.read().await.clone()
        }

        /// Overwrites a stored delivery record.
        pub async fn put_delivery(&self, record: DeliveryRecord) {
            self.deliveries.write().await.insert(record.id, record);
        }

        /// Guarded attempt write shared by `complete_attempt` and
        /// `fail_delivery`. `None` means the guard rejected the attempt;
        /// every check runs before anything is mutated.
        async fn apply_attempt(
            &self,
            delivery_id: DeliveryId,
            attempt: DeliveryAttemptRecord,
            transition: &DeliveryTransition,
            dead_letter: Option<DeadLetterEntry>,
            now: DateTime<Utc>,
        ) -> Result<Option<Option<DeadLetterEntry>>> {
            let mut deliveries = self.deliveries.write().await;
            let Some(record) = deliveries.get_mut(&delivery_id) else {
                return Ok(None);
            };
            if record.status != DeliveryStatus::Pending
                || record.attempt_count != attempt.attempt_number.saturating_sub(1)
            {
                return Ok(None);
            }

            let mut attempts = self.attempts.write().await;
            if attempts
                .iter()
                .any(|a| a.delivery_id == delivery_id && a.attempt_number == attempt.attempt_number)
            {
                return Err(CoreError::ConstraintViolation(format!(
                    "attempt {} already recorded for {delivery_id}",
                    attempt.attempt_number
                )));
            }

            let stored = match dead_letter {
                Some(entry) => {
                    if let Some(error) = self.dead_letter_error.write().await.take() {
                        return Err(CoreError::Database(error));
                    }
                    let mut dead_letters = self.dead_letters.write().await;
                    let stored = match dead_letters.iter().find(|e| e.delivery_id == entry.delivery_id) {
                        Some(existing) => existing.clone(),
                        None => {
                            dead_letters.push(entry.clone());
                            entry
                        },
                    };
                    Some(stored)
                },
                None => None,
            };

            record.status = transition.status();
            record.attempt_count = attempt.attempt_number;
            record.next_retry_at = transition.next_retry_at();
            if let Some(error) = transition.error() {
                record.last_error = Some(error.to_string());
            }
            record.updated_at = now;
            attempts.push(attempt);
            Ok(Some(stored))
        }
    }

    impl DeliveryStorage for MockDeliveryStorage {
        fn find_subscription(&self, id: SubscriptionId) -> StorageFuture<'_, Option<Subscription>> {
            let subscriptions = self.subscriptions.clone();
            Box::pin(async move { Ok(subscriptions.read().await.get(&id).cloned()) })
        }

        fn find_active_subscriptions(&self) -> StorageFuture<'_, Vec<Subscription>> {
            let subscriptions = self.subscriptions.clone();
            Box::pin(async move {
                let mut active: Vec<Subscription> =
                    subscriptions.read().await.values().filter(|s| s.is_active).cloned().collect();
                active.sort_by_key(|s| s.created_at);
                Ok(active)
            })
        }

        fn create_delivery(&self, record: DeliveryRecord) -> StorageFuture<'_, DeliveryId> {
            let deliveries = self.deliveries.clone();
            let create_error = self.create_error.clone();
            Box::pin(async move {
                if let Some(error) = create_error.write().await.take() {
                    return Err(CoreError::Database(error));
                }
                let mut deliveries = deliveries.write().await;
                if deliveries.contains_key(&record.id) {
                    return Err(CoreError::ConstraintViolation(format!(
                        "delivery {} already exists",
                        record.id
                    )));
                }
                let id = record.id;
                deliveries.insert(id, record);
                Ok(id)
            })
        }

        fn find_delivery(&self, id: DeliveryId) -> StorageFuture<'_, Option<DeliveryRecord>> {
            let deliveries = self.deliveries.clone();
            Box::pin(async move { Ok(deliveries.read().await.get(&id).cloned()) })
        }

        fn claim_due_deliveries(
            &self,
            now: DateTime<Utc>,
            lease_until: DateTime<Utc>,
            limit: usize,
        ) -> StorageFuture<'_, Vec<DeliveryRecord>> {
            let deliveries = self.deliveries.clone();
            let claim_error = self.claim_error.clone();
            Box::pin(async move {
                if let Some(error) = claim_error.write().await.take() {
                    return Err(CoreError::Database(error));
                }

                let mut deliveries = deliveries.write().await;
                let mut due: Vec<&mut DeliveryRecord> = deliveries
                    .values_mut()
                    .filter(|r| r.status == DeliveryStatus::Pending && r.next_retry_at.is_some_and(|at| at <= now))
                    .collect();
                due.sort_by_key(|r| r.next_retry_at);

                Ok(due
                    .into_iter()
                    .take(limit)
                    .map(|record| {
                        record.next_retry_at = Some(lease_until);
                        record.clone()
                    })
                    .collect())
            })
        }

        fn complete_attempt(
            &self,
            delivery_id: DeliveryId,
            attempt: DeliveryAttemptRecord,
            transition: DeliveryTransition,
            now: DateTime<Utc>,
        ) -> StorageFuture<'_, bool> {
            Box::pin(async move {
                let applied = self.apply_attempt(delivery_id, attempt, &transition, None, now).await?;
                Ok(applied.is_some())
            })
        }

        fn fail_delivery(
            &self,
            delivery_id: DeliveryId,
            attempt: DeliveryAttemptRecord,
            entry: DeadLetterEntry,
            now: DateTime<Utc>,
        ) -> StorageFuture<'_, Option<DeadLetterEntry>> {
            let transition = DeliveryTransition::Failed { error: entry.error.clone() };
            Box::pin(async move {
                Ok(self.apply_attempt(delivery_id, attempt, &transition, Some(entry), now).await?.flatten())
            })
        }

        fn reschedule_delivery(
            &self,
            id: DeliveryId,
            expected_attempt_count: u32,
            next_retry_at: DateTime<Utc>,
            now: DateTime<Utc>,
        ) -> StorageFuture<'_, bool> {
            let deliveries = self.deliveries.clone();
            Box::pin(async move {
                let mut deliveries = deliveries.write().await;
                match deliveries.get_mut(&id) {
                    Some(record)
                        if record.status == DeliveryStatus::Pending
                            && record.attempt_count == expected_attempt_count =>
                    {
                        record.next_retry_at = Some(next_retry_at);
                        record.updated_at = now;
                        Ok(true)
                    },
                    _ => Ok(false),
                }
            })
        }

        fn find_attempts(&self, delivery_id: DeliveryId) -> StorageFuture<'_, Vec<DeliveryAttemptRecord>> {
            let attempts = self.attempts.clone();
            Box::pin(async move {
                let mut found: Vec<DeliveryAttemptRecord> =
                    attempts.read().await.iter().filter(|a| a.delivery_id == delivery_id).cloned().collect();
                found.sort_by_key(|a| a.attempt_number);
                Ok(found)
            })
        }

        fn find_dead_letter(&self, id: DeadLetterId) -> StorageFuture<'_, Option<DeadLetterEntry>> {
            let dead_letters = self.dead_letters.clone();
            Box::pin(async move { Ok(dead_letters.read().await.iter().find(|e| e.id == id).cloned()) })
        }

        fn list_dead_letters(&self, query: DeadLetterQuery) -> StorageFuture<'_, Vec<DeadLetterEntry>> {
            let dead_letters = self.dead_letters.clone();
            Box::pin(async move {
                let mut entries: Vec<DeadLetterEntry> = dead_letters
                    .read()
                    .await
                    .iter()
                    .filter(|e| query.subscription_id.map_or(true, |id| e.subscription_id == id))
                    .filter(|e| query.include_archived || !e.archived)
                    .cloned()
                    .collect();
                entries.sort_by(|a, b| b.stored_at.cmp(&a.stored_at));
                Ok(entries.into_iter().skip(query.offset as usize).take(query.limit as usize).collect())
            })
        }

        fn mark_dead_letter_replayed(&self, id: DeadLetterId, at: DateTime<Utc>) -> StorageFuture<'_, bool> {
            let dead_letters = self.dead_letters.clone();
            Box::pin(async move {
                let mut dead_letters = dead_letters.write().await;
                let Some(entry) = dead_letters.iter_mut().find(|e| e.id == id) else {
                    return Ok(false);
                };
                entry.replayed_at = Some(at);
                Ok(true)
            })
        }

        fn archive_dead_letter(&self, id: DeadLetterId) -> StorageFuture<'_, bool> {
            let dead_letters = self.dead_letters.clone();
            Box::pin(async move {
                let mut dead_letters = dead_letters.write().await;
                let Some(entry) = dead_letters.iter_mut().find(|e| e.id == id) else {
                    return Ok(false);
                };
                entry.archived = true;
                Ok(true)
            })
        }

        fn subscription_stats(
            &self,
            subscription_id: SubscriptionId,
            since: DateTime<Utc>,
            window_secs: u64,
        ) -> StorageFuture<'_, SubscriptionStats> {
            let deliveries = self.deliveries.clone();
            let attempts = self.attempts.clone();
            Box::pin(async move {
                let deliveries = deliveries.read().await;
                let attempts = attempts.read().await;
                let in_window: Vec<&DeliveryAttemptRecord> = attempts
                    .iter()
                    .filter(|a| a.attempted_at >= since)
                    .filter(|a| deliveries.get(&a.delivery_id).is_some_and(|d| d.subscription_id == subscription_id))
                    .collect();

                let total_attempts = in_window.len() as u64;
                let successful_attempts =
                    in_window.iter().filter(|a| a.outcome == AttemptOutcome::Success).count() as u64;
                #[allow(clippy::cast_precision_loss)]
                let (success_rate, average_latency_ms) = if total_attempts == 0 {
                    (0.0, 0.0)
                } else {
                    let total_ms: u64 = in_window.iter().map(|a| a.duration_ms).sum();
                    (
                        successful_attempts as f64 / total_attempts as f64,
                        total_ms as f64 / total_attempts as f64,
                    )
                };

                Ok(SubscriptionStats {
                    subscription_id,
                    total_attempts,
                    successful_attempts,
                    success_rate,
                    average_latency_ms,
                    window_secs,
                })
            })
        }
    }

    #[cfg(test)]
    mod tests {
        use chrono::Duration;
        use courier_core::{PayloadSnapshot, SigningConfig};
        use serde_json::json;
        use uuid::Uuid;

        use super::*;

        fn pending(subscription_id: SubscriptionId, due: DateTime<Utc>) -> DeliveryRecord {
            DeliveryRecord::pending(subscription_id, "order.created", PayloadSnapshot::new(json!({})), None, due)
        }

        fn attempt(delivery_id: DeliveryId, attempt_number: u32, outcome: AttemptOutcome) -> DeliveryAttemptRecord {
            DeliveryAttemptRecord {
                id: Uuid::new_v4(),
                delivery_id,
                attempt_number,
                outcome,
                http_status: Some(200),
                duration_ms: 40,
                error: None,
                attempted_at: Utc::now(),
            }
        }

        #[tokio::test]
        async fn claim_leases_due_records_once() {
            let storage = MockDeliveryStorage::new();
            let now = Utc::now();
            let sub = SubscriptionId::new();
            storage.create_delivery(pending(sub, now - Duration::seconds(1))).await.unwrap();
            storage.create_delivery(pending(sub, now + Duration::seconds(60))).await.unwrap();

            let lease = now + Duration::seconds(30);
            let claimed = storage.claim_due_deliveries(now, lease, 10).await.unwrap();
            assert_eq!(claimed.len(), 1);
            assert_eq!(claimed[0].next_retry_at, Some(lease));

            assert!(storage.claim_due_deliveries(now, lease, 10).await.unwrap().is_empty());
        }

        #[tokio::test]
        async fn complete_attempt_is_guarded_by_attempt_count() {
            let storage = MockDeliveryStorage::new();
            let now = Utc::now();
            let id = storage.create_delivery(pending(SubscriptionId::new(), now)).await.unwrap();

            let applied = storage
                .complete_attempt(id, attempt(id, 1, AttemptOutcome::Success), DeliveryTransition::Succeeded, now)
                .await
                .unwrap();
            assert!(applied);

            let replay = storage
                .complete_attempt(id, attempt(id, 1, AttemptOutcome::Success), DeliveryTransition::Succeeded, now)
                .await
                .unwrap();
            assert!(!replay);

            let record = storage.find_delivery(id).await.unwrap().unwrap();
            assert_eq!(record.status, DeliveryStatus::Success);
            assert_eq!(record.attempt_count, 1);
            assert_eq!(record.next_retry_at, None);
            assert_eq!(storage.find_attempts(id).await.unwrap().len(), 1);
        }

        #[tokio::test]
        async fn failed_dead_letter_write_leaves_delivery_pending() {
            let storage = MockDeliveryStorage::new();
            let now = Utc::now();
            let record = pending(SubscriptionId::new(), now);
            let id = storage.create_delivery(record.clone()).await.unwrap();
            let entry = DeadLetterEntry::from_delivery(&record, "HTTP 500", now);

            storage.inject_dead_letter_error("disk full").await;
            let failed = attempt(id, 1, AttemptOutcome::HttpError);
            assert!(storage.fail_delivery(id, failed.clone(), entry.clone(), now).await.is_err());

            let record = storage.find_delivery(id).await.unwrap().unwrap();
            assert_eq!(record.status, DeliveryStatus::Pending);
            assert_eq!(record.attempt_count, 0);
            assert!(storage.find_attempts(id).await.unwrap().is_empty());
            assert!(storage.dead_letters().await.is_empty());

            assert!(storage.fail_delivery(id, failed, entry, now).await.unwrap().is_some());
            let record = storage.find_delivery(id).await.unwrap().unwrap();
            assert_eq!(record.status, DeliveryStatus::Failed);
            assert_eq!(record.last_error.as_deref(), Some("HTTP 500"));
            assert_eq!(storage.dead_letters().await.len(), 1);

            let duplicate = DeadLetterEntry::from_delivery(&record, "HTTP 503", now);
            let replay =
                storage.fail_delivery(id, attempt(id, 1, AttemptOutcome::HttpError), duplicate, now).await.unwrap();
            assert!(replay.is_none());
            assert_eq!(storage.dead_letters().await.len(), 1);
        }

        #[tokio::test]
        async fn stats_cover_only_the_subscription_and_window() {
            let storage = MockDeliveryStorage::new();
            let now = Utc::now();
            let sub = SubscriptionId::new();
            let id = storage.create_delivery(pending(sub, now)).await.unwrap();
            let other = storage.create_delivery(pending(SubscriptionId::new(), now)).await.unwrap();

            let mut failed = attempt(id, 1, AttemptOutcome::HttpError);
            failed.duration_ms = 100;
            let retry = DeliveryTransition::Retry { next_retry_at: now, error: "500".into() };
            storage.complete_attempt(id, failed, retry, now).await.unwrap();
            storage
                .complete_attempt(id, attempt(id, 2, AttemptOutcome::Success), DeliveryTransition::Succeeded, now)
                .await
                .unwrap();
            storage
                .complete_attempt(other, attempt(other, 1, AttemptOutcome::Success), DeliveryTransition::Succeeded, now)
                .await
                .unwrap();

            let stats = storage.subscription_stats(sub, now - Duration::hours(1), 3600).await.unwrap();
            assert_eq!(stats.total_attempts, 2);
            assert_eq!(stats.successful_attempts, 1);
            assert!((stats.success_rate - 0.5).abs() < f64::EPSILON);
            assert!((stats.average_latency_ms - 70.0).abs() < f64::EPSILON);
        }

        #[tokio::test]
        async fn only_active_subscriptions_are_listed() {
            let storage = MockDeliveryStorage::new();
            let active = Subscription::new("https://a.example", SigningConfig::hmac_sha256("k"));
            let mut inactive = Subscription::new("https://b.example", SigningConfig::hmac_sha256("k"));
            inactive.is_active = false;
            storage.add_subscription(active.clone()).await;
            storage.add_subscription(inactive).await;

            let listed = storage.find_active_subscriptions().await.unwrap();
            assert_eq!(listed.len(), 1);
            assert_eq!(listed[0].id, active.id);
        }
    }
}
