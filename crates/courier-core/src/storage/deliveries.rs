//! Repository for delivery lifecycle records.
//!
//! A record is created pending and due immediately, claimed by the retry
//! poller under a short lease, and moved by exactly one terminal transition.
//! Every update after creation is guarded on `status = 'pending'` and the
//! attempt count the caller observed.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{Executor, PgPool, Postgres, Transaction};

use crate::{
    error::Result,
    models::{DeliveryId, DeliveryRecord, DeliveryTransition, SubscriptionId},
};

/// Repository for delivery record operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Returns a reference to the database pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Inserts a new delivery record.
    ///
    /// # Errors
    ///
    /// Returns error if insert fails or the pending/next_retry_at check is
    /// violated.
    pub async fn create(&self, record: &DeliveryRecord) -> Result<DeliveryId> {
        self.create_impl(&*self.pool, record).await
    }

    /// Inserts a delivery record within a transaction.
    ///
    /// # Errors
    ///
    /// Returns error if insert fails.
    pub async fn create_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        record: &DeliveryRecord,
    ) -> Result<DeliveryId> {
        self.create_impl(&mut **tx, record).await
    }

    async fn create_impl<'e, E>(&self, executor: E, record: &DeliveryRecord) -> Result<DeliveryId>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let id = sqlx::query_scalar(
            r"
            INSERT INTO deliveries (
                id, subscription_id, event_type, payload, status, attempt_count,
                next_retry_at, idempotency_key, last_error, created_at, updated_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11
            )
            RETURNING id
            ",
        )
        .bind(record.id)
        .bind(record.subscription_id)
        .bind(&record.event_type)
        .bind(&record.payload)
        .bind(record.status)
        .bind(i32::try_from(record.attempt_count).unwrap_or(i32::MAX))
        .bind(record.next_retry_at)
        .bind(&record.idempotency_key)
        .bind(&record.last_error)
        .bind(record.created_at)
        .bind(record.updated_at)
        .fetch_one(executor)
        .await?;

        Ok(id)
    }

    /// Finds a delivery by ID.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_by_id(&self, id: DeliveryId) -> Result<Option<DeliveryRecord>> {
        let record = sqlx::query_as::<_, DeliveryRecord>(
            r"
            SELECT id, subscription_id, event_type, payload, status, attempt_count,
                   next_retry_at, idempotency_key, last_error, created_at, updated_at
            FROM deliveries
            WHERE id = $1
            ",
        )
        .bind(id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(record)
    }

    /// Lists a subscription's deliveries, newest first.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_by_subscription(
        &self,
        subscription_id: SubscriptionId,
        limit: Option<i64>,
    ) -> Result<Vec<DeliveryRecord>> {
        let records = sqlx::query_as::<_, DeliveryRecord>(
            r"
            SELECT id, subscription_id, event_type, payload, status, attempt_count,
                   next_retry_at, idempotency_key, last_error, created_at, updated_at
            FROM deliveries
            WHERE subscription_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            ",
        )
        .bind(subscription_id)
        .bind(limit.unwrap_or(100))
        .fetch_all(&*self.pool)
        .await?;

        Ok(records)
    }

    /// Claims due pending deliveries for dispatch.
    ///
    /// Uses `FOR UPDATE SKIP LOCKED` so concurrent pollers claim disjoint
    /// rows, then pushes `next_retry_at` to `lease_until`. A claimed record
    /// that is never completed becomes due again when the lease expires.
    ///
    /// # Errors
    ///
    /// Returns error if the transaction fails.
    pub async fn claim_due(
        &self,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DeliveryRecord>> {
        let mut tx = self.pool.begin().await?;

        let ids: Vec<DeliveryId> = sqlx::query_scalar(
            r"
            SELECT id FROM deliveries
            WHERE status = 'pending'
              AND next_retry_at <= $1
            ORDER BY next_retry_at ASC
            LIMIT $2
            FOR UPDATE SKIP LOCKED
            ",
        )
        .bind(now)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&mut *tx)
        .await?;

        if ids.is_empty() {
            tx.rollback().await?;
            return Ok(Vec::new());
        }

        let uuids: Vec<uuid::Uuid> = ids.iter().map(|id| id.0).collect();
        let records = sqlx::query_as::<_, DeliveryRecord>(
            r"
            UPDATE deliveries
            SET next_retry_at = $1
            WHERE id = ANY($2)
            RETURNING id, subscription_id, event_type, payload, status, attempt_count,
                      next_retry_at, idempotency_key, last_error, created_at, updated_at
            ",
        )
        .bind(lease_until)
        .bind(&uuids)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(records)
    }

    /// Applies the outcome of attempt `attempt_number` within a transaction.
    ///
    /// Returns `false` if the record is not pending or its attempt count is
    /// no longer `attempt_number - 1`.
    ///
    /// # Errors
    ///
    /// Returns error if update fails.
    pub async fn apply_transition_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: DeliveryId,
        attempt_number: u32,
        transition: &DeliveryTransition,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let expected = i32::try_from(attempt_number.saturating_sub(1)).unwrap_or(i32::MAX);
        let new_count = i32::try_from(attempt_number).unwrap_or(i32::MAX);

        let result = sqlx::query(
            r"
            UPDATE deliveries
            SET status = $1,
                attempt_count = $2,
                next_retry_at = $3,
                last_error = COALESCE($4, last_error),
                updated_at = $5
            WHERE id = $6
              AND status = 'pending'
              AND attempt_count = $7
            ",
        )
        .bind(transition.status())
        .bind(new_count)
        .bind(transition.next_retry_at())
        .bind(transition.error())
        .bind(now)
        .bind(id)
        .bind(expected)
        .execute(&mut **tx)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Moves a pending delivery's due time without consuming an attempt.
    ///
    /// Guarded like [`Repository::apply_transition_in_tx`]; returns `false`
    /// if the record moved on.
    ///
    /// # Errors
    ///
    /// Returns error if update fails.
    pub async fn reschedule(
        &self,
        id: DeliveryId,
        expected_attempt_count: u32,
        next_retry_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE deliveries
            SET next_retry_at = $1, updated_at = $2
            WHERE id = $3
              AND status = 'pending'
              AND attempt_count = $4
            ",
        )
        .bind(next_retry_at)
        .bind(now)
        .bind(id)
        .bind(i32::try_from(expected_attempt_count).unwrap_or(i32::MAX))
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Counts a subscription's deliveries.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn count_by_subscription(&self, subscription_id: SubscriptionId) -> Result<i64> {
        let count: (i64,) = sqlx::query_as(
            r"
            SELECT COUNT(*) FROM deliveries
            WHERE subscription_id = $1
            ",
        )
        .bind(subscription_id)
        .fetch_one(&*self.pool)
        .await?;

        Ok(count.0)
    }
}
