//! Repository for the attempt audit trail.
//!
//! One row per network call, never modified. `(delivery_id, attempt_number)`
//! is unique, which backs the guarantee that the attempt number sent in
//! `X-Attempt-Number` is the one persisted.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{Executor, PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::{
    error::Result,
    models::{DeliveryAttemptRecord, DeliveryId, SubscriptionId, SubscriptionStats},
};

/// Repository for delivery attempt database operations.
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

    /// Records an attempt.
    ///
    /// # Errors
    ///
    /// Returns error if insert fails or the attempt number already exists.
    pub async fn create(&self, attempt: &DeliveryAttemptRecord) -> Result<Uuid> {
        self.create_impl(&*self.pool, attempt).await
    }

    /// Records an attempt within a transaction.
    ///
    /// # Errors
    ///
    /// Returns error if insert fails.
    pub async fn create_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        attempt: &DeliveryAttemptRecord,
    ) -> Result<Uuid> {
        self.create_impl(&mut **tx, attempt).await
    }

    async fn create_impl<'e, E>(&self, executor: E, attempt: &DeliveryAttemptRecord) -> Result<Uuid>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let id = sqlx::query_scalar(
            r"
            INSERT INTO delivery_attempts (
                id, delivery_id, attempt_number, outcome, http_status,
                duration_ms, error, attempted_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8
            )
            RETURNING id
            ",
        )
        .bind(attempt.id)
        .bind(attempt.delivery_id)
        .bind(i32::try_from(attempt.attempt_number).unwrap_or(i32::MAX))
        .bind(attempt.outcome)
        .bind(attempt.http_status.map(i32::from))
        .bind(i64::try_from(attempt.duration_ms).unwrap_or(i64::MAX))
        .bind(&attempt.error)
        .bind(attempt.attempted_at)
        .fetch_one(executor)
        .await?;

        Ok(id)
    }

    /// Lists a delivery's attempts in attempt order.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_by_delivery(&self, delivery_id: DeliveryId) -> Result<Vec<DeliveryAttemptRecord>> {
        let attempts = sqlx::query_as::<_, DeliveryAttemptRecord>(
            r"
            SELECT id, delivery_id, attempt_number, outcome, http_status,
                   duration_ms, error, attempted_at
            FROM delivery_attempts
            WHERE delivery_id = $1
            ORDER BY attempt_number ASC
            ",
        )
        .bind(delivery_id)
        .fetch_all(&*self.pool)
        .await?;

        Ok(attempts)
    }

    /// Counts attempts across all of a subscription's deliveries.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn count_by_subscription(&self, subscription_id: SubscriptionId) -> Result<i64> {
        let count: (i64,) = sqlx::query_as(
            r"
            SELECT COUNT(*)
            FROM delivery_attempts da
            JOIN deliveries d ON d.id = da.delivery_id
            WHERE d.subscription_id = $1
            ",
        )
        .bind(subscription_id)
        .fetch_one(&*self.pool)
        .await?;

        Ok(count.0)
    }

    /// Success rate and mean latency of a subscription's attempts since
    /// `since`.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn stats_for_subscription(
        &self,
        subscription_id: SubscriptionId,
        since: DateTime<Utc>,
        window_secs: u64,
    ) -> Result<SubscriptionStats> {
        let (total, successful, average_latency_ms): (i64, i64, Option<f64>) = sqlx::query_as(
            r"
            SELECT
                COUNT(*),
                COUNT(*) FILTER (WHERE da.outcome = 'success'),
                AVG(da.duration_ms)::FLOAT8
            FROM delivery_attempts da
            JOIN deliveries d ON d.id = da.delivery_id
            WHERE d.subscription_id = $1
              AND da.attempted_at >= $2
            ",
        )
        .bind(subscription_id)
        .bind(since)
        .fetch_one(&*self.pool)
        .await?;

        let total_attempts = u64::try_from(total).unwrap_or(0);
        let successful_attempts = u64::try_from(successful).unwrap_or(0);
        let success_rate = if total_attempts == 0 {
            0.0
        } else {
            successful_attempts as f64 / total_attempts as f64
        };

        Ok(SubscriptionStats {
            subscription_id,
            total_attempts,
            successful_attempts,
            success_rate,
            average_latency_ms: average_latency_ms.unwrap_or(0.0),
            window_secs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn repository_can_be_created() {
        let pool = sqlx::PgPool::connect_lazy("postgresql://test").unwrap();
        let _repo = Repository::new(Arc::new(pool));
    }
}
