//! Durable storage for deliveries, attempts, dead letters and the
//! subscriptions they target.
//!
//! Each table has its own repository; all SQL lives here. Delivery records
//! change only through attempt-number-guarded updates, so a record that is
//! ever dispatched twice is processed at most once.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;

pub mod dead_letters;
pub mod deliveries;
pub mod delivery_attempts;
pub mod subscriptions;

use crate::{
    error::Result,
    models::{DeadLetterEntry, DeliveryAttemptRecord, DeliveryId, DeliveryTransition},
};

/// Container for all repository instances sharing one connection pool.
#[derive(Clone)]
pub struct Storage {
    /// Subscription configuration (read-only to the engine).
    pub subscriptions: Arc<subscriptions::Repository>,

    /// Delivery lifecycle records.
    pub deliveries: Arc<deliveries::Repository>,

    /// Append-only attempt audit trail.
    pub delivery_attempts: Arc<delivery_attempts::Repository>,

    /// Quarantined deliveries.
    pub dead_letters: Arc<dead_letters::Repository>,
}

impl Storage {
    /// Creates a storage instance over the given pool.
    pub fn new(pool: PgPool) -> Self {
        let pool = Arc::new(pool);

        Self {
            subscriptions: Arc::new(subscriptions::Repository::new(pool.clone())),
            deliveries: Arc::new(deliveries::Repository::new(pool.clone())),
            delivery_attempts: Arc::new(delivery_attempts::Repository::new(pool.clone())),
            dead_letters: Arc::new(dead_letters::Repository::new(pool)),
        }
    }

    /// Records an attempt and applies its transition in one transaction.
    ///
    /// Returns `false` without writing anything if the delivery is no longer
    /// pending with `attempt.attempt_number - 1` attempts.
    ///
    /// # Errors
    ///
    /// Returns error if the transaction fails.
    pub async fn complete_attempt(
        &self,
        delivery_id: DeliveryId,
        attempt: &DeliveryAttemptRecord,
        transition: &DeliveryTransition,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tx = self.deliveries.pool().begin().await?;

        let applied = self
            .deliveries
            .apply_transition_in_tx(&mut tx, delivery_id, attempt.attempt_number, transition, now)
            .await?;

        if !applied {
            tx.rollback().await?;
            return Ok(false);
        }

        self.delivery_attempts.create_in_tx(&mut tx, attempt).await?;
        tx.commit().await?;

        Ok(true)
    }

    /// Records the final attempt, marks the delivery `Failed` and stores its
    /// dead letter in one transaction.
    ///
    /// Returns `None` without writing anything if the delivery is no longer
    /// pending with `attempt.attempt_number - 1` attempts. A failed dead
    /// letter insert rolls back the status change, leaving the record
    /// pending for another attempt.
    ///
    /// # Errors
    ///
    /// Returns error if the transaction fails.
    pub async fn fail_delivery(
        &self,
        delivery_id: DeliveryId,
        attempt: &DeliveryAttemptRecord,
        entry: &DeadLetterEntry,
        now: DateTime<Utc>,
    ) -> Result<Option<DeadLetterEntry>> {
        let mut tx = self.deliveries.pool().begin().await?;
        let transition = DeliveryTransition::Failed { error: entry.error.clone() };

        let applied = self
            .deliveries
            .apply_transition_in_tx(&mut tx, delivery_id, attempt.attempt_number, &transition, now)
            .await?;

        if !applied {
            tx.rollback().await?;
            return Ok(None);
        }

        self.delivery_attempts.create_in_tx(&mut tx, attempt).await?;
        let stored = self.dead_letters.create_if_absent_in_tx(&mut tx, entry).await?;
        tx.commit().await?;

        Ok(Some(stored))
    }

    /// Verifies database connectivity.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if the connection is unhealthy.
    pub async fn health_check(&self) -> Result<()> {
        let _: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&*self.deliveries.pool()).await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn storage_can_be_created() {
        let pool = sqlx::PgPool::connect_lazy("postgresql://test").unwrap();
        let _storage = Storage::new(pool);
    }
}
