//! Repository for quarantined deliveries.
//!
//! `delivery_id` is unique, so storing the same failed delivery twice
//! returns the entry written first. Entries are soft-deleted by archiving
//! and otherwise kept indefinitely.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{Executor, PgPool, Postgres, Transaction};

use crate::{
    error::{CoreError, Result},
    models::{DeadLetterEntry, DeadLetterId, DeadLetterQuery, DeliveryId},
};

/// Repository for dead letter operations.
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

    /// Stores an entry unless one already exists for its delivery, within a
    /// transaction.
    ///
    /// Returns the stored entry, which is the pre-existing one on conflict.
    ///
    /// # Errors
    ///
    /// Returns error if insert or lookup fails.
    pub async fn create_if_absent_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        entry: &DeadLetterEntry,
    ) -> Result<DeadLetterEntry> {
        let inserted = sqlx::query_as::<_, DeadLetterEntry>(
            r"
            INSERT INTO dead_letters (
                id, delivery_id, subscription_id, event_type, payload, error,
                retry_count, stored_at, replayed_at, archived
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10
            )
            ON CONFLICT (delivery_id) DO NOTHING
            RETURNING id, delivery_id, subscription_id, event_type, payload, error,
                      retry_count, stored_at, replayed_at, archived
            ",
        )
        .bind(entry.id)
        .bind(entry.delivery_id)
        .bind(entry.subscription_id)
        .bind(&entry.event_type)
        .bind(&entry.payload)
        .bind(&entry.error)
        .bind(i32::try_from(entry.retry_count).unwrap_or(i32::MAX))
        .bind(entry.stored_at)
        .bind(entry.replayed_at)
        .bind(entry.archived)
        .fetch_optional(&mut **tx)
        .await?;

        match inserted {
            Some(entry) => Ok(entry),
            None => self
                .find_by_delivery_impl(&mut **tx, entry.delivery_id)
                .await?
                .ok_or_else(|| CoreError::NotFound(format!("dead letter for delivery {}", entry.delivery_id))),
        }
    }

    /// Finds an entry by ID.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_by_id(&self, id: DeadLetterId) -> Result<Option<DeadLetterEntry>> {
        let entry = sqlx::query_as::<_, DeadLetterEntry>(
            r"
            SELECT id, delivery_id, subscription_id, event_type, payload, error,
                   retry_count, stored_at, replayed_at, archived
            FROM dead_letters
            WHERE id = $1
            ",
        )
        .bind(id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(entry)
    }

    /// Finds the entry for a delivery.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_by_delivery(&self, delivery_id: DeliveryId) -> Result<Option<DeadLetterEntry>> {
        self.find_by_delivery_impl(&*self.pool, delivery_id).await
    }

    async fn find_by_delivery_impl<'e, E>(
        &self,
        executor: E,
        delivery_id: DeliveryId,
    ) -> Result<Option<DeadLetterEntry>>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let entry = sqlx::query_as::<_, DeadLetterEntry>(
            r"
            SELECT id, delivery_id, subscription_id, event_type, payload, error,
                   retry_count, stored_at, replayed_at, archived
            FROM dead_letters
            WHERE delivery_id = $1
            ",
        )
        .bind(delivery_id)
        .fetch_optional(executor)
        .await?;

        Ok(entry)
    }

    /// Lists entries newest first.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn list(&self, query: &DeadLetterQuery) -> Result<Vec<DeadLetterEntry>> {
        let entries = sqlx::query_as::<_, DeadLetterEntry>(
            r"
            SELECT id, delivery_id, subscription_id, event_type, payload, error,
                   retry_count, stored_at, replayed_at, archived
            FROM dead_letters
            WHERE ($1::UUID IS NULL OR subscription_id = $1)
              AND ($2 OR archived = false)
            ORDER BY stored_at DESC
            LIMIT $3 OFFSET $4
            ",
        )
        .bind(query.subscription_id)
        .bind(query.include_archived)
        .bind(i64::from(query.limit))
        .bind(i64::from(query.offset))
        .fetch_all(&*self.pool)
        .await?;

        Ok(entries)
    }

    /// Stamps `replayed_at` on an entry.
    ///
    /// # Errors
    ///
    /// Returns error if update fails.
    pub async fn mark_replayed(&self, id: DeadLetterId, at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE dead_letters
            SET replayed_at = $1
            WHERE id = $2
            ",
        )
        .bind(at)
        .bind(id)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Soft-deletes an entry.
    ///
    /// # Errors
    ///
    /// Returns error if update fails.
    pub async fn archive(&self, id: DeadLetterId) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE dead_letters
            SET archived = true
            WHERE id = $1
            ",
        )
        .bind(id)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}
