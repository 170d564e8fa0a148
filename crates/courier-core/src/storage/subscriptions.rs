//! Repository for subscription configuration.
//!
//! Subscriptions are edited by an external configuration surface; the engine
//! only reads them. Writes exist for provisioning and tests.

use std::sync::Arc;

use sqlx::{types::Json, Executor, PgPool, Postgres, Transaction};

use crate::{
    error::Result,
    models::{Subscription, SubscriptionId},
};

const SUBSCRIPTION_COLUMNS: &str = "id, url, signing, is_active, event_patterns, filter, template, \
     excluded_fields, rate_limit, max_retries, batch, created_at, updated_at";

/// Repository for subscription database operations.
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

    /// Inserts a subscription.
    ///
    /// # Errors
    ///
    /// Returns error if insert fails.
    pub async fn create(&self, subscription: &Subscription) -> Result<SubscriptionId> {
        self.create_impl(&*self.pool, subscription).await
    }

    /// Inserts a subscription within a transaction.
    ///
    /// # Errors
    ///
    /// Returns error if insert fails.
    pub async fn create_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        subscription: &Subscription,
    ) -> Result<SubscriptionId> {
        self.create_impl(&mut **tx, subscription).await
    }

    async fn create_impl<'e, E>(&self, executor: E, subscription: &Subscription) -> Result<SubscriptionId>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let id = sqlx::query_scalar(
            r"
            INSERT INTO subscriptions (
                id, url, signing, is_active, event_patterns, filter, template,
                excluded_fields, rate_limit, max_retries, batch, created_at, updated_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13
            )
            RETURNING id
            ",
        )
        .bind(subscription.id)
        .bind(&subscription.url)
        .bind(Json(&subscription.signing))
        .bind(subscription.is_active)
        .bind(Json(&subscription.event_patterns))
        .bind(subscription.filter.as_ref().map(Json))
        .bind(&subscription.template)
        .bind(Json(&subscription.excluded_fields))
        .bind(subscription.rate_limit.as_ref().map(Json))
        .bind(i32::try_from(subscription.max_retries).unwrap_or(i32::MAX))
        .bind(subscription.batch.as_ref().map(Json))
        .bind(subscription.created_at)
        .bind(subscription.updated_at)
        .fetch_one(executor)
        .await?;

        Ok(id)
    }

    /// Finds a subscription by ID.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_by_id(&self, id: SubscriptionId) -> Result<Option<Subscription>> {
        let subscription = sqlx::query_as::<_, Subscription>(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(subscription)
    }

    /// Lists every active subscription, oldest first.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_active(&self) -> Result<Vec<Subscription>> {
        let subscriptions = sqlx::query_as::<_, Subscription>(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE is_active = true ORDER BY created_at ASC"
        ))
        .fetch_all(&*self.pool)
        .await?;

        Ok(subscriptions)
    }

    /// Activates or deactivates a subscription.
    ///
    /// # Errors
    ///
    /// Returns error if update fails.
    pub async fn set_active(&self, id: SubscriptionId, is_active: bool) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE subscriptions
            SET is_active = $1, updated_at = NOW()
            WHERE id = $2
            ",
        )
        .bind(is_active)
        .bind(id)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
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
