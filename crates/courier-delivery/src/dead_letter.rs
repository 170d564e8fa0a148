//! Dead-letter handling for deliveries that permanently failed.
//!
//! Each failed delivery gets exactly one entry. Entries keep the payload as
//! it was sent so an operator can replay it after fixing the subscriber.

use std::sync::Arc;

use courier_core::{Clock, DeadLetterEntry, DeadLetterId, DeadLetterQuery, DeliveryAttemptRecord, DeliveryRecord};
use tracing::info;

use crate::{
    error::{DeliveryError, Result},
    storage::DeliveryStorage,
};

/// Durable store of permanently failed deliveries.
#[derive(Clone)]
pub struct DeadLetterStore {
    storage: Arc<dyn DeliveryStorage>,
    clock: Arc<dyn Clock>,
}

impl DeadLetterStore {
    /// Creates a store over the delivery storage.
    pub fn new(storage: Arc<dyn DeliveryStorage>, clock: Arc<dyn Clock>) -> Self {
        Self { storage, clock }
    }

    /// Records the final `attempt`, marks `record` failed with `error` and
    /// quarantines it, all in one write.
    ///
    /// Returns `None` if the record already moved past this attempt, in
    /// which case nothing is written.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError` if the write fails. The record then stays
    /// pending and is retried once its lease expires.
    pub async fn store(
        &self,
        record: &DeliveryRecord,
        attempt: DeliveryAttemptRecord,
        error: &str,
    ) -> Result<Option<DeadLetterEntry>> {
        let now = self.clock.now_utc();
        let mut failed = record.clone();
        failed.attempt_count = attempt.attempt_number;
        let entry = DeadLetterEntry::from_delivery(&failed, error, now);

        let Some(stored) = self.storage.fail_delivery(record.id, attempt, entry, now).await? else {
            return Ok(None);
        };

        info!(
            target: "courier::dlq",
            dead_letter_id = %stored.id,
            delivery_id = %record.id,
            subscription_id = %record.subscription_id,
            event_type = %record.event_type,
            retry_count = stored.retry_count,
            error = %stored.error,
            "delivery moved to dead letter queue"
        );

        Ok(Some(stored))
    }

    /// Looks up an entry.
    ///
    /// # Errors
    ///
    /// Returns `DeadLetterNotFound` if no entry has this id.
    pub async fn get(&self, id: DeadLetterId) -> Result<DeadLetterEntry> {
        self.storage
            .find_dead_letter(id)
            .await?
            .ok_or_else(|| DeliveryError::DeadLetterNotFound { id: id.to_string() })
    }

    /// Lists entries, newest first.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError` if the query fails.
    pub async fn list(&self, query: DeadLetterQuery) -> Result<Vec<DeadLetterEntry>> {
        Ok(self.storage.list_dead_letters(query).await?)
    }

    /// Archives an entry so it is hidden from default listings and can no
    /// longer be replayed.
    ///
    /// # Errors
    ///
    /// Returns `DeadLetterNotFound` if no entry has this id.
    pub async fn discard(&self, id: DeadLetterId) -> Result<()> {
        if !self.storage.archive_dead_letter(id).await? {
            return Err(DeliveryError::DeadLetterNotFound { id: id.to_string() });
        }
        info!(target: "courier::dlq", dead_letter_id = %id, "dead letter discarded");
        Ok(())
    }

    /// Stamps the entry as replayed now.
    ///
    /// # Errors
    ///
    /// Returns `DeadLetterNotFound` if no entry has this id.
    pub async fn mark_replayed(&self, id: DeadLetterId) -> Result<()> {
        if !self.storage.mark_dead_letter_replayed(id, self.clock.now_utc()).await? {
            return Err(DeliveryError::DeadLetterNotFound { id: id.to_string() });
        }
        info!(target: "courier::dlq", dead_letter_id = %id, "dead letter replayed");
        Ok(())
    }
}
