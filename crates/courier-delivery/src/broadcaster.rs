//! Fan-out of one event to every matching subscription.

use std::sync::Arc;

use courier_core::SubscriptionId;
use futures::future::join_all;
use serde_json::Value;
use tracing::{debug, warn};

use crate::{
    error::Result,
    matcher::SubscriptionMatcher,
    orchestrator::{DeliveryOrchestrator, TriggerOutcome},
    storage::DeliveryStorage,
};

/// Per-subscription results of a broadcast.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastSummary {
    /// Active subscriptions whose patterns and filters matched.
    pub matched: usize,
    /// Trigger result for each matched subscription. Failed triggers carry
    /// the error message.
    pub outcomes: Vec<(SubscriptionId, std::result::Result<TriggerOutcome, String>)>,
}

impl BroadcastSummary {
    /// Number of deliveries created.
    pub fn scheduled(&self) -> usize {
        self.outcomes.iter().filter(|(_, outcome)| matches!(outcome, Ok(o) if o.is_scheduled())).count()
    }
}

/// Routes events to subscriptions.
pub struct EventBroadcaster {
    storage: Arc<dyn DeliveryStorage>,
    matcher: SubscriptionMatcher,
    orchestrator: Arc<DeliveryOrchestrator>,
}

impl EventBroadcaster {
    /// Creates a broadcaster with an empty pattern cache.
    pub fn new(storage: Arc<dyn DeliveryStorage>, orchestrator: Arc<DeliveryOrchestrator>) -> Self {
        Self { storage, matcher: SubscriptionMatcher::new(), orchestrator }
    }

    /// Triggers `event_type` for every active subscription that matches.
    ///
    /// Triggers run concurrently; one failing does not affect the others.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError` if subscriptions cannot be listed.
    pub async fn broadcast(&self, event_type: &str, payload: Value) -> Result<BroadcastSummary> {
        let subscriptions = self.storage.find_active_subscriptions().await?;
        let matched: Vec<SubscriptionId> = subscriptions
            .iter()
            .filter(|subscription| self.matcher.is_match(subscription, event_type, &payload))
            .map(|subscription| subscription.id)
            .collect();

        debug!(event_type, candidates = subscriptions.len(), matched = matched.len(), "broadcasting event");

        let triggers = matched.iter().map(|&subscription_id| {
            let payload = payload.clone();
            async move {
                let outcome = self.orchestrator.trigger(subscription_id, event_type, payload, None).await;
                if let Err(e) = &outcome {
                    warn!(subscription_id = %subscription_id, event_type, error = %e, "broadcast trigger failed");
                }
                (subscription_id, outcome.map_err(|e| e.to_string()))
            }
        });
        let outcomes = join_all(triggers).await;

        Ok(BroadcastSummary { matched: matched.len(), outcomes })
    }
}
