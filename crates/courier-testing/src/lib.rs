//! Test infrastructure for deterministic delivery testing.
//!
//! [`TestEnv`] wires a real [`DeliveryEngine`] to in-memory storage, an
//! in-memory shared store, a [`TestClock`] and a wiremock subscriber.
//! Tests drive the pipeline one cycle at a time instead of starting the
//! background poller, advancing the clock to make retries due.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use courier_core::{DeliveryAttemptRecord, DeliveryId, DeliveryRecord, Subscription};
use courier_delivery::{shared_store::InMemorySharedStore, storage::DeliveryStorage, DeliveryEngine};
use courier_signing::{SignatureService, SigningKey};

pub mod fixtures;
pub mod http;

mod env_core;

pub use courier_core::{Clock, TestClock};
pub use courier_delivery::storage::mock::MockDeliveryStorage;
pub use env_core::TestEnvBuilder;
pub use fixtures::{order_payload, SubscriptionBuilder, TEST_SECRET};
pub use http::{MockResponse, MockServer, ReceivedDelivery};

/// Upper bound on cycles in [`TestEnv::run_until_settled`].
const MAX_CYCLES: u32 = 100;

/// Delivery engine over in-memory storage with a controllable clock.
pub struct TestEnv {
    /// Mock subscriber endpoints
    pub http_mock: http::MockServer,
    /// Deterministic clock shared with the engine
    pub clock: TestClock,
    /// Durable storage double
    pub storage: MockDeliveryStorage,
    /// Coordination state for circuits, buckets and batches
    pub store: Arc<InMemorySharedStore>,
    engine: DeliveryEngine,
}

impl TestEnv {
    /// Environment with default test settings.
    pub async fn new() -> Result<Self> {
        TestEnvBuilder::new().build().await
    }

    /// Builder for a customised environment.
    pub fn builder() -> TestEnvBuilder {
        TestEnvBuilder::new()
    }

    /// The engine under test.
    pub fn engine(&self) -> &DeliveryEngine {
        &self.engine
    }

    /// Subscription builder pointing at `endpoint_path` on the mock server.
    pub fn subscription(&self, endpoint_path: &str) -> SubscriptionBuilder {
        SubscriptionBuilder::new(self.http_mock.endpoint_url(endpoint_path))
    }

    /// Stores `subscription` so the engine can find it.
    pub async fn register(&self, subscription: SubscriptionBuilder) -> Subscription {
        let subscription = subscription.build();
        self.storage.add_subscription(subscription.clone()).await;
        subscription
    }

    /// Advances the clock.
    pub fn advance_time(&self, duration: Duration) {
        self.clock.advance(duration);
    }

    /// Claims and executes whatever is due now, returning the claim count.
    pub async fn run_delivery_cycle(&self) -> Result<usize> {
        self.engine.process_due().await.context("delivery cycle failed")
    }

    /// Runs cycles until nothing is due at the current time.
    pub async fn process_all_pending(&self) -> Result<usize> {
        let mut total = 0;
        for _ in 0..MAX_CYCLES {
            let claimed = self.run_delivery_cycle().await?;
            if claimed == 0 {
                return Ok(total);
            }
            total += claimed;
        }
        anyhow::bail!("exceeded maximum processing cycles ({MAX_CYCLES})")
    }

    /// Runs `delivery_id` to a terminal state, jumping the clock to each
    /// scheduled retry.
    pub async fn run_until_settled(&self, delivery_id: DeliveryId) -> Result<DeliveryRecord> {
        for _ in 0..MAX_CYCLES {
            let record = self.delivery(delivery_id).await?;
            if record.status.is_terminal() {
                return Ok(record);
            }

            if let Some(due) = record.next_retry_at {
                let wait = (due - self.clock.now_utc()).to_std().unwrap_or_default();
                self.clock.advance(wait);
            }
            self.run_delivery_cycle().await?;
        }
        anyhow::bail!("delivery {delivery_id} did not settle within {MAX_CYCLES} cycles")
    }

    /// Current record for `delivery_id`.
    pub async fn delivery(&self, delivery_id: DeliveryId) -> Result<DeliveryRecord> {
        self.storage
            .find_delivery(delivery_id)
            .await?
            .with_context(|| format!("delivery {delivery_id} not found"))
    }

    /// Attempts recorded for `delivery_id`, oldest first.
    pub async fn attempts(&self, delivery_id: DeliveryId) -> Result<Vec<DeliveryAttemptRecord>> {
        Ok(self.storage.find_attempts(delivery_id).await?)
    }

    /// Verifies the `X-Signature` of a received request against the
    /// subscription's key at the current clock time.
    pub fn verify_signature(&self, received: &ReceivedDelivery, subscription: &Subscription) -> Result<bool> {
        let header = received.signature.as_deref().context("request carried no signature header")?;
        let key = SigningKey::from_secret(subscription.signing.algorithm, &subscription.signing.secret)?;
        Ok(SignatureService::default().verify_header(
            &received.body,
            header,
            &key.verification_key(),
            self.clock.unix_seconds(),
        )?)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn delivers_signed_payload_to_mock_endpoint() {
        let env = TestEnv::new().await.unwrap();
        env.http_mock.respond("/hook", MockResponse::ok()).await;
        let subscription = env.register(env.subscription("/hook")).await;

        let outcome = env
            .engine()
            .trigger(subscription.id, "order.created", json!({ "order_id": "o-1" }), None)
            .await
            .unwrap();
        let record = env.run_until_settled(outcome.delivery_id().unwrap()).await.unwrap();

        assert_eq!(record.status, courier_core::DeliveryStatus::Success);
        let received = env.http_mock.received_at("/hook").await;
        assert_eq!(received.len(), 1);
        assert!(env.verify_signature(&received[0], &subscription).unwrap());
    }

    #[tokio::test]
    async fn settles_retries_by_jumping_the_clock() {
        let env = TestEnv::new().await.unwrap();
        env.http_mock
            .respond_sequence("/hook", vec![MockResponse::status(503), MockResponse::status(503), MockResponse::ok()])
            .await;
        let subscription = env.register(env.subscription("/hook")).await;

        let id = env
            .engine()
            .trigger(subscription.id, "order.created", json!({}), None)
            .await
            .unwrap()
            .delivery_id()
            .unwrap();
        let record = env.run_until_settled(id).await.unwrap();

        assert_eq!(record.attempt_count, 3);
        assert_eq!(env.attempts(id).await.unwrap().len(), 3);
        // base 1s then 2s
        assert!(env.clock.elapsed() >= Duration::from_secs(3));
    }
}
