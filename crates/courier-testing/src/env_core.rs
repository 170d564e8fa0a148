use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use courier_core::{Clock, TestClock};
use courier_delivery::{
    shared_store::InMemorySharedStore, storage::mock::MockDeliveryStorage, CircuitConfig, DeliveryConfig,
    DeliveryEngine, RetryPolicy,
};

use crate::{http, TestEnv};

/// Builder for [`TestEnv`].
///
/// Defaults drop jitter and shrink timeouts so retry timing is exact and
/// timeout tests stay fast.
pub struct TestEnvBuilder {
    config: DeliveryConfig,
}

impl Default for TestEnvBuilder {
    fn default() -> Self {
        Self {
            config: DeliveryConfig {
                retry: RetryPolicy {
                    jitter_factor: 0.0,
                    timeouts: vec![Duration::from_secs(2)],
                    ..RetryPolicy::default()
                },
                ..DeliveryConfig::default()
            },
        }
    }
}

impl TestEnvBuilder {
    /// Creates a builder with test defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the number of concurrent attempts.
    #[must_use]
    pub fn worker_count(mut self, count: usize) -> Self {
        self.config.worker_count = count;
        self
    }

    /// Sets the number of deliveries claimed per cycle.
    #[must_use]
    pub fn claim_batch_size(mut self, size: usize) -> Self {
        self.config.claim_batch_size = size;
        self
    }

    /// Replaces the retry policy.
    #[must_use]
    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.config.retry = retry;
        self
    }

    /// Sets every attempt timeout tier to `timeout`.
    #[must_use]
    pub fn attempt_timeout(mut self, timeout: Duration) -> Self {
        self.config.retry.timeouts = vec![timeout];
        self
    }

    /// Replaces the circuit breaker thresholds.
    #[must_use]
    pub fn circuit(mut self, circuit: CircuitConfig) -> Self {
        self.config.circuit = circuit;
        self
    }

    /// Builds the environment.
    pub async fn build(self) -> Result<TestEnv> {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("error")),
            )
            .with_test_writer()
            .try_init();

        let http_mock = http::MockServer::start().await;
        let clock = TestClock::new();
        let clock_arc: Arc<dyn Clock> = Arc::new(clock.clone());
        let storage = MockDeliveryStorage::new();
        let store = Arc::new(InMemorySharedStore::new(clock_arc.clone()));

        let engine = DeliveryEngine::new(Arc::new(storage.clone()), store.clone(), self.config, clock_arc)
            .context("failed to build delivery engine")?;

        Ok(TestEnv { http_mock, clock, storage, store, engine })
    }
}
