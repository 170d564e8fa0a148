//! Per-subscription circuit breaker backed by the shared store.
//!
//! Fails fast while a subscriber is down and probes for recovery once the
//! reset timeout has passed. State lives in the [`SharedStore`] so every
//! engine instance sees the same circuit.
//!
//! # State Machine
//!
//! ```text
//!          failures >= threshold              reset timeout elapsed
//!   CLOSED ─────────────────────▶ OPEN ─────────────────────────▶ HALF-OPEN
//!     ▲                            ▲                                  │ │
//!     │                            └──────────── any failure ─────────┘ │
//!     └───────────────────────── successes >= threshold ────────────────┘
//! ```
//!
//! Every transition is a compare-and-swap on the persisted state and is
//! checked against [`CircuitState::can_transition_to`]; Open never moves
//! straight to Closed.
//!
//! # Keys
//!
//! - `circuit:{id}:state` JSON [`PersistedCircuit`]
//! - `circuit:{id}:failures` failure counter, windowed by `2 × reset_timeout`
//! - `circuit:{id}:probes` successes observed while half-open

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use courier_core::{Clock, SubscriptionId};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::shared_store::{SharedStore, StoreError};

/// Circuit breaker configuration for all subscriptions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitConfig {
    /// Failures within the window that open the circuit.
    pub failure_threshold: u32,
    /// Time to wait before moving from Open to HalfOpen.
    pub reset_timeout: Duration,
    /// Consecutive half-open successes that close the circuit.
    pub success_threshold: u32,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self { failure_threshold: 5, reset_timeout: Duration::from_secs(30), success_threshold: 3 }
    }
}

impl CircuitConfig {
    fn failure_window(&self) -> Duration {
        self.reset_timeout.saturating_mul(2)
    }
}

/// Current state of a circuit breaker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation, all requests allowed.
    #[default]
    Closed,
    /// Subscriber unhealthy, requests fail immediately.
    Open,
    /// Testing recovery.
    HalfOpen,
}

impl CircuitState {
    /// Whether `self → next` is a legal transition.
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Closed, Self::Open)
                | (Self::Open, Self::HalfOpen)
                | (Self::HalfOpen, Self::Closed)
                | (Self::HalfOpen, Self::Open)
        )
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Circuit state as persisted in the shared store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedCircuit {
    /// Current state.
    pub state: CircuitState,
    /// Unix millis when the circuit last opened.
    pub opened_at_ms: Option<i64>,
}

/// Point-in-time view of one circuit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitSnapshot {
    /// Subscription the circuit guards.
    pub subscription_id: SubscriptionId,
    /// State after applying the reset timeout.
    pub state: CircuitState,
    /// Failures in the current window.
    pub failure_count: u32,
    /// Successes observed while half-open.
    pub half_open_success_count: u32,
    /// When the circuit last opened.
    pub opened_at: Option<DateTime<Utc>>,
}

/// Circuit breakers for every subscription.
#[derive(Debug, Clone)]
pub struct CircuitBreakerManager {
    config: CircuitConfig,
    store: Arc<dyn SharedStore>,
    clock: Arc<dyn Clock>,
}

impl CircuitBreakerManager {
    /// Creates a manager over the shared store.
    pub fn new(config: CircuitConfig, store: Arc<dyn SharedStore>, clock: Arc<dyn Clock>) -> Self {
        Self { config, store, clock }
    }

    /// Configuration in use.
    pub fn config(&self) -> &CircuitConfig {
        &self.config
    }

    /// Current state, moving Open to HalfOpen once the reset timeout has
    /// passed.
    ///
    /// An unreadable state is treated as Closed so an outage of the shared
    /// store never blocks deliveries.
    pub async fn get_status(&self, subscription_id: SubscriptionId) -> CircuitState {
        match self.load(subscription_id).await {
            Ok((raw, persisted)) => self.resolve(subscription_id, raw.as_deref(), persisted).await,
            Err(e) => {
                warn!(
                    target: "courier::degraded",
                    subscription_id = %subscription_id,
                    error = %e,
                    "circuit state unreadable, treating as closed"
                );
                CircuitState::Closed
            },
        }
    }

    /// Records a failed attempt.
    pub async fn record_failure(&self, subscription_id: SubscriptionId) {
        if let Err(e) = self.try_record_failure(subscription_id).await {
            warn!(
                target: "courier::degraded",
                subscription_id = %subscription_id,
                error = %e,
                "failed to record circuit failure"
            );
        }
    }

    /// Records a successful attempt.
    pub async fn record_success(&self, subscription_id: SubscriptionId) {
        if let Err(e) = self.try_record_success(subscription_id).await {
            warn!(
                target: "courier::degraded",
                subscription_id = %subscription_id,
                error = %e,
                "failed to record circuit success"
            );
        }
    }

    /// Reads the circuit and its counters.
    ///
    /// # Errors
    ///
    /// Returns the store error if any key cannot be read.
    pub async fn snapshot(&self, subscription_id: SubscriptionId) -> Result<CircuitSnapshot, StoreError> {
        let (raw, persisted) = self.load(subscription_id).await?;
        let state = self.resolve(subscription_id, raw.as_deref(), persisted).await;
        let failure_count = self.read_counter(&failures_key(subscription_id)).await?;
        let half_open_success_count = self.read_counter(&probes_key(subscription_id)).await?;
        let opened_at = persisted.opened_at_ms.and_then(DateTime::<Utc>::from_timestamp_millis);

        Ok(CircuitSnapshot {
            subscription_id,
            state,
            failure_count,
            half_open_success_count,
            opened_at,
        })
    }

    async fn try_record_failure(&self, subscription_id: SubscriptionId) -> Result<(), StoreError> {
        let (raw, persisted) = self.load(subscription_id).await?;
        let state = self.resolve(subscription_id, raw.as_deref(), persisted).await;

        match state {
            CircuitState::HalfOpen => {
                // resolve() may have just written HalfOpen; read what is stored now.
                let (raw, _) = self.load(subscription_id).await?;
                self.transition_to_open(subscription_id, raw.as_deref(), CircuitState::HalfOpen)
                    .await?;
            },
            CircuitState::Closed => {
                let failures = self
                    .store
                    .increment(&failures_key(subscription_id), Some(self.config.failure_window()))
                    .await?;
                debug!(subscription_id = %subscription_id, failures, "circuit failure recorded");
                if failures >= i64::from(self.config.failure_threshold) {
                    self.transition_to_open(subscription_id, raw.as_deref(), CircuitState::Closed)
                        .await?;
                }
            },
            CircuitState::Open => {
                debug!(subscription_id = %subscription_id, "failure recorded for open circuit");
            },
        }
        Ok(())
    }

    async fn try_record_success(&self, subscription_id: SubscriptionId) -> Result<(), StoreError> {
        let (raw, persisted) = self.load(subscription_id).await?;
        let state = self.resolve(subscription_id, raw.as_deref(), persisted).await;

        match state {
            CircuitState::HalfOpen => {
                let successes = self.store.increment(&probes_key(subscription_id), None).await?;
                if successes >= i64::from(self.config.success_threshold) {
                    let (raw, _) = self.load(subscription_id).await?;
                    self.transition_to_closed(subscription_id, raw.as_deref()).await?;
                }
            },
            CircuitState::Closed => {
                self.store.delete(&failures_key(subscription_id)).await?;
            },
            CircuitState::Open => {
                warn!(subscription_id = %subscription_id, "recorded success for open circuit");
            },
        }
        Ok(())
    }

    async fn load(
        &self,
        subscription_id: SubscriptionId,
    ) -> Result<(Option<String>, PersistedCircuit), StoreError> {
        let key = state_key(subscription_id);
        let raw = self.store.get(&key).await?;
        let persisted = match raw.as_deref() {
            Some(text) => serde_json::from_str(text).map_err(|e| StoreError::corrupt(&key, e.to_string()))?,
            None => PersistedCircuit::default(),
        };
        Ok((raw, persisted))
    }

    /// Applies the time-gated Open → HalfOpen move.
    async fn resolve(
        &self,
        subscription_id: SubscriptionId,
        raw: Option<&str>,
        persisted: PersistedCircuit,
    ) -> CircuitState {
        if persisted.state != CircuitState::Open {
            return persisted.state;
        }

        let reset_ms = i64::try_from(self.config.reset_timeout.as_millis()).unwrap_or(i64::MAX);
        let opened_at = persisted.opened_at_ms.unwrap_or(i64::MIN);
        if self.clock.unix_millis().saturating_sub(opened_at) <= reset_ms {
            return CircuitState::Open;
        }

        match self.transition_to_half_open(subscription_id, raw, persisted).await {
            Ok(true) => CircuitState::HalfOpen,
            Ok(false) => {
                // Another caller moved the circuit first.
                match self.load(subscription_id).await {
                    Ok((_, current)) if current.state != CircuitState::Open => current.state,
                    _ => CircuitState::Open,
                }
            },
            Err(e) => {
                warn!(
                    target: "courier::degraded",
                    subscription_id = %subscription_id,
                    error = %e,
                    "failed to move circuit to half-open"
                );
                CircuitState::Open
            },
        }
    }

    async fn transition(
        &self,
        subscription_id: SubscriptionId,
        raw: Option<&str>,
        from: CircuitState,
        to: PersistedCircuit,
    ) -> Result<bool, StoreError> {
        if !from.can_transition_to(to.state) {
            warn!(
                subscription_id = %subscription_id,
                from = %from,
                to = %to.state,
                "rejected illegal circuit transition"
            );
            return Ok(false);
        }

        let encoded = serde_json::to_string(&to)
            .map_err(|e| StoreError::corrupt(state_key(subscription_id), e.to_string()))?;
        self.store.compare_and_swap(&state_key(subscription_id), raw, &encoded, None).await
    }

    async fn transition_to_open(
        &self,
        subscription_id: SubscriptionId,
        raw: Option<&str>,
        from: CircuitState,
    ) -> Result<bool, StoreError> {
        let next =
            PersistedCircuit { state: CircuitState::Open, opened_at_ms: Some(self.clock.unix_millis()) };
        let swapped = self.transition(subscription_id, raw, from, next).await?;
        if swapped {
            self.store.delete(&probes_key(subscription_id)).await?;
            warn!(subscription_id = %subscription_id, from = %from, "circuit breaker opened");
        }
        Ok(swapped)
    }

    async fn transition_to_half_open(
        &self,
        subscription_id: SubscriptionId,
        raw: Option<&str>,
        persisted: PersistedCircuit,
    ) -> Result<bool, StoreError> {
        let next = PersistedCircuit { state: CircuitState::HalfOpen, ..persisted };
        let swapped = self.transition(subscription_id, raw, CircuitState::Open, next).await?;
        if swapped {
            self.store.delete(&probes_key(subscription_id)).await?;
            info!(subscription_id = %subscription_id, "circuit breaker half-open, probing recovery");
        }
        Ok(swapped)
    }

    async fn transition_to_closed(
        &self,
        subscription_id: SubscriptionId,
        raw: Option<&str>,
    ) -> Result<bool, StoreError> {
        let next = PersistedCircuit { state: CircuitState::Closed, opened_at_ms: None };
        let swapped = self.transition(subscription_id, raw, CircuitState::HalfOpen, next).await?;
        if swapped {
            self.store.delete(&failures_key(subscription_id)).await?;
            self.store.delete(&probes_key(subscription_id)).await?;
            info!(subscription_id = %subscription_id, "circuit breaker closed, subscriber recovered");
        }
        Ok(swapped)
    }

    async fn read_counter(&self, key: &str) -> Result<u32, StoreError> {
        match self.store.get(key).await? {
            Some(value) => value.parse().map_err(|_| StoreError::corrupt(key, "counter is not an integer")),
            None => Ok(0),
        }
    }
}

fn state_key(subscription_id: SubscriptionId) -> String {
    format!("circuit:{subscription_id}:state")
}

fn failures_key(subscription_id: SubscriptionId) -> String {
    format!("circuit:{subscription_id}:failures")
}

fn probes_key(subscription_id: SubscriptionId) -> String {
    format!("circuit:{subscription_id}:probes")
}
