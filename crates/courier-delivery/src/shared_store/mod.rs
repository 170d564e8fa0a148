//! Shared coordination store.
//!
//! Circuit state, idempotency markers, token buckets and batch buffers live
//! in a store shared by every engine instance. [`SharedStore`] exposes the
//! primitives those components need: atomic increment, compare-and-swap,
//! per-key expiry, ordered lists and an atomic token-bucket take.
//!
//! [`InMemorySharedStore`] backs tests and single-process deployments; the
//! `redis` feature adds [`RedisSharedStore`](redis::RedisSharedStore).

use std::{fmt::Debug, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use memory::InMemorySharedStore;

/// Result type alias for shared store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Shared store failures.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Backend could not be reached or rejected the command.
    #[error("store unavailable: {message}")]
    Unavailable {
        /// Backend error message
        message: String,
    },

    /// A stored value could not be decoded.
    #[error("corrupt value at {key}: {message}")]
    Corrupt {
        /// Key holding the value
        key: String,
        /// Decoder error message
        message: String,
    },
}

impl StoreError {
    /// Creates an unavailable error.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable { message: message.into() }
    }

    /// Creates a corrupt value error.
    pub fn corrupt(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Corrupt { key: key.into(), message: message.into() }
    }
}

/// Key-value store shared across engine instances.
///
/// Every method is atomic with respect to other callers on the same key.
#[async_trait]
pub trait SharedStore: Send + Sync + Debug {
    /// Reads a string value.
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Writes a string value, replacing any previous one.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()>;

    /// Writes `value` only when `key` is absent. Returns whether it was
    /// written.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Option<Duration>)
        -> StoreResult<bool>;

    /// Replaces the value at `key` with `new` only if the current value equals
    /// `expected` (`None` meaning absent). Returns whether it was swapped.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl: Option<Duration>,
    ) -> StoreResult<bool>;

    /// Increments an integer counter and returns the new value. `ttl` is
    /// applied when the counter is created, which makes it a window.
    async fn increment(&self, key: &str, ttl: Option<Duration>) -> StoreResult<i64>;

    /// Removes a key of any type.
    async fn delete(&self, key: &str) -> StoreResult<()>;

    /// Appends to the list at `key` and returns the new length.
    async fn push(&self, key: &str, value: &str) -> StoreResult<usize>;

    /// Reads the whole list at `key` in insertion order.
    async fn range(&self, key: &str) -> StoreResult<Vec<String>>;

    /// Reads and removes the whole list at `key` in one step.
    async fn drain(&self, key: &str) -> StoreResult<Vec<String>>;

    /// Puts drained `values` back at the head of the list at `key`, ahead
    /// of anything pushed since. Returns the new length.
    async fn restore(&self, key: &str, values: &[String]) -> StoreResult<usize>;

    /// Lists keys starting with `prefix`.
    async fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>>;

    /// Refills the bucket at `key` and takes `cost` tokens if available.
    ///
    /// A missing bucket starts full. Returns whether the tokens were taken.
    async fn take_tokens(&self, key: &str, bucket: TokenBucket, now_ms: i64) -> StoreResult<bool>;
}

/// Token bucket parameters for [`SharedStore::take_tokens`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenBucket {
    /// Maximum tokens held.
    pub capacity: f64,
    /// Tokens added per second.
    pub refill_per_second: f64,
    /// Tokens consumed by one request.
    pub cost: f64,
}

impl TokenBucket {
    /// Seconds until an empty bucket can serve one request, used as the
    /// bucket's expiry.
    pub fn idle_ttl(&self) -> Duration {
        if self.refill_per_second <= 0.0 {
            return Duration::from_secs(24 * 60 * 60);
        }
        let secs = (self.capacity / self.refill_per_second).ceil().max(1.0);
        Duration::from_secs_f64(secs * 2.0)
    }
}

/// Persisted bucket contents.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketState {
    /// Tokens currently available.
    pub tokens: f64,
    /// Unix millis of the last refill.
    pub last_refill_ms: i64,
}

impl BucketState {
    /// Applies refill since the last update, then tries to take `cost`.
    ///
    /// Returns the updated state and whether the take succeeded.
    pub fn refill_and_take(state: Option<Self>, bucket: TokenBucket, now_ms: i64) -> (Self, bool) {
        let mut state =
            state.unwrap_or(Self { tokens: bucket.capacity, last_refill_ms: now_ms });

        let elapsed_ms = now_ms.saturating_sub(state.last_refill_ms).max(0);
        #[allow(clippy::cast_precision_loss)]
        let refill = elapsed_ms as f64 / 1000.0 * bucket.refill_per_second;
        state.tokens = (state.tokens + refill).min(bucket.capacity);
        state.last_refill_ms = now_ms.max(state.last_refill_ms);

        if state.tokens >= bucket.cost {
            state.tokens -= bucket.cost;
            (state, true)
        } else {
            (state, false)
        }
    }
}
