//! Webhook delivery engine with reliability guarantees.
//!
//! Turns internal events into signed HTTP POSTs to subscriber endpoints with
//! retries, circuit breaking, rate limiting, batching and a dead letter
//! queue.
//!
//! # Architecture
//!
//! Triggers only persist pending deliveries. A single retry poller claims due
//! records from storage and runs each attempt on its own task, bounded by the
//! worker count:
//!
//! 1. **Admit** - idempotency, circuit, rate-limit and transformation gates
//! 2. **Claim** - due records are leased so no other poller takes them
//! 3. **Deliver** - sign, POST, and time out per attempt tier
//! 4. **Record** - attempt and transition are written under an attempt guard
//! 5. **Settle** - success, backoff retry, or dead letter
//!
//! Coordination state (circuits, token buckets, idempotency keys, batch
//! buffers) lives in a [`shared_store::SharedStore`]: in memory for a single
//! process, or Redis with the `redis` feature.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use courier_core::{storage::Storage, RealClock};
//! use courier_delivery::{
//!     shared_store::InMemorySharedStore, storage::PostgresDeliveryStorage, DeliveryConfig,
//!     DeliveryEngine,
//! };
//!
//! # async fn example(database: Arc<Storage>) -> courier_delivery::Result<()> {
//! let clock = Arc::new(RealClock::new());
//! let storage = Arc::new(PostgresDeliveryStorage::new(database));
//! let store = Arc::new(InMemorySharedStore::new(clock.clone()));
//!
//! let mut engine = DeliveryEngine::new(storage, store, DeliveryConfig::default(), clock)?;
//! engine.start().await?;
//! # Ok(())
//! # }
//! ```

pub mod batch;
pub mod broadcaster;
pub mod circuit;
pub mod client;
pub mod dead_letter;
pub mod engine;
pub mod error;
pub mod idempotency;
pub mod matcher;
pub mod orchestrator;
pub mod rate_limit;
pub mod retry;
pub mod shared_store;
pub mod stats;
pub mod storage;
pub mod transform;
mod worker_pool;

pub use batch::{BatchItem, QueueOutcome};
pub use broadcaster::BroadcastSummary;
pub use circuit::{CircuitConfig, CircuitSnapshot, CircuitState};
pub use engine::{DeliveryConfig, DeliveryEngine};
pub use error::{DeliveryError, ErrorKind, Result};
pub use orchestrator::{AttemptDisposition, TriggerOutcome};
pub use retry::RetryPolicy;
pub use stats::EngineStats;

/// Default number of attempts in flight at once.
pub const DEFAULT_WORKER_COUNT: usize = 10;

/// Default number of due deliveries claimed per poll.
pub const DEFAULT_CLAIM_BATCH_SIZE: usize = 50;
