//! Core domain models, clock abstraction and durable storage.
//!
//! Provides the strongly-typed records the delivery engine persists
//! (subscriptions, deliveries, attempts, dead letters), the repositories
//! that read and write them, and the `Clock` every time-dependent component
//! is built on.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod models;
pub mod storage;
pub mod time;

pub use error::{CoreError, Result};
pub use models::{
    AttemptOutcome, BatchConfig, DeadLetterEntry, DeadLetterId, DeadLetterQuery, DeliveryAttemptRecord,
    DeliveryId, DeliveryRecord, DeliveryStatus, DeliveryTransition, FilterSpec, PayloadSnapshot,
    RateLimitConfig, SigningConfig, Subscription, SubscriptionId, SubscriptionStats,
};
pub use time::{Clock, RealClock, TestClock};
