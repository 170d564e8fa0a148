//! Error types for webhook delivery operations.
//!
//! Covers everything that can go wrong between an inbound trigger and the
//! final outcome of a delivery: network failures, HTTP errors, admission
//! control, payload transformation, signing and the two backing stores.
//! Every error maps onto an [`ErrorKind`] which drives retry decisions.

use std::{fmt, time::Duration};

use courier_core::CoreError;
use courier_signing::SigningError;
use thiserror::Error;

use crate::{shared_store::StoreError, transform::TransformationError};

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Error types for webhook delivery operations.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// Network-level connectivity failure.
    #[error("network connection failed: {message}")]
    NetworkError {
        /// Error message describing the network failure
        message: String,
    },

    /// HTTP request exceeded its timeout tier.
    #[error("request timeout after {timeout_seconds}s")]
    Timeout {
        /// Number of seconds before the request timed out
        timeout_seconds: u64,
    },

    /// HTTP response indicated client error (4xx).
    #[error("client error: HTTP {status_code}")]
    ClientError {
        /// HTTP status code (4xx)
        status_code: u16,
        /// Truncated response body
        body: String,
    },

    /// HTTP response indicated server error (5xx) or another non-2xx status.
    #[error("server error: HTTP {status_code}")]
    ServerError {
        /// HTTP status code
        status_code: u16,
        /// Truncated response body
        body: String,
    },

    /// Subscription token bucket is empty.
    #[error("rate limit exceeded for subscription {subscription_id}")]
    RateLimited {
        /// Subscription whose bucket denied the request
        subscription_id: String,
    },

    /// Circuit breaker is open, delivery blocked.
    #[error("circuit breaker open for subscription {subscription_id}")]
    CircuitOpen {
        /// Subscription with open circuit
        subscription_id: String,
    },

    /// Payload could not be reshaped for the subscription.
    #[error("payload transformation failed: {0}")]
    Transformation(#[from] TransformationError),

    /// Payload could not be signed with the subscription's key.
    #[error("signing failed: {0}")]
    Signing(#[from] SigningError),

    /// Subscription does not exist.
    #[error("subscription {subscription_id} not found")]
    SubscriptionNotFound {
        /// Requested subscription id
        subscription_id: String,
    },

    /// Delivery record does not exist.
    #[error("delivery {delivery_id} not found")]
    DeliveryNotFound {
        /// Requested delivery id
        delivery_id: String,
    },

    /// Dead-letter entry does not exist.
    #[error("dead letter {id} not found")]
    DeadLetterNotFound {
        /// Requested entry id
        id: String,
    },

    /// Archived dead-letter entries cannot be replayed.
    #[error("dead letter {id} is archived")]
    DeadLetterArchived {
        /// Archived entry id
        id: String,
    },

    /// Durable store operation failed.
    #[error("database error: {message}")]
    DatabaseError {
        /// Database error message
        message: String,
    },

    /// Shared coordination store is unreachable.
    #[error("shared store unavailable: {message}")]
    StoreUnavailable {
        /// Store error message
        message: String,
    },

    /// Invalid subscription or engine configuration.
    #[error("invalid configuration: {message}")]
    ConfigurationError {
        /// Configuration error message
        message: String,
    },

    /// Background tasks did not stop within the shutdown timeout.
    #[error("shutdown timed out after {timeout:?}")]
    ShutdownTimeout {
        /// Timeout that elapsed
        timeout: Duration,
    },

    /// A background task panicked.
    #[error("worker {worker_id} panicked: {error}")]
    WorkerPanic {
        /// Name of the task
        worker_id: String,
        /// Join error text
        error: String,
    },

    /// Unexpected internal error.
    #[error("internal delivery error: {message}")]
    InternalError {
        /// Internal error message
        message: String,
    },
}

impl DeliveryError {
    /// Creates a network error from a message.
    pub fn network(message: impl Into<String>) -> Self {
        Self::NetworkError { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout_seconds: u64) -> Self {
        Self::Timeout { timeout_seconds }
    }

    /// Creates a client error from HTTP response.
    pub fn client_error(status_code: u16, body: impl Into<String>) -> Self {
        Self::ClientError { status_code, body: body.into() }
    }

    /// Creates a server error from HTTP response.
    pub fn server_error(status_code: u16, body: impl Into<String>) -> Self {
        Self::ServerError { status_code, body: body.into() }
    }

    /// Maps a non-2xx status to a client or server error.
    pub fn from_status(status_code: u16, body: impl Into<String>) -> Self {
        if (400..500).contains(&status_code) {
            Self::client_error(status_code, body)
        } else {
            Self::server_error(status_code, body)
        }
    }

    /// Creates a rate limit error.
    pub fn rate_limited(subscription_id: impl fmt::Display) -> Self {
        Self::RateLimited { subscription_id: subscription_id.to_string() }
    }

    /// Creates a circuit open error.
    pub fn circuit_open(subscription_id: impl fmt::Display) -> Self {
        Self::CircuitOpen { subscription_id: subscription_id.to_string() }
    }

    /// Creates a subscription not found error.
    pub fn subscription_not_found(subscription_id: impl fmt::Display) -> Self {
        Self::SubscriptionNotFound { subscription_id: subscription_id.to_string() }
    }

    /// Creates a database error.
    pub fn database(message: impl Into<String>) -> Self {
        Self::DatabaseError { message: message.into() }
    }

    /// Creates a shared store error.
    pub fn store_unavailable(message: impl Into<String>) -> Self {
        Self::StoreUnavailable { message: message.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::ConfigurationError { message: message.into() }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::InternalError { message: message.into() }
    }

    /// Classifies the error for retry and reporting decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NetworkError { .. } | Self::Timeout { .. } | Self::ServerError { .. } => {
                ErrorKind::Transient
            },
            Self::ClientError { status_code, .. } => {
                if matches!(status_code, 408 | 429) {
                    ErrorKind::Transient
                } else {
                    ErrorKind::Permanent
                }
            },
            Self::RateLimited { .. } => ErrorKind::AdmissionDenied,
            Self::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Self::DatabaseError { .. } | Self::StoreUnavailable { .. } => {
                ErrorKind::StoreUnavailable
            },
            Self::Transformation(_)
            | Self::Signing(_)
            | Self::SubscriptionNotFound { .. }
            | Self::DeliveryNotFound { .. }
            | Self::DeadLetterNotFound { .. }
            | Self::DeadLetterArchived { .. }
            | Self::ConfigurationError { .. }
            | Self::ShutdownTimeout { .. }
            | Self::WorkerPanic { .. }
            | Self::InternalError { .. } => ErrorKind::Permanent,
        }
    }

    /// Determines if a failed attempt with this error should be retried.
    ///
    /// Network errors, timeouts, 5xx, 408 and 429 are retryable. Other 4xx
    /// are permanent but, like every HTTP failure, still retry until the
    /// subscription's attempt budget is spent. Configuration, signing and
    /// transformation errors are never retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transient | ErrorKind::StoreUnavailable)
    }

    /// HTTP status carried by the error, if any.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            Self::ClientError { status_code, .. } | Self::ServerError { status_code, .. } => {
                Some(*status_code)
            },
            _ => None,
        }
    }
}

impl From<CoreError> for DeliveryError {
    fn from(error: CoreError) -> Self {
        match error {
            CoreError::InvalidInput(message) => Self::configuration(message),
            other => Self::database(other.to_string()),
        }
    }
}

impl From<StoreError> for DeliveryError {
    fn from(error: StoreError) -> Self {
        Self::store_unavailable(error.to_string())
    }
}

/// Failure taxonomy used for retry decisions and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Worth retrying with backoff.
    Transient,
    /// Retrying cannot help.
    Permanent,
    /// Dropped by the rate limiter.
    AdmissionDenied,
    /// Fast-failed by the circuit breaker.
    CircuitOpen,
    /// A backing store could not be reached.
    StoreUnavailable,
}

impl From<&DeliveryError> for ErrorKind {
    fn from(error: &DeliveryError) -> Self {
        error.kind()
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::Permanent => write!(f, "permanent"),
            Self::AdmissionDenied => write!(f, "admission_denied"),
            Self::CircuitOpen => write!(f, "circuit_open"),
            Self::StoreUnavailable => write!(f, "store_unavailable"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors_identified_correctly() {
        assert!(DeliveryError::network("connection refused").is_retryable());
        assert!(DeliveryError::timeout(5).is_retryable());
        assert!(DeliveryError::server_error(503, "unavailable").is_retryable());
        assert!(DeliveryError::client_error(408, "").is_retryable());
        assert!(DeliveryError::client_error(429, "slow down").is_retryable());
        assert!(DeliveryError::database("connection lost").is_retryable());

        assert!(!DeliveryError::client_error(404, "not found").is_retryable());
        assert!(!DeliveryError::client_error(400, "bad request").is_retryable());
        assert!(!DeliveryError::circuit_open("sub-1").is_retryable());
        assert!(!DeliveryError::rate_limited("sub-1").is_retryable());
        assert!(!DeliveryError::configuration("invalid URL").is_retryable());
        assert!(!DeliveryError::from(TransformationError::render("boom")).is_retryable());
    }

    #[test]
    fn error_kinds_mapped_correctly() {
        assert_eq!(ErrorKind::from(&DeliveryError::network("x")), ErrorKind::Transient);
        assert_eq!(ErrorKind::from(&DeliveryError::client_error(422, "")), ErrorKind::Permanent);
        assert_eq!(ErrorKind::from(&DeliveryError::rate_limited("s")), ErrorKind::AdmissionDenied);
        assert_eq!(ErrorKind::from(&DeliveryError::circuit_open("s")), ErrorKind::CircuitOpen);
        assert_eq!(
            ErrorKind::from(&DeliveryError::store_unavailable("down")),
            ErrorKind::StoreUnavailable
        );
        assert_eq!(
            ErrorKind::from(&DeliveryError::from(SigningError::invalid_key_format("bad"))),
            ErrorKind::Permanent
        );
    }

    #[test]
    fn status_mapping_splits_client_and_server() {
        assert!(matches!(
            DeliveryError::from_status(404, ""),
            DeliveryError::ClientError { status_code: 404, .. }
        ));
        assert!(matches!(
            DeliveryError::from_status(500, ""),
            DeliveryError::ServerError { status_code: 500, .. }
        ));
        assert!(matches!(
            DeliveryError::from_status(302, ""),
            DeliveryError::ServerError { status_code: 302, .. }
        ));
        assert_eq!(DeliveryError::from_status(502, "").http_status(), Some(502));
        assert_eq!(DeliveryError::timeout(5).http_status(), None);
    }

    #[test]
    fn core_errors_convert() {
        let err = DeliveryError::from(CoreError::InvalidInput("bad".into()));
        assert!(matches!(err, DeliveryError::ConfigurationError { .. }));

        let err = DeliveryError::from(CoreError::Database("pool closed".into()));
        assert_eq!(err.kind(), ErrorKind::StoreUnavailable);
    }

    #[test]
    fn error_display_format() {
        assert_eq!(DeliveryError::timeout(30).to_string(), "request timeout after 30s");
        assert_eq!(ErrorKind::AdmissionDenied.to_string(), "admission_denied");
        assert_eq!(
            DeliveryError::circuit_open("sub-123").to_string(),
            "circuit breaker open for subscription sub-123"
        );
    }
}
