//! Error types for signing, verification and header handling.

/// Result type alias for signing operations.
pub type Result<T> = std::result::Result<T, SigningError>;

/// Errors raised while loading keys, signing payloads or parsing headers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SigningError {
    /// Key material could not be decoded for the requested algorithm.
    #[error("invalid key format: {message}")]
    InvalidKeyFormat {
        /// Detailed error message explaining the format issue.
        message: String,
    },

    /// Signature bytes are not valid for the algorithm (wrong length or
    /// encoding). A well-formed signature that does not match is not an error.
    #[error("malformed signature: {message}")]
    MalformedSignature {
        /// Detailed error message explaining the encoding issue.
        message: String,
    },

    /// Signing key and verification key belong to different algorithms.
    #[error("algorithm mismatch: expected {expected}, got {actual}")]
    AlgorithmMismatch {
        /// Algorithm of the key.
        expected: String,
        /// Algorithm requested by the caller.
        actual: String,
    },

    /// The underlying signer failed.
    #[error("signing failed: {message}")]
    SigningFailed {
        /// Error reported by the signing backend.
        message: String,
    },

    /// `X-Signature` header is not in `t=<unix>,v1=<sig>` form.
    #[error("malformed signature header: {message}")]
    MalformedHeader {
        /// What was wrong with the header.
        message: String,
    },

    /// Signature timestamp is outside the accepted tolerance window.
    #[error("timestamp {timestamp} outside tolerance of {tolerance_secs}s (now {now})")]
    TimestampOutOfTolerance {
        /// Timestamp carried by the signature header.
        timestamp: i64,
        /// Verifier's current unix time.
        now: i64,
        /// Allowed skew in seconds.
        tolerance_secs: u64,
    },
}

impl SigningError {
    /// Create an invalid key format error with a custom message.
    pub fn invalid_key_format(message: impl Into<String>) -> Self {
        Self::InvalidKeyFormat { message: message.into() }
    }

    /// Create a malformed signature error with a custom message.
    pub fn malformed_signature(message: impl Into<String>) -> Self {
        Self::MalformedSignature { message: message.into() }
    }

    /// Create a malformed header error with a custom message.
    pub fn malformed_header(message: impl Into<String>) -> Self {
        Self::MalformedHeader { message: message.into() }
    }
}
