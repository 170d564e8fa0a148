//! Outbound webhook signing and verification.
//!
//! Signs delivery payloads with the algorithm configured on a subscription
//! (HMAC-SHA256, HMAC-SHA512, Ed25519 or RSA-PSS/SHA256) and packs the result
//! into the `X-Signature: t=<unix_seconds>,v1=<signature>` header. Everything
//! here is a pure function of its inputs: no network, storage or clock access.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod header;
pub mod signing;

pub use error::{Result, SigningError};
pub use header::{verify_timestamp, SignatureHeader, DEFAULT_TIMESTAMP_TOLERANCE_SECS};
pub use signing::{SignatureAlgorithm, SignatureService, SigningKey, VerificationKey};
