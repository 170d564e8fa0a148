//! `X-Signature` header encoding.
//!
//! The header binds a unix timestamp to the signature: `t=<unix>,v1=<sig>`.
//! Unknown `key=value` pairs are ignored when parsing so new signature
//! versions can be added alongside `v1`.

use std::{fmt, str::FromStr};

use crate::error::{Result, SigningError};

/// Default replay window for signature timestamps.
pub const DEFAULT_TIMESTAMP_TOLERANCE_SECS: u64 = 300;

/// Parsed `X-Signature` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureHeader {
    /// Unix seconds at signing time.
    pub timestamp: i64,
    /// Encoded signature (hex for HMAC, base64 otherwise).
    pub signature: String,
}

impl SignatureHeader {
    /// Creates a header from its parts.
    pub fn new(timestamp: i64, signature: impl Into<String>) -> Self {
        Self { timestamp, signature: signature.into() }
    }
}

impl fmt::Display for SignatureHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t={},v1={}", self.timestamp, self.signature)
    }
}

impl FromStr for SignatureHeader {
    type Err = SigningError;

    fn from_str(s: &str) -> Result<Self> {
        let mut timestamp = None;
        let mut signature = None;

        for part in s.split(',') {
            let Some((key, value)) = part.trim().split_once('=') else {
                return Err(SigningError::malformed_header(format!("expected key=value, got '{part}'")));
            };
            match key {
                "t" => {
                    let parsed = value.parse::<i64>().map_err(|_| {
                        SigningError::malformed_header(format!("invalid timestamp '{value}'"))
                    })?;
                    timestamp = Some(parsed);
                },
                // first v1 wins
                "v1" if signature.is_none() => {
                    if value.is_empty() {
                        return Err(SigningError::malformed_header("empty v1 signature"));
                    }
                    signature = Some(value.to_string());
                },
                _ => {},
            }
        }

        match (timestamp, signature) {
            (Some(timestamp), Some(signature)) => Ok(Self { timestamp, signature }),
            (None, _) => Err(SigningError::malformed_header("missing t= component")),
            (_, None) => Err(SigningError::malformed_header("missing v1= component")),
        }
    }
}

/// Rejects timestamps more than `tolerance_secs` away from `now` in either
/// direction.
///
/// # Errors
///
/// Returns `SigningError::TimestampOutOfTolerance` when outside the window.
pub fn verify_timestamp(timestamp: i64, now: i64, tolerance_secs: u64) -> Result<()> {
    if now.abs_diff(timestamp) > tolerance_secs {
        return Err(SigningError::TimestampOutOfTolerance { timestamp, now, tolerance_secs });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_uses_wire_format() {
        let header = SignatureHeader::new(1_700_000_000, "abc123");
        assert_eq!(header.to_string(), "t=1700000000,v1=abc123");
    }

    #[test]
    fn parses_base64_signature_with_padding() {
        let header: SignatureHeader = "t=42,v1=YWJjZA==".parse().unwrap();
        assert_eq!(header.timestamp, 42);
        assert_eq!(header.signature, "YWJjZA==");
    }

    #[test]
    fn ignores_unknown_components_and_whitespace() {
        let header: SignatureHeader = "t=42, v0=old, v1=new".parse().unwrap();
        assert_eq!(header.signature, "new");
    }

    #[test]
    fn missing_components_are_rejected() {
        assert!(matches!(
            "v1=abc".parse::<SignatureHeader>(),
            Err(SigningError::MalformedHeader { .. })
        ));
        assert!(matches!(
            "t=42".parse::<SignatureHeader>(),
            Err(SigningError::MalformedHeader { .. })
        ));
        assert!(matches!(
            "garbage".parse::<SignatureHeader>(),
            Err(SigningError::MalformedHeader { .. })
        ));
        assert!(matches!(
            "t=soon,v1=abc".parse::<SignatureHeader>(),
            Err(SigningError::MalformedHeader { .. })
        ));
    }

    #[test]
    fn timestamp_window_is_symmetric() {
        assert!(verify_timestamp(1000, 1300, 300).is_ok());
        assert!(verify_timestamp(1300, 1000, 300).is_ok());
        assert!(verify_timestamp(1000, 1301, 300).is_err());
        assert!(verify_timestamp(1301, 1000, 300).is_err());
    }
}
