//! Property-based tests for signing invariants.
//!
//! Any payload signed with any key must verify with the matching key, and
//! any single-byte change to the payload must make verification fail.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use courier_signing::{SignatureAlgorithm, SignatureHeader, SignatureService, SigningKey};
use proptest::{prelude::*, test_runner::Config as ProptestConfig};

/// Creates property test configuration based on environment.
///
/// Uses environment variables:
/// - `PROPTEST_CASES`: Number of test cases (default: 20 for dev, 100 for CI)
/// - `CI`: If set to "true", uses CI configuration
fn proptest_config() -> ProptestConfig {
    let is_ci = std::env::var("CI").unwrap_or_default() == "true";
    let default_cases = if is_ci { 100 } else { 20 };

    let cases =
        std::env::var("PROPTEST_CASES").ok().and_then(|s| s.parse().ok()).unwrap_or(default_cases);

    ProptestConfig::with_cases(cases)
}

fn symmetric_algorithm() -> impl Strategy<Value = SignatureAlgorithm> {
    prop_oneof![Just(SignatureAlgorithm::HmacSha256), Just(SignatureAlgorithm::HmacSha512)]
}

proptest! {
    #![proptest_config(proptest_config())]

    #[test]
    fn hmac_signatures_always_verify(
        algorithm in symmetric_algorithm(),
        secret in "[a-zA-Z0-9_]{1,64}",
        payload in prop::collection::vec(any::<u8>(), 0..2048),
    ) {
        let service = SignatureService::default();
        let key = SigningKey::from_secret(algorithm, &secret).unwrap();

        let signature = service.sign(&payload, &key).unwrap();

        prop_assert!(service.verify(&payload, &signature, &key.verification_key()).unwrap());
    }

    #[test]
    fn ed25519_signatures_always_verify(
        seed in prop::array::uniform32(any::<u8>()),
        payload in prop::collection::vec(any::<u8>(), 0..2048),
    ) {
        let service = SignatureService::default();
        let key = SigningKey::from_secret(SignatureAlgorithm::Ed25519, &BASE64.encode(seed)).unwrap();

        let signature = service.sign(&payload, &key).unwrap();

        prop_assert!(service.verify(&payload, &signature, &key.verification_key()).unwrap());
    }

    #[test]
    fn flipping_any_payload_byte_breaks_verification(
        algorithm in symmetric_algorithm(),
        payload in prop::collection::vec(any::<u8>(), 1..512),
        index in any::<prop::sample::Index>(),
    ) {
        let service = SignatureService::default();
        let key = SigningKey::from_secret(algorithm, "secret").unwrap();
        let signature = service.sign(&payload, &key).unwrap();

        let mut tampered = payload.clone();
        let position = index.index(tampered.len());
        tampered[position] ^= 0x01;

        prop_assert!(!service.verify(&tampered, &signature, &key.verification_key()).unwrap());
    }

    #[test]
    fn header_display_parses_back(
        timestamp in 0i64..4_000_000_000i64,
        signature in "[A-Za-z0-9+/]{8,88}={0,2}",
    ) {
        let header = SignatureHeader::new(timestamp, signature.clone());
        let parsed: SignatureHeader = header.to_string().parse().unwrap();

        prop_assert_eq!(parsed.timestamp, timestamp);
        prop_assert_eq!(parsed.signature, signature);
    }
}
