#![no_main]

//! Fuzz target for `X-Signature` header parsing and verification.
//!
//! Subscribers verify headers we send, but the parser also runs in tests
//! and tooling on arbitrary input, so it must reject garbage without
//! panicking.

use courier_signing::{SignatureAlgorithm, SignatureHeader, SignatureService, SigningKey};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };

    if let Ok(header) = text.parse::<SignatureHeader>() {
        // Whatever parses must survive a display round trip.
        let reparsed: SignatureHeader = header.to_string().parse().expect("displayed header reparses");
        assert_eq!(reparsed, header);
    }

    let service = SignatureService::default();
    for algorithm in [SignatureAlgorithm::HmacSha256, SignatureAlgorithm::HmacSha512] {
        let key = SigningKey::from_secret(algorithm, "whsec_fuzz").expect("static secret is valid");
        let _ = service.verify_header(data, text, &key.verification_key(), 1_700_000_000);
    }

    let _ = SigningKey::from_secret(SignatureAlgorithm::Ed25519, text);
});
