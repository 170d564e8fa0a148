//! Integration tests for signing and verifying outbound payloads with every
//! supported algorithm, including the `X-Signature` header round trip.

use std::sync::OnceLock;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use courier_signing::{
    SignatureAlgorithm, SignatureHeader, SignatureService, SigningError, SigningKey,
    VerificationKey,
};
use rsa::{
    pkcs1::{EncodeRsaPrivateKey, EncodeRsaPublicKey},
    pkcs8::{EncodePrivateKey, LineEnding},
    RsaPrivateKey,
};

fn rsa_private_key() -> &'static RsaPrivateKey {
    static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
    KEY.get_or_init(|| {
        let mut rng = rsa::rand_core::OsRng;
        RsaPrivateKey::new(&mut rng, 1024).expect("generate RSA key")
    })
}

fn rsa_pkcs8_pem() -> String {
    rsa_private_key().to_pkcs8_pem(LineEnding::LF).expect("encode PKCS#8").to_string()
}

fn secret_for(algorithm: SignatureAlgorithm) -> String {
    match algorithm {
        SignatureAlgorithm::HmacSha256 | SignatureAlgorithm::HmacSha512 => {
            "whsec_test_secret".to_string()
        },
        SignatureAlgorithm::Ed25519 => BASE64.encode(rand::random::<[u8; 32]>()),
        SignatureAlgorithm::RsaPssSha256 => rsa_pkcs8_pem(),
    }
}

#[test]
fn every_algorithm_verifies_its_own_signature() {
    let service = SignatureService::default();
    let payload = br#"{"event":"order.created","id":42}"#;

    for algorithm in SignatureAlgorithm::ALL {
        let key = SigningKey::from_secret(algorithm, &secret_for(algorithm)).unwrap();
        let signature = service.sign(payload, &key).unwrap();

        assert!(
            service.verify(payload, &signature, &key.verification_key()).unwrap(),
            "{algorithm} signature must verify"
        );
    }
}

#[test]
fn every_algorithm_rejects_tampered_payload() {
    let service = SignatureService::default();

    for algorithm in SignatureAlgorithm::ALL {
        let key = SigningKey::from_secret(algorithm, &secret_for(algorithm)).unwrap();
        let signature = service.sign(b"original", &key).unwrap();

        assert!(
            !service.verify(b"originaL", &signature, &key.verification_key()).unwrap(),
            "{algorithm} must reject a modified payload"
        );
    }
}

#[test]
fn hmac_verification_fails_with_different_secret() {
    let service = SignatureService::default();
    let key = SigningKey::from_secret(SignatureAlgorithm::HmacSha256, "secret-a").unwrap();
    let other =
        VerificationKey::from_public_material(SignatureAlgorithm::HmacSha256, "secret-b").unwrap();

    let signature = service.sign(b"payload", &key).unwrap();

    assert!(!service.verify(b"payload", &signature, &other).unwrap());
}

#[test]
fn rsa_pss_signatures_are_randomized_but_all_verify() {
    let service = SignatureService::default();
    let key = SigningKey::from_secret(SignatureAlgorithm::RsaPssSha256, &rsa_pkcs8_pem()).unwrap();
    let verification = key.verification_key();

    let first = service.sign(b"payload", &key).unwrap();
    let second = service.sign(b"payload", &key).unwrap();

    assert_ne!(first, second);
    assert!(service.verify(b"payload", &first, &verification).unwrap());
    assert!(service.verify(b"payload", &second, &verification).unwrap());
}

#[test]
fn rsa_accepts_pkcs1_keys_and_published_spki() {
    let service = SignatureService::default();
    let pkcs1 = rsa_private_key().to_pkcs1_pem(LineEnding::LF).unwrap().to_string();
    let key = SigningKey::from_secret(SignatureAlgorithm::RsaPssSha256, &pkcs1).unwrap();

    let spki = key.public_material().expect("RSA keys publish a public key");
    let from_spki =
        VerificationKey::from_public_material(SignatureAlgorithm::RsaPssSha256, &spki).unwrap();
    let pkcs1_public = rsa_private_key().to_public_key().to_pkcs1_pem(LineEnding::LF).unwrap();
    let from_pkcs1 =
        VerificationKey::from_public_material(SignatureAlgorithm::RsaPssSha256, &pkcs1_public)
            .unwrap();

    let signature = service.sign(b"payload", &key).unwrap();

    assert!(service.verify(b"payload", &signature, &from_spki).unwrap());
    assert!(service.verify(b"payload", &signature, &from_pkcs1).unwrap());
}

#[test]
fn rsa_rejects_garbage_pem() {
    let result = SigningKey::from_secret(SignatureAlgorithm::RsaPssSha256, "-----BEGIN NOPE-----");
    assert!(matches!(result, Err(SigningError::InvalidKeyFormat { .. })));
}

#[test]
fn rsa_malformed_signature_is_an_error() {
    let service = SignatureService::default();
    let key = SigningKey::from_secret(SignatureAlgorithm::RsaPssSha256, &rsa_pkcs8_pem()).unwrap();

    let result = service.verify(b"payload", "%%%", &key.verification_key());
    assert!(matches!(result, Err(SigningError::MalformedSignature { .. })));
}

#[test]
fn hmac_keys_never_publish_material() {
    let key = SigningKey::from_secret(SignatureAlgorithm::HmacSha512, "secret").unwrap();
    assert!(key.public_material().is_none());
}

#[test]
fn header_round_trip_verifies_within_tolerance() {
    let service = SignatureService::default();
    let key = SigningKey::from_secret(SignatureAlgorithm::HmacSha256, "secret").unwrap();
    let now = 1_700_000_000;

    let header = service.signature_header(b"payload", &key, now).unwrap().to_string();

    assert!(header.starts_with("t=1700000000,v1="));
    assert!(service.verify_header(b"payload", &header, &key.verification_key(), now + 120).unwrap());
}

#[test]
fn stale_header_rejected_even_with_valid_signature() {
    let service = SignatureService::default();
    let key = SigningKey::from_secret(SignatureAlgorithm::Ed25519, &secret_for(SignatureAlgorithm::Ed25519))
        .unwrap();
    let signed_at = 1_700_000_000;

    let header = service.signature_header(b"payload", &key, signed_at).unwrap().to_string();
    let result = service.verify_header(b"payload", &header, &key.verification_key(), signed_at + 301);

    assert!(matches!(result, Err(SigningError::TimestampOutOfTolerance { .. })));
}

#[test]
fn custom_tolerance_is_honoured() {
    let service = SignatureService::with_tolerance(10);
    let key = SigningKey::from_secret(SignatureAlgorithm::HmacSha256, "secret").unwrap();
    let header = SignatureHeader::new(100, service.sign(b"p", &key).unwrap()).to_string();

    assert!(service.verify_header(b"p", &header, &key.verification_key(), 110).unwrap());
    assert!(service.verify_header(b"p", &header, &key.verification_key(), 111).is_err());
}
