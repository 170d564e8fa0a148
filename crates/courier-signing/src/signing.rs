//! Payload signing and verification for every supported algorithm.
//!
//! HMAC variants produce lowercase hex digests and verify in constant time.
//! Ed25519 and RSA-PSS produce base64 signatures and verify against the
//! public half of the key. RSA-PSS uses MGF1-SHA256 with the maximum salt
//! length the modulus allows.

use std::{fmt, str::FromStr};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ed25519_dalek::{Signer as _, Verifier as _};
use hmac::{Hmac, Mac};
use rsa::{
    pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey},
    pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePublicKey, LineEnding},
    pss,
    signature::{RandomizedSigner, SignatureEncoding, Verifier as _},
    traits::PublicKeyParts,
    RsaPrivateKey, RsaPublicKey,
};
use serde::{Deserialize, Serialize};
use sha2::{Sha256, Sha512};
use subtle::ConstantTimeEq;

use crate::{
    error::{Result, SigningError},
    header::{verify_timestamp, SignatureHeader, DEFAULT_TIMESTAMP_TOLERANCE_SECS},
};

type HmacSha256 = Hmac<Sha256>;
type HmacSha512 = Hmac<Sha512>;

const SHA256_OUTPUT_LEN: usize = 32;

/// Signature algorithm configured on a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SignatureAlgorithm {
    /// HMAC with SHA-256, hex encoded.
    #[default]
    HmacSha256,
    /// HMAC with SHA-512, hex encoded.
    HmacSha512,
    /// Ed25519, base64 encoded.
    Ed25519,
    /// RSA-PSS with SHA-256 and MGF1-SHA256, base64 encoded.
    RsaPssSha256,
}

impl SignatureAlgorithm {
    /// All supported algorithms.
    pub const ALL: [Self; 4] = [Self::HmacSha256, Self::HmacSha512, Self::Ed25519, Self::RsaPssSha256];

    /// Canonical lowercase name.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::HmacSha256 => "hmac_sha256",
            Self::HmacSha512 => "hmac_sha512",
            Self::Ed25519 => "ed25519",
            Self::RsaPssSha256 => "rsa_pss_sha256",
        }
    }

    /// Whether signing and verification share the same secret.
    pub const fn is_symmetric(&self) -> bool {
        matches!(self, Self::HmacSha256 | Self::HmacSha512)
    }
}

impl fmt::Display for SignatureAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SignatureAlgorithm {
    type Err = SigningError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "hmac_sha256" => Ok(Self::HmacSha256),
            "hmac_sha512" => Ok(Self::HmacSha512),
            "ed25519" => Ok(Self::Ed25519),
            "rsa_pss_sha256" => Ok(Self::RsaPssSha256),
            other => Err(SigningError::invalid_key_format(format!("unknown algorithm: {other}"))),
        }
    }
}

/// Private key material used to sign outbound payloads.
#[derive(Clone)]
pub enum SigningKey {
    /// Shared HMAC-SHA256 secret.
    HmacSha256(Vec<u8>),
    /// Shared HMAC-SHA512 secret.
    HmacSha512(Vec<u8>),
    /// Ed25519 private key.
    Ed25519(ed25519_dalek::SigningKey),
    /// RSA private key used with PSS padding.
    RsaPss(Box<RsaPrivateKey>),
}

impl SigningKey {
    /// Loads signing key material as stored on a subscription.
    ///
    /// HMAC secrets are used as raw UTF-8 bytes. Ed25519 keys are a base64
    /// encoded 32-byte seed. RSA keys are PKCS#8 or PKCS#1 PEM.
    ///
    /// # Errors
    ///
    /// Returns `SigningError::InvalidKeyFormat` if the material cannot be
    /// decoded for the algorithm.
    pub fn from_secret(algorithm: SignatureAlgorithm, secret: &str) -> Result<Self> {
        match algorithm {
            SignatureAlgorithm::HmacSha256 => Ok(Self::HmacSha256(hmac_secret(secret)?)),
            SignatureAlgorithm::HmacSha512 => Ok(Self::HmacSha512(hmac_secret(secret)?)),
            SignatureAlgorithm::Ed25519 => {
                let seed = decode_ed25519_bytes(secret)?;
                Ok(Self::Ed25519(ed25519_dalek::SigningKey::from_bytes(&seed)))
            },
            SignatureAlgorithm::RsaPssSha256 => {
                let pem = secret.trim();
                let key = RsaPrivateKey::from_pkcs8_pem(pem)
                    .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
                    .map_err(|e| {
                        SigningError::invalid_key_format(format!("RSA private key: {e}"))
                    })?;
                Ok(Self::RsaPss(Box::new(key)))
            },
        }
    }

    /// Algorithm this key signs with.
    pub fn algorithm(&self) -> SignatureAlgorithm {
        match self {
            Self::HmacSha256(_) => SignatureAlgorithm::HmacSha256,
            Self::HmacSha512(_) => SignatureAlgorithm::HmacSha512,
            Self::Ed25519(_) => SignatureAlgorithm::Ed25519,
            Self::RsaPss(_) => SignatureAlgorithm::RsaPssSha256,
        }
    }

    /// Key that verifies signatures produced by this key.
    pub fn verification_key(&self) -> VerificationKey {
        match self {
            Self::HmacSha256(secret) => VerificationKey::HmacSha256(secret.clone()),
            Self::HmacSha512(secret) => VerificationKey::HmacSha512(secret.clone()),
            Self::Ed25519(key) => VerificationKey::Ed25519(key.verifying_key()),
            Self::RsaPss(key) => VerificationKey::RsaPss(Box::new(key.to_public_key())),
        }
    }

    /// Public key material subscribers use to verify signatures.
    ///
    /// Returns `None` for HMAC keys, whose secret must never be published.
    pub fn public_material(&self) -> Option<String> {
        match self {
            Self::HmacSha256(_) | Self::HmacSha512(_) => None,
            Self::Ed25519(key) => Some(BASE64.encode(key.verifying_key().to_bytes())),
            Self::RsaPss(key) => key.to_public_key().to_public_key_pem(LineEnding::LF).ok(),
        }
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey").field("algorithm", &self.algorithm()).finish_non_exhaustive()
    }
}

/// Key material used to verify a signature.
#[derive(Clone)]
pub enum VerificationKey {
    /// Shared HMAC-SHA256 secret.
    HmacSha256(Vec<u8>),
    /// Shared HMAC-SHA512 secret.
    HmacSha512(Vec<u8>),
    /// Ed25519 public key.
    Ed25519(ed25519_dalek::VerifyingKey),
    /// RSA public key.
    RsaPss(Box<RsaPublicKey>),
}

impl VerificationKey {
    /// Loads verification material: the shared secret for HMAC, a base64
    /// 32-byte public key for Ed25519, or an SPKI / PKCS#1 PEM for RSA.
    ///
    /// # Errors
    ///
    /// Returns `SigningError::InvalidKeyFormat` if the material cannot be
    /// decoded.
    pub fn from_public_material(algorithm: SignatureAlgorithm, material: &str) -> Result<Self> {
        match algorithm {
            SignatureAlgorithm::HmacSha256 => Ok(Self::HmacSha256(hmac_secret(material)?)),
            SignatureAlgorithm::HmacSha512 => Ok(Self::HmacSha512(hmac_secret(material)?)),
            SignatureAlgorithm::Ed25519 => {
                let bytes = decode_ed25519_bytes(material)?;
                let key = ed25519_dalek::VerifyingKey::from_bytes(&bytes).map_err(|e| {
                    SigningError::invalid_key_format(format!("Ed25519 public key: {e}"))
                })?;
                Ok(Self::Ed25519(key))
            },
            SignatureAlgorithm::RsaPssSha256 => {
                let pem = material.trim();
                let key = RsaPublicKey::from_public_key_pem(pem)
                    .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
                    .map_err(|e| {
                        SigningError::invalid_key_format(format!("RSA public key: {e}"))
                    })?;
                Ok(Self::RsaPss(Box::new(key)))
            },
        }
    }

    /// Algorithm this key verifies.
    pub fn algorithm(&self) -> SignatureAlgorithm {
        match self {
            Self::HmacSha256(_) => SignatureAlgorithm::HmacSha256,
            Self::HmacSha512(_) => SignatureAlgorithm::HmacSha512,
            Self::Ed25519(_) => SignatureAlgorithm::Ed25519,
            Self::RsaPss(_) => SignatureAlgorithm::RsaPssSha256,
        }
    }
}

impl fmt::Debug for VerificationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerificationKey")
            .field("algorithm", &self.algorithm())
            .finish_non_exhaustive()
    }
}

/// Signs outbound payloads and verifies inbound signatures.
///
/// Stateless apart from the timestamp tolerance applied by
/// [`SignatureService::verify_header`].
#[derive(Debug, Clone, Copy)]
pub struct SignatureService {
    timestamp_tolerance_secs: u64,
}

impl Default for SignatureService {
    fn default() -> Self {
        Self { timestamp_tolerance_secs: DEFAULT_TIMESTAMP_TOLERANCE_SECS }
    }
}

impl SignatureService {
    /// Creates a service with a custom timestamp tolerance.
    pub fn with_tolerance(timestamp_tolerance_secs: u64) -> Self {
        Self { timestamp_tolerance_secs }
    }

    /// Signs `payload` and returns the encoded signature.
    ///
    /// HMAC output is lowercase hex; Ed25519 and RSA-PSS output is standard
    /// base64. HMAC and Ed25519 are deterministic; RSA-PSS uses a random
    /// salt so repeated calls yield different (equally valid) signatures.
    ///
    /// # Errors
    ///
    /// Returns `SigningError::SigningFailed` if the backend rejects the key.
    pub fn sign(&self, payload: &[u8], key: &SigningKey) -> Result<String> {
        match key {
            SigningKey::HmacSha256(secret) => Ok(hex::encode(hmac_sha256(secret, payload)?)),
            SigningKey::HmacSha512(secret) => Ok(hex::encode(hmac_sha512(secret, payload)?)),
            SigningKey::Ed25519(signing_key) => {
                Ok(BASE64.encode(signing_key.sign(payload).to_bytes()))
            },
            SigningKey::RsaPss(private_key) => {
                let salt_len = max_pss_salt_len(private_key.size())?;
                let signer = pss::BlindedSigningKey::<Sha256>::new_with_salt_len(
                    private_key.as_ref().clone(),
                    salt_len,
                );
                let mut rng = rsa::rand_core::OsRng;
                let signature = signer
                    .try_sign_with_rng(&mut rng, payload)
                    .map_err(|e| SigningError::SigningFailed { message: e.to_string() })?;
                Ok(BASE64.encode(signature.to_bytes()))
            },
        }
    }

    /// Verifies `signature` over `payload`.
    ///
    /// Returns `Ok(false)` for a well-formed signature that does not match.
    ///
    /// # Errors
    ///
    /// Returns `SigningError::MalformedSignature` if the signature cannot be
    /// decoded for the key's algorithm.
    pub fn verify(&self, payload: &[u8], signature: &str, key: &VerificationKey) -> Result<bool> {
        match key {
            VerificationKey::HmacSha256(secret) => {
                let expected = hex::encode(hmac_sha256(secret, payload)?);
                Ok(constant_time_eq(expected.as_bytes(), signature.trim().as_bytes()))
            },
            VerificationKey::HmacSha512(secret) => {
                let expected = hex::encode(hmac_sha512(secret, payload)?);
                Ok(constant_time_eq(expected.as_bytes(), signature.trim().as_bytes()))
            },
            VerificationKey::Ed25519(verifying_key) => {
                let bytes = decode_base64_signature(signature)?;
                let signature = ed25519_dalek::Signature::from_slice(&bytes)
                    .map_err(|e| SigningError::malformed_signature(e.to_string()))?;
                Ok(verifying_key.verify(payload, &signature).is_ok())
            },
            VerificationKey::RsaPss(public_key) => {
                let bytes = decode_base64_signature(signature)?;
                let signature = pss::Signature::try_from(bytes.as_slice())
                    .map_err(|e| SigningError::malformed_signature(e.to_string()))?;
                let salt_len = max_pss_salt_len(public_key.size())?;
                let verifier = pss::VerifyingKey::<Sha256>::new_with_salt_len(
                    public_key.as_ref().clone(),
                    salt_len,
                );
                Ok(verifier.verify(payload, &signature).is_ok())
            },
        }
    }

    /// Signs `payload` and packs the result with `timestamp` into a header.
    ///
    /// # Errors
    ///
    /// Propagates signing failures.
    pub fn signature_header(
        &self,
        payload: &[u8],
        key: &SigningKey,
        timestamp: i64,
    ) -> Result<SignatureHeader> {
        Ok(SignatureHeader::new(timestamp, self.sign(payload, key)?))
    }

    /// Parses an `X-Signature` header, checks its timestamp against `now`
    /// and verifies the signature.
    ///
    /// # Errors
    ///
    /// Returns `MalformedHeader` for unparseable headers and
    /// `TimestampOutOfTolerance` for stale or future timestamps, regardless
    /// of whether the signature itself would verify.
    pub fn verify_header(
        &self,
        payload: &[u8],
        header: &str,
        key: &VerificationKey,
        now: i64,
    ) -> Result<bool> {
        let parsed: SignatureHeader = header.parse()?;
        verify_timestamp(parsed.timestamp, now, self.timestamp_tolerance_secs)?;
        self.verify(payload, &parsed.signature, key)
    }
}

fn hmac_secret(secret: &str) -> Result<Vec<u8>> {
    if secret.is_empty() {
        return Err(SigningError::invalid_key_format("HMAC secret must not be empty"));
    }
    Ok(secret.as_bytes().to_vec())
}

fn hmac_sha256(secret: &[u8], payload: &[u8]) -> Result<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|e| SigningError::SigningFailed { message: e.to_string() })?;
    mac.update(payload);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn hmac_sha512(secret: &[u8], payload: &[u8]) -> Result<Vec<u8>> {
    let mut mac = HmacSha512::new_from_slice(secret)
        .map_err(|e| SigningError::SigningFailed { message: e.to_string() })?;
    mac.update(payload);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

fn decode_ed25519_bytes(encoded: &str) -> Result<[u8; 32]> {
    let bytes = BASE64
        .decode(encoded.trim())
        .map_err(|e| SigningError::invalid_key_format(format!("Ed25519 key is not base64: {e}")))?;
    <[u8; 32]>::try_from(bytes.as_slice()).map_err(|_| {
        SigningError::invalid_key_format(format!("Ed25519 key must be 32 bytes, got {}", bytes.len()))
    })
}

fn decode_base64_signature(signature: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(signature.trim())
        .map_err(|e| SigningError::malformed_signature(format!("not base64: {e}")))
}

/// emLen - hLen - 2 for a modulus of `modulus_len` bytes.
fn max_pss_salt_len(modulus_len: usize) -> Result<usize> {
    modulus_len
        .checked_sub(SHA256_OUTPUT_LEN + 2)
        .filter(|len| *len > 0)
        .ok_or_else(|| SigningError::invalid_key_format("RSA modulus too small for PSS/SHA-256"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ed25519_secret() -> String {
        BASE64.encode([7u8; 32])
    }

    #[test]
    fn hmac_sha256_matches_known_vector() {
        // RFC 4231 test case 2
        let key = SigningKey::from_secret(SignatureAlgorithm::HmacSha256, "Jefe").unwrap();
        let signature =
            SignatureService::default().sign(b"what do ya want for nothing?", &key).unwrap();

        assert_eq!(
            signature,
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn hmac_sha512_produces_128_hex_chars() {
        let key = SigningKey::from_secret(SignatureAlgorithm::HmacSha512, "secret").unwrap();
        let signature = SignatureService::default().sign(b"payload", &key).unwrap();

        assert_eq!(signature.len(), 128);
        assert!(signature.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn hmac_rejects_wrong_signature_of_same_length() {
        let service = SignatureService::default();
        let key = SigningKey::from_secret(SignatureAlgorithm::HmacSha256, "secret").unwrap();
        let mut signature = service.sign(b"payload", &key).unwrap();
        signature.replace_range(0..1, if signature.starts_with('0') { "1" } else { "0" });

        assert!(!service.verify(b"payload", &signature, &key.verification_key()).unwrap());
    }

    #[test]
    fn empty_hmac_secret_rejected() {
        let result = SigningKey::from_secret(SignatureAlgorithm::HmacSha256, "");
        assert!(matches!(result, Err(SigningError::InvalidKeyFormat { .. })));
    }

    #[test]
    fn ed25519_signature_is_deterministic_base64() {
        let service = SignatureService::default();
        let key = SigningKey::from_secret(SignatureAlgorithm::Ed25519, &ed25519_secret()).unwrap();

        let first = service.sign(b"payload", &key).unwrap();
        let second = service.sign(b"payload", &key).unwrap();

        assert_eq!(first, second);
        assert_eq!(BASE64.decode(&first).unwrap().len(), 64);
    }

    #[test]
    fn ed25519_verifies_with_published_public_key() {
        let service = SignatureService::default();
        let key = SigningKey::from_secret(SignatureAlgorithm::Ed25519, &ed25519_secret()).unwrap();
        let public = key.public_material().unwrap();
        let verification =
            VerificationKey::from_public_material(SignatureAlgorithm::Ed25519, &public).unwrap();

        let signature = service.sign(b"payload", &key).unwrap();

        assert!(service.verify(b"payload", &signature, &verification).unwrap());
        assert!(!service.verify(b"tampered", &signature, &verification).unwrap());
    }

    #[test]
    fn ed25519_malformed_signature_is_an_error() {
        let service = SignatureService::default();
        let key = SigningKey::from_secret(SignatureAlgorithm::Ed25519, &ed25519_secret()).unwrap();

        let result = service.verify(b"payload", "not base64!", &key.verification_key());
        assert!(matches!(result, Err(SigningError::MalformedSignature { .. })));
    }

    #[test]
    fn ed25519_rejects_short_seed() {
        let result = SigningKey::from_secret(SignatureAlgorithm::Ed25519, &BASE64.encode([1u8; 16]));
        assert!(matches!(result, Err(SigningError::InvalidKeyFormat { .. })));
    }

    #[test]
    fn pss_salt_length_is_maximal() {
        assert_eq!(max_pss_salt_len(256).unwrap(), 222);
        assert_eq!(max_pss_salt_len(128).unwrap(), 94);
        assert!(max_pss_salt_len(34).is_err());
    }

    #[test]
    fn algorithm_names_round_trip() {
        for algorithm in SignatureAlgorithm::ALL {
            assert_eq!(algorithm.as_str().parse::<SignatureAlgorithm>().unwrap(), algorithm);
        }
        assert!("md5".parse::<SignatureAlgorithm>().is_err());
    }

    #[test]
    fn debug_output_does_not_leak_secret() {
        let key = SigningKey::from_secret(SignatureAlgorithm::HmacSha256, "super-secret").unwrap();
        let rendered = format!("{key:?}");

        assert!(!rendered.contains("super-secret"));
        assert!(rendered.contains("HmacSha256"));
    }
}
