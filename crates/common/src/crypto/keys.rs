use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ed25519_dalek::Signer;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

use super::secret::{random_bytes, Secret, SecretError};
use crate::error::{Classify, ErrorKind};

/// Size of an Ed25519 / X25519 private key in bytes
pub const PRIVATE_KEY_SIZE: usize = 32;
/// Size of an Ed25519 / X25519 public key in bytes
pub const PUBLIC_KEY_SIZE: usize = 32;
/// Size of an Ed25519 signature in bytes
pub const SIGNATURE_SIZE: usize = 64;
/// Number of SHA-256 bytes kept in a fingerprint
pub const FINGERPRINT_BYTES: usize = 16;

const AGREEMENT_CONTEXT: &str = "berth 2024-06 envelope key agreement v1";

/// Errors that can occur during key operations
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("invalid key size, expected {expected}, got {got}")]
    InvalidLength { expected: usize, got: usize },
    #[error("invalid key encoding: {0}")]
    Encoding(String),
    #[error("invalid public key")]
    InvalidKey,
    /// Deliberately carries no detail: a malformed signature, a malformed
    ///  key and a wrong signature are indistinguishable to the caller
    #[error("signature verification failed")]
    Verification,
    #[error("key agreement produced a non-contributory shared secret")]
    NonContributory,
    #[error("secret error: {0}")]
    Secret(#[from] SecretError),
}

impl Classify for KeyError {
    fn kind(&self) -> ErrorKind {
        match self {
            KeyError::InvalidLength { .. } | KeyError::Encoding(_) | KeyError::InvalidKey => {
                ErrorKind::InvalidInput
            }
            KeyError::Verification | KeyError::NonContributory => ErrorKind::AuthFailure,
            KeyError::Secret(e) => e.kind(),
        }
    }
}

fn fixed<const N: usize>(bytes: &[u8]) -> Result<[u8; N], KeyError> {
    if bytes.len() != N {
        return Err(KeyError::InvalidLength {
            expected: N,
            got: bytes.len(),
        });
    }
    let mut buff = [0u8; N];
    buff.copy_from_slice(bytes);
    Ok(buff)
}

fn decode_b64(value: &str) -> Result<Vec<u8>, KeyError> {
    BASE64
        .decode(value.trim())
        .map_err(|e| KeyError::Encoding(e.to_string()))
}

/// Human comparable fingerprint of a public key:
///  the first 16 bytes of its SHA-256, hex encoded.
pub fn fingerprint(public_key: &[u8]) -> String {
    let digest = Sha256::digest(public_key);
    hex::encode(&digest[..FINGERPRINT_BYTES])
}

/// Constant time fingerprint comparison
pub fn fingerprints_match(a: &str, b: &str) -> bool {
    bytes_match(a.as_bytes(), b.as_bytes())
}

/// Constant time byte comparison; slices of different length never match
pub fn bytes_match(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

/// Ed25519 private key used to sign envelopes, requests and audit entries
pub struct SigningKey(ed25519_dalek::SigningKey);

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SigningKey")
            .field(&self.verifying_key().to_base64())
            .finish()
    }
}

impl Clone for SigningKey {
    fn clone(&self) -> Self {
        Self(ed25519_dalek::SigningKey::from_bytes(&self.0.to_bytes()))
    }
}

impl SigningKey {
    /// Generate a new signing key from the OS CSPRNG
    pub fn generate() -> Result<Self, KeyError> {
        let mut seed = random_bytes::<PRIVATE_KEY_SIZE>()?;
        let key = ed25519_dalek::SigningKey::from_bytes(&seed);
        zeroize::Zeroize::zeroize(&mut seed);
        Ok(Self(key))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        let seed = zeroize::Zeroizing::new(fixed::<PRIVATE_KEY_SIZE>(bytes)?);
        Ok(Self(ed25519_dalek::SigningKey::from_bytes(&seed)))
    }

    pub fn to_bytes(&self) -> zeroize::Zeroizing<[u8; PRIVATE_KEY_SIZE]> {
        zeroize::Zeroizing::new(self.0.to_bytes())
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        VerifyingKey(self.0.verifying_key())
    }

    /// Produce a detached 64-byte signature
    pub fn sign(&self, msg: &[u8]) -> [u8; SIGNATURE_SIZE] {
        self.0.sign(msg).to_bytes()
    }

    /// Sign and return the signature base64 encoded, as it travels on the wire
    pub fn sign_base64(&self, msg: &[u8]) -> String {
        BASE64.encode(self.sign(msg))
    }
}

/// Ed25519 public key
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct VerifyingKey(ed25519_dalek::VerifyingKey);

impl std::fmt::Debug for VerifyingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("VerifyingKey").field(&self.to_base64()).finish()
    }
}

impl VerifyingKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        let raw = fixed::<PUBLIC_KEY_SIZE>(bytes)?;
        ed25519_dalek::VerifyingKey::from_bytes(&raw)
            .map(Self)
            .map_err(|_| KeyError::InvalidKey)
    }

    pub fn from_base64(value: &str) -> Result<Self, KeyError> {
        Self::from_bytes(&decode_b64(value)?)
    }

    pub fn to_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.0.to_bytes()
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.to_bytes())
    }

    /// Verify a detached signature.
    ///
    /// Uses strict verification (rejects small-order keys and
    ///  non-canonical signatures). Every failure, including a signature of
    ///  the wrong length, collapses into [`KeyError::Verification`].
    pub fn verify(&self, msg: &[u8], signature: &[u8]) -> Result<(), KeyError> {
        let signature =
            ed25519_dalek::Signature::from_slice(signature).map_err(|_| KeyError::Verification)?;
        self.0
            .verify_strict(msg, &signature)
            .map_err(|_| KeyError::Verification)
    }

    /// Verify a base64 encoded signature
    pub fn verify_base64(&self, msg: &[u8], signature: &str) -> Result<(), KeyError> {
        let signature = BASE64
            .decode(signature.trim())
            .map_err(|_| KeyError::Verification)?;
        self.verify(msg, &signature)
    }
}

/// X25519 private key used for key agreement
#[derive(Clone)]
pub struct AgreementSecret(StaticSecret);

impl std::fmt::Debug for AgreementSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("AgreementSecret")
            .field(&self.public().to_base64())
            .finish()
    }
}

impl AgreementSecret {
    /// Generate a new agreement key from the OS CSPRNG
    pub fn generate() -> Result<Self, KeyError> {
        let mut raw = random_bytes::<PRIVATE_KEY_SIZE>()?;
        let secret = StaticSecret::from(raw);
        zeroize::Zeroize::zeroize(&mut raw);
        Ok(Self(secret))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        let raw = fixed::<PRIVATE_KEY_SIZE>(bytes)?;
        Ok(Self(StaticSecret::from(raw)))
    }

    pub fn to_bytes(&self) -> zeroize::Zeroizing<[u8; PRIVATE_KEY_SIZE]> {
        zeroize::Zeroizing::new(self.0.to_bytes())
    }

    pub fn public(&self) -> AgreementPublic {
        AgreementPublic(X25519PublicKey::from(&self.0))
    }

    /// Perform X25519 with `their_public` and hash the result into a
    ///  symmetric key.
    ///
    /// The raw shared point never leaves this function. `transcript` binds
    ///  the derived key to the context of the exchange (both parties must
    ///  supply identical bytes).
    pub fn agree(&self, their_public: &AgreementPublic, transcript: &[u8]) -> Result<Secret, KeyError> {
        let shared = self.0.diffie_hellman(&their_public.0);
        if !shared.was_contributory() {
            return Err(KeyError::NonContributory);
        }
        let mut hasher = blake3::Hasher::new_derive_key(AGREEMENT_CONTEXT);
        hasher.update(shared.as_bytes());
        hasher.update(transcript);
        Ok(Secret::from(*hasher.finalize().as_bytes()))
    }
}

/// X25519 public key
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct AgreementPublic(X25519PublicKey);

impl std::fmt::Debug for AgreementPublic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("AgreementPublic")
            .field(&self.to_base64())
            .finish()
    }
}

impl AgreementPublic {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        let raw = fixed::<PUBLIC_KEY_SIZE>(bytes)?;
        Ok(Self(X25519PublicKey::from(raw)))
    }

    pub fn from_base64(value: &str) -> Result<Self, KeyError> {
        Self::from_bytes(&decode_b64(value)?)
    }

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        self.0.as_bytes()
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.as_bytes())
    }

    pub fn fingerprint(&self) -> String {
        fingerprint(self.as_bytes())
    }
}

macro_rules! base64_serde {
    ($ty:ty) => {
        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_base64())
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let value = String::deserialize(deserializer)?;
                <$ty>::from_base64(&value).map_err(serde::de::Error::custom)
            }
        }
    };
}

base64_serde!(VerifyingKey);
base64_serde!(AgreementPublic);

#[cfg(test)]
mod test {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let signing = SigningKey::generate().unwrap();
        let verifying = signing.verifying_key();
        let message = b"hello, world!";

        let signature = signing.sign(message);
        assert!(verifying.verify(message, &signature).is_ok());

        // wrong message
        assert!(verifying.verify(b"hello, world?", &signature).is_err());

        // wrong key
        let other = SigningKey::generate().unwrap().verifying_key();
        assert!(other.verify(message, &signature).is_err());
    }

    #[test]
    fn test_malformed_signature_is_opaque() {
        let verifying = SigningKey::generate().unwrap().verifying_key();
        let short = verifying.verify(b"msg", &[0u8; 10]).unwrap_err();
        let zeros = verifying.verify(b"msg", &[0u8; SIGNATURE_SIZE]).unwrap_err();
        assert_eq!(short.to_string(), zeros.to_string());
        assert_eq!(short.kind(), ErrorKind::AuthFailure);
        assert!(verifying.verify_base64(b"msg", "not base64 !!").is_err());
    }

    #[test]
    fn test_signing_key_bytes_roundtrip() {
        let signing = SigningKey::generate().unwrap();
        let restored = SigningKey::from_bytes(&signing.to_bytes()[..]).unwrap();
        assert_eq!(signing.verifying_key(), restored.verifying_key());
    }

    #[test]
    fn test_agreement_is_symmetric() {
        let alice = AgreementSecret::generate().unwrap();
        let bob = AgreementSecret::generate().unwrap();
        let transcript = b"alice->bob";

        let k1 = alice.agree(&bob.public(), transcript).unwrap();
        let k2 = bob.agree(&alice.public(), transcript).unwrap();
        assert_eq!(k1, k2);

        // the shared point is hashed, never used raw
        let raw = alice.0.diffie_hellman(&bob.public().0);
        assert_ne!(k1.bytes(), raw.as_bytes());

        // transcript binds the key
        let k3 = bob.agree(&alice.public(), b"other").unwrap();
        assert_ne!(k1, k3);
    }

    #[test]
    fn test_low_order_point_rejected() {
        let alice = AgreementSecret::generate().unwrap();
        let zero = AgreementPublic::from_bytes(&[0u8; PUBLIC_KEY_SIZE]).unwrap();
        assert!(matches!(
            alice.agree(&zero, b""),
            Err(KeyError::NonContributory)
        ));
    }

    #[test]
    fn test_fingerprint_stable_and_unique() {
        let key = AgreementSecret::generate().unwrap().public();
        assert_eq!(key.fingerprint(), fingerprint(key.as_bytes()));
        assert_eq!(key.fingerprint().len(), FINGERPRINT_BYTES * 2);

        let mut seen = HashSet::new();
        for _ in 0..10_000 {
            let public = AgreementSecret::generate().unwrap().public();
            assert!(seen.insert(public.fingerprint()));
        }
    }

    #[test]
    fn test_fingerprints_match() {
        let fp = fingerprint(b"abc");
        assert!(fingerprints_match(&fp, &fingerprint(b"abc")));
        assert!(!fingerprints_match(&fp, &fingerprint(b"abd")));
        assert!(!fingerprints_match(&fp, &fp[..8]));
    }

    #[test]
    fn test_public_keys_serde_as_base64() {
        let public = AgreementSecret::generate().unwrap().public();
        let json = serde_json::to_string(&public).unwrap();
        assert_eq!(json, format!("\"{}\"", public.to_base64()));
        let back: AgreementPublic = serde_json::from_str(&json).unwrap();
        assert_eq!(back, public);

        assert!(serde_json::from_str::<VerifyingKey>("\"AAAA\"").is_err());
    }
}
