//! Symmetric authenticated encryption using ChaCha20-Poly1305
//!
//! Every value encrypted at rest (named secrets, `.enc` files) and every
//! envelope payload in flight goes through [`Secret`]. The wire layout is
//! always `nonce (12 bytes) || ciphertext || tag (16 bytes)`.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Classify, ErrorKind};

/// Size of ChaCha20-Poly1305 nonce in bytes
pub const NONCE_SIZE: usize = 12;
/// Size of ChaCha20-Poly1305 key in bytes (256 bits)
pub const SECRET_SIZE: usize = 32;
/// Size of the Poly1305 authentication tag in bytes
pub const TAG_SIZE: usize = 16;

const KEY_ID_CONTEXT: &str = "berth 2024-06 secret key identifier v1";

/// Errors that can occur during encryption/decryption
#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("invalid secret size, expected {expected}, got {got}")]
    InvalidSize { expected: usize, got: usize },
    #[error("data too short: {0} bytes cannot hold a nonce and tag")]
    TooShort(usize),
    #[error("authentication failed")]
    Authentication,
    #[error("encrypt error")]
    Encrypt,
    #[error("failed to gather randomness: {0}")]
    Rng(getrandom::Error),
}

impl Classify for SecretError {
    fn kind(&self) -> ErrorKind {
        match self {
            SecretError::InvalidSize { .. } | SecretError::TooShort(_) => ErrorKind::InvalidInput,
            SecretError::Authentication => ErrorKind::AuthFailure,
            SecretError::Encrypt => ErrorKind::InvalidInput,
            SecretError::Rng(_) => ErrorKind::UnsupportedPlatform,
        }
    }
}

/// Fill a fixed size buffer from the operating system CSPRNG
pub fn random_bytes<const N: usize>() -> Result<[u8; N], SecretError> {
    let mut buff = [0u8; N];
    getrandom::getrandom(&mut buff).map_err(SecretError::Rng)?;
    Ok(buff)
}

/// A 256-bit symmetric key
///
/// Used both for master-key derived keys and for per-message keys produced
/// by key agreement. The key bytes are wiped when the value is dropped, and
/// the `Debug` output never includes them.
///
/// # Examples
///
/// ```ignore
/// let secret = Secret::generate()?;
/// let ciphertext = secret.encrypt(b"sensitive data")?;
/// let recovered = secret.decrypt(&ciphertext)?;
/// assert_eq!(b"sensitive data", &recovered[..]);
/// ```
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Secret([u8; SECRET_SIZE]);

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Secret").field(&self.key_id()).finish()
    }
}

impl From<[u8; SECRET_SIZE]> for Secret {
    fn from(bytes: [u8; SECRET_SIZE]) -> Self {
        Secret(bytes)
    }
}

impl Secret {
    /// Generate a new random secret using the OS CSPRNG
    pub fn generate() -> Result<Self, SecretError> {
        Ok(Self(random_bytes::<SECRET_SIZE>()?))
    }

    /// Create a secret from a byte slice
    ///
    /// # Errors
    ///
    /// Returns an error if the slice length is not exactly `SECRET_SIZE` bytes.
    pub fn from_slice(data: &[u8]) -> Result<Self, SecretError> {
        if data.len() != SECRET_SIZE {
            return Err(SecretError::InvalidSize {
                expected: SECRET_SIZE,
                got: data.len(),
            });
        }
        let mut buff = [0; SECRET_SIZE];
        buff.copy_from_slice(data);
        Ok(buff.into())
    }

    /// Get a reference to the secret key bytes
    pub fn bytes(&self) -> &[u8] {
        self.0.as_ref()
    }

    /// A short, non-reversible identifier for this key.
    ///
    /// Stored next to ciphertexts so the right cached key can be picked
    /// when several generations of a key are alive at once.
    pub fn key_id(&self) -> String {
        let digest = blake3::derive_key(KEY_ID_CONTEXT, &self.0);
        hex::encode(&digest[..8])
    }

    /// Encrypt under a fresh random nonce, returning the nonce and the
    /// ciphertext with its tag appended.
    pub fn seal(&self, plaintext: &[u8]) -> Result<([u8; NONCE_SIZE], Vec<u8>), SecretError> {
        let nonce_bytes = random_bytes::<NONCE_SIZE>()?;
        let cipher = ChaCha20Poly1305::new(Key::from_slice(self.bytes()));
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|_| SecretError::Encrypt)?;
        Ok((nonce_bytes, ciphertext))
    }

    /// Decrypt a ciphertext (with appended tag) under the given nonce
    pub fn open(&self, nonce: &[u8; NONCE_SIZE], ciphertext: &[u8]) -> Result<Vec<u8>, SecretError> {
        if ciphertext.len() < TAG_SIZE {
            return Err(SecretError::TooShort(ciphertext.len()));
        }
        let cipher = ChaCha20Poly1305::new(Key::from_slice(self.bytes()));
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| SecretError::Authentication)
    }

    /// Encrypt data using ChaCha20-Poly1305 AEAD
    ///
    /// The output format is: `nonce (12 bytes) || ciphertext || auth_tag (16 bytes)`.
    pub fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>, SecretError> {
        let (nonce, ciphertext) = self.seal(data)?;
        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypt data produced by [`Secret::encrypt`]
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Data is too short to contain a nonce and a tag
    /// - Authentication tag verification fails (tampered data or wrong key)
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, SecretError> {
        if data.len() < NONCE_SIZE + TAG_SIZE {
            return Err(SecretError::TooShort(data.len()));
        }
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&data[..NONCE_SIZE]);
        self.open(&nonce, &data[NONCE_SIZE..])
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn test_secret_encrypt_decrypt() {
        let secret = Secret::generate().unwrap();
        let data = b"hello world, this is a test message for encryption";

        let encrypted = secret.encrypt(data).unwrap();
        let decrypted = secret.decrypt(&encrypted).unwrap();

        assert_eq!(data.as_slice(), decrypted.as_slice());
        assert_eq!(encrypted.len(), NONCE_SIZE + data.len() + TAG_SIZE);
    }

    #[test]
    fn test_roundtrip_assorted_lengths() {
        let secret = Secret::generate().unwrap();
        for len in [0usize, 1, 15, 16, 17, 64, 1000, 65_537] {
            let data: Vec<u8> = (0..len).map(|i| (i * 7 % 251) as u8).collect();
            let encrypted = secret.encrypt(&data).unwrap();
            assert_eq!(secret.decrypt(&encrypted).unwrap(), data, "len {}", len);
        }
    }

    #[test]
    fn test_every_single_bit_flip_is_detected() {
        let secret = Secret::generate().unwrap();
        let encrypted = secret.encrypt(b"attack at dawn").unwrap();

        // covers the nonce, the ciphertext and the tag
        for byte in 0..encrypted.len() {
            for bit in 0..8 {
                let mut tampered = encrypted.clone();
                tampered[byte] ^= 1 << bit;
                let result = secret.decrypt(&tampered);
                assert!(
                    matches!(result, Err(SecretError::Authentication)),
                    "flip at byte {} bit {} was not detected",
                    byte,
                    bit
                );
            }
        }
    }

    #[test]
    fn test_nonce_uniqueness() {
        let secret = Secret::generate().unwrap();
        let mut seen = HashSet::new();
        for _ in 0..10_000 {
            let (nonce, _) = secret.seal(b"x").unwrap();
            assert!(seen.insert(nonce), "nonce reused");
        }
    }

    #[test]
    fn test_wrong_key_fails() {
        let secret = Secret::generate().unwrap();
        let other = Secret::generate().unwrap();
        let encrypted = secret.encrypt(b"payload").unwrap();
        assert!(matches!(
            other.decrypt(&encrypted),
            Err(SecretError::Authentication)
        ));
    }

    #[test]
    fn test_too_short_input() {
        let secret = Secret::generate().unwrap();
        let result = secret.decrypt(&[0u8; NONCE_SIZE + TAG_SIZE - 1]);
        assert!(matches!(result, Err(SecretError::TooShort(_))));
        assert_eq!(result.unwrap_err().kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn test_secret_size_validation() {
        assert!(Secret::from_slice(&[1u8; 16]).is_err());
        assert!(Secret::from_slice(&[1u8; 64]).is_err());
        assert!(Secret::from_slice(&[1u8; SECRET_SIZE]).is_ok());
    }

    #[test]
    fn test_key_id_is_stable_and_distinct() {
        let a = Secret::from([7u8; SECRET_SIZE]);
        let b = Secret::from([8u8; SECRET_SIZE]);
        assert_eq!(a.key_id(), a.clone().key_id());
        assert_ne!(a.key_id(), b.key_id());
        assert_eq!(a.key_id().len(), 16);
        assert!(!format!("{:?}", a).contains("7, 7"));
    }
}
