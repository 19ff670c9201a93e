//! Cryptographic primitives for berth
//!
//! Stateless wrappers that everything else builds on:
//!
//! - **Symmetric encryption**: ChaCha20-Poly1305 with a fresh random nonce per
//!   call (`Secret`)
//! - **Key derivation**: HKDF-SHA256 over a master key and a purpose salt
//! - **Key agreement**: X25519, with the shared point hashed (BLAKE3 derive-key
//!   mode) before it is ever used as a key
//! - **Signing**: Ed25519 with strict verification
//! - **Fingerprints**: first 16 bytes of SHA-256 over a public key, hex encoded
//!
//! None of these degrade: any failure is surfaced to the caller and is
//! fatal to the operation that triggered it.

mod kdf;
mod keys;
mod secret;

pub use kdf::{derive_key, KdfError, DEFAULT_INFO};
pub use keys::{
    bytes_match, fingerprint, fingerprints_match, AgreementPublic, AgreementSecret, KeyError,
    SigningKey, VerifyingKey, FINGERPRINT_BYTES, PRIVATE_KEY_SIZE, PUBLIC_KEY_SIZE,
    SIGNATURE_SIZE,
};
pub use secret::{random_bytes, Secret, SecretError, NONCE_SIZE, SECRET_SIZE, TAG_SIZE};
