//! HKDF-SHA256 key derivation.
//!
//! Derived keys are a pure function of `(master, salt, info)`; distinct
//! purposes use distinct salts so one derived key reveals nothing about the
//! master key or its siblings.

use hkdf::Hkdf;
use sha2::Sha256;

use super::secret::{Secret, SECRET_SIZE};
use crate::error::{Classify, ErrorKind};

/// Default HKDF info label when the caller has nothing more specific
pub const DEFAULT_INFO: &[u8] = b"berth derived key v1";

#[derive(Debug, thiserror::Error)]
pub enum KdfError {
    #[error("master key material is empty")]
    EmptyMaster,
    #[error("key derivation failed: {0}")]
    Expand(String),
}

impl Classify for KdfError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::InvalidInput
    }
}

/// Derive a 32-byte key from master key material and a purpose salt
pub fn derive_key(master: &[u8], salt: &[u8], info: &[u8]) -> Result<Secret, KdfError> {
    if master.is_empty() {
        return Err(KdfError::EmptyMaster);
    }
    let hkdf = Hkdf::<Sha256>::new(Some(salt), master);
    let mut okm = [0u8; SECRET_SIZE];
    hkdf.expand(info, &mut okm)
        .map_err(|e| KdfError::Expand(e.to_string()))?;
    let key = Secret::from(okm);
    zeroize::Zeroize::zeroize(&mut okm);
    Ok(key)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_derive_key_deterministic() {
        let k1 = derive_key(&[0x42; 32], b"salt", DEFAULT_INFO).unwrap();
        let k2 = derive_key(&[0x42; 32], b"salt", DEFAULT_INFO).unwrap();
        assert_eq!(k1, k2);
    }

    #[test]
    fn test_derive_key_different_master() {
        let k1 = derive_key(&[0x01; 32], b"salt", DEFAULT_INFO).unwrap();
        let k2 = derive_key(&[0x02; 32], b"salt", DEFAULT_INFO).unwrap();
        assert_ne!(k1, k2);

        // single bit difference
        let mut master = [0x01u8; 32];
        master[31] ^= 0x80;
        let k3 = derive_key(&master, b"salt", DEFAULT_INFO).unwrap();
        assert_ne!(k1, k3);
    }

    #[test]
    fn test_derive_key_different_salt() {
        let k1 = derive_key(&[0x01; 32], b"file-encryption", DEFAULT_INFO).unwrap();
        let k2 = derive_key(&[0x01; 32], b"platform-linux", DEFAULT_INFO).unwrap();
        assert_ne!(k1, k2);
    }

    #[test]
    fn test_derived_key_differs_from_master() {
        let master = [0x33u8; 32];
        let derived = derive_key(&master, b"salt", DEFAULT_INFO).unwrap();
        assert_ne!(derived.bytes(), &master[..]);
    }

    #[test]
    fn test_empty_master_rejected() {
        assert!(matches!(
            derive_key(&[], b"salt", DEFAULT_INFO),
            Err(KdfError::EmptyMaster)
        ));
    }
}
