//! Whole-file encryption for configuration and `.env` files.
//!
//! An encrypted file is the raw bytes `nonce || ciphertext || tag` stored
//! next to the source with an `.enc` suffix. The plaintext source is never
//! removed or modified here.

use std::path::{Path, PathBuf};

use crate::crypto::{Secret, SecretError, NONCE_SIZE, TAG_SIZE};
use crate::error::{Classify, ErrorKind};
use crate::fs::{write_atomic, write_atomic_private};

pub const ENCRYPTED_SUFFIX: &str = "enc";

#[derive(Debug, thiserror::Error)]
pub enum FileEnvelopeError {
    #[error("invalid encrypted file {path}: {reason}")]
    InvalidFormat { path: PathBuf, reason: &'static str },
    #[error("failed to decrypt {0}")]
    DecryptionFailed(PathBuf),
    #[error("failed to encrypt {path}: {source}")]
    Encrypt { path: PathBuf, source: SecretError },
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl Classify for FileEnvelopeError {
    fn kind(&self) -> ErrorKind {
        match self {
            FileEnvelopeError::InvalidFormat { .. } => ErrorKind::InvalidInput,
            FileEnvelopeError::DecryptionFailed(_) => ErrorKind::AuthFailure,
            FileEnvelopeError::Encrypt { source, .. } => source.kind(),
            FileEnvelopeError::Io { source, .. } if source.kind() == std::io::ErrorKind::NotFound => {
                ErrorKind::NotFound
            }
            FileEnvelopeError::Io { .. } => ErrorKind::StorageFailure,
        }
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> FileEnvelopeError + '_ {
    move |source| FileEnvelopeError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// `path` with `.enc` appended (`app.env` -> `app.env.enc`)
pub fn encrypted_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(ENCRYPTED_SUFFIX);
    PathBuf::from(name)
}

/// `path` without its `.enc` suffix, or `None` if it has none
pub fn decrypted_path(path: &Path) -> Option<PathBuf> {
    match path.extension() {
        Some(ext) if ext == ENCRYPTED_SUFFIX => {
            let stem = path.file_stem()?;
            if stem.is_empty() {
                return None;
            }
            Some(path.with_file_name(stem))
        }
        _ => None,
    }
}

/// Encrypt `path` into its `.enc` sibling and return the sibling's path
pub fn encrypt_file(path: &Path, key: &Secret) -> Result<PathBuf, FileEnvelopeError> {
    let plaintext = zeroize::Zeroizing::new(std::fs::read(path).map_err(io_error(path))?);
    let sealed = key
        .encrypt(&plaintext)
        .map_err(|source| FileEnvelopeError::Encrypt {
            path: path.to_path_buf(),
            source,
        })?;

    let target = encrypted_path(path);
    write_atomic(&target, &sealed).map_err(io_error(&target))?;
    tracing::info!(source = %path.display(), target = %target.display(), "file encrypted");
    Ok(target)
}

/// Decrypt an `.enc` file into the path without the suffix.
///
/// Nothing is written unless the whole file authenticates. The output is
/// owner-only since it holds plaintext secrets.
pub fn decrypt_file(path: &Path, key: &Secret) -> Result<PathBuf, FileEnvelopeError> {
    let target = decrypted_path(path).ok_or_else(|| FileEnvelopeError::InvalidFormat {
        path: path.to_path_buf(),
        reason: "missing .enc suffix",
    })?;

    let sealed = std::fs::read(path).map_err(io_error(path))?;
    if sealed.len() < NONCE_SIZE + TAG_SIZE {
        return Err(FileEnvelopeError::InvalidFormat {
            path: path.to_path_buf(),
            reason: "shorter than nonce and tag",
        });
    }

    let plaintext = key.decrypt(&sealed).map_err(|e| {
        tracing::warn!(path = %path.display(), "file failed authentication: {}", e);
        FileEnvelopeError::DecryptionFailed(path.to_path_buf())
    })?;
    let plaintext = zeroize::Zeroizing::new(plaintext);

    write_atomic_private(&target, &plaintext).map_err(io_error(&target))?;
    tracing::info!(source = %path.display(), target = %target.display(), "file decrypted");
    Ok(target)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_roundtrip_leaves_source() {
        let dir = tempfile::TempDir::new().unwrap();
        let source = dir.path().join("app.env");
        std::fs::write(&source, b"DB_PASSWORD=p@ss\n").unwrap();
        let key = Secret::generate().unwrap();

        let sealed = encrypt_file(&source, &key).unwrap();
        assert_eq!(sealed, dir.path().join("app.env.enc"));
        assert!(source.exists());
        assert_ne!(std::fs::read(&sealed).unwrap(), b"DB_PASSWORD=p@ss\n");

        std::fs::remove_file(&source).unwrap();
        let restored = decrypt_file(&sealed, &key).unwrap();
        assert_eq!(restored, source);
        assert_eq!(std::fs::read(&restored).unwrap(), b"DB_PASSWORD=p@ss\n");
    }

    #[test]
    fn test_requires_enc_suffix() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("app.env");
        std::fs::write(&path, vec![0u8; 64]).unwrap();
        let err = decrypt_file(&path, &Secret::generate().unwrap()).unwrap_err();
        assert!(matches!(err, FileEnvelopeError::InvalidFormat { .. }));
    }

    #[test]
    fn test_short_file_is_invalid_format() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("app.env.enc");
        std::fs::write(&path, vec![0u8; NONCE_SIZE]).unwrap();
        let err = decrypt_file(&path, &Secret::generate().unwrap()).unwrap_err();
        assert!(matches!(err, FileEnvelopeError::InvalidFormat { .. }));
    }

    #[test]
    fn test_tampered_file_writes_nothing() {
        let dir = tempfile::TempDir::new().unwrap();
        let source = dir.path().join("config.toml");
        std::fs::write(&source, b"secret = true").unwrap();
        let key = Secret::generate().unwrap();
        let sealed = encrypt_file(&source, &key).unwrap();
        std::fs::remove_file(&source).unwrap();

        let mut bytes = std::fs::read(&sealed).unwrap();
        bytes[NONCE_SIZE] ^= 0x80;
        std::fs::write(&sealed, bytes).unwrap();

        let err = decrypt_file(&sealed, &key).unwrap_err();
        assert!(matches!(err, FileEnvelopeError::DecryptionFailed(_)));
        assert_eq!(err.kind(), ErrorKind::AuthFailure);
        assert!(!source.exists());
    }

    #[test]
    fn test_wrong_key_fails() {
        let dir = tempfile::TempDir::new().unwrap();
        let source = dir.path().join("a.env");
        std::fs::write(&source, b"x").unwrap();
        let sealed = encrypt_file(&source, &Secret::generate().unwrap()).unwrap();
        assert!(matches!(
            decrypt_file(&sealed, &Secret::generate().unwrap()),
            Err(FileEnvelopeError::DecryptionFailed(_))
        ));
    }

    #[test]
    fn test_paths() {
        assert_eq!(
            decrypted_path(Path::new("/srv/app/.env.enc")),
            Some(PathBuf::from("/srv/app/.env"))
        );
        assert_eq!(decrypted_path(Path::new("/srv/app/.env")), None);
        assert_eq!(
            encrypted_path(Path::new("/srv/app/.env")),
            PathBuf::from("/srv/app/.env.enc")
        );
    }
}
