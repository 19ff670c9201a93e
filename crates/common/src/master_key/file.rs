//! Permission-locked file fallback for master keys.
//!
//! Keys live at `<dir>/<app>-<user>.key` as hex, inside a 0700 directory,
//! each file 0600.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use zeroize::Zeroizing;

use super::{AppIdentity, MasterKey, MasterKeyError, SecureKeyStore};
use crate::crypto::SECRET_SIZE;
use crate::fs::{ensure_private_dir, write_atomic_private};

const BACKEND: &str = "file";

#[derive(Debug, Clone)]
pub struct FileKeyStore {
    dir: PathBuf,
}

impl FileKeyStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn key_path(&self, identity: &AppIdentity) -> PathBuf {
        self.dir.join(format!("{}.key", identity.file_stem()))
    }
}

fn storage_error(e: std::io::Error) -> MasterKeyError {
    MasterKeyError::Storage {
        backend: BACKEND,
        reason: e.to_string(),
    }
}

#[cfg(unix)]
fn tighten_permissions(path: &Path) -> Result<(), MasterKeyError> {
    use std::os::unix::fs::PermissionsExt;

    let mode = std::fs::metadata(path).map_err(storage_error)?.permissions().mode();
    if mode & 0o077 != 0 {
        tracing::warn!(
            path = %path.display(),
            mode = format!("{:o}", mode & 0o777),
            "master key file readable by others, restricting to owner"
        );
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .map_err(storage_error)?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn tighten_permissions(_path: &Path) -> Result<(), MasterKeyError> {
    Ok(())
}

#[async_trait]
impl SecureKeyStore for FileKeyStore {
    fn name(&self) -> &'static str {
        BACKEND
    }

    async fn load(&self, identity: &AppIdentity) -> Result<Option<MasterKey>, MasterKeyError> {
        let path = self.key_path(identity);
        if !path.exists() {
            return Ok(None);
        }
        tighten_permissions(&path)?;

        let contents = Zeroizing::new(std::fs::read_to_string(&path).map_err(storage_error)?);
        let mut raw = Zeroizing::new([0u8; SECRET_SIZE]);
        hex::decode_to_slice(contents.trim(), &mut raw[..]).map_err(|_| MasterKeyError::Corrupt {
            backend: BACKEND,
        })?;
        Ok(Some(MasterKey::from_bytes(&raw[..])?))
    }

    async fn store(&self, identity: &AppIdentity, key: &MasterKey) -> Result<(), MasterKeyError> {
        ensure_private_dir(&self.dir).map_err(storage_error)?;
        let encoded = Zeroizing::new(hex::encode(key.bytes()));
        write_atomic_private(&self.key_path(identity), encoded.as_bytes()).map_err(storage_error)?;
        tracing::debug!(path = %self.key_path(identity).display(), "master key written");
        Ok(())
    }

    async fn delete(&self, identity: &AppIdentity) -> Result<(), MasterKeyError> {
        let path = self.key_path(identity);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(storage_error(e)),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn test_missing_key_is_none() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = FileKeyStore::new(dir.path().join("keys"));
        let identity = AppIdentity::new("demo", "alice");
        assert!(store.load(&identity).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_store_load_delete() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = FileKeyStore::new(dir.path().join("keys"));
        let identity = AppIdentity::new("demo", "alice");
        let key = MasterKey::generate().unwrap();

        store.store(&identity, &key).await.unwrap();
        let loaded = store.load(&identity).await.unwrap().unwrap();
        assert_eq!(loaded.bytes(), key.bytes());

        store.delete(&identity).await.unwrap();
        assert!(store.load(&identity).await.unwrap().is_none());
        // deleting twice is fine
        store.delete(&identity).await.unwrap();
    }

    #[tokio::test]
    async fn test_corrupt_file_is_not_reported_as_missing() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = FileKeyStore::new(dir.path());
        let identity = AppIdentity::new("demo", "alice");
        std::fs::write(store.key_path(&identity), "not hex at all").unwrap();

        let err = store.load(&identity).await.unwrap_err();
        assert!(matches!(err, MasterKeyError::Corrupt { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_loose_permissions_are_tightened() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::TempDir::new().unwrap();
        let store = FileKeyStore::new(dir.path());
        let identity = AppIdentity::new("demo", "alice");
        store
            .store(&identity, &MasterKey::generate().unwrap())
            .await
            .unwrap();
        let path = store.key_path(&identity);
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();

        store.load(&identity).await.unwrap().unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }
}
