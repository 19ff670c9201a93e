//! Master key lifecycle.
//!
//! Each application identity (app name + owning user) gets one 32 byte
//! master key. It lives in the OS credential vault when there is one and in
//! an owner-only key file otherwise. Nothing outside this module ever sees
//! the master key itself: callers ask for a [`Purpose`] and get a derived
//! key back.

mod backend;
mod file;
mod keychain;
mod memory;

use std::path::Path;
use std::sync::Arc;

pub use backend::SecureKeyStore;
pub use file::FileKeyStore;
pub use keychain::KeychainStore;
pub use memory::MemoryKeyStore;

use crate::crypto::{derive_key, KdfError, Secret, SecretError};
use crate::error::{Classify, ErrorKind};

/// Who a master key belongs to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AppIdentity {
    pub app: String,
    pub user: String,
}

impl AppIdentity {
    pub fn new(app: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            app: app.into(),
            user: user.into(),
        }
    }

    /// Identity for `app` owned by the user running this process
    pub fn for_current_user(app: impl Into<String>) -> Self {
        let user = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_else(|_| "default".to_string());
        Self::new(app, user)
    }

    /// Account name used in credential vaults
    pub fn account(&self) -> String {
        format!("{}:{}", self.app, self.user)
    }

    /// File-name safe form, `<app>-<user>`
    pub fn file_stem(&self) -> String {
        let clean = |s: &str| {
            s.chars()
                .map(|c| {
                    if c.is_ascii_alphanumeric() || c == '_' || c == '.' {
                        c
                    } else {
                        '_'
                    }
                })
                .collect::<String>()
        };
        format!("{}-{}", clean(&self.app), clean(&self.user))
    }
}

impl std::fmt::Display for AppIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.account())
    }
}

/// The root symmetric key of an application identity.
///
/// Zeroized on drop (through the inner [`Secret`]). Has no serde impls.
#[derive(Clone)]
pub struct MasterKey(Secret);

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterKey(..)")
    }
}

impl MasterKey {
    pub fn generate() -> Result<Self, MasterKeyError> {
        Ok(Self(Secret::generate()?))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MasterKeyError> {
        Ok(Self(Secret::from_slice(bytes)?))
    }

    pub fn bytes(&self) -> &[u8] {
        self.0.bytes()
    }
}

/// Operating system family, each with its own derivation salt so derived
/// keys do not move between platforms by accident.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsFamily {
    Linux,
    MacOs,
    Windows,
    Other,
}

impl OsFamily {
    pub fn current() -> Self {
        if cfg!(target_os = "linux") {
            OsFamily::Linux
        } else if cfg!(target_os = "macos") {
            OsFamily::MacOs
        } else if cfg!(target_os = "windows") {
            OsFamily::Windows
        } else {
            OsFamily::Other
        }
    }
}

/// What a derived key is for. Each purpose has a fixed, distinct salt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purpose {
    SecretStore,
    FileEncryption,
    OperatorIdentity,
    Platform(OsFamily),
}

impl Purpose {
    /// Platform purpose for the running OS
    pub fn platform() -> Self {
        Purpose::Platform(OsFamily::current())
    }

    pub fn salt(&self) -> &'static [u8] {
        match self {
            Purpose::SecretStore => b"berth/secret-store",
            Purpose::FileEncryption => b"berth/file-encryption",
            Purpose::OperatorIdentity => b"berth/operator-identity",
            Purpose::Platform(OsFamily::Linux) => b"berth/platform-linux",
            Purpose::Platform(OsFamily::MacOs) => b"berth/platform-macos",
            Purpose::Platform(OsFamily::Windows) => b"berth/platform-windows",
            Purpose::Platform(OsFamily::Other) => b"berth/platform-other",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Purpose::SecretStore => "secret-store",
            Purpose::FileEncryption => "file-encryption",
            Purpose::OperatorIdentity => "operator-identity",
            Purpose::Platform(OsFamily::Linux) => "platform-linux",
            Purpose::Platform(OsFamily::MacOs) => "platform-macos",
            Purpose::Platform(OsFamily::Windows) => "platform-windows",
            Purpose::Platform(OsFamily::Other) => "platform-other",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MasterKeyError {
    #[error("{backend} key store unavailable: {reason}")]
    Unavailable {
        backend: &'static str,
        reason: String,
    },
    #[error("{backend} key store failed: {reason}")]
    Storage {
        backend: &'static str,
        reason: String,
    },
    #[error("{backend} key store holds a malformed master key")]
    Corrupt { backend: &'static str },
    #[error("no master key for {0}")]
    NotFound(String),
    #[error("no secure key storage available and file fallback is disabled")]
    UnsupportedPlatform,
    #[error("key derivation failed: {0}")]
    Kdf(#[from] KdfError),
    #[error(transparent)]
    Secret(#[from] SecretError),
}

impl MasterKeyError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, MasterKeyError::Unavailable { .. })
    }
}

impl Classify for MasterKeyError {
    fn kind(&self) -> ErrorKind {
        match self {
            MasterKeyError::Unavailable { .. } | MasterKeyError::UnsupportedPlatform => {
                ErrorKind::UnsupportedPlatform
            }
            MasterKeyError::Storage { .. } | MasterKeyError::Corrupt { .. } => {
                ErrorKind::StorageFailure
            }
            MasterKeyError::NotFound(_) => ErrorKind::NotFound,
            MasterKeyError::Kdf(e) => e.kind(),
            MasterKeyError::Secret(e) => e.kind(),
        }
    }
}

/// Derive the key for `purpose` from `master`
pub fn derive_for_purpose(master: &MasterKey, purpose: Purpose) -> Result<Secret, MasterKeyError> {
    Ok(derive_key(
        master.bytes(),
        purpose.salt(),
        purpose.label().as_bytes(),
    )?)
}

/// Obtains master keys from a primary backend, with an optional fallback.
#[derive(Debug)]
pub struct MasterKeyStore {
    primary: Option<Arc<dyn SecureKeyStore>>,
    fallback: Option<Arc<dyn SecureKeyStore>>,
    // serializes first-time generation so two callers never mint two keys
    create_lock: tokio::sync::Mutex<()>,
}

impl MasterKeyStore {
    pub fn new(
        primary: Option<Arc<dyn SecureKeyStore>>,
        fallback: Option<Arc<dyn SecureKeyStore>>,
    ) -> Self {
        Self {
            primary,
            fallback,
            create_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// The OS vault as primary and, if allowed, `<root>/keys` as fallback
    pub fn platform(service: &str, root: &Path, allow_file_fallback: bool) -> Self {
        let primary: Option<Arc<dyn SecureKeyStore>> = if KeychainStore::is_supported() {
            Some(Arc::new(KeychainStore::new(service)))
        } else {
            None
        };
        let fallback: Option<Arc<dyn SecureKeyStore>> = if allow_file_fallback {
            Some(Arc::new(FileKeyStore::new(root.join("keys"))))
        } else {
            None
        };
        Self::new(primary, fallback)
    }

    fn backends(&self) -> impl Iterator<Item = &Arc<dyn SecureKeyStore>> {
        self.primary.iter().chain(self.fallback.iter())
    }

    /// Return the master key for `identity`, generating and persisting one
    /// on first use.
    ///
    /// The key is only returned once at least one backend has durably
    /// stored it. A backend that fails for a reason other than being
    /// unavailable aborts the call rather than triggering regeneration.
    pub async fn get_or_create_master_key(
        &self,
        identity: &AppIdentity,
    ) -> Result<MasterKey, MasterKeyError> {
        let _guard = self.create_lock.lock().await;

        let mut writable = Vec::new();
        for backend in self.backends() {
            match backend.load(identity).await {
                Ok(Some(key)) => {
                    tracing::debug!(backend = backend.name(), %identity, "master key loaded");
                    return Ok(key);
                }
                Ok(None) => writable.push(backend),
                Err(e) if e.is_unavailable() => {
                    tracing::warn!(backend = backend.name(), "skipping key store: {}", e);
                }
                Err(e) => return Err(e),
            }
        }

        if writable.is_empty() {
            return Err(MasterKeyError::UnsupportedPlatform);
        }

        let key = MasterKey::generate()?;
        let mut last_error = None;
        for backend in writable {
            match backend.store(identity, &key).await {
                Ok(()) => {
                    tracing::info!(backend = backend.name(), %identity, "generated new master key");
                    return Ok(key);
                }
                Err(e) => {
                    tracing::warn!(backend = backend.name(), "failed to persist master key: {}", e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or(MasterKeyError::UnsupportedPlatform))
    }

    /// Return the existing master key without ever generating one
    pub async fn load_master_key(&self, identity: &AppIdentity) -> Result<MasterKey, MasterKeyError> {
        let mut any_usable = false;
        for backend in self.backends() {
            match backend.load(identity).await {
                Ok(Some(key)) => return Ok(key),
                Ok(None) => any_usable = true,
                Err(e) if e.is_unavailable() => continue,
                Err(e) => return Err(e),
            }
        }
        if any_usable {
            Err(MasterKeyError::NotFound(identity.account()))
        } else {
            Err(MasterKeyError::UnsupportedPlatform)
        }
    }

    /// Remove the master key from every usable backend
    pub async fn delete_master_key(&self, identity: &AppIdentity) -> Result<(), MasterKeyError> {
        for backend in self.backends() {
            match backend.delete(identity).await {
                Ok(()) => {}
                Err(e) if e.is_unavailable() => continue,
                Err(e) => return Err(e),
            }
        }
        tracing::info!(%identity, "master key deleted");
        Ok(())
    }

    /// Fetch the master key, derive the key for `purpose` and hand it to
    /// `f`. Both keys are zeroized before this returns.
    pub async fn with_derived_key<T, F>(
        &self,
        identity: &AppIdentity,
        purpose: Purpose,
        f: F,
    ) -> Result<T, MasterKeyError>
    where
        F: FnOnce(&Secret) -> T,
    {
        let master = self.get_or_create_master_key(identity).await?;
        let derived = derive_for_purpose(&master, purpose)?;
        drop(master);
        Ok(f(&derived))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn identity() -> AppIdentity {
        AppIdentity::new("demo", "alice")
    }

    #[tokio::test]
    async fn test_generates_once_then_reads() {
        let primary = Arc::new(MemoryKeyStore::new());
        let store = MasterKeyStore::new(Some(primary.clone()), None);

        let first = store.get_or_create_master_key(&identity()).await.unwrap();
        let second = store.get_or_create_master_key(&identity()).await.unwrap();
        assert_eq!(first.bytes(), second.bytes());
        assert_eq!(primary.len(), 1);
    }

    #[tokio::test]
    async fn test_falls_back_when_primary_unavailable() {
        let fallback = Arc::new(MemoryKeyStore::new());
        let store = MasterKeyStore::new(
            Some(Arc::new(MemoryKeyStore::unavailable())),
            Some(fallback.clone()),
        );

        store.get_or_create_master_key(&identity()).await.unwrap();
        assert_eq!(fallback.len(), 1);
    }

    #[tokio::test]
    async fn test_existing_fallback_key_is_preferred_over_generation() {
        let primary = Arc::new(MemoryKeyStore::new());
        let fallback = Arc::new(MemoryKeyStore::new());
        let existing = MasterKey::generate().unwrap();
        fallback.store(&identity(), &existing).await.unwrap();

        let store = MasterKeyStore::new(Some(primary.clone()), Some(fallback));
        let key = store.get_or_create_master_key(&identity()).await.unwrap();
        assert_eq!(key.bytes(), existing.bytes());
        assert!(primary.is_empty());
    }

    #[tokio::test]
    async fn test_primary_write_failure_uses_fallback() {
        let fallback = Arc::new(MemoryKeyStore::new());
        let store = MasterKeyStore::new(
            Some(Arc::new(MemoryKeyStore::read_only())),
            Some(fallback.clone()),
        );

        let key = store.get_or_create_master_key(&identity()).await.unwrap();
        let persisted = fallback.load(&identity()).await.unwrap().unwrap();
        assert_eq!(key.bytes(), persisted.bytes());
    }

    #[tokio::test]
    async fn test_unpersisted_key_is_never_returned() {
        let store = MasterKeyStore::new(Some(Arc::new(MemoryKeyStore::read_only())), None);
        let err = store.get_or_create_master_key(&identity()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StorageFailure);
    }

    #[tokio::test]
    async fn test_no_backend_is_unsupported_platform() {
        let store = MasterKeyStore::new(Some(Arc::new(MemoryKeyStore::unavailable())), None);
        let err = store.get_or_create_master_key(&identity()).await.unwrap_err();
        assert!(matches!(err, MasterKeyError::UnsupportedPlatform));
        assert_eq!(err.kind(), ErrorKind::UnsupportedPlatform);
    }

    #[tokio::test]
    async fn test_corrupt_backend_aborts_instead_of_regenerating() {
        let dir = tempfile::TempDir::new().unwrap();
        let files = FileKeyStore::new(dir.path());
        std::fs::write(files.key_path(&identity()), "garbage").unwrap();
        let store = MasterKeyStore::new(None, Some(Arc::new(files)));

        let err = store.get_or_create_master_key(&identity()).await.unwrap_err();
        assert!(matches!(err, MasterKeyError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn test_load_without_key_is_not_found() {
        let store = MasterKeyStore::new(Some(Arc::new(MemoryKeyStore::new())), None);
        let err = store.load_master_key(&identity()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_purpose_salts_are_distinct() {
        let purposes = [
            Purpose::SecretStore,
            Purpose::FileEncryption,
            Purpose::OperatorIdentity,
            Purpose::Platform(OsFamily::Linux),
            Purpose::Platform(OsFamily::MacOs),
            Purpose::Platform(OsFamily::Windows),
            Purpose::Platform(OsFamily::Other),
        ];
        let master = MasterKey::generate().unwrap();
        let derived: Vec<_> = purposes
            .iter()
            .map(|p| derive_for_purpose(&master, *p).unwrap())
            .collect();
        for (i, a) in derived.iter().enumerate() {
            assert_ne!(a.bytes(), master.bytes());
            for b in derived.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
    }

    #[tokio::test]
    async fn test_with_derived_key_is_stable() {
        let store = MasterKeyStore::new(Some(Arc::new(MemoryKeyStore::new())), None);
        let a = store
            .with_derived_key(&identity(), Purpose::SecretStore, |k| k.clone())
            .await
            .unwrap();
        let b = store
            .with_derived_key(&identity(), Purpose::SecretStore, |k| k.clone())
            .await
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_file_stem_is_sanitized() {
        let identity = AppIdentity::new("my app", "DOMAIN\\bob");
        assert_eq!(identity.file_stem(), "my_app-DOMAIN_bob");
    }
}
