//! Named secret storage.
//!
//! A [`SecretStore`] holds named secrets in memory and mirrors them to a
//! single JSON file. Encrypted values are sealed with a key derived from the
//! master key ([`crate::master_key::Purpose::SecretStore`]) and tagged with
//! that key's id, so a rotation can find the key each record was sealed
//! with. Names missing locally are looked up in the registered external
//! providers before the store reports them as absent.

mod memory;
mod provider;
mod vault;

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

pub use memory::MemoryProvider;
pub use provider::{ProviderError, ProviderKind, SecretProvider};
pub use vault::{VaultConfig, VaultProvider};

use crate::clock::Clock;
use crate::crypto::{Secret, SecretError};
use crate::error::{Classify, ErrorKind};
use crate::fs::write_atomic_private;

const STORE_FORMAT: u32 = 1;

/// One named secret as persisted
#[derive(Clone, Serialize, Deserialize)]
pub struct SecretRecord {
    pub name: String,
    /// Plaintext, or base64 of `nonce || ciphertext || tag`
    pub value: String,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub is_encrypted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_id: Option<String>,
}

impl std::fmt::Debug for SecretRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretRecord")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("is_encrypted", &self.is_encrypted)
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

/// Metadata returned by [`SecretStore::list`], never the value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretInfo {
    pub name: String,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub is_encrypted: bool,
    pub key_id: Option<String>,
}

impl From<&SecretRecord> for SecretInfo {
    fn from(record: &SecretRecord) -> Self {
        Self {
            name: record.name.clone(),
            version: record.version,
            created_at: record.created_at,
            modified_at: record.modified_at,
            is_encrypted: record.is_encrypted,
            key_id: record.key_id.clone(),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct StoreFile {
    format: u32,
    secrets: Vec<SecretRecord>,
}

/// Outcome of [`SecretStore::rotate_all`].
///
/// Rotation is per secret: names in `failed` still hold their previous
/// ciphertext and version.
#[derive(Debug, Default)]
pub struct RotationReport {
    pub rotated: Vec<String>,
    pub failed: Vec<(String, SecretStoreError)>,
}

impl RotationReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Outcome of [`SecretStore::migrate_to_provider`].
#[derive(Debug, Default)]
pub struct MigrationReport {
    pub migrated: Vec<String>,
    /// Local secrets that could not be decrypted and were not sent
    pub skipped: Vec<(String, SecretStoreError)>,
    /// The provider write that stopped the migration, if any
    pub aborted: Option<(String, ProviderError)>,
}

impl MigrationReport {
    pub fn is_complete(&self) -> bool {
        self.aborted.is_none() && self.skipped.is_empty()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SecretStoreError {
    #[error("secret already exists: {0}")]
    AlreadyExists(String),
    #[error("secret not found: {0}")]
    NotFound(String),
    #[error("invalid secret name: {0:?}")]
    InvalidName(String),
    #[error("secret {name} was sealed with unknown key {key_id}")]
    UnknownKey { name: String, key_id: String },
    #[error("failed to decrypt secret {name}: {source}")]
    Decrypt { name: String, source: SecretError },
    #[error("failed to encrypt secret {name}: {source}")]
    Encrypt { name: String, source: SecretError },
    #[error("stored value of {0} is not valid")]
    Encoding(String),
    #[error("no {0} provider registered")]
    ProviderNotRegistered(ProviderKind),
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("secret store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("secret store file is malformed: {0}")]
    Serde(#[from] serde_json::Error),
}

impl Classify for SecretStoreError {
    fn kind(&self) -> ErrorKind {
        match self {
            SecretStoreError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            SecretStoreError::NotFound(_)
            | SecretStoreError::UnknownKey { .. }
            | SecretStoreError::ProviderNotRegistered(_) => ErrorKind::NotFound,
            SecretStoreError::InvalidName(_) => ErrorKind::InvalidInput,
            SecretStoreError::Decrypt { source, .. } | SecretStoreError::Encrypt { source, .. } => {
                source.kind()
            }
            SecretStoreError::Encoding(_) => ErrorKind::AuthFailure,
            SecretStoreError::Provider(e) => e.kind(),
            SecretStoreError::Io(_) | SecretStoreError::Serde(_) => ErrorKind::StorageFailure,
        }
    }
}

struct Inner {
    records: BTreeMap<String, SecretRecord>,
    current: Secret,
    /// every key this store has sealed or been handed, by key id
    keys: HashMap<String, Secret>,
}

impl Inner {
    fn seal(&self, name: &str, value: &str) -> Result<(String, String), SecretStoreError> {
        let sealed = self
            .current
            .encrypt(value.as_bytes())
            .map_err(|source| SecretStoreError::Encrypt {
                name: name.to_string(),
                source,
            })?;
        Ok((STANDARD.encode(sealed), self.current.key_id()))
    }

    fn reveal(&self, record: &SecretRecord) -> Result<Zeroizing<String>, SecretStoreError> {
        if !record.is_encrypted {
            return Ok(Zeroizing::new(record.value.clone()));
        }
        let key_id = record
            .key_id
            .clone()
            .unwrap_or_else(|| self.current.key_id());
        let key = self
            .keys
            .get(&key_id)
            .ok_or_else(|| SecretStoreError::UnknownKey {
                name: record.name.clone(),
                key_id: key_id.clone(),
            })?;
        let sealed = STANDARD
            .decode(&record.value)
            .map_err(|_| SecretStoreError::Encoding(record.name.clone()))?;
        let plain = key
            .decrypt(&sealed)
            .map_err(|source| SecretStoreError::Decrypt {
                name: record.name.clone(),
                source,
            })?;
        String::from_utf8(plain)
            .map(Zeroizing::new)
            .map_err(|_| SecretStoreError::Encoding(record.name.clone()))
    }
}

pub struct SecretStore {
    path: Option<PathBuf>,
    clock: Arc<dyn Clock>,
    inner: RwLock<Inner>,
    providers: RwLock<Vec<Arc<dyn SecretProvider>>>,
}

impl std::fmt::Debug for SecretStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretStore")
            .field("path", &self.path)
            .field("secrets", &self.inner.read().records.len())
            .finish_non_exhaustive()
    }
}

/// Names are 1 to 256 characters of ASCII alphanumerics, `_`, `-`, `.` or `/`
pub fn validate_name(name: &str) -> Result<(), SecretStoreError> {
    let valid = !name.is_empty()
        && name.len() <= 256
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/'));
    if valid {
        Ok(())
    } else {
        Err(SecretStoreError::InvalidName(name.to_string()))
    }
}

impl SecretStore {
    /// A store that lives only in memory
    pub fn in_memory(key: Secret, clock: Arc<dyn Clock>) -> Self {
        Self::with_records(None, key, clock, BTreeMap::new())
    }

    /// Open (or start) the store persisted at `path`
    pub fn open(path: impl AsRef<Path>, key: Secret, clock: Arc<dyn Clock>) -> Result<Self, SecretStoreError> {
        let path = path.as_ref().to_path_buf();
        let mut records = BTreeMap::new();
        if path.exists() {
            let data = std::fs::read(&path)?;
            let file: StoreFile = serde_json::from_slice(&data)?;
            if file.format != STORE_FORMAT {
                tracing::warn!(
                    path = %path.display(),
                    format = file.format,
                    "secret store written by a different format version"
                );
            }
            for record in file.secrets {
                records.insert(record.name.clone(), record);
            }
            tracing::debug!(path = %path.display(), secrets = records.len(), "secret store loaded");
        }
        Ok(Self::with_records(Some(path), key, clock, records))
    }

    fn with_records(
        path: Option<PathBuf>,
        key: Secret,
        clock: Arc<dyn Clock>,
        records: BTreeMap<String, SecretRecord>,
    ) -> Self {
        let mut keys = HashMap::new();
        keys.insert(key.key_id(), key.clone());
        Self {
            path,
            clock,
            inner: RwLock::new(Inner {
                records,
                current: key,
                keys,
            }),
            providers: RwLock::new(Vec::new()),
        }
    }

    /// Make an older key available for decrypting records sealed with it
    pub fn add_key(&self, key: Secret) {
        self.inner.write().keys.insert(key.key_id(), key);
    }

    /// Key id new values are sealed under
    pub fn current_key_id(&self) -> String {
        self.inner.read().current.key_id()
    }

    pub fn register_provider(&self, provider: Arc<dyn SecretProvider>) {
        tracing::info!(provider = %provider.kind(), "registered secret provider");
        self.providers.write().push(provider);
    }

    fn provider(&self, kind: ProviderKind) -> Option<Arc<dyn SecretProvider>> {
        self.providers.read().iter().find(|p| p.kind() == kind).cloned()
    }

    fn persist(&self, records: &BTreeMap<String, SecretRecord>) -> Result<(), SecretStoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let file = StoreFile {
            format: STORE_FORMAT,
            secrets: records.values().cloned().collect(),
        };
        let data = serde_json::to_vec_pretty(&file)?;
        write_atomic_private(path, &data)?;
        Ok(())
    }

    /// Create a secret. Existing names are never overwritten; use
    /// [`SecretStore::update`] for that.
    pub fn set(&self, name: &str, value: &str, encrypt: bool) -> Result<(), SecretStoreError> {
        validate_name(name)?;
        let mut inner = self.inner.write();
        if inner.records.contains_key(name) {
            return Err(SecretStoreError::AlreadyExists(name.to_string()));
        }

        let (stored, key_id) = if encrypt {
            let (sealed, key_id) = inner.seal(name, value)?;
            (sealed, Some(key_id))
        } else {
            (value.to_string(), None)
        };

        let now = self.clock.now();
        let mut records = inner.records.clone();
        records.insert(
            name.to_string(),
            SecretRecord {
                name: name.to_string(),
                value: stored,
                version: 1,
                created_at: now,
                modified_at: now,
                is_encrypted: encrypt,
                key_id,
            },
        );
        self.persist(&records)?;
        inner.records = records;

        tracing::info!(name, encrypted = encrypt, "secret created");
        Ok(())
    }

    /// Read a secret, decrypting it if needed.
    ///
    /// Falls through to the registered providers, in registration order,
    /// when the name is not stored locally. If no provider has it and at
    /// least one provider failed, that failure is returned rather than
    /// `NotFound`.
    pub async fn get(&self, name: &str) -> Result<Zeroizing<String>, SecretStoreError> {
        {
            let inner = self.inner.read();
            if let Some(record) = inner.records.get(name) {
                return inner.reveal(record);
            }
        }

        let providers: Vec<_> = self.providers.read().clone();
        let mut last_error = None;
        for provider in providers {
            match provider.get_secret(name).await {
                Ok(Some(value)) => {
                    tracing::debug!(name, provider = %provider.kind(), "secret served by provider");
                    return Ok(Zeroizing::new(value));
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(name, provider = %provider.kind(), "provider lookup failed: {}", e);
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) => Err(SecretStoreError::Provider(e)),
            None => Err(SecretStoreError::NotFound(name.to_string())),
        }
    }

    /// Replace the value of an existing secret, keeping its encryption
    /// setting. Returns the new version.
    pub fn update(&self, name: &str, value: &str) -> Result<u64, SecretStoreError> {
        let mut inner = self.inner.write();
        let Some(existing) = inner.records.get(name) else {
            return Err(SecretStoreError::NotFound(name.to_string()));
        };

        let mut record = existing.clone();
        if record.is_encrypted {
            let (sealed, key_id) = inner.seal(name, value)?;
            record.value = sealed;
            record.key_id = Some(key_id);
        } else {
            record.value = value.to_string();
        }
        record.version += 1;
        record.modified_at = self.clock.now();
        let version = record.version;

        let mut records = inner.records.clone();
        records.insert(name.to_string(), record);
        self.persist(&records)?;
        inner.records = records;

        tracing::info!(name, version, "secret updated");
        Ok(version)
    }

    /// Create the secret or replace its value, whichever applies
    pub fn upsert(&self, name: &str, value: &str, encrypt: bool) -> Result<u64, SecretStoreError> {
        match self.set(name, value, encrypt) {
            Ok(()) => Ok(1),
            Err(SecretStoreError::AlreadyExists(_)) => self.update(name, value),
            Err(e) => Err(e),
        }
    }

    pub fn delete(&self, name: &str) -> Result<(), SecretStoreError> {
        let mut inner = self.inner.write();
        if !inner.records.contains_key(name) {
            return Err(SecretStoreError::NotFound(name.to_string()));
        }
        let mut records = inner.records.clone();
        records.remove(name);
        self.persist(&records)?;
        inner.records = records;
        tracing::info!(name, "secret deleted");
        Ok(())
    }

    pub fn list(&self) -> Vec<SecretInfo> {
        self.inner.read().records.values().map(SecretInfo::from).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.read().records.contains_key(name)
    }

    /// Re-encrypt every encrypted secret under `new_key` and make it the
    /// current key.
    ///
    /// A secret that cannot be decrypted is logged, left untouched and
    /// listed in the report. The rotated set is persisted in one atomic
    /// write before it replaces the in-memory records.
    pub fn rotate_all(&self, new_key: Secret) -> Result<RotationReport, SecretStoreError> {
        let mut inner = self.inner.write();
        let now = self.clock.now();
        let new_key_id = new_key.key_id();
        let mut report = RotationReport::default();
        let mut records = inner.records.clone();

        for record in records.values_mut().filter(|r| r.is_encrypted) {
            let plain = match inner.reveal(record) {
                Ok(plain) => plain,
                Err(e) => {
                    tracing::error!(name = %record.name, "skipping secret during rotation: {}", e);
                    report.failed.push((record.name.clone(), e));
                    continue;
                }
            };
            let sealed = match new_key.encrypt(plain.as_bytes()) {
                Ok(sealed) => sealed,
                Err(source) => {
                    tracing::error!(name = %record.name, "failed to re-encrypt secret: {}", source);
                    report.failed.push((
                        record.name.clone(),
                        SecretStoreError::Encrypt {
                            name: record.name.clone(),
                            source,
                        },
                    ));
                    continue;
                }
            };
            record.value = STANDARD.encode(sealed);
            record.key_id = Some(new_key_id.clone());
            record.version += 1;
            record.modified_at = now;
            report.rotated.push(record.name.clone());
        }

        self.persist(&records)?;
        inner.records = records;
        inner.keys.insert(new_key_id.clone(), new_key.clone());
        inner.current = new_key;

        tracing::info!(
            key_id = %new_key_id,
            rotated = report.rotated.len(),
            failed = report.failed.len(),
            "secret store rotated"
        );
        Ok(report)
    }

    /// Copy every secret into the registered provider of `kind`.
    ///
    /// Values are decrypted under the read lock and sent with no lock
    /// held. The first provider write failure stops the migration; the
    /// report lists what was copied before it. Local records are kept.
    pub async fn migrate_to_provider(
        &self,
        kind: ProviderKind,
    ) -> Result<MigrationReport, SecretStoreError> {
        let provider = self
            .provider(kind)
            .ok_or(SecretStoreError::ProviderNotRegistered(kind))?;

        let mut report = MigrationReport::default();
        let snapshot: Vec<(String, Zeroizing<String>)> = {
            let inner = self.inner.read();
            inner
                .records
                .values()
                .filter_map(|record| match inner.reveal(record) {
                    Ok(value) => Some((record.name.clone(), value)),
                    Err(e) => {
                        tracing::warn!(name = %record.name, "not migrating undecryptable secret: {}", e);
                        report.skipped.push((record.name.clone(), e));
                        None
                    }
                })
                .collect()
        };

        for (name, value) in snapshot {
            match provider.set_secret(&name, &value).await {
                Ok(()) => report.migrated.push(name),
                Err(e) => {
                    tracing::error!(name = %name, provider = %kind, "migration aborted: {}", e);
                    report.aborted = Some((name, e));
                    break;
                }
            }
        }

        tracing::info!(
            provider = %kind,
            migrated = report.migrated.len(),
            complete = report.is_complete(),
            "secret migration finished"
        );
        Ok(report)
    }
}
