//! The daemon's long-term key pairs and their rotation.
//!
//! One pair is current at any time. Rotation generates a successor
//! endorsed by the current pair, pushes the current pair onto a bounded
//! ring of retained pairs and makes the successor current. Retained pairs
//! still decrypt envelopes sealed to them; a pair pushed off the end of the
//! ring is gone for good. Only its public signing key survives, in an
//! append-only history used to check old audit entries.
//!
//! Every change to the ring is written to disk before it is published, so a
//! key is never served that a restart would lose.

mod pair;
mod rotation;

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

pub use pair::{DaemonKeyPair, Endorsement, KeyQueryResponse, PublicKeyInfo, KEY_ID_BYTES};
pub use rotation::{RotationTask, DEFAULT_ROTATION_INTERVAL};

use crate::clock::Clock;
use crate::crypto::{KeyError, Secret, VerifyingKey};
use crate::error::{Classify, ErrorKind};
use crate::fs::{ensure_private_dir, write_atomic_private};
use pair::StoredKeyPair;

/// Superseded pairs kept by default
pub const DEFAULT_RETENTION: usize = 5;

const RING_FORMAT: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum DaemonKeyError {
    #[error("daemon key {0} is neither current nor retained")]
    UnknownKey(String),
    #[error("endorsement chain rejected: {0}")]
    BrokenChain(String),
    #[error("daemon key file is corrupt: {0}")]
    Corrupt(String),
    #[error("daemon key file failed authentication")]
    Unseal,
    #[error("key error: {0}")]
    Key(#[from] KeyError),
    #[error("daemon key io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("daemon key file is malformed: {0}")]
    Serde(#[from] serde_json::Error),
}

impl Classify for DaemonKeyError {
    fn kind(&self) -> ErrorKind {
        match self {
            DaemonKeyError::UnknownKey(_) => ErrorKind::KeyEvicted,
            DaemonKeyError::BrokenChain(_) | DaemonKeyError::Unseal => ErrorKind::AuthFailure,
            DaemonKeyError::Key(e) => e.kind(),
            DaemonKeyError::Corrupt(_) | DaemonKeyError::Io(_) | DaemonKeyError::Serde(_) => {
                ErrorKind::StorageFailure
            }
        }
    }
}

impl From<crate::crypto::SecretError> for DaemonKeyError {
    fn from(e: crate::crypto::SecretError) -> Self {
        DaemonKeyError::Key(KeyError::from(e))
    }
}

/// Where and how the key ring is persisted
#[derive(Debug, Clone)]
pub struct KeyManagerOptions {
    pub path: PathBuf,
    pub retention: usize,
    /// When set, the ring file is encrypted with this key
    pub seal_key: Option<Secret>,
}

impl KeyManagerOptions {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            retention: DEFAULT_RETENTION,
            seal_key: None,
        }
    }

    pub fn retention(mut self, retention: usize) -> Self {
        self.retention = retention;
        self
    }

    pub fn sealed_with(mut self, key: Secret) -> Self {
        self.seal_key = Some(key);
        self
    }
}

/// Public signing key of an evicted pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetiredKey {
    pub key_id: String,
    /// Ed25519 signing key, base64
    pub sign_public: VerifyingKey,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl RetiredKey {
    fn from_pair(pair: &DaemonKeyPair) -> Self {
        Self {
            key_id: pair.key_id().to_string(),
            sign_public: pair.sign_public(),
            created_at: pair.created_at(),
        }
    }
}

#[derive(Clone)]
struct KeyRing {
    current: Arc<DaemonKeyPair>,
    /// newest first
    retained: VecDeque<Arc<DaemonKeyPair>>,
    /// oldest first, never trimmed
    retired: Vec<RetiredKey>,
}

impl KeyRing {
    fn iter(&self) -> impl Iterator<Item = &Arc<DaemonKeyPair>> {
        std::iter::once(&self.current).chain(self.retained.iter())
    }

    fn contains(&self, key_id: &str) -> bool {
        self.iter().any(|pair| pair.key_id() == key_id)
    }
}

#[derive(Serialize, Deserialize)]
struct RingFile {
    format: u32,
    current: StoredKeyPair,
    #[serde(default)]
    retained: Vec<StoredKeyPair>,
    #[serde(default)]
    retired: Vec<RetiredKey>,
}

pub struct DaemonKeyManager {
    options: KeyManagerOptions,
    clock: Arc<dyn Clock>,
    ring: RwLock<KeyRing>,
    rotating: Mutex<()>,
}

impl std::fmt::Debug for DaemonKeyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DaemonKeyManager")
            .field("path", &self.options.path)
            .field("retention", &self.options.retention)
            .field("current", &self.current().key_id())
            .finish()
    }
}

impl DaemonKeyManager {
    /// Load the persisted key ring, or generate and persist the first pair
    pub fn load_or_init(options: KeyManagerOptions, clock: Arc<dyn Clock>) -> Result<Self, DaemonKeyError> {
        let ring = if options.path.exists() {
            let ring = Self::load(&options)?;
            tracing::info!(
                path = %options.path.display(),
                key_id = ring.current.key_id(),
                retained = ring.retained.len(),
                "loaded daemon keys"
            );
            ring
        } else {
            let ring = KeyRing {
                current: Arc::new(DaemonKeyPair::generate(clock.now())?),
                retained: VecDeque::new(),
                retired: Vec::new(),
            };
            Self::persist(&options, &ring)?;
            tracing::info!(
                path = %options.path.display(),
                key_id = ring.current.key_id(),
                fingerprint = %ring.current.fingerprint(),
                "generated initial daemon key"
            );
            ring
        };

        Ok(Self {
            options,
            clock,
            ring: RwLock::new(ring),
            rotating: Mutex::new(()),
        })
    }

    fn load(options: &KeyManagerOptions) -> Result<KeyRing, DaemonKeyError> {
        let raw = Zeroizing::new(std::fs::read(&options.path)?);
        let json = match &options.seal_key {
            Some(key) => Zeroizing::new(key.decrypt(&raw).map_err(|_| DaemonKeyError::Unseal)?),
            None => raw,
        };
        let file: RingFile = serde_json::from_slice(&json)?;
        if file.format != RING_FORMAT {
            return Err(DaemonKeyError::Corrupt(format!(
                "unsupported format {}",
                file.format
            )));
        }

        let current = Arc::new(DaemonKeyPair::from_stored(&file.current)?);
        let mut retained = VecDeque::new();
        for stored in &file.retained {
            retained.push_back(Arc::new(DaemonKeyPair::from_stored(stored)?));
        }
        let mut retired = file.retired.clone();
        if retained.len() > options.retention {
            tracing::warn!(
                retained = retained.len(),
                retention = options.retention,
                "trimming retained daemon keys to the configured retention"
            );
            while retained.len() > options.retention {
                if let Some(evicted) = retained.pop_back() {
                    retired.push(RetiredKey::from_pair(&evicted));
                }
            }
        }
        Ok(KeyRing {
            current,
            retained,
            retired,
        })
    }

    fn persist(options: &KeyManagerOptions, ring: &KeyRing) -> Result<(), DaemonKeyError> {
        if let Some(parent) = options.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            ensure_private_dir(parent)?;
        }
        let file = RingFile {
            format: RING_FORMAT,
            current: ring.current.to_stored(),
            retained: ring.retained.iter().map(|pair| pair.to_stored()).collect(),
            retired: ring.retired.clone(),
        };
        let json = Zeroizing::new(serde_json::to_vec_pretty(&file)?);
        match &options.seal_key {
            Some(key) => write_atomic_private(&options.path, &key.encrypt(&json)?)?,
            None => write_atomic_private(&options.path, &json)?,
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.options.path
    }

    pub fn retention(&self) -> usize {
        self.options.retention
    }

    /// The pair new envelopes should be sealed to
    pub fn current(&self) -> Arc<DaemonKeyPair> {
        self.ring.read().current.clone()
    }

    /// Current or retained pair by id. `None` means the key was evicted (or
    /// never existed); that is permanent.
    pub fn get(&self, key_id: &str) -> Option<Arc<DaemonKeyPair>> {
        self.ring
            .read()
            .iter()
            .find(|pair| pair.key_id() == key_id)
            .cloned()
    }

    /// Like [`DaemonKeyManager::get`], with absence as an error
    pub fn require(&self, key_id: &str) -> Result<Arc<DaemonKeyPair>, DaemonKeyError> {
        self.get(key_id)
            .ok_or_else(|| DaemonKeyError::UnknownKey(key_id.to_string()))
    }

    /// Public signing key of any pair this manager ever held, evicted or not
    pub fn verifying_key(&self, key_id: &str) -> Result<VerifyingKey, DaemonKeyError> {
        let ring = self.ring.read();
        if let Some(pair) = ring.iter().find(|pair| pair.key_id() == key_id) {
            return Ok(pair.sign_public());
        }
        ring.retired
            .iter()
            .find(|retired| retired.key_id == key_id)
            .map(|retired| retired.sign_public)
            .ok_or_else(|| DaemonKeyError::UnknownKey(key_id.to_string()))
    }

    /// Ids of the current and retained pairs, newest first
    pub fn key_ids(&self) -> Vec<String> {
        self.ring
            .read()
            .iter()
            .map(|pair| pair.key_id().to_string())
            .collect()
    }

    /// Payload of the unauthenticated key query
    pub fn public_info(&self) -> KeyQueryResponse {
        let ring = self.ring.read();
        KeyQueryResponse {
            current: ring.current.public_info(),
            chain: ring.retained.iter().map(|pair| pair.public_info()).collect(),
        }
    }

    /// Replace the current pair with an endorsed successor.
    ///
    /// Rotations are serialized. The new ring is persisted before it is
    /// published; if persisting fails nothing changes.
    pub fn rotate(&self) -> Result<Arc<DaemonKeyPair>, DaemonKeyError> {
        let _rotating = self.rotating.lock();
        let old = self.ring.read().clone();

        let now = self.clock.now();
        let mut next = DaemonKeyPair::successor(&old.current, now)?;
        while old.contains(next.key_id()) {
            next = DaemonKeyPair::successor(&old.current, now)?;
        }
        let next = Arc::new(next);

        let mut retained = old.retained.clone();
        let mut retired = old.retired.clone();
        retained.push_front(old.current.clone());
        while retained.len() > self.options.retention {
            if let Some(evicted) = retained.pop_back() {
                tracing::info!(key_id = evicted.key_id(), "evicting daemon key");
                retired.push(RetiredKey::from_pair(&evicted));
            }
        }

        let ring = KeyRing {
            current: next.clone(),
            retained,
            retired,
        };
        Self::persist(&self.options, &ring)?;
        *self.ring.write() = ring;

        tracing::info!(
            key_id = next.key_id(),
            previous = old.current.key_id(),
            fingerprint = %next.fingerprint(),
            "rotated daemon key"
        );
        Ok(next)
    }

    /// Rotate if the current pair is at least `interval` old
    pub fn rotate_if_due(
        &self,
        interval: chrono::Duration,
    ) -> Result<Option<Arc<DaemonKeyPair>>, DaemonKeyError> {
        let age = self.clock.now() - self.current().created_at();
        if age >= interval {
            tracing::debug!(age_secs = age.num_seconds(), "daemon key due for rotation");
            self.rotate().map(Some)
        } else {
            Ok(None)
        }
    }
}
