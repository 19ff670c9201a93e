use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{AppIdentity, MasterKey, MasterKeyError, SecureKeyStore};

const BACKEND: &str = "memory";

/// In-process key store.
///
/// Used as the platform vault stand-in in tests; it can be told to behave
/// like an absent vault or like one that refuses writes.
#[derive(Debug, Default)]
pub struct MemoryKeyStore {
    keys: Mutex<HashMap<String, MasterKey>>,
    unavailable: bool,
    reject_writes: bool,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that behaves like a missing platform vault
    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::default()
        }
    }

    /// A store that can be read but fails every write
    pub fn read_only() -> Self {
        Self {
            reject_writes: true,
            ..Self::default()
        }
    }

    pub fn len(&self) -> usize {
        self.keys.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_available(&self) -> Result<(), MasterKeyError> {
        if self.unavailable {
            return Err(MasterKeyError::Unavailable {
                backend: BACKEND,
                reason: "disabled".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl SecureKeyStore for MemoryKeyStore {
    fn name(&self) -> &'static str {
        BACKEND
    }

    async fn load(&self, identity: &AppIdentity) -> Result<Option<MasterKey>, MasterKeyError> {
        self.check_available()?;
        Ok(self.keys.lock().get(&identity.account()).cloned())
    }

    async fn store(&self, identity: &AppIdentity, key: &MasterKey) -> Result<(), MasterKeyError> {
        self.check_available()?;
        if self.reject_writes {
            return Err(MasterKeyError::Storage {
                backend: BACKEND,
                reason: "store is read only".to_string(),
            });
        }
        self.keys.lock().insert(identity.account(), key.clone());
        Ok(())
    }

    async fn delete(&self, identity: &AppIdentity) -> Result<(), MasterKeyError> {
        self.check_available()?;
        self.keys.lock().remove(&identity.account());
        Ok(())
    }
}
