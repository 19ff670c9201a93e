//! OS credential vault backend.
//!
//! - Linux: Secret Service (GNOME Keyring, KWallet) over D-Bus
//! - macOS: Keychain Services
//!
//! Anything else, or a build without the `keychain` feature, reports the
//! backend as unavailable so the caller can use the file fallback.

use async_trait::async_trait;
use zeroize::Zeroizing;

use super::{AppIdentity, MasterKey, MasterKeyError, SecureKeyStore};
use crate::crypto::SECRET_SIZE;

const BACKEND: &str = "keychain";

#[derive(Debug, Clone)]
pub struct KeychainStore {
    service: String,
}

impl KeychainStore {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    /// Whether this build has a vault implementation for the running OS
    pub fn is_supported() -> bool {
        cfg!(all(
            feature = "keychain",
            any(target_os = "linux", target_os = "macos")
        ))
    }
}

fn unavailable(reason: impl std::fmt::Display) -> MasterKeyError {
    MasterKeyError::Unavailable {
        backend: BACKEND,
        reason: reason.to_string(),
    }
}

fn storage(reason: impl std::fmt::Display) -> MasterKeyError {
    MasterKeyError::Storage {
        backend: BACKEND,
        reason: reason.to_string(),
    }
}

fn decode(stored: &[u8]) -> Result<MasterKey, MasterKeyError> {
    let text = std::str::from_utf8(stored).map_err(|_| MasterKeyError::Corrupt { backend: BACKEND })?;
    let mut raw = Zeroizing::new([0u8; SECRET_SIZE]);
    hex::decode_to_slice(text.trim(), &mut raw[..])
        .map_err(|_| MasterKeyError::Corrupt { backend: BACKEND })?;
    MasterKey::from_bytes(&raw[..])
}

#[async_trait]
impl SecureKeyStore for KeychainStore {
    fn name(&self) -> &'static str {
        BACKEND
    }

    async fn load(&self, identity: &AppIdentity) -> Result<Option<MasterKey>, MasterKeyError> {
        let stored = platform::load(&self.service, &identity.account()).await?;
        match stored {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn store(&self, identity: &AppIdentity, key: &MasterKey) -> Result<(), MasterKeyError> {
        let encoded = Zeroizing::new(hex::encode(key.bytes()));
        platform::store(&self.service, &identity.account(), encoded.as_bytes()).await
    }

    async fn delete(&self, identity: &AppIdentity) -> Result<(), MasterKeyError> {
        platform::delete(&self.service, &identity.account()).await
    }
}

#[cfg(all(feature = "keychain", target_os = "linux"))]
mod platform {
    use std::collections::HashMap;

    use secret_service::{EncryptionType, SecretService};
    use zeroize::Zeroizing;

    use super::{storage, unavailable};
    use crate::master_key::MasterKeyError;

    fn attributes<'a>(service: &'a str, account: &'a str) -> HashMap<&'a str, &'a str> {
        [("service", service), ("account", account)]
            .into_iter()
            .collect()
    }

    // no session bus or no secret service daemon means no vault on this box
    async fn connect() -> Result<SecretService<'static>, MasterKeyError> {
        SecretService::connect(EncryptionType::Dh)
            .await
            .map_err(|e| unavailable(format!("failed to connect to secret service: {}", e)))
    }

    pub async fn load(
        service: &str,
        account: &str,
    ) -> Result<Option<Zeroizing<Vec<u8>>>, MasterKeyError> {
        let ss = connect().await?;
        let items = ss
            .search_items(attributes(service, account))
            .await
            .map_err(|e| storage(format!("failed to search: {}", e)))?;

        let Some(item) = items.unlocked.first().or(items.locked.first()) else {
            return Ok(None);
        };

        if item.is_locked().await.unwrap_or(true) {
            item.unlock()
                .await
                .map_err(|e| unavailable(format!("failed to unlock: {}", e)))?;
        }

        let secret = item
            .get_secret()
            .await
            .map_err(|e| storage(format!("failed to get secret: {}", e)))?;
        Ok(Some(Zeroizing::new(secret)))
    }

    pub async fn store(service: &str, account: &str, value: &[u8]) -> Result<(), MasterKeyError> {
        let ss = connect().await?;
        let collection = ss
            .get_default_collection()
            .await
            .map_err(|e| unavailable(format!("failed to get collection: {}", e)))?;

        if collection.is_locked().await.unwrap_or(true) {
            collection
                .unlock()
                .await
                .map_err(|e| unavailable(format!("failed to unlock collection: {}", e)))?;
        }

        collection
            .create_item(
                &format!("{} master key ({})", service, account),
                attributes(service, account),
                value,
                true,
                "text/plain",
            )
            .await
            .map_err(|e| storage(format!("failed to create secret: {}", e)))?;
        Ok(())
    }

    pub async fn delete(service: &str, account: &str) -> Result<(), MasterKeyError> {
        let ss = connect().await?;
        let items = ss
            .search_items(attributes(service, account))
            .await
            .map_err(|e| storage(format!("failed to search: {}", e)))?;

        for item in items.unlocked.iter().chain(items.locked.iter()) {
            item.delete()
                .await
                .map_err(|e| storage(format!("failed to delete: {}", e)))?;
        }
        Ok(())
    }
}

#[cfg(all(feature = "keychain", target_os = "macos"))]
mod platform {
    use security_framework::passwords::{
        delete_generic_password, get_generic_password, set_generic_password,
    };
    use zeroize::Zeroizing;

    use super::storage;
    use crate::master_key::MasterKeyError;

    /// errSecItemNotFound
    const ITEM_NOT_FOUND: i32 = -25300;

    pub async fn load(
        service: &str,
        account: &str,
    ) -> Result<Option<Zeroizing<Vec<u8>>>, MasterKeyError> {
        match get_generic_password(service, account) {
            Ok(password) => Ok(Some(Zeroizing::new(password))),
            Err(e) if e.code() == ITEM_NOT_FOUND => Ok(None),
            Err(e) => Err(storage(format!("failed to get from keychain: {}", e))),
        }
    }

    pub async fn store(service: &str, account: &str, value: &[u8]) -> Result<(), MasterKeyError> {
        set_generic_password(service, account, value)
            .map_err(|e| storage(format!("failed to store in keychain: {}", e)))
    }

    pub async fn delete(service: &str, account: &str) -> Result<(), MasterKeyError> {
        match delete_generic_password(service, account) {
            Ok(()) => Ok(()),
            Err(e) if e.code() == ITEM_NOT_FOUND => Ok(()),
            Err(e) => Err(storage(format!("failed to delete from keychain: {}", e))),
        }
    }
}

#[cfg(not(all(feature = "keychain", any(target_os = "linux", target_os = "macos"))))]
mod platform {
    use zeroize::Zeroizing;

    use super::unavailable;
    use crate::master_key::MasterKeyError;

    const REASON: &str = "no credential vault support in this build";

    pub async fn load(
        _service: &str,
        _account: &str,
    ) -> Result<Option<Zeroizing<Vec<u8>>>, MasterKeyError> {
        Err(unavailable(REASON))
    }

    pub async fn store(_service: &str, _account: &str, _value: &[u8]) -> Result<(), MasterKeyError> {
        Err(unavailable(REASON))
    }

    pub async fn delete(_service: &str, _account: &str) -> Result<(), MasterKeyError> {
        Err(unavailable(REASON))
    }
}
