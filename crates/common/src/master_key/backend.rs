use async_trait::async_trait;

use super::{AppIdentity, MasterKey, MasterKeyError};

/// A place a master key can live.
///
/// Implementations must report "no key stored" as `Ok(None)` and reserve
/// `Err` for real backend trouble, so the caller can tell a fresh install
/// (generate a key) apart from a broken vault (abort). A backend that is
/// not usable at all on this machine returns [`MasterKeyError::Unavailable`].
#[async_trait]
pub trait SecureKeyStore: Send + Sync + std::fmt::Debug {
    /// Short backend name used in logs and errors
    fn name(&self) -> &'static str;

    async fn load(&self, identity: &AppIdentity) -> Result<Option<MasterKey>, MasterKeyError>;

    async fn store(&self, identity: &AppIdentity, key: &MasterKey) -> Result<(), MasterKeyError>;

    async fn delete(&self, identity: &AppIdentity) -> Result<(), MasterKeyError>;
}
