use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Classify, ErrorKind};

/// External secret backends a store can read through to and migrate into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// In-process map
    Memory,
    /// HashiCorp Vault, KV version 2 engine
    Vault,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderKind::Memory => f.write_str("memory"),
            ProviderKind::Vault => f.write_str("vault"),
        }
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = ProviderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(ProviderKind::Memory),
            "vault" => Ok(ProviderKind::Vault),
            other => Err(ProviderError::UnknownKind(other.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("unknown provider kind: {0}")]
    UnknownKind(String),
    #[error("provider request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("provider url error: {0}")]
    Url(#[from] url::ParseError),
    #[error("provider returned {status}: {message}")]
    Status { status: u16, message: String },
    #[error("provider returned a malformed response: {0}")]
    Malformed(String),
    #[error("provider rejected write for {0}")]
    Rejected(String),
}

impl Classify for ProviderError {
    fn kind(&self) -> ErrorKind {
        match self {
            ProviderError::UnknownKind(_) => ErrorKind::InvalidInput,
            ProviderError::Status { status: 404, .. } => ErrorKind::NotFound,
            ProviderError::Status {
                status: 401 | 403, ..
            } => ErrorKind::Forbidden,
            ProviderError::Http(_)
            | ProviderError::Url(_)
            | ProviderError::Status { .. }
            | ProviderError::Malformed(_)
            | ProviderError::Rejected(_) => ErrorKind::StorageFailure,
        }
    }
}

/// Capability set every external secret backend offers.
///
/// `get_secret` reports an absent key as `Ok(None)`.
#[async_trait]
pub trait SecretProvider: Send + Sync + std::fmt::Debug {
    fn kind(&self) -> ProviderKind;

    async fn get_secret(&self, key: &str) -> Result<Option<String>, ProviderError>;

    async fn set_secret(&self, key: &str, value: &str) -> Result<(), ProviderError>;

    async fn delete_secret(&self, key: &str) -> Result<(), ProviderError>;

    async fn list_secrets(&self) -> Result<Vec<String>, ProviderError>;
}
