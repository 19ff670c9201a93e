//! Who is trusted, and to do what.
//!
//! The daemon keeps a [`TrustStore`] of operator identities with roles;
//! the CLI keeps one of pinned daemon keys, populated by [`bootstrap`]
//! on first contact (trust on first use).

mod bootstrap;
mod operator;
mod role;
mod store;

pub use bootstrap::{
    bootstrap, BootstrapError, BootstrapOutcome, Confirm, DaemonKeySource, DEFAULT_DAEMON_ROLE,
};
pub use operator::{OperatorIdentity, OperatorIdentityError};
pub use role::{Operation, Role, UnknownRole};
pub use store::{AddIdentityRequest, TrustStore, TrustedKey};

use crate::error::{Classify, ErrorKind};

#[derive(Debug, thiserror::Error)]
pub enum TrustError {
    #[error("no identity with fingerprint {0}")]
    NotFound(String),
    #[error("caller {0} is not a trusted identity")]
    UnknownCaller(String),
    #[error("{operation} denied for {}: {reason}", caller.as_deref().unwrap_or("anonymous caller"))]
    Forbidden {
        caller: Option<String>,
        operation: Operation,
        reason: &'static str,
    },
    #[error("identity {0} is already registered")]
    AlreadyExists(String),
    #[error("refusing to remove the last owner")]
    LastOwner,
    #[error("fingerprint mismatch: claimed {claimed}, computed {computed}")]
    FingerprintMismatch { claimed: String, computed: String },
    #[error("trust store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("trust store is malformed: {0}")]
    Serde(#[from] serde_json::Error),
}

impl Classify for TrustError {
    fn kind(&self) -> ErrorKind {
        match self {
            TrustError::NotFound(_) => ErrorKind::NotFound,
            TrustError::UnknownCaller(_) | TrustError::FingerprintMismatch { .. } => {
                ErrorKind::AuthFailure
            }
            TrustError::Forbidden { .. } | TrustError::LastOwner => ErrorKind::Forbidden,
            TrustError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            TrustError::Io(_) | TrustError::Serde(_) => ErrorKind::StorageFailure,
        }
    }
}
