//! Error taxonomy shared by every component.
//!
//! Each module owns its own `thiserror` enum; this module only provides the
//! coarse classification that callers (and the daemon's HTTP layer) use to
//! decide whether a failure is recoverable.

use serde::{Deserialize, Serialize};

/// Coarse classification of a failure.
///
/// Cryptographic and authorization failures (`AuthFailure`, `Forbidden`,
/// `ReplayDetected`) are never retried: retrying does not change a forged
/// signature. `StorageFailure` may be retried by the calling layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Secret, identity or key absent
    NotFound,
    /// Signature or AEAD authentication failed
    AuthFailure,
    /// Create-only guard tripped
    AlreadyExists,
    /// No secure storage backend and no permitted fallback
    UnsupportedPlatform,
    /// I/O error persisting or reading a key, secret or store
    StorageFailure,
    /// Role check failed
    Forbidden,
    /// Envelope or request timestamp outside the tolerance window
    ReplayDetected,
    /// A daemon key was rotated out of the retention window
    KeyEvicted,
    /// Malformed input (bad encoding, wrong lengths, bad file names)
    InvalidInput,
}

impl ErrorKind {
    /// Stable machine readable code used on the wire
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::AuthFailure => "auth_failure",
            ErrorKind::AlreadyExists => "already_exists",
            ErrorKind::UnsupportedPlatform => "unsupported_platform",
            ErrorKind::StorageFailure => "storage_failure",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::ReplayDetected => "replay_detected",
            ErrorKind::KeyEvicted => "key_evicted",
            ErrorKind::InvalidInput => "invalid_input",
        }
    }

    /// Whether the failure must be written to the audit log
    pub fn is_security_relevant(&self) -> bool {
        matches!(
            self,
            ErrorKind::AuthFailure | ErrorKind::Forbidden | ErrorKind::ReplayDetected
        )
    }

    /// Whether a caller may retry the same operation (with backoff)
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::StorageFailure)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// Implemented by every module error so it can be mapped onto [`ErrorKind`].
pub trait Classify {
    fn kind(&self) -> ErrorKind;
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_security_relevant_kinds() {
        assert!(ErrorKind::AuthFailure.is_security_relevant());
        assert!(ErrorKind::Forbidden.is_security_relevant());
        assert!(ErrorKind::ReplayDetected.is_security_relevant());
        assert!(!ErrorKind::NotFound.is_security_relevant());
        assert!(!ErrorKind::StorageFailure.is_security_relevant());
    }

    #[test]
    fn test_only_storage_is_retryable() {
        assert!(ErrorKind::StorageFailure.is_retryable());
        assert!(!ErrorKind::AuthFailure.is_retryable());
        assert!(!ErrorKind::ReplayDetected.is_retryable());
    }

    #[test]
    fn test_code_serde_agree() {
        let json = serde_json::to_string(&ErrorKind::KeyEvicted).unwrap();
        assert_eq!(json, format!("\"{}\"", ErrorKind::KeyEvicted.code()));
    }
}
