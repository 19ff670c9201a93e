use async_trait::async_trait;

use super::role::Role;
use super::store::{TrustStore, TrustedKey};
use super::TrustError;
use crate::crypto::fingerprints_match;
use crate::daemon_keys::{KeyQueryResponse, PublicKeyInfo};
use crate::error::{Classify, ErrorKind};

/// Role a daemon is pinned with unless the operator picks another
pub const DEFAULT_DAEMON_ROLE: Role = Role::Reader;

pub type FetchError = Box<dyn std::error::Error + Send + Sync>;

/// Where the CLI learns a daemon's public keys (the unauthenticated key
/// query)
#[async_trait]
pub trait DaemonKeySource: Send + Sync {
    async fn fetch_keys(&self, address: &str) -> Result<KeyQueryResponse, FetchError>;
}

/// Out-of-band confirmation of a fingerprint for a never-seen address
pub trait Confirm: Send + Sync {
    fn confirm(&self, address: &str, fingerprint: &str, info: &PublicKeyInfo) -> bool;
}

impl<F> Confirm for F
where
    F: Fn(&str, &str, &PublicKeyInfo) -> bool + Send + Sync,
{
    fn confirm(&self, address: &str, fingerprint: &str, info: &PublicKeyInfo) -> bool {
        self(address, fingerprint, info)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("failed to query keys from {address}: {source}")]
    Fetch {
        address: String,
        #[source]
        source: FetchError,
    },
    #[error("{address} reported fingerprint {reported} but its key hashes to {computed}")]
    FingerprintMismatch {
        address: String,
        reported: String,
        computed: String,
    },
    #[error("key for {address} changed from pinned {pinned} to {presented} without a valid endorsement chain")]
    KeyMismatch {
        address: String,
        pinned: String,
        presented: String,
    },
    #[error("fingerprint for {0} was not confirmed")]
    Declined(String),
    #[error(transparent)]
    Trust(#[from] TrustError),
}

impl Classify for BootstrapError {
    fn kind(&self) -> ErrorKind {
        match self {
            BootstrapError::Fetch { .. } => ErrorKind::StorageFailure,
            BootstrapError::FingerprintMismatch { .. }
            | BootstrapError::KeyMismatch { .. }
            | BootstrapError::Declined(_) => ErrorKind::AuthFailure,
            BootstrapError::Trust(e) => e.kind(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootstrapOutcome {
    /// Presented keys are exactly the pinned ones
    AlreadyTrusted(TrustedKey),
    /// The daemon rotated; the pin now follows the endorsed successor
    Rotated { previous: String, pinned: TrustedKey },
    /// First contact, confirmed and pinned
    Pinned(TrustedKey),
}

impl BootstrapOutcome {
    pub fn pinned(&self) -> &TrustedKey {
        match self {
            BootstrapOutcome::AlreadyTrusted(key)
            | BootstrapOutcome::Rotated { pinned: key, .. }
            | BootstrapOutcome::Pinned(key) => key,
        }
    }
}

/// Establish (or re-check) trust in the daemon at `address`, pinning it
/// with `role` on first contact. A followed rotation keeps the pinned role.
///
/// Fails closed: a pinned address presenting different keys is only
/// accepted when the presented key descends from the pinned one through
/// valid endorsements.
pub async fn bootstrap(
    address: &str,
    source: &dyn DaemonKeySource,
    confirm: &dyn Confirm,
    role: Role,
    store: &TrustStore,
) -> Result<BootstrapOutcome, BootstrapError> {
    let response = source
        .fetch_keys(address)
        .await
        .map_err(|source| BootstrapError::Fetch {
            address: address.to_string(),
            source,
        })?;
    let presented = &response.current;

    let computed = presented.computed_fingerprint();
    if !fingerprints_match(&computed, &presented.fingerprint) {
        tracing::warn!(
            address,
            reported = %presented.fingerprint,
            computed = %computed,
            "daemon reported a fingerprint that does not match its key"
        );
        return Err(BootstrapError::FingerprintMismatch {
            address: address.to_string(),
            reported: presented.fingerprint.clone(),
            computed,
        });
    }

    match store.pinned(address) {
        Some(pinned) => {
            let pinned_info = pinned.to_public_info();
            if presented.same_keys(&pinned_info) {
                tracing::debug!(address, fingerprint = %computed, "daemon key matches pin");
                return Ok(BootstrapOutcome::AlreadyTrusted(pinned));
            }

            if let Err(e) = response.verify_descends_from(&pinned_info) {
                tracing::error!(
                    address,
                    pinned = %pinned.fingerprint,
                    presented = %computed,
                    "daemon key changed without a valid endorsement chain: {}",
                    e
                );
                return Err(BootstrapError::KeyMismatch {
                    address: address.to_string(),
                    pinned: pinned.fingerprint,
                    presented: computed,
                });
            }

            let repinned = store.pin(address, presented, pinned.role)?;
            tracing::info!(
                address,
                from = %pinned.fingerprint,
                to = %repinned.fingerprint,
                "followed daemon key rotation"
            );
            Ok(BootstrapOutcome::Rotated {
                previous: pinned.fingerprint,
                pinned: repinned,
            })
        }
        None => {
            if !confirm.confirm(address, &computed, presented) {
                tracing::warn!(address, fingerprint = %computed, "daemon fingerprint declined");
                return Err(BootstrapError::Declined(address.to_string()));
            }
            let pinned = store.pin(address, presented, role)?;
            Ok(BootstrapOutcome::Pinned(pinned))
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;
    use crate::clock::ManualClock;
    use crate::daemon_keys::{DaemonKeyManager, KeyManagerOptions};

    struct Fixed(Mutex<KeyQueryResponse>);

    #[async_trait]
    impl DaemonKeySource for Fixed {
        async fn fetch_keys(&self, _address: &str) -> Result<KeyQueryResponse, FetchError> {
            Ok(self.0.lock().clone())
        }
    }

    const ADDR: &str = "http://daemon.internal:7420";

    fn setup() -> (tempfile::TempDir, DaemonKeyManager, TrustStore) {
        let dir = tempfile::TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::default());
        let manager =
            DaemonKeyManager::load_or_init(KeyManagerOptions::new(dir.path().join("keys.json")), clock.clone())
                .unwrap();
        (dir, manager, TrustStore::in_memory(clock))
    }

    fn yes(_: &str, _: &str, _: &PublicKeyInfo) -> bool {
        true
    }

    fn no(_: &str, _: &str, _: &PublicKeyInfo) -> bool {
        false
    }

    #[tokio::test]
    async fn test_first_contact_pins_after_confirmation() {
        let (_dir, manager, store) = setup();
        let source = Fixed(Mutex::new(manager.public_info()));

        let err = bootstrap(ADDR, &source, &no, Role::Reader, &store).await.unwrap_err();
        assert!(matches!(err, BootstrapError::Declined(_)));
        assert!(store.pinned(ADDR).is_none());

        let outcome = bootstrap(ADDR, &source, &yes, Role::Reader, &store).await.unwrap();
        assert!(matches!(outcome, BootstrapOutcome::Pinned(_)));
        assert_eq!(outcome.pinned().fingerprint, manager.current().fingerprint());

        let again = bootstrap(ADDR, &source, &no, Role::Reader, &store).await.unwrap();
        assert!(matches!(again, BootstrapOutcome::AlreadyTrusted(_)));
    }

    #[tokio::test]
    async fn test_substituted_key_fails_closed() {
        let (_dir, manager, store) = setup();
        let source = Fixed(Mutex::new(manager.public_info()));
        bootstrap(ADDR, &source, &yes, Role::Reader, &store).await.unwrap();

        let (_other_dir, impostor, _) = setup();
        *source.0.lock() = impostor.public_info();

        let err = bootstrap(ADDR, &source, &yes, Role::Reader, &store).await.unwrap_err();
        assert!(matches!(err, BootstrapError::KeyMismatch { .. }));
        assert_eq!(err.kind(), ErrorKind::AuthFailure);
        assert_eq!(
            store.pinned(ADDR).unwrap().fingerprint,
            manager.current().fingerprint()
        );
    }

    #[tokio::test]
    async fn test_follows_endorsed_rotation() {
        let (_dir, manager, store) = setup();
        let source = Fixed(Mutex::new(manager.public_info()));
        let original = bootstrap(ADDR, &source, &yes, Role::Reader, &store).await.unwrap();

        manager.rotate().unwrap();
        manager.rotate().unwrap();
        *source.0.lock() = manager.public_info();

        let outcome = bootstrap(ADDR, &source, &no, Role::Reader, &store).await.unwrap();
        match outcome {
            BootstrapOutcome::Rotated { previous, pinned } => {
                assert_eq!(previous, original.pinned().fingerprint);
                assert_eq!(pinned.key_id, manager.current().key_id());
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_pin_keeps_chosen_role_across_rotation() {
        let (_dir, manager, store) = setup();
        let source = Fixed(Mutex::new(manager.public_info()));
        let outcome = bootstrap(ADDR, &source, &yes, Role::Deployer, &store).await.unwrap();
        assert_eq!(outcome.pinned().role, Role::Deployer);

        manager.rotate().unwrap();
        *source.0.lock() = manager.public_info();
        let outcome = bootstrap(ADDR, &source, &no, DEFAULT_DAEMON_ROLE, &store).await.unwrap();
        assert!(matches!(outcome, BootstrapOutcome::Rotated { .. }));
        assert_eq!(store.pinned(ADDR).unwrap().role, Role::Deployer);
    }

    #[tokio::test]
    async fn test_lying_fingerprint_rejected() {
        let (_dir, manager, store) = setup();
        let mut info = manager.public_info();
        info.current.fingerprint = "0".repeat(32);
        let source = Fixed(Mutex::new(info));

        let err = bootstrap(ADDR, &source, &yes, Role::Reader, &store).await.unwrap_err();
        assert!(matches!(err, BootstrapError::FingerprintMismatch { .. }));
        assert!(store.pinned(ADDR).is_none());
    }
}
