//! Shared test utilities for the trust and secret distribution tests
#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use common::clock::{Clock, ManualClock};
use common::daemon_keys::{DaemonKeyManager, KeyManagerOptions, KeyQueryResponse, PublicKeyInfo};
use common::envelope::ReplayGuard;
use common::trust::{DaemonKeySource, OperatorIdentity, Role, TrustStore};
use tempfile::TempDir;

pub const DAEMON_ADDR: &str = "http://127.0.0.1:7420";

/// Everything a daemon holds, rooted in a temp dir
pub struct Daemon {
    pub dir: TempDir,
    pub clock: ManualClock,
    pub keys: Arc<DaemonKeyManager>,
    pub trust: TrustStore,
    pub guard: ReplayGuard,
}

pub fn daemon(retention: usize) -> Daemon {
    let dir = TempDir::new().unwrap();
    let clock = ManualClock::default();
    let shared: Arc<dyn Clock> = Arc::new(clock.clone());
    let keys = Arc::new(
        DaemonKeyManager::load_or_init(
            KeyManagerOptions::new(dir.path().join("daemon").join("keys.json")).retention(retention),
            shared.clone(),
        )
        .unwrap(),
    );
    let trust = TrustStore::open(dir.path().join("trust.json"), shared).unwrap();
    Daemon {
        dir,
        clock,
        keys,
        trust,
        guard: ReplayGuard::default(),
    }
}

impl Daemon {
    /// Register a fresh operator; the first one becomes owner
    pub fn enroll(&self, role: Role, authorizer: Option<&OperatorIdentity>) -> OperatorIdentity {
        let operator = OperatorIdentity::generate().unwrap();
        let fingerprint = authorizer.map(|a| a.fingerprint());
        self.trust
            .add_identity(operator.add_identity_request(role, None), fingerprint.as_deref())
            .unwrap();
        operator
    }
}

/// Serves the daemon's key query in process
pub struct LocalSource(pub Arc<DaemonKeyManager>);

#[async_trait]
impl DaemonKeySource for LocalSource {
    async fn fetch_keys(
        &self,
        _address: &str,
    ) -> Result<KeyQueryResponse, Box<dyn std::error::Error + Send + Sync>> {
        Ok(self.0.public_info())
    }
}

pub fn accept(_: &str, _: &str, _: &PublicKeyInfo) -> bool {
    true
}

pub fn decline(_: &str, _: &str, _: &PublicKeyInfo) -> bool {
    false
}

pub fn cli_trust() -> (TempDir, TrustStore) {
    let dir = TempDir::new().unwrap();
    let store = TrustStore::open(
        dir.path().join("known_daemons.json"),
        Arc::new(ManualClock::default()),
    )
    .unwrap();
    (dir, store)
}
