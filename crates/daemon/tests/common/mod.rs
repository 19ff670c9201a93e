//! A daemon served on an ephemeral port, with its state in a temp dir
#![allow(dead_code)]

use std::sync::Arc;

use berth_daemon::http_server::api::client::{ApiClient, ApiError};
use berth_daemon::http_server::{self, api::v0::keys::KeysRequest};
use berth_daemon::{AppState, ServiceConfig, ServiceState};
use common::clock::SystemClock;
use common::daemon_keys::{KeyQueryResponse, PublicKeyInfo};
use common::error::ErrorKind;
use common::master_key::{MasterKeyStore, MemoryKeyStore};
use common::trust::{bootstrap, OperatorIdentity, Role, TrustStore, TrustedKey};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::watch;
use url::Url;

pub struct TestDaemon {
    pub dir: TempDir,
    pub url: Url,
    pub state: ServiceState,
    shutdown: watch::Sender<()>,
}

impl Drop for TestDaemon {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
    }
}

pub async fn daemon() -> TestDaemon {
    let dir = TempDir::new().unwrap();
    let app = AppState::init(Some(dir.path().join("daemon")), None).unwrap();
    let mut config = ServiceConfig::from_app_state(&app);
    config.vault = None;

    let master_keys = MasterKeyStore::new(Some(Arc::new(MemoryKeyStore::new())), None);
    let state = ServiceState::setup(&config, &master_keys, Arc::new(SystemClock))
        .await
        .unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown, shutdown_rx) = watch::channel(());
    tokio::spawn(http_server::serve(
        listener,
        http_server::Config::new(addr),
        state.clone(),
        shutdown_rx,
    ));

    TestDaemon {
        url: Url::parse(&format!("http://{}", addr)).unwrap(),
        dir,
        state,
        shutdown,
    }
}

impl TestDaemon {
    pub fn client(&self) -> ApiClient {
        ApiClient::new(&self.url).unwrap()
    }

    /// Self-register a fresh operator as the owner
    pub async fn owner(&self) -> OperatorIdentity {
        let owner = OperatorIdentity::generate().unwrap();
        let added = self
            .client()
            .call_signed(owner.add_identity_request(Role::Owner, None), &owner)
            .await
            .unwrap();
        assert_eq!(added.role, Role::Owner);
        owner
    }

    /// Have `authorizer` add a fresh operator with `role`
    pub async fn enroll(&self, role: Role, authorizer: &OperatorIdentity) -> OperatorIdentity {
        let operator = OperatorIdentity::generate().unwrap();
        let added: TrustedKey = self
            .client()
            .call_signed(operator.add_identity_request(role, None), authorizer)
            .await
            .unwrap();
        assert_eq!(added.role, role);
        operator
    }

    /// Pin this daemon in a fresh CLI-side store
    pub async fn pin(&self) -> (TempDir, TrustStore, TrustedKey) {
        let dir = TempDir::new().unwrap();
        let known = TrustStore::open(dir.path().join("known_daemons.json"), Arc::new(SystemClock)).unwrap();
        let outcome = bootstrap(self.url.as_str(), &self.client(), &accept, Role::Reader, &known)
            .await
            .unwrap();
        let pinned = outcome.pinned().clone();
        (dir, known, pinned)
    }

    pub async fn keys(&self) -> KeyQueryResponse {
        self.client().call(KeysRequest).await.unwrap()
    }
}

pub fn accept(_: &str, _: &str, _: &PublicKeyInfo) -> bool {
    true
}

pub fn decline(_: &str, _: &str, _: &PublicKeyInfo) -> bool {
    false
}

/// The error code the daemon answered with
pub fn remote_kind(error: ApiError) -> ErrorKind {
    match error.kind() {
        Some(kind) => kind,
        None => panic!("expected a daemon error body, got {error}"),
    }
}
