use std::sync::Arc;
use std::time::Duration;

use common::audit::{AuditError, AuditEvent, AuditLog};
use common::clock::{Clock, SystemClock};
use common::daemon_keys::{DaemonKeyError, DaemonKeyManager, KeyManagerOptions};
use common::envelope::ReplayGuard;
use common::master_key::{derive_for_purpose, MasterKeyError, MasterKeyStore, Purpose};
use common::secrets::{ProviderError, SecretStore, SecretStoreError, VaultProvider};
use common::trust::{TrustError, TrustStore};

use crate::state::master_keys_for;
use crate::ServiceConfig;

/// Everything the daemon's handlers and background tasks share
#[derive(Clone)]
pub struct State {
    keys: Arc<DaemonKeyManager>,
    trust: Arc<TrustStore>,
    secrets: Arc<SecretStore>,
    audit: Arc<AuditLog>,
    guard: Arc<ReplayGuard>,
    clock: Arc<dyn Clock>,
    rotation_interval: Duration,
}

impl State {
    pub async fn from_config(config: &ServiceConfig) -> Result<Self, StateSetupError> {
        let master_keys = master_keys_for(&config.berth_dir, config.allow_file_fallback);
        Self::setup(config, &master_keys, Arc::new(SystemClock)).await
    }

    /// Build the state with an explicit master key source and clock
    pub async fn setup(
        config: &ServiceConfig,
        master_keys: &MasterKeyStore,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, StateSetupError> {
        // 1. Derive the at-rest keys, then let go of the master key
        let master = master_keys.get_or_create_master_key(&config.identity).await?;
        let platform_key = derive_for_purpose(&master, Purpose::platform())?;
        let store_key = derive_for_purpose(&master, Purpose::SecretStore)?;
        drop(master);
        tracing::debug!(app = %config.identity.app, "ServiceState::setup - master key loaded");

        // 2. Daemon key ring, sealed on disk with the platform key
        let keys = Arc::new(DaemonKeyManager::load_or_init(
            KeyManagerOptions::new(&config.daemon_keys_path)
                .retention(config.key_retention)
                .sealed_with(platform_key),
            clock.clone(),
        )?);
        let current = keys.current();
        tracing::info!(
            key_id = current.key_id(),
            fingerprint = %current.fingerprint(),
            "daemon key loaded"
        );

        // 3. Trusted operators
        let trust = Arc::new(TrustStore::open(&config.trust_path, clock.clone())?);

        // 4. Secret store, with an external provider if configured
        let secrets = Arc::new(SecretStore::open(&config.secrets_path, store_key, clock.clone())?);
        if let Some(vault) = &config.vault {
            let token = config
                .vault_token
                .clone()
                .ok_or(StateSetupError::MissingVaultToken)?;
            secrets.register_provider(Arc::new(VaultProvider::new(vault.clone(), token)?));
            tracing::info!(address = %vault.address, "vault provider registered");
        }

        // 5. Audit log, signed with the daemon key
        let audit = Arc::new(AuditLog::open(&config.audit_path, keys.clone(), clock.clone())?);

        Ok(Self {
            keys,
            trust,
            secrets,
            audit,
            guard: Arc::new(ReplayGuard::new(config.replay_tolerance)),
            clock,
            rotation_interval: config.rotation_interval,
        })
    }

    pub fn keys(&self) -> &Arc<DaemonKeyManager> {
        &self.keys
    }

    pub fn trust(&self) -> &TrustStore {
        &self.trust
    }

    pub fn secrets(&self) -> &SecretStore {
        &self.secrets
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn guard(&self) -> &ReplayGuard {
        &self.guard
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    pub fn rotation_interval(&self) -> Duration {
        self.rotation_interval
    }

    /// Append to the audit log. A failed write is logged and does not undo
    /// the operation being recorded.
    pub fn record(&self, event: AuditEvent) {
        if let Err(e) = self.audit.append(event) {
            tracing::error!(error = %e, "failed to write audit entry");
        }
    }

    /// Whether the persisted stores are still reachable
    pub async fn is_ready(&self) -> Result<(), ReadinessError> {
        for path in [self.keys.path(), self.audit.path()] {
            tokio::fs::metadata(path)
                .await
                .map_err(|e| ReadinessError::Unreachable(path.display().to_string(), e))?;
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReadinessError {
    #[error("{0} is not reachable: {1}")]
    Unreachable(String, std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum StateSetupError {
    #[error("master key error: {0}")]
    MasterKey(#[from] MasterKeyError),
    #[error("daemon key error: {0}")]
    DaemonKeys(#[from] DaemonKeyError),
    #[error("trust store error: {0}")]
    Trust(#[from] TrustError),
    #[error("secret store error: {0}")]
    Secrets(#[from] SecretStoreError),
    #[error("vault provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("vault is configured but {} is not set", crate::state::VAULT_TOKEN_ENV)]
    MissingVaultToken,
    #[error("audit log error: {0}")]
    Audit(#[from] AuditError),
}
