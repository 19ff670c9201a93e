use std::path::PathBuf;
use std::time::Duration;

use common::master_key::AppIdentity;
use common::secrets::VaultConfig;

use crate::state::{AppState, VAULT_TOKEN_ENV};

/// Upper bound on the configured replay window
pub const MAX_REPLAY_TOLERANCE_SECS: u64 = 24 * 60 * 60;

/// Replay window for `secs`, clamped to [`MAX_REPLAY_TOLERANCE_SECS`]
pub fn replay_tolerance(secs: u64) -> chrono::Duration {
    if secs > MAX_REPLAY_TOLERANCE_SECS {
        tracing::warn!(
            configured = secs,
            max = MAX_REPLAY_TOLERANCE_SECS,
            "replay tolerance too large, clamping"
        );
    }
    chrono::Duration::seconds(secs.min(MAX_REPLAY_TOLERANCE_SECS) as i64)
}

pub struct Config {
    // key material
    /// Owner of the daemon's master key
    pub identity: AppIdentity,
    /// Path to the berth directory, root of the file key store fallback
    pub berth_dir: PathBuf,
    /// Allow master keys on disk when no OS credential vault is usable
    pub allow_file_fallback: bool,

    // persisted stores
    pub daemon_keys_path: PathBuf,
    pub trust_path: PathBuf,
    pub secrets_path: PathBuf,
    pub audit_path: PathBuf,

    // key rotation and replay protection
    pub rotation_interval: Duration,
    /// Rotated-out keys kept around for decryption
    pub key_retention: usize,
    pub replay_tolerance: chrono::Duration,

    // external secret provider
    pub vault: Option<VaultConfig>,
    pub vault_token: Option<String>,

    // http server configuration
    /// Port for the API HTTP server
    pub api_port: u16,

    // logging
    pub log_level: tracing::Level,
    /// Directory for log files (optional, logs to stdout only if not set)
    pub log_dir: Option<PathBuf>,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("identity", &self.identity)
            .field("berth_dir", &self.berth_dir)
            .field("allow_file_fallback", &self.allow_file_fallback)
            .field("rotation_interval", &self.rotation_interval)
            .field("key_retention", &self.key_retention)
            .field("replay_tolerance", &self.replay_tolerance)
            .field("vault", &self.vault)
            .field("vault_token", &self.vault_token.as_ref().map(|_| "<redacted>"))
            .field("api_port", &self.api_port)
            .field("log_level", &self.log_level)
            .field("log_dir", &self.log_dir)
            .finish_non_exhaustive()
    }
}

impl Config {
    /// Daemon configuration for an initialized berth directory
    pub fn from_app_state(state: &AppState) -> Self {
        Self {
            identity: state.app_identity(),
            berth_dir: state.berth_dir.clone(),
            allow_file_fallback: state.config.allow_file_fallback,
            daemon_keys_path: state.daemon_keys_path.clone(),
            trust_path: state.trust_path.clone(),
            secrets_path: state.secrets_path.clone(),
            audit_path: state.audit_path.clone(),
            rotation_interval: Duration::from_secs(state.config.rotation_interval_secs.max(1)),
            key_retention: state.config.key_retention,
            replay_tolerance: replay_tolerance(state.config.replay_tolerance_secs),
            vault: state.config.vault.clone(),
            vault_token: std::env::var(VAULT_TOKEN_ENV).ok(),
            api_port: state.config.api_port,
            log_level: tracing::Level::INFO,
            log_dir: state.config.log_dir.clone(),
        }
    }
}
