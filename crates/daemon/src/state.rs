use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::{fs, io};

use common::clock::SystemClock;
use common::fs::{ensure_private_dir, write_atomic_private};
use common::master_key::{AppIdentity, MasterKeyError, MasterKeyStore, Purpose};
use common::secrets::VaultConfig;
use common::trust::{OperatorIdentity, OperatorIdentityError, TrustError, TrustStore};
use serde::{Deserialize, Serialize};

pub const APP_NAME: &str = "berth";
pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const DAEMON_KEYS_FILE_NAME: &str = "daemon_keys.json";
pub const TRUST_FILE_NAME: &str = "trust.json";
pub const SECRETS_FILE_NAME: &str = "secrets.json";
pub const AUDIT_FILE_NAME: &str = "audit.log";
pub const KNOWN_DAEMONS_FILE_NAME: &str = "known_daemons.json";
pub const IDENTITY_FILE_NAME: &str = "identity.enc";

pub const DEFAULT_API_PORT: u16 = 7420;

/// Environment variable holding the Vault token, never written to disk
pub const VAULT_TOKEN_ENV: &str = "BERTH_VAULT_TOKEN";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Port for the daemon API server
    #[serde(default = "default_api_port")]
    pub api_port: u16,
    /// Application name master keys are stored under
    #[serde(default = "default_app_name")]
    pub app_name: String,
    /// Seconds between daemon key rotations
    #[serde(default = "default_rotation_interval_secs")]
    pub rotation_interval_secs: u64,
    /// Rotated-out daemon keys kept for decryption
    #[serde(default = "default_key_retention")]
    pub key_retention: usize,
    /// Accepted clock skew for envelopes and signed requests
    #[serde(default = "default_replay_tolerance_secs")]
    pub replay_tolerance_secs: u64,
    /// Keep master keys in `keys/` when no OS credential vault is usable
    #[serde(default = "default_allow_file_fallback")]
    pub allow_file_fallback: bool,
    /// Directory for log files (stdout only if not set)
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    /// Optional HashiCorp Vault KV v2 provider for the secret store
    #[serde(default)]
    pub vault: Option<VaultConfig>,
}

fn default_api_port() -> u16 {
    DEFAULT_API_PORT
}

fn default_app_name() -> String {
    APP_NAME.to_string()
}

fn default_rotation_interval_secs() -> u64 {
    common::daemon_keys::DEFAULT_ROTATION_INTERVAL.as_secs()
}

fn default_key_retention() -> usize {
    common::daemon_keys::DEFAULT_RETENTION
}

fn default_replay_tolerance_secs() -> u64 {
    common::envelope::DEFAULT_TOLERANCE_SECS as u64
}

fn default_allow_file_fallback() -> bool {
    true
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_port: default_api_port(),
            app_name: default_app_name(),
            rotation_interval_secs: default_rotation_interval_secs(),
            key_retention: default_key_retention(),
            replay_tolerance_secs: default_replay_tolerance_secs(),
            allow_file_fallback: default_allow_file_fallback(),
            log_dir: None,
            vault: None,
        }
    }
}

/// The berth directory (`~/.berth`) and everything kept in it. Daemon and
/// CLI share the layout; each only touches its own files.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Path to the berth directory
    pub berth_dir: PathBuf,
    /// Path to the config file
    pub config_path: PathBuf,

    // daemon side
    pub daemon_keys_path: PathBuf,
    pub trust_path: PathBuf,
    pub secrets_path: PathBuf,
    pub audit_path: PathBuf,

    // cli side
    pub known_daemons_path: PathBuf,
    pub identity_path: PathBuf,

    /// Loaded configuration
    pub config: AppConfig,
}

impl AppState {
    /// Get the berth directory path (custom or default ~/.berth)
    pub fn berth_dir(custom_path: Option<PathBuf>) -> Result<PathBuf, StateError> {
        if let Some(path) = custom_path {
            return Ok(path);
        }

        let home = dirs::home_dir().ok_or(StateError::NoHomeDirectory)?;
        Ok(home.join(format!(".{}", APP_NAME)))
    }

    /// Check if the berth directory exists
    pub fn exists(custom_path: Option<PathBuf>) -> Result<bool, StateError> {
        let berth_dir = Self::berth_dir(custom_path)?;
        Ok(berth_dir.join(CONFIG_FILE_NAME).exists())
    }

    /// Initialize a new berth directory
    pub fn init(custom_path: Option<PathBuf>, config: Option<AppConfig>) -> Result<Self, StateError> {
        let berth_dir = Self::berth_dir(custom_path)?;

        if berth_dir.join(CONFIG_FILE_NAME).exists() {
            return Err(StateError::AlreadyInitialized);
        }
        ensure_private_dir(&berth_dir)?;

        let config = config.unwrap_or_default();
        let config_path = berth_dir.join(CONFIG_FILE_NAME);
        let config_toml = toml::to_string_pretty(&config)?;
        write_atomic_private(&config_path, config_toml.as_bytes())?;

        tracing::debug!(dir = %berth_dir.display(), "initialized berth directory");
        Ok(Self::with_paths(berth_dir, config))
    }

    /// Load existing state from the berth directory
    pub fn load(custom_path: Option<PathBuf>) -> Result<Self, StateError> {
        let berth_dir = Self::berth_dir(custom_path)?;

        if !berth_dir.exists() {
            return Err(StateError::NotInitialized);
        }

        let config_path = berth_dir.join(CONFIG_FILE_NAME);
        let config_toml = match fs::read_to_string(&config_path) {
            Ok(toml) => toml,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StateError::MissingFile(CONFIG_FILE_NAME.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let config: AppConfig = toml::from_str(&config_toml)?;

        Ok(Self::with_paths(berth_dir, config))
    }

    fn with_paths(berth_dir: PathBuf, config: AppConfig) -> Self {
        let path = |name: &str| berth_dir.join(name);
        Self {
            config_path: path(CONFIG_FILE_NAME),
            daemon_keys_path: path(DAEMON_KEYS_FILE_NAME),
            trust_path: path(TRUST_FILE_NAME),
            secrets_path: path(SECRETS_FILE_NAME),
            audit_path: path(AUDIT_FILE_NAME),
            known_daemons_path: path(KNOWN_DAEMONS_FILE_NAME),
            identity_path: path(IDENTITY_FILE_NAME),
            berth_dir,
            config,
        }
    }

    /// Owner of this directory's master key
    pub fn app_identity(&self) -> AppIdentity {
        AppIdentity::for_current_user(self.config.app_name.clone())
    }

    /// Master key access for this directory
    pub fn master_keys(&self) -> MasterKeyStore {
        master_keys_for(&self.berth_dir, self.config.allow_file_fallback)
    }

    /// The operator identity used by the CLI, generated on first use and
    /// stored encrypted under the operator-identity derived key
    pub async fn operator_identity(&self) -> Result<OperatorIdentity, StateError> {
        self.operator_identity_with(&self.master_keys()).await
    }

    pub async fn operator_identity_with(&self, keys: &MasterKeyStore) -> Result<OperatorIdentity, StateError> {
        let path = self.identity_path.clone();
        let identity = keys
            .with_derived_key(&self.app_identity(), Purpose::OperatorIdentity, |key| {
                OperatorIdentity::load_or_generate(&path, key)
            })
            .await??;
        Ok(identity)
    }

    /// Daemons this CLI has pinned
    pub fn known_daemons(&self) -> Result<TrustStore, StateError> {
        Ok(TrustStore::open(&self.known_daemons_path, Arc::new(SystemClock))?)
    }
}

/// OS vault first, `<dir>/keys` when allowed
pub fn master_keys_for(berth_dir: &Path, allow_file_fallback: bool) -> MasterKeyStore {
    MasterKeyStore::platform(APP_NAME, berth_dir, allow_file_fallback)
}

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("berth directory not initialized. Run 'berth init' first")]
    NotInitialized,

    #[error("berth directory already initialized")]
    AlreadyInitialized,

    #[error("no home directory found")]
    NoHomeDirectory,

    #[error("missing required file: {0}")]
    MissingFile(String),

    #[error("master key error: {0}")]
    MasterKey(#[from] MasterKeyError),

    #[error("operator identity error: {0}")]
    Identity(#[from] OperatorIdentityError),

    #[error("trust store error: {0}")]
    Trust(#[from] TrustError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("TOML deserialization error: {0}")]
    TomlDe(#[from] toml::de::Error),
}
