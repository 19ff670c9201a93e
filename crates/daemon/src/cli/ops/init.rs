use std::path::PathBuf;

use clap::Args;

use berth_daemon::state::{AppConfig, AppState, StateError};

#[derive(Args, Debug, Clone)]
pub struct Init {
    /// Port for the daemon API server
    #[arg(long)]
    pub api_port: Option<u16>,

    /// Application name master keys are stored under
    #[arg(long)]
    pub app_name: Option<String>,

    /// Seconds between daemon key rotations
    #[arg(long)]
    pub rotation_interval_secs: Option<u64>,

    /// Rotated-out daemon keys kept for decryption
    #[arg(long)]
    pub key_retention: Option<usize>,

    /// Refuse to keep master keys on disk when no OS credential vault is usable
    #[arg(long)]
    pub no_file_fallback: bool,

    /// Directory for daemon log files
    #[arg(long)]
    pub log_dir: Option<PathBuf>,
}

impl Init {
    fn config(&self) -> AppConfig {
        let defaults = AppConfig::default();
        AppConfig {
            api_port: self.api_port.unwrap_or(defaults.api_port),
            app_name: self.app_name.clone().unwrap_or(defaults.app_name),
            rotation_interval_secs: self
                .rotation_interval_secs
                .unwrap_or(defaults.rotation_interval_secs),
            key_retention: self.key_retention.unwrap_or(defaults.key_retention),
            allow_file_fallback: !self.no_file_fallback,
            log_dir: self.log_dir.clone(),
            ..defaults
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("init failed: {0}")]
    State(#[from] StateError),
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Init {
    type Error = InitError;
    type Output = String;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let state = AppState::init(ctx.config_path.clone(), Some(self.config()))?;
        let identity = state.operator_identity().await?;

        Ok(format!(
            "Initialized berth directory at {}\n  config:      {}\n  api_port:    {}\n  fingerprint: {}",
            state.berth_dir.display(),
            state.config_path.display(),
            state.config.api_port,
            identity.fingerprint()
        ))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_flags_override_defaults() {
        let init = Init {
            api_port: Some(9000),
            app_name: None,
            rotation_interval_secs: Some(60),
            key_retention: None,
            no_file_fallback: true,
            log_dir: None,
        };
        let config = init.config();
        assert_eq!(config.api_port, 9000);
        assert_eq!(config.rotation_interval_secs, 60);
        assert_eq!(config.key_retention, AppConfig::default().key_retention);
        assert!(!config.allow_file_fallback);
    }
}
