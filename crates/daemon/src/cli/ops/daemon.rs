use clap::Args;

use berth_daemon::state::{AppState, StateError};
use berth_daemon::{spawn_service, ServiceConfig};

#[derive(Args, Debug, Clone)]
pub struct Daemon {
    /// Override API server port (default from config)
    #[arg(long)]
    pub api_port: Option<u16>,

    /// Directory for log files (logs to stdout only if not set)
    #[arg(long)]
    pub log_dir: Option<std::path::PathBuf>,

    /// Log more
    #[arg(long)]
    pub debug: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("state error: {0}")]
    StateError(#[from] StateError),
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Daemon {
    type Error = DaemonError;
    type Output = String;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let state = AppState::load(ctx.config_path.clone())?;

        let mut config = ServiceConfig::from_app_state(&state);
        if let Some(port) = self.api_port {
            config.api_port = port;
        }
        if self.log_dir.is_some() {
            config.log_dir = self.log_dir.clone();
        }
        if self.debug {
            config.log_level = tracing::Level::DEBUG;
        }

        spawn_service(&config).await;
        Ok("daemon ended".to_string())
    }
}
