//! Daemon process lifecycle: logging, signals, the background tasks and
//! their orderly stop.

pub mod utils;

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use common::daemon_keys::RotationTask;
use futures::future::join_all;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::http_server;
use crate::{ServiceConfig, ServiceState};

/// Time the tasks get to finish once a stop is requested
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

const LOG_FILE_PREFIX: &str = "berth.log";

mod exit {
    pub const SIGNALS: i32 = 2;
    pub const STATE: i32 = 3;
    pub const DRAIN: i32 = 4;
}

/// A running daemon: the API server and the key rotation task
pub struct ShutdownHandle {
    signals: JoinHandle<()>,
    tasks: Vec<JoinHandle<()>>,
    stop: watch::Sender<()>,
}

impl ShutdownHandle {
    /// Wait for a signal or [`ShutdownHandle::shutdown`], then for the
    /// tasks to drain
    pub async fn wait(self) {
        let _ = self.signals.await;
        if tokio::time::timeout(DRAIN_TIMEOUT, join_all(self.tasks))
            .await
            .is_err()
        {
            tracing::error!(
                timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "daemon tasks did not stop in time"
            );
            std::process::exit(exit::DRAIN);
        }
        tracing::info!("daemon stopped");
    }

    pub fn shutdown(&self) {
        let _ = self.stop.send(());
    }
}

fn env_filter(level: tracing::Level) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy()
}

fn file_writer(log_dir: &Path, guards: &mut Vec<WorkerGuard>) -> Option<NonBlocking> {
    if let Err(e) = std::fs::create_dir_all(log_dir) {
        eprintln!(
            "warning: cannot create log directory {}: {}",
            log_dir.display(),
            e
        );
        return None;
    }
    let appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    guards.push(guard);
    Some(writer)
}

/// Compact stdout logs, plus a daily rolling file when a log directory is
/// configured. The guards flush on drop and must outlive the daemon.
fn init_logging(config: &ServiceConfig) -> Vec<WorkerGuard> {
    let mut guards = Vec::new();
    let (stdout, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());
    guards.push(stdout_guard);

    let stdout_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(stdout)
        .with_filter(env_filter(config.log_level));
    let file_layer = config
        .log_dir
        .as_deref()
        .and_then(|dir| file_writer(dir, &mut guards))
        .map(|writer| {
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(env_filter(config.log_level))
        });

    tracing_subscriber::registry()
        .with(stdout_layer)
        .with(file_layer)
        .init();

    utils::register_panic_logger();
    utils::report_build_info();
    guards
}

/// Load the daemon's state and spawn its tasks. Exits the process when
/// signal handlers or state cannot be set up.
pub async fn start_service(config: &ServiceConfig) -> (ServiceState, ShutdownHandle) {
    let (signals, stop, stopped) = match utils::graceful_shutdown_blocker() {
        Ok(parts) => parts,
        Err(e) => {
            tracing::error!(error = %e, "failed to install signal handlers");
            std::process::exit(exit::SIGNALS);
        }
    };
    let state = match ServiceState::from_config(config).await {
        Ok(state) => state,
        Err(e) => {
            tracing::error!(error = %e, "failed to load daemon state");
            std::process::exit(exit::STATE);
        }
    };

    let api_addr = SocketAddr::from(([0, 0, 0, 0], config.api_port));
    let api = {
        let state = state.clone();
        let stopped = stopped.clone();
        async move {
            let config = http_server::Config::new(api_addr);
            if let Err(e) = http_server::run_api(config, state, stopped).await {
                tracing::error!(error = %e, "api server failed");
            }
        }
    };
    let rotation = RotationTask::new(state.keys().clone(), state.rotation_interval());
    let tasks = vec![tokio::spawn(api), tokio::spawn(rotation.run(stopped))];

    let current = state.keys().current();
    tracing::info!(
        %api_addr,
        key_id = current.key_id(),
        rotation_interval_secs = state.rotation_interval().as_secs(),
        "berth daemon running"
    );

    (state, ShutdownHandle { signals, tasks, stop })
}

/// Run the daemon until it is told to stop
pub async fn spawn_service(config: &ServiceConfig) {
    let _guards = init_logging(config);
    let (_, handle) = start_service(config).await;
    handle.wait().await;
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_file_writer_creates_log_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        let log_dir = dir.path().join("logs").join("daemon");
        let mut guards = Vec::new();

        assert!(file_writer(&log_dir, &mut guards).is_some());
        assert!(log_dir.is_dir());
        assert_eq!(guards.len(), 1);
    }

    #[test]
    fn test_file_writer_skips_unusable_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        let blocker = dir.path().join("logs");
        std::fs::write(&blocker, b"not a directory").unwrap();
        let mut guards = Vec::new();

        assert!(file_writer(&blocker, &mut guards).is_none());
        assert!(guards.is_empty());
    }
}
