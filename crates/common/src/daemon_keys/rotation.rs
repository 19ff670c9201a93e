use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

use super::DaemonKeyManager;

/// Default time between rotations
pub const DEFAULT_ROTATION_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Background task rotating the daemon key on a fixed interval.
///
/// A failed rotation is logged and retried on the next tick; the task never
/// exits on its own. It stops when the shutdown channel fires, and never in
/// the middle of a rotation since rotation itself is synchronous.
#[derive(Debug)]
pub struct RotationTask {
    manager: Arc<DaemonKeyManager>,
    interval: Duration,
}

impl RotationTask {
    pub fn new(manager: Arc<DaemonKeyManager>, interval: Duration) -> Self {
        Self { manager, interval }
    }

    pub async fn run(self, mut shutdown_rx: watch::Receiver<()>) {
        // a daemon that was down across a rotation boundary catches up first
        if let Ok(due) = chrono::Duration::from_std(self.interval) {
            if let Err(e) = self.manager.rotate_if_due(due) {
                tracing::error!("startup key rotation failed: {}", e);
            }
        }

        let mut timer = interval(self.interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        timer.tick().await; // Skip first immediate tick

        tracing::info!(interval_secs = self.interval.as_secs(), "key rotation task started");

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    self.rotate_once();
                }
                _ = shutdown_rx.changed() => {
                    tracing::info!("key rotation task shutting down");
                    break;
                }
            }
        }
    }

    /// One rotation attempt. Returns whether it succeeded.
    pub fn rotate_once(&self) -> bool {
        match self.manager.rotate() {
            Ok(pair) => {
                tracing::debug!(key_id = pair.key_id(), "scheduled rotation complete");
                true
            }
            Err(e) => {
                tracing::error!("daemon key rotation failed, retrying next tick: {}", e);
                false
            }
        }
    }
}
