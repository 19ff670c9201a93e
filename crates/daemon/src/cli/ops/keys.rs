use clap::{Args, Subcommand};

use crate::cli::op::{Op, OpContext};
use berth_daemon::http_server::api::client::ApiError;
use berth_daemon::http_server::api::v0::keys::{KeysRequest, RotateRequest};
use berth_daemon::state::StateError;

crate::command_enum! {
    (Show, Show),
    (Rotate, Rotate),
}

pub type KeysCommand = Command;

/// Inspect or rotate the daemon's keys
#[derive(Args, Debug, Clone)]
pub struct Keys {
    #[command(subcommand)]
    pub command: KeysCommand,
}

#[async_trait::async_trait]
impl Op for Keys {
    type Error = OpError;
    type Output = OpOutput;

    async fn execute(&self, ctx: &OpContext) -> Result<Self::Output, Self::Error> {
        self.command.execute(ctx).await
    }
}

#[derive(Debug, thiserror::Error)]
pub enum KeysError {
    #[error("API error: {0}")]
    Api(#[from] ApiError),
    #[error(transparent)]
    State(#[from] StateError),
}

/// Print the daemon's current key and its retained predecessors
#[derive(Args, Debug, Clone)]
pub struct Show;

#[async_trait::async_trait]
impl Op for Show {
    type Error = KeysError;
    type Output = String;

    async fn execute(&self, ctx: &OpContext) -> Result<Self::Output, Self::Error> {
        let mut client = ctx.client.clone();
        let response = client.call(KeysRequest).await?;

        let current = &response.current;
        let mut lines = vec![
            format!("key id:      {}", current.key_id),
            format!("fingerprint: {}", current.fingerprint),
            format!("created:     {}", current.created_at.to_rfc3339()),
        ];
        if response.chain.is_empty() {
            lines.push("no retained keys".to_string());
        } else {
            lines.push("retained:".to_string());
            for key in &response.chain {
                lines.push(format!("  {} {}", key.key_id, key.fingerprint));
            }
        }
        Ok(lines.join("\n"))
    }
}

/// Rotate the daemon key now (admin)
#[derive(Args, Debug, Clone)]
pub struct Rotate;

#[async_trait::async_trait]
impl Op for Rotate {
    type Error = KeysError;
    type Output = String;

    async fn execute(&self, ctx: &OpContext) -> Result<Self::Output, Self::Error> {
        let identity = ctx.identity().await?;
        let mut client = ctx.client.clone();
        let response = client.call_signed(RotateRequest, &identity).await?;

        Ok(format!(
            "daemon key rotated to {} ({}), {} retained",
            response.key_id,
            response.fingerprint,
            response.retained.len()
        ))
    }
}
