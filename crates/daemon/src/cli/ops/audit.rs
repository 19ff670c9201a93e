use clap::Args;

use berth_daemon::http_server::api::client::ApiError;
use berth_daemon::http_server::api::v0::audit::AuditRequest;
use berth_daemon::state::StateError;
use common::audit::{AuditEntry, Outcome};

/// Show the daemon's audit log (reader)
#[derive(Args, Debug, Clone)]
pub struct Audit {
    #[command(flatten)]
    pub request: AuditRequest,
}

#[derive(Debug, thiserror::Error)]
pub enum AuditOpError {
    #[error("API error: {0}")]
    Api(#[from] ApiError),
    #[error(transparent)]
    State(#[from] StateError),
}

fn format_entry(entry: &AuditEntry, verified: bool) -> String {
    let record = &entry.record;
    let event = &record.event;
    let outcome = match event.outcome {
        Outcome::Success => "success",
        Outcome::Failure => "failure",
        Outcome::Denied => "DENIED",
    };

    let mut line = format!(
        "{:>6} {} {:<8} {}",
        record.seq,
        record.timestamp.to_rfc3339(),
        outcome,
        event.action
    );
    if let Some(actor) = &event.actor {
        line.push_str(&format!(" actor={}", actor));
    }
    if let Some(target) = &event.target {
        line.push_str(&format!(" target={}", target));
    }
    if let Some(detail) = &event.detail {
        line.push_str(&format!(" ({})", detail));
    }
    if !verified {
        line.push_str(" [UNVERIFIED]");
    }
    line
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Audit {
    type Error = AuditOpError;
    type Output = String;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let identity = ctx.identity().await?;
        let mut client = ctx.client.clone();
        let response = client.call_signed(self.request.clone(), &identity).await?;

        if response.entries.is_empty() {
            return Ok("audit log is empty".to_string());
        }
        let lines = response
            .entries
            .iter()
            .map(|entry| {
                let verified = !response.unverifiable.contains(&entry.record.seq);
                format_entry(entry, verified)
            })
            .collect::<Vec<_>>();
        Ok(lines.join("\n"))
    }
}
