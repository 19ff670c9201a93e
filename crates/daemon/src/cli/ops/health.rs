use clap::Args;

use berth_daemon::state::AppState;

#[derive(Args, Debug, Clone)]
pub struct Health;

#[derive(Debug, thiserror::Error)]
pub enum HealthError {
    #[error("Health check failed: {0}")]
    Failed(String),
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Health {
    type Error = HealthError;
    type Output = String;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let mut lines = Vec::new();

        // 1. Check config directory
        lines.push("Config:".to_string());
        match AppState::load(ctx.config_path.clone()) {
            Ok(state) => {
                let present = |path: &std::path::Path| if path.exists() { "OK" } else { "absent" };
                lines.push(format!("  directory:      {}", state.berth_dir.display()));
                lines.push("  config.toml:    OK".to_string());
                lines.push(format!("  identity:       {}", present(&state.identity_path)));
                lines.push(format!("  known daemons:  {}", present(&state.known_daemons_path)));
                lines.push(format!("  daemon keys:    {}", present(&state.daemon_keys_path)));
                lines.push(format!("  api_port:       {}", state.config.api_port));
            }
            Err(e) => {
                lines.push(format!("  error: {}", e));
            }
        }

        // 2. Check daemon liveness and readiness
        let base = ctx.client.base_url();
        let client = ctx.client.http_client();

        lines.push(String::new());
        lines.push(format!("Daemon ({}):", base));

        for check in ["livez", "readyz"] {
            let url = format!("{}/_status/{}", base.as_str().trim_end_matches('/'), check);
            let line = match client.get(&url).send().await {
                Ok(resp) if resp.status().is_success() => format!("  {}: OK", check),
                Ok(resp) => format!("  {}: UNHEALTHY ({})", check, resp.status()),
                Err(_) => format!("  {}: NOT REACHABLE", check),
            };
            lines.push(line);
        }

        Ok(lines.join("\n"))
    }
}
