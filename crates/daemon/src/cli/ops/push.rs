use std::path::PathBuf;

use chrono::Utc;
use clap::Args;

use berth_daemon::http_server::api::client::ApiError;
use berth_daemon::state::StateError;
use common::daemon_keys::PublicKeyInfo;
use common::envelope::{seal, EnvelopeError, SecretBundle};
use common::trust::{bootstrap, BootstrapError, DEFAULT_DAEMON_ROLE};

/// Seal secrets for an application to the pinned daemon key and push them
#[derive(Args, Debug, Clone)]
pub struct Push {
    /// Application the secrets belong to
    #[arg(long)]
    pub app: String,

    /// Read NAME=VALUE lines from a dotenv file
    #[arg(long)]
    pub env_file: Option<PathBuf>,

    /// NAME=VALUE pairs, applied after the env file
    pub values: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum PushError {
    #[error(transparent)]
    State(#[from] StateError),
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("line {line}: expected NAME=VALUE")]
    Parse { line: usize },
    #[error("invalid secret argument '{0}', expected NAME=VALUE")]
    Argument(String),
    #[error("nothing to push")]
    Empty,
    #[error("daemon {0} is not pinned, run 'berth bootstrap' first")]
    NotPinned(String),
    #[error(transparent)]
    Bootstrap(BootstrapError),
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    #[error("API error: {0}")]
    Api(#[from] ApiError),
}

impl From<BootstrapError> for PushError {
    fn from(e: BootstrapError) -> Self {
        match e {
            BootstrapError::Declined(address) => PushError::NotPinned(address),
            other => PushError::Bootstrap(other),
        }
    }
}

impl Push {
    fn bundle(&self) -> Result<SecretBundle, PushError> {
        let mut bundle = SecretBundle::new(self.app.clone());

        if let Some(path) = &self.env_file {
            let contents = std::fs::read_to_string(path).map_err(|source| PushError::Read {
                path: path.clone(),
                source,
            })?;
            for (name, value) in parse_env(&contents)? {
                bundle.secrets.insert(name, value);
            }
        }

        for arg in &self.values {
            let (name, value) =
                parse_pair(arg).ok_or_else(|| PushError::Argument(arg.clone()))?;
            bundle.secrets.insert(name, value);
        }

        if bundle.secrets.is_empty() {
            return Err(PushError::Empty);
        }
        Ok(bundle)
    }
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Push {
    type Error = PushError;
    type Output = String;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let bundle = self.bundle()?;
        let state = ctx.state()?;
        let identity = state.operator_identity().await?;
        let known = state.known_daemons()?;

        // re-checks the pin and follows endorsed rotations, never pins anew
        let never = |_: &str, _: &str, _: &PublicKeyInfo| false;
        let outcome = bootstrap(ctx.address(), &ctx.client, &never, DEFAULT_DAEMON_ROLE, &known).await?;
        let daemon = outcome.pinned();

        let plaintext = bundle.to_bytes()?;
        let envelope = seal(
            &identity,
            &daemon.key_id,
            &daemon.public_key,
            &plaintext,
            Utc::now(),
        )?;

        let mut client = ctx.client.clone();
        let response = client.call_signed(envelope, &identity).await?;

        Ok(format!(
            "pushed {} secrets for {} to key {}: {}",
            response.applied.len(),
            response.app,
            response.key_id,
            response.applied.join(", ")
        ))
    }
}

/// Parse dotenv text: `NAME=VALUE` per line, `#` comments, optional
/// `export ` prefix, values optionally wrapped in matching quotes.
pub fn parse_env(contents: &str) -> Result<Vec<(String, String)>, PushError> {
    let mut pairs = Vec::new();
    for (index, raw) in contents.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let pair = parse_pair(line).ok_or(PushError::Parse { line: index + 1 })?;
        pairs.push(pair);
    }
    Ok(pairs)
}

fn parse_pair(input: &str) -> Option<(String, String)> {
    let (name, value) = input.split_once('=')?;
    let name = name.trim();
    if name.is_empty() || name.chars().any(char::is_whitespace) {
        return None;
    }
    Some((name.to_string(), unquote(value.trim()).to_string()))
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_env() {
        let contents = r#"
# database
DB_PASSWORD=hunter2
export API_KEY = "abc def"
TOKEN='x=y'
EMPTY=
"#;
        let pairs = parse_env(contents).unwrap();
        assert_eq!(
            pairs,
            vec![
                ("DB_PASSWORD".to_string(), "hunter2".to_string()),
                ("API_KEY".to_string(), "abc def".to_string()),
                ("TOKEN".to_string(), "x=y".to_string()),
                ("EMPTY".to_string(), String::new()),
            ]
        );
    }

    #[test]
    fn test_parse_env_reports_line() {
        let err = parse_env("A=1\nnot a pair\n").unwrap_err();
        assert!(matches!(err, PushError::Parse { line: 2 }));
    }

    #[test]
    fn test_bundle_arguments_override_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let env_file = dir.path().join(".env");
        std::fs::write(&env_file, "DB_PASSWORD=old\nPORT=5432\n").unwrap();

        let push = Push {
            app: "demo".to_string(),
            env_file: Some(env_file),
            values: vec!["DB_PASSWORD=new".to_string()],
        };
        let bundle = push.bundle().unwrap();
        assert_eq!(bundle.app, "demo");
        assert_eq!(bundle.secrets["DB_PASSWORD"], "new");
        assert_eq!(bundle.secrets["PORT"], "5432");
    }

    #[test]
    fn test_empty_push_is_rejected() {
        let push = Push {
            app: "demo".to_string(),
            env_file: None,
            values: vec![],
        };
        assert!(matches!(push.bundle(), Err(PushError::Empty)));
    }
}
