use std::io::{self, BufRead, Write};

use clap::Args;

use berth_daemon::state::StateError;
use common::crypto::fingerprints_match;
use common::daemon_keys::PublicKeyInfo;
use common::trust::{bootstrap, BootstrapError, BootstrapOutcome, Confirm, Role, DEFAULT_DAEMON_ROLE};

/// Pin the daemon's key on first contact, or check it against the pin
#[derive(Args, Debug, Clone)]
pub struct Bootstrap {
    /// Accept the daemon if its fingerprint is exactly this, without prompting
    #[arg(long)]
    pub fingerprint: Option<String>,
    /// Role recorded with a new pin
    #[arg(long, default_value_t = DEFAULT_DAEMON_ROLE)]
    pub role: Role,
}

/// Asks on the terminal
struct Prompt;

impl Confirm for Prompt {
    fn confirm(&self, address: &str, fingerprint: &str, info: &PublicKeyInfo) -> bool {
        eprintln!("The daemon at {} is not known.", address);
        eprintln!("  key id:      {}", info.key_id);
        eprintln!("  fingerprint: {}", fingerprint);
        eprint!("Verify the fingerprint out of band. Trust this daemon? [y/N] ");
        let _ = io::stderr().flush();

        let mut answer = String::new();
        if io::stdin().lock().read_line(&mut answer).is_err() {
            return false;
        }
        is_yes(&answer)
    }
}

/// Accepts only an expected fingerprint
struct Expect<'a>(&'a str);

impl Confirm for Expect<'_> {
    fn confirm(&self, _address: &str, fingerprint: &str, _info: &PublicKeyInfo) -> bool {
        fingerprints_match(self.0, fingerprint)
    }
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

#[derive(Debug, thiserror::Error)]
pub enum BootstrapOpError {
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Bootstrap(#[from] BootstrapError),
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Bootstrap {
    type Error = BootstrapOpError;
    type Output = String;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let known = ctx.state()?.known_daemons()?;
        let address = ctx.address();

        let outcome = match &self.fingerprint {
            Some(expected) => {
                bootstrap(address, &ctx.client, &Expect(expected), self.role, &known).await?
            }
            None => bootstrap(address, &ctx.client, &Prompt, self.role, &known).await?,
        };

        Ok(describe(address, &outcome))
    }
}

pub fn describe(address: &str, outcome: &BootstrapOutcome) -> String {
    match outcome {
        BootstrapOutcome::AlreadyTrusted(pinned) => {
            format!("daemon {} already trusted ({})", address, pinned.fingerprint)
        }
        BootstrapOutcome::Rotated { previous, pinned } => format!(
            "daemon {} rotated from {} to {}, pin updated",
            address, previous, pinned.fingerprint
        ),
        BootstrapOutcome::Pinned(pinned) => {
            format!("pinned daemon {} at {}", address, pinned.fingerprint)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_is_yes() {
        assert!(is_yes("y\n"));
        assert!(is_yes(" YES "));
        assert!(!is_yes("\n"));
        assert!(!is_yes("nope"));
    }

    #[test]
    fn test_role_flag() {
        use clap::Parser;

        #[derive(Parser)]
        struct Cli {
            #[command(flatten)]
            bootstrap: Bootstrap,
        }

        let cli = Cli::try_parse_from(["berth"]).unwrap();
        assert_eq!(cli.bootstrap.role, Role::Reader);
        let cli = Cli::try_parse_from(["berth", "--role", "deployer"]).unwrap();
        assert_eq!(cli.bootstrap.role, Role::Deployer);
        assert!(Cli::try_parse_from(["berth", "--role", "root"]).is_err());
    }
}
