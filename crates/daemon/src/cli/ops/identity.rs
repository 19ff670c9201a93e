use clap::{Args, Subcommand};

use crate::cli::op::{Op, OpContext};
use berth_daemon::http_server::api::client::ApiError;
use berth_daemon::http_server::api::v0::identity::{RevokeRequest, RoleRequest};
use berth_daemon::state::StateError;
use common::crypto::{AgreementPublic, KeyError, VerifyingKey};
use common::trust::{AddIdentityRequest, Role, TrustedKey};

crate::command_enum! {
    (Show, Show),
    (Register, Register),
    (Add, Add),
    (Revoke, RevokeRequest),
    (Role, RoleRequest),
}

pub type IdentityCommand = Command;

/// Manage operator identities trusted by the daemon
#[derive(Args, Debug, Clone)]
pub struct Identity {
    #[command(subcommand)]
    pub command: IdentityCommand,
}

#[async_trait::async_trait]
impl Op for Identity {
    type Error = OpError;
    type Output = OpOutput;

    async fn execute(&self, ctx: &OpContext) -> Result<Self::Output, Self::Error> {
        self.command.execute(ctx).await
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IdentityOpError {
    #[error("API error: {0}")]
    Api(#[from] ApiError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error("invalid public key: {0}")]
    Key(#[from] KeyError),
}

fn describe(key: &TrustedKey) -> String {
    let mut line = format!("{} {} (added by {})", key.fingerprint, key.role, key.added_by);
    if let Some(email) = &key.email {
        line.push_str(&format!(" <{}>", email));
    }
    line
}

/// Print this operator's public keys, as `identity add` on another
/// machine expects them
#[derive(Args, Debug, Clone)]
pub struct Show;

#[async_trait::async_trait]
impl Op for Show {
    type Error = IdentityOpError;
    type Output = String;

    async fn execute(&self, ctx: &OpContext) -> Result<Self::Output, Self::Error> {
        let identity = ctx.identity().await?;
        Ok(format!(
            "fingerprint: {}\npublic key:  {}\nsign public: {}",
            identity.fingerprint(),
            identity.public_key().to_base64(),
            identity.sign_public().to_base64()
        ))
    }
}

/// Register this operator with the daemon. Works unauthenticated only
/// while the daemon has no identities, and the first one becomes owner.
#[derive(Args, Debug, Clone)]
pub struct Register {
    /// Role to ask for; the first registration is always owner
    #[arg(long, default_value = "owner")]
    pub role: Role,

    #[arg(long)]
    pub email: Option<String>,
}

#[async_trait::async_trait]
impl Op for Register {
    type Error = IdentityOpError;
    type Output = String;

    async fn execute(&self, ctx: &OpContext) -> Result<Self::Output, Self::Error> {
        let identity = ctx.identity().await?;
        let request = identity.add_identity_request(self.role, self.email.clone());

        let mut client = ctx.client.clone();
        let added = client.call_signed(request, &identity).await?;
        Ok(format!("registered {}", describe(&added)))
    }
}

/// Trust another operator's keys (admin)
#[derive(Args, Debug, Clone)]
pub struct Add {
    /// Base64 X25519 public key
    #[arg(long)]
    pub public_key: String,

    /// Base64 Ed25519 verifying key
    #[arg(long)]
    pub sign_public: String,

    #[arg(long)]
    pub role: Role,

    #[arg(long)]
    pub email: Option<String>,

    /// Fingerprint confirmed out of band; rejected if the key does not hash to it
    #[arg(long)]
    pub fingerprint: Option<String>,
}

impl Add {
    fn request(&self) -> Result<AddIdentityRequest, KeyError> {
        Ok(AddIdentityRequest {
            public_key: AgreementPublic::from_base64(self.public_key.trim())?,
            sign_public: VerifyingKey::from_base64(self.sign_public.trim())?,
            role: self.role,
            email: self.email.clone(),
            fingerprint: self.fingerprint.clone(),
        })
    }
}

#[async_trait::async_trait]
impl Op for Add {
    type Error = IdentityOpError;
    type Output = String;

    async fn execute(&self, ctx: &OpContext) -> Result<Self::Output, Self::Error> {
        let request = self.request()?;
        let identity = ctx.identity().await?;

        let mut client = ctx.client.clone();
        let added = client.call_signed(request, &identity).await?;
        Ok(format!("added {}", describe(&added)))
    }
}

#[async_trait::async_trait]
impl Op for RevokeRequest {
    type Error = IdentityOpError;
    type Output = String;

    async fn execute(&self, ctx: &OpContext) -> Result<Self::Output, Self::Error> {
        let identity = ctx.identity().await?;

        let mut client = ctx.client.clone();
        let revoked = client.call_signed(self.clone(), &identity).await?;
        Ok(format!("revoked {} ({})", revoked.fingerprint, revoked.role))
    }
}

#[async_trait::async_trait]
impl Op for RoleRequest {
    type Error = IdentityOpError;
    type Output = String;

    async fn execute(&self, ctx: &OpContext) -> Result<Self::Output, Self::Error> {
        let identity = ctx.identity().await?;

        let mut client = ctx.client.clone();
        let changed = client.call_signed(self.clone(), &identity).await?;
        Ok(format!("changed {}", describe(&changed)))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use common::trust::OperatorIdentity;

    #[test]
    fn test_add_parses_shown_keys() {
        let other = OperatorIdentity::generate().unwrap();
        let add = Add {
            public_key: other.public_key().to_base64(),
            sign_public: format!("{}\n", other.sign_public().to_base64()),
            role: Role::Deployer,
            email: None,
            fingerprint: Some(other.fingerprint()),
        };
        let request = add.request().unwrap();
        assert_eq!(request.public_key.fingerprint(), other.fingerprint());
        assert_eq!(request.role, Role::Deployer);
    }

    #[test]
    fn test_add_rejects_garbage() {
        let add = Add {
            public_key: "not base64!".to_string(),
            sign_public: String::new(),
            role: Role::Reader,
            email: None,
            fingerprint: None,
        };
        assert!(add.request().is_err());
    }
}
