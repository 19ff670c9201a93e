use std::path::PathBuf;

use clap::{Args, Subcommand};

use crate::cli::op::{Op, OpContext};
use berth_daemon::state::StateError;
use common::file_envelope::{decrypt_file, encrypt_file, FileEnvelopeError};
use common::master_key::{MasterKeyError, Purpose};

crate::command_enum! {
    (Encrypt, Encrypt),
    (Decrypt, Decrypt),
}

pub type FileCommand = Command;

/// Encrypt or decrypt whole files (`.env`, configuration) with this
/// machine's file-encryption key
#[derive(Args, Debug, Clone)]
pub struct File {
    #[command(subcommand)]
    pub command: FileCommand,
}

#[async_trait::async_trait]
impl Op for File {
    type Error = OpError;
    type Output = OpOutput;

    async fn execute(&self, ctx: &OpContext) -> Result<Self::Output, Self::Error> {
        self.command.execute(ctx).await
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FileError {
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    MasterKey(#[from] MasterKeyError),
    #[error(transparent)]
    Envelope(#[from] FileEnvelopeError),
}

/// Write `<path>.enc` next to the file
#[derive(Args, Debug, Clone)]
pub struct Encrypt {
    pub path: PathBuf,
}

#[async_trait::async_trait]
impl Op for Encrypt {
    type Error = FileError;
    type Output = String;

    async fn execute(&self, ctx: &OpContext) -> Result<Self::Output, Self::Error> {
        let state = ctx.state()?;
        let written = state
            .master_keys()
            .with_derived_key(&state.app_identity(), Purpose::FileEncryption, |key| {
                encrypt_file(&self.path, key)
            })
            .await??;
        Ok(format!("wrote {}", written.display()))
    }
}

/// Restore the plaintext next to a `.enc` file
#[derive(Args, Debug, Clone)]
pub struct Decrypt {
    pub path: PathBuf,
}

#[async_trait::async_trait]
impl Op for Decrypt {
    type Error = FileError;
    type Output = String;

    async fn execute(&self, ctx: &OpContext) -> Result<Self::Output, Self::Error> {
        let state = ctx.state()?;
        let written = state
            .master_keys()
            .with_derived_key(&state.app_identity(), Purpose::FileEncryption, |key| {
                decrypt_file(&self.path, key)
            })
            .await??;
        Ok(format!("wrote {}", written.display()))
    }
}
