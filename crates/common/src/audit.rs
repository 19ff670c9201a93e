//! Append-only, signed audit log.
//!
//! One JSON object per line. Each entry is signed by the daemon key that was
//! current when it was written, and fsynced before `append` returns. Entries
//! stay verifiable after that key is evicted. There
//! is no API to update or remove an entry.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::daemon_keys::{DaemonKeyError, DaemonKeyManager};
use crate::error::{Classify, ErrorKind};
use crate::fs::ensure_private_dir;

#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("audit log io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("audit entry is malformed: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("audit entry {0} has an invalid signature")]
    BadSignature(u64),
    #[error(transparent)]
    Key(#[from] DaemonKeyError),
}

impl Classify for AuditError {
    fn kind(&self) -> ErrorKind {
        match self {
            AuditError::Io(_) | AuditError::Serde(_) => ErrorKind::StorageFailure,
            AuditError::BadSignature(_) => ErrorKind::AuthFailure,
            AuditError::Key(e) => e.kind(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Failure,
    /// Refused for authentication, authorization or replay reasons
    Denied,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub action: String,
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl AuditEvent {
    pub fn new(action: impl Into<String>, outcome: Outcome) -> Self {
        Self {
            action: action.into(),
            outcome,
            actor: None,
            target: None,
            detail: None,
        }
    }

    pub fn actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Event for a rejected request, classified by `error`
    pub fn denied<E: Classify + std::fmt::Display>(action: impl Into<String>, error: &E) -> Self {
        Self::new(action, Outcome::Denied).detail(format!("{}: {}", error.kind(), error))
    }
}

/// The signed part of an entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub key_id: String,
    pub event: AuditEvent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    #[serde(flatten)]
    pub record: AuditRecord,
    /// base64 Ed25519 signature over the JSON of `record`
    pub signature: String,
}

/// Check an entry against the daemon key that signed it, including keys
/// evicted since
pub fn verify(entry: &AuditEntry, keys: &DaemonKeyManager) -> Result<(), AuditError> {
    let sign_public = keys.verifying_key(&entry.record.key_id)?;
    let bytes = serde_json::to_vec(&entry.record)?;
    sign_public
        .verify_base64(&bytes, &entry.signature)
        .map_err(|_| AuditError::BadSignature(entry.record.seq))
}

struct Writer {
    file: File,
    next_seq: u64,
}

pub struct AuditLog {
    path: PathBuf,
    keys: Arc<DaemonKeyManager>,
    clock: Arc<dyn Clock>,
    writer: Mutex<Writer>,
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog").field("path", &self.path).finish()
    }
}

impl AuditLog {
    pub fn open(path: impl AsRef<Path>, keys: Arc<DaemonKeyManager>, clock: Arc<dyn Clock>) -> Result<Self, AuditError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            ensure_private_dir(parent)?;
        }

        let next_seq = if path.exists() {
            let reader = BufReader::new(File::open(&path)?);
            let mut last = None;
            for line in reader.lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let entry: AuditEntry = serde_json::from_str(&line)?;
                last = Some(entry.record.seq);
            }
            last.map(|seq| seq + 1).unwrap_or(0)
        } else {
            0
        };

        let mut options = OpenOptions::new();
        options.create(true).append(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let file = options.open(&path)?;

        tracing::debug!(path = %path.display(), next_seq, "audit log opened");
        Ok(Self {
            path,
            keys,
            clock,
            writer: Mutex::new(Writer { file, next_seq }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sign and durably append `event`
    pub fn append(&self, event: AuditEvent) -> Result<AuditEntry, AuditError> {
        let mut writer = self.writer.lock();
        let pair = self.keys.current();
        let record = AuditRecord {
            seq: writer.next_seq,
            timestamp: self.clock.now(),
            key_id: pair.key_id().to_string(),
            event,
        };
        let signature = pair.signing().sign_base64(&serde_json::to_vec(&record)?);
        let entry = AuditEntry { record, signature };

        let mut line = serde_json::to_vec(&entry)?;
        line.push(b'\n');
        writer.file.write_all(&line)?;
        writer.file.sync_data()?;
        writer.next_seq += 1;

        if entry.record.event.outcome == Outcome::Denied {
            tracing::warn!(
                seq = entry.record.seq,
                action = %entry.record.event.action,
                actor = entry.record.event.actor.as_deref().unwrap_or("-"),
                "audit: denied"
            );
        }
        Ok(entry)
    }

    /// Every entry, oldest first
    pub fn entries(&self) -> Result<Vec<AuditEntry>, AuditError> {
        // hold the writer so a half-written line is never read
        let _writer = self.writer.lock();
        let reader = BufReader::new(File::open(&self.path)?);
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if !line.trim().is_empty() {
                entries.push(serde_json::from_str(&line)?);
            }
        }
        Ok(entries)
    }

    pub fn verify(&self, entry: &AuditEntry) -> Result<(), AuditError> {
        verify(entry, &self.keys)
    }
}
