//! Signed, encrypted messages from an operator to a daemon.
//!
//! Sealing generates an ephemeral X25519 key, agrees with the daemon's
//! current agreement key and encrypts the plaintext under the result. The
//! serialized payload is signed with the operator's long-term Ed25519 key.
//!
//! Opening trusts nothing in the message itself: the signing key comes from
//! the [`TrustStore`], the recipient key from the [`DaemonKeyManager`].
//! Every check must pass or the whole envelope is rejected.

mod replay;

use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

pub use replay::{freshness, Freshness, ReplayGuard, DEFAULT_TOLERANCE_SECS};

use crate::clock::Clock;
use crate::crypto::{AgreementPublic, AgreementSecret, KeyError, SecretError};
use crate::daemon_keys::{DaemonKeyError, DaemonKeyManager};
use crate::error::{Classify, ErrorKind};
use crate::secrets::{validate_name, SecretStore, SecretStoreError};
use crate::trust::{OperatorIdentity, TrustStore, TrustedKey};

pub const ENVELOPE_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("malformed envelope: {0}")]
    Malformed(String),
    #[error("unsupported envelope version {0}")]
    UnsupportedVersion(u32),
    #[error("sender {0} is not trusted")]
    UnknownSender(String),
    #[error("envelope signature is invalid")]
    BadSignature,
    #[error("envelope is {}s old", .0.num_seconds())]
    Expired(Duration),
    #[error("envelope is dated {}s in the future", .0.num_seconds())]
    FromFuture(Duration),
    #[error("envelope was already received")]
    Replayed,
    #[error(transparent)]
    Recipient(#[from] DaemonKeyError),
    #[error("envelope failed to decrypt")]
    Decrypt,
    #[error("key error: {0}")]
    Key(#[from] KeyError),
    #[error("secret error: {0}")]
    Secret(#[from] SecretError),
}

impl Classify for EnvelopeError {
    fn kind(&self) -> ErrorKind {
        match self {
            EnvelopeError::Malformed(_) | EnvelopeError::UnsupportedVersion(_) => {
                ErrorKind::InvalidInput
            }
            EnvelopeError::UnknownSender(_) | EnvelopeError::BadSignature | EnvelopeError::Decrypt => {
                ErrorKind::AuthFailure
            }
            EnvelopeError::Expired(_) | EnvelopeError::FromFuture(_) | EnvelopeError::Replayed => {
                ErrorKind::ReplayDetected
            }
            EnvelopeError::Recipient(e) => e.kind(),
            EnvelopeError::Key(e) => e.kind(),
            EnvelopeError::Secret(e) => e.kind(),
        }
    }
}

/// The signed part of an envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopePayload {
    pub version: u32,
    pub sender_fingerprint: String,
    pub recipient_key_id: String,
    pub ephemeral_public: AgreementPublic,
    /// base64 of nonce ‖ ciphertext ‖ tag
    pub ciphertext: String,
    pub timestamp: DateTime<Utc>,
}

/// What goes over the wire: the serialized payload and a signature over
/// exactly those bytes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// base64 of the JSON payload
    pub payload: String,
    /// base64 Ed25519 signature over the decoded payload bytes
    pub signature: String,
}

/// A verified, decrypted envelope
pub struct Opened {
    pub sender: TrustedKey,
    pub recipient_key_id: String,
    pub timestamp: DateTime<Utc>,
    pub plaintext: Zeroizing<Vec<u8>>,
}

impl std::fmt::Debug for Opened {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Opened")
            .field("sender", &self.sender.fingerprint)
            .field("recipient_key_id", &self.recipient_key_id)
            .field("timestamp", &self.timestamp)
            .finish_non_exhaustive()
    }
}

fn transcript(ephemeral: &AgreementPublic, recipient: &AgreementPublic, key_id: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(64 + key_id.len());
    out.extend_from_slice(ephemeral.as_bytes());
    out.extend_from_slice(recipient.as_bytes());
    out.extend_from_slice(key_id.as_bytes());
    out
}

/// Seal `plaintext` to the daemon key `recipient_key_id`
pub fn seal(
    sender: &OperatorIdentity,
    recipient_key_id: &str,
    recipient_public: &AgreementPublic,
    plaintext: &[u8],
    now: DateTime<Utc>,
) -> Result<Envelope, EnvelopeError> {
    let ephemeral = AgreementSecret::generate()?;
    let ephemeral_public = ephemeral.public();
    let key = ephemeral.agree(
        recipient_public,
        &transcript(&ephemeral_public, recipient_public, recipient_key_id),
    )?;
    drop(ephemeral);

    let payload = EnvelopePayload {
        version: ENVELOPE_VERSION,
        sender_fingerprint: sender.fingerprint(),
        recipient_key_id: recipient_key_id.to_string(),
        ephemeral_public,
        ciphertext: STANDARD.encode(key.encrypt(plaintext)?),
        timestamp: now,
    };
    let bytes = serde_json::to_vec(&payload).map_err(|e| EnvelopeError::Malformed(e.to_string()))?;

    Ok(Envelope {
        signature: sender.signing().sign_base64(&bytes),
        payload: STANDARD.encode(&bytes),
    })
}

/// Verify and decrypt an envelope addressed to one of `keys`
pub fn open(
    envelope: &Envelope,
    keys: &DaemonKeyManager,
    trust: &TrustStore,
    clock: &dyn Clock,
    guard: &ReplayGuard,
) -> Result<Opened, EnvelopeError> {
    let bytes = STANDARD
        .decode(envelope.payload.trim())
        .map_err(|e| EnvelopeError::Malformed(e.to_string()))?;
    let payload: EnvelopePayload =
        serde_json::from_slice(&bytes).map_err(|e| EnvelopeError::Malformed(e.to_string()))?;
    if payload.version != ENVELOPE_VERSION {
        return Err(EnvelopeError::UnsupportedVersion(payload.version));
    }

    let sender = trust
        .get(&payload.sender_fingerprint)
        .ok_or_else(|| EnvelopeError::UnknownSender(payload.sender_fingerprint.clone()))?;
    sender
        .sign_public
        .verify_base64(&bytes, &envelope.signature)
        .map_err(|_| EnvelopeError::BadSignature)?;

    let now = clock.now();
    match freshness(payload.timestamp, now, guard.tolerance()) {
        Freshness::Fresh => {}
        Freshness::Stale(age) => return Err(EnvelopeError::Expired(age)),
        Freshness::Future(ahead) => return Err(EnvelopeError::FromFuture(ahead)),
    }
    if !guard.check_and_record(&bytes, payload.timestamp, now) {
        tracing::warn!(sender = %sender.fingerprint, "replayed envelope");
        return Err(EnvelopeError::Replayed);
    }

    let pair = keys.require(&payload.recipient_key_id)?;
    let recipient_public = pair.public_key();
    let key = pair.agreement().agree(
        &payload.ephemeral_public,
        &transcript(&payload.ephemeral_public, &recipient_public, pair.key_id()),
    )?;
    let ciphertext = STANDARD
        .decode(payload.ciphertext.trim())
        .map_err(|e| EnvelopeError::Malformed(e.to_string()))?;
    let plaintext = key.decrypt(&ciphertext).map_err(|_| EnvelopeError::Decrypt)?;

    tracing::debug!(
        sender = %sender.fingerprint,
        key_id = %payload.recipient_key_id,
        "envelope opened"
    );
    Ok(Opened {
        sender,
        recipient_key_id: payload.recipient_key_id,
        timestamp: payload.timestamp,
        plaintext: Zeroizing::new(plaintext),
    })
}

/// Secrets for one application, as pushed by `berth push`
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct SecretBundle {
    pub app: String,
    pub secrets: BTreeMap<String, String>,
}

impl std::fmt::Debug for SecretBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretBundle")
            .field("app", &self.app)
            .field("secrets", &self.secrets.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Drop for SecretBundle {
    fn drop(&mut self) {
        use zeroize::Zeroize;
        for value in self.secrets.values_mut() {
            value.zeroize();
        }
    }
}

impl SecretBundle {
    pub fn new(app: impl Into<String>) -> Self {
        Self {
            app: app.into(),
            secrets: BTreeMap::new(),
        }
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.secrets.insert(name.into(), value.into());
        self
    }

    pub fn to_bytes(&self) -> Result<Zeroizing<Vec<u8>>, EnvelopeError> {
        serde_json::to_vec(self)
            .map(Zeroizing::new)
            .map_err(|e| EnvelopeError::Malformed(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        serde_json::from_slice(bytes).map_err(|e| EnvelopeError::Malformed(e.to_string()))
    }

    /// Store name for `secret` of this bundle's app
    pub fn store_name(&self, secret: &str) -> String {
        format!("{}/{}", self.app, secret)
    }

    /// Write every secret (encrypted) into `store`, creating or replacing.
    /// Returns the store names written. Nothing is written if any name is
    /// invalid.
    pub fn apply(&self, store: &SecretStore) -> Result<Vec<String>, SecretStoreError> {
        let names = self
            .secrets
            .keys()
            .map(|name| {
                let store_name = self.store_name(name);
                validate_name(&store_name).map(|()| store_name)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut written = Vec::with_capacity(names.len());
        for (store_name, value) in names.into_iter().zip(self.secrets.values()) {
            store.upsert(&store_name, value, true)?;
            written.push(store_name);
        }
        tracing::info!(app = %self.app, count = written.len(), "applied secret bundle");
        Ok(written)
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::*;
    use crate::clock::ManualClock;
    use crate::daemon_keys::KeyManagerOptions;
    use crate::trust::Role;

    struct Fixture {
        _dir: tempfile::TempDir,
        clock: ManualClock,
        keys: DaemonKeyManager,
        trust: TrustStore,
        operator: OperatorIdentity,
        guard: ReplayGuard,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::TempDir::new().unwrap();
        let clock = ManualClock::default();
        let keys = DaemonKeyManager::load_or_init(
            KeyManagerOptions::new(dir.path().join("keys.json")).retention(1),
            Arc::new(clock.clone()),
        )
        .unwrap();
        let trust = TrustStore::in_memory(Arc::new(clock.clone()));
        let operator = OperatorIdentity::generate().unwrap();
        trust
            .add_identity(operator.add_identity_request(Role::Owner, None), None)
            .unwrap();
        Fixture {
            _dir: dir,
            clock,
            keys,
            trust,
            operator,
            guard: ReplayGuard::default(),
        }
    }

    impl Fixture {
        fn seal(&self, plaintext: &[u8]) -> Envelope {
            let current = self.keys.current();
            seal(
                &self.operator,
                current.key_id(),
                &current.public_key(),
                plaintext,
                self.clock.now(),
            )
            .unwrap()
        }

        fn open(&self, envelope: &Envelope) -> Result<Opened, EnvelopeError> {
            open(envelope, &self.keys, &self.trust, &self.clock, &self.guard)
        }
    }

    #[test]
    fn test_seal_open() {
        let f = fixture();
        let envelope = f.seal(b"DB_PASSWORD=p@ss");
        let opened = f.open(&envelope).unwrap();
        assert_eq!(&opened.plaintext[..], b"DB_PASSWORD=p@ss");
        assert_eq!(opened.sender.fingerprint, f.operator.fingerprint());
    }

    #[test]
    fn test_untrusted_sender_rejected() {
        let f = fixture();
        let stranger = OperatorIdentity::generate().unwrap();
        let current = f.keys.current();
        let envelope = seal(&stranger, current.key_id(), &current.public_key(), b"x", f.clock.now()).unwrap();
        assert!(matches!(f.open(&envelope), Err(EnvelopeError::UnknownSender(_))));
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let f = fixture();
        let envelope = f.seal(b"secret");
        let mut bytes = STANDARD.decode(&envelope.payload).unwrap();
        let mut payload: EnvelopePayload = serde_json::from_slice(&bytes).unwrap();
        payload.timestamp += Duration::seconds(1);
        bytes = serde_json::to_vec(&payload).unwrap();
        let tampered = Envelope {
            payload: STANDARD.encode(bytes),
            signature: envelope.signature.clone(),
        };
        let err = f.open(&tampered).unwrap_err();
        assert!(matches!(err, EnvelopeError::BadSignature));
        assert_eq!(err.kind(), ErrorKind::AuthFailure);
    }

    #[test]
    fn test_stale_future_and_replayed() {
        let f = fixture();
        let envelope = f.seal(b"secret");
        f.clock.advance(Duration::seconds(31));
        let err = f.open(&envelope).unwrap_err();
        assert!(matches!(err, EnvelopeError::Expired(_)));
        assert_eq!(err.kind(), ErrorKind::ReplayDetected);

        let current = f.keys.current();
        let ahead = seal(
            &f.operator,
            current.key_id(),
            &current.public_key(),
            b"secret",
            f.clock.now() + Duration::minutes(5),
        )
        .unwrap();
        assert!(matches!(f.open(&ahead), Err(EnvelopeError::FromFuture(_))));

        let fresh = f.seal(b"secret");
        f.open(&fresh).unwrap();
        assert!(matches!(f.open(&fresh), Err(EnvelopeError::Replayed)));
    }

    #[test]
    fn test_retained_key_still_opens_evicted_does_not() {
        let f = fixture();
        let early = f.seal(b"before rotation");
        f.keys.rotate().unwrap();
        assert_eq!(&f.open(&early).unwrap().plaintext[..], b"before rotation");

        let old = f.seal(b"sealed to the new key");
        f.keys.rotate().unwrap();
        f.keys.rotate().unwrap();
        let err = f.open(&old).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::KeyEvicted);
    }

    #[test]
    fn test_bundle_apply() {
        let clock = Arc::new(ManualClock::default());
        let store = SecretStore::in_memory(crate::crypto::Secret::generate().unwrap(), clock);
        let bundle = SecretBundle::new("demo").with("DB_PASSWORD", "p@ss");
        let parsed = SecretBundle::from_bytes(&bundle.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed.apply(&store).unwrap(), vec!["demo/DB_PASSWORD".to_string()]);
        assert!(store.contains("demo/DB_PASSWORD"));
        assert!(!format!("{:?}", parsed).contains("p@ss"));
    }

    #[test]
    fn test_bundle_with_bad_name_writes_nothing() {
        let clock = Arc::new(ManualClock::default());
        let store = SecretStore::in_memory(crate::crypto::Secret::generate().unwrap(), clock);
        // BTreeMap order puts the valid name first
        let bundle = SecretBundle::new("demo")
            .with("API_KEY", "k")
            .with("bad name", "v");

        let err = bundle.apply(&store).unwrap_err();
        assert!(matches!(err, SecretStoreError::InvalidName(_)));
        assert!(!store.contains("demo/API_KEY"));
        assert!(store.list().is_empty());
    }
}
