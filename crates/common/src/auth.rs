//! Signed HTTP requests.
//!
//! Every authenticated call carries three headers. The signature covers
//! the method, the path, the timestamp header value and a SHA-256 of the
//! body, so neither the body nor the time can be swapped independently.

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use sha2::{Digest, Sha256};

use crate::clock::Clock;
use crate::crypto::VerifyingKey;
use crate::envelope::{freshness, Freshness, ReplayGuard};
use crate::error::{Classify, ErrorKind};
use crate::trust::{OperatorIdentity, TrustStore, TrustedKey};

pub const FINGERPRINT_HEADER: &str = "x-berth-fingerprint";
pub const TIMESTAMP_HEADER: &str = "x-berth-timestamp";
pub const SIGNATURE_HEADER: &str = "x-berth-signature";

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("missing {0} header")]
    MissingHeader(&'static str),
    #[error("bad timestamp header: {0}")]
    BadTimestamp(String),
    #[error("caller {0} is not a trusted identity")]
    UnknownCaller(String),
    #[error("request signature is invalid")]
    BadSignature,
    #[error("request is {}s old", .0.num_seconds())]
    Expired(Duration),
    #[error("request is dated {}s in the future", .0.num_seconds())]
    FromFuture(Duration),
    #[error("request was already received")]
    Replayed,
}

impl Classify for AuthError {
    fn kind(&self) -> ErrorKind {
        match self {
            AuthError::MissingHeader(_) | AuthError::BadTimestamp(_) => ErrorKind::InvalidInput,
            AuthError::UnknownCaller(_) | AuthError::BadSignature => ErrorKind::AuthFailure,
            AuthError::Expired(_) | AuthError::FromFuture(_) | AuthError::Replayed => {
                ErrorKind::ReplayDetected
            }
        }
    }
}

/// The three authentication headers of one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestSignature {
    pub fingerprint: String,
    /// Exactly as sent; the signature covers this string
    pub timestamp: String,
    pub signature: String,
}

impl RequestSignature {
    pub fn headers(&self) -> [(&'static str, &str); 3] {
        [
            (FINGERPRINT_HEADER, self.fingerprint.as_str()),
            (TIMESTAMP_HEADER, self.timestamp.as_str()),
            (SIGNATURE_HEADER, self.signature.as_str()),
        ]
    }

    /// Read the headers through `get`, which looks one up by name
    pub fn from_headers<'a, F>(get: F) -> Result<Self, AuthError>
    where
        F: Fn(&str) -> Option<&'a str>,
    {
        let header = |name: &'static str| {
            get(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .ok_or(AuthError::MissingHeader(name))
        };
        Ok(Self {
            fingerprint: header(FINGERPRINT_HEADER)?,
            timestamp: header(TIMESTAMP_HEADER)?,
            signature: header(SIGNATURE_HEADER)?,
        })
    }
}

/// Bytes a request signature covers
pub fn canonical_request(method: &str, path: &str, timestamp: &str, body: &[u8]) -> Vec<u8> {
    format!(
        "{}\n{}\n{}\n{}",
        method.to_ascii_uppercase(),
        path,
        timestamp,
        hex::encode(Sha256::digest(body))
    )
    .into_bytes()
}

pub fn sign_request(
    identity: &OperatorIdentity,
    method: &str,
    path: &str,
    body: &[u8],
    now: DateTime<Utc>,
) -> RequestSignature {
    let timestamp = now.to_rfc3339_opts(SecondsFormat::Millis, true);
    let signature = identity
        .signing()
        .sign_base64(&canonical_request(method, path, &timestamp, body));
    RequestSignature {
        fingerprint: identity.fingerprint(),
        timestamp,
        signature,
    }
}

/// Authenticate a request. Returns the trusted caller; role checks are
/// left to the caller.
pub fn verify_request(
    request: &RequestSignature,
    method: &str,
    path: &str,
    body: &[u8],
    trust: &TrustStore,
    clock: &dyn Clock,
    guard: &ReplayGuard,
) -> Result<TrustedKey, AuthError> {
    let caller = trust
        .get(&request.fingerprint)
        .ok_or_else(|| AuthError::UnknownCaller(request.fingerprint.clone()))?;
    verify_with_key(request, &caller.sign_public, method, path, body, clock, guard)?;
    Ok(caller)
}

/// Check a request against an explicit signing key, for callers that are
/// not (yet) in a trust store. Freshness and replay rules are the same as
/// for [`verify_request`].
pub fn verify_with_key(
    request: &RequestSignature,
    sign_public: &VerifyingKey,
    method: &str,
    path: &str,
    body: &[u8],
    clock: &dyn Clock,
    guard: &ReplayGuard,
) -> Result<(), AuthError> {
    let canonical = canonical_request(method, path, &request.timestamp, body);
    sign_public
        .verify_base64(&canonical, &request.signature)
        .map_err(|_| AuthError::BadSignature)?;

    let timestamp = DateTime::parse_from_rfc3339(&request.timestamp)
        .map_err(|e| AuthError::BadTimestamp(e.to_string()))?
        .with_timezone(&Utc);
    let now = clock.now();
    match freshness(timestamp, now, guard.tolerance()) {
        Freshness::Fresh => {}
        Freshness::Stale(age) => return Err(AuthError::Expired(age)),
        Freshness::Future(ahead) => return Err(AuthError::FromFuture(ahead)),
    }
    if !guard.check_and_record(request.signature.as_bytes(), timestamp, now) {
        tracing::warn!(caller = %request.fingerprint, method, path, "replayed request");
        return Err(AuthError::Replayed);
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;
    use std::sync::Arc;

    use super::*;
    use crate::clock::ManualClock;
    use crate::trust::Role;

    fn setup() -> (ManualClock, TrustStore, OperatorIdentity, ReplayGuard) {
        let clock = ManualClock::default();
        let trust = TrustStore::in_memory(Arc::new(clock.clone()));
        let identity = OperatorIdentity::generate().unwrap();
        trust
            .add_identity(identity.add_identity_request(Role::Owner, None), None)
            .unwrap();
        (clock, trust, identity, ReplayGuard::default())
    }

    #[test]
    fn test_signed_request_verifies_once() {
        let (clock, trust, identity, guard) = setup();
        let body = br#"{"fingerprint":"abc"}"#;
        let sig = sign_request(&identity, "post", "/api/v0/identity/revoke", body, clock.now());

        let caller = verify_request(&sig, "POST", "/api/v0/identity/revoke", body, &trust, &clock, &guard).unwrap();
        assert_eq!(caller.fingerprint, identity.fingerprint());

        let err = verify_request(&sig, "POST", "/api/v0/identity/revoke", body, &trust, &clock, &guard).unwrap_err();
        assert!(matches!(err, AuthError::Replayed));
    }

    #[test]
    fn test_altered_request_rejected() {
        let (clock, trust, identity, guard) = setup();
        let sig = sign_request(&identity, "POST", "/api/v0/envelope", b"one", clock.now());

        for (method, path, body) in [
            ("POST", "/api/v0/envelope", &b"two"[..]),
            ("POST", "/api/v0/identity/add", &b"one"[..]),
            ("PUT", "/api/v0/envelope", &b"one"[..]),
        ] {
            let err = verify_request(&sig, method, path, body, &trust, &clock, &guard).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::AuthFailure);
        }

        let mut shifted = sig.clone();
        shifted.timestamp = (clock.now() + Duration::seconds(1)).to_rfc3339_opts(SecondsFormat::Millis, true);
        assert!(matches!(
            verify_request(&shifted, "POST", "/api/v0/envelope", b"one", &trust, &clock, &guard),
            Err(AuthError::BadSignature)
        ));
    }

    #[test]
    fn test_stale_request_rejected() {
        let (clock, trust, identity, guard) = setup();
        let sig = sign_request(&identity, "GET", "/api/v0/audit", b"", clock.now());
        clock.advance(Duration::minutes(2));
        let err = verify_request(&sig, "GET", "/api/v0/audit", b"", &trust, &clock, &guard).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ReplayDetected);
    }

    #[test]
    fn test_header_roundtrip() {
        let (clock, _, identity, _) = setup();
        let sig = sign_request(&identity, "GET", "/", b"", clock.now());
        let map: HashMap<&str, &str> = sig.headers().into_iter().collect();
        let parsed = RequestSignature::from_headers(|name| map.get(name).copied()).unwrap();
        assert_eq!(parsed, sig);

        let err = RequestSignature::from_headers(|_| None).unwrap_err();
        assert!(matches!(err, AuthError::MissingHeader(FINGERPRINT_HEADER)));
    }

    #[test]
    fn test_self_signed_request() {
        let clock = ManualClock::default();
        let guard = ReplayGuard::default();
        let newcomer = OperatorIdentity::generate().unwrap();
        let body = b"{}";
        let sig = sign_request(&newcomer, "POST", "/api/v0/identity/add", body, clock.now());

        verify_with_key(&sig, &newcomer.sign_public(), "POST", "/api/v0/identity/add", body, &clock, &guard)
            .unwrap();

        let other = OperatorIdentity::generate().unwrap();
        let again = sign_request(&newcomer, "POST", "/api/v0/identity/add", body, clock.now());
        assert!(matches!(
            verify_with_key(&again, &other.sign_public(), "POST", "/api/v0/identity/add", body, &clock, &guard),
            Err(AuthError::BadSignature)
        ));
    }
}
