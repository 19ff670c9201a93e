//! Extractors for signed api requests.
//!
//! [`SignedRequest`] reads the authentication headers and the raw body
//! without judging the signature; a request without usable headers is
//! refused and audited there. [`Authenticated`] additionally checks the
//! signature against the trust store and records refusals in the audit log.

use axum::async_trait;
use axum::body::Bytes;
use axum::extract::rejection::BytesRejection;
use axum::extract::{FromRequest, OriginalUri, Request};
use axum::response::{IntoResponse, Response};
use common::audit::AuditEvent;
use common::auth::{
    verify_request, verify_with_key, AuthError, RequestSignature, FINGERPRINT_HEADER,
};
use common::crypto::VerifyingKey;
use common::error::{Classify, ErrorKind};
use common::trust::TrustedKey;
use serde::de::DeserializeOwned;

use crate::http_server::handlers::error_response;
use crate::ServiceState;

const AUTHENTICATE_ACTION: &str = "authenticate";

/// A request with its authentication headers, not yet verified
#[derive(Debug)]
pub struct SignedRequest {
    pub signature: RequestSignature,
    pub method: String,
    /// Full path as sent, before any router nesting
    pub path: String,
    pub body: Bytes,
}

impl SignedRequest {
    /// Verify against the daemon's trust store
    pub fn verify(&self, state: &ServiceState) -> Result<TrustedKey, AuthError> {
        verify_request(
            &self.signature,
            &self.method,
            &self.path,
            &self.body,
            state.trust(),
            state.clock(),
            state.guard(),
        )
    }

    /// Verify against a key presented in the request itself
    pub fn verify_with(&self, sign_public: &VerifyingKey, state: &ServiceState) -> Result<(), AuthError> {
        verify_with_key(
            &self.signature,
            sign_public,
            &self.method,
            &self.path,
            &self.body,
            state.clock(),
            state.guard(),
        )
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    /// Audit a refused request
    pub fn deny<E: Classify + std::fmt::Display>(&self, state: &ServiceState, action: &str, error: &E) {
        state.record(
            AuditEvent::denied(action, error)
                .actor(self.signature.fingerprint.clone())
                .target(format!("{} {}", self.method, self.path)),
        );
    }
}

#[async_trait]
impl FromRequest<ServiceState> for SignedRequest {
    type Rejection = RequestRejection;

    async fn from_request(req: Request, state: &ServiceState) -> Result<Self, Self::Rejection> {
        let path = req
            .extensions()
            .get::<OriginalUri>()
            .map(|uri| uri.0.path().to_string())
            .unwrap_or_else(|| req.uri().path().to_string());
        let method = req.method().as_str().to_string();
        let headers = req.headers();
        let signature = match RequestSignature::from_headers(|name| {
            headers.get(name).and_then(|value| value.to_str().ok())
        }) {
            Ok(signature) => signature,
            Err(e) => {
                let rejection = RequestRejection::from(e);
                let mut event = AuditEvent::denied(AUTHENTICATE_ACTION, &rejection)
                    .target(format!("{} {}", method, path));
                if let Some(claimed) = headers
                    .get(FINGERPRINT_HEADER)
                    .and_then(|value| value.to_str().ok())
                {
                    event = event.actor(claimed);
                }
                state.record(event);
                return Err(rejection);
            }
        };
        let body = Bytes::from_request(req, state).await?;

        Ok(Self {
            signature,
            method,
            path,
            body,
        })
    }
}

/// A request from a trusted identity
#[derive(Debug)]
pub struct Authenticated {
    pub caller: TrustedKey,
    pub request: SignedRequest,
}

impl Authenticated {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        self.request.json()
    }

    pub fn deny<E: Classify + std::fmt::Display>(&self, state: &ServiceState, action: &str, error: &E) {
        self.request.deny(state, action, error)
    }
}

#[async_trait]
impl FromRequest<ServiceState> for Authenticated {
    type Rejection = RequestRejection;

    async fn from_request(req: Request, state: &ServiceState) -> Result<Self, Self::Rejection> {
        let request = SignedRequest::from_request(req, state).await?;
        match request.verify(state) {
            Ok(caller) => Ok(Self { caller, request }),
            Err(e) => {
                request.deny(state, AUTHENTICATE_ACTION, &e);
                Err(e.into())
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RequestRejection {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("unreadable request body: {0}")]
    Body(#[from] BytesRejection),
}

impl Classify for RequestRejection {
    fn kind(&self) -> ErrorKind {
        match self {
            // an unsigned request is unauthenticated, not malformed
            RequestRejection::Auth(AuthError::MissingHeader(_)) => ErrorKind::AuthFailure,
            RequestRejection::Auth(e) => e.kind(),
            RequestRejection::Body(_) => ErrorKind::InvalidInput,
        }
    }
}

impl IntoResponse for RequestRejection {
    fn into_response(self) -> Response {
        error_response(&self)
    }
}
