use axum::extract::{Json, State};
use axum::response::{IntoResponse, Response};
use common::audit::{AuditEvent, Outcome};
use common::crypto::fingerprints_match;
use common::envelope::{open, Envelope, EnvelopeError, SecretBundle};
use common::error::{Classify, ErrorKind};
use common::secrets::SecretStoreError;
use common::trust::{Operation, TrustError};
use reqwest::{Client, RequestBuilder, Url};
use serde::{Deserialize, Serialize};

use crate::http_server::api::client::{ApiError, ApiRequest};
use crate::http_server::extract::Authenticated;
use crate::http_server::handlers::error_response;
use crate::ServiceState;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushResponse {
    pub status: String,
    /// Daemon key the envelope was sealed to
    pub key_id: String,
    pub app: String,
    /// Store names written, `app/NAME`
    pub applied: Vec<String>,
}

/// Accept a sealed [`SecretBundle`] from a deployer and write it to the
/// secret store
pub async fn handler(
    State(state): State<ServiceState>,
    auth: Authenticated,
) -> Result<impl IntoResponse, PushError> {
    let action = Operation::PushSecrets.as_str();
    let result = push(&state, &auth);

    match &result {
        Ok(pushed) => state.record(
            AuditEvent::new(action, Outcome::Success)
                .actor(auth.caller.fingerprint.clone())
                .target(pushed.app.clone())
                .detail(format!(
                    "{} secrets via key {}",
                    pushed.applied.len(),
                    pushed.key_id
                )),
        ),
        Err(e) if e.kind().is_security_relevant() => auth.deny(&state, action, e),
        Err(e) => state.record(
            AuditEvent::new(action, Outcome::Failure)
                .actor(auth.caller.fingerprint.clone())
                .detail(e.to_string()),
        ),
    }

    result.map(Json)
}

fn push(state: &ServiceState, auth: &Authenticated) -> Result<PushResponse, PushError> {
    state
        .trust()
        .authorize(&auth.caller.fingerprint, Operation::PushSecrets)?;

    let envelope: Envelope = auth.json()?;
    let opened = open(
        &envelope,
        state.keys(),
        state.trust(),
        state.clock(),
        state.guard(),
    )?;

    // the request signer must be the envelope sender
    if !fingerprints_match(&opened.sender.fingerprint, &auth.caller.fingerprint) {
        return Err(PushError::SenderMismatch {
            caller: auth.caller.fingerprint.clone(),
            sender: opened.sender.fingerprint.clone(),
        });
    }

    let bundle = SecretBundle::from_bytes(&opened.plaintext)?;
    let applied = bundle.apply(state.secrets())?;
    tracing::info!(
        app = %bundle.app,
        count = applied.len(),
        key_id = %opened.recipient_key_id,
        "secret bundle applied"
    );

    Ok(PushResponse {
        status: "applied".to_string(),
        key_id: opened.recipient_key_id.clone(),
        app: bundle.app.clone(),
        applied,
    })
}

impl ApiRequest for Envelope {
    type Response = PushResponse;

    fn build_request(self, base_url: &Url, client: &Client) -> Result<RequestBuilder, ApiError> {
        let full_url = base_url.join("/api/v0/envelope")?;
        Ok(client.post(full_url).json(&self))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PushError {
    #[error(transparent)]
    Trust(#[from] TrustError),
    #[error("invalid envelope body: {0}")]
    Body(#[from] serde_json::Error),
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    #[error("envelope from {sender} was submitted by {caller}")]
    SenderMismatch { caller: String, sender: String },
    #[error(transparent)]
    Secrets(#[from] SecretStoreError),
}

impl Classify for PushError {
    fn kind(&self) -> ErrorKind {
        match self {
            PushError::Trust(e) => e.kind(),
            PushError::Body(_) => ErrorKind::InvalidInput,
            PushError::Envelope(e) => e.kind(),
            PushError::SenderMismatch { .. } => ErrorKind::AuthFailure,
            PushError::Secrets(e) => e.kind(),
        }
    }
}

impl IntoResponse for PushError {
    fn into_response(self) -> Response {
        error_response(&self)
    }
}
