use axum::extract::{Json, State};
use axum::response::{IntoResponse, Response};
use common::audit::{AuditEvent, Outcome};
use common::daemon_keys::{DaemonKeyError, KeyQueryResponse};
use common::error::{Classify, ErrorKind};
use common::trust::{Operation, TrustError};
use reqwest::{Client, RequestBuilder, Url};
use serde::{Deserialize, Serialize};

use crate::http_server::api::client::{ApiError, ApiRequest};
use crate::http_server::extract::Authenticated;
use crate::http_server::handlers::error_response;
use crate::ServiceState;

/// Unauthenticated query for the daemon's current and retained public keys
#[derive(Debug, Clone, Copy, Default)]
pub struct KeysRequest;

#[tracing::instrument(skip(state))]
pub async fn handler(State(state): State<ServiceState>) -> Json<KeyQueryResponse> {
    Json(state.keys().public_info())
}

impl ApiRequest for KeysRequest {
    type Response = KeyQueryResponse;

    fn build_request(self, base_url: &Url, client: &Client) -> Result<RequestBuilder, ApiError> {
        let full_url = base_url.join("/api/v0/keys")?;
        Ok(client.get(full_url))
    }
}

/// Rotate the daemon key now instead of waiting for the schedule
#[derive(Debug, Clone, Copy, Default)]
pub struct RotateRequest;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotateResponse {
    pub key_id: String,
    pub fingerprint: String,
    /// Key ids still accepted for decryption, newest first
    pub retained: Vec<String>,
}

pub async fn rotate_handler(
    State(state): State<ServiceState>,
    auth: Authenticated,
) -> Result<impl IntoResponse, RotateError> {
    let action = Operation::RotateKeys.as_str();
    if let Err(e) = state
        .trust()
        .authorize(&auth.caller.fingerprint, Operation::RotateKeys)
    {
        auth.deny(&state, action, &e);
        return Err(e.into());
    }

    let pair = match state.keys().rotate() {
        Ok(pair) => pair,
        Err(e) => {
            state.record(
                AuditEvent::new(action, Outcome::Failure)
                    .actor(auth.caller.fingerprint.clone())
                    .detail(e.to_string()),
            );
            return Err(e.into());
        }
    };
    state.record(
        AuditEvent::new(action, Outcome::Success)
            .actor(auth.caller.fingerprint.clone())
            .target(pair.key_id()),
    );

    let retained = state
        .keys()
        .key_ids()
        .into_iter()
        .filter(|id| id.as_str() != pair.key_id())
        .collect();
    Ok(Json(RotateResponse {
        key_id: pair.key_id().to_string(),
        fingerprint: pair.fingerprint(),
        retained,
    }))
}

impl ApiRequest for RotateRequest {
    type Response = RotateResponse;

    fn build_request(self, base_url: &Url, client: &Client) -> Result<RequestBuilder, ApiError> {
        let full_url = base_url.join("/api/v0/keys/rotate")?;
        Ok(client.post(full_url))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RotateError {
    #[error(transparent)]
    Trust(#[from] TrustError),
    #[error("rotation failed: {0}")]
    Keys(#[from] DaemonKeyError),
}

impl Classify for RotateError {
    fn kind(&self) -> ErrorKind {
        match self {
            RotateError::Trust(e) => e.kind(),
            RotateError::Keys(e) => e.kind(),
        }
    }
}

impl IntoResponse for RotateError {
    fn into_response(self) -> Response {
        error_response(&self)
    }
}
