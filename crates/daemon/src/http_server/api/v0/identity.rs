use axum::extract::{Json, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use common::audit::{AuditEvent, Outcome};
use common::auth::AuthError;
use common::crypto::fingerprints_match;
use common::error::{Classify, ErrorKind};
use common::trust::{AddIdentityRequest, Operation, Role, TrustError, TrustedKey};
use reqwest::{Client, RequestBuilder, Url};
use serde::{Deserialize, Serialize};

use crate::http_server::api::client::{ApiError, ApiRequest};
use crate::http_server::extract::{Authenticated, SignedRequest};
use crate::http_server::handlers::error_response;
use crate::ServiceState;

pub fn router(state: ServiceState) -> Router<ServiceState> {
    Router::new()
        .route("/add", post(add_handler))
        .route("/revoke", post(revoke_handler))
        .route("/role", post(role_handler))
        .with_state(state)
}

/// Register an identity. While the daemon has no identities the request
/// must be signed by the key being registered, which becomes the owner.
/// After that the signer must be an admin or above.
pub async fn add_handler(
    State(state): State<ServiceState>,
    request: SignedRequest,
) -> Result<impl IntoResponse, IdentityError> {
    let action = Operation::AddIdentity.as_str();
    let result = add(&state, &request);

    match &result {
        Ok(added) => state.record(
            AuditEvent::new(action, Outcome::Success)
                .actor(added.added_by.clone())
                .target(added.fingerprint.clone())
                .detail(format!("role {}", added.role)),
        ),
        Err(e) if e.kind().is_security_relevant() => request.deny(&state, action, e),
        Err(e) => state.record(
            AuditEvent::new(action, Outcome::Failure)
                .actor(request.signature.fingerprint.clone())
                .detail(e.to_string()),
        ),
    }

    result.map(|added| (StatusCode::CREATED, Json(added)))
}

fn add(state: &ServiceState, request: &SignedRequest) -> Result<TrustedKey, IdentityError> {
    let body: AddIdentityRequest = request.json()?;

    if state.trust().is_empty() {
        let computed = body.public_key.fingerprint();
        if !fingerprints_match(&request.signature.fingerprint, &computed) {
            return Err(IdentityError::NotSelfSigned {
                signer: request.signature.fingerprint.clone(),
                computed,
            });
        }
        request.verify_with(&body.sign_public, state)?;
        return Ok(state.trust().add_identity(body, None)?);
    }

    let caller = request.verify(state)?;
    Ok(state.trust().add_identity(body, Some(&caller.fingerprint))?)
}

impl ApiRequest for AddIdentityRequest {
    type Response = TrustedKey;

    fn build_request(self, base_url: &Url, client: &Client) -> Result<RequestBuilder, ApiError> {
        let full_url = base_url.join("/api/v0/identity/add")?;
        Ok(client.post(full_url).json(&self))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, clap::Args)]
pub struct RevokeRequest {
    /// Fingerprint of the identity to revoke
    #[arg(long)]
    pub fingerprint: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevokeResponse {
    pub fingerprint: String,
    pub role: Role,
}

pub async fn revoke_handler(
    State(state): State<ServiceState>,
    auth: Authenticated,
) -> Result<impl IntoResponse, IdentityError> {
    let action = Operation::RevokeIdentity.as_str();
    let result = auth
        .json::<RevokeRequest>()
        .map_err(IdentityError::from)
        .and_then(|req| {
            Ok(state
                .trust()
                .revoke_identity(&req.fingerprint, &auth.caller.fingerprint)?)
        });

    match &result {
        Ok(revoked) => state.record(
            AuditEvent::new(action, Outcome::Success)
                .actor(auth.caller.fingerprint.clone())
                .target(revoked.fingerprint.clone())
                .detail(format!("role {}", revoked.role)),
        ),
        Err(e) if e.kind().is_security_relevant() => auth.deny(&state, action, e),
        Err(e) => state.record(
            AuditEvent::new(action, Outcome::Failure)
                .actor(auth.caller.fingerprint.clone())
                .detail(e.to_string()),
        ),
    }

    result.map(|revoked| {
        Json(RevokeResponse {
            fingerprint: revoked.fingerprint,
            role: revoked.role,
        })
    })
}

impl ApiRequest for RevokeRequest {
    type Response = RevokeResponse;

    fn build_request(self, base_url: &Url, client: &Client) -> Result<RequestBuilder, ApiError> {
        let full_url = base_url.join("/api/v0/identity/revoke")?;
        Ok(client.post(full_url).json(&self))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, clap::Args)]
pub struct RoleRequest {
    /// Fingerprint of the identity to change
    #[arg(long)]
    pub fingerprint: String,
    /// New role: reader, deployer, admin or owner
    #[arg(long)]
    pub role: Role,
}

pub async fn role_handler(
    State(state): State<ServiceState>,
    auth: Authenticated,
) -> Result<impl IntoResponse, IdentityError> {
    let action = Operation::ChangeRole.as_str();
    let result = auth
        .json::<RoleRequest>()
        .map_err(IdentityError::from)
        .and_then(|req| {
            Ok(state
                .trust()
                .change_role(&req.fingerprint, req.role, &auth.caller.fingerprint)?)
        });

    match &result {
        Ok(changed) => state.record(
            AuditEvent::new(action, Outcome::Success)
                .actor(auth.caller.fingerprint.clone())
                .target(changed.fingerprint.clone())
                .detail(format!("role {}", changed.role)),
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

impl ApiRequest for RoleRequest {
    type Response = TrustedKey;

    fn build_request(self, base_url: &Url, client: &Client) -> Result<RequestBuilder, ApiError> {
        let full_url = base_url.join("/api/v0/identity/role")?;
        Ok(client.post(full_url).json(&self))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("invalid request body: {0}")]
    Body(#[from] serde_json::Error),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("first registration must be signed by the key it registers (signed by {signer}, key is {computed})")]
    NotSelfSigned { signer: String, computed: String },
    #[error(transparent)]
    Trust(#[from] TrustError),
}

impl Classify for IdentityError {
    fn kind(&self) -> ErrorKind {
        match self {
            IdentityError::Body(_) => ErrorKind::InvalidInput,
            IdentityError::Auth(AuthError::MissingHeader(_)) => ErrorKind::AuthFailure,
            IdentityError::Auth(e) => e.kind(),
            IdentityError::NotSelfSigned { .. } => ErrorKind::AuthFailure,
            IdentityError::Trust(e) => e.kind(),
        }
    }
}

impl IntoResponse for IdentityError {
    fn into_response(self) -> Response {
        error_response(&self)
    }
}
