use axum::extract::{Json, Query, State};
use axum::response::{IntoResponse, Response};
use common::audit::{AuditEntry, AuditError};
use common::error::{Classify, ErrorKind};
use common::trust::{Operation, TrustError};
use reqwest::{Client, RequestBuilder, Url};
use serde::{Deserialize, Serialize};

use crate::http_server::api::client::{ApiError, ApiRequest};
use crate::http_server::extract::Authenticated;
use crate::http_server::handlers::error_response;
use crate::ServiceState;

#[derive(Debug, Clone, Default, Serialize, Deserialize, clap::Args)]
pub struct AuditRequest {
    /// Only return the most recent N entries
    #[arg(long)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditResponse {
    pub entries: Vec<AuditEntry>,
    /// Sequence numbers whose signature does not check out
    pub unverifiable: Vec<u64>,
}

pub async fn handler(
    State(state): State<ServiceState>,
    Query(query): Query<AuditRequest>,
    auth: Authenticated,
) -> Result<impl IntoResponse, AuditQueryError> {
    if let Err(e) = state
        .trust()
        .authorize(&auth.caller.fingerprint, Operation::QueryAudit)
    {
        let e = AuditQueryError::from(e);
        auth.deny(&state, Operation::QueryAudit.as_str(), &e);
        return Err(e);
    }

    let mut entries = state.audit().entries()?;
    if let Some(limit) = query.limit {
        let skip = entries.len().saturating_sub(limit);
        entries.drain(..skip);
    }

    let unverifiable = entries
        .iter()
        .filter(|entry| state.audit().verify(entry).is_err())
        .map(|entry| entry.record.seq)
        .collect::<Vec<_>>();
    if !unverifiable.is_empty() {
        tracing::warn!(count = unverifiable.len(), "audit entries failed verification");
    }

    Ok(Json(AuditResponse {
        entries,
        unverifiable,
    }))
}

impl ApiRequest for AuditRequest {
    type Response = AuditResponse;

    fn build_request(self, base_url: &Url, client: &Client) -> Result<RequestBuilder, ApiError> {
        let full_url = base_url.join("/api/v0/audit")?;
        Ok(client.get(full_url).query(&self))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuditQueryError {
    #[error(transparent)]
    Trust(#[from] TrustError),
    #[error(transparent)]
    Audit(#[from] AuditError),
}

impl Classify for AuditQueryError {
    fn kind(&self) -> ErrorKind {
        match self {
            AuditQueryError::Trust(e) => e.kind(),
            AuditQueryError::Audit(e) => e.kind(),
        }
    }
}

impl IntoResponse for AuditQueryError {
    fn into_response(self) -> Response {
        error_response(&self)
    }
}
