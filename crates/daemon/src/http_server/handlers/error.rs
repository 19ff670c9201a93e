use std::fmt::Display;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use common::error::{Classify, ErrorKind};
use serde::{Deserialize, Serialize};

/// Body of every error response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: ErrorKind,
    pub message: String,
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::AuthFailure | ErrorKind::ReplayDetected => StatusCode::UNAUTHORIZED,
        ErrorKind::Forbidden => StatusCode::FORBIDDEN,
        ErrorKind::AlreadyExists => StatusCode::CONFLICT,
        ErrorKind::KeyEvicted => StatusCode::GONE,
        ErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
        ErrorKind::UnsupportedPlatform | ErrorKind::StorageFailure => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// Render a classified error. Storage and platform failures are logged
/// in full and reported with their kind only.
pub fn error_response<E: Classify + Display>(error: &E) -> Response {
    let code = error.kind();
    let status = status_for(code);
    let message = if status.is_server_error() {
        tracing::error!(code = %code, "{}", error);
        code.to_string()
    } else {
        tracing::warn!(code = %code, "{}", error);
        error.to_string()
    };
    (status, Json(ErrorBody { code, message })).into_response()
}

#[cfg(test)]
mod test {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("disk on fire at /var/lib/berth")]
    struct DiskOnFire;

    impl Classify for DiskOnFire {
        fn kind(&self) -> ErrorKind {
            ErrorKind::StorageFailure
        }
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(ErrorKind::ReplayDetected), StatusCode::UNAUTHORIZED);
        assert_eq!(status_for(ErrorKind::Forbidden), StatusCode::FORBIDDEN);
        assert_eq!(status_for(ErrorKind::AlreadyExists), StatusCode::CONFLICT);
        assert_eq!(status_for(ErrorKind::KeyEvicted), StatusCode::GONE);
        assert_eq!(status_for(ErrorKind::InvalidInput), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_server_errors_hide_detail() {
        let response = error_response(&DiskOnFire);
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
