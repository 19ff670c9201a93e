use common::error::ErrorKind;
use reqwest::StatusCode;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("HTTP request failed: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),
    #[error("invalid header value: {0}")]
    Header(#[from] reqwest::header::InvalidHeaderValue),
    #[error("daemon refused the request ({status}, {code}): {message}")]
    Remote {
        status: StatusCode,
        code: ErrorKind,
        message: String,
    },
    #[error("HTTP status {0}: {1}")]
    HttpStatus(StatusCode, String),
}

impl ApiError {
    /// The daemon's classification, when it sent one
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            ApiError::Remote { code, .. } => Some(*code),
            _ => None,
        }
    }
}
