//! Errors surfaced by the relay core and how the HTTP façade reports them.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

pub type RelayResult<T> = Result<T, RelayError>;

#[derive(Debug, Error)]
pub enum RelayError {
    /// A required request field was missing or the body was unreadable.
    #[error("{0}")]
    Validation(String),

    /// The short code was never issued or has expired.
    #[error("Invalid or expired code: {0}")]
    NotFound(String),

    /// The code registry could not be reached. Not retried.
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// The provider declined the request; carries its response body verbatim.
    #[error("Provider Error: {0}")]
    UpstreamRejected(String),

    /// The provider could not be reached or answered with garbage.
    #[error("Provider unreachable: {0}")]
    UpstreamUnreachable(String),
}

impl RelayError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) | Self::UpstreamRejected(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::StorageUnavailable(_) | Self::UpstreamUnreachable(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<reqwest::Error> for RelayError {
    fn from(e: reqwest::Error) -> Self {
        Self::UpstreamUnreachable(e.to_string())
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        } else {
            tracing::debug!("Request rejected: {}", self);
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
