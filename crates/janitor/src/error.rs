//! Janitor error types.

use crate::gitserver::GitError;
use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use beacon_metadata::{ErrorKind, MetadataError};
use serde::Serialize;

/// Error body returned by the HTTP endpoints.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

/// Errors raised while running janitor jobs or serving HTTP requests.
#[derive(Debug, thiserror::Error)]
pub enum JanitorError {
    #[error("metadata error: {0}")]
    Metadata(#[from] MetadataError),

    #[error("git error: {0}")]
    Git(#[from] GitError),

    #[error("core error: {0}")]
    Core(#[from] beacon_core::Error),
}

impl JanitorError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Metadata(_) => "metadata_error",
            Self::Git(_) => "git_error",
            Self::Core(_) => "core_error",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Metadata(e) => match e.kind() {
                ErrorKind::Transient => StatusCode::SERVICE_UNAVAILABLE,
                ErrorKind::Validation => StatusCode::BAD_REQUEST,
                ErrorKind::NotFound => StatusCode::NOT_FOUND,
                ErrorKind::Conflict => StatusCode::CONFLICT,
                ErrorKind::PolicyViolation | ErrorKind::Internal => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
            Self::Git(GitError::Timeout { .. }) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for JanitorError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            code: self.code().to_string(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

pub type JanitorResult<T> = std::result::Result<T, JanitorError>;
