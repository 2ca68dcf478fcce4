//! Error types shared across the HTTP surface
//!
//! Every fallible operation that can reach a handler resolves into
//! [`ServerError`]; the `IntoResponse` impl maps error kinds onto HTTP
//! status codes so handlers can simply use `?`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Standard error response body for HTTP API endpoints.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub detail: String,
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    InvalidRequest(String),

    #[error("{0}")]
    Auth(String),

    #[error("failed to start container: {0}")]
    RuntimeStart(String),

    #[error("failed to stop container: {0}")]
    RuntimeStop(String),

    #[error("{message}")]
    ExecutionFailed { message: String, trace: String },

    #[error("{0}")]
    Timeout(String),

    #[error("{0}")]
    SessionStart(String),

    #[error("{0}")]
    Decode(String),

    #[error("{0}")]
    Internal(String),
}

impl ServerError {
    /// Stable machine-readable code for the error kind.
    pub fn code(&self) -> &'static str {
        match self {
            ServerError::NotFound(_) => "not_found",
            ServerError::InvalidRequest(_) => "invalid_request",
            ServerError::Auth(_) => "unauthorized",
            ServerError::RuntimeStart(_) => "runtime_start_failed",
            ServerError::RuntimeStop(_) => "runtime_stop_failed",
            ServerError::ExecutionFailed { .. } => "execution_failed",
            ServerError::Timeout(_) => "timeout",
            ServerError::SessionStart(_) => "session_start_failed",
            ServerError::Decode(_) => "decode_error",
            ServerError::Internal(_) => "internal_error",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ServerError::NotFound(_) => StatusCode::NOT_FOUND,
            ServerError::Auth(_) => StatusCode::UNAUTHORIZED,
            ServerError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorBody {
            error: self.code().to_string(),
            detail: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<anyhow::Error> for ServerError {
    fn from(err: anyhow::Error) -> Self {
        ServerError::Internal(err.to_string())
    }
}
