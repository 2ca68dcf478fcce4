//! Authentication middleware
//!
//! The whole surface is gated by one shared secret matched against the
//! `X-API-Key` request header. No configured secret means authentication
//! is disabled; the health endpoint is always open.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use tracing::warn;

use crate::config::ServerConfig;
use crate::errors::ServerError;

/// Header name carrying the shared API key.
pub const API_KEY_HEADER: &str = "X-API-Key";

pub async fn auth_middleware(
    State(config): State<Arc<ServerConfig>>,
    request: Request,
    next: Next,
) -> Result<Response, ServerError> {
    if request.uri().path() == "/health" {
        return Ok(next.run(request).await);
    }

    let Some(expected) = &config.api_key else {
        return Ok(next.run(request).await);
    };

    let provided = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok());

    match provided {
        Some(key) if key == expected => Ok(next.run(request).await),
        Some(_) => {
            warn!("rejected request to {} with invalid API key", request.uri().path());
            Err(ServerError::Auth("Invalid API key".to_string()))
        }
        None => {
            warn!("rejected request to {} without API key", request.uri().path());
            Err(ServerError::Auth("Missing API key".to_string()))
        }
    }
}
