//! API-key authentication.

use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;

use crate::AppState;
use crate::error::ApiError;

/// Require the configured API key via `X-API-Key` or bearer authorization.
/// No configured key means the API is open.
pub async fn require_api_key(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if let Some(expected) = &state.api_key {
        if !key_matches(request.headers(), expected) {
            return Err(ApiError::Unauthorized("invalid API key".to_string()));
        }
    }
    Ok(next.run(request).await)
}

fn key_matches(headers: &HeaderMap, expected: &str) -> bool {
    if let Some(key) = headers.get("X-API-Key").and_then(|v| v.to_str().ok()) {
        return key == expected;
    }
    if let Some(authorization) = headers.get("Authorization").and_then(|v| v.to_str().ok()) {
        if let Some(token) = authorization.strip_prefix("Bearer ") {
            return token == expected;
        }
    }
    false
}
