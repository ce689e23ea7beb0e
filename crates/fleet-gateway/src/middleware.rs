use axum::{
    extract::{Query, Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::warn;

use crate::error::ErrorBody;

/// Auth configuration for the gateway.
#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    /// API keys that are allowed in. Empty = no auth required.
    pub api_keys: Vec<String>,
}

impl AuthConfig {
    /// Allow the given keys. An empty list disables auth.
    pub fn new(api_keys: Vec<String>) -> Self {
        Self { api_keys }
    }

    /// Returns true if authentication is enabled (at least one key configured).
    pub fn is_enabled(&self) -> bool {
        !self.api_keys.is_empty()
    }
}

/// Query string carrying an API key.
#[derive(Debug, Deserialize, Default)]
pub struct AuthQuery {
    /// Value of `?api_key=`.
    pub api_key: Option<String>,
}

/// Validates the API key from `Authorization: Bearer <key>` or `?api_key=<key>`.
///
/// `/health` is always open.
pub async fn auth_middleware(
    State(auth): State<Arc<AuthConfig>>,
    headers: HeaderMap,
    query: Query<AuthQuery>,
    request: Request,
    next: Next,
) -> Response {
    if !auth.is_enabled() || request.uri().path() == "/health" {
        return next.run(request).await;
    }

    let key = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
        .or_else(|| query.api_key.clone());

    let message = match key {
        Some(k) if auth.api_keys.contains(&k) => return next.run(request).await,
        Some(_) => "Invalid API key",
        None => "API key required",
    };
    warn!(path = %request.uri().path(), "Rejected request: {message}");
    (
        StatusCode::UNAUTHORIZED,
        Json(ErrorBody {
            code: "unauthorized".into(),
            message: message.into(),
        }),
    )
        .into_response()
}
