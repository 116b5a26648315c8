//! API key check.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::client::API_KEY_HEADER;

/// Key a listener expects in `X-API-Key`.
#[derive(Clone)]
pub struct ApiKey(Arc<str>);

impl ApiKey {
    pub fn new(key: &str) -> Self {
        Self(Arc::from(key))
    }

    /// A request is allowed only with a non-empty key equal to ours.
    pub fn allows(&self, headers: &HeaderMap) -> bool {
        let provided = headers
            .get(API_KEY_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        !provided.is_empty() && provided == &*self.0
    }
}

#[derive(Debug, Serialize)]
struct Unauthorized {
    message: &'static str,
}

/// Middleware rejecting requests without a valid key.
pub async fn require_api_key(State(key): State<ApiKey>, request: Request, next: Next) -> Response {
    if !key.allows(request.headers()) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(Unauthorized {
                message: "Unauthorized",
            }),
        )
            .into_response();
    }
    next.run(request).await
}
