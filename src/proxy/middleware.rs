// Gateway authentication middleware.
//
// Every /v1/* route requires the configured key, presented either as
// `Authorization: Bearer <key>` or `x-api-key: <key>`. The error body
// follows the dialect the route speaks.

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};

use crate::proxy::common::errors::{unauthorized_response, Dialect};
use crate::proxy::server::AppState;

fn presented_key(request: &Request) -> Option<&str> {
    if let Some(value) = request.headers().get("authorization") {
        if let Ok(value) = value.to_str() {
            if let Some(token) = value.strip_prefix("Bearer ") {
                return Some(token.trim());
            }
        }
    }
    request
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim())
}

/// Anthropic-native routes get Anthropic-shaped 401s; everything else under
/// /v1 speaks OpenAI.
fn dialect_for_path(path: &str) -> Dialect {
    if path.starts_with("/v1/messages") {
        Dialect::Anthropic
    } else {
        Dialect::OpenAi
    }
}

pub async fn auth_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let authorized = presented_key(&request)
        .map(|key| key == state.config.api_key)
        .unwrap_or(false);

    if !authorized {
        return unauthorized_response(dialect_for_path(request.uri().path()));
    }

    next.run(request).await
}
