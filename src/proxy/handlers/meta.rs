// Health, model listing, and account status endpoints.

use axum::{
    extract::State,
    response::{IntoResponse, Json},
};
use serde_json::json;

use crate::proxy::server::AppState;
use crate::proxy::upstream::dispatch::fetch_models;

pub async fn handle_root() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

pub async fn handle_health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "accounts": {
            "total": state.pool.len(),
            "healthy": state.pool.healthy_count(),
        }
    }))
}

/// OpenAI-shaped model listing; Anthropic clients accept this shape too.
pub async fn handle_list_models(State(state): State<AppState>) -> impl IntoResponse {
    let fetch_state = state.clone();
    let models = state
        .resolver
        .models(move || fetch_models(fetch_state))
        .await;

    let data: Vec<_> = models
        .into_iter()
        .map(|id| {
            json!({
                "id": id,
                "object": "model",
                "created": 1706745600,
                "owned_by": "kiro-bridge",
            })
        })
        .collect();

    Json(json!({ "object": "list", "data": data }))
}

pub async fn handle_accounts_status(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.pool.snapshot();
    let healthy = snapshot.iter().filter(|s| s.healthy).count();
    Json(json!({
        "total": snapshot.len(),
        "healthy": healthy,
        "recovering": state.truncation.active(),
        "accounts": snapshot,
    }))
}
