// Anthropic Messages handler.

use axum::{
    body::Body,
    extract::{Json, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use serde_json::Value;
use tracing::info;

use crate::error::GatewayError;
use crate::proxy::common::errors::{error_response, Dialect};
use crate::proxy::mappers::claude::ClaudeRequest;
use crate::proxy::server::AppState;
use crate::proxy::upstream::dispatch::{
    collect_response, make_thinking_parser, open_stream, resolve_model, sse_body_stream,
    system_additions, RequestEnv,
};
use crate::proxy::upstream::translator::{
    estimate_conversation_tokens, render_anthropic_response, AnthropicSseBuilder,
};

fn trace_id() -> String {
    use rand::Rng;
    rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(6)
        .map(char::from)
        .collect::<String>()
        .to_lowercase()
}

pub async fn handle_messages(State(state): State<AppState>, Json(body): Json<Value>) -> Response {
    let trace = trace_id();

    let request: ClaudeRequest = match serde_json::from_value(body) {
        Ok(r) => r,
        Err(e) => {
            return error_response(
                Dialect::Anthropic,
                &GatewayError::BadRequest(format!("invalid request body: {}", e)),
            );
        }
    };

    let (convo, params) = match request.to_conversation() {
        Ok(pair) => pair,
        Err(e) => return error_response(Dialect::Anthropic, &e),
    };

    info!(
        "[{}] Anthropic request | model: {} | stream: {} | turns: {} | thinking: {}",
        trace,
        params.model,
        params.stream,
        convo.turns.len(),
        params.reasoning_budget.is_some()
    );

    let model_id = match resolve_model(&state, &params.model).await {
        Ok(id) => id,
        Err(e) => return error_response(Dialect::Anthropic, &e),
    };

    let profile_arn = match &state.config.profile_arn {
        Some(arn) => Some(arn.clone()),
        None => state.pool.discovered_profile_arn().await,
    };

    let additions = system_additions(&state, &params);
    let env = RequestEnv {
        convo,
        params,
        model_id,
        profile_arn,
        system_additions: additions,
    };
    let estimated_input = estimate_conversation_tokens(&env.convo);
    let handling = state.config.fake_reasoning.handling;

    if env.params.stream {
        let payload = env.payload();
        let upstream = match open_stream(&state, &payload).await {
            Ok(stream) => stream,
            Err(e) => return error_response(Dialect::Anthropic, &e),
        };

        info!("[{}] Streaming via account {}", trace, upstream.account + 1);

        let builder = AnthropicSseBuilder::new(
            &env.params.model,
            estimated_input,
            make_thinking_parser(&state, &env.params),
            handling,
        );
        let stream = sse_body_stream(state.clone(), env, upstream, builder);

        Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/event-stream")
            .header(header::CACHE_CONTROL, "no-cache")
            .body(Body::from_stream(stream))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
    } else {
        match collect_response(&state, &env).await {
            Ok(collected) => {
                info!(
                    "[{}] Completed | stop: {:?} | output tokens: {}",
                    trace, collected.stop, collected.output_tokens
                );
                Json(render_anthropic_response(&env.params.model, &collected, handling))
                    .into_response()
            }
            Err(e) => error_response(Dialect::Anthropic, &e),
        }
    }
}
