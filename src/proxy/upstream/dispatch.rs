// Upstream dispatch and the request pipeline.
//
// One function sends a single upstream call with account failover; the
// streaming pump and the non-streaming collector both sit on top of it and
// share the continuation (truncation recovery) logic.

use std::pin::Pin;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::constants::{
    kiro_q_host, LIST_AVAILABLE_MODELS_PATH, SEND_MESSAGE_STREAMING_PATH,
};
use crate::error::{GatewayError, UpstreamOutcome};
use crate::proxy::config::DebugMode;
use crate::proxy::mappers::conversation::{Conversation, RequestParams, Role, Turn};
use crate::proxy::mappers::kiro::{
    build_payload, thinking_system_addition, truncation_system_addition,
};
use crate::proxy::server::AppState;
use crate::proxy::upstream::event_stream::{
    EventStreamDecoder, KiroChunk, StopReason, StreamFault,
};
use crate::proxy::upstream::thinking_parser::ThinkingParser;
use crate::proxy::upstream::translator::{
    estimate_conversation_tokens, estimate_tokens, CollectedResponse, ResponseCollector,
    SseBuilder,
};
use crate::proxy::upstream::truncation::{request_digest, MAX_CONTINUATIONS};

type BoxByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>;

/// Everything needed to rebuild and re-dispatch one client request, both for
/// account failover and for truncation continuations.
pub struct RequestEnv {
    pub convo: Conversation,
    pub params: RequestParams,
    pub model_id: String,
    pub profile_arn: Option<String>,
    pub system_additions: String,
}

impl RequestEnv {
    pub fn payload(&self) -> Value {
        build_payload(
            &self.convo,
            &self.params,
            &self.model_id,
            self.profile_arn.as_deref(),
            &self.system_additions,
        )
    }

    /// Payload for a continuation: the partial answer becomes an assistant
    /// turn, followed by a bare "continue" user turn.
    pub fn continuation_payload(&self, partial: &str) -> Value {
        let mut convo = self.convo.clone();
        convo.turns.push(Turn::text(Role::Assistant, partial));
        convo.turns.push(Turn::text(Role::User, "continue"));
        build_payload(
            &convo,
            &self.params,
            &self.model_id,
            self.profile_arn.as_deref(),
            &self.system_additions,
        )
    }
}

/// System prompt additions active for this request (fake reasoning guidance
/// and truncation recovery legitimization).
pub fn system_additions(state: &AppState, params: &RequestParams) -> String {
    let mut out = String::new();
    if state.config.fake_reasoning.enabled && params.reasoning_budget.is_some() {
        let budget = params
            .reasoning_budget
            .unwrap()
            .min(state.config.fake_reasoning.max_tokens);
        out.push_str(&thinking_system_addition("<thinking>", "</thinking>", budget));
    }
    if state.config.truncation_recovery {
        out.push_str(&truncation_system_addition());
    }
    out
}

/// The thinking parser configured for this request.
pub fn make_thinking_parser(state: &AppState, params: &RequestParams) -> ThinkingParser {
    let budget = params
        .reasoning_budget
        .unwrap_or(state.config.fake_reasoning.max_tokens)
        .min(state.config.fake_reasoning.max_tokens);
    ThinkingParser::new(budget)
}

fn kiro_headers(token: &str, fingerprint: &str) -> reqwest::header::HeaderMap {
    let mut headers = reqwest::header::HeaderMap::new();

    if let Ok(auth) = format!("Bearer {}", token).parse() {
        headers.insert(reqwest::header::AUTHORIZATION, auth);
    }
    headers.insert(
        reqwest::header::CONTENT_TYPE,
        "application/json".parse().unwrap(),
    );

    let ua = format!(
        "aws-sdk-js/1.0.27 ua/2.1 os/linux lang/js md/nodejs#22.21.1 api/codewhispererstreaming#1.0.27 m/E KiroIDE-0.7.45-{}",
        fingerprint
    );
    if let Ok(value) = ua.parse() {
        headers.insert(reqwest::header::USER_AGENT, value);
    }
    if let Ok(value) = format!("aws-sdk-js/1.0.27 KiroIDE-0.7.45-{}", fingerprint).parse() {
        headers.insert("x-amz-user-agent", value);
    }
    headers.insert("x-amzn-codewhisperer-optout", "true".parse().unwrap());
    if let Ok(value) = uuid::Uuid::new_v4().to_string().parse() {
        headers.insert("amz-sdk-invocation-id", value);
    }
    headers.insert("amz-sdk-request", "attempt=1; max=1".parse().unwrap());

    headers
}

/// One upstream POST with account failover. Auth and rate-limit failures
/// rotate through up to every configured account; a transient network error
/// gets a single transparent retry on a fresh connection.
pub async fn send_message_streaming(
    state: &AppState,
    payload: &Value,
) -> Result<(reqwest::Response, usize), GatewayError> {
    let url = format!("{}{}", kiro_q_host(&state.config.region), SEND_MESSAGE_STREAMING_PATH);

    if state.config.debug_mode == DebugMode::All {
        debug!("Upstream payload: {}", payload);
    }

    let max_attempts = state.pool.len().max(1);
    let mut network_retry_used = false;
    let mut last_error: Option<GatewayError> = None;

    let mut attempt = 0;
    while attempt < max_attempts {
        let (token, account) = state.pool.acquire().await?;

        let send_result = state
            .http
            .post(&url)
            .headers(kiro_headers(&token, &state.fingerprint))
            .json(payload)
            .send()
            .await;

        let response = match send_result {
            Ok(r) => r,
            Err(e) => {
                if !network_retry_used {
                    network_retry_used = true;
                    warn!("Upstream connection error ({}), retrying on a fresh connection", e);
                    continue;
                }
                state.pool.report_failure(account, "network error");
                return Err(GatewayError::Network(e.to_string()));
            }
        };

        let status = response.status().as_u16();
        match UpstreamOutcome::from_status(status) {
            UpstreamOutcome::Ok => return Ok((response, account)),

            UpstreamOutcome::AuthExpired => {
                let body = truncated_body(response).await;
                warn!(
                    "Account {} rejected by upstream ({}), failing over",
                    account + 1,
                    status
                );
                state.pool.report_failure(account, "upstream auth rejection");
                last_error = Some(GatewayError::Upstream { status, message: body });
                attempt += 1;
            }

            UpstreamOutcome::RateLimited => {
                let body = truncated_body(response).await;
                warn!("Account {} rate limited by upstream, failing over", account + 1);
                state.pool.report_failure(account, "upstream rate limit");
                last_error = Some(GatewayError::Upstream { status, message: body });
                attempt += 1;
            }

            UpstreamOutcome::ServerRetryable
            | UpstreamOutcome::ServerFatal
            | UpstreamOutcome::NetworkRetryable
            | UpstreamOutcome::Canceled => {
                let body = truncated_body(response).await;
                if state.config.debug_mode != DebugMode::Off {
                    debug!("Upstream error body: {}", body);
                }
                return Err(GatewayError::Upstream { status, message: body });
            }
        }
    }

    Err(last_error.unwrap_or(GatewayError::NoCapacity))
}

async fn truncated_body(response: reqwest::Response) -> String {
    let text = response.text().await.unwrap_or_default();
    text.chars().take(512).collect()
}

/// An upstream stream that has already produced its first byte.
pub struct UpstreamStream {
    pub first: Bytes,
    pub rest: BoxByteStream,
    pub account: usize,
}

/// Dispatch and wait for the first body byte. A first-byte timeout gets one
/// transparent re-dispatch; the second one surfaces as a gateway timeout.
pub async fn open_stream(state: &AppState, payload: &Value) -> Result<UpstreamStream, GatewayError> {
    let mut timeout_retry_used = false;
    let mut network_retry_used = false;

    loop {
        let (response, account) = send_message_streaming(state, payload).await?;
        let mut rest: BoxByteStream = Box::pin(response.bytes_stream());

        match tokio::time::timeout(state.config.first_token_timeout, rest.next()).await {
            Ok(Some(Ok(first))) => return Ok(UpstreamStream { first, rest, account }),

            Ok(Some(Err(e))) => {
                if !network_retry_used {
                    network_retry_used = true;
                    warn!("Stream failed before first byte ({}), re-dispatching", e);
                    continue;
                }
                state.pool.report_failure(account, "network error before first byte");
                return Err(GatewayError::Network(e.to_string()));
            }

            Ok(None) => {
                // Upstream closed with an empty body; hand the decoder an
                // empty stream so it reports the truncation.
                return Ok(UpstreamStream { first: Bytes::new(), rest, account });
            }

            Err(_) => {
                if !timeout_retry_used {
                    timeout_retry_used = true;
                    warn!("First-byte timeout, re-dispatching once");
                    continue;
                }
                return Err(GatewayError::Timeout);
            }
        }
    }
}

/// Upstream model discovery used to fill the model cache.
pub async fn fetch_models(state: AppState) -> Result<Vec<String>, GatewayError> {
    let (token, _account) = state.pool.acquire().await?;
    let url = format!("{}{}", kiro_q_host(&state.config.region), LIST_AVAILABLE_MODELS_PATH);

    let mut body = json!({ "origin": "AI_EDITOR" });
    if let Some(arn) = &state.config.profile_arn {
        body["profileArn"] = json!(arn);
    }

    let response = state
        .http
        .post(&url)
        .headers(kiro_headers(&token, &state.fingerprint))
        .json(&body)
        .send()
        .await
        .map_err(|e| GatewayError::Network(e.to_string()))?;

    let status = response.status().as_u16();
    if !(200..300).contains(&status) {
        return Err(GatewayError::Upstream {
            status,
            message: truncated_body(response).await,
        });
    }

    let parsed: Value = response
        .json()
        .await
        .map_err(|e| GatewayError::Network(e.to_string()))?;

    let models = parsed
        .get("models")
        .and_then(|m| m.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    item.as_str()
                        .or_else(|| item.get("modelId").and_then(|v| v.as_str()))
                        .or_else(|| item.get("modelName").and_then(|v| v.as_str()))
                        .map(|s| s.to_string())
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(models)
}

/// Resolve a client model alias through the shared cache.
pub async fn resolve_model(state: &AppState, alias: &str) -> Result<String, GatewayError> {
    let fetch_state = state.clone();
    state
        .resolver
        .resolve(alias, move || fetch_models(fetch_state))
        .await
}

/// Whether the client's token budget still has room after `partial` output.
fn budget_remaining(params: &RequestParams, partial: &str) -> bool {
    match params.max_tokens {
        None => true,
        Some(max) => estimate_tokens(partial) < max,
    }
}

/// The streaming pump: reads upstream bytes, routes chunks through the
/// dialect builder, and splices in continuation legs when the upstream stops
/// at its output ceiling. Dropping the returned stream (client disconnect)
/// drops the upstream connection with it.
pub fn sse_body_stream<B>(
    state: AppState,
    env: RequestEnv,
    upstream: UpstreamStream,
    mut builder: B,
) -> impl Stream<Item = Result<Bytes, std::io::Error>>
where
    B: SseBuilder + 'static,
{
    async_stream::stream! {
        let digest = request_digest(&env.payload());
        let recovery_enabled = state.config.truncation_recovery;
        let mut attempts_left = MAX_CONTINUATIONS;
        let mut accumulated = String::new();
        let mut upstream = upstream;

        'legs: loop {
            let mut decoder = EventStreamDecoder::new();
            let mut leg_stop: Option<StopReason> = None;
            let mut pending = Some(upstream.first.clone());

            'read: loop {
                let bytes = match pending.take() {
                    Some(first) => {
                        if first.is_empty() { None } else { Some(Ok(first)) }
                    }
                    None => {
                        match tokio::time::timeout(
                            state.config.streaming_read_timeout,
                            upstream.rest.next(),
                        )
                        .await
                        {
                            Ok(next) => next,
                            Err(_) => {
                                warn!("Streaming read timeout, aborting stream");
                                yield Ok(Bytes::from(
                                    builder.inline_error("upstream stream stalled"),
                                ));
                                state.truncation.clear(&digest);
                                return;
                            }
                        }
                    }
                };

                let bytes = match bytes {
                    Some(Ok(bytes)) => bytes,
                    Some(Err(e)) => {
                        warn!("Stream read error: {}", e);
                        for chunk in decoder.finish() {
                            if let KiroChunk::Stop(reason) = &chunk {
                                leg_stop = Some(*reason);
                                continue;
                            }
                            let sse = builder.on_chunk(chunk);
                            if !sse.is_empty() {
                                yield Ok(Bytes::from(sse));
                            }
                        }
                        break 'read;
                    }
                    None => {
                        for chunk in decoder.finish() {
                            if let KiroChunk::Stop(reason) = &chunk {
                                leg_stop = Some(*reason);
                                continue;
                            }
                            let sse = builder.on_chunk(chunk);
                            if !sse.is_empty() {
                                yield Ok(Bytes::from(sse));
                            }
                        }
                        break 'read;
                    }
                };

                let chunks = match decoder.feed(&bytes) {
                    Ok(chunks) => chunks,
                    Err(e) => {
                        warn!("Event stream protocol failure: {}", e);
                        yield Ok(Bytes::from(builder.inline_error(&e.to_string())));
                        state.truncation.clear(&digest);
                        return;
                    }
                };

                for chunk in chunks {
                    match chunk {
                        KiroChunk::TextDelta(text) => {
                            accumulated.push_str(&text);
                            let sse = builder.on_chunk(KiroChunk::TextDelta(text));
                            if !sse.is_empty() {
                                yield Ok(Bytes::from(sse));
                            }
                        }
                        KiroChunk::Stop(reason) => {
                            leg_stop = Some(reason);
                        }
                        KiroChunk::Error(StreamFault::Upstream { code, message }) => {
                            let sse = builder
                                .on_chunk(KiroChunk::Error(StreamFault::Upstream { code, message }));
                            if !sse.is_empty() {
                                yield Ok(Bytes::from(sse));
                            }
                            state.truncation.clear(&digest);
                            return;
                        }
                        other => {
                            let sse = builder.on_chunk(other);
                            if !sse.is_empty() {
                                yield Ok(Bytes::from(sse));
                            }
                        }
                    }
                }
            }

            // Leg finished: decide between continuation and finalization.
            if leg_stop == Some(StopReason::MaxTokens)
                && recovery_enabled
                && attempts_left > 0
                && budget_remaining(&env.params, &accumulated)
            {
                attempts_left -= 1;
                let attempt = state.truncation.record_continuation(&digest);
                info!(
                    "Upstream hit its output ceiling, issuing continuation {} of {}",
                    attempt, MAX_CONTINUATIONS
                );

                let payload = env.continuation_payload(&accumulated);
                match open_stream(&state, &payload).await {
                    Ok(next) => {
                        upstream = next;
                        continue 'legs;
                    }
                    Err(e) => {
                        warn!("Continuation dispatch failed ({}), ending stream as-is", e);
                        leg_stop = Some(StopReason::MaxTokens);
                    }
                }
            }

            if let Some(reason) = leg_stop {
                let sse = builder.on_chunk(KiroChunk::Stop(reason));
                if !sse.is_empty() {
                    yield Ok(Bytes::from(sse));
                }
            }
            let tail = builder.finalize();
            if !tail.is_empty() {
                yield Ok(Bytes::from(tail));
            }
            state.truncation.clear(&digest);
            return;
        }
    }
}

/// Non-streaming path: drain the whole stream (with the same continuation
/// handling) into a collected response.
pub async fn collect_response(
    state: &AppState,
    env: &RequestEnv,
) -> Result<CollectedResponse, GatewayError> {
    let payload = env.payload();
    let digest = request_digest(&payload);
    let estimated_input = estimate_conversation_tokens(&env.convo);

    let mut collector = ResponseCollector::new(make_thinking_parser(state, &env.params));
    let mut attempts_left = MAX_CONTINUATIONS;
    let mut accumulated = String::new();
    let mut upstream = open_stream(state, &payload).await?;

    loop {
        let mut decoder = EventStreamDecoder::new();
        let mut leg_stop: Option<StopReason> = None;
        let mut pending = Some(upstream.first.clone());

        loop {
            let bytes = match pending.take() {
                Some(first) if !first.is_empty() => Some(Ok(first)),
                Some(_) => None,
                None => tokio::time::timeout(
                    state.config.streaming_read_timeout,
                    upstream.rest.next(),
                )
                .await
                .map_err(|_| GatewayError::Timeout)?,
            };

            let bytes = match bytes {
                Some(Ok(bytes)) => bytes,
                Some(Err(e)) => {
                    warn!("Stream read error: {}", e);
                    for chunk in decoder.finish() {
                        match chunk {
                            KiroChunk::Stop(reason) => leg_stop = Some(reason),
                            other => collector.push(other),
                        }
                    }
                    break;
                }
                None => {
                    for chunk in decoder.finish() {
                        match chunk {
                            KiroChunk::Stop(reason) => leg_stop = Some(reason),
                            other => collector.push(other),
                        }
                    }
                    break;
                }
            };

            for chunk in decoder.feed(&bytes)? {
                match chunk {
                    KiroChunk::TextDelta(text) => {
                        accumulated.push_str(&text);
                        collector.push(KiroChunk::TextDelta(text));
                    }
                    KiroChunk::Stop(reason) => leg_stop = Some(reason),
                    other => collector.push(other),
                }
            }
        }

        if leg_stop == Some(StopReason::MaxTokens)
            && state.config.truncation_recovery
            && attempts_left > 0
            && budget_remaining(&env.params, &accumulated)
        {
            attempts_left -= 1;
            let attempt = state.truncation.record_continuation(&digest);
            info!(
                "Upstream hit its output ceiling, issuing continuation {} of {}",
                attempt, MAX_CONTINUATIONS
            );
            let payload = env.continuation_payload(&accumulated);
            match open_stream(state, &payload).await {
                Ok(next) => {
                    upstream = next;
                    continue;
                }
                Err(e) => {
                    warn!("Continuation dispatch failed ({}), returning partial output", e);
                    leg_stop = Some(StopReason::MaxTokens);
                }
            }
        }

        collector.push(KiroChunk::Stop(leg_stop.unwrap_or(StopReason::EndTurn)));
        state.truncation.clear(&digest);

        let collected = collector.finish(estimated_input);
        if let Some(message) = &collected.upstream_error {
            return Err(GatewayError::Upstream {
                status: 502,
                message: message.clone(),
            });
        }
        return Ok(collected);
    }
}
