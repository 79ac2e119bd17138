// HTTP server assembly: shared state, router, and lifecycle.

use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tracing::{debug, info};

use crate::auth::pool::CredentialPool;
use crate::proxy::config::GatewayConfig;
use crate::proxy::handlers;
use crate::proxy::middleware::auth_middleware;
use crate::proxy::model_resolver::ModelResolver;
use crate::proxy::upstream::truncation::TruncationRegistry;

/// Shared application state. Everything is behind an Arc so handlers and the
/// streaming pump can clone freely.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub http: reqwest::Client,
    pub pool: Arc<CredentialPool>,
    pub resolver: Arc<ModelResolver>,
    pub truncation: Arc<TruncationRegistry>,
    pub fingerprint: Arc<String>,
}

pub fn build_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/v1/models", get(handlers::meta::handle_list_models))
        .route(
            "/v1/chat/completions",
            post(handlers::openai::handle_chat_completions),
        )
        .route("/v1/messages", post(handlers::claude::handle_messages))
        .route(
            "/v1/accounts/status",
            get(handlers::meta::handle_accounts_status),
        )
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    Router::new()
        .route("/", get(handlers::meta::handle_root))
        .route("/health", get(handlers::meta::handle_health))
        .merge(protected)
        .with_state(state)
}

/// Periodic sweep of abandoned truncation-recovery records.
pub fn start_maintenance(state: &AppState) {
    let truncation = Arc::clone(&state.truncation);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
        loop {
            interval.tick().await;
            let removed = truncation.cleanup_expired();
            if removed > 0 {
                debug!("Swept {} stale truncation-recovery record(s)", removed);
            }
        }
    });
}

/// Bind and serve until ctrl-c. A bind failure is returned to the caller so
/// it can exit with the right code.
pub async fn run(state: AppState) -> Result<(), std::io::Error> {
    let addr = format!("{}:{}", state.config.host, state.config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!("kiro-bridge listening on {}", addr);

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutdown signal received");
        })
        .await
}
