use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use kiro_bridge::auth;
use kiro_bridge::auth::pool::CredentialPool;
use kiro_bridge::auth::refresh::TokenRefresher;
use kiro_bridge::constants;
use kiro_bridge::proxy;
use kiro_bridge::proxy::config::GatewayConfig;
use kiro_bridge::proxy::http_client::{build_http_client, HttpClientConfig};
use kiro_bridge::proxy::model_resolver::{ModelResolver, MODEL_CACHE_TTL};
use kiro_bridge::proxy::server::AppState;
use kiro_bridge::proxy::upstream::truncation::TruncationRegistry;

fn init_logging() {
    let filter = std::env::var("LOG_LEVEL")
        .ok()
        .and_then(|level| EnvFilter::try_new(level.to_lowercase()).ok())
        .unwrap_or_else(|| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() {
    init_logging();

    let config = match GatewayConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    let sources = match auth::credentials::load_credentials() {
        Ok(sources) => sources,
        Err(e) => {
            error!("Credential error: {}", e);
            std::process::exit(1);
        }
    };

    let http = match build_http_client(&HttpClientConfig {
        proxy_url: config.vpn_proxy_url.clone(),
        ..Default::default()
    }) {
        Ok(client) => client,
        Err(e) => {
            error!("HTTP client error: {}", e);
            std::process::exit(1);
        }
    };

    if config.vpn_proxy_url.is_some() {
        info!("Routing upstream traffic through the configured proxy");
    }

    let refresher = TokenRefresher::new(http.clone(), config.region.clone());
    let pool = Arc::new(CredentialPool::new(sources, refresher));
    pool.start_background_refresh(config.background_refresh_interval);

    let state = AppState {
        config: Arc::new(config),
        http,
        pool: Arc::clone(&pool),
        resolver: Arc::new(ModelResolver::new(MODEL_CACHE_TTL)),
        truncation: Arc::new(TruncationRegistry::new()),
        fingerprint: Arc::new(constants::machine_fingerprint()),
    };

    proxy::server::start_maintenance(&state);

    if let Err(e) = proxy::server::run(state).await {
        error!("Failed to bind server: {}", e);
        pool.shutdown();
        std::process::exit(2);
    }

    info!("Draining background tasks");
    pool.shutdown();
}
