// Model alias resolution with a TTL cache over upstream discovery.
//
// Resolution layers:
//   1. built-in aliases (auto-kiro and friends)
//   2. name normalization (dashes→dots for minor versions, strip date suffixes)
//   3. discovered model list (ListAvailableModels, cached 1 hour)
//   4. internal-id pass-through (CLAUDE_..._V1_0 style)
// Anything that survives none of the layers is an unknown model.

use std::future::Future;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::GatewayError;

pub const MODEL_CACHE_TTL: Duration = Duration::from_secs(3600);

/// Known-good ids used when discovery is unavailable.
const FALLBACK_MODELS: &[&str] = &[
    "claude-sonnet-4.5",
    "claude-sonnet-4",
    "claude-haiku-4.5",
    "claude-3.7-sonnet",
];

/// Alias that asks the gateway to pick the most capable discovered model.
const AUTO_ALIAS: &str = "auto-kiro";

static RE_STANDARD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(claude-(?:haiku|sonnet|opus)-\d+)-(\d{1,2})(?:-(?:\d{8}|latest))?$").unwrap()
});
static RE_NO_MINOR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(claude-(?:haiku|sonnet|opus)-\d+)(?:-\d{8})?$").unwrap());
static RE_LEGACY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^claude-(\d+)-(\d+)-(haiku|sonnet|opus)(?:-(?:\d{8}|latest))?$").unwrap()
});
static RE_DOT_DATE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(claude-(?:\d+\.\d+-)?(?:haiku|sonnet|opus)(?:-\d+\.\d+)?)-\d{8}$").unwrap()
});
static RE_INTERNAL_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Z][A-Z0-9_]+$").unwrap());

/// Normalize a client model name to the upstream's naming.
///
/// `claude-haiku-4-5-20251001` → `claude-haiku-4.5`
/// `claude-sonnet-4-20250514`  → `claude-sonnet-4`
/// `claude-3-7-sonnet`         → `claude-3.7-sonnet`
pub fn normalize_model_name(name: &str) -> String {
    let lower = name.to_lowercase();

    if let Some(caps) = RE_STANDARD.captures(&lower) {
        return format!("{}.{}", &caps[1], &caps[2]);
    }
    if let Some(caps) = RE_NO_MINOR.captures(&lower) {
        return caps[1].to_string();
    }
    if let Some(caps) = RE_LEGACY.captures(&lower) {
        return format!("claude-{}.{}-{}", &caps[1], &caps[2], &caps[3]);
    }
    if let Some(caps) = RE_DOT_DATE.captures(&lower) {
        return caps[1].to_string();
    }

    name.to_string()
}

/// Ordering key for the auto alias: higher is more capable.
fn capability_rank(id: &str) -> (u8, u32) {
    let lower = id.to_lowercase();
    let family = if lower.contains("opus") {
        3
    } else if lower.contains("sonnet") {
        2
    } else if lower.contains("haiku") {
        1
    } else {
        0
    };

    // First x.y (or bare x) number in the id, scaled to compare 4.5 > 4.
    static RE_VERSION: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+)(?:\.(\d+))?").unwrap());
    let version = RE_VERSION
        .captures(&lower)
        .map(|caps| {
            let major: u32 = caps[1].parse().unwrap_or(0);
            let minor: u32 = caps.get(2).and_then(|m| m.as_str().parse().ok()).unwrap_or(0);
            major * 100 + minor
        })
        .unwrap_or(0);

    (family, version)
}

struct CachedModels {
    models: Vec<String>,
    fetched_at: Instant,
}

impl CachedModels {
    fn is_stale(&self, ttl: Duration) -> bool {
        self.fetched_at.elapsed() > ttl
    }
}

/// Shared model cache + resolver. Fetching is injected so the resolver stays
/// free of HTTP plumbing.
pub struct ModelResolver {
    cache: RwLock<Option<CachedModels>>,
    ttl: Duration,
}

impl ModelResolver {
    pub fn new(ttl: Duration) -> Self {
        Self {
            cache: RwLock::new(None),
            ttl,
        }
    }

    /// Cached model ids, refreshed through `fetch` when stale. Discovery
    /// failures fall back to the built-in table.
    pub async fn models<F, Fut>(&self, fetch: F) -> Vec<String>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<String>, GatewayError>>,
    {
        {
            let guard = self.cache.read().await;
            if let Some(cached) = guard.as_ref() {
                if !cached.is_stale(self.ttl) {
                    return cached.models.clone();
                }
            }
        }

        // Stale or empty: take the write lock, re-check, then fetch. Holding
        // the write lock through the fetch keeps fills single-flight.
        let mut guard = self.cache.write().await;
        if let Some(cached) = guard.as_ref() {
            if !cached.is_stale(self.ttl) {
                return cached.models.clone();
            }
        }

        match fetch().await {
            Ok(models) if !models.is_empty() => {
                debug!("Model discovery returned {} id(s)", models.len());
                *guard = Some(CachedModels {
                    models: models.clone(),
                    fetched_at: Instant::now(),
                });
                models
            }
            Ok(_) => {
                warn!("Model discovery returned an empty list, using fallback table");
                FALLBACK_MODELS.iter().map(|s| s.to_string()).collect()
            }
            Err(e) => {
                warn!("Model discovery failed ({}), using fallback table", e);
                FALLBACK_MODELS.iter().map(|s| s.to_string()).collect()
            }
        }
    }

    /// Resolve a client-visible alias to an upstream model id.
    pub async fn resolve<F, Fut>(&self, alias: &str, fetch: F) -> Result<String, GatewayError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<String>, GatewayError>>,
    {
        if alias == AUTO_ALIAS {
            let models = self.models(fetch).await;
            return models
                .iter()
                .max_by_key(|id| capability_rank(id.as_str()))
                .cloned()
                .ok_or_else(|| GatewayError::UnknownModel(alias.to_string()));
        }

        let normalized = normalize_model_name(alias);

        // Internal Kiro ids go through untouched.
        if RE_INTERNAL_ID.is_match(&normalized) {
            return Ok(normalized);
        }

        let models = self.models(fetch).await;
        if models.iter().any(|m| m == &normalized) {
            return Ok(normalized);
        }

        // Tolerate discovery lists that still carry date suffixes.
        if models
            .iter()
            .any(|m| normalize_model_name(m) == normalized)
        {
            return Ok(normalized);
        }

        Err(GatewayError::UnknownModel(alias.to_string()))
    }

    pub async fn invalidate(&self) {
        *self.cache.write().await = None;
    }
}
