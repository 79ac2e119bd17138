// Credential pool.
//
// Owns every configured refresh-token record, hands out access tokens
// round-robin, applies exponential backoff to failing accounts, and keeps one
// background task per record refreshing tokens before they expire.

use std::sync::atomic::{AtomicI64, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::auth::credentials::CredentialSource;
use crate::auth::refresh::{RefreshedToken, TokenRefresher};
use crate::constants::{TOKEN_EXPIRY_BUFFER, TOKEN_REFRESH_THRESHOLD};
use crate::error::GatewayError;

/// Backoff floor / base / ceiling, in seconds.
const BACKOFF_FLOOR: i64 = 5 * 60;
const BACKOFF_BASE: i64 = 30 * 60;
const BACKOFF_CEILING: i64 = 2 * 60 * 60;

/// Cooldown applied after `count` consecutive failures.
fn backoff_secs(count: u32) -> i64 {
    let doubled = BACKOFF_BASE.saturating_mul(1i64 << (count.saturating_sub(1)).min(8));
    doubled.clamp(BACKOFF_FLOOR, BACKOFF_CEILING)
}

/// Token fields that must be observed as a consistent pair.
struct TokenState {
    refresh_token: Zeroizing<String>,
    access_token: String,
    /// Epoch seconds; 0 when no access token has been obtained yet.
    expires_at: i64,
    profile_arn: Option<String>,
}

enum AuthFlow {
    Desktop,
    SsoOidc {
        client_id: String,
        client_secret: Zeroizing<String>,
        sso_region: Option<String>,
    },
}

pub struct TokenRecord {
    index: usize,
    flow: AuthFlow,
    state: Mutex<TokenState>,
    /// Serializes refreshes for this record so concurrent callers don't
    /// stampede the auth endpoint.
    refresh_lock: Mutex<()>,
    failure_count: AtomicU32,
    /// Epoch seconds until which this record is cooling; 0 when healthy.
    cooldown_until: AtomicI64,
    /// Stale-tolerated copy of `state.expires_at` for non-blocking status.
    expires_hint: AtomicI64,
}

impl TokenRecord {
    fn from_source(index: usize, source: CredentialSource) -> Self {
        let expires_at = source.expires_at.map(|dt| dt.timestamp()).unwrap_or(0);
        let flow = if source.is_sso() {
            AuthFlow::SsoOidc {
                client_id: source.client_id.clone().unwrap_or_default(),
                client_secret: source
                    .client_secret
                    .unwrap_or_else(|| Zeroizing::new(String::new())),
                sso_region: source.sso_region.clone(),
            }
        } else {
            AuthFlow::Desktop
        };

        Self {
            index,
            flow,
            state: Mutex::new(TokenState {
                refresh_token: source.refresh_token,
                access_token: source.access_token.unwrap_or_default(),
                expires_at,
                profile_arn: source.profile_arn,
            }),
            refresh_lock: Mutex::new(()),
            failure_count: AtomicU32::new(0),
            cooldown_until: AtomicI64::new(0),
            expires_hint: AtomicI64::new(expires_at),
        }
    }

    fn is_cooling(&self, now: i64) -> bool {
        self.cooldown_until.load(Ordering::Relaxed) > now
    }

    fn mark_failed(&self, now: i64) -> (u32, i64) {
        let count = self.failure_count.fetch_add(1, Ordering::Relaxed) + 1;
        let cooldown = backoff_secs(count);
        self.cooldown_until.store(now + cooldown, Ordering::Relaxed);
        (count, cooldown)
    }

    fn mark_healthy(&self) {
        self.failure_count.store(0, Ordering::Relaxed);
        self.cooldown_until.store(0, Ordering::Relaxed);
    }
}

/// One row of `snapshot()`. Values come from atomics and may trail the live
/// state by a refresh; that is fine for a status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct AccountStatus {
    pub index: usize,
    pub healthy: bool,
    #[serde(rename = "expiryIn")]
    pub expiry_in: i64,
    #[serde(rename = "failureCount")]
    pub failure_count: u32,
    #[serde(rename = "cooldownIn")]
    pub cooldown_in: i64,
}

pub struct CredentialPool {
    records: Vec<Arc<TokenRecord>>,
    cursor: AtomicUsize,
    refresher: TokenRefresher,
    cancel: CancellationToken,
}

impl CredentialPool {
    pub fn new(sources: Vec<CredentialSource>, refresher: TokenRefresher) -> Self {
        let records = sources
            .into_iter()
            .enumerate()
            .map(|(i, s)| Arc::new(TokenRecord::from_source(i, s)))
            .collect::<Vec<_>>();
        info!("Credential pool initialized with {} account(s)", records.len());
        Self {
            records,
            cursor: AtomicUsize::new(0),
            refresher,
            cancel: CancellationToken::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn healthy_count(&self) -> usize {
        let now = Utc::now().timestamp();
        self.records.iter().filter(|r| !r.is_cooling(now)).count()
    }

    /// Hand out a usable access token and the index of the account it belongs
    /// to. Scans forward from the round-robin cursor, skipping cooling
    /// records and refreshing stale ones in place.
    pub async fn acquire(&self) -> Result<(String, usize), GatewayError> {
        let n = self.records.len();
        if n == 0 {
            return Err(GatewayError::NoCapacity);
        }

        let start = self.cursor.fetch_add(1, Ordering::Relaxed);

        for offset in 0..n {
            let record = &self.records[(start + offset) % n];
            let now = Utc::now().timestamp();

            if record.is_cooling(now) {
                continue;
            }

            {
                let state = record.state.lock().await;
                if !state.access_token.is_empty()
                    && state.expires_at - now > TOKEN_REFRESH_THRESHOLD
                {
                    return Ok((state.access_token.clone(), record.index));
                }
            }

            match self.refresh_record(record).await {
                Ok(token) => return Ok((token, record.index)),
                Err(e) => {
                    warn!("Account {} refresh failed during acquire: {}", record.index + 1, e);
                    continue;
                }
            }
        }

        Err(GatewayError::NoCapacity)
    }

    /// Refresh one record, serialized per account. Returns the fresh access
    /// token. Double-checks under the refresh lock so concurrent callers that
    /// queued behind an in-flight refresh reuse its result.
    async fn refresh_record(&self, record: &TokenRecord) -> Result<String, String> {
        let _guard = record.refresh_lock.lock().await;

        let now = Utc::now().timestamp();
        let (refresh_token, flow_inputs) = {
            let state = record.state.lock().await;
            if !state.access_token.is_empty() && state.expires_at - now > TOKEN_REFRESH_THRESHOLD {
                debug!("Account {} already refreshed by a concurrent request", record.index + 1);
                return Ok(state.access_token.clone());
            }
            let inputs = match &record.flow {
                AuthFlow::Desktop => None,
                AuthFlow::SsoOidc { client_id, client_secret, sso_region } => Some((
                    client_id.clone(),
                    client_secret.clone(),
                    sso_region.clone(),
                )),
            };
            (state.refresh_token.clone(), inputs)
        };

        let result = match &flow_inputs {
            None => self.refresher.refresh_desktop(&refresh_token).await,
            Some((client_id, client_secret, sso_region)) => {
                self.refresher
                    .refresh_sso_oidc(
                        &refresh_token,
                        client_id,
                        client_secret,
                        sso_region.as_deref(),
                    )
                    .await
            }
        };

        match result {
            Ok(refreshed) => {
                let token = self.store_refreshed(record, refreshed).await;
                record.mark_healthy();
                Ok(token)
            }
            Err(e) => {
                let now = Utc::now().timestamp();
                let (count, cooldown) = record.mark_failed(now);
                warn!(
                    "Account {} entered cooldown for {}s after {} consecutive failure(s)",
                    record.index + 1,
                    cooldown,
                    count
                );
                Err(e.to_string())
            }
        }
    }

    async fn store_refreshed(&self, record: &TokenRecord, refreshed: RefreshedToken) -> String {
        let expires_at = Utc::now().timestamp() + refreshed.expires_in - TOKEN_EXPIRY_BUFFER;
        let mut state = record.state.lock().await;
        state.access_token = refreshed.access_token.clone();
        state.expires_at = expires_at;
        if let Some(rt) = refreshed.refresh_token {
            state.refresh_token = Zeroizing::new(rt);
        }
        if refreshed.profile_arn.is_some() {
            state.profile_arn = refreshed.profile_arn;
        }
        record.expires_hint.store(expires_at, Ordering::Relaxed);
        refreshed.access_token
    }

    /// Apply one backoff step after an upstream auth/network failure observed
    /// by the request pipeline. Cancellations must NOT be reported here.
    pub fn report_failure(&self, index: usize, reason: &str) {
        let Some(record) = self.records.get(index) else {
            return;
        };
        let now = Utc::now().timestamp();
        let (count, cooldown) = record.mark_failed(now);
        warn!(
            "Account {} marked cooling for {}s ({} failure(s), reason: {})",
            index + 1,
            cooldown,
            count,
            reason
        );
    }

    /// Profile ARN discovered through refresh responses, if any account has
    /// one. Used when no PROFILE_ARN is configured.
    pub async fn discovered_profile_arn(&self) -> Option<String> {
        for record in &self.records {
            let state = record.state.lock().await;
            if state.profile_arn.is_some() {
                return state.profile_arn.clone();
            }
        }
        None
    }

    /// Non-blocking health snapshot for the status endpoint.
    pub fn snapshot(&self) -> Vec<AccountStatus> {
        let now = Utc::now().timestamp();
        self.records
            .iter()
            .map(|r| {
                let cooldown_until = r.cooldown_until.load(Ordering::Relaxed);
                let expires_at = r.expires_hint.load(Ordering::Relaxed);
                AccountStatus {
                    index: r.index,
                    healthy: cooldown_until <= now,
                    expiry_in: (expires_at - now).max(0),
                    failure_count: r.failure_count.load(Ordering::Relaxed),
                    cooldown_in: (cooldown_until - now).max(0),
                }
            })
            .collect()
    }

    /// Launch one proactive refresh task per record. Each task sleeps until
    /// the record's token approaches its refresh threshold, refreshes, and
    /// reschedules; refresh failures are retried after the backoff window.
    pub fn start_background_refresh(self: &Arc<Self>, fallback_interval: std::time::Duration) {
        for record in &self.records {
            let pool = Arc::clone(self);
            let record = Arc::clone(record);
            let cancel = self.cancel.child_token();
            let fallback = fallback_interval.as_secs().max(60) as i64;

            tokio::spawn(async move {
                loop {
                    let now = Utc::now().timestamp();
                    let expires_at = record.expires_hint.load(Ordering::Relaxed);
                    let cooldown_until = record.cooldown_until.load(Ordering::Relaxed);

                    let mut wait = if expires_at == 0 {
                        // No token yet: refresh soon, but let startup settle first.
                        5
                    } else {
                        (expires_at - TOKEN_REFRESH_THRESHOLD - now).max(30).min(fallback)
                    };
                    if cooldown_until > now {
                        wait = wait.max(cooldown_until - now);
                    }

                    tokio::select! {
                        _ = cancel.cancelled() => {
                            debug!("Background refresh task for account {} stopping", record.index + 1);
                            break;
                        }
                        _ = tokio::time::sleep(std::time::Duration::from_secs(wait as u64)) => {}
                    }

                    match pool.refresh_record(&record).await {
                        Ok(_) => {
                            debug!("Background refresh for account {} complete", record.index + 1)
                        }
                        Err(e) => {
                            warn!("Background refresh for account {} failed: {}", record.index + 1, e)
                        }
                    }
                }
            });
        }
        info!(
            "Background token refresh started for {} account(s)",
            self.records.len()
        );
    }

    /// Signal all background tasks to stop.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}
