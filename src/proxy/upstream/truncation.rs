// Truncation recovery bookkeeping.
//
// When the upstream stops at its output ceiling mid-answer, the pipeline
// re-dispatches a continuation request. The registry tracks in-flight
// recoveries keyed by request digest so the status/debug surface can see
// them, and entries left behind by vanished clients age out.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use sha2::{Digest, Sha256};

/// Chained continuations allowed per client request.
pub const MAX_CONTINUATIONS: u32 = 2;

/// Entries older than this are presumed abandoned.
const ENTRY_TTL: Duration = Duration::from_secs(300);

/// Stable digest of an upstream payload, used as the recovery key.
pub fn request_digest(payload: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

struct RecoveryEntry {
    attempts_used: u32,
    started: Instant,
}

#[derive(Default)]
pub struct TruncationRegistry {
    entries: DashMap<String, RecoveryEntry>,
}

impl TruncationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that a continuation was issued for this request.
    pub fn record_continuation(&self, digest: &str) -> u32 {
        let mut entry = self.entries.entry(digest.to_string()).or_insert(RecoveryEntry {
            attempts_used: 0,
            started: Instant::now(),
        });
        entry.attempts_used += 1;
        entry.attempts_used
    }

    pub fn attempts_used(&self, digest: &str) -> u32 {
        self.entries.get(digest).map(|e| e.attempts_used).unwrap_or(0)
    }

    /// Drop the record once the request terminates (success or exhaustion).
    pub fn clear(&self, digest: &str) {
        self.entries.remove(digest);
    }

    /// Number of requests currently inside a recovery.
    pub fn active(&self) -> usize {
        self.entries.len()
    }

    pub fn cleanup_expired(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| e.started.elapsed() < ENTRY_TTL);
        before - self.entries.len()
    }
}
