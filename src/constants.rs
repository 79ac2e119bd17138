/// Time before token expiration when refresh is needed (in seconds).
/// Default 10 minutes - refresh token in advance to avoid errors.
pub const TOKEN_REFRESH_THRESHOLD: i64 = 600;

/// Safety buffer subtracted from the upstream-reported token lifetime.
pub const TOKEN_EXPIRY_BUFFER: i64 = 60;

/// Supported SQLite token keys (searched in priority order).
pub const SQLITE_TOKEN_KEYS: &[&str] = &[
    "kirocli:social:token",     // Social login (SSO providers)
    "kirocli:odic:token",       // AWS SSO OIDC (kiro-cli corporate)
    "codewhisperer:odic:token", // Legacy AWS SSO OIDC
];

/// Device registration keys for AWS SSO OIDC (searched in priority order).
pub const SQLITE_REGISTRATION_KEYS: &[&str] = &[
    "kirocli:odic:device-registration",
    "codewhisperer:odic:device-registration",
];

/// Returns the Kiro Desktop Auth token refresh URL for the given region.
///
/// Example: `kiro_refresh_url("us-east-1")` →
/// `"https://prod.us-east-1.auth.desktop.kiro.dev/refreshToken"`
pub fn kiro_refresh_url(region: &str) -> String {
    format!("https://prod.{}.auth.desktop.kiro.dev/refreshToken", region)
}

/// Returns the Q API host for the given region.
///
/// Example: `kiro_q_host("us-east-1")` → `"https://q.us-east-1.amazonaws.com"`
pub fn kiro_q_host(region: &str) -> String {
    format!("https://q.{}.amazonaws.com", region)
}

/// Returns the AWS SSO OIDC token URL for the given region.
pub fn aws_sso_oidc_url(region: &str) -> String {
    format!("https://oidc.{}.amazonaws.com/token", region)
}

/// Streaming inference endpoint path on the Q host.
pub const SEND_MESSAGE_STREAMING_PATH: &str = "/SendMessageStreaming";

/// Model discovery endpoint path on the Q host.
pub const LIST_AVAILABLE_MODELS_PATH: &str = "/ListAvailableModels";

/// Generates a unique machine fingerprint.
///
/// Uses the `machine-uid` crate to get a hardware-based identifier,
/// then hashes it with SHA-256 for privacy.
/// Falls back to a default hash if machine UID is unavailable.
pub fn machine_fingerprint() -> String {
    use sha2::{Digest, Sha256};

    match machine_uid::get() {
        Ok(uid) => {
            let mut hasher = Sha256::new();
            hasher.update(uid.as_bytes());
            format!("{:x}", hasher.finalize())
        }
        Err(_) => {
            let mut hasher = Sha256::new();
            hasher.update(b"default-kiro-bridge");
            format!("{:x}", hasher.finalize())
        }
    }
}

/// Mask a secret for safe logging (shows first 8 chars only).
pub fn mask_secret(secret: &str) -> String {
    if secret.is_empty() {
        return "None".to_string();
    }
    let prefix: String = secret.chars().take(8).collect();
    format!("{}...", prefix)
}
