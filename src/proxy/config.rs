// Gateway runtime configuration, assembled from environment variables once at
// startup and shared read-only afterwards.

use std::time::Duration;

/// How extracted reasoning is surfaced to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReasoningHandling {
    /// Remove reasoning from the client response entirely.
    Strip,
    /// Surface reasoning as the dialect's reasoning field / thinking block.
    Passthrough,
    /// Like passthrough, but inject a minimal placeholder when the model
    /// produced no reasoning at all.
    SyntheticOnMissing,
}

impl ReasoningHandling {
    fn parse(raw: &str) -> Option<Self> {
        match raw.to_lowercase().as_str() {
            "strip" => Some(Self::Strip),
            "passthrough" => Some(Self::Passthrough),
            "synthetic-on-missing" | "synthetic_on_missing" => Some(Self::SyntheticOnMissing),
            _ => None,
        }
    }
}

/// Payload-level debug capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugMode {
    Off,
    Errors,
    All,
}

impl DebugMode {
    fn parse(raw: &str) -> Option<Self> {
        match raw.to_lowercase().as_str() {
            "off" => Some(Self::Off),
            "errors" => Some(Self::Errors),
            "all" => Some(Self::All),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FakeReasoningConfig {
    pub enabled: bool,
    /// Reasoning budget cap, approximated as tokens (chars / 4).
    pub max_tokens: u32,
    pub handling: ReasoningHandling,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Bearer key the gateway itself requires on /v1/* routes.
    pub api_key: String,
    pub host: String,
    pub port: u16,
    pub region: String,
    pub profile_arn: Option<String>,
    /// Optional outbound HTTP/SOCKS5 proxy for upstream calls.
    pub vpn_proxy_url: Option<String>,
    pub first_token_timeout: Duration,
    pub streaming_read_timeout: Duration,
    pub background_refresh_interval: Duration,
    pub fake_reasoning: FakeReasoningConfig,
    pub truncation_recovery: bool,
    pub debug_mode: DebugMode,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("PROXY_API_KEY is required")]
    MissingApiKey,
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, String),
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn env_u64(name: &'static str, default: u64) -> Result<u64, ConfigError> {
    match env_string(name) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|_| ConfigError::Invalid(name, raw)),
    }
}

fn env_bool(name: &'static str, default: bool) -> Result<bool, ConfigError> {
    match env_string(name) {
        None => Ok(default),
        Some(raw) => match raw.to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Invalid(name, raw)),
        },
    }
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_key = env_string("PROXY_API_KEY").ok_or(ConfigError::MissingApiKey)?;

        let port = match env_string("SERVER_PORT") {
            None => 8045,
            Some(raw) => raw
                .parse::<u16>()
                .map_err(|_| ConfigError::Invalid("SERVER_PORT", raw))?,
        };

        let handling = match env_string("FAKE_REASONING_HANDLING") {
            None => ReasoningHandling::Passthrough,
            Some(raw) => ReasoningHandling::parse(&raw)
                .ok_or(ConfigError::Invalid("FAKE_REASONING_HANDLING", raw))?,
        };

        let debug_mode = match env_string("DEBUG_MODE") {
            None => DebugMode::Off,
            Some(raw) => {
                DebugMode::parse(&raw).ok_or(ConfigError::Invalid("DEBUG_MODE", raw))?
            }
        };

        Ok(Self {
            api_key,
            host: env_string("SERVER_HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port,
            region: env_string("KIRO_REGION").unwrap_or_else(|| "us-east-1".to_string()),
            profile_arn: env_string("PROFILE_ARN"),
            vpn_proxy_url: env_string("VPN_PROXY_URL"),
            first_token_timeout: Duration::from_secs(env_u64("FIRST_TOKEN_TIMEOUT", 15)?),
            streaming_read_timeout: Duration::from_secs(env_u64("STREAMING_READ_TIMEOUT", 300)?),
            background_refresh_interval: Duration::from_secs(env_u64(
                "BACKGROUND_REFRESH_INTERVAL",
                1800,
            )?),
            fake_reasoning: FakeReasoningConfig {
                enabled: env_bool("FAKE_REASONING_ENABLED", true)?,
                max_tokens: env_u64("FAKE_REASONING_MAX_TOKENS", 4000)? as u32,
                handling,
            },
            truncation_recovery: env_bool("TRUNCATION_RECOVERY", true)?,
            debug_mode,
        })
    }
}
