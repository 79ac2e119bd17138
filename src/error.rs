use axum::http::StatusCode;
use thiserror::Error;

/// Gateway error taxonomy surfaced to clients.
///
/// Every variant maps to one HTTP status and is rendered in the dialect of
/// the request that triggered it (see `proxy::common::errors`).
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid request: {0}")]
    BadRequest(String),

    #[error("unknown model: {0}")]
    UnknownModel(String),

    #[error("no healthy accounts available")]
    NoCapacity,

    #[error("upstream returned {status}: {message}")]
    Upstream { status: u16, message: String },

    #[error("upstream timed out before first byte")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),

    #[error("stream protocol error: {0}")]
    Protocol(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) | Self::UnknownModel(_) => StatusCode::BAD_REQUEST,
            Self::NoCapacity => StatusCode::SERVICE_UNAVAILABLE,
            Self::Upstream { .. } | Self::Network(_) => StatusCode::BAD_GATEWAY,
            Self::Timeout => StatusCode::GATEWAY_TIMEOUT,
            Self::Protocol(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// OpenAI-style `error.type` string.
    pub fn openai_type(&self) -> &'static str {
        match self {
            Self::BadRequest(_) | Self::UnknownModel(_) => "invalid_request_error",
            Self::NoCapacity => "overloaded_error",
            Self::Upstream { .. } | Self::Network(_) | Self::Timeout => "api_error",
            Self::Protocol(_) | Self::Internal(_) => "internal_error",
        }
    }

    /// Anthropic-style `error.type` string.
    pub fn anthropic_type(&self) -> &'static str {
        match self {
            Self::BadRequest(_) | Self::UnknownModel(_) => "invalid_request_error",
            Self::NoCapacity => "overloaded_error",
            Self::Upstream { .. } | Self::Network(_) | Self::Timeout => "api_error",
            Self::Protocol(_) | Self::Internal(_) => "api_error",
        }
    }
}

/// Classification of one upstream call outcome, used by the retry driver to
/// decide between failover, transparent retry, and surfacing the error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamOutcome {
    Ok,
    AuthExpired,
    RateLimited,
    ServerRetryable,
    ServerFatal,
    NetworkRetryable,
    Canceled,
}

impl UpstreamOutcome {
    pub fn from_status(status: u16) -> Self {
        match status {
            200..=299 => Self::Ok,
            401 | 403 => Self::AuthExpired,
            429 => Self::RateLimited,
            500 | 502 | 503 | 504 => Self::ServerRetryable,
            _ => Self::ServerFatal,
        }
    }
}
