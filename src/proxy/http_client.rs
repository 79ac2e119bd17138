// Configurable HTTP client builder.
// Builds reqwest::Client with proxy, connection pool, and timeout settings.

use std::time::Duration;

/// HTTP client configuration
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Optional proxy URL (http://, https://, socks5://)
    pub proxy_url: Option<String>,
    /// Max idle connections per host (default: 10)
    pub pool_max_idle_per_host: usize,
    /// Connection timeout (default: 30s)
    pub connect_timeout: Duration,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            proxy_url: None,
            pool_max_idle_per_host: 10,
            connect_timeout: Duration::from_secs(30),
        }
    }
}

/// Build a configured reqwest::Client from the given config.
///
/// No overall request timeout is set here: streaming responses live for
/// minutes, and stuck streams are caught by the per-read timeout in the
/// request pipeline instead.
pub fn build_http_client(config: &HttpClientConfig) -> Result<reqwest::Client, String> {
    let mut builder = reqwest::Client::builder()
        .pool_max_idle_per_host(config.pool_max_idle_per_host)
        .connect_timeout(config.connect_timeout);

    if let Some(proxy_url) = &config.proxy_url {
        if !proxy_url.is_empty() {
            let proxy = reqwest::Proxy::all(proxy_url)
                .map_err(|e| format!("invalid proxy URL: {}", e))?;
            builder = builder.proxy(proxy);
        }
    }

    builder.build().map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = HttpClientConfig::default();
        assert!(config.proxy_url.is_none());
        assert_eq!(config.pool_max_idle_per_host, 10);
        assert_eq!(config.connect_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_build_client_default() {
        let config = HttpClientConfig::default();
        assert!(build_http_client(&config).is_ok());
    }

    #[test]
    fn test_build_client_with_socks_proxy() {
        let config = HttpClientConfig {
            proxy_url: Some("socks5://127.0.0.1:1080".to_string()),
            ..Default::default()
        };
        assert!(build_http_client(&config).is_ok());
    }

    #[test]
    fn test_build_client_rejects_garbage_proxy() {
        let config = HttpClientConfig {
            proxy_url: Some("::not a url::".to_string()),
            ..Default::default()
        };
        assert!(build_http_client(&config).is_err());
    }
}
