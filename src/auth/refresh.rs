// Token refresh HTTP client.
//
// Two upstream auth flows, selected per account:
//   - Kiro Desktop: POST https://prod.{region}.auth.desktop.kiro.dev/refreshToken
//     JSON body {"refreshToken": "..."}
//   - AWS SSO OIDC: POST https://oidc.{region}.amazonaws.com/token
//     JSON body with camelCase fields (the CreateToken API is JSON, not
//     form-urlencoded, despite what the OAuth RFC would suggest).

use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use crate::constants::{aws_sso_oidc_url, kiro_refresh_url, mask_secret};

/// Successful refresh result. The upstream may rotate the refresh token and
/// hand back a profile ARN; both are optional.
#[derive(Debug)]
pub struct RefreshedToken {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: i64,
    pub profile_arn: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshResponse {
    access_token: Option<String>,
    refresh_token: Option<String>,
    #[serde(default = "default_expires_in")]
    expires_in: i64,
    profile_arn: Option<String>,
}

fn default_expires_in() -> i64 {
    3600
}

#[derive(Debug, thiserror::Error)]
pub enum RefreshError {
    #[error("refresh request failed: {0}")]
    Network(String),
    #[error("refresh endpoint returned HTTP {0}")]
    Status(u16),
    #[error("refresh response missing accessToken")]
    MissingAccessToken,
}

/// Performs refresh calls against the region-scoped auth endpoints.
pub struct TokenRefresher {
    http: reqwest::Client,
    region: String,
    fingerprint: String,
}

impl TokenRefresher {
    pub fn new(http: reqwest::Client, region: String) -> Self {
        Self {
            http,
            region,
            fingerprint: crate::constants::machine_fingerprint(),
        }
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    /// Refresh through the Kiro Desktop auth endpoint.
    pub async fn refresh_desktop(&self, refresh_token: &str) -> Result<RefreshedToken, RefreshError> {
        debug!(
            "Refreshing token via Kiro Desktop Auth (token: {})",
            mask_secret(refresh_token)
        );

        let url = kiro_refresh_url(&self.region);
        let response = self
            .http
            .post(&url)
            .timeout(Duration::from_secs(30))
            .header(
                reqwest::header::USER_AGENT,
                format!("KiroIDE-0.7.45-{}", self.fingerprint),
            )
            .json(&json!({ "refreshToken": refresh_token }))
            .send()
            .await
            .map_err(|e| RefreshError::Network(e.to_string()))?;

        Self::parse_response(response).await
    }

    /// Refresh through the AWS SSO OIDC CreateToken endpoint.
    ///
    /// `sso_region` overrides the API region because kiro-cli device
    /// registrations are pinned to the region the user logged in from.
    pub async fn refresh_sso_oidc(
        &self,
        refresh_token: &str,
        client_id: &str,
        client_secret: &str,
        sso_region: Option<&str>,
    ) -> Result<RefreshedToken, RefreshError> {
        let region = sso_region.unwrap_or(&self.region);
        debug!(
            "Refreshing token via AWS SSO OIDC (region: {}, client: {})",
            region,
            mask_secret(client_id)
        );

        let url = aws_sso_oidc_url(region);
        let response = self
            .http
            .post(&url)
            .timeout(Duration::from_secs(30))
            .json(&json!({
                "grantType": "refresh_token",
                "clientId": client_id,
                "clientSecret": client_secret,
                "refreshToken": refresh_token,
            }))
            .send()
            .await
            .map_err(|e| RefreshError::Network(e.to_string()))?;

        Self::parse_response(response).await
    }

    async fn parse_response(response: reqwest::Response) -> Result<RefreshedToken, RefreshError> {
        let status = response.status();
        if !status.is_success() {
            // Body intentionally not logged: auth error bodies can echo credentials.
            return Err(RefreshError::Status(status.as_u16()));
        }

        let parsed: RefreshResponse = response
            .json()
            .await
            .map_err(|e| RefreshError::Network(e.to_string()))?;

        let access_token = parsed
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or(RefreshError::MissingAccessToken)?;

        info!("Token refreshed successfully, expires in {}s", parsed.expires_in);

        Ok(RefreshedToken {
            access_token,
            refresh_token: parsed.refresh_token,
            expires_in: parsed.expires_in,
            profile_arn: parsed.profile_arn,
        })
    }
}
