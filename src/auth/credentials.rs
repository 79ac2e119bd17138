// Credential discovery.
//
// Refresh tokens arrive from one of four places, checked in order:
//   1. REFRESH_TOKEN        — single token or comma-separated list
//   2. REFRESH_TOKEN<N>     — numbered variants (REFRESH_TOKEN1, REFRESH_TOKEN2, ...)
//   3. KIRO_CREDS_FILE      — Kiro Desktop / kiro-cli JSON credentials file
//   4. KIRO_CLI_DB_FILE     — kiro-cli SQLite database (auth_kv table)
//
// A credential carrying a clientId/clientSecret pair is refreshed through the
// AWS SSO OIDC endpoint instead of the Kiro Desktop one.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::constants::{SQLITE_REGISTRATION_KEYS, SQLITE_TOKEN_KEYS};

/// One configured account, before it becomes a live pool record.
pub struct CredentialSource {
    pub refresh_token: Zeroizing<String>,
    pub access_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub client_id: Option<String>,
    pub client_secret: Option<Zeroizing<String>>,
    pub profile_arn: Option<String>,
    /// SSO region for the OIDC refresh endpoint; may differ from the API region.
    pub sso_region: Option<String>,
}

impl CredentialSource {
    fn from_bare_token(token: String) -> Self {
        Self {
            refresh_token: Zeroizing::new(token),
            access_token: None,
            expires_at: None,
            client_id: None,
            client_secret: None,
            profile_arn: None,
            sso_region: None,
        }
    }

    /// Whether this credential refreshes through AWS SSO OIDC.
    pub fn is_sso(&self) -> bool {
        self.client_id.is_some() && self.client_secret.is_some()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("no refresh tokens configured (set REFRESH_TOKEN, REFRESH_TOKEN<N>, KIRO_CREDS_FILE or KIRO_CLI_DB_FILE)")]
    NoTokens,
    #[error("failed to read credentials file {0}: {1}")]
    File(String, String),
    #[error("failed to read credentials database {0}: {1}")]
    Sqlite(String, String),
}

/// Kiro Desktop / kiro-cli JSON credentials file shape.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CredsFile {
    refresh_token: Option<String>,
    access_token: Option<String>,
    client_id: Option<String>,
    client_secret: Option<String>,
    profile_arn: Option<String>,
    region: Option<String>,
    expires_at: Option<String>,
}

fn parse_expiry(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn load_from_file(path: &str) -> Result<CredentialSource, CredentialError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| CredentialError::File(path.to_string(), e.to_string()))?;
    let parsed: CredsFile = serde_json::from_str(&raw)
        .map_err(|e| CredentialError::File(path.to_string(), e.to_string()))?;

    let refresh_token = parsed
        .refresh_token
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| {
            CredentialError::File(path.to_string(), "missing refreshToken".to_string())
        })?;

    info!("Credentials loaded from {}", path);

    Ok(CredentialSource {
        refresh_token: Zeroizing::new(refresh_token),
        access_token: parsed.access_token,
        expires_at: parsed.expires_at.as_deref().and_then(parse_expiry),
        client_id: parsed.client_id,
        client_secret: parsed.client_secret.map(Zeroizing::new),
        profile_arn: parsed.profile_arn,
        sso_region: parsed.region,
    })
}

/// Value stored under the token keys in kiro-cli's auth_kv table.
#[derive(Deserialize)]
struct SqliteToken {
    access_token: Option<String>,
    refresh_token: Option<String>,
    profile_arn: Option<String>,
    region: Option<String>,
    expires_at: Option<String>,
}

#[derive(Deserialize)]
struct SqliteRegistration {
    client_id: Option<String>,
    client_secret: Option<String>,
    region: Option<String>,
}

fn load_from_sqlite(path: &str) -> Result<CredentialSource, CredentialError> {
    let conn = rusqlite::Connection::open_with_flags(
        path,
        rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY,
    )
    .map_err(|e| CredentialError::Sqlite(path.to_string(), e.to_string()))?;

    let fetch = |key: &str| -> Option<String> {
        conn.query_row("SELECT value FROM auth_kv WHERE key = ?1", [key], |row| {
            row.get::<_, String>(0)
        })
        .ok()
    };

    let mut token: Option<SqliteToken> = None;
    for &key in SQLITE_TOKEN_KEYS {
        if let Some(raw) = fetch(key) {
            match serde_json::from_str(&raw) {
                Ok(parsed) => {
                    debug!("Loaded credentials from SQLite key: {}", key);
                    token = Some(parsed);
                    break;
                }
                Err(e) => warn!("Unparseable token entry under {}: {}", key, e),
            }
        }
    }

    let token = token.ok_or_else(|| {
        CredentialError::Sqlite(path.to_string(), "no token entry in auth_kv".to_string())
    })?;
    let refresh_token = token
        .refresh_token
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| {
            CredentialError::Sqlite(path.to_string(), "token entry has no refresh_token".into())
        })?;

    let mut registration: Option<SqliteRegistration> = None;
    for &key in SQLITE_REGISTRATION_KEYS {
        if let Some(raw) = fetch(key) {
            if let Ok(parsed) = serde_json::from_str(&raw) {
                debug!("Loaded device registration from SQLite key: {}", key);
                registration = Some(parsed);
                break;
            }
        }
    }

    let sso_region = token
        .region
        .or_else(|| registration.as_ref().and_then(|r| r.region.clone()));

    info!("Credentials loaded from SQLite database: {}", path);

    Ok(CredentialSource {
        refresh_token: Zeroizing::new(refresh_token),
        access_token: token.access_token,
        expires_at: token.expires_at.as_deref().and_then(parse_expiry),
        client_id: registration.as_ref().and_then(|r| r.client_id.clone()),
        client_secret: registration
            .and_then(|r| r.client_secret)
            .map(Zeroizing::new),
        profile_arn: token.profile_arn,
        sso_region,
    })
}

/// Collect all configured credentials from the environment.
pub fn load_credentials() -> Result<Vec<CredentialSource>, CredentialError> {
    let mut sources = Vec::new();

    if let Ok(raw) = std::env::var("REFRESH_TOKEN") {
        for token in raw.split(',') {
            let token = token.trim();
            if !token.is_empty() {
                sources.push(CredentialSource::from_bare_token(token.to_string()));
            }
        }
    }

    // Numbered variants: REFRESH_TOKEN1, REFRESH_TOKEN2, ... stop at first gap.
    for n in 1u32.. {
        match std::env::var(format!("REFRESH_TOKEN{}", n)) {
            Ok(raw) if !raw.trim().is_empty() => {
                sources.push(CredentialSource::from_bare_token(raw.trim().to_string()));
            }
            _ => break,
        }
    }

    if let Ok(path) = std::env::var("KIRO_CREDS_FILE") {
        if !path.trim().is_empty() {
            sources.push(load_from_file(path.trim())?);
        }
    }

    if let Ok(path) = std::env::var("KIRO_CLI_DB_FILE") {
        if !path.trim().is_empty() {
            sources.push(load_from_sqlite(path.trim())?);
        }
    }

    if sources.is_empty() {
        return Err(CredentialError::NoTokens);
    }

    info!("Loaded {} account credential(s)", sources.len());
    Ok(sources)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_token_source_is_desktop_auth() {
        let src = CredentialSource::from_bare_token("rt-abc".to_string());
        assert!(!src.is_sso());
        assert_eq!(src.refresh_token.as_str(), "rt-abc");
    }

    #[test]
    fn sso_detection_requires_both_halves() {
        let mut src = CredentialSource::from_bare_token("rt".to_string());
        src.client_id = Some("cid".to_string());
        assert!(!src.is_sso());
        src.client_secret = Some(Zeroizing::new("cs".to_string()));
        assert!(src.is_sso());
    }

    #[test]
    fn creds_file_roundtrip() {
        let dir = std::env::temp_dir();
        let path = dir.join("kiro-bridge-test-creds.json");
        std::fs::write(
            &path,
            r#"{"refreshToken":"rt-1","accessToken":"at-1","profileArn":"arn:aws:x","region":"eu-west-1","expiresAt":"2030-01-01T00:00:00Z"}"#,
        )
        .unwrap();

        let src = load_from_file(path.to_str().unwrap()).unwrap();
        assert_eq!(src.refresh_token.as_str(), "rt-1");
        assert_eq!(src.access_token.as_deref(), Some("at-1"));
        assert_eq!(src.profile_arn.as_deref(), Some("arn:aws:x"));
        assert_eq!(src.sso_region.as_deref(), Some("eu-west-1"));
        assert!(src.expires_at.is_some());

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn creds_file_without_refresh_token_rejected() {
        let dir = std::env::temp_dir();
        let path = dir.join("kiro-bridge-test-creds-empty.json");
        std::fs::write(&path, r#"{"accessToken":"at-1"}"#).unwrap();

        assert!(load_from_file(path.to_str().unwrap()).is_err());
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn sqlite_db_roundtrip() {
        let dir = std::env::temp_dir();
        let path = dir.join("kiro-bridge-test-creds.sqlite");
        std::fs::remove_file(&path).ok();

        let conn = rusqlite::Connection::open(&path).unwrap();
        conn.execute("CREATE TABLE auth_kv (key TEXT PRIMARY KEY, value TEXT)", [])
            .unwrap();
        conn.execute(
            "INSERT INTO auth_kv (key, value) VALUES (?1, ?2)",
            rusqlite::params![
                "kirocli:odic:token",
                r#"{"access_token":"at-2","refresh_token":"rt-2","region":"us-west-2"}"#
            ],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO auth_kv (key, value) VALUES (?1, ?2)",
            rusqlite::params![
                "kirocli:odic:device-registration",
                r#"{"client_id":"cid-2","client_secret":"cs-2"}"#
            ],
        )
        .unwrap();
        drop(conn);

        let src = load_from_sqlite(path.to_str().unwrap()).unwrap();
        assert_eq!(src.refresh_token.as_str(), "rt-2");
        assert!(src.is_sso());
        assert_eq!(src.sso_region.as_deref(), Some("us-west-2"));

        std::fs::remove_file(&path).ok();
    }
}
