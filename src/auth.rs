// ABOUTME: TokenManager - bearer token lifecycle for the remote sync API
// ABOUTME: Logs in with credentials, caches the token until expiry, forces refresh after a 401

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use reqwest::Client;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use crate::config::ApiConfig;
use crate::error::{Result, SyncError};

const TOKEN_FIELDS: [&str; 3] = ["token", "access_token", "jwt"];
const EXPIRY_FIELDS: [&str; 3] = ["expires_in", "expiresIn", "expiry"];
const DEFAULT_TTL_SECS: i64 = 3600;

/// A bearer token and the instant after which it must not be used.
#[derive(Debug, Clone)]
pub struct AuthToken {
    pub bearer: String,
    pub expires_at: DateTime<Utc>,
}

impl AuthToken {
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// Owns the cached token. Callers hold an `Arc<TokenManager>`.
pub struct TokenManager {
    client: Client,
    login_url: String,
    username: String,
    password: String,
    cached: Mutex<Option<AuthToken>>,
}

impl TokenManager {
    pub fn new(config: &ApiConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.login_timeout())
            .build()
            .map_err(|e| SyncError::http(&config.login_url, e))?;

        Ok(Self {
            client,
            login_url: config.login_url.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
            cached: Mutex::new(None),
        })
    }

    /// Return the cached bearer while it is unexpired, otherwise log in.
    pub async fn get_token(&self) -> Result<String> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.is_valid_at(Utc::now()) {
                tracing::debug!("Using cached bearer token");
                return Ok(token.bearer.clone());
            }
            tracing::debug!("Cached bearer token expired at {}", token.expires_at);
        }

        let token = self.request_token().await?;
        let bearer = token.bearer.clone();
        *cached = Some(token);
        Ok(bearer)
    }

    /// Log in and replace the cached token.
    pub async fn login(&self) -> Result<AuthToken> {
        let mut cached = self.cached.lock().await;
        let token = self.request_token().await?;
        *cached = Some(token.clone());
        Ok(token)
    }

    /// Force a new login regardless of cache state. Used after a 401.
    pub async fn refresh_token(&self) -> Result<String> {
        tracing::info!("Refreshing bearer token");
        Ok(self.login().await?.bearer)
    }

    /// Expiry of the cached token, if any.
    pub async fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.cached.lock().await.as_ref().map(|t| t.expires_at)
    }

    async fn request_token(&self) -> Result<AuthToken> {
        tracing::info!("Logging in to {}", self.login_url);

        let response = self
            .client
            .post(&self.login_url)
            .json(&json!({
                "username": self.username,
                "password": self.password,
            }))
            .send()
            .await
            .map_err(|e| SyncError::Auth(format!("login request failed: {}", describe(&e))))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::Auth(format!(
                "login returned status {}: {}",
                status,
                crate::utils::truncate_chars(&body, 200)
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| SyncError::Auth(format!("login response is not JSON: {}", e)))?;

        let token = token_from_response(&body, Utc::now())?;
        tracing::info!("Obtained bearer token (expires {})", token.expires_at);
        Ok(token)
    }
}

fn describe(e: &reqwest::Error) -> String {
    if e.is_timeout() {
        "request timed out".to_string()
    } else {
        e.to_string()
    }
}

/// Build a token from a login response body.
///
/// The expiry comes from the first parseable hint field, then from the JWT
/// `exp` claim, then defaults to one hour from `now`.
pub fn token_from_response(body: &Value, now: DateTime<Utc>) -> Result<AuthToken> {
    let bearer = TOKEN_FIELDS
        .iter()
        .filter_map(|field| body.get(*field).and_then(Value::as_str))
        .find(|token| !token.is_empty())
        .ok_or_else(|| SyncError::Auth("no token found in login response".to_string()))?
        .to_string();

    let hinted = EXPIRY_FIELDS
        .iter()
        .filter_map(|field| body.get(*field))
        .find_map(|hint| match hint {
            Value::String(s) => parse_expiry_hint(s),
            Value::Number(n) => n.as_i64().map(ChronoDuration::seconds),
            _ => None,
        });

    let expires_at = match hinted {
        Some(ttl) => now + ttl,
        None => jwt_expiry(&bearer).unwrap_or_else(|| {
            tracing::debug!("No usable expiry hint, defaulting to one hour");
            now + ChronoDuration::seconds(DEFAULT_TTL_SECS)
        }),
    };

    Ok(AuthToken { bearer, expires_at })
}

/// Parse `"<n>s"`, `"<n>m"`, `"<n>h"`, `"<n>d"` or bare seconds.
pub fn parse_expiry_hint(hint: &str) -> Option<ChronoDuration> {
    let hint = hint.trim();
    if hint.is_empty() {
        return None;
    }

    let (digits, unit) = match hint.char_indices().last() {
        Some((idx, c)) if c.is_ascii_alphabetic() => (&hint[..idx], Some(c.to_ascii_lowercase())),
        _ => (hint, None),
    };

    let value: i64 = digits.trim().parse().ok()?;
    if value < 0 {
        return None;
    }

    match unit {
        None | Some('s') => Some(ChronoDuration::seconds(value)),
        Some('m') => Some(ChronoDuration::minutes(value)),
        Some('h') => Some(ChronoDuration::hours(value)),
        Some('d') => Some(ChronoDuration::days(value)),
        Some(_) => None,
    }
}

/// Read the `exp` claim from an unverified JWT payload.
fn jwt_expiry(token: &str) -> Option<DateTime<Utc>> {
    let payload = token.split('.').nth(1)?;
    let decoded = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: Value = serde_json::from_slice(&decoded).ok()?;
    let exp = claims.get("exp")?.as_i64()?;
    Utc.timestamp_opt(exp, 0).single()
}
