//! Authenticated KIS REST session.
//!
//! Owns the OAuth token lifecycle (issue, per-day file cache, auto-refresh
//! ahead of expiry) and the shared request path every broker call goes
//! through: bearer + app-key headers, paper-mode TR-id rewriting, rate-limit
//! pacing and transport retry with exponential backoff.

use crate::config::Settings;
use crate::domain::errors::BrokerError;
use chrono::{Duration as ChronoDuration, Local, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const TOKEN_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const MAX_RETRIES: u32 = 3;
const BASE_DELAY: Duration = Duration::from_secs(1);
const MAX_DELAY: Duration = Duration::from_secs(10);
const NETWORK_TIMEOUT: Duration = Duration::from_secs(30);

/// Decoded REST response. `rt_cd == "0"` means business-level success;
/// anything else carries a broker error code in `msg_cd`.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub body: serde_json::Value,
}

impl ApiResponse {
    pub fn is_ok(&self) -> bool {
        self.body.get("rt_cd").and_then(|v| v.as_str()) == Some("0")
    }

    pub fn error_code(&self) -> String {
        self.body
            .get("msg_cd")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string()
    }

    pub fn error_message(&self) -> String {
        self.body
            .get("msg1")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .trim()
            .to_string()
    }

    pub fn output(&self) -> &serde_json::Value {
        self.body.get("output").unwrap_or(&serde_json::Value::Null)
    }

    pub fn field(&self, name: &str) -> &serde_json::Value {
        self.body.get(name).unwrap_or(&serde_json::Value::Null)
    }

    pub fn as_api_error(&self) -> BrokerError {
        BrokerError::Api {
            code: self.error_code(),
            message: self.error_message(),
        }
    }
}

#[derive(Debug, Clone)]
struct Token {
    access_token: String,
    expires_at: NaiveDateTime,
}

#[derive(Debug, Serialize, Deserialize)]
struct TokenCache {
    token: String,
    #[serde(rename = "valid-date")]
    valid_date: String,
}

pub struct SessionManager {
    client: reqwest::Client,
    server_url: String,
    app_key: String,
    app_secret: String,
    account_number: String,
    account_product: String,
    is_paper: bool,
    token_dir: PathBuf,
    refresh_hours: u32,
    pacing: Duration,
    token: RwLock<Option<Token>>,
    token_valid: AtomicBool,
}

impl SessionManager {
    pub fn new(settings: &Settings) -> Result<Self, BrokerError> {
        let client = reqwest::Client::builder()
            .timeout(NETWORK_TIMEOUT)
            .build()?;
        // Paper servers throttle far harder than live.
        let pacing = if settings.is_paper() {
            Duration::from_millis(500)
        } else {
            Duration::from_millis(50)
        };
        Ok(Self {
            client,
            server_url: settings.server_url().to_string(),
            app_key: settings.credentials.app_key.clone(),
            app_secret: settings.credentials.app_secret.clone(),
            account_number: settings.credentials.account_number.clone(),
            account_product: settings.credentials.account_product_code.clone(),
            is_paper: settings.is_paper(),
            token_dir: settings.token_dir.clone(),
            refresh_hours: settings.session.token_refresh_hours_before,
            pacing,
            token: RwLock::new(None),
            token_valid: AtomicBool::new(false),
        })
    }

    pub fn account_info(&self) -> (&str, &str) {
        (&self.account_number, &self.account_product)
    }

    /// Pause between calls to stay inside the broker's rate limit.
    pub async fn smart_sleep(&self) {
        tokio::time::sleep(self.pacing).await;
    }

    /// Authenticate, reusing a still-valid cached token when one exists.
    pub async fn authenticate(&self) -> Result<(), BrokerError> {
        if let Some(cached) = self.read_cached_token() {
            let remaining = cached.expires_at - Local::now().naive_local();
            info!(
                "using cached token (expires {}, remaining {}h)",
                cached.expires_at,
                remaining.num_hours()
            );
            *self.token.write().await = Some(cached);
            self.token_valid.store(true, Ordering::SeqCst);
            return Ok(());
        }
        self.request_new_token().await?;
        self.token_valid.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Drop the current token and issue a fresh one. Used when the broker
    /// reports an auth-expired error code mid-session.
    pub async fn force_reauthenticate(&self) -> bool {
        match self.request_new_token().await {
            Ok(()) => {
                self.token_valid.store(true, Ordering::SeqCst);
                true
            }
            Err(e) => {
                error!("forced re-authentication failed: {e}");
                self.token_valid.store(false, Ordering::SeqCst);
                false
            }
        }
    }

    pub fn is_token_valid(&self) -> bool {
        self.token_valid.load(Ordering::SeqCst)
    }

    fn token_file_path(&self) -> PathBuf {
        let mode = if self.is_paper { "paper" } else { "prod" };
        let day = Local::now().format("%Y%m%d");
        self.token_dir.join(format!("KIS_{mode}_{day}"))
    }

    fn read_cached_token(&self) -> Option<Token> {
        let path = self.token_file_path();
        let raw = std::fs::read_to_string(&path).ok()?;
        let cache: TokenCache = serde_yaml::from_str(&raw).ok()?;
        let expires_at = NaiveDateTime::parse_from_str(&cache.valid_date, TOKEN_TIME_FORMAT).ok()?;
        if expires_at <= Local::now().naive_local() {
            return None;
        }
        Some(Token {
            access_token: cache.token,
            expires_at,
        })
    }

    fn save_token(&self, token: &Token) {
        let cache = TokenCache {
            token: token.access_token.clone(),
            valid_date: token.expires_at.format(TOKEN_TIME_FORMAT).to_string(),
        };
        let path = self.token_file_path();
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match serde_yaml::to_string(&cache) {
            Ok(body) => {
                if let Err(e) = std::fs::write(&path, body) {
                    warn!("failed to cache token to {}: {e}", path.display());
                }
            }
            Err(e) => warn!("failed to serialize token cache: {e}"),
        }
    }

    async fn request_new_token(&self) -> Result<(), BrokerError> {
        let url = format!("{}/oauth2/tokenP", self.server_url);
        let payload = serde_json::json!({
            "grant_type": "client_credentials",
            "appkey": self.app_key,
            "appsecret": self.app_secret,
        });

        let masked = mask_key(&self.app_key);
        info!("requesting access token (server {}, appkey {masked})", self.server_url);

        let res = self.client.post(&url).json(&payload).send().await?;
        if !res.status().is_success() {
            let status = res.status();
            let text = res.text().await.unwrap_or_default();
            return Err(BrokerError::AuthFailed {
                reason: format!("token issue failed: {status} {text}"),
            });
        }

        #[derive(Deserialize)]
        struct TokenResponse {
            access_token: String,
            access_token_token_expired: String,
        }

        let parsed: TokenResponse =
            res.json().await.map_err(|e| BrokerError::AuthFailed {
                reason: format!("malformed token response: {e}"),
            })?;
        let expires_at =
            NaiveDateTime::parse_from_str(&parsed.access_token_token_expired, TOKEN_TIME_FORMAT)
                .map_err(|e| BrokerError::AuthFailed {
                    reason: format!("unparseable token expiry: {e}"),
                })?;

        let token = Token {
            access_token: parsed.access_token,
            expires_at,
        };
        self.save_token(&token);
        info!("access token issued (expires {})", token.expires_at);
        *self.token.write().await = Some(token);
        Ok(())
    }

    /// WebSocket approval key for the realtime streams.
    pub async fn approval_key(&self) -> Result<String, BrokerError> {
        let url = format!("{}/oauth2/Approval", self.server_url);
        let payload = serde_json::json!({
            "grant_type": "client_credentials",
            "appkey": self.app_key,
            "secretkey": self.app_secret,
        });
        let res = self.client.post(&url).json(&payload).send().await?;
        if !res.status().is_success() {
            return Err(BrokerError::AuthFailed {
                reason: format!("approval key request failed: {}", res.status()),
            });
        }
        let body: serde_json::Value = res.json().await?;
        body.get("approval_key")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| BrokerError::AuthFailed {
                reason: "approval key missing from response".into(),
            })
    }

    /// Background token refresh: checks every minute and re-issues the token
    /// once it is within `refresh_hours` of expiry, retrying at 5/10/20s.
    pub fn spawn_refresh_task(
        self: &std::sync::Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let session = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            debug!("token refresh task stopping");
                            return;
                        }
                    }
                }
                let expires_at = session.token.read().await.as_ref().map(|t| t.expires_at);
                let Some(expires_at) = expires_at else { continue };
                let threshold = ChronoDuration::hours(session.refresh_hours as i64);
                if expires_at - Local::now().naive_local() > threshold {
                    continue;
                }
                info!("token refresh triggered (expires {expires_at})");
                let mut refreshed = false;
                for (attempt, delay) in [5u64, 10, 20].iter().enumerate() {
                    if session.force_reauthenticate().await {
                        refreshed = true;
                        break;
                    }
                    warn!("token refresh attempt {} failed, retrying in {delay}s", attempt + 1);
                    tokio::time::sleep(Duration::from_secs(*delay)).await;
                }
                if !refreshed && !session.force_reauthenticate().await {
                    error!("token refresh failed after retries; API calls will degrade");
                }
            }
        })
    }

    /// Shared request path. Transport errors, 429 and 5xx retry with
    /// exponential backoff; any 200 is decoded and returned for the caller
    /// to inspect `rt_cd`.
    pub async fn url_fetch(
        &self,
        api_url: &str,
        tr_id: &str,
        params: &serde_json::Value,
        post: bool,
    ) -> Result<ApiResponse, BrokerError> {
        let url = format!("{}{}", self.server_url, api_url);
        let actual_tr_id = self.rewrite_tr_id(tr_id);
        let bearer = {
            let guard = self.token.read().await;
            guard
                .as_ref()
                .map(|t| format!("Bearer {}", t.access_token))
                .unwrap_or_default()
        };

        let mut last_status = 0u16;
        for attempt in 0..=MAX_RETRIES {
            let request = if post {
                self.client.post(&url).json(params)
            } else {
                let query: Vec<(String, String)> = params
                    .as_object()
                    .map(|m| {
                        m.iter()
                            .map(|(k, v)| {
                                let value = match v {
                                    serde_json::Value::String(s) => s.clone(),
                                    other => other.to_string(),
                                };
                                (k.clone(), value)
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                self.client.get(&url).query(&query)
            };

            let result = request
                .header("authorization", &bearer)
                .header("appkey", &self.app_key)
                .header("appsecret", &self.app_secret)
                .header("tr_id", &actual_tr_id)
                .header("custtype", "P")
                .header("tr_cont", "")
                .send()
                .await;

            match result {
                Ok(res) => {
                    let status = res.status();
                    if status.is_success() {
                        let body: serde_json::Value =
                            res.json().await.map_err(|e| BrokerError::MalformedResponse {
                                reason: e.to_string(),
                            })?;
                        return Ok(ApiResponse { body });
                    }
                    last_status = status.as_u16();
                    if status.as_u16() == 429 || status.is_server_error() {
                        if attempt < MAX_RETRIES {
                            let delay = backoff_delay(attempt);
                            warn!(
                                "HTTP {status} on {api_url}, attempt {}/{}, retrying in {:?}",
                                attempt + 1,
                                MAX_RETRIES + 1,
                                delay
                            );
                            tokio::time::sleep(delay).await;
                            continue;
                        }
                        if status.as_u16() == 429 {
                            return Err(BrokerError::RateLimited {
                                attempts: MAX_RETRIES + 1,
                            });
                        }
                        let text = res.text().await.unwrap_or_default();
                        return Err(BrokerError::Api {
                            code: status.as_u16().to_string(),
                            message: text,
                        });
                    }
                    let text = res.text().await.unwrap_or_default();
                    return Err(BrokerError::Api {
                        code: status.as_u16().to_string(),
                        message: text,
                    });
                }
                Err(e) if (e.is_timeout() || e.is_connect()) && attempt < MAX_RETRIES => {
                    let delay = backoff_delay(attempt);
                    warn!(
                        "transport error on {api_url} ({e}), attempt {}/{}, retrying in {:?}",
                        attempt + 1,
                        MAX_RETRIES + 1,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(BrokerError::Transport(e)),
            }
        }

        Err(BrokerError::Api {
            code: last_status.to_string(),
            message: "retries exhausted".into(),
        })
    }

    /// Paper environment rewrites leading T/J/C TR identifiers to V.
    fn rewrite_tr_id(&self, tr_id: &str) -> String {
        if self.is_paper {
            if let Some(first) = tr_id.chars().next() {
                if matches!(first, 'T' | 'J' | 'C') {
                    return format!("V{}", &tr_id[1..]);
                }
            }
        }
        tr_id.to_string()
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    let exp = BASE_DELAY.saturating_mul(2u32.saturating_pow(attempt));
    exp.min(MAX_DELAY)
}

fn mask_key(key: &str) -> String {
    if key.len() > 8 {
        format!("{}...{}", &key[..4], &key[key.len() - 4..])
    } else {
        "***".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Credentials, Settings, TradingMode};
    use std::path::PathBuf;

    fn paper_session() -> SessionManager {
        let settings = Settings::from_parts(
            TradingMode::Paper,
            "stocks: {}",
            Credentials {
                app_key: "PSabcdefghij".into(),
                app_secret: "s".into(),
                account_number: "12345678".into(),
                account_product_code: "01".into(),
                hts_id: "".into(),
            },
            PathBuf::from("/tmp"),
        )
        .unwrap();
        SessionManager::new(&settings).unwrap()
    }

    #[test]
    fn paper_tr_id_rewrite() {
        let session = paper_session();
        assert_eq!(session.rewrite_tr_id("TTTC0802U"), "VTTC0802U");
        assert_eq!(session.rewrite_tr_id("JTTT1002U"), "VTTT1002U");
        assert_eq!(session.rewrite_tr_id("CTSC0008U"), "VTSC0008U");
        // Quote TR ids are shared between environments.
        assert_eq!(session.rewrite_tr_id("FHKST01010100"), "FHKST01010100");
    }

    #[test]
    fn backoff_is_capped() {
        assert_eq!(backoff_delay(0), Duration::from_secs(1));
        assert_eq!(backoff_delay(1), Duration::from_secs(2));
        assert_eq!(backoff_delay(2), Duration::from_secs(4));
        assert_eq!(backoff_delay(5), Duration::from_secs(10));
    }

    #[test]
    fn key_masking() {
        assert_eq!(mask_key("PSabcdefghij"), "PSab...ghij");
        assert_eq!(mask_key("short"), "***");
    }

    #[test]
    fn api_response_error_accessors() {
        let res = ApiResponse {
            body: serde_json::json!({"rt_cd": "1", "msg_cd": "EGW00123", "msg1": " expired "}),
        };
        assert!(!res.is_ok());
        assert_eq!(res.error_code(), "EGW00123");
        assert_eq!(res.error_message(), "expired");
    }
}
