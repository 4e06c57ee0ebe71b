use thiserror::Error;

/// Errors surfaced by the broker gateway.
///
/// The gateway absorbs transport noise (retry with backoff) and auth expiry
/// (forced re-authentication); everything that still comes out of it is one
/// of these.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker rejected order: {message}")]
    OrderRejected { message: String },

    #[error("broker API error {code}: {message}")]
    Api { code: String, message: String },

    #[error("authentication failed: {reason}")]
    AuthFailed { reason: String },

    #[error("rate limit exceeded after {attempts} attempts")]
    RateLimited { attempts: u32 },

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("malformed broker response: {reason}")]
    MalformedResponse { reason: String },
}

impl BrokerError {
    /// Broker codes that mean the access token expired mid-session. The
    /// gateway re-authenticates once and retries before returning these.
    pub fn is_auth_expired(code: &str) -> bool {
        matches!(code, "OPSQ0013" | "EGW00121" | "EGW00123")
    }

    /// Transient account-validation codes that resolve on a plain retry.
    pub fn is_transient(code: &str) -> bool {
        code == "OPSQ2000"
    }
}

/// Configuration problems. These abort startup; nothing else does.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {path}")]
    NotFound { path: String },

    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
