//! Configuration loading and validation.
//!
//! Two files feed the worker:
//! - credentials at `~/KIS/config/kis_devlp.yaml` (per-mode app key/secret,
//!   account number, product code, HTS id)
//! - `trading_config.yaml` (schedule, session, notification, execution,
//!   per-symbol strategy attachments)
//!
//! Config errors abort startup; warnings are logged and tolerated.

use crate::domain::errors::ConfigError;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradingMode {
    Paper,
    Live,
}

impl FromStr for TradingMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "paper" => Ok(TradingMode::Paper),
            "live" => Ok(TradingMode::Live),
            other => Err(ConfigError::Invalid(format!(
                "invalid mode '{other}': must be 'paper' or 'live'"
            ))),
        }
    }
}

impl fmt::Display for TradingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradingMode::Paper => write!(f, "paper"),
            TradingMode::Live => write!(f, "live"),
        }
    }
}

fn default_trading_start() -> String {
    "08:50".to_string()
}
fn default_trading_end() -> String {
    "15:30".to_string()
}
fn default_interval() -> u32 {
    5
}
fn default_idle_interval() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_trading_start")]
    pub trading_start: String,
    #[serde(default = "default_trading_end")]
    pub trading_end: String,
    #[serde(default = "default_interval")]
    pub default_interval_seconds: u32,
    #[serde(default)]
    pub default_offset_seconds: u32,
    #[serde(default = "default_idle_interval")]
    pub idle_check_interval_seconds: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            trading_start: default_trading_start(),
            trading_end: default_trading_end(),
            default_interval_seconds: default_interval(),
            default_offset_seconds: 0,
            idle_check_interval_seconds: default_idle_interval(),
        }
    }
}

fn default_refresh_hours() -> u32 {
    8
}
fn default_validity_hours() -> u32 {
    24
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_refresh_hours")]
    pub token_refresh_hours_before: u32,
    #[serde(default = "default_validity_hours")]
    pub token_validity_hours: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            token_refresh_hours_before: default_refresh_hours(),
            token_validity_hours: default_validity_hours(),
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NotificationConfig {
    #[serde(default)]
    pub slack_webhook_url: Option<String>,
    #[serde(default)]
    pub slack_token: Option<String>,
    #[serde(default)]
    pub slack_channel: Option<String>,
    #[serde(default = "default_true")]
    pub enable_trade_alerts: bool,
    #[serde(default = "default_true")]
    pub enable_daily_report: bool,
}

fn default_prefetch_second() -> u32 {
    55
}
fn default_prefetch_ttl() -> u64 {
    10
}
fn default_buy_fee_rate() -> f64 {
    0.00015
}
fn default_liquidation_time() -> String {
    "15:19".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default = "default_prefetch_second")]
    pub prefetch_second: u32,
    #[serde(default = "default_prefetch_ttl")]
    pub prefetch_cache_ttl: u64,
    #[serde(default = "default_buy_fee_rate")]
    pub buy_fee_rate: f64,
    /// "HH:MM" gate for the end-of-day liquidation pass.
    #[serde(default = "default_liquidation_time")]
    pub liquidation_time: String,
    #[serde(default = "default_true")]
    pub liquidation_enabled: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            prefetch_second: default_prefetch_second(),
            prefetch_cache_ttl: default_prefetch_ttl(),
            buy_fee_rate: default_buy_fee_rate(),
            liquidation_time: default_liquidation_time(),
            liquidation_enabled: true,
        }
    }
}

fn default_allocation() -> f64 {
    100.0
}

/// One strategy attachment under a stock.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StrategyEntry {
    pub name: String,
    #[serde(default = "default_allocation")]
    pub allocation: f64,
    /// "websocket" routes the strategy through the realtime stream instead
    /// of the scheduler.
    #[serde(default)]
    pub execution_mode: Option<String>,
    #[serde(default)]
    pub win_rate: Option<f64>,
    #[serde(default)]
    pub params: Option<serde_json::Value>,
}

impl StrategyEntry {
    pub fn is_websocket(&self) -> bool {
        self.execution_mode.as_deref() == Some("websocket")
    }
}

/// Per-symbol configuration. Only this structured shape is accepted; the
/// loader rejects unknown keys rather than falling back to a loose map.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StockConfig {
    pub name: String,
    #[serde(default)]
    pub interval_seconds: Option<u32>,
    #[serde(default)]
    pub offset_seconds: Option<u32>,
    #[serde(default)]
    pub strategies: Vec<StrategyEntry>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct TradingConfigFile {
    #[serde(default)]
    schedule: Option<ScheduleConfig>,
    #[serde(default)]
    session: Option<SessionConfig>,
    #[serde(default)]
    notification: Option<NotificationConfig>,
    #[serde(default)]
    execution: Option<ExecutionConfig>,
    #[serde(default)]
    stocks: BTreeMap<String, StockConfig>,
}

/// API credentials for one mode, picked out of the shared KIS config file.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub app_key: String,
    pub app_secret: String,
    pub account_number: String,
    pub account_product_code: String,
    pub hts_id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct CredentialsFile {
    #[serde(default)]
    my_app: String,
    #[serde(default)]
    my_sec: String,
    #[serde(default)]
    paper_app: String,
    #[serde(default)]
    paper_sec: String,
    #[serde(default)]
    my_acct_stock: String,
    #[serde(default)]
    my_paper_stock: String,
    #[serde(default)]
    my_prod: Option<String>,
    #[serde(default)]
    my_htsid: String,
}

#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    fn error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    fn warning(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub mode: TradingMode,
    pub schedule: ScheduleConfig,
    pub session: SessionConfig,
    pub notification: NotificationConfig,
    pub execution: ExecutionConfig,
    pub stocks: BTreeMap<String, StockConfig>,
    pub credentials: Credentials,
    /// `~/.krxtrade` — session state, crash log, sentinel, databases.
    pub state_dir: PathBuf,
    /// Directory holding the daily token cache files.
    pub token_dir: PathBuf,
}

impl Settings {
    /// Load credentials and trading config from disk.
    pub fn load(mode: TradingMode, config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let home = home_dir()?;
        let cred_path = home.join("KIS").join("config").join("kis_devlp.yaml");
        let credentials = load_credentials(&cred_path, mode)?;

        let trading_path = match config_path {
            Some(p) => p.to_path_buf(),
            None => home.join(".krxtrade").join("trading_config.yaml"),
        };
        if !trading_path.exists() {
            return Err(ConfigError::NotFound {
                path: trading_path.display().to_string(),
            });
        }
        let raw = std::fs::read_to_string(&trading_path)?;

        Self::from_parts(mode, &raw, credentials, home)
    }

    /// Build from an in-memory YAML document. Split out of [`Self::load`] so
    /// parsing is testable without a filesystem.
    pub fn from_parts(
        mode: TradingMode,
        trading_yaml: &str,
        credentials: Credentials,
        home: PathBuf,
    ) -> Result<Self, ConfigError> {
        let file: TradingConfigFile = serde_yaml::from_str(trading_yaml)?;
        let state_dir = home.join(".krxtrade");
        let token_dir = home.join("KIS").join("config");

        Ok(Self {
            mode,
            schedule: file.schedule.unwrap_or_default(),
            session: file.session.unwrap_or_default(),
            notification: file.notification.unwrap_or_default(),
            execution: file.execution.unwrap_or_default(),
            stocks: file.stocks,
            credentials,
            state_dir,
            token_dir,
        })
    }

    pub fn is_paper(&self) -> bool {
        self.mode == TradingMode::Paper
    }

    pub fn server_url(&self) -> &'static str {
        match self.mode {
            TradingMode::Live => "https://openapi.koreainvestment.com:9443",
            TradingMode::Paper => "https://openapivts.koreainvestment.com:29443",
        }
    }

    pub fn websocket_url(&self) -> &'static str {
        match self.mode {
            TradingMode::Live => "ws://ops.koreainvestment.com:21000",
            TradingMode::Paper => "ws://ops.koreainvestment.com:31000",
        }
    }

    /// Candle store, shared across paper and live.
    pub fn market_data_db_path(&self) -> PathBuf {
        self.state_dir.join("data").join("market_data.db")
    }

    /// Orders/positions/summary store, split per mode.
    pub fn trading_db_path(&self) -> PathBuf {
        let file = match self.mode {
            TradingMode::Paper => "trading_paper.db",
            TradingMode::Live => "trading_live.db",
        };
        self.state_dir.join("data").join(file)
    }

    pub fn stock_interval(&self, symbol: &str) -> u32 {
        self.stocks
            .get(symbol)
            .and_then(|s| s.interval_seconds)
            .unwrap_or(self.schedule.default_interval_seconds)
    }

    pub fn stock_offset(&self, symbol: &str) -> u32 {
        self.stocks
            .get(symbol)
            .and_then(|s| s.offset_seconds)
            .unwrap_or(self.schedule.default_offset_seconds)
    }

    pub fn stock_name(&self, symbol: &str) -> String {
        self.stocks
            .get(symbol)
            .map(|s| s.name.clone())
            .unwrap_or_else(|| symbol.to_string())
    }

    pub fn strategy_allocation(&self, symbol: &str, strategy: &str) -> f64 {
        self.stocks
            .get(symbol)
            .and_then(|s| s.strategies.iter().find(|e| e.name == strategy))
            .map(|e| e.allocation)
            .unwrap_or(100.0)
    }

    pub fn strategy_win_rate(&self, symbol: &str, strategy: &str) -> Option<f64> {
        self.stocks
            .get(symbol)
            .and_then(|s| s.strategies.iter().find(|e| e.name == strategy))
            .and_then(|e| e.win_rate)
    }

    /// Symbols that have at least one websocket-mode strategy attached.
    pub fn websocket_symbols(&self) -> Vec<String> {
        self.stocks
            .iter()
            .filter(|(_, cfg)| cfg.strategies.iter().any(|e| e.is_websocket()))
            .map(|(code, _)| code.clone())
            .collect()
    }

    /// Validate the loaded configuration, collecting errors and warnings.
    /// `known_strategy` lets the caller check attachments against the
    /// registry built at startup.
    pub fn validate(&self, known_strategy: impl Fn(&str) -> bool) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.credentials.app_key.is_empty() {
            result.error("app_key is missing");
        } else if self.credentials.app_key.len() < 8 {
            result.warning("app_key seems too short");
        }
        if self.credentials.app_secret.is_empty() {
            result.error("app_secret is missing");
        }
        let acct = &self.credentials.account_number;
        if acct.is_empty() {
            result.error("account_number is missing");
        } else if acct.len() != 8 || !acct.chars().all(|c| c.is_ascii_digit()) {
            result.error(format!("account_number '{acct}' is not an 8-digit number"));
        }
        let prod = &self.credentials.account_product_code;
        if prod.len() != 2 || !prod.chars().all(|c| c.is_ascii_digit()) {
            result.error(format!("account_product_code '{prod}' is not a 2-digit code"));
        }

        if self.stocks.is_empty() {
            result.warning("no stocks configured");
        }
        for (code, stock) in &self.stocks {
            if code.len() != 6 || !code.chars().all(|c| c.is_ascii_digit()) {
                result.warning(format!("stock code '{code}' may be invalid (expected 6 digits)"));
            }
            if stock.strategies.is_empty() {
                result.warning(format!("stock '{code}' ({}) has no strategies", stock.name));
            }
            for entry in &stock.strategies {
                if entry.name.is_empty() {
                    result.error(format!("stock '{code}': strategy with empty name"));
                } else if !known_strategy(&entry.name) {
                    result.error(format!(
                        "stock '{code}': strategy '{}' not found in registry",
                        entry.name
                    ));
                }
                if entry.allocation <= 0.0 {
                    result.warning(format!(
                        "stock '{code}' strategy '{}': allocation is zero or negative",
                        entry.name
                    ));
                } else if entry.allocation > 100.0 {
                    result.warning(format!(
                        "stock '{code}' strategy '{}': allocation above 100% ({}%)",
                        entry.name, entry.allocation
                    ));
                }
            }
            if let Some(interval) = stock.interval_seconds {
                if interval == 0 || interval > 60 {
                    result.error(format!(
                        "stock '{code}': interval_seconds {interval} out of range 1..=60"
                    ));
                }
            }
        }

        if crate::domain::clock::parse_hhmm(&self.schedule.trading_start).is_none()
            || crate::domain::clock::parse_hhmm(&self.schedule.trading_end).is_none()
        {
            result.error("invalid trading_start or trading_end format (expected HH:MM)");
        }
        if crate::domain::clock::parse_hhmm(&self.execution.liquidation_time).is_none() {
            result.error("invalid execution.liquidation_time format (expected HH:MM)");
        }

        if self.notification.enable_trade_alerts
            && self.notification.slack_webhook_url.is_none()
            && self.notification.slack_token.is_none()
        {
            result.warning("trade alerts enabled but no Slack credentials configured");
        }

        for w in &result.warnings {
            warn!("config warning: {w}");
        }
        result
    }
}

fn home_dir() -> Result<PathBuf, ConfigError> {
    directories::BaseDirs::new()
        .map(|d| d.home_dir().to_path_buf())
        .ok_or_else(|| ConfigError::Invalid("cannot determine home directory".into()))
}

fn load_credentials(path: &Path, mode: TradingMode) -> Result<Credentials, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound {
            path: path.display().to_string(),
        });
    }
    let raw = std::fs::read_to_string(path)?;
    parse_credentials(&raw, mode)
}

fn parse_credentials(yaml: &str, mode: TradingMode) -> Result<Credentials, ConfigError> {
    let file: CredentialsFile = serde_yaml::from_str(yaml)?;
    let prod = file.my_prod.unwrap_or_else(|| "01".to_string());
    Ok(match mode {
        TradingMode::Paper => Credentials {
            app_key: file.paper_app,
            app_secret: file.paper_sec,
            account_number: file.my_paper_stock,
            account_product_code: prod,
            hts_id: file.my_htsid,
        },
        TradingMode::Live => Credentials {
            app_key: file.my_app,
            app_secret: file.my_sec,
            account_number: file.my_acct_stock,
            account_product_code: prod,
            hts_id: file.my_htsid,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
schedule:
  trading_start: "09:00"
  trading_end: "15:20"
  default_interval_seconds: 3
session:
  token_refresh_hours_before: 8
execution:
  prefetch_second: 55
  liquidation_time: "15:19"
stocks:
  "005930":
    name: Samsung Electronics
    interval_seconds: 3
    strategies:
      - name: bollinger_band
        allocation: 50
  "233740":
    name: KODEX Kosdaq150 Leverage
    offset_seconds: 2
    strategies:
      - name: scalping_range
        execution_mode: websocket
        params:
          sell_profit_pct: 0.001
"#;

    fn creds() -> Credentials {
        Credentials {
            app_key: "PSabcdefgh".into(),
            app_secret: "secret-secret".into(),
            account_number: "12345678".into(),
            account_product_code: "01".into(),
            hts_id: "user1".into(),
        }
    }

    fn settings() -> Settings {
        Settings::from_parts(TradingMode::Paper, CONFIG, creds(), PathBuf::from("/tmp")).unwrap()
    }

    #[test]
    fn parses_schedule_and_stocks() {
        let s = settings();
        assert_eq!(s.schedule.trading_start, "09:00");
        assert_eq!(s.stock_interval("005930"), 3);
        assert_eq!(s.stock_interval("233740"), 3); // default
        assert_eq!(s.stock_offset("233740"), 2);
        assert_eq!(s.strategy_allocation("005930", "bollinger_band"), 50.0);
        assert_eq!(s.websocket_symbols(), vec!["233740".to_string()]);
    }

    #[test]
    fn mode_urls_differ() {
        let paper = settings();
        assert!(paper.server_url().contains("vts"));
        let live =
            Settings::from_parts(TradingMode::Live, CONFIG, creds(), PathBuf::from("/tmp")).unwrap();
        assert!(!live.server_url().contains("vts"));
        assert!(live.trading_db_path().ends_with("data/trading_live.db"));
        assert!(paper.trading_db_path().ends_with("data/trading_paper.db"));
    }

    #[test]
    fn validation_accepts_good_config() {
        let s = settings();
        let result = s.validate(|name| matches!(name, "bollinger_band" | "scalping_range"));
        assert!(result.is_valid(), "errors: {:?}", result.errors);
    }

    #[test]
    fn validation_rejects_unknown_strategy() {
        let s = settings();
        let result = s.validate(|_| false);
        assert!(!result.is_valid());
        assert!(result.errors.iter().any(|e| e.contains("bollinger_band")));
    }

    #[test]
    fn validation_rejects_bad_account() {
        let mut s = settings();
        s.credentials.account_number = "12".into();
        let result = s.validate(|_| true);
        assert!(!result.is_valid());
    }

    #[test]
    fn loose_stock_shape_is_rejected() {
        // Legacy plain-dict lookups carried ad-hoc keys; the structured
        // schema refuses them at load time.
        let yaml = r#"
stocks:
  "005930":
    name: Samsung
    interval: 3
"#;
        let err = Settings::from_parts(TradingMode::Paper, yaml, creds(), PathBuf::from("/tmp"));
        assert!(err.is_err());
    }

    #[test]
    fn credentials_pick_mode_keys() {
        let yaml = r#"
my_app: live-key
my_sec: live-sec
paper_app: paper-key
paper_sec: paper-sec
my_acct_stock: "11111111"
my_paper_stock: "22222222"
my_prod: "01"
my_htsid: tester
"#;
        let paper = parse_credentials(yaml, TradingMode::Paper).unwrap();
        assert_eq!(paper.app_key, "paper-key");
        assert_eq!(paper.account_number, "22222222");
        let live = parse_credentials(yaml, TradingMode::Live).unwrap();
        assert_eq!(live.app_key, "live-key");
        assert_eq!(live.account_number, "11111111");
    }
}
