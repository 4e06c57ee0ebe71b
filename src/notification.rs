//! User notification surface.
//!
//! The engine talks to the [`Notifier`] trait only; formatting stays
//! deliberately thin. Failures are logged and swallowed — a dead webhook
//! must never affect trading.

use async_trait::async_trait;
use tracing::{error, info, warn};

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver one plain-text message. Everything else has a default
    /// formatting on top of this.
    async fn send_message(&self, text: &str);

    async fn notify_start(&self, mode: &str, stock_count: usize) {
        self.send_message(&format!(
            "trading worker started (mode: {mode}, stocks: {stock_count})"
        ))
        .await;
    }

    async fn notify_stop(&self) {
        self.send_message("trading worker stopped").await;
    }

    #[allow(clippy::too_many_arguments)]
    async fn notify_signal(
        &self,
        signal_type: &str,
        symbol: &str,
        name: &str,
        quantity: u32,
        price: i64,
        strategy: &str,
        reason: &str,
    ) {
        self.send_message(&format!(
            "[{signal_type}] {name}({symbol}) x{quantity} @ {price} [{strategy}] {reason}"
        ))
        .await;
    }

    #[allow(clippy::too_many_arguments)]
    async fn notify_fill(
        &self,
        side: &str,
        symbol: &str,
        name: &str,
        quantity: u32,
        price: i64,
        strategy: &str,
        pnl: i64,
        pnl_rate: f64,
    ) {
        let tail = if side == "SELL" {
            format!(" P/L {pnl:+} ({pnl_rate:+.2}%)")
        } else {
            String::new()
        };
        self.send_message(&format!(
            "[FILL {side}] {name}({symbol}) x{quantity} @ {price} [{strategy}]{tail}"
        ))
        .await;
    }

    async fn notify_error(&self, title: &str, message: &str) {
        self.send_message(&format!("[ERROR] {title}: {message}")).await;
    }

    async fn send_alert(&self, title: &str, message: &str, level: &str) {
        self.send_message(&format!("[{}] {title}\n{message}", level.to_uppercase()))
            .await;
    }

    async fn notify_daily_summary(&self, date: &str, total_trades: u32, realized_pnl: i64) {
        self.send_message(&format!(
            "daily summary {date}: {total_trades} trades, realized P/L {realized_pnl:+}"
        ))
        .await;
    }
}

/// Logs instead of delivering; the default when Slack is not configured.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send_message(&self, text: &str) {
        info!("[notify] {text}");
    }
}

/// Incoming-webhook delivery. Paper mode prefixes every message so the
/// same channel can carry both environments.
pub struct SlackNotifier {
    client: reqwest::Client,
    webhook_url: String,
    prefix: &'static str,
}

impl SlackNotifier {
    pub fn new(webhook_url: &str, is_paper: bool) -> Self {
        Self {
            client: reqwest::Client::new(),
            webhook_url: webhook_url.to_string(),
            prefix: if is_paper { "[paper] " } else { "" },
        }
    }

    /// Pick the configured notifier: Slack when a webhook is present, the
    /// log sink otherwise.
    pub fn from_settings(settings: &crate::config::Settings) -> std::sync::Arc<dyn Notifier> {
        match settings.notification.slack_webhook_url.as_deref() {
            Some(url) if settings.notification.enable_trade_alerts => {
                std::sync::Arc::new(SlackNotifier::new(url, settings.is_paper()))
            }
            _ => {
                if settings.notification.enable_trade_alerts {
                    warn!("trade alerts enabled but Slack is not configured; logging only");
                }
                std::sync::Arc::new(LogNotifier)
            }
        }
    }
}

#[async_trait]
impl Notifier for SlackNotifier {
    async fn send_message(&self, text: &str) {
        let payload = serde_json::json!({ "text": format!("{}{}", self.prefix, text) });
        match self.client.post(&self.webhook_url).json(&payload).send().await {
            Ok(res) if !res.status().is_success() => {
                error!("slack webhook returned {}", res.status());
            }
            Ok(_) => {}
            Err(e) => error!("slack webhook delivery failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::Mutex as StdMutex;

    struct Capture {
        messages: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl Notifier for Capture {
        async fn send_message(&self, text: &str) {
            self.messages.lock().unwrap().push(text.to_string());
        }
    }

    #[tokio::test]
    async fn sell_fill_carries_pnl() {
        let capture = Arc::new(Capture {
            messages: StdMutex::new(Vec::new()),
        });
        capture
            .notify_fill("SELL", "005930", "Samsung", 10, 10_300, "s1", 3_000, 3.0)
            .await;
        capture
            .notify_fill("BUY", "005930", "Samsung", 10, 10_000, "s1", 0, 0.0)
            .await;

        let messages = capture.messages.lock().unwrap().clone();
        assert!(messages[0].contains("+3000"));
        assert!(!messages[1].contains("P/L"));
    }
}
