use crate::infrastructure::persistence::daily_candles::DailyCandle;
use crate::infrastructure::persistence::minute_candles::MinuteCandle;
use chrono::NaiveDateTime;
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Hold,
    Buy,
    Sell,
}

/// A strategy's decision for one tick.
#[derive(Debug, Clone)]
pub struct TradingSignal {
    pub kind: SignalKind,
    pub symbol: String,
    pub quantity: u32,
    pub reason: String,
    /// 0.0..=1.0
    pub confidence: f64,
    /// Limit-order strategies carry execution details here
    /// (limit_price, sell_price, timeout_seconds, ...).
    pub metadata: BTreeMap<String, Value>,
}

impl TradingSignal {
    pub fn hold(symbol: &str, reason: &str) -> Self {
        Self {
            kind: SignalKind::Hold,
            symbol: symbol.to_string(),
            quantity: 0,
            reason: reason.to_string(),
            confidence: 1.0,
            metadata: BTreeMap::new(),
        }
    }

    pub fn buy(symbol: &str, quantity: u32, reason: &str, confidence: f64) -> Self {
        Self {
            kind: SignalKind::Buy,
            symbol: symbol.to_string(),
            quantity,
            reason: reason.to_string(),
            confidence,
            metadata: BTreeMap::new(),
        }
    }

    pub fn sell(symbol: &str, quantity: u32, reason: &str, confidence: f64) -> Self {
        Self {
            kind: SignalKind::Sell,
            symbol: symbol.to_string(),
            quantity,
            reason: reason.to_string(),
            confidence,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: &str, value: Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }

    pub fn is_hold(&self) -> bool {
        self.kind == SignalKind::Hold
    }

    pub fn is_buy(&self) -> bool {
        self.kind == SignalKind::Buy
    }

    pub fn is_sell(&self) -> bool {
        self.kind == SignalKind::Sell
    }

    pub fn metadata_f64(&self, key: &str) -> Option<f64> {
        self.metadata.get(key).and_then(Value::as_f64)
    }

    pub fn metadata_u32(&self, key: &str) -> Option<u32> {
        self.metadata.get(key).and_then(Value::as_u64).map(|v| v as u32)
    }
}

/// Position snapshot exposed to strategies.
#[derive(Debug, Clone)]
pub struct PositionView {
    pub quantity: u32,
    pub avg_price: f64,
}

/// Everything a strategy may look at for one decision.
#[derive(Debug, Clone)]
pub struct StrategyContext {
    pub symbol: String,
    pub name: String,
    pub current_price: i64,
    pub now: NaiveDateTime,
    /// Minute bars, oldest first.
    pub minute_history: Vec<MinuteCandle>,
    /// Daily bars, oldest first (cached since start of day).
    pub daily_candles: Vec<DailyCandle>,
    pub position: Option<PositionView>,
    pub today_trade_count: u32,
}

impl StrategyContext {
    pub fn has_position(&self) -> bool {
        self.position.as_ref().is_some_and(|p| p.quantity > 0)
    }

    pub fn position_quantity(&self) -> u32 {
        self.position.as_ref().map(|p| p.quantity).unwrap_or(0)
    }

    pub fn avg_price(&self) -> f64 {
        self.position.as_ref().map(|p| p.avg_price).unwrap_or(0.0)
    }

    /// Current unrealized return in percent.
    pub fn profit_rate(&self) -> f64 {
        match &self.position {
            Some(p) if p.avg_price > 0.0 => {
                (self.current_price as f64 - p.avg_price) / p.avg_price * 100.0
            }
            _ => 0.0,
        }
    }

    /// Last `count` minute closes, oldest first.
    pub fn recent_closes(&self, count: usize) -> Vec<f64> {
        let start = self.minute_history.len().saturating_sub(count);
        self.minute_history[start..]
            .iter()
            .map(|c| c.close as f64)
            .collect()
    }

    pub fn sma(&self, period: usize) -> Option<f64> {
        let closes = self.recent_closes(period);
        if closes.len() < period {
            return None;
        }
        Some(closes.iter().sum::<f64>() / period as f64)
    }
}

/// Strategy contract.
///
/// Implementations may keep per-position state (bar counters, entry
/// prices); the host serializes calls per instance, so `&mut self` is
/// safe. `can_generate_signal` is the cheap precondition; the host skips
/// `generate_signal` when it returns false. The entry/exit hooks are
/// best-effort notifications and must not block.
pub trait Strategy: Send + Sync {
    fn strategy_name(&self) -> &str;

    /// Minute bars the host should load into the context.
    fn required_history(&self) -> usize {
        60
    }

    fn can_generate_signal(&self, ctx: &StrategyContext) -> bool;

    fn generate_signal(&mut self, ctx: &StrategyContext) -> TradingSignal;

    fn on_entry(&mut self, _ctx: &StrategyContext, _signal: &TradingSignal) {}

    fn on_exit(&mut self, _ctx: &StrategyContext, _signal: &TradingSignal) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn minute(close: i64) -> MinuteCandle {
        MinuteCandle {
            symbol: "005930".into(),
            candle_datetime: "2025-06-18 09:30".into(),
            trade_date: "20250618".into(),
            open: close,
            high: close,
            low: close,
            close,
            volume: 100,
        }
    }

    #[test]
    fn context_profit_rate() {
        let ctx = StrategyContext {
            symbol: "005930".into(),
            name: "Samsung".into(),
            current_price: 10_300,
            now: NaiveDate::from_ymd_opt(2025, 6, 18)
                .unwrap()
                .and_hms_opt(10, 0, 0)
                .unwrap(),
            minute_history: vec![minute(10_000), minute(10_100)],
            daily_candles: Vec::new(),
            position: Some(PositionView {
                quantity: 10,
                avg_price: 10_000.0,
            }),
            today_trade_count: 0,
        };
        assert!((ctx.profit_rate() - 3.0).abs() < 1e-9);
        assert_eq!(ctx.recent_closes(1), vec![10_100.0]);
        assert!(ctx.has_position());
    }

    #[test]
    fn signal_metadata_accessors() {
        let signal = TradingSignal::buy("233740", 1, "test", 0.9)
            .with_metadata("limit_price", serde_json::json!(9_990))
            .with_metadata("timeout_seconds", serde_json::json!(600));
        assert_eq!(signal.metadata_f64("limit_price"), Some(9_990.0));
        assert_eq!(signal.metadata_u32("timeout_seconds"), Some(600));
        assert_eq!(signal.metadata_f64("missing"), None);
    }
}
