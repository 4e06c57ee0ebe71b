use chrono::NaiveDateTime;
use serde_json::Value;
use std::fmt;

/// Executor phases. One instance cycles monitoring → buy → sell repeatedly
/// until the signal's lifetime expires or the cycle budget runs out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalpingState {
    Idle,
    Monitoring,
    BuyPending,
    PositionHeld,
    SellPending,
    Cooldown,
}

impl fmt::Display for ScalpingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ScalpingState::Idle => "idle",
            ScalpingState::Monitoring => "monitoring",
            ScalpingState::BuyPending => "buy_pending",
            ScalpingState::PositionHeld => "position_held",
            ScalpingState::SellPending => "sell_pending",
            ScalpingState::Cooldown => "cooldown",
        };
        write!(f, "{s}")
    }
}

/// How the monitoring phase derives a buy price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MonitorKind {
    /// Nth-percentile of the rolling tick window (default P10).
    #[default]
    Percentile,
    /// Rolling lower-boundary dip detection.
    Boundary,
}

#[derive(Debug, Clone)]
pub struct ScalpingConfig {
    pub monitor: MonitorKind,

    // Rolling window
    pub window_seconds: u32,
    pub adaptive_window: bool,
    pub max_window_seconds: u32,

    // Execution
    pub percentile_threshold: f64,
    pub sell_profit_pct: f64,
    /// Fallback order size when the buyable inquiry fails.
    pub position_size: u32,

    // Signal lifetime, relative to the signal price.
    pub stop_loss_pct: f64,
    pub take_profit_pct: f64,
    pub max_signal_minutes: u32,

    // Order management
    pub buy_timeout_seconds: u32,
    pub max_cycles: u32,
    pub cooldown_seconds: f64,
    pub min_ticks_for_trade: usize,

    // Trend gate
    pub trend_filter_enabled: bool,
    pub min_uptick_ratio: f64,

    // Boundary monitoring
    pub boundary_window_ticks: usize,
    pub max_boundary_breaches: u32,
    pub min_boundary_range_pct: f64,
    pub max_boundary_range_pct: f64,
    pub boundary_hold_seconds: f64,
}

impl Default for ScalpingConfig {
    fn default() -> Self {
        Self {
            monitor: MonitorKind::Percentile,
            window_seconds: 10,
            adaptive_window: false,
            max_window_seconds: 60,
            percentile_threshold: 10.0,
            sell_profit_pct: 0.001,
            position_size: 1,
            stop_loss_pct: 0.01,
            take_profit_pct: 0.003,
            max_signal_minutes: 60,
            buy_timeout_seconds: 10,
            max_cycles: 20,
            cooldown_seconds: 1.0,
            min_ticks_for_trade: 10,
            trend_filter_enabled: true,
            min_uptick_ratio: 0.4,
            boundary_window_ticks: 15,
            max_boundary_breaches: 5,
            min_boundary_range_pct: 0.001,
            max_boundary_range_pct: 0.0015,
            boundary_hold_seconds: 1.0,
        }
    }
}

impl ScalpingConfig {
    /// Build from a strategy's `params` map; absent keys keep defaults.
    pub fn from_params(params: &Value) -> Self {
        let mut cfg = Self::default();
        let Some(map) = params.as_object() else {
            return cfg;
        };
        let f = |key: &str, default: f64| map.get(key).and_then(Value::as_f64).unwrap_or(default);
        let u = |key: &str, default: u64| map.get(key).and_then(Value::as_u64).unwrap_or(default);
        let b = |key: &str, default: bool| map.get(key).and_then(Value::as_bool).unwrap_or(default);

        if map.get("monitor").and_then(Value::as_str) == Some("boundary") {
            cfg.monitor = MonitorKind::Boundary;
        }
        cfg.window_seconds = u("window_seconds", 10) as u32;
        cfg.adaptive_window = b("adaptive_window", false);
        cfg.max_window_seconds = u("max_window_seconds", 60) as u32;
        cfg.percentile_threshold = f("percentile_threshold", 10.0);
        cfg.sell_profit_pct = f("sell_profit_pct", 0.001);
        cfg.position_size = u("position_size", 1) as u32;
        cfg.stop_loss_pct = f("stop_loss_pct", 0.01);
        cfg.take_profit_pct = f("take_profit_pct", 0.003);
        cfg.max_signal_minutes = u("max_signal_minutes", 60) as u32;
        cfg.buy_timeout_seconds = u("buy_timeout_seconds", 10) as u32;
        cfg.max_cycles = u("max_cycles", 20) as u32;
        cfg.cooldown_seconds = f("cooldown_seconds", 1.0);
        cfg.min_ticks_for_trade = u("min_ticks_for_trade", 10) as usize;
        cfg.trend_filter_enabled = b("trend_filter_enabled", true);
        cfg.min_uptick_ratio = f("min_uptick_ratio", 0.4);
        cfg.boundary_window_ticks = u("boundary_window_ticks", 15) as usize;
        cfg.max_boundary_breaches = u("max_boundary_breaches", 5) as u32;
        cfg.min_boundary_range_pct = f("min_boundary_range_pct", 0.001);
        cfg.max_boundary_range_pct = f("max_boundary_range_pct", 0.0015);
        cfg.boundary_hold_seconds = f("boundary_hold_seconds", 1.0);
        cfg
    }
}

/// Why an active signal died.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryReason {
    TakeProfit,
    StopLoss,
    Timeout,
}

impl ExpiryReason {
    pub fn is_stop_loss(&self) -> bool {
        matches!(self, ExpiryReason::StopLoss)
    }
}

impl fmt::Display for ExpiryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpiryReason::TakeProfit => write!(f, "signal take-profit reached"),
            ExpiryReason::StopLoss => write!(f, "signal stop-loss reached"),
            ExpiryReason::Timeout => write!(f, "signal timeout"),
        }
    }
}

/// Lifetime and running statistics of one activated signal.
#[derive(Debug, Clone)]
pub struct SignalContext {
    /// Price at activation; also the ceiling for cycle entries.
    pub signal_price: i64,
    pub signal_time: NaiveDateTime,
    pub tp_pct: f64,
    pub sl_pct: f64,
    pub timeout_minutes: u32,
    pub cycle_count: u32,
    pub total_pnl: i64,
    pub total_trades: u32,
}

impl SignalContext {
    pub fn new(
        signal_price: i64,
        signal_time: NaiveDateTime,
        tp_pct: f64,
        sl_pct: f64,
        timeout_minutes: u32,
    ) -> Self {
        Self {
            signal_price,
            signal_time,
            tp_pct,
            sl_pct,
            timeout_minutes,
            cycle_count: 0,
            total_pnl: 0,
            total_trades: 0,
        }
    }

    pub fn tp_price(&self) -> i64 {
        (self.signal_price as f64 * (1.0 + self.tp_pct)) as i64
    }

    pub fn sl_price(&self) -> i64 {
        (self.signal_price as f64 * (1.0 - self.sl_pct)) as i64
    }

    /// The lifetime TP/SL/timeout kill the signal from any active state.
    pub fn expiry(&self, now: NaiveDateTime, current_price: i64) -> Option<ExpiryReason> {
        if current_price >= self.tp_price() {
            return Some(ExpiryReason::TakeProfit);
        }
        if current_price <= self.sl_price() {
            return Some(ExpiryReason::StopLoss);
        }
        let elapsed_minutes = (now - self.signal_time).num_seconds() as f64 / 60.0;
        if elapsed_minutes >= self.timeout_minutes as f64 {
            return Some(ExpiryReason::Timeout);
        }
        None
    }

    pub fn record_cycle(&mut self, pnl: i64) {
        self.cycle_count += 1;
        self.total_pnl += pnl;
        self.total_trades += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 6, 18)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    #[test]
    fn lifetime_boundaries() {
        let ctx = SignalContext::new(10_000, at(10, 0), 0.003, 0.01, 60);
        assert_eq!(ctx.tp_price(), 10_030);
        assert_eq!(ctx.sl_price(), 9_900);

        assert_eq!(ctx.expiry(at(10, 1), 10_030), Some(ExpiryReason::TakeProfit));
        assert_eq!(ctx.expiry(at(10, 1), 9_900), Some(ExpiryReason::StopLoss));
        assert_eq!(ctx.expiry(at(11, 0), 10_000), Some(ExpiryReason::Timeout));
        assert_eq!(ctx.expiry(at(10, 59), 10_000), None);
    }

    #[test]
    fn cycle_stats_accumulate() {
        let mut ctx = SignalContext::new(10_000, at(10, 0), 0.003, 0.01, 60);
        ctx.record_cycle(10);
        ctx.record_cycle(-5);
        assert_eq!(ctx.cycle_count, 2);
        assert_eq!(ctx.total_pnl, 5);
        assert_eq!(ctx.total_trades, 2);
    }

    #[test]
    fn config_from_params() {
        let params = serde_json::json!({
            "sell_profit_pct": 0.002,
            "max_cycles": 5,
            "monitor": "boundary",
            "trend_filter_enabled": false,
        });
        let cfg = ScalpingConfig::from_params(&params);
        assert_eq!(cfg.sell_profit_pct, 0.002);
        assert_eq!(cfg.max_cycles, 5);
        assert_eq!(cfg.monitor, MonitorKind::Boundary);
        assert!(!cfg.trend_filter_enabled);
        // Unset keys keep defaults.
        assert_eq!(cfg.window_seconds, 10);
    }
}
