use crate::strategies::traits::{Strategy, StrategyContext, TradingSignal};
use chrono::{NaiveDateTime, NaiveTime, Timelike};
use serde_json::Value;
use tracing::{debug, info};

/// Signal generator for the websocket scalping path.
///
/// Emits a buy signal when the price dips below the open of the current
/// N-minute bar inside the operating window; the actual buying and
/// selling is the scalping executor's job, so this strategy carries the
/// executor's lifetime parameters in the signal metadata and has no exit
/// logic of its own.
pub struct ScalpingRangeStrategy {
    name: String,
    window_start: NaiveTime,
    window_end: NaiveTime,
    timeframe_minutes: u32,
    dip_threshold: f64,
    position_size: u32,
    // Forwarded to the executor via metadata.
    sell_profit_pct: f64,
    stop_loss_pct: f64,
    take_profit_pct: f64,
    max_signal_minutes: u32,
}

impl ScalpingRangeStrategy {
    pub fn from_params(name: &str, params: &Value) -> Self {
        let f = |key: &str, default: f64| {
            params.get(key).and_then(Value::as_f64).unwrap_or(default)
        };
        let u = |key: &str, default: u64| {
            params.get(key).and_then(Value::as_u64).unwrap_or(default)
        };
        let t = |key: &str, default: (u32, u32)| {
            params
                .get(key)
                .and_then(Value::as_str)
                .and_then(crate::domain::clock::parse_hhmm)
                .unwrap_or_else(|| NaiveTime::from_hms_opt(default.0, default.1, 0).unwrap_or_default())
        };
        Self {
            name: name.to_string(),
            window_start: t("trading_start", (9, 5)),
            window_end: t("trading_end", (15, 15)),
            timeframe_minutes: (u("timeframe_minutes", 3) as u32).max(1),
            dip_threshold: f("dip_threshold_pct", 0.2) / 100.0,
            position_size: u("position_size", 1) as u32,
            sell_profit_pct: f("sell_profit_pct", 0.001),
            stop_loss_pct: f("stop_loss_pct", 0.01),
            take_profit_pct: f("take_profit_pct", 0.003),
            max_signal_minutes: u("max_signal_minutes", 60) as u32,
        }
    }

    fn in_window(&self, now: NaiveDateTime) -> bool {
        let t = now.time();
        t >= self.window_start && t <= self.window_end
    }

    fn candle_start(&self, now: NaiveDateTime) -> NaiveDateTime {
        let bucket = (now.minute() / self.timeframe_minutes) * self.timeframe_minutes;
        now.date()
            .and_hms_opt(now.hour(), bucket, 0)
            .unwrap_or(now)
    }

    fn bar_open(&self, ctx: &StrategyContext, candle_start: NaiveDateTime) -> f64 {
        let start_key = candle_start.format("%Y-%m-%d %H:%M").to_string();
        let end_key = (candle_start
            + chrono::Duration::minutes(self.timeframe_minutes as i64))
        .format("%Y-%m-%d %H:%M")
        .to_string();
        ctx.minute_history
            .iter()
            .filter(|c| c.candle_datetime >= start_key && c.candle_datetime < end_key)
            .min_by(|a, b| a.candle_datetime.cmp(&b.candle_datetime))
            .map(|c| c.open as f64)
            .unwrap_or(ctx.current_price as f64)
    }
}

impl Strategy for ScalpingRangeStrategy {
    fn strategy_name(&self) -> &str {
        &self.name
    }

    fn required_history(&self) -> usize {
        (self.timeframe_minutes as usize).max(5)
    }

    fn can_generate_signal(&self, ctx: &StrategyContext) -> bool {
        // The executor manages its own inventory, so no position gate.
        self.in_window(ctx.now)
    }

    fn generate_signal(&mut self, ctx: &StrategyContext) -> TradingSignal {
        if !self.in_window(ctx.now) {
            return TradingSignal::hold(&ctx.symbol, "outside operating window");
        }

        let candle_start = self.candle_start(ctx.now);
        let open = self.bar_open(ctx, candle_start);
        if open <= 0.0 {
            return TradingSignal::hold(&ctx.symbol, "no bar open");
        }

        let dip_rate = (open - ctx.current_price as f64) / open;
        if dip_rate < self.dip_threshold {
            debug!(
                "[{}][{}] dip {:.2}% below threshold {:.2}%",
                self.name,
                ctx.symbol,
                dip_rate * 100.0,
                self.dip_threshold * 100.0
            );
            return TradingSignal::hold(
                &ctx.symbol,
                &format!("dip {:.2}% below threshold", dip_rate * 100.0),
            );
        }

        info!(
            "[{}][{}] scalping signal: {:.2}% below bar open {open:.0}",
            self.name,
            ctx.symbol,
            dip_rate * 100.0
        );
        TradingSignal::buy(
            &ctx.symbol,
            self.position_size,
            &format!("scalping signal: {:.2}% below bar open {open:.0}", dip_rate * 100.0),
            0.9,
        )
        .with_metadata("sell_profit_pct", serde_json::json!(self.sell_profit_pct))
        .with_metadata("stop_loss_pct", serde_json::json!(self.stop_loss_pct))
        .with_metadata("take_profit_pct", serde_json::json!(self.take_profit_pct))
        .with_metadata(
            "timeout_seconds",
            serde_json::json!(self.max_signal_minutes * 60),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::persistence::minute_candles::MinuteCandle;
    use chrono::NaiveDate;

    fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 6, 18)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    fn ctx(price: i64, now: NaiveDateTime) -> StrategyContext {
        StrategyContext {
            symbol: "233740".into(),
            name: "KODEX".into(),
            current_price: price,
            now,
            minute_history: vec![MinuteCandle {
                symbol: "233740".into(),
                candle_datetime: "2025-06-18 10:00".into(),
                trade_date: "20250618".into(),
                open: 10_000,
                high: 10_010,
                low: 9_970,
                close: 9_980,
                volume: 500,
            }],
            daily_candles: Vec::new(),
            position: None,
            today_trade_count: 0,
        }
    }

    fn strategy() -> ScalpingRangeStrategy {
        ScalpingRangeStrategy::from_params("scalping_range", &serde_json::json!({}))
    }

    #[test]
    fn dip_emits_signal_with_executor_metadata() {
        let mut s = strategy();
        // 9_975 is 0.25% below the 10:00 bar open of 10_000.
        let signal = s.generate_signal(&ctx(9_975, at(10, 1, 30)));
        assert!(signal.is_buy(), "reason: {}", signal.reason);
        assert_eq!(signal.metadata_f64("sell_profit_pct"), Some(0.001));
        assert_eq!(signal.metadata_f64("stop_loss_pct"), Some(0.01));
        assert_eq!(signal.metadata_f64("take_profit_pct"), Some(0.003));
        assert_eq!(signal.metadata_u32("timeout_seconds"), Some(3_600));
    }

    #[test]
    fn shallow_dip_holds() {
        let mut s = strategy();
        let signal = s.generate_signal(&ctx(9_990, at(10, 1, 30)));
        assert!(signal.is_hold());
    }

    #[test]
    fn window_gate() {
        let s = strategy();
        assert!(!s.can_generate_signal(&ctx(9_975, at(9, 0, 0))));
        assert!(s.can_generate_signal(&ctx(9_975, at(9, 5, 0))));
        assert!(!s.can_generate_signal(&ctx(9_975, at(15, 16, 0))));
    }
}
