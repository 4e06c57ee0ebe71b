use crate::strategies::traits::{Strategy, StrategyContext, TradingSignal};
use chrono::{NaiveDateTime, NaiveTime, Timelike};
use serde_json::Value;
use tracing::info;

/// Intraday dip entry: buy when the price drops a threshold below the
/// open of the current N-minute bar, inside a configured time-of-day
/// window. Exits on take-profit, stop-loss or a bar-count time stop.
pub struct DipBuyStrategy {
    name: String,
    window_start: NaiveTime,
    window_end: NaiveTime,
    timeframe_minutes: u32,
    dip_threshold: f64,
    take_profit_pct: f64,
    stop_loss_pct: f64,
    max_holding_bars: u32,
    position_size: u32,

    entry_bar_count: u32,
    last_candle_start: Option<NaiveDateTime>,
}

impl DipBuyStrategy {
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
            window_start: t("trading_start", (9, 15)),
            window_end: t("trading_end", (9, 45)),
            timeframe_minutes: (u("timeframe_minutes", 3) as u32).max(1),
            // Thresholds are configured in percent.
            dip_threshold: f("dip_threshold_pct", 0.3) / 100.0,
            take_profit_pct: f("take_profit_pct", 0.2) / 100.0,
            stop_loss_pct: f("stop_loss_pct", 2.0) / 100.0,
            max_holding_bars: u("max_holding_bars", 60) as u32,
            position_size: u("position_size", 1) as u32,
            entry_bar_count: 0,
            last_candle_start: None,
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

    /// Open of the current N-minute bar, aggregated from the 1-minute
    /// history; falls back to the current price when no bar overlaps.
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

    fn count_bar(&mut self, candle_start: NaiveDateTime) {
        if self.last_candle_start != Some(candle_start) {
            if self.last_candle_start.is_some() {
                self.entry_bar_count += 1;
            }
            self.last_candle_start = Some(candle_start);
        }
    }

    fn reset_state(&mut self) {
        self.entry_bar_count = 0;
        self.last_candle_start = None;
    }
}

impl Strategy for DipBuyStrategy {
    fn strategy_name(&self) -> &str {
        &self.name
    }

    fn can_generate_signal(&self, ctx: &StrategyContext) -> bool {
        // Held positions always get the exit logic, regardless of the
        // entry window.
        ctx.has_position() || self.in_window(ctx.now)
    }

    fn generate_signal(&mut self, ctx: &StrategyContext) -> TradingSignal {
        let candle_start = self.candle_start(ctx.now);

        if ctx.has_position() {
            self.count_bar(candle_start);
            let profit_rate = ctx.profit_rate() / 100.0;

            if profit_rate <= -self.stop_loss_pct {
                self.reset_state();
                return TradingSignal::sell(
                    &ctx.symbol,
                    ctx.position_quantity(),
                    &format!("stop-loss: {:.2}%", profit_rate * 100.0),
                    1.0,
                );
            }
            if profit_rate >= self.take_profit_pct {
                self.reset_state();
                return TradingSignal::sell(
                    &ctx.symbol,
                    ctx.position_quantity(),
                    &format!("take-profit: {:.2}%", profit_rate * 100.0),
                    1.0,
                );
            }
            if self.entry_bar_count >= self.max_holding_bars {
                let held = self.entry_bar_count;
                self.reset_state();
                return TradingSignal::sell(
                    &ctx.symbol,
                    ctx.position_quantity(),
                    &format!("time stop: {held} bars"),
                    0.8,
                );
            }
            return TradingSignal::hold(&ctx.symbol, "holding");
        }

        if !self.in_window(ctx.now) {
            return TradingSignal::hold(&ctx.symbol, "outside entry window");
        }

        let open = self.bar_open(ctx, candle_start);
        if open <= 0.0 {
            return TradingSignal::hold(&ctx.symbol, "no bar open");
        }
        let dip_rate = (open - ctx.current_price as f64) / open;
        if dip_rate >= self.dip_threshold {
            self.entry_bar_count = 0;
            self.last_candle_start = Some(candle_start);
            return TradingSignal::buy(
                &ctx.symbol,
                self.position_size,
                &format!("dip entry: {:.2}% below bar open {open:.0}", dip_rate * 100.0),
                0.9,
            );
        }

        TradingSignal::hold(
            &ctx.symbol,
            &format!("dip {:.2}% below threshold", dip_rate * 100.0),
        )
    }

    fn on_entry(&mut self, ctx: &StrategyContext, signal: &TradingSignal) {
        info!(
            "[{}] entry: {} @ {} - {}",
            self.name, ctx.symbol, ctx.current_price, signal.reason
        );
        self.entry_bar_count = 0;
        self.last_candle_start = Some(self.candle_start(ctx.now));
    }

    fn on_exit(&mut self, ctx: &StrategyContext, signal: &TradingSignal) {
        info!(
            "[{}] exit: {} @ {} - {}",
            self.name, ctx.symbol, ctx.current_price, signal.reason
        );
        self.reset_state();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::persistence::minute_candles::MinuteCandle;
    use crate::strategies::traits::PositionView;
    use chrono::NaiveDate;

    fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 6, 18)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    fn minute(hh: u32, mm: u32, open: i64, close: i64) -> MinuteCandle {
        MinuteCandle {
            symbol: "233740".into(),
            candle_datetime: format!("2025-06-18 {hh:02}:{mm:02}"),
            trade_date: "20250618".into(),
            open,
            high: open.max(close),
            low: open.min(close),
            close,
            volume: 100,
        }
    }

    fn ctx(price: i64, now: NaiveDateTime, position: Option<PositionView>) -> StrategyContext {
        StrategyContext {
            symbol: "233740".into(),
            name: "KODEX".into(),
            current_price: price,
            now,
            minute_history: vec![
                minute(9, 21, 10_050, 10_040),
                minute(9, 22, 10_040, 10_020),
                minute(9, 23, 10_020, 10_000),
            ],
            daily_candles: Vec::new(),
            position,
            today_trade_count: 0,
        }
    }

    fn strategy() -> DipBuyStrategy {
        DipBuyStrategy::from_params("dip_buy", &serde_json::json!({}))
    }

    #[test]
    fn buys_on_a_dip_from_the_bar_open() {
        let mut s = strategy();
        // 09:23 sits in the 09:21 3-minute bar, whose open is 10_050.
        // 10_010 is 0.398% below -> above the 0.3% threshold.
        let signal = s.generate_signal(&ctx(10_010, at(9, 23, 30), None));
        assert!(signal.is_buy(), "reason: {}", signal.reason);
    }

    #[test]
    fn small_dip_holds() {
        let mut s = strategy();
        // 10_030 is only 0.199% below the 10_050 open.
        let signal = s.generate_signal(&ctx(10_030, at(9, 23, 30), None));
        assert!(signal.is_hold());
    }

    #[test]
    fn entry_window_is_enforced() {
        let s = strategy();
        assert!(!s.can_generate_signal(&ctx(10_000, at(10, 30, 0), None)));
        // But exits stay live outside the window.
        let held = ctx(
            10_000,
            at(10, 30, 0),
            Some(PositionView {
                quantity: 1,
                avg_price: 10_000.0,
            }),
        );
        assert!(s.can_generate_signal(&held));
    }

    #[test]
    fn stop_loss_fires_on_held_position() {
        let mut s = strategy();
        let held = ctx(
            9_790,
            at(9, 30, 0),
            Some(PositionView {
                quantity: 2,
                avg_price: 10_000.0,
            }),
        );
        let signal = s.generate_signal(&held);
        assert!(signal.is_sell());
        assert!(signal.reason.contains("stop-loss"));
        assert_eq!(signal.quantity, 2);
    }
}
