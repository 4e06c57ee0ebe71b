use crate::strategies::indicators::bollinger;
use crate::strategies::traits::{Strategy, StrategyContext, TradingSignal};
use serde_json::Value;
use tracing::info;

/// Mean-reversion entry at the lower Bollinger band.
///
/// Entry: close below the lower band (period 15, 1.5 σ by default).
/// Exit: take-profit, stop-loss, or a bar-count time stop.
pub struct BollingerBandStrategy {
    name: String,
    bb_period: usize,
    std_multiplier: f64,
    take_profit_pct: f64,
    stop_loss_pct: f64,
    max_holding_bars: u32,
    position_size: u32,
    entry_bar_count: u32,
}

impl BollingerBandStrategy {
    pub fn from_params(name: &str, params: &Value) -> Self {
        let f = |key: &str, default: f64| {
            params.get(key).and_then(Value::as_f64).unwrap_or(default)
        };
        let u = |key: &str, default: u64| {
            params.get(key).and_then(Value::as_u64).unwrap_or(default)
        };
        Self {
            name: name.to_string(),
            bb_period: u("bb_period", 15) as usize,
            std_multiplier: f("std_multiplier", 1.5),
            take_profit_pct: f("take_profit_pct", 0.03),
            stop_loss_pct: f("stop_loss_pct", 0.015),
            max_holding_bars: u("max_holding_period", 10) as u32,
            position_size: u("position_size", 1) as u32,
            entry_bar_count: 0,
        }
    }
}

impl Strategy for BollingerBandStrategy {
    fn strategy_name(&self) -> &str {
        &self.name
    }

    fn required_history(&self) -> usize {
        self.bb_period.max(20)
    }

    fn can_generate_signal(&self, ctx: &StrategyContext) -> bool {
        ctx.has_position() || ctx.minute_history.len() >= self.bb_period
    }

    fn generate_signal(&mut self, ctx: &StrategyContext) -> TradingSignal {
        if ctx.minute_history.len() < self.bb_period {
            return TradingSignal::hold(&ctx.symbol, "insufficient data");
        }

        if ctx.has_position() {
            let profit_rate = ctx.profit_rate() / 100.0;

            if profit_rate <= -self.stop_loss_pct {
                self.entry_bar_count = 0;
                return TradingSignal::sell(
                    &ctx.symbol,
                    ctx.position_quantity(),
                    &format!("stop-loss: {:.2}%", profit_rate * 100.0),
                    1.0,
                );
            }
            if profit_rate >= self.take_profit_pct {
                self.entry_bar_count = 0;
                return TradingSignal::sell(
                    &ctx.symbol,
                    ctx.position_quantity(),
                    &format!("take-profit: {:.2}%", profit_rate * 100.0),
                    1.0,
                );
            }

            self.entry_bar_count += 1;
            if self.entry_bar_count >= self.max_holding_bars {
                let held = self.entry_bar_count;
                self.entry_bar_count = 0;
                return TradingSignal::sell(
                    &ctx.symbol,
                    ctx.position_quantity(),
                    &format!("time stop: {held} bars held"),
                    0.8,
                );
            }
            return TradingSignal::hold(&ctx.symbol, "holding");
        }

        let closes = ctx.recent_closes(self.bb_period);
        let Some((lower, _middle, _upper)) =
            bollinger(&closes, self.bb_period, self.std_multiplier)
        else {
            return TradingSignal::hold(&ctx.symbol, "bands unavailable");
        };

        if (ctx.current_price as f64) < lower {
            self.entry_bar_count = 0;
            let distance_pct = (lower - ctx.current_price as f64) / lower * 100.0;
            return TradingSignal::buy(
                &ctx.symbol,
                self.position_size,
                &format!("below lower band (band {lower:.0}, gap {distance_pct:.1}%)"),
                0.85,
            );
        }

        TradingSignal::hold(&ctx.symbol, "entry conditions not met")
    }

    fn on_entry(&mut self, ctx: &StrategyContext, signal: &TradingSignal) {
        info!(
            "[{}] entry: {} @ {} - {}",
            self.name, ctx.symbol, ctx.current_price, signal.reason
        );
        self.entry_bar_count = 0;
    }

    fn on_exit(&mut self, ctx: &StrategyContext, signal: &TradingSignal) {
        info!(
            "[{}] exit: {} @ {} - {}",
            self.name, ctx.symbol, ctx.current_price, signal.reason
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::persistence::minute_candles::MinuteCandle;
    use crate::strategies::traits::PositionView;
    use chrono::NaiveDate;

    fn minute(close: i64) -> MinuteCandle {
        MinuteCandle {
            symbol: "122630".into(),
            candle_datetime: "2025-06-18 09:30".into(),
            trade_date: "20250618".into(),
            open: close,
            high: close + 10,
            low: close - 10,
            close,
            volume: 1_000,
        }
    }

    fn ctx(current_price: i64, closes: &[i64], position: Option<PositionView>) -> StrategyContext {
        StrategyContext {
            symbol: "122630".into(),
            name: "KODEX Leverage".into(),
            current_price,
            now: NaiveDate::from_ymd_opt(2025, 6, 18)
                .unwrap()
                .and_hms_opt(10, 0, 0)
                .unwrap(),
            minute_history: closes.iter().map(|c| minute(*c)).collect(),
            daily_candles: Vec::new(),
            position,
            today_trade_count: 0,
        }
    }

    fn strategy() -> BollingerBandStrategy {
        BollingerBandStrategy::from_params("bollinger_band", &serde_json::json!({}))
    }

    #[test]
    fn buys_below_the_lower_band() {
        let mut s = strategy();
        // Stable prices around 10_000 with a bit of variance; a deep drop
        // pierces the lower band.
        let closes: Vec<i64> = (0..15)
            .map(|i| if i % 2 == 0 { 10_010 } else { 9_990 })
            .collect();
        let signal = s.generate_signal(&ctx(9_900, &closes, None));
        assert!(signal.is_buy(), "reason: {}", signal.reason);
    }

    #[test]
    fn holds_inside_the_band() {
        let mut s = strategy();
        let closes: Vec<i64> = (0..15)
            .map(|i| if i % 2 == 0 { 10_010 } else { 9_990 })
            .collect();
        let signal = s.generate_signal(&ctx(10_000, &closes, None));
        assert!(signal.is_hold());
    }

    #[test]
    fn exits_on_take_profit_stop_loss_and_time() {
        let closes: Vec<i64> = vec![10_000; 15];
        let position = Some(PositionView {
            quantity: 3,
            avg_price: 10_000.0,
        });

        let mut s = strategy();
        let tp = s.generate_signal(&ctx(10_300, &closes, position.clone()));
        assert!(tp.is_sell());
        assert!(tp.reason.contains("take-profit"));

        let sl = s.generate_signal(&ctx(9_850, &closes, position.clone()));
        assert!(sl.is_sell());
        assert!(sl.reason.contains("stop-loss"));

        // Flat: holds until the bar budget runs out.
        let mut s = strategy();
        for _ in 0..9 {
            let hold = s.generate_signal(&ctx(10_000, &closes, position.clone()));
            assert!(hold.is_hold());
        }
        let time_stop = s.generate_signal(&ctx(10_000, &closes, position));
        assert!(time_stop.is_sell());
        assert!(time_stop.reason.contains("time stop"));
    }
}
