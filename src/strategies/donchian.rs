use crate::strategies::traits::{Strategy, StrategyContext, TradingSignal};
use serde_json::Value;
use tracing::info;

/// Donchian-channel breakout on daily candles.
///
/// Entry: price clears the highest high of the last `entry_period` days.
/// Exit: price falls through the lowest low of the last `exit_period`
/// days, or the fixed take-profit/stop-loss rails.
pub struct DonchianStrategy {
    name: String,
    entry_period: usize,
    exit_period: usize,
    take_profit_pct: f64,
    stop_loss_pct: f64,
    position_size: u32,
}

impl DonchianStrategy {
    pub fn from_params(name: &str, params: &Value) -> Self {
        let f = |key: &str, default: f64| {
            params.get(key).and_then(Value::as_f64).unwrap_or(default)
        };
        let u = |key: &str, default: u64| {
            params.get(key).and_then(Value::as_u64).unwrap_or(default)
        };
        Self {
            name: name.to_string(),
            entry_period: u("entry_period", 20) as usize,
            exit_period: u("exit_period", 10) as usize,
            take_profit_pct: f("take_profit_pct", 0.05),
            stop_loss_pct: f("stop_loss_pct", 0.02),
            position_size: u("position_size", 1) as u32,
        }
    }

    fn channel_high(&self, ctx: &StrategyContext) -> Option<i64> {
        let window = trailing(ctx, self.entry_period)?;
        window.iter().map(|c| c.high).max()
    }

    fn channel_low(&self, ctx: &StrategyContext) -> Option<i64> {
        let window = trailing(ctx, self.exit_period)?;
        window.iter().map(|c| c.low).min()
    }
}

/// Last `period` daily candles, excluding today's still-forming bar if
/// present at the tail.
fn trailing(
    ctx: &StrategyContext,
    period: usize,
) -> Option<&[crate::infrastructure::persistence::daily_candles::DailyCandle]> {
    let today = ctx.now.format("%Y%m%d").to_string();
    let candles = &ctx.daily_candles;
    let end = if candles.last().map(|c| c.trade_date == today).unwrap_or(false) {
        candles.len() - 1
    } else {
        candles.len()
    };
    if end < period {
        return None;
    }
    Some(&candles[end - period..end])
}

impl Strategy for DonchianStrategy {
    fn strategy_name(&self) -> &str {
        &self.name
    }

    fn can_generate_signal(&self, ctx: &StrategyContext) -> bool {
        ctx.has_position() || ctx.daily_candles.len() >= self.entry_period
    }

    fn generate_signal(&mut self, ctx: &StrategyContext) -> TradingSignal {
        if ctx.has_position() {
            let profit_rate = ctx.profit_rate() / 100.0;
            if profit_rate <= -self.stop_loss_pct {
                return TradingSignal::sell(
                    &ctx.symbol,
                    ctx.position_quantity(),
                    &format!("stop-loss: {:.2}%", profit_rate * 100.0),
                    1.0,
                );
            }
            if profit_rate >= self.take_profit_pct {
                return TradingSignal::sell(
                    &ctx.symbol,
                    ctx.position_quantity(),
                    &format!("take-profit: {:.2}%", profit_rate * 100.0),
                    1.0,
                );
            }
            if let Some(low) = self.channel_low(ctx) {
                if ctx.current_price < low {
                    return TradingSignal::sell(
                        &ctx.symbol,
                        ctx.position_quantity(),
                        &format!("{}-day channel exit (low {low})", self.exit_period),
                        0.9,
                    );
                }
            }
            return TradingSignal::hold(&ctx.symbol, "holding");
        }

        let Some(high) = self.channel_high(ctx) else {
            return TradingSignal::hold(&ctx.symbol, "insufficient daily history");
        };
        if ctx.current_price > high {
            return TradingSignal::buy(
                &ctx.symbol,
                self.position_size,
                &format!("{}-day channel breakout (high {high})", self.entry_period),
                0.85,
            );
        }
        TradingSignal::hold(&ctx.symbol, "no breakout")
    }

    fn on_entry(&mut self, ctx: &StrategyContext, signal: &TradingSignal) {
        info!(
            "[{}] entry: {} @ {} - {}",
            self.name, ctx.symbol, ctx.current_price, signal.reason
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::persistence::daily_candles::DailyCandle;
    use crate::strategies::traits::PositionView;
    use chrono::NaiveDate;

    fn daily(date: &str, high: i64, low: i64) -> DailyCandle {
        DailyCandle {
            symbol: "229200".into(),
            trade_date: date.into(),
            open: (high + low) / 2,
            high,
            low,
            close: (high + low) / 2,
            volume: 1_000_000,
            trade_amount: None,
            change_rate: None,
        }
    }

    fn ctx(price: i64, position: Option<PositionView>) -> StrategyContext {
        // 20 days with highs at 10_500 and lows at 9_500.
        let daily_candles: Vec<DailyCandle> = (1..=20)
            .map(|d| daily(&format!("202505{d:02}"), 10_500, 9_500))
            .collect();
        StrategyContext {
            symbol: "229200".into(),
            name: "KODEX Kosdaq150".into(),
            current_price: price,
            now: NaiveDate::from_ymd_opt(2025, 6, 18)
                .unwrap()
                .and_hms_opt(10, 0, 0)
                .unwrap(),
            minute_history: Vec::new(),
            daily_candles,
            position,
            today_trade_count: 0,
        }
    }

    fn strategy() -> DonchianStrategy {
        DonchianStrategy::from_params("donchian", &serde_json::json!({}))
    }

    #[test]
    fn breakout_above_channel_buys() {
        let mut s = strategy();
        assert!(s.generate_signal(&ctx(10_501, None)).is_buy());
        assert!(s.generate_signal(&ctx(10_500, None)).is_hold());
    }

    #[test]
    fn channel_exit_sells_held_position() {
        let mut s = strategy();
        let held = Some(PositionView {
            quantity: 4,
            avg_price: 9_600.0,
        });
        // Below the 10-day low but inside the P/L rails:
        // (9499-9600)/9600 = -1.05%, above the -2% stop.
        let signal = s.generate_signal(&ctx(9_499, held));
        assert!(signal.is_sell());
        assert!(signal.reason.contains("channel exit"));
    }

    #[test]
    fn todays_forming_bar_is_excluded() {
        let mut s = strategy();
        let mut context = ctx(10_501, None);
        // Today's bar spikes to 11_000; the channel must not see it.
        context
            .daily_candles
            .push(daily("20250618", 11_000, 10_400));
        assert!(s.generate_signal(&context).is_buy());
    }
}
