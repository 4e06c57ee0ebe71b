//! Indicator math shared by the ported strategies.
//!
//! Population statistics over fixed windows, matching the source
//! formulas exactly: no exponential smoothing, no sample correction.

/// Simple moving average over the whole slice.
pub fn sma(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Population standard deviation (divisor N).
pub fn stddev(values: &[f64]) -> Option<f64> {
    let mean = sma(values)?;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    Some(variance.sqrt())
}

/// Bollinger bands over the last `period` values: (lower, middle, upper).
pub fn bollinger(values: &[f64], period: usize, k: f64) -> Option<(f64, f64, f64)> {
    if values.len() < period {
        return None;
    }
    let window = &values[values.len() - period..];
    let middle = sma(window)?;
    let sd = stddev(window)?;
    Some((middle - k * sd, middle, middle + k * sd))
}

/// RSI over the last `period` price changes, simple averages.
pub fn rsi(closes: &[f64], period: usize) -> Option<f64> {
    if closes.len() < period + 1 {
        return None;
    }
    let window = &closes[closes.len() - (period + 1)..];
    let mut gains = 0.0;
    let mut losses = 0.0;
    for pair in window.windows(2) {
        let change = pair[1] - pair[0];
        if change > 0.0 {
            gains += change;
        } else {
            losses -= change;
        }
    }
    if losses == 0.0 {
        return Some(100.0);
    }
    let rs = (gains / period as f64) / (losses / period as f64);
    Some(100.0 - 100.0 / (1.0 + rs))
}

/// Average true range over the last `period` bars. `bars` are
/// (high, low, close), oldest first.
pub fn atr(bars: &[(f64, f64, f64)], period: usize) -> Option<f64> {
    if bars.len() < period + 1 {
        return None;
    }
    let window = &bars[bars.len() - (period + 1)..];
    let mut total = 0.0;
    for pair in window.windows(2) {
        let (high, low, _) = pair[1];
        let (_, _, prev_close) = pair[0];
        let tr = (high - low)
            .max((high - prev_close).abs())
            .max((low - prev_close).abs());
        total += tr;
    }
    Some(total / period as f64)
}

/// Z-score of `value` against the slice's population statistics.
pub fn zscore(values: &[f64], value: f64) -> Option<f64> {
    let mean = sma(values)?;
    let sd = stddev(values)?;
    if sd == 0.0 {
        return None;
    }
    Some((value - mean) / sd)
}
