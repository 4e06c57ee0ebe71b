//! Rolling tick window with percentile, volatility and trend queries.
//!
//! Keeps up to `max_window_seconds` of ticks; queries evaluate only the
//! requested window relative to the newest tick. The executor owns the
//! tracker behind its own lock, so the tracker itself is plain state.

use chrono::{Duration as ChronoDuration, NaiveDateTime};
use std::collections::VecDeque;

pub struct PriceRangeTracker {
    window_seconds: u32,
    max_window_seconds: u32,
    ticks: VecDeque<(NaiveDateTime, i64)>,
}

impl PriceRangeTracker {
    pub fn new(window_seconds: u32, max_window_seconds: u32) -> Self {
        Self {
            window_seconds,
            max_window_seconds,
            ticks: VecDeque::new(),
        }
    }

    pub fn add_tick(&mut self, timestamp: NaiveDateTime, price: i64) {
        self.ticks.push_back((timestamp, price));
        let cutoff = timestamp - ChronoDuration::seconds(self.max_window_seconds as i64);
        while let Some(&(t, _)) = self.ticks.front() {
            if t < cutoff {
                self.ticks.pop_front();
            } else {
                break;
            }
        }
    }

    fn window_prices(&self, window_seconds: Option<u32>) -> Vec<i64> {
        let ws = window_seconds.unwrap_or(self.window_seconds);
        let Some(&(newest, _)) = self.ticks.back() else {
            return Vec::new();
        };
        let cutoff = newest - ChronoDuration::seconds(ws as i64);
        self.ticks
            .iter()
            .filter(|(t, _)| *t >= cutoff)
            .map(|(_, p)| *p)
            .collect()
    }

    /// Nth-percentile price of the window (10.0 = P10, the 10th
    /// percentile from below).
    pub fn percentile(&self, percentile: f64, window_seconds: Option<u32>) -> Option<i64> {
        let mut prices = self.window_prices(window_seconds);
        if prices.is_empty() {
            return None;
        }
        prices.sort_unstable();
        let idx = ((prices.len() as f64 * percentile / 100.0) as usize).min(prices.len() - 1);
        Some(prices[idx])
    }

    pub fn range(&self, window_seconds: Option<u32>) -> Option<(i64, i64)> {
        let prices = self.window_prices(window_seconds);
        let low = *prices.iter().min()?;
        let high = *prices.iter().max()?;
        Some((low, high))
    }

    /// (max - min) / min over the window.
    pub fn volatility(&self, window_seconds: Option<u32>) -> Option<f64> {
        let (low, high) = self.range(window_seconds)?;
        if low <= 0 {
            return None;
        }
        Some((high - low) as f64 / low as f64)
    }

    /// Volatility-adapted window over a 30s observation: fast markets get
    /// a short window, quiet markets a long one.
    pub fn adaptive_window(&self) -> u32 {
        match self.volatility(Some(30)) {
            Some(v) if v > 0.005 => 15,
            Some(v) if v < 0.002 => 60,
            Some(_) => 30,
            None => self.window_seconds,
        }
    }

    pub fn current_window_seconds(&self, adaptive: bool) -> u32 {
        if adaptive {
            self.adaptive_window()
        } else {
            self.window_seconds
        }
    }

    pub fn tick_count(&self) -> usize {
        self.window_prices(None).len()
    }

    pub fn is_ready(&self, min_ticks: usize) -> bool {
        self.tick_count() >= min_ticks
    }

    /// Share of price changes in the window that moved up. Unchanged
    /// consecutive ticks are ignored; an all-flat window reads neutral.
    pub fn uptick_ratio(&self, window_seconds: Option<u32>) -> Option<f64> {
        let prices = self.window_prices(window_seconds);
        if prices.len() < 4 {
            return None;
        }
        let mut ups = 0u32;
        let mut changes = 0u32;
        for pair in prices.windows(2) {
            if pair[1] != pair[0] {
                changes += 1;
                if pair[1] > pair[0] {
                    ups += 1;
                }
            }
        }
        if changes == 0 {
            return Some(0.5);
        }
        Some(ups as f64 / changes as f64)
    }

    pub fn reset(&mut self) {
        self.ticks.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn ts(seconds: i64) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 6, 18)
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap()
            + ChronoDuration::seconds(seconds)
    }

    fn tracker_with(prices: &[i64]) -> PriceRangeTracker {
        let mut tracker = PriceRangeTracker::new(10, 60);
        for (i, p) in prices.iter().enumerate() {
            tracker.add_tick(ts(i as i64), *p);
        }
        tracker
    }

    #[test]
    fn p10_of_known_window() {
        // 12 ticks: P10 index = floor(12 * 0.10) = 1 -> second smallest.
        let tracker = tracker_with(&[
            9_990, 9_991, 9_995, 9_996, 9_997, 9_998, 10_000, 10_001, 10_002, 10_003, 10_004,
            10_005,
        ]);
        assert_eq!(tracker.percentile(10.0, None), Some(9_991));
        assert_eq!(tracker.percentile(0.0, None), Some(9_990));
        assert_eq!(tracker.percentile(100.0, None), Some(10_005));
    }

    #[test]
    fn old_ticks_fall_out_of_the_window() {
        let mut tracker = PriceRangeTracker::new(10, 60);
        tracker.add_tick(ts(0), 5_000);
        tracker.add_tick(ts(30), 10_000);
        // The 10-second query window only sees the newest tick.
        assert_eq!(tracker.range(None), Some((10_000, 10_000)));
        // A wider window still sees both.
        assert_eq!(tracker.range(Some(60)), Some((5_000, 10_000)));
    }

    #[test]
    fn ticks_beyond_max_window_are_pruned() {
        let mut tracker = PriceRangeTracker::new(10, 60);
        tracker.add_tick(ts(0), 5_000);
        tracker.add_tick(ts(120), 10_000);
        assert_eq!(tracker.range(Some(600)), Some((10_000, 10_000)));
    }

    #[test]
    fn volatility_and_adaptive_window() {
        // 1% swing -> high volatility -> short window.
        let tracker = tracker_with(&[10_000, 10_100, 10_050, 10_000]);
        assert!(tracker.volatility(Some(30)).unwrap() > 0.005);
        assert_eq!(tracker.adaptive_window(), 15);

        // Dead-flat market -> long window.
        let flat = tracker_with(&[10_000, 10_001, 10_000, 10_001]);
        assert!(flat.volatility(Some(30)).unwrap() < 0.002);
        assert_eq!(flat.adaptive_window(), 60);
    }

    #[test]
    fn uptick_ratio_counts_only_changes() {
        // Changes: -1, +1, +1, -1 -> 2 of 4 up.
        let tracker = tracker_with(&[100, 99, 100, 100, 101, 100]);
        assert_eq!(tracker.uptick_ratio(None), Some(0.5));

        let flat = tracker_with(&[100, 100, 100, 100]);
        assert_eq!(flat.uptick_ratio(None), Some(0.5));

        let short = tracker_with(&[100, 101]);
        assert_eq!(short.uptick_ratio(None), None);
    }

    #[test]
    fn readiness_threshold() {
        let tracker = tracker_with(&[1_000; 9]);
        assert!(!tracker.is_ready(10));
        let tracker = tracker_with(&[1_000; 10]);
        assert!(tracker.is_ready(10));
    }
}
