//! Rolling-boundary dip detection, the alternate monitoring mode.
//!
//! Tracks upper/lower boundaries over a micro window of ticks. A tick
//! breaking the lower boundary resets it and counts a breach; when the
//! boundary range narrows into the configured band and holds there for the
//! hold time, a dip fires and the buy price is read off the window
//! percentile. Too many breaches disqualify the symbol for the rest of the
//! signal.

use chrono::{Duration as ChronoDuration, NaiveDateTime};
use std::collections::VecDeque;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundaryEvent {
    /// Price broke the lower boundary; the boundary was reset.
    Breach,
    /// Range held inside the band long enough; buy trigger.
    Dip,
}

pub struct BoundaryTracker {
    window_ticks: usize,
    window_seconds: f64,
    max_breaches: u32,
    min_range_pct: f64,
    max_range_pct: f64,
    hold_seconds: f64,
    percentile: f64,

    ticks: VecDeque<(NaiveDateTime, i64)>,
    upper: Option<i64>,
    lower: Option<i64>,
    breach_count: u32,
    range_qualified_at: Option<NaiveDateTime>,
    dip_fired: bool,
}

impl BoundaryTracker {
    pub fn new(
        window_ticks: usize,
        max_breaches: u32,
        min_range_pct: f64,
        max_range_pct: f64,
        hold_seconds: f64,
        percentile: f64,
    ) -> Self {
        Self {
            window_ticks,
            window_seconds: 1.0,
            max_breaches,
            min_range_pct,
            max_range_pct,
            hold_seconds,
            percentile,
            ticks: VecDeque::new(),
            upper: None,
            lower: None,
            breach_count: 0,
            range_qualified_at: None,
            dip_fired: false,
        }
    }

    /// Feed one tick; reports a breach or a dip when either occurs.
    pub fn add_tick(&mut self, timestamp: NaiveDateTime, price: i64) -> Option<BoundaryEvent> {
        if let Some(lower) = self.lower {
            if price < lower {
                self.breach_count += 1;
                info!(
                    "[boundary] breach: {price} < lower {lower} (count {})",
                    self.breach_count
                );
                self.reset_boundary();
                return Some(BoundaryEvent::Breach);
            }
        }

        self.ticks.push_back((timestamp, price));
        let cutoff = timestamp - ChronoDuration::milliseconds((self.window_seconds * 1000.0) as i64);
        while self.ticks.len() > self.window_ticks {
            match self.ticks.front() {
                Some(&(t, _)) if t < cutoff => {
                    self.ticks.pop_front();
                }
                _ => break,
            }
        }

        let time_span = match (self.ticks.front(), self.ticks.back()) {
            (Some(&(first, _)), Some(&(last, _))) => (last - first).num_milliseconds() as f64 / 1000.0,
            _ => 0.0,
        };
        if self.ticks.len() >= self.window_ticks || time_span >= self.window_seconds {
            self.update_boundary();
        }

        let (Some(lower), Some(upper)) = (self.lower, self.upper) else {
            return None;
        };
        if lower <= 0 {
            return None;
        }

        let range_pct = (upper - lower) as f64 / lower as f64;
        let in_zone = range_pct >= self.min_range_pct && range_pct <= self.max_range_pct;
        if in_zone {
            match self.range_qualified_at {
                None => {
                    self.range_qualified_at = Some(timestamp);
                    debug!("[boundary] range qualified: {range_pct:.4} ({lower}~{upper})");
                }
                Some(since) => {
                    let held = (timestamp - since).num_milliseconds() as f64 / 1000.0;
                    if !self.dip_fired && held >= self.hold_seconds {
                        self.dip_fired = true;
                        info!(
                            "[boundary] dip: range {range_pct:.4} held {held:.1}s ({lower}~{upper})"
                        );
                        return Some(BoundaryEvent::Dip);
                    }
                }
            }
        } else {
            self.range_qualified_at = None;
        }

        None
    }

    /// Buy price once a dip fired: window percentile, like the simpler
    /// monitor.
    pub fn buy_price(&self) -> Option<i64> {
        if self.lower.is_none() || self.ticks.is_empty() {
            return None;
        }
        let mut prices: Vec<i64> = self.ticks.iter().map(|(_, p)| *p).collect();
        prices.sort_unstable();
        let idx = ((prices.len() as f64 * self.percentile / 100.0) as usize)
            .saturating_sub(1)
            .min(prices.len() - 1);
        Some(prices[idx])
    }

    pub fn is_trading_allowed(&self) -> bool {
        self.breach_count < self.max_breaches
    }

    pub fn breach_count(&self) -> u32 {
        self.breach_count
    }

    /// Full reset for a fresh signal.
    pub fn reset(&mut self) {
        self.ticks.clear();
        self.reset_boundary();
        self.breach_count = 0;
    }

    /// Between cycles only the boundary and dip latch clear; ticks and the
    /// breach budget carry over.
    pub fn reset_for_new_cycle(&mut self) {
        self.reset_boundary();
    }

    fn update_boundary(&mut self) {
        let prices: Vec<i64> = self.ticks.iter().map(|(_, p)| *p).collect();
        let (Some(&low), Some(&high)) = (prices.iter().min(), prices.iter().max()) else {
            return;
        };
        if self.lower.is_none() {
            info!("[boundary] established: {low}~{high} ({} ticks)", prices.len());
        }
        self.lower = Some(low);
        self.upper = Some(high);
    }

    fn reset_boundary(&mut self) {
        self.upper = None;
        self.lower = None;
        self.range_qualified_at = None;
        self.dip_fired = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn ts(ms: i64) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 6, 18)
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap()
            + ChronoDuration::milliseconds(ms)
    }

    fn tracker() -> BoundaryTracker {
        // 5-tick window, range band 0.1%~0.2%, 1s hold, P20 buy price.
        BoundaryTracker::new(5, 3, 0.001, 0.002, 1.0, 20.0)
    }

    #[test]
    fn dip_fires_after_range_holds() {
        let mut t = tracker();
        // Establish a boundary of 10_000..10_015 (0.15% range).
        let mut event = None;
        for (i, p) in [10_000i64, 10_005, 10_010, 10_015, 10_005].iter().enumerate() {
            event = t.add_tick(ts(i as i64 * 100), *p);
        }
        assert_eq!(event, None, "range just qualified, hold not yet satisfied");

        // Stay inside the band past the hold time.
        let event = t.add_tick(ts(2_000), 10_003);
        assert_eq!(event, Some(BoundaryEvent::Dip));
        let buy = t.buy_price().unwrap();
        assert!(buy >= 10_003 && buy <= 10_015);
    }

    #[test]
    fn lower_break_counts_breach_and_resets() {
        let mut t = tracker();
        for (i, p) in [10_000i64, 10_005, 10_010, 10_012, 10_008].iter().enumerate() {
            t.add_tick(ts(i as i64 * 100), *p);
        }
        let event = t.add_tick(ts(600), 9_950);
        assert_eq!(event, Some(BoundaryEvent::Breach));
        assert_eq!(t.breach_count(), 1);
        assert!(t.is_trading_allowed());
    }

    #[test]
    fn breach_budget_disqualifies() {
        let mut t = tracker();
        for round in 0..3i64 {
            let base = round * 1_000;
            for (i, p) in [10_000i64, 10_005, 10_010, 10_012, 10_008].iter().enumerate() {
                t.add_tick(ts(base + i as i64 * 100), *p);
            }
            t.add_tick(ts(base + 600), 9_000);
        }
        assert_eq!(t.breach_count(), 3);
        assert!(!t.is_trading_allowed());
    }

    #[test]
    fn too_wide_range_never_fires() {
        let mut t = tracker();
        // 1% range, well above the band.
        for (i, p) in [10_000i64, 10_050, 10_100, 10_080, 10_060].iter().enumerate() {
            t.add_tick(ts(i as i64 * 100), *p);
        }
        let event = t.add_tick(ts(3_000), 10_050);
        assert_eq!(event, None);
    }

    #[test]
    fn cycle_reset_keeps_breach_budget() {
        let mut t = tracker();
        for (i, p) in [10_000i64, 10_005, 10_010, 10_012, 10_008].iter().enumerate() {
            t.add_tick(ts(i as i64 * 100), *p);
        }
        t.add_tick(ts(600), 9_950);
        assert_eq!(t.breach_count(), 1);
        t.reset_for_new_cycle();
        assert_eq!(t.breach_count(), 1);
        t.reset();
        assert_eq!(t.breach_count(), 0);
    }
}
