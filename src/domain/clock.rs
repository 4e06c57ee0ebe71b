//! Trading-calendar predicates and cadence checks.
//!
//! Pure functions over wall-clock values so every caller (scheduler, engine,
//! stream gate) shares one definition of "trading hours".

use chrono::{Datelike, NaiveDateTime, NaiveTime, Timelike};

/// Parse "HH:MM" into a `NaiveTime`. Invalid input yields `None`.
pub fn parse_hhmm(s: &str) -> Option<NaiveTime> {
    let (h, m) = s.split_once(':')?;
    NaiveTime::from_hms_opt(h.parse().ok()?, m.parse().ok()?, 0)
}

/// Inclusive trading-hours check against "HH:MM" bounds.
pub fn is_trading_hours(now: NaiveDateTime, start: &str, end: &str) -> bool {
    let (Some(start), Some(end)) = (parse_hhmm(start), parse_hhmm(end)) else {
        return false;
    };
    let t = now.time();
    t >= start && t <= end
}

/// Monday through Friday.
pub fn is_weekday(now: NaiveDateTime) -> bool {
    now.weekday().num_days_from_monday() < 5
}

/// Whether a symbol with the given cadence fires this second.
///
/// `interval=5, offset=0` fires at :00, :05, :10, ...;
/// `interval=5, offset=2` at :02, :07, :12, ...
pub fn should_execute(now: NaiveDateTime, interval_seconds: u32, offset_seconds: u32) -> bool {
    if interval_seconds == 0 {
        return false;
    }
    (now.second() as i64 - offset_seconds as i64).rem_euclid(interval_seconds as i64) == 0
}

/// Minute-bar key for OHLCV upserts: "YYYYMMDD_HHMM".
pub fn minute_key(now: NaiveDateTime) -> String {
    now.format("%Y%m%d_%H%M").to_string()
}

/// "YYYYMMDD" for the given moment.
pub fn date_str(now: NaiveDateTime) -> String {
    now.format("%Y%m%d").to_string()
}

/// Seconds until the "HH:MM" boundary, zero if already past it.
pub fn seconds_until(now: NaiveDateTime, hhmm: &str) -> u64 {
    let Some(target) = parse_hhmm(hhmm) else {
        return 0;
    };
    let t = now.time();
    if t >= target {
        return 0;
    }
    (target.num_seconds_from_midnight() - t.num_seconds_from_midnight()) as u64
}
