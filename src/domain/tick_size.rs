//! KRX price-tick rounding.
//!
//! ETF tick table: 1 KRW below 2,000 KRW, 5 KRW at or above. Buys round
//! down and sells round up so the resulting price is always executable.

const TICK_TABLE: &[(i64, i64)] = &[(2_000, 1), (i64::MAX, 5)];

fn tick_for(price: i64) -> i64 {
    for &(threshold, tick) in TICK_TABLE {
        if price < threshold {
            return tick;
        }
    }
    // Unreachable: the table ends with an i64::MAX threshold.
    5
}

/// Round down to the tick grid (buy side).
pub fn round_down(price: i64) -> i64 {
    let tick = tick_for(price);
    (price / tick) * tick
}

/// Round up to the tick grid (sell side).
pub fn round_up(price: i64) -> i64 {
    let tick = tick_for(price);
    ((price + tick - 1) / tick) * tick
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_krw_tick_below_2000() {
        for p in [1, 999, 1_500, 1_999] {
            assert_eq!(round_down(p), p);
            assert_eq!(round_up(p), p);
        }
    }

    #[test]
    fn five_krw_tick_at_or_above_2000() {
        assert_eq!(round_down(10_002), 10_000);
        assert_eq!(round_up(10_002), 10_005);
        assert_eq!(round_down(2_001), 2_000);
        assert_eq!(round_up(2_001), 2_005);
    }

    #[test]
    fn grid_values_are_fixed_points() {
        for p in [2_000, 2_005, 9_990, 10_000] {
            assert_eq!(round_down(p), p);
            assert_eq!(round_up(p), p);
        }
    }

    #[test]
    fn rounding_properties() {
        // buy-round(p) <= p, sell-round(p) >= p, error bounded by the tick.
        for p in 1..3_000i64 {
            let tick = if p < 2_000 { 1 } else { 5 };
            let down = round_down(p);
            let up = round_up(p);
            assert!(down <= p && p - down < tick, "down p={p}");
            assert!(up >= p && up - p < tick, "up p={p}");
        }
    }

    #[test]
    fn sell_target_example() {
        // 9990 * 1.001 = 9999.99 -> truncate to 9999 -> round up to 10000.
        let raw = (9_990f64 * 1.001) as i64;
        assert_eq!(round_up(raw), 10_000);
    }
}
