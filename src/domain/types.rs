use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

/// Broker-side view of an order's lifecycle, as reported by the daily
/// order inquiry endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Pending,
    Partial,
    Filled,
    Cancelled,
    Rejected,
}

/// Snapshot quote for a single symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StockPrice {
    pub symbol: String,
    pub name: String,
    pub current_price: i64,
    pub prev_close: i64,
    pub change: i64,
    pub change_rate: f64,
    pub open: i64,
    pub high: i64,
    pub low: i64,
    pub volume: i64,
    pub trade_amount: i64,
}

/// A holding as reported by the broker balance endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub symbol: String,
    pub name: String,
    pub quantity: u32,
    pub avg_price: f64,
    pub current_price: i64,
    pub eval_amount: i64,
    pub profit_loss: i64,
    pub profit_rate: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountSummary {
    pub deposit: i64,
    pub total_eval: i64,
    pub total_profit_loss: i64,
}

#[derive(Debug, Clone, Default)]
pub struct AccountBalance {
    pub positions: Vec<BrokerPosition>,
    pub summary: AccountSummary,
}

/// Broker acknowledgement of an accepted order. Rejections surface as
/// [`crate::domain::errors::BrokerError::OrderRejected`].
#[derive(Debug, Clone)]
pub struct OrderAck {
    pub order_id: String,
    /// Branch code returned on limit orders; required for modify/cancel.
    pub branch: String,
    pub price: i64,
    pub order_time: String,
}

/// One row of the broker's today-orders inquiry.
#[derive(Debug, Clone)]
pub struct OrderInfo {
    pub order_id: String,
    pub original_order_id: String,
    pub branch: String,
    pub symbol: String,
    pub name: String,
    pub side: OrderSide,
    pub ordered_qty: u32,
    pub order_price: i64,
    pub filled_qty: u32,
    pub filled_price: i64,
    pub status: OrderStatus,
    pub order_time: String,
}

impl OrderInfo {
    pub fn remaining_qty(&self) -> u32 {
        self.ordered_qty.saturating_sub(self.filled_qty)
    }
}

/// (filled, unfilled) pair from an order-status inquiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FillStatus {
    pub filled: u32,
    pub unfilled: u32,
}

impl FillStatus {
    pub fn new(filled: u32, unfilled: u32) -> Self {
        Self { filled, unfilled }
    }

    pub fn is_complete(&self) -> bool {
        self.unfilled == 0
    }
}

/// Real-time trade tick from the per-symbol WebSocket stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickEvent {
    pub symbol: String,
    pub price: i64,
    pub volume: i64,
    pub cumulative_volume: i64,
    pub change: i64,
    pub change_rate: f64,
    pub open: i64,
    pub high: i64,
    pub low: i64,
    pub timestamp: NaiveDateTime,
}

/// Account-wide execution notice from the WebSocket fill stream. Only
/// emitted for frames that represent an actual fill, never for
/// acknowledgements or cancels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderNotice {
    pub symbol: String,
    pub order_id: String,
    pub side: OrderSide,
    pub filled_qty: u32,
    pub filled_price: i64,
    pub ordered_qty: u32,
    pub fill_time: String,
}

/// Daily OHLCV bar as returned by the daily chart endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyBar {
    /// YYYYMMDD
    pub trade_date: String,
    pub open: i64,
    pub high: i64,
    pub low: i64,
    pub close: i64,
    pub volume: i64,
    pub trade_amount: i64,
    pub change_rate: f64,
}

/// Minute OHLCV bar as returned by the minute chart endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MinuteBar {
    /// YYYYMMDD
    pub trade_date: String,
    /// HHMMSS
    pub time: String,
    pub open: i64,
    pub high: i64,
    pub low: i64,
    pub close: i64,
    pub volume: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_side_display() {
        assert_eq!(OrderSide::Buy.to_string(), "BUY");
        assert_eq!(OrderSide::Sell.to_string(), "SELL");
    }

    #[test]
    fn fill_status_complete() {
        assert!(FillStatus::new(5, 0).is_complete());
        assert!(!FillStatus::new(2, 3).is_complete());
    }

    #[test]
    fn order_info_remaining_never_underflows() {
        let info = OrderInfo {
            order_id: "1".into(),
            original_order_id: "1".into(),
            branch: "".into(),
            symbol: "005930".into(),
            name: "".into(),
            side: OrderSide::Buy,
            ordered_qty: 3,
            order_price: 0,
            filled_qty: 5,
            filled_price: 0,
            status: OrderStatus::Filled,
            order_time: "".into(),
        };
        assert_eq!(info.remaining_qty(), 0);
    }
}
