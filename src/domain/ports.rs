use crate::domain::errors::BrokerError;
use crate::domain::types::{
    AccountBalance, DailyBar, FillStatus, MinuteBar, OrderAck, OrderInfo, OrderSide, StockPrice,
};
use async_trait::async_trait;

pub type BrokerResult<T> = Result<T, BrokerError>;

/// Inputs for an order-status inquiry.
///
/// When `symbol`, `ordered_qty` and `side` are present the gateway may answer
/// from a balance diff instead of the (paper-mode-unreliable) status
/// endpoint: a buy counts as filled up to the held quantity, a sell counts as
/// filled once the position is gone.
#[derive(Debug, Clone)]
pub struct OrderStatusQuery {
    pub order_id: String,
    pub symbol: Option<String>,
    pub ordered_qty: Option<u32>,
    pub side: Option<OrderSide>,
}

impl OrderStatusQuery {
    pub fn by_id(order_id: &str) -> Self {
        Self {
            order_id: order_id.to_string(),
            symbol: None,
            ordered_qty: None,
            side: None,
        }
    }

    pub fn with_balance_fallback(order_id: &str, symbol: &str, qty: u32, side: OrderSide) -> Self {
        Self {
            order_id: order_id.to_string(),
            symbol: Some(symbol.to_string()),
            ordered_qty: Some(qty),
            side: Some(side),
        }
    }
}

/// Synchronous request/response capability of the brokerage REST API.
///
/// The engine only ever talks to this trait; the KIS implementation lives in
/// `infrastructure::kis` and the scripted test double in
/// `infrastructure::mock`.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn current_price(&self, symbol: &str) -> BrokerResult<StockPrice>;

    /// Best ask (level-1 sell quote).
    async fn best_ask(&self, symbol: &str) -> BrokerResult<i64>;

    /// Best bid (level-1 buy quote).
    async fn best_bid(&self, symbol: &str) -> BrokerResult<i64>;

    async fn balance(&self) -> BrokerResult<AccountBalance>;

    async fn place_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: u32,
    ) -> BrokerResult<OrderAck>;

    async fn place_limit_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: u32,
        price: i64,
    ) -> BrokerResult<OrderAck>;

    async fn cancel_order(&self, order_id: &str, branch: &str, quantity: u32) -> BrokerResult<()>;

    /// Modify price/quantity of an open order. Returns the new order id,
    /// which may equal the old one.
    async fn modify_order(
        &self,
        order_id: &str,
        branch: &str,
        quantity: u32,
        new_price: i64,
    ) -> BrokerResult<String>;

    async fn order_status(&self, query: OrderStatusQuery) -> BrokerResult<FillStatus>;

    async fn today_orders(&self) -> BrokerResult<Vec<OrderInfo>>;

    async fn pending_orders(&self) -> BrokerResult<Vec<OrderInfo>>;

    /// Best-effort cancel of every open order; returns how many were
    /// cancelled.
    async fn cancel_all_pending(&self) -> BrokerResult<u32>;

    /// (buyable quantity, max cash) for a symbol at the given price. A zero
    /// price asks the broker to use its own calculation unit price.
    async fn buyable_quantity(&self, symbol: &str, current_price: i64) -> BrokerResult<(u32, i64)>;

    async fn deposit(&self) -> BrokerResult<i64>;

    /// Daily candles between `from` and `to` (YYYYMMDD), newest first.
    async fn daily_candles(&self, symbol: &str, from: &str, to: &str)
    -> BrokerResult<Vec<DailyBar>>;

    /// Up to 30 minute candles anchored at `anchor_hms` (HHMMSS; `None` =
    /// now), newest first. Used to walk history backward.
    async fn minute_candles(
        &self,
        symbol: &str,
        anchor_hms: Option<&str>,
    ) -> BrokerResult<Vec<MinuteBar>>;
}
