//! Scripted in-memory broker for tests and dry wiring.
//!
//! Order ids are sequential ("ORD-1", "ORD-2", ...). Quotes and
//! order-status answers are FIFO scripts pushed by the test; the last
//! pushed balance repeats. Market sells settle instantly against the
//! scripted positions so liquidation flows can observe them disappearing.

use crate::domain::errors::BrokerError;
use crate::domain::ports::{Broker, BrokerResult, OrderStatusQuery};
use crate::domain::types::{
    AccountBalance, AccountSummary, BrokerPosition, DailyBar, FillStatus, MinuteBar, OrderAck,
    OrderInfo, OrderSide, StockPrice,
};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq)]
pub struct PlacedOrder {
    pub order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: u32,
    /// `None` for market orders.
    pub price: Option<i64>,
}

#[derive(Default)]
struct MockState {
    next_order_seq: u32,
    prices: HashMap<String, i64>,
    default_price: i64,
    asks: VecDeque<i64>,
    bids: VecDeque<i64>,
    deposit: i64,
    buyable: (u32, i64),
    statuses: VecDeque<FillStatus>,
    today: Vec<OrderInfo>,
    positions: Vec<BrokerPosition>,
    placed: Vec<PlacedOrder>,
    cancelled: Vec<(String, u32)>,
    modified: Vec<(String, u32, i64)>,
    modify_new_ids: VecDeque<String>,
    rejections: VecDeque<String>,
    daily: Vec<DailyBar>,
    minutes: Vec<MinuteBar>,
    settle_market_sells: bool,
}

pub struct MockBroker {
    state: Mutex<MockState>,
}

impl Default for MockBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBroker {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                default_price: 10_000,
                deposit: 100_000_000,
                buyable: (10, 100_000_000),
                settle_market_sells: true,
                ..MockState::default()
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_price(&self, symbol: &str, price: i64) {
        self.lock().prices.insert(symbol.to_string(), price);
    }

    pub fn set_deposit(&self, deposit: i64) {
        self.lock().deposit = deposit;
    }

    pub fn set_buyable(&self, quantity: u32, cash: i64) {
        self.lock().buyable = (quantity, cash);
    }

    pub fn push_ask(&self, price: i64) {
        self.lock().asks.push_back(price);
    }

    /// Queue the next order-status answer. Answers pop FIFO across all
    /// inquiries; an empty queue answers (0, 0).
    pub fn push_status(&self, filled: u32, unfilled: u32) {
        self.lock().statuses.push_back(FillStatus::new(filled, unfilled));
    }

    pub fn set_today_orders(&self, orders: Vec<OrderInfo>) {
        self.lock().today = orders;
    }

    pub fn set_positions(&self, positions: Vec<BrokerPosition>) {
        self.lock().positions = positions;
    }

    pub fn push_modify_new_id(&self, id: &str) {
        self.lock().modify_new_ids.push_back(id.to_string());
    }

    /// Queue a rejection; each order placement consumes one.
    pub fn reject_next_order(&self, message: &str) {
        self.lock().rejections.push_back(message.to_string());
    }

    pub fn placed_orders(&self) -> Vec<PlacedOrder> {
        self.lock().placed.clone()
    }

    pub fn cancelled_orders(&self) -> Vec<(String, u32)> {
        self.lock().cancelled.clone()
    }

    pub fn modified_orders(&self) -> Vec<(String, u32, i64)> {
        self.lock().modified.clone()
    }

    fn place(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: u32,
        price: Option<i64>,
    ) -> BrokerResult<OrderAck> {
        let mut state = self.lock();
        if let Some(message) = state.rejections.pop_front() {
            return Err(BrokerError::OrderRejected { message });
        }
        state.next_order_seq += 1;
        let order_id = format!("ORD-{}", state.next_order_seq);
        state.placed.push(PlacedOrder {
            order_id: order_id.clone(),
            symbol: symbol.to_string(),
            side,
            quantity,
            price,
        });
        if side == OrderSide::Sell && price.is_none() && state.settle_market_sells {
            // Market sells settle instantly in the scripted world.
            state.positions.retain(|p| p.symbol != symbol);
        }
        Ok(OrderAck {
            order_id,
            branch: "91252".to_string(),
            price: price.unwrap_or(0),
            order_time: "100000".to_string(),
        })
    }
}

#[async_trait]
impl Broker for MockBroker {
    async fn current_price(&self, symbol: &str) -> BrokerResult<StockPrice> {
        let state = self.lock();
        let price = *state.prices.get(symbol).unwrap_or(&state.default_price);
        Ok(StockPrice {
            symbol: symbol.to_string(),
            name: format!("mock-{symbol}"),
            current_price: price,
            prev_close: price,
            change: 0,
            change_rate: 0.0,
            open: price,
            high: price,
            low: price,
            volume: 0,
            trade_amount: 0,
        })
    }

    async fn best_ask(&self, symbol: &str) -> BrokerResult<i64> {
        let mut state = self.lock();
        if state.asks.len() > 1 {
            return Ok(state.asks.pop_front().unwrap_or_default());
        }
        if let Some(&front) = state.asks.front() {
            return Ok(front);
        }
        Ok(*state.prices.get(symbol).unwrap_or(&state.default_price))
    }

    async fn best_bid(&self, symbol: &str) -> BrokerResult<i64> {
        let mut state = self.lock();
        if state.bids.len() > 1 {
            return Ok(state.bids.pop_front().unwrap_or_default());
        }
        if let Some(&front) = state.bids.front() {
            return Ok(front);
        }
        Ok(*state.prices.get(symbol).unwrap_or(&state.default_price))
    }

    async fn balance(&self) -> BrokerResult<AccountBalance> {
        let state = self.lock();
        Ok(AccountBalance {
            positions: state.positions.clone(),
            summary: AccountSummary {
                deposit: state.deposit,
                total_eval: state.positions.iter().map(|p| p.eval_amount).sum(),
                total_profit_loss: state.positions.iter().map(|p| p.profit_loss).sum(),
            },
        })
    }

    async fn place_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: u32,
    ) -> BrokerResult<OrderAck> {
        self.place(symbol, side, quantity, None)
    }

    async fn place_limit_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: u32,
        price: i64,
    ) -> BrokerResult<OrderAck> {
        self.place(symbol, side, quantity, Some(price))
    }

    async fn cancel_order(&self, order_id: &str, _branch: &str, quantity: u32) -> BrokerResult<()> {
        self.lock().cancelled.push((order_id.to_string(), quantity));
        Ok(())
    }

    async fn modify_order(
        &self,
        order_id: &str,
        _branch: &str,
        quantity: u32,
        new_price: i64,
    ) -> BrokerResult<String> {
        let mut state = self.lock();
        state
            .modified
            .push((order_id.to_string(), quantity, new_price));
        Ok(state
            .modify_new_ids
            .pop_front()
            .unwrap_or_else(|| order_id.to_string()))
    }

    async fn order_status(&self, _query: OrderStatusQuery) -> BrokerResult<FillStatus> {
        let mut state = self.lock();
        Ok(state.statuses.pop_front().unwrap_or(FillStatus::new(0, 0)))
    }

    async fn today_orders(&self) -> BrokerResult<Vec<OrderInfo>> {
        Ok(self.lock().today.clone())
    }

    async fn pending_orders(&self) -> BrokerResult<Vec<OrderInfo>> {
        Ok(self
            .lock()
            .today
            .iter()
            .filter(|o| o.remaining_qty() > 0)
            .cloned()
            .collect())
    }

    async fn cancel_all_pending(&self) -> BrokerResult<u32> {
        let pending = self.pending_orders().await?;
        let mut state = self.lock();
        for order in &pending {
            state
                .cancelled
                .push((order.order_id.clone(), order.remaining_qty()));
        }
        Ok(pending.len() as u32)
    }

    async fn buyable_quantity(
        &self,
        _symbol: &str,
        _current_price: i64,
    ) -> BrokerResult<(u32, i64)> {
        Ok(self.lock().buyable)
    }

    async fn deposit(&self) -> BrokerResult<i64> {
        Ok(self.lock().deposit)
    }

    async fn daily_candles(
        &self,
        _symbol: &str,
        _from: &str,
        _to: &str,
    ) -> BrokerResult<Vec<DailyBar>> {
        Ok(self.lock().daily.clone())
    }

    async fn minute_candles(
        &self,
        _symbol: &str,
        _anchor_hms: Option<&str>,
    ) -> BrokerResult<Vec<MinuteBar>> {
        Ok(self.lock().minutes.clone())
    }
}
