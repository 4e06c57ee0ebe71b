//! Order lifecycle management.
//!
//! Owns every order the engine has in flight and the per-symbol pending
//! set that suppresses duplicates. Three submission paths: plain market
//! orders, the limit-chase buy loop, and limit-sell with market fallback.
//! Reconciliation is two-track: the generic `check_fills` pass joins
//! today's broker orders against the active map, while the chase and
//! fallback paths reconcile their own fills inline and are flagged so
//! `check_fills` never double-attributes them.

use crate::application::position_manager::PositionManager;
use crate::domain::ports::{Broker, OrderStatusQuery};
use crate::domain::types::{OrderNotice, OrderSide, OrderStatus};
use crate::infrastructure::persistence::audit::{AuditLog, OrderAuditEvent};
use crate::infrastructure::persistence::database::Store;
use async_trait::async_trait;
use chrono::{Local, NaiveDateTime};
use sqlx::Row;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderState {
    Pending,
    Submitted,
    Partial,
    Filled,
    Cancelled,
    Failed,
}

impl OrderState {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderState::Pending => "pending",
            OrderState::Submitted => "submitted",
            OrderState::Partial => "partial",
            OrderState::Filled => "filled",
            OrderState::Cancelled => "cancelled",
            OrderState::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ManagedOrder {
    pub order_id: String,
    pub symbol: String,
    pub name: String,
    pub side: OrderSide,
    /// Quantity of the currently tracked order; a chase modify rewrites it.
    pub quantity: u32,
    pub price: i64,
    pub strategy_name: Option<String>,
    pub state: OrderState,
    pub filled_qty: u32,
    pub filled_price: i64,
    pub branch: String,
    /// Average cost captured before the position mutates, so realized P/L
    /// survives position removal.
    pub avg_cost_snapshot: f64,
    pub pnl: Option<i64>,
    pub pnl_rate: Option<f64>,
    pub signal_price: i64,
    /// Original target quantity; preserved across chase modifies.
    pub original_quantity: u32,
    pub chase_in_progress: bool,
    pub sell_fallback_in_progress: bool,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl ManagedOrder {
    fn new(
        order_id: &str,
        symbol: &str,
        name: &str,
        side: OrderSide,
        quantity: u32,
        price: i64,
        strategy_name: Option<&str>,
    ) -> Self {
        let now = Local::now().naive_local();
        Self {
            order_id: order_id.to_string(),
            symbol: symbol.to_string(),
            name: name.to_string(),
            side,
            quantity,
            price,
            strategy_name: strategy_name.map(str::to_string),
            state: OrderState::Submitted,
            filled_qty: 0,
            filled_price: 0,
            branch: String::new(),
            avg_cost_snapshot: 0.0,
            pnl: None,
            pnl_rate: None,
            signal_price: 0,
            original_quantity: quantity,
            chase_in_progress: false,
            sell_fallback_in_progress: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(
            self.state,
            OrderState::Pending | OrderState::Submitted | OrderState::Partial
        )
    }

    pub fn is_complete(&self) -> bool {
        matches!(
            self.state,
            OrderState::Filled | OrderState::Cancelled | OrderState::Failed
        )
    }

    pub fn remaining_qty(&self) -> u32 {
        self.quantity.saturating_sub(self.filled_qty)
    }
}

/// Fill notifications for the engine (exit-monitor registration, user
/// notification). Set once at wiring time.
#[async_trait]
pub trait FillListener: Send + Sync {
    async fn on_fill(&self, order: &ManagedOrder, filled_qty: u32, avg_cost: f64);
}

pub struct NoopFillListener;

#[async_trait]
impl FillListener for NoopFillListener {
    async fn on_fill(&self, _order: &ManagedOrder, _filled_qty: u32, _avg_cost: f64) {}
}

#[derive(Default)]
struct Inner {
    active: HashMap<String, ManagedOrder>,
    pending_symbols: HashSet<String>,
}

/// A fill attributed under the lock, to be surfaced to the listener after
/// the lock is released.
struct Notify {
    order: ManagedOrder,
    filled_qty: u32,
    avg_cost: f64,
}

pub struct OrderManager {
    broker: Arc<dyn Broker>,
    positions: Arc<PositionManager>,
    store: Arc<Store>,
    audit: AuditLog,
    inner: Mutex<Inner>,
    liquidation_mode: AtomicBool,
    fill_listener: Arc<dyn FillListener>,
}

impl OrderManager {
    pub fn new(
        broker: Arc<dyn Broker>,
        positions: Arc<PositionManager>,
        store: Arc<Store>,
        audit: AuditLog,
        fill_listener: Arc<dyn FillListener>,
    ) -> Self {
        info!("OrderManager initialized");
        Self {
            broker,
            positions,
            store,
            audit,
            inner: Mutex::new(Inner::default()),
            liquidation_mode: AtomicBool::new(false),
            fill_listener,
        }
    }

    /// Block new buys while sells keep flowing (EOD / emergency stop).
    pub fn enable_liquidation_mode(&self) {
        self.liquidation_mode.store(true, Ordering::SeqCst);
        warn!("liquidation mode ENABLED - buy orders blocked");
    }

    pub fn disable_liquidation_mode(&self) {
        self.liquidation_mode.store(false, Ordering::SeqCst);
        info!("liquidation mode disabled - buy orders re-enabled");
    }

    pub fn is_liquidation_mode(&self) -> bool {
        self.liquidation_mode.load(Ordering::SeqCst)
    }

    pub async fn has_pending(&self, symbol: &str) -> bool {
        self.inner.lock().await.pending_symbols.contains(symbol)
    }

    pub async fn active_orders(&self) -> Vec<ManagedOrder> {
        self.inner.lock().await.active.values().cloned().collect()
    }

    pub async fn get_order(&self, order_id: &str) -> Option<ManagedOrder> {
        self.inner.lock().await.active.get(order_id).cloned()
    }

    /// Market buy with duplicate suppression and an optional deposit check
    /// (1% slippage cushion on the required amount). Returns the accepted
    /// order id; rejections are audited and yield `None`.
    pub async fn place_buy_order(
        &self,
        symbol: &str,
        name: &str,
        quantity: u32,
        strategy_name: &str,
        check_deposit: bool,
        signal_price: i64,
    ) -> Option<String> {
        if self.is_liquidation_mode() {
            warn!("[{symbol}] buy blocked: liquidation in progress");
            return None;
        }
        if self.has_pending(symbol).await {
            warn!("[{symbol}] buy blocked: pending order exists");
            self.audit_rejected(symbol, name, OrderSide::Buy, quantity, 0, strategy_name, "duplicate_order_blocked", None)
                .await;
            return None;
        }

        if check_deposit {
            let price = match self.broker.current_price(symbol).await {
                Ok(p) => p.current_price,
                Err(e) => {
                    error!("[{symbol}] buy blocked: price fetch failed: {e}");
                    self.audit_rejected(symbol, name, OrderSide::Buy, quantity, 0, strategy_name, "price_fetch_failed", None)
                        .await;
                    return None;
                }
            };
            // ceil(price * qty * 1.01): cushion for market-order slippage.
            let required = (price * quantity as i64 * 101 + 99) / 100;
            match self.broker.deposit().await {
                Ok(deposit) if deposit < required => {
                    warn!(
                        "[{symbol}] buy blocked: insufficient deposit (required {required}, available {deposit})"
                    );
                    self.audit_rejected(
                        symbol,
                        name,
                        OrderSide::Buy,
                        quantity,
                        price,
                        strategy_name,
                        "insufficient_deposit",
                        Some(serde_json::json!({"required": required, "available": deposit})),
                    )
                    .await;
                    return None;
                }
                Ok(deposit) => {
                    debug!("[{symbol}] deposit check passed: required {required}, available {deposit}");
                }
                Err(e) => {
                    warn!("[{symbol}] cannot fetch deposit, proceeding without check: {e}");
                }
            }
        }

        let ack = match self.broker.place_market_order(symbol, OrderSide::Buy, quantity).await {
            Ok(ack) => ack,
            Err(e) => {
                error!("[{symbol}] buy rejected by broker: {e}");
                self.audit_rejected(
                    symbol,
                    name,
                    OrderSide::Buy,
                    quantity,
                    0,
                    strategy_name,
                    &format!("broker_rejected: {e}"),
                    None,
                )
                .await;
                return None;
            }
        };

        let mut order = ManagedOrder::new(&ack.order_id, symbol, name, OrderSide::Buy, quantity, ack.price, Some(strategy_name));
        order.signal_price = signal_price;
        order.branch = ack.branch.clone();
        self.register(order.clone()).await;
        self.audit_submitted(&order, None).await;
        info!("buy order placed: {symbol} x {quantity} (id {})", ack.order_id);
        Some(ack.order_id)
    }

    /// Limit-chase buy: submit at the best ask, then re-quote and modify
    /// until filled or the retry budget runs out. Fills racing a modify or
    /// the final cancel are re-checked and admitted before proceeding.
    #[allow(clippy::too_many_arguments)]
    pub async fn place_chase_buy(
        &self,
        symbol: &str,
        name: &str,
        target_qty: u32,
        deposit: i64,
        strategy_name: &str,
        interval: Duration,
        max_retries: u32,
        signal_price: i64,
    ) -> Option<String> {
        if self.is_liquidation_mode() {
            warn!("[{symbol}] chase buy blocked: liquidation in progress");
            return None;
        }
        if self.has_pending(symbol).await {
            warn!("[{symbol}] chase buy blocked: pending order exists");
            return None;
        }

        let ask = match self.broker.best_ask(symbol).await {
            Ok(p) if p > 0 => p,
            _ => {
                error!("[{symbol}] chase buy blocked: best ask unavailable");
                return None;
            }
        };
        let max_by_deposit = (deposit / ask) as u32;
        let order_qty = target_qty.min(max_by_deposit);
        if order_qty < 1 {
            warn!("[{symbol}] chase buy blocked: deposit {deposit} below one share at {ask}");
            return None;
        }

        info!("[{symbol}] chase buy start: {order_qty} @ {ask} (deposit {deposit})");
        let ack = match self
            .broker
            .place_limit_order(symbol, OrderSide::Buy, order_qty, ask)
            .await
        {
            Ok(ack) => ack,
            Err(e) => {
                error!("[{symbol}] chase buy limit order failed: {e}");
                return None;
            }
        };

        let mut order = ManagedOrder::new(&ack.order_id, symbol, name, OrderSide::Buy, order_qty, ask, Some(strategy_name));
        order.signal_price = signal_price;
        order.original_quantity = target_qty;
        order.branch = ack.branch.clone();
        order.chase_in_progress = true;
        self.register(order.clone()).await;
        self.audit_submitted(&order, None).await;

        let mut order_id = ack.order_id.clone();
        let branch = ack.branch.clone();
        let mut current_price = ask;
        // Fills that happened on an order id replaced by a modify; the new
        // order starts its fill count at zero.
        let mut cumulative_pre_modify_cost: i64 = 0;
        let mut cumulative_pre_modify_fills: u32 = 0;

        for retry in 0..max_retries {
            tokio::time::sleep(interval).await;

            let status = match self
                .broker
                .order_status(OrderStatusQuery::by_id(&order_id))
                .await
            {
                Ok(s) => s,
                Err(e) => {
                    warn!("[{symbol}] chase status check failed: {e}");
                    continue;
                }
            };

            if status.unfilled == 0 {
                info!("[{symbol}] chase fully filled: {} shares", status.filled);
                self.admit_chase_fills(&order_id, status.filled, current_price).await;
                self.finish_chase(&order_id, symbol, OrderState::Filled).await;
                break;
            }

            let new_ask = match self.broker.best_ask(symbol).await {
                Ok(p) if p > 0 => p,
                _ => {
                    warn!("[{symbol}] chase ask re-quote failed, waiting");
                    continue;
                }
            };
            if new_ask == current_price {
                debug!("[{symbol}] ask unchanged, waiting ({} unfilled)", status.unfilled);
                continue;
            }

            let mut new_order_qty = if new_ask > current_price {
                // Remaining cash shrinks by what the fills already cost.
                let used = cumulative_pre_modify_cost + status.filled as i64 * current_price;
                let remaining_deposit = deposit - used;
                let affordable = (remaining_deposit / new_ask).max(0) as u32;
                let adjusted = status.unfilled.min(affordable);
                if adjusted < status.unfilled {
                    info!(
                        "[{symbol}] price rose {current_price} -> {new_ask}, qty {} -> {adjusted}",
                        status.unfilled
                    );
                }
                adjusted
            } else {
                status.unfilled
            };
            if new_order_qty == 0 {
                warn!("[{symbol}] chase stopped: no remaining deposit");
                break;
            }

            // Re-check right before modifying: the fill may have raced us.
            let latest = match self
                .broker
                .order_status(OrderStatusQuery::by_id(&order_id))
                .await
            {
                Ok(s) => s,
                Err(e) => {
                    warn!("[{symbol}] chase pre-modify status check failed: {e}");
                    continue;
                }
            };
            if latest.unfilled == 0 {
                info!("[{symbol}] filled before modify: {} shares", latest.filled);
                self.admit_chase_fills(&order_id, latest.filled, current_price).await;
                self.finish_chase(&order_id, symbol, OrderState::Filled).await;
                break;
            }
            if latest.unfilled < new_order_qty {
                info!(
                    "[{symbol}] fills progressed, modify qty {new_order_qty} -> {}",
                    latest.unfilled
                );
                new_order_qty = latest.unfilled;
            }
            // Admit partial fills now so a replaced order id cannot orphan
            // them.
            self.admit_chase_fills(&order_id, latest.filled, current_price).await;

            match self
                .broker
                .modify_order(&order_id, &branch, new_order_qty, new_ask)
                .await
            {
                Ok(new_id) => {
                    let mut inner = self.inner.lock().await;
                    if let Some(mut tracked) = inner.active.remove(&order_id) {
                        cumulative_pre_modify_cost += tracked.filled_qty as i64 * current_price;
                        cumulative_pre_modify_fills += tracked.filled_qty;
                        // The modified order starts with zero fills.
                        tracked.filled_qty = 0;
                        tracked.quantity = new_order_qty;
                        tracked.price = new_ask;
                        tracked.updated_at = Local::now().naive_local();
                        if new_id != order_id {
                            info!("[{symbol}] order id changed: {order_id} -> {new_id}");
                            tracked.order_id = new_id.clone();
                        }
                        inner.active.insert(new_id.clone(), tracked);
                    }
                    drop(inner);
                    order_id = new_id;
                    current_price = new_ask;
                    info!("[{symbol}] chase modify #{}: {new_order_qty} @ {new_ask}", retry + 1);
                }
                Err(e) => {
                    // Usually a fill racing the modify; the next loop pass
                    // re-reads the status.
                    warn!("[{symbol}] chase modify failed: {e}");
                }
            }
        }

        // Admit whatever filled by the time the loop ended.
        if let Ok(final_status) = self
            .broker
            .order_status(OrderStatusQuery::by_id(&order_id))
            .await
        {
            self.admit_chase_fills(&order_id, final_status.filled, current_price).await;

            if final_status.unfilled > 0 {
                let cancel_ok = self
                    .broker
                    .cancel_order(&order_id, &branch, final_status.unfilled)
                    .await
                    .is_ok();

                // Fills can race the cancel; re-read and admit them.
                if let Ok(post_cancel) = self
                    .broker
                    .order_status(OrderStatusQuery::by_id(&order_id))
                    .await
                {
                    self.admit_chase_fills(&order_id, post_cancel.filled, current_price).await;
                }

                let filled_any = self
                    .get_order(&order_id)
                    .await
                    .map(|o| o.filled_qty > 0)
                    .unwrap_or(false);
                let final_state = if filled_any {
                    OrderState::Partial
                } else {
                    OrderState::Cancelled
                };
                if !cancel_ok {
                    warn!("[{symbol}] chase cancel failed - manual review required");
                }
                self.finish_chase(&order_id, symbol, final_state).await;
            } else {
                let already_done = self
                    .get_order(&order_id)
                    .await
                    .map(|o| o.state == OrderState::Filled)
                    .unwrap_or(true);
                if !already_done {
                    self.finish_chase(&order_id, symbol, OrderState::Filled).await;
                }
            }
        }

        // Reflect pre-modify fills for external observers (notifications).
        {
            let mut inner = self.inner.lock().await;
            if let Some(order) = inner.active.get_mut(&order_id) {
                order.filled_qty += cumulative_pre_modify_fills;
            }
        }

        Some(order_id)
    }

    /// Attribute any newly observed chase fills to the position and notify.
    /// The fill price comes from the broker's own order record when
    /// available, the tracked limit price otherwise.
    async fn admit_chase_fills(&self, order_id: &str, total_filled: u32, fallback_price: i64) {
        if total_filled == 0 {
            return;
        }
        let filled_price = self
            .broker
            .today_orders()
            .await
            .ok()
            .and_then(|orders| orders.into_iter().find(|o| o.order_id == order_id))
            .map(|o| o.filled_price)
            .filter(|p| *p > 0)
            .unwrap_or(fallback_price);

        let notify = {
            let mut inner = self.inner.lock().await;
            let Some(order) = inner.active.get_mut(order_id) else {
                return;
            };
            if total_filled <= order.filled_qty {
                return;
            }
            let delta = total_filled - order.filled_qty;
            order.filled_qty = total_filled;
            order.filled_price = filled_price;
            order.updated_at = Local::now().naive_local();
            info!(
                "[{}] chase fill admitted: +{delta} @ {filled_price} (total {total_filled})",
                order.symbol
            );
            Notify {
                order: order.clone(),
                filled_qty: delta,
                avg_cost: 0.0,
            }
        };

        if let Err(e) = self
            .positions
            .add(
                &notify.order.symbol,
                &notify.order.name,
                notify.filled_qty,
                filled_price as f64,
                notify.order.strategy_name.as_deref(),
                order_id,
            )
            .await
        {
            error!("failed to add chase fill to position: {e:#}");
        }
        self.fill_listener
            .on_fill(&notify.order, notify.filled_qty, notify.avg_cost)
            .await;
    }

    async fn finish_chase(&self, order_id: &str, symbol: &str, state: OrderState) {
        let snapshot = {
            let mut inner = self.inner.lock().await;
            inner.pending_symbols.remove(symbol);
            if let Some(order) = inner.active.get_mut(order_id) {
                order.state = state;
                order.chase_in_progress = false;
                order.updated_at = Local::now().naive_local();
                Some(order.clone())
            } else {
                None
            }
        };
        if let Some(order) = snapshot {
            self.update_order_row(&order).await;
        }
    }

    /// Plain market sell. The position's average cost is snapshotted into
    /// the order before any mutation so realized P/L can always be
    /// computed.
    pub async fn place_sell_order(
        &self,
        symbol: &str,
        name: &str,
        quantity: u32,
        strategy_name: Option<&str>,
    ) -> Option<String> {
        if self.has_pending(symbol).await {
            warn!("[{symbol}] sell blocked: pending order exists");
            self.audit_rejected(
                symbol,
                name,
                OrderSide::Sell,
                quantity,
                0,
                strategy_name.unwrap_or(""),
                "duplicate_order_blocked",
                None,
            )
            .await;
            return None;
        }

        let avg_cost = self
            .positions
            .get(symbol)
            .await
            .map(|p| p.avg_price)
            .unwrap_or(0.0);

        let ack = match self.broker.place_market_order(symbol, OrderSide::Sell, quantity).await {
            Ok(ack) => ack,
            Err(e) => {
                error!("[{symbol}] sell rejected by broker: {e}");
                self.audit_rejected(
                    symbol,
                    name,
                    OrderSide::Sell,
                    quantity,
                    0,
                    strategy_name.unwrap_or(""),
                    &format!("broker_rejected: {e}"),
                    None,
                )
                .await;
                return None;
            }
        };

        let mut order = ManagedOrder::new(&ack.order_id, symbol, name, OrderSide::Sell, quantity, ack.price, strategy_name);
        order.avg_cost_snapshot = avg_cost;
        order.branch = ack.branch.clone();
        self.register(order.clone()).await;
        self.audit_submitted(&order, None).await;
        info!("sell order placed: {symbol} x {quantity} (id {})", ack.order_id);
        Some(ack.order_id)
    }

    /// Limit sell at the target price; any remainder unfilled after
    /// `fallback` converts to a market sell carrying the same average-cost
    /// snapshot so P/L stays continuous.
    pub async fn place_sell_with_fallback(
        &self,
        symbol: &str,
        name: &str,
        quantity: u32,
        strategy_name: Option<&str>,
        limit_price: i64,
        fallback: Duration,
    ) -> Option<String> {
        if self.has_pending(symbol).await {
            warn!("[{symbol}] sell blocked: pending order exists");
            self.audit_rejected(
                symbol,
                name,
                OrderSide::Sell,
                quantity,
                limit_price,
                strategy_name.unwrap_or(""),
                "duplicate_order_blocked",
                None,
            )
            .await;
            return None;
        }

        let avg_cost = self
            .positions
            .get(symbol)
            .await
            .map(|p| p.avg_price)
            .unwrap_or(0.0);

        info!(
            "[{symbol}] limit sell start: {quantity} @ {limit_price} (fallback {:?})",
            fallback
        );
        let ack = match self
            .broker
            .place_limit_order(symbol, OrderSide::Sell, quantity, limit_price)
            .await
        {
            Ok(ack) => ack,
            Err(e) => {
                error!("[{symbol}] limit sell failed: {e}");
                self.audit_rejected(
                    symbol,
                    name,
                    OrderSide::Sell,
                    quantity,
                    limit_price,
                    strategy_name.unwrap_or(""),
                    &format!("broker_rejected: {e}"),
                    None,
                )
                .await;
                return None;
            }
        };
        let order_id = ack.order_id.clone();

        let mut order = ManagedOrder::new(&order_id, symbol, name, OrderSide::Sell, quantity, limit_price, strategy_name);
        order.avg_cost_snapshot = avg_cost;
        order.branch = ack.branch.clone();
        order.sell_fallback_in_progress = true;
        self.register(order.clone()).await;
        self.audit_submitted(&order, Some("limit_order_with_fallback")).await;

        tokio::time::sleep(fallback).await;

        let status = match self.broker.order_status(OrderStatusQuery::by_id(&order_id)).await {
            Ok(s) => s,
            Err(e) => {
                warn!("[{symbol}] fallback status check failed: {e}");
                return Some(order_id);
            }
        };

        if status.unfilled == 0 {
            info!("[{symbol}] limit sell fully filled: {} @ {limit_price}", status.filled);
            self.apply_sell_fill(&order_id, status.filled, limit_price, true).await;
            return Some(order_id);
        }

        info!("[{symbol}] limit sell unfilled: {} -> market fallback", status.unfilled);
        let mut known_filled = status.filled;
        if status.filled > 0 {
            self.apply_sell_fill(&order_id, status.filled, limit_price, false).await;
        }

        let cancel_snapshot = self.get_order(&order_id).await;
        if !self.cancel_order(&order_id).await {
            warn!("[{symbol}] limit sell cancel failed, re-checking fills");
            if let Ok(recheck) = self.broker.order_status(OrderStatusQuery::by_id(&order_id)).await {
                if recheck.unfilled == 0 {
                    info!("[{symbol}] cancel failed but order fully filled");
                    self.apply_sell_fill(&order_id, recheck.filled, limit_price, true).await;
                    return Some(order_id);
                }
            }
        } else if let Ok(post_cancel) = self.broker.order_status(OrderStatusQuery::by_id(&order_id)).await {
            // Fills can race the cancel.
            if post_cancel.filled > known_filled {
                info!(
                    "[{symbol}] fills during cancel: {known_filled} -> {}",
                    post_cancel.filled
                );
                self.apply_detached_sell_fill(
                    cancel_snapshot.clone(),
                    post_cancel.filled,
                    limit_price,
                )
                .await;
                known_filled = post_cancel.filled;
            }
            if post_cancel.unfilled == 0 {
                info!("[{symbol}] fully filled after cancel: {known_filled}");
                self.clear_pending(symbol).await;
                return Some(order_id);
            }
        }

        self.clear_pending(symbol).await;
        self.drop_active(&order_id).await;

        // Only resell what the balance still shows.
        let actual_qty = self
            .positions
            .get(symbol)
            .await
            .map(|p| p.quantity)
            .unwrap_or(0);
        if actual_qty == 0 {
            warn!("[{symbol}] market fallback skipped: no remaining balance");
            return Some(order_id);
        }
        let resubmit_qty = quantity
            .saturating_sub(known_filled)
            .min(actual_qty);
        if resubmit_qty == 0 {
            return Some(order_id);
        }

        info!("[{symbol}] market sell fallback: {resubmit_qty} shares");
        let market_ack = match self
            .broker
            .place_market_order(symbol, OrderSide::Sell, resubmit_qty)
            .await
        {
            Ok(ack) => ack,
            Err(e) => {
                error!("[{symbol}] market fallback failed: {e}");
                self.audit_rejected(
                    symbol,
                    name,
                    OrderSide::Sell,
                    resubmit_qty,
                    0,
                    strategy_name.unwrap_or(""),
                    &format!("market_fallback_failed: {e}"),
                    None,
                )
                .await;
                return Some(order_id);
            }
        };

        let mut market_order = ManagedOrder::new(
            &market_ack.order_id,
            symbol,
            name,
            OrderSide::Sell,
            resubmit_qty,
            market_ack.price,
            strategy_name,
        );
        market_order.avg_cost_snapshot = avg_cost;
        self.register(market_order.clone()).await;
        self.audit_submitted(&market_order, Some("market_fallback_from_limit")).await;

        Some(market_ack.order_id)
    }

    /// Attribute a sell fill on the tracked order. `terminal` finishes the
    /// order and clears the pending mark.
    async fn apply_sell_fill(&self, order_id: &str, total_filled: u32, fallback_price: i64, terminal: bool) {
        let filled_price = self
            .broker
            .today_orders()
            .await
            .ok()
            .and_then(|orders| orders.into_iter().find(|o| o.order_id == order_id))
            .map(|o| o.filled_price)
            .filter(|p| *p > 0)
            .unwrap_or(fallback_price);

        let notify = {
            let mut inner = self.inner.lock().await;
            let Some(order) = inner.active.get_mut(order_id) else {
                return;
            };
            if total_filled <= order.filled_qty {
                None
            } else {
                let delta = total_filled - order.filled_qty;
                order.filled_qty = total_filled;
                order.filled_price = filled_price;
                order.updated_at = Local::now().naive_local();
                Some(delta)
            }
        };

        if let Some(delta) = notify {
            let done = self.attribute_fill(order_id, delta).await;
            if let Some(notify) = done {
                self.fill_listener
                    .on_fill(&notify.order, notify.filled_qty, notify.avg_cost)
                    .await;
            }
        }

        if terminal {
            let snapshot = {
                let mut inner = self.inner.lock().await;
                let symbol = inner.active.get(order_id).map(|o| o.symbol.clone());
                if let Some(symbol) = &symbol {
                    inner.pending_symbols.remove(symbol);
                }
                if let Some(mut order) = inner.active.remove(order_id) {
                    order.state = OrderState::Filled;
                    order.sell_fallback_in_progress = false;
                    order.updated_at = Local::now().naive_local();
                    Some(order)
                } else {
                    None
                }
            };
            if let Some(order) = snapshot {
                self.update_order_row(&order).await;
            }
        }
    }

    /// Attribute sell fills observed after the order left the active map
    /// (cancel race). Operates on the caller-provided snapshot.
    async fn apply_detached_sell_fill(
        &self,
        snapshot: Option<ManagedOrder>,
        total_filled: u32,
        fallback_price: i64,
    ) {
        let Some(mut order) = snapshot else { return };
        if total_filled <= order.filled_qty {
            return;
        }
        let delta = total_filled - order.filled_qty;
        order.filled_qty = total_filled;
        order.filled_price = fallback_price;
        self.settle_sell(&mut order, delta).await;
        self.update_order_row(&order).await;
        self.fill_listener
            .on_fill(&order, delta, order.avg_cost_snapshot)
            .await;
    }

    /// Generic fill reconciliation: join today's broker orders against the
    /// active map and process each positive fill delta. Orders whose chase
    /// or fallback flag is set reconcile inline and are skipped here.
    pub async fn check_fills(&self) -> Vec<ManagedOrder> {
        let is_empty = self.inner.lock().await.active.is_empty();
        if is_empty {
            return Vec::new();
        }

        let broker_orders = match self.broker.today_orders().await {
            Ok(orders) => orders,
            Err(e) => {
                warn!("check_fills: today-orders inquiry failed: {e}");
                return Vec::new();
            }
        };
        let by_id: HashMap<String, _> = broker_orders
            .into_iter()
            .map(|o| (o.order_id.clone(), o))
            .collect();

        let mut deltas: Vec<(String, u32)> = Vec::new();
        {
            let mut inner = self.inner.lock().await;
            let ids: Vec<String> = inner.active.keys().cloned().collect();
            for id in ids {
                let Some(broker_order) = by_id.get(&id) else {
                    continue;
                };
                let Some(order) = inner.active.get_mut(&id) else {
                    continue;
                };
                if order.chase_in_progress || order.sell_fallback_in_progress {
                    continue;
                }

                let prev_filled = order.filled_qty;
                // Fill attribution is monotonic; the broker view never
                // shrinks an order's filled quantity.
                if broker_order.filled_qty > prev_filled {
                    order.filled_qty = broker_order.filled_qty;
                }
                if broker_order.filled_price > 0 {
                    order.filled_price = broker_order.filled_price;
                }
                if !broker_order.branch.is_empty() {
                    order.branch = broker_order.branch.clone();
                }
                order.state = match broker_order.status {
                    OrderStatus::Filled => OrderState::Filled,
                    OrderStatus::Partial => OrderState::Partial,
                    OrderStatus::Cancelled => OrderState::Cancelled,
                    _ => order.state,
                };
                order.updated_at = Local::now().naive_local();

                if order.filled_qty > prev_filled {
                    deltas.push((id.clone(), order.filled_qty - prev_filled));
                }
            }
        }

        let mut notifications = Vec::new();
        for (id, delta) in deltas {
            if let Some(notify) = self.attribute_fill(&id, delta).await {
                notifications.push(notify);
            }
        }

        let completed = {
            let mut inner = self.inner.lock().await;
            let done_ids: Vec<String> = inner
                .active
                .values()
                .filter(|o| o.is_complete())
                .map(|o| o.order_id.clone())
                .collect();
            let mut completed = Vec::new();
            for id in done_ids {
                if let Some(order) = inner.active.remove(&id) {
                    inner.pending_symbols.remove(&order.symbol);
                    info!(
                        "order completed: {} {} x {} @ {}",
                        order.symbol, order.side, order.filled_qty, order.filled_price
                    );
                    completed.push(order);
                }
            }
            completed
        };

        for order in &completed {
            self.update_order_row(order).await;
        }
        for notify in notifications {
            self.fill_listener
                .on_fill(&notify.order, notify.filled_qty, notify.avg_cost)
                .await;
        }

        completed
    }

    /// WebSocket fast path: apply one execution notice to a tracked order
    /// without waiting for the next poll. Returns whether the notice
    /// matched an order owned here.
    pub async fn apply_ws_fill(&self, notice: &OrderNotice) -> bool {
        let delta = {
            let mut inner = self.inner.lock().await;
            let Some(order) = inner.active.get_mut(&notice.order_id) else {
                return false;
            };
            if order.chase_in_progress || order.sell_fallback_in_progress {
                // Those paths reconcile inline.
                return true;
            }
            let new_total = order
                .filled_qty
                .saturating_add(notice.filled_qty)
                .min(order.quantity);
            if new_total <= order.filled_qty {
                debug!("duplicate ws fill ignored: {}", notice.order_id);
                return true;
            }
            let delta = new_total - order.filled_qty;
            order.filled_qty = new_total;
            order.filled_price = notice.filled_price;
            order.state = if order.filled_qty >= order.quantity {
                OrderState::Filled
            } else {
                OrderState::Partial
            };
            order.updated_at = Local::now().naive_local();
            delta
        };

        if let Some(notify) = self.attribute_fill(&notice.order_id, delta).await {
            self.fill_listener
                .on_fill(&notify.order, notify.filled_qty, notify.avg_cost)
                .await;
        }

        // Terminal cleanup mirrors check_fills.
        let completed = {
            let mut inner = self.inner.lock().await;
            let is_done = inner
                .active
                .get(&notice.order_id)
                .map(|o| o.is_complete())
                .unwrap_or(false);
            if is_done {
                let order = inner.active.remove(&notice.order_id);
                if let Some(order) = &order {
                    inner.pending_symbols.remove(&order.symbol);
                }
                order
            } else {
                None
            }
        };
        if let Some(order) = completed {
            self.update_order_row(&order).await;
        }
        true
    }

    /// Audit, update the position and accumulate realized P/L for one fill
    /// delta on a tracked order. Returns the listener notification, to be
    /// delivered outside the lock.
    async fn attribute_fill(&self, order_id: &str, delta: u32) -> Option<Notify> {
        if delta == 0 {
            return None;
        }
        let mut snapshot = {
            let inner = self.inner.lock().await;
            inner.active.get(order_id)?.clone()
        };

        self.audit
            .log_order(OrderAuditEvent {
                event_type: "ORDER_FILLED",
                module: "OrderManager",
                symbol: snapshot.symbol.clone(),
                name: snapshot.name.clone(),
                order_id: Some(snapshot.order_id.clone()),
                side: snapshot.side.to_string(),
                quantity: delta,
                price: snapshot.filled_price as f64,
                strategy_name: snapshot.strategy_name.clone().unwrap_or_default(),
                status: "filled",
                reason: None,
                metadata: Some(serde_json::json!({
                    "total_filled": snapshot.filled_qty,
                    "remaining": snapshot.remaining_qty(),
                })),
            })
            .await;

        match snapshot.side {
            OrderSide::Buy => {
                if let Err(e) = self
                    .positions
                    .add(
                        &snapshot.symbol,
                        &snapshot.name,
                        delta,
                        snapshot.filled_price as f64,
                        snapshot.strategy_name.as_deref(),
                        &snapshot.order_id,
                    )
                    .await
                {
                    error!("failed to add fill to position: {e:#}");
                }
            }
            OrderSide::Sell => {
                self.settle_sell(&mut snapshot, delta).await;
                // Propagate the accumulated P/L back to the tracked order.
                let mut inner = self.inner.lock().await;
                if let Some(order) = inner.active.get_mut(order_id) {
                    order.pnl = snapshot.pnl;
                    order.pnl_rate = snapshot.pnl_rate;
                }
            }
        }

        let avg_cost = snapshot.avg_cost_snapshot;
        Some(Notify {
            order: snapshot,
            filled_qty: delta,
            avg_cost,
        })
    }

    /// Sell-side settlement: realized P/L against the pre-captured average
    /// cost, then shrink or remove the position.
    async fn settle_sell(&self, order: &mut ManagedOrder, delta: u32) {
        if let Some(position) = self.positions.get(&order.symbol).await {
            if order.avg_cost_snapshot > 0.0 {
                let this_pnl = ((order.filled_price as f64 - order.avg_cost_snapshot)
                    * delta as f64)
                    .floor() as i64;
                order.pnl = Some(order.pnl.unwrap_or(0) + this_pnl);
                order.pnl_rate = Some(
                    (order.filled_price as f64 - order.avg_cost_snapshot)
                        / order.avg_cost_snapshot
                        * 100.0,
                );
            }
            let remaining = position.quantity as i64 - delta as i64;
            if let Err(e) = self.positions.update_quantity(&order.symbol, remaining).await {
                error!("failed to shrink position after sell: {e:#}");
            }
        }
    }

    /// Cancel one tracked order. On success the order leaves the active
    /// map and the symbol's pending mark clears.
    pub async fn cancel_order(&self, order_id: &str) -> bool {
        let Some(order) = self.get_order(order_id).await else {
            return false;
        };

        match self
            .broker
            .cancel_order(order_id, &order.branch, order.remaining_qty())
            .await
        {
            Ok(()) => {
                let snapshot = {
                    let mut inner = self.inner.lock().await;
                    inner.pending_symbols.remove(&order.symbol);
                    inner.active.remove(order_id).map(|mut o| {
                        o.state = OrderState::Cancelled;
                        o.updated_at = Local::now().naive_local();
                        o
                    })
                };
                if let Some(order) = snapshot {
                    self.update_order_row(&order).await;
                    self.audit
                        .log_order(OrderAuditEvent {
                            event_type: "ORDER_CANCELLED",
                            module: "OrderManager",
                            symbol: order.symbol.clone(),
                            name: order.name.clone(),
                            order_id: Some(order.order_id.clone()),
                            side: order.side.to_string(),
                            quantity: order.remaining_qty(),
                            price: order.price as f64,
                            strategy_name: order.strategy_name.clone().unwrap_or_default(),
                            status: "cancelled",
                            reason: Some("user_requested".into()),
                            metadata: None,
                        })
                        .await;
                }
                true
            }
            Err(e) => {
                warn!("cancel failed for {order_id}: {e}");
                false
            }
        }
    }

    /// Best-effort cancel of everything outstanding. Local pending state
    /// always clears, even when the broker partially fails, so the engine
    /// can proceed (EOD, emergency stop).
    pub async fn cancel_all_pending(&self) -> u32 {
        let cancelled = match self.broker.cancel_all_pending().await {
            Ok(n) => n,
            Err(e) => {
                warn!("broker cancel-all failed: {e}");
                0
            }
        };

        let snapshots = {
            let mut inner = self.inner.lock().await;
            let orders: Vec<ManagedOrder> = inner
                .active
                .values()
                .map(|o| {
                    let mut o = o.clone();
                    o.state = OrderState::Cancelled;
                    o.updated_at = Local::now().naive_local();
                    o
                })
                .collect();
            inner.active.clear();
            inner.pending_symbols.clear();
            orders
        };

        for order in &snapshots {
            self.update_order_row(order).await;
            self.audit
                .log_order(OrderAuditEvent {
                    event_type: "ORDER_CANCELLED",
                    module: "OrderManager",
                    symbol: order.symbol.clone(),
                    name: order.name.clone(),
                    order_id: Some(order.order_id.clone()),
                    side: order.side.to_string(),
                    quantity: order.remaining_qty(),
                    price: order.price as f64,
                    strategy_name: order.strategy_name.clone().unwrap_or_default(),
                    status: "cancelled",
                    reason: Some("cancel_all_pending".into()),
                    metadata: None,
                })
                .await;
        }

        cancelled
    }

    /// Filled-order count for a symbol today (strategy trade budget).
    pub async fn today_trade_count(&self, symbol: &str) -> u32 {
        let today = Local::now().format("%Y-%m-%d").to_string();
        let row = sqlx::query(
            "SELECT COUNT(*) AS cnt FROM orders
             WHERE symbol = ?1 AND substr(created_at, 1, 10) = ?2 AND status = 'filled'",
        )
        .bind(symbol)
        .bind(&today)
        .fetch_one(self.store.reader())
        .await;
        match row {
            Ok(row) => row.get::<i64, _>("cnt") as u32,
            Err(e) => {
                warn!("today_trade_count query failed: {e}");
                0
            }
        }
    }

    async fn clear_pending(&self, symbol: &str) {
        let mut inner = self.inner.lock().await;
        inner.pending_symbols.remove(symbol);
        if let Some(order) = inner
            .active
            .values_mut()
            .find(|o| o.symbol == symbol && o.sell_fallback_in_progress)
        {
            order.sell_fallback_in_progress = false;
        }
    }

    async fn drop_active(&self, order_id: &str) {
        self.inner.lock().await.active.remove(order_id);
    }

    async fn register(&self, order: ManagedOrder) {
        {
            let mut inner = self.inner.lock().await;
            inner.pending_symbols.insert(order.symbol.clone());
            inner.active.insert(order.order_id.clone(), order.clone());
        }
        self.save_order_row(&order).await;
    }

    async fn audit_submitted(&self, order: &ManagedOrder, reason: Option<&str>) {
        self.audit
            .log_order(OrderAuditEvent {
                event_type: "ORDER_SUBMIT",
                module: "OrderManager",
                symbol: order.symbol.clone(),
                name: order.name.clone(),
                order_id: Some(order.order_id.clone()),
                side: order.side.to_string(),
                quantity: order.quantity,
                price: order.price as f64,
                strategy_name: order.strategy_name.clone().unwrap_or_default(),
                status: "submitted",
                reason: reason.map(str::to_string),
                metadata: None,
            })
            .await;
    }

    #[allow(clippy::too_many_arguments)]
    async fn audit_rejected(
        &self,
        symbol: &str,
        name: &str,
        side: OrderSide,
        quantity: u32,
        price: i64,
        strategy_name: &str,
        reason: &str,
        metadata: Option<serde_json::Value>,
    ) {
        self.audit
            .log_order(OrderAuditEvent {
                event_type: "ORDER_REJECTED",
                module: "OrderManager",
                symbol: symbol.to_string(),
                name: name.to_string(),
                order_id: None,
                side: side.to_string(),
                quantity,
                price: price as f64,
                strategy_name: strategy_name.to_string(),
                status: "rejected",
                reason: Some(reason.to_string()),
                metadata,
            })
            .await;
    }

    async fn save_order_row(&self, order: &ManagedOrder) {
        let order = order.clone();
        let result = self
            .store
            .write(move |pool| {
                Box::pin(async move {
                    sqlx::query(
                        "INSERT OR REPLACE INTO orders
                         (order_id, symbol, name, side, order_type, quantity, price,
                          filled_quantity, filled_price, status, strategy_name,
                          created_at, updated_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                    )
                    .bind(&order.order_id)
                    .bind(&order.symbol)
                    .bind(&order.name)
                    .bind(order.side.to_string())
                    .bind(if order.price > 0 { "limit" } else { "market" })
                    .bind(order.quantity as i64)
                    .bind(order.price)
                    .bind(order.filled_qty as i64)
                    .bind(order.filled_price)
                    .bind(order.state.as_str())
                    .bind(&order.strategy_name)
                    .bind(order.created_at.format(TIME_FORMAT).to_string())
                    .bind(order.updated_at.format(TIME_FORMAT).to_string())
                    .execute(&pool)
                    .await?;
                    Ok(())
                })
            })
            .await;
        if let Err(e) = result {
            error!("failed to save order row: {e:#}");
        }
    }

    async fn update_order_row(&self, order: &ManagedOrder) {
        let order = order.clone();
        let result = self
            .store
            .write(move |pool| {
                Box::pin(async move {
                    sqlx::query(
                        "UPDATE orders SET
                            filled_quantity = ?1, filled_price = ?2, status = ?3,
                            pnl = ?4, pnl_rate = ?5, avg_cost = ?6, updated_at = ?7
                         WHERE order_id = ?8",
                    )
                    .bind(order.filled_qty as i64)
                    .bind(order.filled_price)
                    .bind(order.state.as_str())
                    .bind(order.pnl)
                    .bind(order.pnl_rate)
                    .bind(if order.pnl.is_some() {
                        Some(order.avg_cost_snapshot)
                    } else {
                        None
                    })
                    .bind(order.updated_at.format(TIME_FORMAT).to_string())
                    .bind(&order.order_id)
                    .execute(&pool)
                    .await?;
                    Ok(())
                })
            })
            .await;
        if let Err(e) = result {
            error!("failed to update order row: {e:#}");
        }
    }
}
