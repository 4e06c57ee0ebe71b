//! Per-symbol scalping state machine.
//!
//! Driven purely by ticks and fill notices: monitoring derives a dip price
//! from the rolling window (percentile or boundary mode), buys with a
//! limit order, sells the inventory at a small markup and cycles until the
//! signal lifetime expires. Fill detection prefers the WebSocket notice
//! stream; REST polling covers the gaps at a throttled cadence. Every
//! terminal transition cancels outstanding orders first and re-reads the
//! fill state to catch fills that raced the cancel.

use crate::application::scalping::boundary_tracker::{BoundaryEvent, BoundaryTracker};
use crate::application::scalping::models::{
    ExpiryReason, MonitorKind, ScalpingConfig, ScalpingState, SignalContext,
};
use crate::application::scalping::price_tracker::PriceRangeTracker;
use crate::domain::ports::{Broker, OrderStatusQuery};
use crate::domain::tick_size;
use crate::domain::types::{OrderNotice, OrderSide};
use chrono::NaiveDateTime;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Whether the WebSocket fill-notice fast path is currently trustworthy.
/// When it is, the executor skips its scheduled REST polls.
pub trait NoticeGate: Send + Sync {
    fn is_order_notice_active(&self) -> bool;
}

impl NoticeGate for crate::infrastructure::kis::RealtimeStream {
    fn is_order_notice_active(&self) -> bool {
        crate::infrastructure::kis::RealtimeStream::is_order_notice_active(self)
    }
}

const ORDER_CHECK_INTERVAL_SECS: f64 = 3.0;

#[derive(Debug, Clone)]
struct OrderRef {
    id: String,
    branch: String,
    price: i64,
    qty: u32,
    placed_at: NaiveDateTime,
}

struct ExecState {
    phase: ScalpingState,
    signal: Option<SignalContext>,
    tracker: PriceRangeTracker,
    boundary: BoundaryTracker,
    buy_order: Option<OrderRef>,
    sell_order: Option<OrderRef>,
    held_qty: u32,
    held_avg_price: f64,
    cooldown_start: Option<NaiveDateTime>,
    last_order_check: Option<NaiveDateTime>,
}

pub struct ScalpingExecutor {
    symbol: String,
    name: String,
    config: ScalpingConfig,
    broker: Arc<dyn Broker>,
    allocation: f64,
    notice_gate: Option<Arc<dyn NoticeGate>>,
    state: Mutex<ExecState>,
}

impl ScalpingExecutor {
    pub fn new(
        symbol: &str,
        name: &str,
        config: ScalpingConfig,
        broker: Arc<dyn Broker>,
        allocation: f64,
        notice_gate: Option<Arc<dyn NoticeGate>>,
    ) -> Self {
        let tracker = PriceRangeTracker::new(config.window_seconds, config.max_window_seconds);
        let boundary = BoundaryTracker::new(
            config.boundary_window_ticks,
            config.max_boundary_breaches,
            config.min_boundary_range_pct,
            config.max_boundary_range_pct,
            config.boundary_hold_seconds,
            config.percentile_threshold,
        );
        Self {
            symbol: symbol.to_string(),
            name: name.to_string(),
            config,
            broker,
            allocation,
            notice_gate,
            state: Mutex::new(ExecState {
                phase: ScalpingState::Idle,
                signal: None,
                tracker,
                boundary,
                buy_order: None,
                sell_order: None,
                held_qty: 0,
                held_avg_price: 0.0,
                cooldown_start: None,
                last_order_check: None,
            }),
        }
    }

    pub async fn phase(&self) -> ScalpingState {
        self.state.lock().await.phase
    }

    pub async fn is_active(&self) -> bool {
        self.state.lock().await.phase != ScalpingState::Idle
    }

    /// (cycles, total P/L, total trades) of the active signal.
    pub async fn signal_stats(&self) -> Option<(u32, i64, u32)> {
        self.state
            .lock()
            .await
            .signal
            .as_ref()
            .map(|s| (s.cycle_count, s.total_pnl, s.total_trades))
    }

    /// Arm the executor with a buy signal. Ignored while a signal is
    /// already active.
    pub async fn activate_signal(
        &self,
        signal_price: i64,
        signal_time: NaiveDateTime,
        tp_pct: f64,
        sl_pct: f64,
        timeout_minutes: u32,
    ) {
        let mut state = self.state.lock().await;
        if state.phase != ScalpingState::Idle {
            warn!(
                "[scalping][{}] signal ignored: already active ({})",
                self.symbol, state.phase
            );
            return;
        }
        let ctx = SignalContext::new(signal_price, signal_time, tp_pct, sl_pct, timeout_minutes);
        info!(
            "[scalping][{}] signal activated: price={signal_price}, TP={} SL={} timeout={timeout_minutes}m",
            self.name,
            ctx.tp_price(),
            ctx.sl_price()
        );
        state.signal = Some(ctx);
        state.tracker.reset();
        state.boundary.reset();
        self.transition(&mut state, ScalpingState::Monitoring);
    }

    /// Tick entry point. Ticks and fill notices funnel through the same
    /// lock, so the reader task and the poll path never interleave.
    pub async fn on_tick(&self, price: i64, timestamp: NaiveDateTime) {
        let mut state = self.state.lock().await;
        if state.phase == ScalpingState::Idle {
            return;
        }

        state.tracker.add_tick(timestamp, price);
        let boundary_event = if self.config.monitor == MonitorKind::Boundary {
            state.boundary.add_tick(timestamp, price)
        } else {
            None
        };

        if let Some(signal) = &state.signal {
            if let Some(reason) = signal.expiry(timestamp, price) {
                self.handle_signal_expired(&mut state, reason).await;
                return;
            }
        }

        match state.phase {
            ScalpingState::Monitoring => {
                self.handle_monitoring(&mut state, timestamp, boundary_event).await
            }
            ScalpingState::BuyPending => self.handle_buy_pending(&mut state, timestamp).await,
            ScalpingState::PositionHeld => {
                self.handle_position_held(&mut state, price, timestamp).await
            }
            ScalpingState::SellPending => self.handle_sell_pending(&mut state, price, timestamp).await,
            ScalpingState::Cooldown => self.handle_cooldown(&mut state, timestamp),
            ScalpingState::Idle => {}
        }
    }

    /// Route a fill notice. Returns whether it matched one of this
    /// executor's orders.
    pub async fn process_ws_fill(&self, notice: &OrderNotice) -> bool {
        let mut state = self.state.lock().await;
        let matches_buy = state
            .buy_order
            .as_ref()
            .is_some_and(|o| o.id == notice.order_id);
        let matches_sell = state
            .sell_order
            .as_ref()
            .is_some_and(|o| o.id == notice.order_id);
        if matches_buy {
            self.handle_ws_buy_fill(&mut state, notice).await;
            true
        } else if matches_sell {
            self.handle_ws_sell_fill(&mut state, notice);
            true
        } else {
            false
        }
    }

    /// Forced shutdown (EOD liquidation, emergency stop): cancel anything
    /// outstanding, dump inventory at market, return to idle.
    pub async fn deactivate(&self) {
        let mut state = self.state.lock().await;
        if state.phase == ScalpingState::Idle {
            return;
        }
        info!("[scalping][{}] forced shutdown", self.name);
        self.cleanup_all_orders(&mut state).await;
        if state.held_qty > 0 {
            self.market_sell_all(&mut state, "forced shutdown").await;
        } else {
            self.reset_to_idle(&mut state);
        }
    }

    // ---- state handlers -------------------------------------------------

    async fn handle_monitoring(
        &self,
        state: &mut ExecState,
        timestamp: NaiveDateTime,
        boundary_event: Option<BoundaryEvent>,
    ) {
        let signal_price = match &state.signal {
            Some(s) => s.signal_price,
            None => return,
        };

        let buy_price = match self.config.monitor {
            MonitorKind::Percentile => {
                if !state.tracker.is_ready(self.config.min_ticks_for_trade) {
                    return;
                }
                let window = state
                    .tracker
                    .current_window_seconds(self.config.adaptive_window);
                let Some(raw) = state
                    .tracker
                    .percentile(self.config.percentile_threshold, Some(window))
                else {
                    return;
                };
                let buy_price = tick_size::round_down(raw);

                if self.config.trend_filter_enabled {
                    if let Some(ratio) = state.tracker.uptick_ratio(Some(window)) {
                        if ratio < self.config.min_uptick_ratio {
                            debug!(
                                "[scalping][{}] trend gate: uptick ratio {ratio:.2} below {}",
                                self.symbol, self.config.min_uptick_ratio
                            );
                            return;
                        }
                    }
                }
                buy_price
            }
            MonitorKind::Boundary => {
                if boundary_event != Some(BoundaryEvent::Dip) {
                    return;
                }
                if !state.boundary.is_trading_allowed() {
                    warn!(
                        "[scalping][{}] boundary breach budget exhausted ({})",
                        self.symbol,
                        state.boundary.breach_count()
                    );
                    return;
                }
                let Some(raw) = state.boundary.buy_price() else {
                    return;
                };
                tick_size::round_down(raw)
            }
        };

        // Entries only at or below the signal price.
        if buy_price > signal_price {
            return;
        }

        let quantity = match self.broker.buyable_quantity(&self.symbol, buy_price).await {
            Ok((buyable, _)) if buyable > 0 => {
                let qty = ((buyable as f64) * self.allocation / 100.0) as u32;
                let qty = qty.max(1);
                info!(
                    "[scalping][{}] sizing: buyable={buyable}, allocation={}%, order={qty}",
                    self.name, self.allocation
                );
                qty
            }
            Ok(_) => {
                warn!(
                    "[scalping][{}] buyable quantity 0, falling back to position_size {}",
                    self.name, self.config.position_size
                );
                self.config.position_size
            }
            Err(e) => {
                warn!(
                    "[scalping][{}] sizing failed ({e}), falling back to position_size {}",
                    self.name, self.config.position_size
                );
                self.config.position_size
            }
        };
        if quantity == 0 {
            return;
        }

        match self
            .broker
            .place_limit_order(&self.symbol, OrderSide::Buy, quantity, buy_price)
            .await
        {
            Ok(ack) => {
                state.buy_order = Some(OrderRef {
                    id: ack.order_id,
                    branch: ack.branch,
                    price: buy_price,
                    qty: quantity,
                    placed_at: timestamp,
                });
                state.last_order_check = None;
                self.transition(state, ScalpingState::BuyPending);
                info!(
                    "[scalping][{}] buy order: {buy_price} x {quantity} (P{:.0})",
                    self.name, self.config.percentile_threshold
                );
            }
            Err(e) => {
                error!("[scalping][{}] buy order failed: {e}", self.name);
            }
        }
    }

    async fn handle_buy_pending(&self, state: &mut ExecState, timestamp: NaiveDateTime) {
        let Some(buy) = state.buy_order.clone() else {
            self.transition(state, ScalpingState::Monitoring);
            return;
        };

        // Buy timeout: cancel and go back to watching the window.
        let elapsed = (timestamp - buy.placed_at).num_seconds();
        if elapsed >= self.config.buy_timeout_seconds as i64 {
            info!(
                "[scalping][{}] buy timeout ({elapsed}s), cancelling and re-monitoring",
                self.name
            );
            self.cancel_buy_and_return_to_monitoring(state).await;
            return;
        }

        // The notice stream is authoritative while healthy.
        if self.notice_fast_path_active() {
            return;
        }
        if !self.should_poll(state, timestamp) {
            return;
        }

        let status = match self
            .broker
            .order_status(OrderStatusQuery::with_balance_fallback(
                &buy.id,
                &self.symbol,
                buy.qty,
                OrderSide::Buy,
            ))
            .await
        {
            Ok(s) => s,
            Err(e) => {
                warn!("[scalping][{}] buy status poll failed: {e}", self.symbol);
                return;
            }
        };

        if status.filled > state.held_qty {
            let new_fills = status.filled - state.held_qty;
            update_position(state, status.filled, buy.price);
            info!("[scalping][{}] REST fallback buy fill: +{new_fills}", self.name);
        }
        if status.unfilled == 0 && status.filled > 0 {
            state.buy_order = None;
            self.place_sell(state, timestamp).await;
        } else if status.filled > 0 {
            self.transition(state, ScalpingState::PositionHeld);
        }
    }

    async fn handle_position_held(&self, state: &mut ExecState, price: i64, timestamp: NaiveDateTime) {
        // Remaining buy fills, REST fallback only while the notice stream
        // is down.
        if let Some(buy) = state.buy_order.clone() {
            if !self.notice_fast_path_active() && self.should_poll(state, timestamp) {
                match self
                    .broker
                    .order_status(OrderStatusQuery::with_balance_fallback(
                        &buy.id,
                        &self.symbol,
                        buy.qty,
                        OrderSide::Buy,
                    ))
                    .await
                {
                    Ok(status) => {
                        if status.filled > state.held_qty {
                            let new_fills = status.filled - state.held_qty;
                            update_position(state, status.filled, buy.price);
                            info!(
                                "[scalping][{}] REST fallback additional fill: +{new_fills}",
                                self.name
                            );
                        }
                        if status.unfilled == 0 {
                            state.buy_order = None;
                        }
                    }
                    Err(e) => warn!("[scalping][{}] held status poll failed: {e}", self.symbol),
                }
            }
        }

        if state.held_qty == 0 {
            self.transition(state, ScalpingState::Monitoring);
            return;
        }

        // Target reached on the partial inventory: flatten everything.
        let sell_target = self.sell_price_for(state.held_avg_price);
        if price >= sell_target {
            info!(
                "[scalping][{}] partial-fill target hit: {price} >= {sell_target}",
                self.name
            );
            self.cancel_buy_admitting_races(state).await;
            self.market_sell_all(state, "partial-fill take-profit").await;
            return;
        }

        if let Some(signal) = &state.signal {
            if price <= signal.sl_price() {
                warn!("[scalping][{}] stop-loss while holding, selling at market", self.name);
                self.cancel_buy_admitting_races(state).await;
                self.market_sell_all(state, "stop-loss").await;
            }
        }
    }

    async fn handle_sell_pending(&self, state: &mut ExecState, price: i64, timestamp: NaiveDateTime) {
        let Some(sell) = state.sell_order.clone() else {
            if state.held_qty > 0 {
                self.transition(state, ScalpingState::PositionHeld);
            } else {
                state.cooldown_start = Some(timestamp);
                self.transition(state, ScalpingState::Cooldown);
            }
            return;
        };

        // Stop-loss outranks the resting limit sell.
        if let Some(signal) = &state.signal {
            if price <= signal.sl_price() {
                warn!(
                    "[scalping][{}] stop-loss while sell pending, converting to market",
                    self.name
                );
                self.cancel_sell(state).await;
                self.market_sell_all(state, "stop-loss during sell wait").await;
                return;
            }
        }

        if self.notice_fast_path_active() {
            return;
        }
        if !self.should_poll(state, timestamp) {
            return;
        }

        let status = match self
            .broker
            .order_status(OrderStatusQuery::with_balance_fallback(
                &sell.id,
                &self.symbol,
                sell.qty,
                OrderSide::Sell,
            ))
            .await
        {
            Ok(s) => s,
            Err(e) => {
                warn!("[scalping][{}] sell status poll failed: {e}", self.symbol);
                return;
            }
        };

        if status.unfilled == 0 && status.filled > 0 {
            let pnl = ((sell.price as f64 - state.held_avg_price) * status.filled as f64) as i64;
            info!(
                "[scalping][{}] sell filled (REST fallback): {} x {} -> P/L {pnl}",
                self.name, sell.price, status.filled
            );
            record_cycle(state, pnl);
            state.sell_order = None;
            clear_position(state);
            state.cooldown_start = Some(timestamp);
            self.transition(state, ScalpingState::Cooldown);
        }
    }

    fn handle_cooldown(&self, state: &mut ExecState, timestamp: NaiveDateTime) {
        let start = *state.cooldown_start.get_or_insert(timestamp);
        let elapsed = (timestamp - start).num_milliseconds() as f64 / 1000.0;
        if elapsed < self.config.cooldown_seconds {
            return;
        }

        let cycles = state.signal.as_ref().map(|s| s.cycle_count).unwrap_or(0);
        if cycles >= self.config.max_cycles {
            info!(
                "[scalping][{}] cycle budget exhausted ({cycles}/{})",
                self.name, self.config.max_cycles
            );
            self.reset_to_idle(state);
            return;
        }

        state.cooldown_start = None;
        state.boundary.reset_for_new_cycle();
        self.transition(state, ScalpingState::Monitoring);
    }

    // ---- WebSocket fast path -------------------------------------------

    async fn handle_ws_buy_fill(&self, state: &mut ExecState, notice: &OrderNotice) {
        let Some(buy) = state.buy_order.clone() else {
            return;
        };
        // Duplicate suppression: a replayed notice cannot push the fill
        // total past the ordered quantity.
        let remaining = buy.qty.saturating_sub(state.held_qty);
        let actual = notice.filled_qty.min(remaining);
        if actual == 0 {
            debug!(
                "[scalping][{}] duplicate buy notice ignored (order {})",
                self.symbol, notice.order_id
            );
            return;
        }

        update_position(state, state.held_qty + actual, notice.filled_price);

        if state.held_qty >= buy.qty {
            state.buy_order = None;
            info!(
                "[scalping][{}] buy fully filled via WS (+{actual}), selling {} @ avg {:.0}",
                self.name, state.held_qty, state.held_avg_price
            );
            self.place_sell(state, notice_timestamp(notice)).await;
            return;
        }

        if state.phase == ScalpingState::BuyPending {
            self.transition(state, ScalpingState::PositionHeld);
        }
        info!(
            "[scalping][{}] partial buy via WS (+{actual}): {}/{}",
            self.name, state.held_qty, buy.qty
        );
    }

    fn handle_ws_sell_fill(&self, state: &mut ExecState, notice: &OrderNotice) {
        if state.phase == ScalpingState::Cooldown {
            debug!("[scalping][{}] duplicate sell notice ignored", self.symbol);
            return;
        }
        let Some(sell) = state.sell_order.clone() else {
            return;
        };

        if notice.filled_qty >= sell.qty {
            let pnl =
                ((notice.filled_price as f64 - state.held_avg_price) * notice.filled_qty as f64) as i64;
            info!(
                "[scalping][{}] sell filled via WS: {} x {} -> P/L {pnl}",
                self.name, notice.filled_price, notice.filled_qty
            );
            record_cycle(state, pnl);
            state.sell_order = None;
            clear_position(state);
            // The cooldown clock starts on the next tick; notice frames
            // carry only a time of day.
            state.cooldown_start = None;
            self.transition(state, ScalpingState::Cooldown);
        } else {
            debug!(
                "[scalping][{}] partial sell via WS: {}/{}",
                self.symbol, notice.filled_qty, sell.qty
            );
        }
    }

    // ---- signal expiry --------------------------------------------------

    async fn handle_signal_expired(&self, state: &mut ExecState, reason: ExpiryReason) {
        info!("[scalping][{}] signal expired: {reason}", self.name);
        self.cleanup_all_orders(state).await;
        if state.held_qty > 0 {
            self.market_sell_all(state, &reason.to_string()).await;
        } else {
            self.log_signal_summary(state);
            self.reset_to_idle(state);
        }
    }

    // ---- order helpers --------------------------------------------------

    async fn place_sell(&self, state: &mut ExecState, timestamp: NaiveDateTime) {
        if state.held_qty == 0 {
            state.cooldown_start = None;
            self.transition(state, ScalpingState::Cooldown);
            return;
        }

        let sell_price = self.sell_price_for(state.held_avg_price);
        match self
            .broker
            .place_limit_order(&self.symbol, OrderSide::Sell, state.held_qty, sell_price)
            .await
        {
            Ok(ack) => {
                state.sell_order = Some(OrderRef {
                    id: ack.order_id,
                    branch: ack.branch,
                    price: sell_price,
                    qty: state.held_qty,
                    placed_at: timestamp,
                });
                state.last_order_check = None;
                self.transition(state, ScalpingState::SellPending);
                info!(
                    "[scalping][{}] sell order: {sell_price} x {} (avg {:.0} +{:.1}%)",
                    self.name,
                    state.held_qty,
                    state.held_avg_price,
                    self.config.sell_profit_pct * 100.0
                );
            }
            Err(e) => {
                error!(
                    "[scalping][{}] limit sell failed ({e}), selling at market",
                    self.name
                );
                self.market_sell_all(state, "limit sell rejected").await;
            }
        }
    }

    async fn market_sell_all(&self, state: &mut ExecState, reason: &str) {
        if state.held_qty == 0 {
            self.log_signal_summary(state);
            self.reset_to_idle(state);
            return;
        }
        info!(
            "[scalping][{}] market sell: {} shares ({reason})",
            self.name, state.held_qty
        );
        match self
            .broker
            .place_market_order(&self.symbol, OrderSide::Sell, state.held_qty)
            .await
        {
            Ok(_) => {
                // The exact fill price of a market sell is unknown here;
                // the cycle books flat and the daily report reconciles.
                record_cycle(state, 0);
            }
            Err(e) => {
                error!("[scalping][{}] market sell failed: {e}", self.name);
            }
        }
        clear_position(state);
        state.sell_order = None;
        self.log_signal_summary(state);
        self.reset_to_idle(state);
    }

    async fn cancel_buy(&self, state: &ExecState) -> bool {
        let Some(buy) = &state.buy_order else {
            return true;
        };
        match self
            .broker
            .cancel_order(&buy.id, &buy.branch, buy.qty)
            .await
        {
            Ok(()) => {
                info!("[scalping][{}] buy order cancelled", self.name);
                true
            }
            Err(e) => {
                warn!(
                    "[scalping][{}] buy cancel failed (may have filled): {e}",
                    self.name
                );
                false
            }
        }
    }

    async fn cancel_sell(&self, state: &mut ExecState) -> bool {
        let Some(sell) = state.sell_order.clone() else {
            return true;
        };
        let ok = match self
            .broker
            .cancel_order(&sell.id, &sell.branch, sell.qty)
            .await
        {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    "[scalping][{}] sell cancel failed (may have filled): {e}",
                    self.name
                );
                false
            }
        };
        state.sell_order = None;
        ok
    }

    /// Cancel the buy, then re-read the fill state: a fill racing the
    /// cancel still ends up in the inventory.
    async fn cancel_buy_admitting_races(&self, state: &mut ExecState) {
        let Some(buy) = state.buy_order.clone() else {
            return;
        };
        self.cancel_buy(state).await;
        if let Ok(status) = self
            .broker
            .order_status(OrderStatusQuery::with_balance_fallback(
                &buy.id,
                &self.symbol,
                buy.qty,
                OrderSide::Buy,
            ))
            .await
        {
            if status.filled > state.held_qty {
                let extra = status.filled - state.held_qty;
                update_position(state, status.filled, buy.price);
                info!("[scalping][{}] fill during cancel: +{extra}", self.name);
            }
        }
        state.buy_order = None;
    }

    async fn cancel_buy_and_return_to_monitoring(&self, state: &mut ExecState) {
        let Some(buy) = state.buy_order.clone() else {
            self.transition(state, ScalpingState::Monitoring);
            return;
        };
        self.cancel_buy(state).await;

        if let Ok(status) = self
            .broker
            .order_status(OrderStatusQuery::with_balance_fallback(
                &buy.id,
                &self.symbol,
                buy.qty,
                OrderSide::Buy,
            ))
            .await
        {
            if status.filled > 0 {
                update_position(state, status.filled, buy.price);
                state.buy_order = None;
                // Whatever filled gets the normal exit instead of a retry.
                self.place_sell(state, buy.placed_at).await;
                return;
            }
        }
        state.buy_order = None;
        self.transition(state, ScalpingState::Monitoring);
    }

    async fn cleanup_all_orders(&self, state: &mut ExecState) {
        if state.buy_order.is_some() {
            self.cancel_buy_admitting_races(state).await;
        }
        if let Some(sell) = state.sell_order.clone() {
            self.cancel_sell(state).await;
            if let Ok(status) = self
                .broker
                .order_status(OrderStatusQuery::with_balance_fallback(
                    &sell.id,
                    &self.symbol,
                    sell.qty,
                    OrderSide::Sell,
                ))
                .await
            {
                if status.filled > 0 {
                    let pnl =
                        ((sell.price as f64 - state.held_avg_price) * status.filled as f64) as i64;
                    state.held_qty = state.held_qty.saturating_sub(status.filled);
                    if let Some(signal) = &mut state.signal {
                        signal.total_pnl += pnl;
                    }
                }
            }
        }
    }

    // ---- small helpers --------------------------------------------------

    fn notice_fast_path_active(&self) -> bool {
        self.notice_gate
            .as_ref()
            .is_some_and(|g| g.is_order_notice_active())
    }

    fn should_poll(&self, state: &mut ExecState, timestamp: NaiveDateTime) -> bool {
        if let Some(last) = state.last_order_check {
            let elapsed = (timestamp - last).num_milliseconds() as f64 / 1000.0;
            if elapsed < ORDER_CHECK_INTERVAL_SECS {
                return false;
            }
        }
        state.last_order_check = Some(timestamp);
        true
    }

    fn sell_price_for(&self, avg_price: f64) -> i64 {
        let raw = (avg_price * (1.0 + self.config.sell_profit_pct)) as i64;
        tick_size::round_up(raw)
    }

    fn log_signal_summary(&self, state: &ExecState) {
        if let Some(signal) = &state.signal {
            info!(
                "[scalping][{}] signal summary: cycles={}, trades={}, P/L={}",
                self.name, signal.cycle_count, signal.total_trades, signal.total_pnl
            );
        }
    }

    fn reset_to_idle(&self, state: &mut ExecState) {
        state.signal = None;
        state.buy_order = None;
        state.sell_order = None;
        clear_position(state);
        state.cooldown_start = None;
        state.tracker.reset();
        state.boundary.reset();
        self.transition(state, ScalpingState::Idle);
    }

    fn transition(&self, state: &mut ExecState, next: ScalpingState) {
        if state.phase != next {
            debug!("[scalping][{}] {} -> {next}", self.symbol, state.phase);
            state.phase = next;
        }
    }
}

fn update_position(state: &mut ExecState, total_filled: u32, fill_price: i64) {
    if total_filled <= state.held_qty {
        return;
    }
    let new_qty = total_filled - state.held_qty;
    if state.held_qty > 0 {
        let total_cost =
            state.held_avg_price * state.held_qty as f64 + fill_price as f64 * new_qty as f64;
        state.held_avg_price = total_cost / total_filled as f64;
    } else {
        state.held_avg_price = fill_price as f64;
    }
    state.held_qty = total_filled;
}

fn clear_position(state: &mut ExecState) {
    state.held_qty = 0;
    state.held_avg_price = 0.0;
}

fn record_cycle(state: &mut ExecState, pnl: i64) {
    if let Some(signal) = &mut state.signal {
        signal.record_cycle(pnl);
    }
}

fn notice_timestamp(notice: &OrderNotice) -> NaiveDateTime {
    let now = chrono::Local::now().naive_local();
    let t = &notice.fill_time;
    if t.len() >= 6 {
        if let (Ok(h), Ok(m), Ok(s)) = (t[0..2].parse(), t[2..4].parse(), t[4..6].parse()) {
            if let Some(ts) = now.date().and_hms_opt(h, m, s) {
                return ts;
            }
        }
    }
    now
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::mock::MockBroker;
    use chrono::{Duration as ChronoDuration, NaiveDate};

    fn ts(seconds_x10: i64) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 6, 18)
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap()
            + ChronoDuration::milliseconds(seconds_x10 * 100)
    }

    fn notice(order_id: &str, side: OrderSide, filled: u32, price: i64, ordered: u32) -> OrderNotice {
        OrderNotice {
            symbol: "233740".into(),
            order_id: order_id.into(),
            side,
            filled_qty: filled,
            filled_price: price,
            ordered_qty: ordered,
            fill_time: "100005".into(),
        }
    }

    fn executor(broker: Arc<MockBroker>, config: ScalpingConfig) -> ScalpingExecutor {
        ScalpingExecutor::new("233740", "KODEX", config, broker, 10.0, None)
    }

    fn happy_config() -> ScalpingConfig {
        ScalpingConfig {
            sell_profit_pct: 0.001,
            stop_loss_pct: 0.01,
            take_profit_pct: 0.003,
            max_signal_minutes: 60,
            cooldown_seconds: 0.1,
            max_cycles: 2,
            min_ticks_for_trade: 10,
            ..ScalpingConfig::default()
        }
    }

    const RISING_WINDOW: [i64; 12] = [
        9_990, 9_991, 9_995, 9_996, 9_997, 9_998, 10_000, 10_001, 10_002, 10_003, 10_004, 10_005,
    ];

    #[tokio::test]
    async fn happy_path_buy_sell_cycle() {
        let broker = Arc::new(MockBroker::new());
        broker.set_buyable(10, 100_000);
        let exec = executor(broker.clone(), happy_config());

        exec.activate_signal(10_000, ts(0), 0.003, 0.01, 60).await;
        assert_eq!(exec.phase().await, ScalpingState::Monitoring);

        // 12 ticks over ~10s; P10 = 9_991, rounded down to 9_990.
        for (i, price) in RISING_WINDOW.iter().enumerate() {
            exec.on_tick(*price, ts(i as i64 * 8)).await;
        }
        assert_eq!(exec.phase().await, ScalpingState::BuyPending);

        let placed = broker.placed_orders();
        assert_eq!(placed.len(), 1);
        assert_eq!(placed[0].price, Some(9_990));
        // allocation 10% of 10 buyable.
        assert_eq!(placed[0].quantity, 1);

        // WS reports the full buy fill; the sell goes out at
        // 9990 * 1.001 = 9999.99 -> 9999 -> rounded up to 10_000.
        assert!(
            exec.process_ws_fill(&notice("ORD-1", OrderSide::Buy, 1, 9_990, 1))
                .await
        );
        assert_eq!(exec.phase().await, ScalpingState::SellPending);
        let placed = broker.placed_orders();
        assert_eq!(placed.len(), 2);
        assert_eq!(placed[1].side, OrderSide::Sell);
        assert_eq!(placed[1].price, Some(10_000));

        // WS sell fill: cycle P/L = (10000 - 9990) * 1 = 10.
        assert!(
            exec.process_ws_fill(&notice("ORD-2", OrderSide::Sell, 1, 10_000, 1))
                .await
        );
        assert_eq!(exec.phase().await, ScalpingState::Cooldown);
        assert_eq!(exec.signal_stats().await, Some((1, 10, 1)));

        // The first tick starts the cooldown clock, the second lands past
        // it; the signal survives (cycle 1 of 2) and monitoring resumes.
        exec.on_tick(10_001, ts(200)).await;
        assert_eq!(exec.phase().await, ScalpingState::Cooldown);
        exec.on_tick(10_001, ts(202)).await;
        assert_eq!(exec.phase().await, ScalpingState::Monitoring);
    }

    #[tokio::test]
    async fn trend_gate_blocks_downward_window() {
        let broker = Arc::new(MockBroker::new());
        let exec = executor(broker.clone(), happy_config());
        exec.activate_signal(10_000, ts(0), 0.05, 0.05, 60).await;

        // Strictly falling ticks: uptick ratio 0.0 < 0.4.
        for i in 0..12i64 {
            exec.on_tick(9_999 - i, ts(i * 8)).await;
        }
        assert_eq!(exec.phase().await, ScalpingState::Monitoring);
        assert!(broker.placed_orders().is_empty());
    }

    #[tokio::test]
    async fn signal_stop_loss_kills_from_monitoring() {
        let broker = Arc::new(MockBroker::new());
        let exec = executor(broker.clone(), happy_config());
        exec.activate_signal(10_000, ts(0), 0.003, 0.01, 60).await;

        // 1% below the signal price.
        exec.on_tick(9_900, ts(1)).await;
        assert_eq!(exec.phase().await, ScalpingState::Idle);
    }

    #[tokio::test]
    async fn buy_timeout_cancels_and_returns_to_monitoring() {
        let broker = Arc::new(MockBroker::new());
        broker.set_buyable(10, 100_000);
        let mut config = happy_config();
        config.buy_timeout_seconds = 2;
        let exec = executor(broker.clone(), config);
        exec.activate_signal(10_000, ts(0), 0.05, 0.05, 60).await;

        for (i, price) in RISING_WINDOW.iter().enumerate() {
            exec.on_tick(*price, ts(i as i64 * 8)).await;
        }
        assert_eq!(exec.phase().await, ScalpingState::BuyPending);

        // Post-cancel status: nothing filled.
        broker.push_status(0, 1);
        // 3 seconds after the order went out at ~ts(88).
        exec.on_tick(9_995, ts(120)).await;
        assert_eq!(exec.phase().await, ScalpingState::Monitoring);
        assert_eq!(broker.cancelled_orders().len(), 1);
    }

    #[tokio::test]
    async fn partial_fill_then_target_flattens_at_market() {
        let broker = Arc::new(MockBroker::new());
        broker.set_buyable(100, 1_000_000);
        let mut config = happy_config();
        // 50% of 100 buyable -> 50 shares... use allocation via executor arg
        config.buy_timeout_seconds = 60;
        let exec = ScalpingExecutor::new("233740", "KODEX", config, broker.clone(), 2.0, None);
        exec.activate_signal(10_000, ts(0), 0.05, 0.05, 60).await;

        for (i, price) in RISING_WINDOW.iter().enumerate() {
            exec.on_tick(*price, ts(i as i64 * 8)).await;
        }
        // allocation 2% of 100 -> 2 shares at 9_990.
        assert_eq!(broker.placed_orders()[0].quantity, 2);

        // Partial buy fill: 1 of 2.
        exec.process_ws_fill(&notice("ORD-1", OrderSide::Buy, 1, 9_990, 2))
            .await;
        assert_eq!(exec.phase().await, ScalpingState::PositionHeld);

        // Price pops through the held-avg target: cancel the rest of the
        // buy (no extra fills during cancel) and market-sell the share.
        broker.push_status(1, 1);
        exec.on_tick(10_005, ts(100)).await;

        assert_eq!(exec.phase().await, ScalpingState::Idle);
        let placed = broker.placed_orders();
        let market_sell = placed.last().unwrap();
        assert_eq!(market_sell.side, OrderSide::Sell);
        assert_eq!(market_sell.price, None);
        assert_eq!(market_sell.quantity, 1);
        assert_eq!(broker.cancelled_orders().len(), 1);
    }

    #[tokio::test]
    async fn duplicate_ws_buy_notice_cannot_overshoot() {
        let broker = Arc::new(MockBroker::new());
        broker.set_buyable(100, 1_000_000);
        let exec = ScalpingExecutor::new(
            "233740",
            "KODEX",
            happy_config(),
            broker.clone(),
            2.0,
            None,
        );
        exec.activate_signal(10_000, ts(0), 0.05, 0.05, 60).await;
        for (i, price) in RISING_WINDOW.iter().enumerate() {
            exec.on_tick(*price, ts(i as i64 * 8)).await;
        }
        // Ordered 2; a 2-share notice replayed twice must not build a
        // 4-share book. The first fill completes the order and the second
        // no longer matches any active order id.
        exec.process_ws_fill(&notice("ORD-1", OrderSide::Buy, 2, 9_990, 2))
            .await;
        assert_eq!(exec.phase().await, ScalpingState::SellPending);
        let matched = exec
            .process_ws_fill(&notice("ORD-1", OrderSide::Buy, 2, 9_990, 2))
            .await;
        assert!(!matched);
        // Sell order quantity proves the inventory stayed at 2.
        assert_eq!(broker.placed_orders()[1].quantity, 2);
    }

    #[tokio::test]
    async fn max_cycles_retires_the_signal() {
        let broker = Arc::new(MockBroker::new());
        broker.set_buyable(10, 100_000);
        let mut config = happy_config();
        config.max_cycles = 1;
        let exec = executor(broker.clone(), config);
        exec.activate_signal(10_000, ts(0), 0.05, 0.05, 60).await;

        for (i, price) in RISING_WINDOW.iter().enumerate() {
            exec.on_tick(*price, ts(i as i64 * 8)).await;
        }
        exec.process_ws_fill(&notice("ORD-1", OrderSide::Buy, 1, 9_990, 1))
            .await;
        exec.process_ws_fill(&notice("ORD-2", OrderSide::Sell, 1, 10_000, 1))
            .await;
        assert_eq!(exec.phase().await, ScalpingState::Cooldown);

        // Cooldown over, cycle budget spent: back to idle.
        exec.on_tick(10_001, ts(200)).await;
        exec.on_tick(10_001, ts(202)).await;
        assert_eq!(exec.phase().await, ScalpingState::Idle);
    }
}
