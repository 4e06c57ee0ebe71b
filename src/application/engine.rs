//! Trading engine: lifecycle controller and strategy host.
//!
//! Owns construction and wiring of every component, the startup/shutdown
//! ordering, crash recovery, cache priming, the scheduler callbacks and
//! the WebSocket event routing. Strategy dispatch happens here: the
//! scheduler path builds a context per symbol tick and routes signals to
//! the order manager; the websocket path feeds ticks to the scalping
//! executors and the exit monitor, and fill notices to whichever component
//! owns the order.

use crate::application::emergency::{EmergencyHandler, EmergencyStop};
use crate::application::exit_monitor::{ExitMonitor, ExitRegistration, ExitSignal, ExitSignalListener};
use crate::application::health::{
    ComponentHealth, HealthChecker, HealthListener, HealthProbe, SystemHealth,
};
use crate::application::liquidation::DailyLiquidation;
use crate::application::order_manager::{FillListener, ManagedOrder, OrderManager};
use crate::application::position_manager::PositionManager;
use crate::application::recovery::RecoveryManager;
use crate::application::scalping::{ScalpingConfig, ScalpingExecutor};
use crate::application::scheduler::{SchedulerHooks, TradingScheduler};
use crate::config::Settings;
use crate::domain::clock;
use crate::domain::ports::Broker;
use crate::domain::types::{OrderNotice, OrderSide, TickEvent};
use crate::infrastructure::kis::{KisBroker, RealtimeStream, SessionManager};
use crate::infrastructure::persistence::audit::AuditLog;
use crate::infrastructure::persistence::daily_candles::{DailyCandle, DailyCandleRepository};
use crate::infrastructure::persistence::database::{MarketDataDb, TradingDb};
use crate::infrastructure::persistence::minute_candles::MinuteCandleRepository;
use crate::notification::{Notifier, SlackNotifier};
use crate::strategies::{PositionView, Strategy, StrategyContext, StrategyRegistry, TradingSignal};
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Local, NaiveDateTime};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, OnceLock};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock, broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

type StrategyKey = (String, String);

/// Exit-monitor registration parameters a strategy attachment may carry.
#[derive(Debug, Clone)]
struct ExitParams {
    take_profit_pct: f64,
    stop_loss_pct: f64,
    max_holding_minutes: u32,
}

fn exit_params_of(entry: &crate::config::StrategyEntry) -> Option<ExitParams> {
    let params = entry.params.as_ref()?;
    if !params
        .get("use_exit_monitor")
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(false)
    {
        return None;
    }
    Some(ExitParams {
        take_profit_pct: params
            .get("take_profit_pct")
            .and_then(serde_json::Value::as_f64)
            .unwrap_or(0.003),
        stop_loss_pct: params
            .get("stop_loss_pct")
            .and_then(serde_json::Value::as_f64)
            .unwrap_or(0.01),
        max_holding_minutes: params
            .get("max_holding_minutes")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(60) as u32,
    })
}

/// Routes exit-monitor signals back into the order manager. The order
/// manager is set once at wiring time.
struct ExitBridge {
    orders: OnceLock<Arc<OrderManager>>,
    names: HashMap<String, String>,
}

#[async_trait]
impl ExitSignalListener for ExitBridge {
    async fn on_exit_signal(&self, signal: ExitSignal) {
        let Some(orders) = self.orders.get() else {
            error!("exit signal before wiring completed: {}", signal.symbol);
            return;
        };
        let name = self
            .names
            .get(&signal.symbol)
            .cloned()
            .unwrap_or_else(|| signal.symbol.clone());
        let order_id = orders
            .place_sell_order(&signal.symbol, &name, signal.quantity, Some(&signal.strategy_name))
            .await;
        match order_id {
            Some(id) => info!(
                "[{}] exit order placed ({}): {id}",
                signal.symbol, signal.reason
            ),
            None => warn!("[{}] exit order rejected ({})", signal.symbol, signal.reason),
        }
    }
}

/// Reacts to fills: registers/releases exit-monitor entries, keeps the
/// stream subscribed, and notifies the user.
struct EngineFillListener {
    exit_monitor: Arc<ExitMonitor>,
    notifier: Arc<dyn Notifier>,
    stream: OnceLock<Arc<RealtimeStream>>,
    exit_params: HashMap<StrategyKey, ExitParams>,
}

#[async_trait]
impl FillListener for EngineFillListener {
    async fn on_fill(&self, order: &ManagedOrder, filled_qty: u32, avg_cost: f64) {
        let strategy = order.strategy_name.clone().unwrap_or_default();
        self.notifier
            .notify_fill(
                &order.side.to_string(),
                &order.symbol,
                &order.name,
                filled_qty,
                order.filled_price,
                &strategy,
                order.pnl.unwrap_or(0),
                order.pnl_rate.unwrap_or(0.0),
            )
            .await;

        match order.side {
            OrderSide::Buy => {
                let key = (order.symbol.clone(), strategy.clone());
                if let Some(params) = self.exit_params.get(&key) {
                    self.exit_monitor
                        .add_position(ExitRegistration {
                            symbol: order.symbol.clone(),
                            strategy_name: strategy,
                            avg_price: order.filled_price as f64,
                            quantity: order.filled_qty,
                            entry_time: Local::now().naive_local(),
                            take_profit_pct: params.take_profit_pct,
                            stop_loss_pct: params.stop_loss_pct,
                            max_holding_minutes: params.max_holding_minutes,
                        })
                        .await;
                    if let Some(stream) = self.stream.get() {
                        stream.subscribe_symbol(&order.symbol).await;
                    }
                }
            }
            OrderSide::Sell => {
                let _ = avg_cost;
                self.exit_monitor.remove_position(&order.symbol).await;
            }
        }
    }
}

/// Cancels everything, notifies and flips the shutdown flag.
struct EngineEmergencyHandler {
    orders: Arc<OrderManager>,
    notifier: Arc<dyn Notifier>,
    shutdown_tx: watch::Sender<bool>,
}

#[async_trait]
impl EmergencyHandler for EngineEmergencyHandler {
    async fn on_emergency_stop(&self, reason: &str) {
        let cancelled = self.orders.cancel_all_pending().await;
        info!("emergency stop: cancelled {cancelled} pending orders");
        self.notifier
            .send_alert(
                "EMERGENCY STOP",
                &format!("reason: {reason}\nall pending orders cancelled"),
                "critical",
            )
            .await;
        let _ = self.shutdown_tx.send(true);
    }
}

struct NotifyOnUnhealthy {
    notifier: Arc<dyn Notifier>,
}

#[async_trait]
impl HealthListener for NotifyOnUnhealthy {
    async fn on_unhealthy(&self, health: &SystemHealth) {
        self.notifier
            .send_alert(
                "system health",
                &format!("unhealthy components: {:?}", health.unhealthy_components()),
                "critical",
            )
            .await;
    }
}

struct AuthProbe {
    session: Arc<SessionManager>,
}

#[async_trait]
impl HealthProbe for AuthProbe {
    async fn check(&self) -> ComponentHealth {
        if self.session.is_token_valid() {
            ComponentHealth::healthy("api")
        } else {
            ComponentHealth::unhealthy("api", "access token invalid")
        }
    }
}

struct SchedulerProbe {
    last_loop: Arc<StdMutex<Instant>>,
}

#[async_trait]
impl HealthProbe for SchedulerProbe {
    async fn check(&self) -> ComponentHealth {
        let elapsed = self
            .last_loop
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .elapsed();
        if elapsed < Duration::from_secs(180) {
            ComponentHealth::healthy("scheduler")
        } else {
            ComponentHealth::degraded("scheduler", &format!("no loop pass for {elapsed:?}"))
        }
    }
}

struct StoreProbe {
    name: &'static str,
    store: Arc<crate::infrastructure::persistence::database::Store>,
}

#[async_trait]
impl HealthProbe for StoreProbe {
    async fn check(&self) -> ComponentHealth {
        match sqlx::query("SELECT 1").fetch_one(self.store.reader()).await {
            Ok(_) => ComponentHealth::healthy(self.name),
            Err(e) => ComponentHealth::unhealthy(self.name, &e.to_string()),
        }
    }
}

/// Shared state behind every callback.
pub struct EngineCore {
    settings: Settings,
    broker: Arc<dyn Broker>,
    minute_repo: MinuteCandleRepository,
    daily_repo: DailyCandleRepository,
    daily_cache: RwLock<HashMap<String, Vec<DailyCandle>>>,
    positions: Arc<PositionManager>,
    orders: Arc<OrderManager>,
    strategies: Mutex<HashMap<StrategyKey, Box<dyn Strategy>>>,
    scalpers: HashMap<String, Arc<ScalpingExecutor>>,
    exit_monitor: Arc<ExitMonitor>,
    notifier: Arc<dyn Notifier>,
    recovery: Arc<RecoveryManager>,
    liquidation: Arc<DailyLiquidation>,
    /// Serializes scheduler and websocket strategy passes.
    tick_lock: Mutex<()>,
    last_loop: Arc<StdMutex<Instant>>,
    liquidation_fired_on: StdMutex<Option<String>>,
    /// Deposit prefetched near the dispatch boundary so chase entries do
    /// not spend their first interval on a balance call.
    deposit_cache: StdMutex<Option<(Instant, i64)>>,
    trading_store: Arc<crate::infrastructure::persistence::database::Store>,
}

impl EngineCore {
    async fn handle_stock_tick(&self, symbol: &str, now: NaiveDateTime) {
        let _tick = self.tick_lock.lock().await;

        let price_info = match self.broker.current_price(symbol).await {
            Ok(p) => p,
            Err(e) => {
                warn!("[{symbol}] price fetch failed: {e}");
                return;
            }
        };
        let name = self.settings.stock_name(symbol);
        info!(
            "[{name}] price: {} ({:+.2}%)",
            price_info.current_price, price_info.change_rate
        );

        let minute_key = clock::minute_key(now);
        if let Err(e) = self
            .minute_repo
            .upsert_realtime(symbol, price_info.current_price, price_info.volume, &minute_key)
            .await
        {
            warn!("[{symbol}] minute upsert failed: {e:#}");
        }
        self.positions.update_price(symbol, price_info.current_price).await;

        if self.orders.has_pending(symbol).await {
            debug!("[{symbol}] pending order exists, skipping signal pass");
            return;
        }

        self.run_strategies(symbol, price_info.current_price, now, false).await;
    }

    /// One strategy pass over a symbol's attachments. `websocket_pass`
    /// selects which execution mode runs.
    async fn run_strategies(
        &self,
        symbol: &str,
        current_price: i64,
        now: NaiveDateTime,
        websocket_pass: bool,
    ) {
        let Some(stock_cfg) = self.settings.stocks.get(symbol) else {
            return;
        };
        if stock_cfg.strategies.is_empty() {
            return;
        }

        let history_depth = {
            let strategies = self.strategies.lock().await;
            stock_cfg
                .strategies
                .iter()
                .filter_map(|e| {
                    strategies
                        .get(&(symbol.to_string(), e.name.clone()))
                        .map(|s| s.required_history())
                })
                .max()
                .unwrap_or(60)
        };

        let minute_history = self
            .minute_repo
            .recent(symbol, history_depth as u32)
            .await
            .unwrap_or_default();
        let daily_candles = self
            .daily_cache
            .read()
            .await
            .get(symbol)
            .cloned()
            .unwrap_or_default();
        let position = self.positions.get(symbol).await;
        let today_trade_count = self.orders.today_trade_count(symbol).await;

        let ctx = StrategyContext {
            symbol: symbol.to_string(),
            name: stock_cfg.name.clone(),
            current_price,
            now,
            minute_history,
            daily_candles,
            position: position
                .as_ref()
                .map(|p| PositionView {
                    quantity: p.quantity,
                    avg_price: p.avg_price,
                }),
            today_trade_count,
        };

        for entry in &stock_cfg.strategies {
            if entry.is_websocket() != websocket_pass {
                continue;
            }
            // Only the owning strategy may manage a held position's exit.
            if !websocket_pass {
                if let Some(p) = &position {
                    if p.strategy_name.as_deref() != Some(entry.name.as_str()) {
                        continue;
                    }
                }
            }

            let signal = {
                let mut strategies = self.strategies.lock().await;
                let Some(strategy) =
                    strategies.get_mut(&(symbol.to_string(), entry.name.clone()))
                else {
                    continue;
                };
                if !strategy.can_generate_signal(&ctx) {
                    continue;
                }
                let signal = strategy.generate_signal(&ctx);
                if signal.is_buy() {
                    strategy.on_entry(&ctx, &signal);
                } else if signal.is_sell() {
                    strategy.on_exit(&ctx, &signal);
                }
                signal
            };

            self.process_signal(&ctx, entry, signal).await;
        }
    }

    async fn process_signal(
        &self,
        ctx: &StrategyContext,
        entry: &crate::config::StrategyEntry,
        signal: TradingSignal,
    ) {
        if signal.is_hold() {
            return;
        }
        let symbol = &ctx.symbol;
        let name = &ctx.name;

        if signal.is_buy() {
            // Websocket-mode buys activate the scalping executor rather
            // than placing an order directly.
            if entry.is_websocket() {
                if let Some(executor) = self.scalpers.get(symbol) {
                    let tp = signal.metadata_f64("take_profit_pct").unwrap_or(0.003);
                    let sl = signal.metadata_f64("stop_loss_pct").unwrap_or(0.01);
                    let timeout_minutes =
                        signal.metadata_u32("timeout_seconds").unwrap_or(3_600) / 60;
                    executor
                        .activate_signal(ctx.current_price, ctx.now, tp, sl, timeout_minutes)
                        .await;
                    self.notifier
                        .notify_signal(
                            "SCALP",
                            symbol,
                            name,
                            signal.quantity,
                            ctx.current_price,
                            &entry.name,
                            &signal.reason,
                        )
                        .await;
                }
                return;
            }

            info!("[{symbol}] buy signal: {}", signal.reason);
            let allocation = self.settings.strategy_allocation(symbol, &entry.name);
            let quantity = match self.broker.buyable_quantity(symbol, 0).await {
                Ok((buyable, _)) if buyable > 0 => {
                    let qty = ((buyable as f64) * allocation / 100.0) as u32;
                    let qty = qty.max(1);
                    info!(
                        "[{symbol}] sizing: {qty} shares (buyable {buyable}, allocation {allocation}%)"
                    );
                    qty
                }
                _ => {
                    warn!(
                        "[{symbol}] buyable inquiry failed, using signal quantity {}",
                        signal.quantity
                    );
                    signal.quantity
                }
            };
            if quantity == 0 {
                return;
            }

            self.notifier
                .notify_signal(
                    "BUY",
                    symbol,
                    name,
                    quantity,
                    ctx.current_price,
                    &entry.name,
                    &signal.reason,
                )
                .await;

            // Slippage-sensitive entries chase the best ask with limit
            // modifies instead of crossing at market.
            let use_chase = entry
                .params
                .as_ref()
                .and_then(|p| p.get("use_chase_entry"))
                .and_then(serde_json::Value::as_bool)
                .unwrap_or(false);
            if use_chase {
                let Some(deposit) = self.deposit_with_prefetch().await else {
                    warn!("[{symbol}] chase entry skipped: deposit unavailable");
                    return;
                };
                let spendable =
                    (deposit as f64 / (1.0 + self.settings.execution.buy_fee_rate)) as i64;
                if let Some(order_id) = self
                    .orders
                    .place_chase_buy(
                        symbol,
                        name,
                        quantity,
                        spendable,
                        &entry.name,
                        Duration::from_millis(500),
                        10,
                        ctx.current_price,
                    )
                    .await
                {
                    info!("[{symbol}] chase buy finished: {order_id}");
                }
                return;
            }

            if let Some(order_id) = self
                .orders
                .place_buy_order(symbol, name, quantity, &entry.name, true, ctx.current_price)
                .await
            {
                info!("[{symbol}] buy order accepted: {order_id}");
            }
        } else if signal.is_sell() {
            // Tentative P/L for the notification only; the fill path
            // computes the real figure.
            let tentative_pnl = ctx
                .position
                .as_ref()
                .map(|p| ((ctx.current_price as f64 - p.avg_price) * signal.quantity as f64) as i64)
                .unwrap_or(0);
            self.notifier
                .notify_signal(
                    "SELL",
                    symbol,
                    name,
                    signal.quantity,
                    ctx.current_price,
                    &entry.name,
                    &signal.reason,
                )
                .await;
            if let Some(order_id) = self
                .orders
                .place_sell_order(symbol, name, signal.quantity, Some(&entry.name))
                .await
            {
                info!(
                    "[{symbol}] sell order accepted: {order_id} (tentative P/L {tentative_pnl:+})"
                );
            }
        }
    }

    async fn handle_tick_event(&self, tick: &TickEvent) {
        self.exit_monitor.on_tick(tick).await;

        if let Some(executor) = self.scalpers.get(&tick.symbol) {
            executor.on_tick(tick.price, tick.timestamp).await;

            // New websocket signals only while the executor is idle.
            if !executor.is_active().await {
                let _guard = self.tick_lock.lock().await;
                let minute_key = clock::minute_key(tick.timestamp);
                let _ = self
                    .minute_repo
                    .upsert_realtime(&tick.symbol, tick.price, tick.cumulative_volume, &minute_key)
                    .await;
                if !self.orders.has_pending(&tick.symbol).await {
                    drop(_guard);
                    self.run_strategies(&tick.symbol, tick.price, tick.timestamp, true).await;
                }
            }
        }
    }

    /// Cached deposit when fresh, a live balance call otherwise.
    async fn deposit_with_prefetch(&self) -> Option<i64> {
        let ttl = Duration::from_secs(self.settings.execution.prefetch_cache_ttl);
        {
            let cache = self.deposit_cache.lock().unwrap_or_else(|e| e.into_inner());
            if let Some((at, deposit)) = *cache {
                if at.elapsed() < ttl {
                    return Some(deposit);
                }
            }
        }
        match self.broker.deposit().await {
            Ok(deposit) => {
                let mut cache = self.deposit_cache.lock().unwrap_or_else(|e| e.into_inner());
                *cache = Some((Instant::now(), deposit));
                Some(deposit)
            }
            Err(e) => {
                warn!("deposit inquiry failed: {e}");
                None
            }
        }
    }

    async fn prefetch_deposit_if_due(&self, now: NaiveDateTime) {
        use chrono::Timelike;
        if now.second() != self.settings.execution.prefetch_second {
            return;
        }
        if let Ok(deposit) = self.broker.deposit().await {
            let mut cache = self.deposit_cache.lock().unwrap_or_else(|e| e.into_inner());
            *cache = Some((Instant::now(), deposit));
            debug!("deposit prefetched: {deposit}");
        }
    }

    async fn handle_order_notice(&self, notice: &OrderNotice) {
        for executor in self.scalpers.values() {
            if executor.process_ws_fill(notice).await {
                return;
            }
        }
        // Not a scalping order: fast-path the generic order manager.
        self.orders.apply_ws_fill(notice).await;
    }

    async fn maybe_run_liquidation(&self, now: NaiveDateTime) {
        if !self.settings.execution.liquidation_enabled {
            return;
        }
        let Some(gate) = clock::parse_hhmm(&self.settings.execution.liquidation_time) else {
            return;
        };
        if now.time() < gate {
            return;
        }
        let today = clock::date_str(now);
        {
            let mut fired = self
                .liquidation_fired_on
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if fired.as_deref() == Some(today.as_str()) {
                return;
            }
            *fired = Some(today);
        }

        info!("end-of-day liquidation gate reached ({})", self.settings.execution.liquidation_time);
        for executor in self.scalpers.values() {
            executor.deactivate().await;
        }
        match self.liquidation.execute().await {
            Ok(result) => info!(
                "liquidation finished: {}/{} sold, P/L {:+}",
                result.successful_orders, result.total_positions, result.total_pnl
            ),
            Err(e) => {
                error!("liquidation failed: {e:#}");
                self.notifier
                    .notify_error("liquidation", &format!("{e:#}"))
                    .await;
            }
        }
    }

    async fn write_daily_summary(&self) {
        let today = Local::now().format("%Y-%m-%d").to_string();
        let date_label = Local::now().format("%Y%m%d").to_string();
        let row = sqlx::query(
            "SELECT COUNT(*) AS trades, COALESCE(SUM(pnl), 0) AS pnl
             FROM orders
             WHERE substr(created_at, 1, 10) = ?1 AND status = 'filled'",
        )
        .bind(&today)
        .fetch_one(self.orders_store().reader())
        .await;
        let (trades, pnl) = match row {
            Ok(row) => {
                use sqlx::Row;
                (row.get::<i64, _>("trades") as u32, row.get::<i64, _>("pnl"))
            }
            Err(e) => {
                warn!("daily summary query failed: {e}");
                return;
            }
        };

        let store = self.orders_store();
        let label = date_label.clone();
        let result = store
            .write(move |pool| {
                Box::pin(async move {
                    sqlx::query(
                        "INSERT OR REPLACE INTO daily_summary
                         (trade_date, total_trades, realized_pnl, updated_at)
                         VALUES (?1, ?2, ?3, ?4)",
                    )
                    .bind(&label)
                    .bind(trades as i64)
                    .bind(pnl)
                    .bind(Local::now().naive_local().to_string())
                    .execute(&pool)
                    .await?;
                    Ok(())
                })
            })
            .await;
        if let Err(e) = result {
            warn!("daily summary write failed: {e:#}");
        }
        self.notifier
            .notify_daily_summary(&date_label, trades, pnl)
            .await;
    }

    fn orders_store(&self) -> Arc<crate::infrastructure::persistence::database::Store> {
        self.trading_store.clone()
    }
}

#[async_trait]
impl SchedulerHooks for EngineCore {
    async fn on_check_fills(&self) {
        {
            let mut last = self.last_loop.lock().unwrap_or_else(|e| e.into_inner());
            *last = Instant::now();
        }
        self.orders.check_fills().await;

        let active: Vec<String> = self
            .orders
            .active_orders()
            .await
            .into_iter()
            .map(|o| o.order_id)
            .collect();
        self.recovery.update_active_orders(active);

        let now = Local::now().naive_local();
        self.prefetch_deposit_if_due(now).await;
        self.maybe_run_liquidation(now).await;
    }

    async fn on_stock_tick(&self, symbol: &str, now: NaiveDateTime) {
        self.handle_stock_tick(symbol, now).await;
    }

    async fn on_market_open(&self) {
        info!("market opened - syncing positions");
        self.notifier.send_message("market opened").await;
        if let Err(e) = self.positions.sync().await {
            warn!("open sync failed: {e:#}");
        }
    }

    async fn on_market_close(&self) {
        info!("market closed");
        let cancelled = self.orders.cancel_all_pending().await;
        info!("cancelled {cancelled} pending orders at close");
        self.write_daily_summary().await;
    }

    async fn on_idle(&self) {
        {
            let mut last = self.last_loop.lock().unwrap_or_else(|e| e.into_inner());
            *last = Instant::now();
        }
        let now = Local::now().naive_local();
        let until = clock::seconds_until(now, &self.settings.schedule.trading_start);
        if until > 0 {
            debug!("idle - {until}s until market open");
        }
    }
}

pub struct TradingEngine {
    core: Arc<EngineCore>,
    settings: Settings,
    session: Arc<SessionManager>,
    market_db: MarketDataDb,
    trading_db: TradingDb,
    stream: Option<Arc<RealtimeStream>>,
    notice_rx: StdMutex<Option<mpsc::Receiver<OrderNotice>>>,
    emergency: Arc<EmergencyStop>,
    health: Arc<HealthChecker>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    session_id: String,
}

impl TradingEngine {
    /// Construct and wire every component. Network is not touched yet;
    /// `start` does that.
    pub async fn build(settings: Settings) -> Result<Self> {
        let session_id = format!(
            "{}-{}",
            Local::now().format("%Y%m%d%H%M%S"),
            std::process::id()
        );
        info!(
            "building TradingEngine (mode {}, session {session_id})",
            settings.mode
        );

        let registry = StrategyRegistry::with_builtins();
        let validation = settings.validate(|name| registry.contains(name));
        if !validation.is_valid() {
            for e in &validation.errors {
                error!("config error: {e}");
            }
            bail!("configuration validation failed: {:?}", validation.errors);
        }

        let market_db = MarketDataDb::open(&settings.market_data_db_path())
            .await
            .context("failed to open market data store")?;
        let trading_db = TradingDb::open(&settings.trading_db_path())
            .await
            .context("failed to open trading store")?;

        let audit = AuditLog::new(trading_db.store(), &session_id);
        let notifier = SlackNotifier::from_settings(&settings);

        let session = Arc::new(SessionManager::new(&settings)?);
        let broker: Arc<dyn Broker> = Arc::new(KisBroker::new(session.clone()));

        let positions = Arc::new(PositionManager::new(
            broker.clone(),
            trading_db.store(),
            audit.clone(),
        ));

        // Exit-monitor wiring: the bridge gets the order manager after it
        // exists.
        let exit_bridge = Arc::new(ExitBridge {
            orders: OnceLock::new(),
            names: settings
                .stocks
                .iter()
                .map(|(code, cfg)| (code.clone(), cfg.name.clone()))
                .collect(),
        });
        let exit_monitor = Arc::new(ExitMonitor::new(exit_bridge.clone()));

        let mut exit_params = HashMap::new();
        for (symbol, stock) in &settings.stocks {
            for entry in &stock.strategies {
                if let Some(params) = exit_params_of(entry) {
                    exit_params.insert((symbol.clone(), entry.name.clone()), params);
                }
            }
        }
        let fill_listener = Arc::new(EngineFillListener {
            exit_monitor: exit_monitor.clone(),
            notifier: notifier.clone(),
            stream: OnceLock::new(),
            exit_params,
        });

        let orders = Arc::new(OrderManager::new(
            broker.clone(),
            positions.clone(),
            trading_db.store(),
            audit,
            fill_listener.clone(),
        ));
        let _ = exit_bridge.orders.set(orders.clone());

        // Realtime stream only when websocket strategies exist.
        let ws_symbols = settings.websocket_symbols();
        let (stream, notice_rx) = if ws_symbols.is_empty() {
            (None, None)
        } else {
            let (stream, notice_rx) = RealtimeStream::new(&settings, session.clone());
            let _ = fill_listener.stream.set(stream.clone());
            (Some(stream), Some(notice_rx))
        };

        // One scalping executor per websocket symbol.
        let mut scalpers = HashMap::new();
        for symbol in &ws_symbols {
            let Some(stock) = settings.stocks.get(symbol) else {
                continue;
            };
            let Some(entry) = stock.strategies.iter().find(|e| e.is_websocket()) else {
                continue;
            };
            let config = entry
                .params
                .as_ref()
                .map(ScalpingConfig::from_params)
                .unwrap_or_default();
            let gate = stream
                .clone()
                .map(|s| s as Arc<dyn crate::application::scalping::executor::NoticeGate>);
            scalpers.insert(
                symbol.clone(),
                Arc::new(ScalpingExecutor::new(
                    symbol,
                    &stock.name,
                    config,
                    broker.clone(),
                    entry.allocation,
                    gate,
                )),
            );
        }

        // Strategy instances, one per (symbol, attachment).
        let mut strategies: HashMap<StrategyKey, Box<dyn Strategy>> = HashMap::new();
        for (symbol, stock) in &settings.stocks {
            for entry in &stock.strategies {
                let params = entry.params.clone().unwrap_or(serde_json::Value::Null);
                if let Some(instance) = registry.build(&entry.name, &params) {
                    strategies.insert((symbol.clone(), entry.name.clone()), instance);
                }
            }
        }
        info!("loaded {} strategy instances", strategies.len());

        let recovery = Arc::new(RecoveryManager::new(&settings.state_dir)?);
        let emergency = Arc::new(EmergencyStop::new(&settings.state_dir)?);
        let liquidation = Arc::new(DailyLiquidation::new(
            orders.clone(),
            positions.clone(),
            notifier.clone(),
        ));
        let health = Arc::new(HealthChecker::new(Arc::new(NotifyOnUnhealthy {
            notifier: notifier.clone(),
        })));

        let (shutdown_tx, _) = watch::channel(false);

        let core = Arc::new(EngineCore {
            settings: settings.clone(),
            broker,
            minute_repo: MinuteCandleRepository::new(market_db.store()),
            daily_repo: DailyCandleRepository::new(market_db.store()),
            daily_cache: RwLock::new(HashMap::new()),
            positions,
            orders,
            strategies: Mutex::new(strategies),
            scalpers,
            exit_monitor,
            notifier,
            recovery,
            liquidation,
            tick_lock: Mutex::new(()),
            last_loop: Arc::new(StdMutex::new(Instant::now())),
            liquidation_fired_on: StdMutex::new(None),
            deposit_cache: StdMutex::new(None),
            trading_store: trading_db.store(),
        });

        Ok(Self {
            core,
            settings,
            session,
            market_db,
            trading_db,
            stream,
            notice_rx: StdMutex::new(notice_rx),
            emergency,
            health,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            session_id,
        })
    }

    /// Full startup sequence.
    pub async fn start(&self) -> Result<()> {
        let shutdown = self.shutdown_tx.subscribe();

        // Previous crash: report and continue; positions resync below
        // treats local state as a suspect cache.
        if let Some(crashed) = self.core.recovery.check_previous_crash() {
            warn!(
                "recovered from crash: session {} ({} open orders)",
                crashed.session_id,
                crashed.active_orders.len()
            );
            self.core
                .notifier
                .send_alert(
                    "crash recovery",
                    &format!(
                        "previous session {} crashed (last heartbeat {}); resyncing from broker",
                        crashed.session_id, crashed.last_heartbeat
                    ),
                    "warning",
                )
                .await;
        }

        info!("authenticating...");
        self.session
            .authenticate()
            .await
            .context("authentication failed")?;
        self.track(self.session.spawn_refresh_task(shutdown.clone())).await;

        // Balance printout doubles as the API connectivity check.
        let balance = self
            .core
            .broker
            .balance()
            .await
            .context("API connectivity check failed")?;
        info!(
            "account: deposit {} KRW, eval {} KRW, P/L {:+} KRW, {} holdings",
            balance.summary.deposit,
            balance.summary.total_eval,
            balance.summary.total_profit_loss,
            balance.positions.len()
        );

        self.core.positions.load().await?;
        self.core.positions.sync().await?;

        info!("priming candle caches...");
        self.prime_daily_candles().await;
        self.prime_minute_candles().await;

        self.core.exit_monitor.start();

        // Health probes.
        self.health
            .register(Arc::new(AuthProbe {
                session: self.session.clone(),
            }))
            .await;
        self.health
            .register(Arc::new(StoreProbe {
                name: "market_db",
                store: self.market_db.store(),
            }))
            .await;
        self.health
            .register(Arc::new(StoreProbe {
                name: "trading_db",
                store: self.trading_db.store(),
            }))
            .await;
        self.health
            .register(Arc::new(SchedulerProbe {
                last_loop: self.core.last_loop.clone(),
            }))
            .await;
        self.track(self.health.spawn(shutdown.clone())).await;

        self.core.recovery.start_session(&self.session_id)?;
        self.track(self.core.recovery.spawn_heartbeat(shutdown.clone())).await;

        let emergency_handler = Arc::new(EngineEmergencyHandler {
            orders: self.core.orders.clone(),
            notifier: self.core.notifier.clone(),
            shutdown_tx: self.shutdown_tx.clone(),
        });
        self.track(self.emergency.spawn_watcher(emergency_handler, shutdown.clone()))
            .await;

        // Realtime stream + event routers.
        if let Some(stream) = &self.stream {
            if let Some(handle) = stream.start(self.settings.websocket_symbols(), shutdown.clone())
            {
                self.track(handle).await;
            }
            let tick_rx = stream.subscribe_ticks();
            self.track(spawn_tick_router(self.core.clone(), tick_rx, shutdown.clone()))
                .await;
            if let Some(notice_rx) = self
                .notice_rx
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take()
            {
                self.track(spawn_notice_router(self.core.clone(), notice_rx, shutdown.clone()))
                    .await;
            }
        }

        let scheduler = Arc::new(TradingScheduler::new(
            &self.settings,
            self.core.clone() as Arc<dyn SchedulerHooks>,
        ));
        self.track(scheduler.spawn(shutdown)).await;

        self.core
            .notifier
            .notify_start(&self.settings.mode.to_string(), self.settings.stocks.len())
            .await;
        info!("TradingEngine started");
        Ok(())
    }

    /// Block until something flips the shutdown flag (emergency stop) or
    /// the caller's signal fires.
    pub async fn wait_for_shutdown(&self) {
        let mut rx = self.shutdown_tx.subscribe();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Graceful stop: watchers first, then the scheduler and stream, then
    /// order cleanup, then bookkeeping.
    pub async fn stop(&self) {
        info!("stopping TradingEngine...");
        let _ = self.shutdown_tx.send(true);

        let handles: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for handle in handles {
            if tokio::time::timeout(Duration::from_secs(5), handle).await.is_err() {
                warn!("worker task did not stop within 5s, detaching");
            }
        }

        let cancelled = self.core.orders.cancel_all_pending().await;
        info!("cancelled {cancelled} pending orders on stop");

        self.core.exit_monitor.stop().await;

        if let Err(e) = self.core.recovery.stop_session() {
            error!("failed to record clean stop: {e:#}");
        }

        self.core.notifier.notify_stop().await;
        self.market_db.close().await;
        self.trading_db.close().await;
        info!("TradingEngine stopped");
    }

    async fn track(&self, handle: JoinHandle<()>) {
        self.tasks.lock().await.push(handle);
    }

    /// 100+ trading days of dailies per symbol: a 150-calendar-day window
    /// covers weekends and holidays. Persisted and cached for contexts.
    async fn prime_daily_candles(&self) {
        let today = Local::now();
        let end = today.format("%Y%m%d").to_string();
        let start = (today - ChronoDuration::days(150)).format("%Y%m%d").to_string();

        for symbol in self.settings.stocks.keys() {
            match self.core.broker.daily_candles(symbol, &start, &end).await {
                Ok(bars) if !bars.is_empty() => {
                    let mut candles: Vec<DailyCandle> = bars
                        .iter()
                        .map(|bar| DailyCandle::from_bar(symbol, bar))
                        .collect();
                    if let Err(e) = self.core.daily_repo.upsert_batch(candles.clone()).await {
                        warn!("[{symbol}] daily candle persist failed: {e:#}");
                    }
                    candles.sort_by(|a, b| a.trade_date.cmp(&b.trade_date));
                    info!("[{symbol}] loaded {} daily candles", candles.len());
                    self.core
                        .daily_cache
                        .write()
                        .await
                        .insert(symbol.clone(), candles);
                }
                Ok(_) => warn!("[{symbol}] no daily candle data"),
                Err(e) => warn!("[{symbol}] daily candle load failed: {e}"),
            }
        }
    }

    /// Two backward walks of up to 30 minute-bars each seed the 60 bars
    /// most strategies need, filtered to session hours.
    async fn prime_minute_candles(&self) {
        for symbol in self.settings.stocks.keys() {
            let mut saved = 0usize;
            let first = match self.core.broker.minute_candles(symbol, None).await {
                Ok(bars) => bars,
                Err(e) => {
                    warn!("[{symbol}] minute candle load failed: {e}");
                    continue;
                }
            };
            saved += self.save_minute_bars(symbol, &first).await;

            if let Some(oldest) = first.last() {
                if oldest.time.len() >= 6 {
                    match self
                        .core
                        .broker
                        .minute_candles(symbol, Some(&oldest.time))
                        .await
                    {
                        Ok(second) => saved += self.save_minute_bars(symbol, &second).await,
                        Err(e) => warn!("[{symbol}] second minute walk failed: {e}"),
                    }
                }
            }
            info!("[{symbol}] seeded {saved} minute candles (session hours only)");
        }
    }

    async fn save_minute_bars(
        &self,
        symbol: &str,
        bars: &[crate::domain::types::MinuteBar],
    ) -> usize {
        let mut saved = 0usize;
        for bar in bars {
            if bar.trade_date.len() < 8 || bar.time.len() < 4 {
                continue;
            }
            let hhmm = &bar.time[..4];
            if !("0900".."1531").contains(&hhmm) {
                continue;
            }
            let minute_key = format!("{}_{}", bar.trade_date, hhmm);
            match self
                .core
                .minute_repo
                .upsert_realtime(symbol, bar.close, bar.volume, &minute_key)
                .await
            {
                Ok(()) => saved += 1,
                Err(e) => warn!("[{symbol}] minute bar save failed: {e:#}"),
            }
        }
        saved
    }
}

fn spawn_tick_router(
    core: Arc<EngineCore>,
    mut rx: broadcast::Receiver<TickEvent>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
                result = rx.recv() => match result {
                    Ok(tick) => core.handle_tick_event(&tick).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        // Ticks are droppable; the window refills.
                        warn!("tick router lagged, dropped {n} ticks");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                },
            }
        }
    })
}

fn spawn_notice_router(
    core: Arc<EngineCore>,
    mut rx: mpsc::Receiver<OrderNotice>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
                notice = rx.recv() => match notice {
                    Some(notice) => core.handle_order_notice(&notice).await,
                    None => return,
                },
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::exit_monitor::ExitMonitor;
    use crate::application::order_manager::NoopFillListener;
    use crate::config::{Credentials, TradingMode};
    use crate::infrastructure::mock::MockBroker;
    use chrono::NaiveDate;
    use std::path::PathBuf;

    const CONFIG: &str = r#"
schedule:
  trading_start: "09:00"
  trading_end: "15:30"
stocks:
  "005930":
    name: Samsung
    strategies:
      - name: bollinger_band
        allocation: 50
  "233740":
    name: KODEX
    strategies:
      - name: scalping_range
        allocation: 10
        execution_mode: websocket
"#;

    struct Fixture {
        _dir: tempfile::TempDir,
        broker: Arc<MockBroker>,
        core: Arc<EngineCore>,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::from_parts(
            TradingMode::Paper,
            CONFIG,
            Credentials::default(),
            dir.path().to_path_buf(),
        )
        .unwrap();

        let market_db = MarketDataDb::open(&dir.path().join("m.db")).await.unwrap();
        let trading_db = TradingDb::open(&dir.path().join("t.db")).await.unwrap();
        let audit = AuditLog::new(trading_db.store(), "sess-test");
        let broker_mock = Arc::new(MockBroker::new());
        let broker: Arc<dyn Broker> = broker_mock.clone();

        let positions = Arc::new(PositionManager::new(
            broker.clone(),
            trading_db.store(),
            audit.clone(),
        ));
        let orders = Arc::new(OrderManager::new(
            broker.clone(),
            positions.clone(),
            trading_db.store(),
            audit,
            Arc::new(NoopFillListener),
        ));
        let exit_bridge = Arc::new(ExitBridge {
            orders: OnceLock::new(),
            names: HashMap::new(),
        });
        let _ = exit_bridge.orders.set(orders.clone());
        let exit_monitor = Arc::new(ExitMonitor::new(exit_bridge));

        let registry = StrategyRegistry::with_builtins();
        let mut strategies: HashMap<StrategyKey, Box<dyn Strategy>> = HashMap::new();
        for (symbol, stock) in &settings.stocks {
            for entry in &stock.strategies {
                let params = entry.params.clone().unwrap_or(serde_json::Value::Null);
                strategies.insert(
                    (symbol.clone(), entry.name.clone()),
                    registry.build(&entry.name, &params).unwrap(),
                );
            }
        }

        let mut scalpers = HashMap::new();
        scalpers.insert(
            "233740".to_string(),
            Arc::new(ScalpingExecutor::new(
                "233740",
                "KODEX",
                ScalpingConfig::default(),
                broker.clone(),
                10.0,
                None,
            )),
        );

        let liquidation = Arc::new(DailyLiquidation::new(
            orders.clone(),
            positions.clone(),
            Arc::new(crate::notification::LogNotifier),
        ));
        let recovery = Arc::new(RecoveryManager::new(&dir.path().join("state")).unwrap());

        let core = Arc::new(EngineCore {
            settings,
            broker,
            minute_repo: MinuteCandleRepository::new(market_db.store()),
            daily_repo: DailyCandleRepository::new(market_db.store()),
            daily_cache: RwLock::new(HashMap::new()),
            positions,
            orders,
            strategies: Mutex::new(strategies),
            scalpers,
            exit_monitor,
            notifier: Arc::new(crate::notification::LogNotifier),
            recovery,
            liquidation,
            tick_lock: Mutex::new(()),
            last_loop: Arc::new(StdMutex::new(Instant::now())),
            liquidation_fired_on: StdMutex::new(None),
            deposit_cache: StdMutex::new(None),
            trading_store: trading_db.store(),
        });

        Fixture {
            _dir: dir,
            broker: broker_mock,
            core,
        }
    }

    fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 6, 18)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    fn tick(symbol: &str, price: i64, ts: NaiveDateTime) -> TickEvent {
        TickEvent {
            symbol: symbol.into(),
            price,
            volume: 10,
            cumulative_volume: 1_000,
            change: 0,
            change_rate: 0.0,
            open: price,
            high: price,
            low: price,
            timestamp: ts,
        }
    }

    #[tokio::test]
    async fn scheduler_tick_routes_buy_signal_with_allocation_sizing() {
        let f = fixture().await;

        // Band-piercing setup: stable alternating closes, then a drop.
        for i in 0..15u32 {
            let close = if i % 2 == 0 { 10_010 } else { 9_990 };
            f.core
                .minute_repo
                .upsert_realtime("005930", close, 100, &format!("20250618_09{:02}", 10 + i))
                .await
                .unwrap();
        }
        f.broker.set_price("005930", 9_900);
        f.broker.set_buyable(10, 100_000_000);

        f.core.handle_stock_tick("005930", at(9, 30, 0)).await;

        let placed = f.broker.placed_orders();
        assert_eq!(placed.len(), 1, "one market buy expected");
        assert_eq!(placed[0].symbol, "005930");
        assert_eq!(placed[0].side, OrderSide::Buy);
        // 50% allocation of 10 buyable.
        assert_eq!(placed[0].quantity, 5);
        assert!(f.core.orders.has_pending("005930").await);
    }

    #[tokio::test]
    async fn pending_order_gates_the_strategy_pass() {
        let f = fixture().await;
        for i in 0..15u32 {
            let close = if i % 2 == 0 { 10_010 } else { 9_990 };
            f.core
                .minute_repo
                .upsert_realtime("005930", close, 100, &format!("20250618_09{:02}", 10 + i))
                .await
                .unwrap();
        }
        f.broker.set_price("005930", 9_900);

        f.core.handle_stock_tick("005930", at(9, 30, 0)).await;
        assert_eq!(f.broker.placed_orders().len(), 1);

        // Same setup again: the pending order suppresses a second pass.
        f.core.handle_stock_tick("005930", at(9, 30, 5)).await;
        assert_eq!(f.broker.placed_orders().len(), 1);
    }

    #[tokio::test]
    async fn websocket_tick_activates_the_scalping_executor() {
        let f = fixture().await;
        // Seed the 10:00 three-minute bar open at 10_000.
        f.core
            .minute_repo
            .upsert_realtime("233740", 10_000, 100, "20250618_1000")
            .await
            .unwrap();

        // 9_975 is 0.25% below the bar open: past the 0.2% threshold.
        f.core
            .handle_tick_event(&tick("233740", 9_975, at(10, 1, 30)))
            .await;

        let executor = f.core.scalpers.get("233740").unwrap();
        assert!(executor.is_active().await, "signal should have activated");

        // A shallow dip on a fresh fixture does not activate.
        let f2 = fixture().await;
        f2.core
            .minute_repo
            .upsert_realtime("233740", 10_000, 100, "20250618_1000")
            .await
            .unwrap();
        f2.core
            .handle_tick_event(&tick("233740", 9_995, at(10, 1, 30)))
            .await;
        assert!(!f2.core.scalpers.get("233740").unwrap().is_active().await);
    }

    #[tokio::test]
    async fn liquidation_gate_fires_once_per_date() {
        let f = fixture().await;
        f.core.maybe_run_liquidation(at(15, 19, 0)).await;
        assert!(
            f.core
                .liquidation_fired_on
                .lock()
                .unwrap()
                .as_deref()
                == Some("20250618")
        );
        // Second pass the same day is a no-op (would panic on re-entry
        // into liquidation mode otherwise; assert the guard held).
        f.core.maybe_run_liquidation(at(15, 20, 0)).await;
        assert!(!f.core.orders.is_liquidation_mode());
    }

    #[tokio::test]
    async fn before_the_gate_nothing_happens() {
        let f = fixture().await;
        f.core.maybe_run_liquidation(at(15, 18, 59)).await;
        assert!(f.core.liquidation_fired_on.lock().unwrap().is_none());
    }
}
