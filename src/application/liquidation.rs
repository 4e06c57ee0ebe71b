//! End-of-day liquidation.
//!
//! Flattens every position at market ahead of the close: liquidation mode
//! on (buys blocked), outstanding orders cancelled, sells issued in
//! parallel with a bounded worker count and a small retry budget, then a
//! fill-wait window, a broker resync and a result report.

use crate::application::order_manager::OrderManager;
use crate::application::position_manager::{ManagedPosition, PositionManager};
use crate::notification::Notifier;
use anyhow::Result;
use chrono::{Local, NaiveDateTime};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

const MAX_PARALLEL_SELLS: usize = 10;
const SELL_RETRIES: u32 = 2;
const SELL_RETRY_DELAY: Duration = Duration::from_millis(500);
const DEFAULT_FILL_WAIT: Duration = Duration::from_secs(20);

#[derive(Debug, Clone)]
pub struct LiquidationResult {
    pub started_at: NaiveDateTime,
    pub completed_at: NaiveDateTime,
    pub total_positions: usize,
    pub successful_orders: usize,
    pub failed_orders: usize,
    /// symbol -> unfilled quantity still held after the wait.
    pub partial_fills: HashMap<String, u32>,
    pub errors: Vec<(String, String)>,
    pub total_liquidation_value: i64,
    pub total_pnl: i64,
}

pub struct DailyLiquidation {
    orders: Arc<OrderManager>,
    positions: Arc<PositionManager>,
    notifier: Arc<dyn Notifier>,
    fill_wait: Duration,
    in_progress: AtomicBool,
}

impl DailyLiquidation {
    pub fn new(
        orders: Arc<OrderManager>,
        positions: Arc<PositionManager>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            orders,
            positions,
            notifier,
            fill_wait: DEFAULT_FILL_WAIT,
            in_progress: AtomicBool::new(false),
        }
    }

    /// Shorten the fill-wait window (tests).
    pub fn with_fill_wait(mut self, wait: Duration) -> Self {
        self.fill_wait = wait;
        self
    }

    pub fn is_in_progress(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst)
    }

    pub async fn execute(&self) -> Result<LiquidationResult> {
        let started_at = Local::now().naive_local();
        self.in_progress.store(true, Ordering::SeqCst);
        let result = self.run(started_at).await;
        // Buys must come back regardless of how the pass went.
        self.orders.disable_liquidation_mode();
        self.in_progress.store(false, Ordering::SeqCst);
        result
    }

    async fn run(&self, started_at: NaiveDateTime) -> Result<LiquidationResult> {
        self.orders.enable_liquidation_mode();

        let cancelled = self.orders.cancel_all_pending().await;
        info!("[liquidation] cancelled {cancelled} pending orders");

        let snapshot = self.positions.get_all().await;
        if snapshot.is_empty() {
            info!("[liquidation] no positions to liquidate");
            return Ok(LiquidationResult {
                started_at,
                completed_at: Local::now().naive_local(),
                total_positions: 0,
                successful_orders: 0,
                failed_orders: 0,
                partial_fills: HashMap::new(),
                errors: Vec::new(),
                total_liquidation_value: 0,
                total_pnl: 0,
            });
        }

        info!("[liquidation] {} positions to liquidate", snapshot.len());
        let total_eval: i64 = snapshot.values().map(|p| p.eval_amount()).sum();
        self.notifier
            .send_message(&format!(
                "end-of-day liquidation: {} positions, eval {total_eval} KRW",
                snapshot.len()
            ))
            .await;

        let order_results = self.sell_all_parallel(&snapshot).await;

        self.wait_for_fills().await;

        info!("[liquidation] syncing positions with broker");
        if let Err(e) = self.positions.sync().await {
            warn!("[liquidation] post-liquidation sync failed: {e:#}");
        }

        let result = self.collect(started_at, &snapshot, &order_results).await;
        self.notifier
            .send_message(&format!(
                "liquidation done: total={}, filled={}, partial={}, failed={}, P/L {:+}",
                result.total_positions,
                result
                    .successful_orders
                    .saturating_sub(result.partial_fills.len()),
                result.partial_fills.len(),
                result.failed_orders,
                result.total_pnl
            ))
            .await;
        Ok(result)
    }

    /// Market sells, at most [`MAX_PARALLEL_SELLS`] in flight, each with a
    /// small retry budget.
    async fn sell_all_parallel(
        &self,
        snapshot: &HashMap<String, ManagedPosition>,
    ) -> HashMap<String, Option<String>> {
        let semaphore = Arc::new(Semaphore::new(MAX_PARALLEL_SELLS));
        let mut join_set = JoinSet::new();

        for position in snapshot.values().cloned() {
            let orders = self.orders.clone();
            let semaphore = semaphore.clone();
            join_set.spawn(async move {
                let _permit = semaphore.acquire().await;
                let symbol = position.symbol.clone();
                let strategy = position
                    .strategy_name
                    .clone()
                    .unwrap_or_else(|| "liquidation".to_string());

                for attempt in 0..=SELL_RETRIES {
                    let order_id = orders
                        .place_sell_order(
                            &position.symbol,
                            &position.name,
                            position.quantity,
                            Some(&strategy),
                        )
                        .await;
                    if let Some(order_id) = order_id {
                        info!(
                            "[liquidation] sell placed: {}({symbol}) x{} (id {order_id})",
                            position.name, position.quantity
                        );
                        return (symbol, Some(order_id));
                    }
                    warn!(
                        "[liquidation] sell failed: {symbol} (attempt {}/{})",
                        attempt + 1,
                        SELL_RETRIES + 1
                    );
                    if attempt < SELL_RETRIES {
                        tokio::time::sleep(SELL_RETRY_DELAY).await;
                    }
                }
                error!("[liquidation] sell gave up after retries: {symbol}");
                (symbol, None)
            });
        }

        let mut results = HashMap::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((symbol, order_id)) => {
                    results.insert(symbol, order_id);
                }
                Err(e) => error!("[liquidation] sell task panicked: {e}"),
            }
        }
        results
    }

    /// Poll fills once a second for the wait window.
    async fn wait_for_fills(&self) {
        info!("[liquidation] waiting {:?} for fills", self.fill_wait);
        let step = Duration::from_secs(1).min(self.fill_wait);
        let mut waited = Duration::ZERO;
        while waited < self.fill_wait {
            tokio::time::sleep(step).await;
            waited += step;
            self.orders.check_fills().await;
        }
    }

    async fn collect(
        &self,
        started_at: NaiveDateTime,
        snapshot: &HashMap<String, ManagedPosition>,
        order_results: &HashMap<String, Option<String>>,
    ) -> LiquidationResult {
        let completed_at = Local::now().naive_local();
        let successful_orders = order_results.values().filter(|r| r.is_some()).count();
        let failed_orders = order_results.len() - successful_orders;

        let errors: Vec<(String, String)> = order_results
            .iter()
            .filter(|(_, r)| r.is_none())
            .map(|(symbol, _)| (symbol.clone(), "order placement failed".to_string()))
            .collect();

        let remaining = self.positions.get_all().await;
        let mut partial_fills = HashMap::new();
        for symbol in snapshot.keys() {
            if let Some(position) = remaining.get(symbol) {
                if position.quantity > 0 {
                    warn!(
                        "[liquidation] partial fill: {symbol} still holds {}",
                        position.quantity
                    );
                    partial_fills.insert(symbol.clone(), position.quantity);
                }
            }
        }

        let mut total_liquidation_value = 0i64;
        let mut total_pnl = 0i64;
        for (symbol, position) in snapshot {
            match partial_fills.get(symbol) {
                None if !remaining.contains_key(symbol) => {
                    total_liquidation_value += position.eval_amount();
                    total_pnl += position.profit_loss();
                }
                Some(unfilled) => {
                    let filled = position.quantity.saturating_sub(*unfilled);
                    total_liquidation_value += position.current_price * filled as i64;
                    total_pnl += ((position.current_price as f64 - position.avg_price)
                        * filled as f64) as i64;
                }
                None => {}
            }
        }

        let duration = (completed_at - started_at).num_milliseconds() as f64 / 1000.0;
        info!(
            "[liquidation] completed in {duration:.1}s: {successful_orders}/{} sells, {} partial, P/L {total_pnl:+}",
            snapshot.len(),
            partial_fills.len()
        );

        LiquidationResult {
            started_at,
            completed_at,
            total_positions: snapshot.len(),
            successful_orders,
            failed_orders,
            partial_fills,
            errors,
            total_liquidation_value,
            total_pnl,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::order_manager::NoopFillListener;
    use crate::domain::types::BrokerPosition;
    use crate::infrastructure::mock::MockBroker;
    use crate::infrastructure::persistence::audit::AuditLog;
    use crate::infrastructure::persistence::database::TradingDb;
    use crate::notification::LogNotifier;

    async fn fixture() -> (
        tempfile::TempDir,
        Arc<MockBroker>,
        Arc<PositionManager>,
        Arc<OrderManager>,
        DailyLiquidation,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let db = TradingDb::open(&dir.path().join("t.db")).await.unwrap();
        let broker = Arc::new(MockBroker::new());
        let audit = AuditLog::new(db.store(), "sess-test");
        let positions = Arc::new(PositionManager::new(
            broker.clone(),
            db.store(),
            audit.clone(),
        ));
        let orders = Arc::new(OrderManager::new(
            broker.clone(),
            positions.clone(),
            db.store(),
            audit,
            Arc::new(NoopFillListener),
        ));
        let liquidation = DailyLiquidation::new(
            orders.clone(),
            positions.clone(),
            Arc::new(LogNotifier),
        )
        .with_fill_wait(Duration::from_millis(20));
        (dir, broker, positions, orders, liquidation)
    }

    fn holding(symbol: &str, qty: u32, avg: f64, current: i64) -> BrokerPosition {
        BrokerPosition {
            symbol: symbol.into(),
            name: format!("mock-{symbol}"),
            quantity: qty,
            avg_price: avg,
            current_price: current,
            eval_amount: qty as i64 * current,
            profit_loss: ((current as f64 - avg) * qty as f64) as i64,
            profit_rate: 0.0,
        }
    }

    #[tokio::test]
    async fn liquidates_all_positions_and_reports() {
        let (_dir, broker, positions, orders, liquidation) = fixture().await;

        // Two held positions known to both the broker and the local book.
        broker.set_positions(vec![
            holding("005930", 10, 70_000.0, 70_100),
            holding("000660", 5, 120_000.0, 121_000),
        ]);
        positions.sync().await.unwrap();

        // One pending buy on a third symbol.
        orders
            .place_buy_order("035720", "Kakao", 3, "s1", false, 0)
            .await
            .unwrap();
        assert!(orders.has_pending("035720").await);

        let result = liquidation.execute().await.unwrap();

        assert_eq!(result.total_positions, 2);
        assert_eq!(result.successful_orders, 2);
        assert_eq!(result.failed_orders, 0);
        assert!(result.partial_fills.is_empty());

        // Mock market sells settle instantly, so the resync emptied the
        // local book.
        assert!(positions.get_all().await.is_empty());

        // P/L = (70100-70000)*10 + (121000-120000)*5 = 1000 + 5000.
        assert_eq!(result.total_pnl, 6_000);

        // Pending buy was swept by cancel-all, liquidation mode released.
        assert!(!orders.has_pending("035720").await);
        assert!(!orders.is_liquidation_mode());
        assert!(!liquidation.is_in_progress());

        // Both sells were market orders.
        let sells: Vec<_> = broker
            .placed_orders()
            .into_iter()
            .filter(|o| o.side == crate::domain::types::OrderSide::Sell)
            .collect();
        assert_eq!(sells.len(), 2);
        assert!(sells.iter().all(|o| o.price.is_none()));
    }

    #[tokio::test]
    async fn empty_book_is_a_clean_no_op() {
        let (_dir, _broker, _positions, orders, liquidation) = fixture().await;
        let result = liquidation.execute().await.unwrap();
        assert_eq!(result.total_positions, 0);
        assert_eq!(result.successful_orders, 0);
        assert!(!orders.is_liquidation_mode());
    }

    #[tokio::test]
    async fn failed_sell_is_reported_not_fatal() {
        let (_dir, broker, positions, _orders, liquidation) = fixture().await;
        broker.set_positions(vec![holding("005930", 10, 70_000.0, 70_000)]);
        positions.sync().await.unwrap();

        // All three attempts for the one symbol rejected.
        broker.reject_next_order("ETF trading suspended");
        broker.reject_next_order("ETF trading suspended");
        broker.reject_next_order("ETF trading suspended");

        let result = liquidation.execute().await.unwrap();
        assert_eq!(result.failed_orders, 1);
        assert_eq!(result.errors.len(), 1);
    }
}
