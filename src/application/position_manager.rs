//! Authoritative local view of held positions.
//!
//! The broker is the source of truth; the trading store is a cache of the
//! last known state. `sync` reconciles the two: broker-only positions are
//! admitted as unmanaged (no strategy will generate entries for them),
//! locally-known positions absent from the broker are dropped, and quantity
//! disagreements are flagged.

use crate::domain::ports::Broker;
use crate::domain::types::BrokerPosition;
use crate::infrastructure::persistence::audit::{AuditLog, PositionAuditEvent};
use crate::infrastructure::persistence::database::Store;
use anyhow::Result;
use chrono::{Local, NaiveDateTime};
use sqlx::Row;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone)]
pub struct ManagedPosition {
    pub symbol: String,
    pub name: String,
    pub quantity: u32,
    pub avg_price: f64,
    pub current_price: i64,
    /// `None` marks a position discovered on the broker but owned by no
    /// strategy; it is held but never actively exited.
    pub strategy_name: Option<String>,
    pub entry_order_id: Option<String>,
    pub entry_time: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl ManagedPosition {
    pub fn eval_amount(&self) -> i64 {
        self.quantity as i64 * self.current_price
    }

    pub fn profit_loss(&self) -> i64 {
        ((self.current_price as f64 - self.avg_price) * self.quantity as f64) as i64
    }

    pub fn profit_rate(&self) -> f64 {
        if self.avg_price > 0.0 {
            (self.current_price as f64 - self.avg_price) / self.avg_price * 100.0
        } else {
            0.0
        }
    }

    pub fn is_managed(&self) -> bool {
        self.strategy_name.is_some()
    }
}

#[derive(Default)]
struct Inner {
    positions: HashMap<String, ManagedPosition>,
    strategy_index: HashMap<String, BTreeSet<String>>,
}

impl Inner {
    fn index_insert(&mut self, strategy: &str, symbol: &str) {
        self.strategy_index
            .entry(strategy.to_string())
            .or_default()
            .insert(symbol.to_string());
    }

    fn index_remove(&mut self, strategy: Option<&str>, symbol: &str) {
        if let Some(strategy) = strategy {
            if let Some(set) = self.strategy_index.get_mut(strategy) {
                set.remove(symbol);
            }
        }
    }
}

pub struct PositionManager {
    broker: Arc<dyn Broker>,
    store: Arc<Store>,
    audit: AuditLog,
    inner: Mutex<Inner>,
    sync_in_progress: AtomicBool,
    last_sync: StdMutex<Option<Instant>>,
}

impl PositionManager {
    pub fn new(broker: Arc<dyn Broker>, store: Arc<Store>, audit: AuditLog) -> Self {
        info!("PositionManager initialized");
        Self {
            broker,
            store,
            audit,
            inner: Mutex::new(Inner::default()),
            sync_in_progress: AtomicBool::new(false),
            last_sync: StdMutex::new(None),
        }
    }

    /// Reconcile with the broker balance. Single-flighted: a concurrent
    /// call returns immediately. The blocking broker call runs lock-free;
    /// only the local diff holds the lock.
    pub async fn sync(&self) -> Result<()> {
        if self
            .sync_in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("position sync already in progress, skipping");
            return Ok(());
        }

        let result = self.sync_inner().await;
        self.sync_in_progress.store(false, Ordering::SeqCst);
        result
    }

    async fn sync_inner(&self) -> Result<()> {
        let balance = self.broker.balance().await?;
        let broker_symbols: BTreeSet<String> =
            balance.positions.iter().map(|p| p.symbol.clone()).collect();
        let now = Local::now().naive_local();

        let mut audit_events = Vec::new();
        {
            let mut inner = self.inner.lock().await;
            let mut discrepancies = Vec::new();

            for bp in &balance.positions {
                match inner.positions.get_mut(&bp.symbol) {
                    Some(mp) => {
                        if mp.quantity != bp.quantity {
                            discrepancies.push((bp.symbol.clone(), mp.quantity, bp.quantity));
                        }
                        mp.quantity = bp.quantity;
                        mp.avg_price = bp.avg_price;
                        mp.current_price = bp.current_price;
                        mp.updated_at = now;
                    }
                    None => {
                        let mp = admit_unmanaged(bp, now);
                        info!(
                            "new position detected (unmanaged): {} x {} @ {}",
                            bp.symbol, bp.quantity, bp.avg_price
                        );
                        audit_events.push(sync_event(&mp, bp.quantity));
                        inner.positions.insert(bp.symbol.clone(), mp);
                    }
                }
            }

            let stale: Vec<String> = inner
                .positions
                .keys()
                .filter(|s| !broker_symbols.contains(*s))
                .cloned()
                .collect();
            for symbol in stale {
                if let Some(mp) = inner.positions.remove(&symbol) {
                    audit_events.push(sync_event(&mp, 0));
                    inner.index_remove(mp.strategy_name.as_deref(), &symbol);
                    info!("position removed during sync: {symbol}");
                }
            }

            if !discrepancies.is_empty() {
                warn!("position quantity discrepancies: {discrepancies:?}");
            }

            self.persist_locked(&inner).await?;
        }

        for event in audit_events {
            self.audit.log_position(event).await;
        }

        let mut guard = self.last_sync.lock().unwrap_or_else(|e| e.into_inner());
        *guard = Some(Instant::now());
        Ok(())
    }

    /// Add a buy fill. An existing position absorbs it with the weighted
    /// average rule; otherwise a new managed position opens.
    pub async fn add(
        &self,
        symbol: &str,
        name: &str,
        quantity: u32,
        price: f64,
        strategy_name: Option<&str>,
        order_id: &str,
    ) -> Result<()> {
        if quantity == 0 {
            return Ok(());
        }
        let now = Local::now().naive_local();
        let event;
        {
            let mut inner = self.inner.lock().await;
            match inner.positions.get_mut(symbol) {
                Some(mp) => {
                    let total = mp.quantity + quantity;
                    let cost = mp.quantity as f64 * mp.avg_price + quantity as f64 * price;
                    mp.avg_price = cost / total as f64;
                    mp.quantity = total;
                    mp.current_price = price as i64;
                    mp.updated_at = now;
                    info!("position increased: {symbol} +{quantity} (total {total})");
                    event = PositionAuditEvent {
                        event_type: "POSITION_UPDATE",
                        module: "PositionManager",
                        symbol: symbol.to_string(),
                        name: name.to_string(),
                        quantity: total,
                        avg_price: mp.avg_price,
                        current_price: mp.current_price,
                        profit_loss: mp.profit_loss(),
                        profit_rate: mp.profit_rate(),
                        strategy_name: strategy_name.map(str::to_string),
                    };
                }
                None => {
                    let mp = ManagedPosition {
                        symbol: symbol.to_string(),
                        name: name.to_string(),
                        quantity,
                        avg_price: price,
                        current_price: price as i64,
                        strategy_name: strategy_name.map(str::to_string),
                        entry_order_id: Some(order_id.to_string()),
                        entry_time: now,
                        updated_at: now,
                    };
                    info!("new position: {symbol} x {quantity} @ {price}");
                    event = PositionAuditEvent {
                        event_type: "POSITION_OPEN",
                        module: "PositionManager",
                        symbol: symbol.to_string(),
                        name: name.to_string(),
                        quantity,
                        avg_price: price,
                        current_price: price as i64,
                        profit_loss: 0,
                        profit_rate: 0.0,
                        strategy_name: strategy_name.map(str::to_string),
                    };
                    inner.positions.insert(symbol.to_string(), mp);
                }
            }
            if let Some(strategy) = strategy_name {
                inner.index_insert(strategy, symbol);
            }
            self.persist_locked(&inner).await?;
        }
        self.audit.log_position(event).await;
        Ok(())
    }

    /// Remove a fully sold position.
    pub async fn remove(&self, symbol: &str) -> Result<Option<ManagedPosition>> {
        let removed;
        {
            let mut inner = self.inner.lock().await;
            removed = inner.positions.remove(symbol);
            if let Some(mp) = &removed {
                inner.index_remove(mp.strategy_name.as_deref(), symbol);
                self.persist_locked(&inner).await?;
            }
        }
        if let Some(mp) = &removed {
            self.audit
                .log_position(PositionAuditEvent {
                    event_type: "POSITION_CLOSE",
                    module: "PositionManager",
                    symbol: mp.symbol.clone(),
                    name: mp.name.clone(),
                    quantity: 0,
                    avg_price: mp.avg_price,
                    current_price: mp.current_price,
                    profit_loss: mp.profit_loss(),
                    profit_rate: mp.profit_rate(),
                    strategy_name: mp.strategy_name.clone(),
                })
                .await;
            info!("position removed: {symbol}");
        }
        Ok(removed)
    }

    /// Set the quantity after a partial sell; zero or below removes.
    pub async fn update_quantity(&self, symbol: &str, quantity: i64) -> Result<()> {
        if quantity <= 0 {
            self.remove(symbol).await?;
            return Ok(());
        }
        let mut inner = self.inner.lock().await;
        if let Some(mp) = inner.positions.get_mut(symbol) {
            mp.quantity = quantity as u32;
            mp.updated_at = Local::now().naive_local();
            self.persist_locked(&inner).await?;
        }
        Ok(())
    }

    pub async fn update_price(&self, symbol: &str, current_price: i64) {
        let mut inner = self.inner.lock().await;
        if let Some(mp) = inner.positions.get_mut(symbol) {
            mp.current_price = current_price;
            mp.updated_at = Local::now().naive_local();
        }
    }

    /// Retroactively hand an unmanaged position to a strategy so it may
    /// manage the exit.
    pub async fn assign_strategy(&self, symbol: &str, strategy_name: &str) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let Some(mp) = inner.positions.get_mut(symbol) else {
            return Ok(false);
        };
        let previous = mp.strategy_name.take();
        mp.strategy_name = Some(strategy_name.to_string());
        mp.updated_at = Local::now().naive_local();
        inner.index_remove(previous.as_deref(), symbol);
        inner.index_insert(strategy_name, symbol);
        self.persist_locked(&inner).await?;
        info!("strategy assigned: {symbol} -> {strategy_name}");
        Ok(true)
    }

    pub async fn get(&self, symbol: &str) -> Option<ManagedPosition> {
        self.inner.lock().await.positions.get(symbol).cloned()
    }

    pub async fn get_all(&self) -> HashMap<String, ManagedPosition> {
        self.inner.lock().await.positions.clone()
    }

    pub async fn by_strategy(&self, strategy_name: &str) -> Vec<ManagedPosition> {
        let inner = self.inner.lock().await;
        inner
            .positions
            .values()
            .filter(|p| p.strategy_name.as_deref() == Some(strategy_name))
            .cloned()
            .collect()
    }

    pub async fn unmanaged(&self) -> Vec<ManagedPosition> {
        let inner = self.inner.lock().await;
        inner
            .positions
            .values()
            .filter(|p| p.strategy_name.is_none())
            .cloned()
            .collect()
    }

    pub fn is_stale(&self, max_age: Duration) -> bool {
        let guard = self.last_sync.lock().unwrap_or_else(|e| e.into_inner());
        match *guard {
            Some(t) => t.elapsed() > max_age,
            None => true,
        }
    }

    /// Load the cached state written by the previous session. Called once
    /// at startup, before `sync` corrects it against the broker.
    pub async fn load(&self) -> Result<()> {
        let rows = sqlx::query("SELECT * FROM positions")
            .fetch_all(self.store.reader())
            .await?;
        let mut inner = self.inner.lock().await;
        for row in &rows {
            let entry_time = NaiveDateTime::parse_from_str(
                &row.get::<String, _>("entry_time"),
                TIME_FORMAT,
            )
            .unwrap_or_else(|_| Local::now().naive_local());
            let updated_at =
                NaiveDateTime::parse_from_str(&row.get::<String, _>("updated_at"), TIME_FORMAT)
                    .unwrap_or(entry_time);
            let mp = ManagedPosition {
                symbol: row.get("symbol"),
                name: row.get("name"),
                quantity: row.get::<i64, _>("quantity") as u32,
                avg_price: row.get("avg_price"),
                current_price: row.get("current_price"),
                strategy_name: row.get("strategy_name"),
                entry_order_id: row.get("entry_order_id"),
                entry_time,
                updated_at,
            };
            if let Some(strategy) = mp.strategy_name.clone() {
                inner.index_insert(&strategy, &mp.symbol);
            }
            inner.positions.insert(mp.symbol.clone(), mp);
        }
        info!("loaded {} positions from store", inner.positions.len());
        Ok(())
    }

    /// Rewrite the positions table from the in-memory map. Callers hold
    /// the inner lock, so the snapshot and the write are consistent.
    async fn persist_locked(&self, inner: &Inner) -> Result<()> {
        let snapshot: Vec<ManagedPosition> = inner.positions.values().cloned().collect();
        self.store
            .write(move |pool| {
                Box::pin(async move {
                    let mut tx = pool.begin().await?;
                    sqlx::query("DELETE FROM positions").execute(&mut *tx).await?;
                    for mp in &snapshot {
                        sqlx::query(
                            "INSERT INTO positions
                             (symbol, name, quantity, avg_price, current_price,
                              strategy_name, entry_order_id, entry_time, updated_at)
                             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                        )
                        .bind(&mp.symbol)
                        .bind(&mp.name)
                        .bind(mp.quantity as i64)
                        .bind(mp.avg_price)
                        .bind(mp.current_price)
                        .bind(&mp.strategy_name)
                        .bind(&mp.entry_order_id)
                        .bind(mp.entry_time.format(TIME_FORMAT).to_string())
                        .bind(mp.updated_at.format(TIME_FORMAT).to_string())
                        .execute(&mut *tx)
                        .await?;
                    }
                    tx.commit().await?;
                    Ok(())
                })
            })
            .await
    }
}

fn admit_unmanaged(bp: &BrokerPosition, now: NaiveDateTime) -> ManagedPosition {
    ManagedPosition {
        symbol: bp.symbol.clone(),
        name: bp.name.clone(),
        quantity: bp.quantity,
        avg_price: bp.avg_price,
        current_price: bp.current_price,
        strategy_name: None,
        entry_order_id: None,
        entry_time: now,
        updated_at: now,
    }
}

fn sync_event(mp: &ManagedPosition, quantity: u32) -> PositionAuditEvent {
    PositionAuditEvent {
        event_type: "POSITION_SYNC",
        module: "PositionManager",
        symbol: mp.symbol.clone(),
        name: mp.name.clone(),
        quantity,
        avg_price: mp.avg_price,
        current_price: mp.current_price,
        profit_loss: mp.profit_loss(),
        profit_rate: mp.profit_rate(),
        strategy_name: mp.strategy_name.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::mock::MockBroker;
    use crate::infrastructure::persistence::database::TradingDb;

    async fn manager() -> (tempfile::TempDir, Arc<MockBroker>, PositionManager) {
        let dir = tempfile::tempdir().unwrap();
        let db = TradingDb::open(&dir.path().join("t.db")).await.unwrap();
        let broker = Arc::new(MockBroker::new());
        let audit = AuditLog::new(db.store(), "sess-test");
        let pm = PositionManager::new(broker.clone(), db.store(), audit);
        (dir, broker, pm)
    }

    fn broker_position(symbol: &str, qty: u32, avg: f64) -> BrokerPosition {
        BrokerPosition {
            symbol: symbol.into(),
            name: format!("mock-{symbol}"),
            quantity: qty,
            avg_price: avg,
            current_price: avg as i64,
            eval_amount: qty as i64 * avg as i64,
            profit_loss: 0,
            profit_rate: 0.0,
        }
    }

    #[tokio::test]
    async fn weighted_average_accumulates() {
        let (_dir, _broker, pm) = manager().await;

        pm.add("233740", "KODEX", 3, 10_000.0, Some("s1"), "O1").await.unwrap();
        pm.add("233740", "KODEX", 2, 10_500.0, Some("s1"), "O2").await.unwrap();

        let mp = pm.get("233740").await.unwrap();
        assert_eq!(mp.quantity, 5);
        assert!((mp.avg_price - 10_200.0).abs() < 1.0);
    }

    #[tokio::test]
    async fn avg_cost_matches_total_cost_over_total_qty() {
        let (_dir, _broker, pm) = manager().await;
        let fills: &[(u32, f64)] = &[(3, 10_000.0), (2, 10_500.0), (7, 9_800.0), (1, 11_111.0)];
        let mut cost = 0.0;
        let mut qty = 0u32;
        for (q, p) in fills {
            pm.add("005930", "Samsung", *q, *p, Some("s1"), "O").await.unwrap();
            cost += *q as f64 * p;
            qty += q;
        }
        let mp = pm.get("005930").await.unwrap();
        assert_eq!(mp.quantity, qty);
        assert!((mp.avg_price - cost / qty as f64).abs() < 1.0);
    }

    #[tokio::test]
    async fn zero_quantity_removes_position() {
        let (_dir, _broker, pm) = manager().await;
        pm.add("005930", "Samsung", 10, 70_000.0, Some("s1"), "O1").await.unwrap();
        pm.update_quantity("005930", 0).await.unwrap();
        assert!(pm.get("005930").await.is_none());
        assert!(pm.by_strategy("s1").await.is_empty());
    }

    #[tokio::test]
    async fn sync_admits_unmanaged_and_removes_stale() {
        let (_dir, broker, pm) = manager().await;
        pm.add("005930", "Samsung", 10, 70_000.0, Some("s1"), "O1").await.unwrap();

        // Broker shows a different book: 005930 gone, 000660 held.
        broker.set_positions(vec![broker_position("000660", 5, 120_000.0)]);
        pm.sync().await.unwrap();

        assert!(pm.get("005930").await.is_none());
        let hynix = pm.get("000660").await.unwrap();
        assert!(hynix.strategy_name.is_none());
        assert_eq!(pm.unmanaged().await.len(), 1);
    }

    #[tokio::test]
    async fn assign_strategy_relabels_unmanaged() {
        let (_dir, broker, pm) = manager().await;
        broker.set_positions(vec![broker_position("000660", 5, 120_000.0)]);
        pm.sync().await.unwrap();

        assert!(pm.assign_strategy("000660", "donchian").await.unwrap());
        let mp = pm.get("000660").await.unwrap();
        assert_eq!(mp.strategy_name.as_deref(), Some("donchian"));
        assert_eq!(pm.by_strategy("donchian").await.len(), 1);
        assert!(pm.unmanaged().await.is_empty());
    }

    #[tokio::test]
    async fn staleness_flips_after_sync() {
        let (_dir, _broker, pm) = manager().await;
        assert!(pm.is_stale(Duration::from_secs(60)));
        pm.sync().await.unwrap();
        assert!(!pm.is_stale(Duration::from_secs(60)));
    }

    #[tokio::test]
    async fn store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let db = TradingDb::open(&dir.path().join("t.db")).await.unwrap();
        let broker = Arc::new(MockBroker::new());
        {
            let audit = AuditLog::new(db.store(), "sess-a");
            let pm = PositionManager::new(broker.clone(), db.store(), audit);
            pm.add("005930", "Samsung", 10, 70_000.0, Some("s1"), "O1").await.unwrap();
        }
        let audit = AuditLog::new(db.store(), "sess-b");
        let pm = PositionManager::new(broker, db.store(), audit);
        pm.load().await.unwrap();
        let mp = pm.get("005930").await.unwrap();
        assert_eq!(mp.quantity, 10);
        assert_eq!(mp.strategy_name.as_deref(), Some("s1"));
    }
}
