//! Tick-driven exit evaluation for held positions.
//!
//! A lighter counterpart to the scalping executor for strategies that want
//! sub-minute exit latency without running their own state machine.
//! Registered on buy fill, evaluated on every tick (stop-loss first, then
//! take-profit, then the holding timeout) and removed once the sell fill
//! reconciles. `exit_in_progress` suppresses duplicate signals in between.

use crate::domain::types::TickEvent;
use async_trait::async_trait;
use chrono::NaiveDateTime;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct ExitRegistration {
    pub symbol: String,
    pub strategy_name: String,
    pub avg_price: f64,
    pub quantity: u32,
    pub entry_time: NaiveDateTime,
    /// 0.003 = 0.3%
    pub take_profit_pct: f64,
    /// 0.01 = 1.0%
    pub stop_loss_pct: f64,
    pub max_holding_minutes: u32,
}

#[derive(Debug, Clone)]
pub struct ExitSignal {
    pub symbol: String,
    pub strategy_name: String,
    pub quantity: u32,
    pub reason: String,
    pub is_take_profit: bool,
}

#[async_trait]
pub trait ExitSignalListener: Send + Sync {
    async fn on_exit_signal(&self, signal: ExitSignal);
}

#[derive(Default)]
struct MonitorInner {
    monitored: HashMap<String, ExitRegistration>,
    exit_in_progress: HashSet<String>,
}

pub struct ExitMonitor {
    listener: Arc<dyn ExitSignalListener>,
    inner: Mutex<MonitorInner>,
    running: AtomicBool,
}

impl ExitMonitor {
    pub fn new(listener: Arc<dyn ExitSignalListener>) -> Self {
        Self {
            listener,
            inner: Mutex::new(MonitorInner::default()),
            running: AtomicBool::new(false),
        }
    }

    pub fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
        info!("[ExitMonitor] started (waiting for positions)");
    }

    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let mut inner = self.inner.lock().await;
        inner.monitored.clear();
        inner.exit_in_progress.clear();
        info!("[ExitMonitor] stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Register a position after its buy fill. Re-registering a symbol
    /// replaces the existing entry (averaged-up positions).
    pub async fn add_position(&self, registration: ExitRegistration) {
        if !self.is_running() {
            warn!("[ExitMonitor] not running, cannot add {}", registration.symbol);
            return;
        }
        let mut inner = self.inner.lock().await;
        info!(
            "[ExitMonitor] watching {} (TP {:.2}%, SL {:.2}%, timeout {}m)",
            registration.symbol,
            registration.take_profit_pct * 100.0,
            registration.stop_loss_pct * 100.0,
            registration.max_holding_minutes
        );
        inner
            .monitored
            .insert(registration.symbol.clone(), registration);
    }

    /// Drop a symbol after its sell fill reconciles.
    pub async fn remove_position(&self, symbol: &str) {
        let mut inner = self.inner.lock().await;
        if inner.monitored.remove(symbol).is_some() {
            inner.exit_in_progress.remove(symbol);
            info!("[ExitMonitor] released {symbol}");
        }
    }

    pub async fn is_monitored(&self, symbol: &str) -> bool {
        self.inner.lock().await.monitored.contains_key(symbol)
    }

    pub async fn is_exit_in_progress(&self, symbol: &str) -> bool {
        self.inner.lock().await.exit_in_progress.contains(symbol)
    }

    pub async fn monitored_symbols(&self) -> Vec<String> {
        self.inner.lock().await.monitored.keys().cloned().collect()
    }

    /// Evaluate one tick against the registration for its symbol.
    pub async fn on_tick(&self, tick: &TickEvent) {
        if !self.is_running() {
            return;
        }
        let exit = {
            let mut inner = self.inner.lock().await;
            let Some(registration) = inner.monitored.get(&tick.symbol) else {
                return;
            };
            if inner.exit_in_progress.contains(&tick.symbol) {
                return;
            }
            let Some((reason, is_take_profit)) =
                evaluate_exit(registration, tick.price, tick.timestamp)
            else {
                return;
            };
            let signal = ExitSignal {
                symbol: registration.symbol.clone(),
                strategy_name: registration.strategy_name.clone(),
                quantity: registration.quantity,
                reason,
                is_take_profit,
            };
            inner.exit_in_progress.insert(tick.symbol.clone());
            signal
        };

        info!(
            "[ExitMonitor] exit signal: {} - {} (price {})",
            exit.symbol, exit.reason, tick.price
        );
        self.listener.on_exit_signal(exit).await;
    }
}

/// Stop-loss outranks take-profit outranks the holding timeout.
fn evaluate_exit(
    registration: &ExitRegistration,
    current_price: i64,
    now: NaiveDateTime,
) -> Option<(String, bool)> {
    if registration.avg_price <= 0.0 {
        return None;
    }
    let profit_rate = (current_price as f64 - registration.avg_price) / registration.avg_price;

    if profit_rate <= -registration.stop_loss_pct {
        return Some((format!("stop-loss: {:.2}%", profit_rate * 100.0), false));
    }
    if profit_rate >= registration.take_profit_pct {
        return Some((format!("take-profit: {:.2}%", profit_rate * 100.0), true));
    }

    let held_minutes = (now - registration.entry_time).num_seconds() as f64 / 60.0;
    if held_minutes >= registration.max_holding_minutes as f64 {
        return Some((format!("holding timeout: {held_minutes:.0}m"), false));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct Recorder {
        signals: StdMutex<Vec<ExitSignal>>,
    }

    #[async_trait]
    impl ExitSignalListener for Recorder {
        async fn on_exit_signal(&self, signal: ExitSignal) {
            self.signals.lock().unwrap().push(signal);
        }
    }

    fn at(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 6, 18)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    fn registration() -> ExitRegistration {
        ExitRegistration {
            symbol: "233740".into(),
            strategy_name: "dip_buy".into(),
            avg_price: 10_000.0,
            quantity: 5,
            entry_time: at(10, 0),
            take_profit_pct: 0.003,
            stop_loss_pct: 0.01,
            max_holding_minutes: 60,
        }
    }

    fn tick(price: i64, ts: NaiveDateTime) -> TickEvent {
        TickEvent {
            symbol: "233740".into(),
            price,
            volume: 1,
            cumulative_volume: 1,
            change: 0,
            change_rate: 0.0,
            open: price,
            high: price,
            low: price,
            timestamp: ts,
        }
    }

    async fn monitor() -> (Arc<Recorder>, ExitMonitor) {
        let recorder = Arc::new(Recorder::default());
        let monitor = ExitMonitor::new(recorder.clone());
        monitor.start();
        monitor.add_position(registration()).await;
        (recorder, monitor)
    }

    #[test]
    fn exit_rule_ordering() {
        let reg = registration();
        // 10030 = +0.3% -> TP
        let (reason, tp) = evaluate_exit(&reg, 10_030, at(10, 5)).unwrap();
        assert!(tp);
        assert!(reason.contains("take-profit"));
        // 9900 = -1.0% -> SL
        let (reason, tp) = evaluate_exit(&reg, 9_900, at(10, 5)).unwrap();
        assert!(!tp);
        assert!(reason.contains("stop-loss"));
        // Flat but past the holding window -> timeout
        let (reason, tp) = evaluate_exit(&reg, 10_000, at(11, 0)).unwrap();
        assert!(!tp);
        assert!(reason.contains("timeout"));
        // Flat inside the window -> hold
        assert!(evaluate_exit(&reg, 10_000, at(10, 30)).is_none());
    }

    #[tokio::test]
    async fn take_profit_emits_one_signal() {
        let (recorder, monitor) = monitor().await;
        monitor.on_tick(&tick(10_030, at(10, 5))).await;
        // A second qualifying tick is suppressed until reconciliation.
        monitor.on_tick(&tick(10_050, at(10, 6))).await;

        let signals = recorder.signals.lock().unwrap().clone();
        assert_eq!(signals.len(), 1);
        assert!(signals[0].is_take_profit);
        assert_eq!(signals[0].quantity, 5);
        assert!(monitor.is_exit_in_progress("233740").await);
    }

    #[tokio::test]
    async fn removal_clears_suppression() {
        let (recorder, monitor) = monitor().await;
        monitor.on_tick(&tick(9_900, at(10, 5))).await;
        assert_eq!(recorder.signals.lock().unwrap().len(), 1);

        monitor.remove_position("233740").await;
        assert!(!monitor.is_monitored("233740").await);
        assert!(!monitor.is_exit_in_progress("233740").await);

        // Re-register (new entry) and trigger again.
        monitor.add_position(registration()).await;
        monitor.on_tick(&tick(9_900, at(10, 10))).await;
        assert_eq!(recorder.signals.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn unknown_symbols_are_ignored() {
        let (recorder, monitor) = monitor().await;
        let mut other = tick(9_000, at(10, 5));
        other.symbol = "005930".into();
        monitor.on_tick(&other).await;
        assert!(recorder.signals.lock().unwrap().is_empty());
    }
}
