//! Time-driven dispatcher.
//!
//! One task reads the wall clock once per second during trading hours,
//! fires `on_check_fills` ahead of per-symbol dispatch, and walks the
//! configured symbols sequentially so broker-side concurrency stays
//! bounded. Outside trading hours it idles on a slow cadence. Market
//! open/close are edge-detected; the close callback fires at most once per
//! date so a restart inside the same day cannot double-run end-of-day
//! work.

use crate::config::Settings;
use crate::domain::clock::{date_str, is_trading_hours, is_weekday, should_execute};
use async_trait::async_trait;
use chrono::{Local, NaiveDateTime};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Engine-side callbacks, wired once at construction.
#[async_trait]
pub trait SchedulerHooks: Send + Sync {
    /// Runs once per trading tick, before any per-symbol dispatch.
    async fn on_check_fills(&self);
    async fn on_stock_tick(&self, symbol: &str, now: NaiveDateTime);
    async fn on_market_open(&self);
    async fn on_market_close(&self);
    async fn on_idle(&self);
}

#[derive(Debug, Clone)]
struct SymbolCadence {
    symbol: String,
    interval_seconds: u32,
    offset_seconds: u32,
}

#[derive(Debug, Default)]
struct LoopState {
    was_trading: bool,
    last_close_date: Option<String>,
}

pub struct TradingScheduler {
    trading_start: String,
    trading_end: String,
    idle_interval: Duration,
    cadences: Vec<SymbolCadence>,
    hooks: Arc<dyn SchedulerHooks>,
}

impl TradingScheduler {
    pub fn new(settings: &Settings, hooks: Arc<dyn SchedulerHooks>) -> Self {
        let cadences = settings
            .stocks
            .keys()
            .map(|symbol| SymbolCadence {
                symbol: symbol.clone(),
                interval_seconds: settings.stock_interval(symbol),
                offset_seconds: settings.stock_offset(symbol),
            })
            .collect();
        info!("TradingScheduler initialized");
        Self {
            trading_start: settings.schedule.trading_start.clone(),
            trading_end: settings.schedule.trading_end.clone(),
            idle_interval: Duration::from_secs(settings.schedule.idle_check_interval_seconds),
            cadences,
            hooks,
        }
    }

    pub fn managed_symbols(&self) -> Vec<String> {
        self.cadences.iter().map(|c| c.symbol.clone()).collect()
    }

    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut state = LoopState::default();
            info!("scheduler started");
            loop {
                if *shutdown.borrow() {
                    break;
                }
                let now = Local::now().naive_local();
                let sleep_for = self.run_iteration(&mut state, now).await;
                tokio::select! {
                    _ = tokio::time::sleep(sleep_for) => {}
                    _ = shutdown.changed() => {}
                }
            }
            info!("scheduler stopped");
        })
    }

    /// One pass of the loop. Returns how long to sleep before the next.
    async fn run_iteration(&self, state: &mut LoopState, now: NaiveDateTime) -> Duration {
        if !is_weekday(now) {
            debug!("weekend, sleeping");
            return Duration::from_secs(60);
        }

        let trading = is_trading_hours(now, &self.trading_start, &self.trading_end);
        if trading {
            if !state.was_trading {
                state.was_trading = true;
                info!("market opened");
                self.hooks.on_market_open().await;
            }

            self.hooks.on_check_fills().await;
            for cadence in &self.cadences {
                if should_execute(now, cadence.interval_seconds, cadence.offset_seconds) {
                    self.hooks.on_stock_tick(&cadence.symbol, now).await;
                }
            }
            Duration::from_secs(1)
        } else {
            if state.was_trading {
                state.was_trading = false;
                let today = date_str(now);
                if state.last_close_date.as_deref() != Some(today.as_str()) {
                    state.last_close_date = Some(today);
                    info!("market closed");
                    self.hooks.on_market_close().await;
                }
            }
            self.hooks.on_idle().await;
            self.idle_interval
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Credentials, Settings, TradingMode};
    use chrono::NaiveDate;
    use std::path::PathBuf;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct Recorder {
        events: StdMutex<Vec<String>>,
    }

    impl Recorder {
        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SchedulerHooks for Recorder {
        async fn on_check_fills(&self) {
            self.events.lock().unwrap().push("check_fills".into());
        }
        async fn on_stock_tick(&self, symbol: &str, _now: NaiveDateTime) {
            self.events.lock().unwrap().push(format!("tick:{symbol}"));
        }
        async fn on_market_open(&self) {
            self.events.lock().unwrap().push("open".into());
        }
        async fn on_market_close(&self) {
            self.events.lock().unwrap().push("close".into());
        }
        async fn on_idle(&self) {
            self.events.lock().unwrap().push("idle".into());
        }
    }

    fn scheduler() -> (Arc<Recorder>, TradingScheduler) {
        let yaml = r#"
schedule:
  trading_start: "09:00"
  trading_end: "15:30"
  default_interval_seconds: 5
stocks:
  "005930":
    name: Samsung
    interval_seconds: 5
    strategies: []
  "233740":
    name: KODEX
    interval_seconds: 5
    offset_seconds: 2
    strategies: []
"#;
        let settings = Settings::from_parts(
            TradingMode::Paper,
            yaml,
            Credentials::default(),
            PathBuf::from("/tmp"),
        )
        .unwrap();
        let hooks = Arc::new(Recorder::default());
        let scheduler = TradingScheduler::new(&settings, hooks.clone());
        (hooks, scheduler)
    }

    fn wed(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 6, 18)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    fn sat(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 6, 21)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    #[tokio::test]
    async fn weekend_sleeps_long_and_fires_nothing() {
        let (hooks, scheduler) = scheduler();
        let mut state = LoopState::default();
        let sleep = scheduler.run_iteration(&mut state, sat(10, 0, 0)).await;
        assert_eq!(sleep, Duration::from_secs(60));
        assert!(hooks.events().is_empty());
    }

    #[tokio::test]
    async fn open_edge_fires_once_then_ticks() {
        let (hooks, scheduler) = scheduler();
        let mut state = LoopState::default();

        // :00 matches interval 5 offset 0 but not offset 2.
        scheduler.run_iteration(&mut state, wed(9, 0, 0)).await;
        assert_eq!(
            hooks.events(),
            vec!["open", "check_fills", "tick:005930"]
        );

        // Next second matches neither symbol; no second "open".
        scheduler.run_iteration(&mut state, wed(9, 0, 1)).await;
        assert_eq!(
            hooks.events(),
            vec!["open", "check_fills", "tick:005930", "check_fills"]
        );
    }

    #[tokio::test]
    async fn check_fills_precedes_every_dispatch() {
        let (hooks, scheduler) = scheduler();
        let mut state = LoopState {
            was_trading: true,
            last_close_date: None,
        };
        scheduler.run_iteration(&mut state, wed(9, 0, 2)).await;
        assert_eq!(hooks.events(), vec!["check_fills", "tick:233740"]);
    }

    #[tokio::test]
    async fn offsets_stagger_symbols() {
        let (hooks, scheduler) = scheduler();
        let mut state = LoopState {
            was_trading: true,
            last_close_date: None,
        };
        // :05 fires offset 0; :07 fires offset 2.
        scheduler.run_iteration(&mut state, wed(9, 0, 5)).await;
        scheduler.run_iteration(&mut state, wed(9, 0, 7)).await;
        let events = hooks.events();
        assert!(events.contains(&"tick:005930".to_string()));
        assert!(events.contains(&"tick:233740".to_string()));
        assert_eq!(events.iter().filter(|e| e.starts_with("tick:")).count(), 2);
    }

    #[tokio::test]
    async fn close_edge_fires_once_per_date() {
        let (hooks, scheduler) = scheduler();
        let mut state = LoopState {
            was_trading: true,
            last_close_date: None,
        };

        let sleep = scheduler.run_iteration(&mut state, wed(15, 31, 0)).await;
        assert_eq!(sleep, Duration::from_secs(60));
        assert_eq!(hooks.events(), vec!["close", "idle"]);

        // Re-enter and leave trading hours the same date: no second close.
        state.was_trading = true;
        scheduler.run_iteration(&mut state, wed(15, 32, 0)).await;
        let closes = hooks.events().iter().filter(|e| *e == "close").count();
        assert_eq!(closes, 1);
    }
}
