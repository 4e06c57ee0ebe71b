//! Embedded SQLite persistence.
//!
//! Two stores: market data (candles, shared across paper/live) and trading
//! data (orders, positions, daily summary, audit trail, split per mode).
//! All writes funnel through one writer task per store; reads go through a
//! shared read pool.

pub mod audit;
pub mod database;
pub mod daily_candles;
pub mod minute_candles;

pub use audit::AuditLog;
pub use daily_candles::{DailyCandle, DailyCandleRepository};
pub use database::{MarketDataDb, TradingDb};
pub use minute_candles::{MinuteCandle, MinuteCandleRepository};
