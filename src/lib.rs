//! krxtrade — unattended KRX equities trading worker.
//!
//! Runs strategies on per-symbol cadences against the KIS Open API (REST +
//! WebSocket), places and manages real orders under duplicate suppression,
//! deposit checks, emergency stop, end-of-day liquidation and crash recovery.

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod notification;
pub mod strategies;
