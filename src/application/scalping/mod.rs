//! Per-symbol tick-driven scalping: limit-order dip buying with a small
//! take-profit, bounded by a signal lifetime.

pub mod boundary_tracker;
pub mod executor;
pub mod models;
pub mod price_tracker;

pub use boundary_tracker::BoundaryTracker;
pub use executor::ScalpingExecutor;
pub use models::{MonitorKind, ScalpingConfig, ScalpingState, SignalContext};
pub use price_tracker::PriceRangeTracker;
