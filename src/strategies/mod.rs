//! Strategy contract and the ported strategies.
//!
//! The engine only consumes the [`Strategy`] trait and the registry;
//! individual strategies stay self-contained.

mod bollinger_band;
mod dip_buy;
mod donchian;
pub mod indicators;
mod registry;
mod traits;
mod scalping_range;

pub use bollinger_band::BollingerBandStrategy;
pub use dip_buy::DipBuyStrategy;
pub use donchian::DonchianStrategy;
pub use registry::StrategyRegistry;
pub use scalping_range::ScalpingRangeStrategy;
pub use traits::{PositionView, SignalKind, Strategy, StrategyContext, TradingSignal};
