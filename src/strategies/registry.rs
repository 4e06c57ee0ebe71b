//! Explicit strategy registry.
//!
//! Populated once at program start from a fixed list of identifiers mapped
//! to constructor functions; nothing mutates it afterwards. Config
//! validation checks attachments against `contains`.

use crate::strategies::bollinger_band::BollingerBandStrategy;
use crate::strategies::dip_buy::DipBuyStrategy;
use crate::strategies::donchian::DonchianStrategy;
use crate::strategies::scalping_range::ScalpingRangeStrategy;
use crate::strategies::traits::Strategy;
use serde_json::Value;
use std::collections::BTreeMap;

type Constructor = fn(&str, &Value) -> Box<dyn Strategy>;

pub struct StrategyRegistry {
    constructors: BTreeMap<&'static str, Constructor>,
}

impl StrategyRegistry {
    pub fn with_builtins() -> Self {
        let mut constructors: BTreeMap<&'static str, Constructor> = BTreeMap::new();
        constructors.insert("bollinger_band", |name, params| {
            Box::new(BollingerBandStrategy::from_params(name, params))
        });
        constructors.insert("donchian", |name, params| {
            Box::new(DonchianStrategy::from_params(name, params))
        });
        constructors.insert("dip_buy", |name, params| {
            Box::new(DipBuyStrategy::from_params(name, params))
        });
        constructors.insert("scalping_range", |name, params| {
            Box::new(ScalpingRangeStrategy::from_params(name, params))
        });
        Self { constructors }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.constructors.contains_key(name)
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.constructors.keys().copied().collect()
    }

    /// Build a fresh instance; one instance per (symbol, strategy) pair.
    pub fn build(&self, name: &str, params: &Value) -> Option<Box<dyn Strategy>> {
        let constructor = self.constructors.get(name)?;
        Some(constructor(name, params))
    }
}
