//! Derived book analytics carried on every published state

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Computed metrics for a published order book
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderBookMetrics {
    /// Mid price (average of best bid and ask)
    pub mid_price: Option<Decimal>,

    /// Spread in basis points
    pub spread_bps: Option<Decimal>,

    /// Top-5 imbalance: (bid_vol - ask_vol) / (bid_vol + ask_vol)
    pub imbalance: Option<Decimal>,

    /// Top-10 imbalance with geometric decay away from the touch
    pub weighted_imbalance: Option<Decimal>,

    /// Cumulative bid size over the published depth
    pub bid_depth: Decimal,

    /// Cumulative ask size over the published depth
    pub ask_depth: Decimal,

    pub bid_levels: usize,
    pub ask_levels: usize,
}

impl OrderBookMetrics {
    /// Both sides populated and not crossed
    pub fn is_healthy(&self) -> bool {
        self.bid_levels > 0
            && self.ask_levels > 0
            && self.spread_bps.map_or(false, |s| s >= Decimal::ZERO)
    }
}
