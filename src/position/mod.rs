//! Position and P&L aggregation
//!
//! Folds an ordered trade log into per-symbol positions. Positions are fully
//! derived: recompute from the log instead of mutating them.

mod aggregator;

pub use aggregator::{compute, compute_with_prices};

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    Buy,
    Sell,
}

/// One executed trade from the caller's history, oldest first
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeEvent {
    pub symbol: String,
    pub side: TradeSide,
    pub amount: Decimal,
    pub price: Decimal,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub amount: Decimal,
    pub avg_entry_price: Decimal,
    pub realized_pnl: Decimal,
    /// amount * avg_entry_price
    pub cost_basis: Decimal,
    pub mark_price: Option<Decimal>,
    pub unrealized_pnl: Option<Decimal>,
}

impl Position {
    fn flat(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            amount: Decimal::ZERO,
            avg_entry_price: Decimal::ZERO,
            realized_pnl: Decimal::ZERO,
            cost_basis: Decimal::ZERO,
            mark_price: None,
            unrealized_pnl: None,
        }
    }
}

/// Current prices used to mark positions
#[cfg_attr(test, mockall::automock)]
pub trait PriceLookup {
    fn mark_price(&self, symbol: &str) -> Option<Decimal>;
}

impl PriceLookup for HashMap<String, Decimal> {
    fn mark_price(&self, symbol: &str) -> Option<Decimal> {
        self.get(symbol).copied()
    }
}
