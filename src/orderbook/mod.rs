//! Order book module
//!
//! Reconciles a REST snapshot with the incremental depth stream into a sorted,
//! depth-limited book.

mod book;
mod buffer;
mod metrics;
mod reconciler;

pub use book::OrderBook;
pub use buffer::DiffBuffer;
pub use metrics::OrderBookMetrics;
pub use reconciler::{DiffOutcome, OrderBookReconciler, SyncPhase};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Side of the order book
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Bid,
    Ask,
}

/// A single published level: size plus running total from the best price outward
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Level {
    pub price: Decimal,
    pub quantity: Decimal,
    pub total: Decimal,
}

/// Order book state to be published
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderBookState {
    pub symbol: String,
    pub timestamp: u64,
    pub last_update_id: u64,
    pub bids: Vec<Level>,
    pub asks: Vec<Level>,
    pub metrics: OrderBookMetrics,
}
