//! Market Sync - streaming state synchronisation
//!
//! Keeps client-side views consistent with unreliable market and chain event
//! streams: an order book reconciled from a REST snapshot plus a sequenced diff
//! stream, a JSON-RPC subscription multiplexer that survives reconnects, and a
//! pure position/P&L fold over trade history.

use std::sync::Arc;

pub mod config;
pub mod error;
pub mod multiplexer;
pub mod orderbook;
pub mod parser;
pub mod position;
pub mod publisher;
pub mod snapshot;
pub mod telemetry;
pub mod websocket;

pub use config::Config;
pub use error::{Result, SyncError};
pub use multiplexer::{Multiplexer, MultiplexerSettings, Notification, Subscription, SubscriptionId};
pub use orderbook::{Level, OrderBook, OrderBookMetrics, OrderBookReconciler, OrderBookState};
pub use parser::{DepthUpdate, OrderBookSnapshot, ParsedMessage, PriceLevel};
pub use position::{compute, compute_with_prices, Position, PriceLookup, TradeEvent, TradeSide};
pub use publisher::Publisher;
pub use snapshot::{RestSnapshotFetcher, SnapshotSource};
pub use websocket::{BookStreamSettings, ConnectionState, ReconnectPolicy, StreamConnection};

/// Application state shared with the health server
pub struct AppState {
    pub book_stream: StreamConnection,
    pub multiplexer: Option<Multiplexer>,
    pub config: Arc<Config>,
}
