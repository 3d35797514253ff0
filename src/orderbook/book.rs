//! Core order book implementation
//!
//! Uses BTreeMap for sorted price level management. The full book is kept;
//! only the published per-side views are truncated to the configured depth.
//! A view is rebuilt only when its side changed.

use chrono::Utc;
use rust_decimal::Decimal;
use std::cmp::Reverse;
use std::collections::BTreeMap;

use super::{Level, OrderBookMetrics, OrderBookState, Side};
use crate::parser::{DepthUpdate, OrderBookSnapshot, PriceLevel};

/// Order book for a single symbol
#[derive(Debug)]
pub struct OrderBook {
    symbol: String,
    /// Bids sorted by price descending (highest first)
    bids: BTreeMap<Reverse<Decimal>, Decimal>,
    /// Asks sorted by price ascending (lowest first)
    asks: BTreeMap<Decimal, Decimal>,
    /// Top `max_depth` bids with cumulative totals
    bid_view: Vec<Level>,
    /// Top `max_depth` asks with cumulative totals
    ask_view: Vec<Level>,
    /// Last processed update ID
    last_update_id: u64,
    /// Whether the book has been initialized with a snapshot
    initialized: bool,
    /// Depth levels published per side
    max_depth: usize,
    /// Event time of last update
    last_update_time: u64,
}

impl OrderBook {
    /// Create a new empty order book
    pub fn new(symbol: &str, max_depth: usize) -> Self {
        Self {
            symbol: symbol.to_string(),
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            bid_view: Vec::new(),
            ask_view: Vec::new(),
            last_update_id: 0,
            initialized: false,
            max_depth,
            last_update_time: 0,
        }
    }

    /// Replace the whole book with a REST snapshot
    pub fn init_snapshot(&mut self, snapshot: &OrderBookSnapshot) {
        self.bids.clear();
        self.asks.clear();

        for level in &snapshot.bids {
            if level.quantity > Decimal::ZERO {
                self.bids.insert(Reverse(level.price), level.quantity);
            }
        }

        for level in &snapshot.asks {
            if level.quantity > Decimal::ZERO {
                self.asks.insert(level.price, level.quantity);
            }
        }

        self.last_update_id = snapshot.last_update_id;
        // REST snapshots carry no event time
        self.last_update_time = Utc::now().timestamp_millis().max(0) as u64;
        self.initialized = true;
        self.rebuild_view(Side::Bid);
        self.rebuild_view(Side::Ask);
    }

    /// Drop all state; the book must be re-initialised from a snapshot
    pub fn clear(&mut self) {
        self.bids.clear();
        self.asks.clear();
        self.bid_view.clear();
        self.ask_view.clear();
        self.last_update_id = 0;
        self.last_update_time = 0;
        self.initialized = false;
    }

    /// Apply a depth update
    ///
    /// Returns false without touching the book when it is not initialised or the
    /// update is already represented (`final_update_id <= last_update_id`).
    /// Continuity is the caller's concern.
    pub fn apply_update(&mut self, update: &DepthUpdate) -> bool {
        if !self.initialized {
            return false;
        }

        if update.final_update_id <= self.last_update_id {
            return false;
        }

        for level in &update.bids {
            self.update_side(Side::Bid, level);
        }

        for level in &update.asks {
            self.update_side(Side::Ask, level);
        }

        if !update.bids.is_empty() {
            self.rebuild_view(Side::Bid);
        }
        if !update.asks.is_empty() {
            self.rebuild_view(Side::Ask);
        }

        self.last_update_id = update.final_update_id;
        self.last_update_time = update.event_time;

        true
    }

    /// Update a single price level; zero size deletes
    fn update_side(&mut self, side: Side, level: &PriceLevel) {
        match side {
            Side::Bid => {
                if level.quantity == Decimal::ZERO {
                    self.bids.remove(&Reverse(level.price));
                } else {
                    self.bids.insert(Reverse(level.price), level.quantity);
                }
            }
            Side::Ask => {
                if level.quantity == Decimal::ZERO {
                    self.asks.remove(&level.price);
                } else {
                    self.asks.insert(level.price, level.quantity);
                }
            }
        }
    }

    /// Recompute the truncated view and running totals for one side
    fn rebuild_view(&mut self, side: Side) {
        match side {
            Side::Bid => {
                self.bid_view = accumulate(
                    self.bids.iter().map(|(Reverse(p), q)| (*p, *q)),
                    self.max_depth,
                );
            }
            Side::Ask => {
                self.ask_view = accumulate(self.asks.iter().map(|(p, q)| (*p, *q)), self.max_depth);
            }
        }
    }

    /// Get best bid price
    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.first_key_value().map(|(Reverse(p), _)| *p)
    }

    /// Get best ask price
    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.first_key_value().map(|(p, _)| *p)
    }

    /// Get mid price
    pub fn mid_price(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some((bid + ask) / Decimal::from(2)),
            _ => None,
        }
    }

    /// Get spread in basis points
    pub fn spread_bps(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask(), self.mid_price()) {
            (Some(bid), Some(ask), Some(mid)) if mid > Decimal::ZERO => {
                Some((ask - bid) / mid * Decimal::from(10000))
            }
            _ => None,
        }
    }

    /// Calculate order book imbalance over the top N published levels
    pub fn imbalance(&self, levels: usize) -> Option<Decimal> {
        let bid_volume: Decimal = self.bid_view.iter().take(levels).map(|l| l.quantity).sum();
        let ask_volume: Decimal = self.ask_view.iter().take(levels).map(|l| l.quantity).sum();

        let total = bid_volume + ask_volume;
        if total > Decimal::ZERO {
            Some((bid_volume - ask_volume) / total)
        } else {
            None
        }
    }

    /// Calculate weighted imbalance over the published levels (closer to mid weighted more)
    pub fn weighted_imbalance(&self, levels: usize, decay: Decimal) -> Option<Decimal> {
        self.mid_price()?;

        let bid_weighted = decayed_sum(self.bid_view.iter().take(levels), decay);
        let ask_weighted = decayed_sum(self.ask_view.iter().take(levels), decay);

        let total = bid_weighted + ask_weighted;
        if total > Decimal::ZERO {
            Some((bid_weighted - ask_weighted) / total)
        } else {
            None
        }
    }

    /// Check if the book is initialized
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Get last update ID
    pub fn last_update_id(&self) -> u64 {
        self.last_update_id
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Published bid levels, best first
    pub fn bids(&self) -> &[Level] {
        &self.bid_view
    }

    /// Published ask levels, best first
    pub fn asks(&self) -> &[Level] {
        &self.ask_view
    }

    /// Get current state for publishing
    pub fn state(&self) -> OrderBookState {
        OrderBookState {
            symbol: self.symbol.clone(),
            timestamp: self.last_update_time,
            last_update_id: self.last_update_id,
            bids: self.bid_view.clone(),
            asks: self.ask_view.clone(),
            metrics: self.calculate_metrics(),
        }
    }

    /// Calculate order book metrics over the published depth
    fn calculate_metrics(&self) -> OrderBookMetrics {
        OrderBookMetrics {
            mid_price: self.mid_price(),
            spread_bps: self.spread_bps(),
            imbalance: self.imbalance(5),
            weighted_imbalance: self.weighted_imbalance(10, Decimal::new(9, 1)),
            bid_depth: self.bid_view.last().map(|l| l.total).unwrap_or_default(),
            ask_depth: self.ask_view.last().map(|l| l.total).unwrap_or_default(),
            bid_levels: self.bid_view.len(),
            ask_levels: self.ask_view.len(),
        }
    }
}

fn accumulate(levels: impl Iterator<Item = (Decimal, Decimal)>, depth: usize) -> Vec<Level> {
    let mut total = Decimal::ZERO;
    levels
        .take(depth)
        .map(|(price, quantity)| {
            total += quantity;
            Level {
                price,
                quantity,
                total,
            }
        })
        .collect()
}

fn decayed_sum<'a>(levels: impl Iterator<Item = &'a Level>, decay: Decimal) -> Decimal {
    let mut weight = Decimal::ONE;
    let mut sum = Decimal::ZERO;
    for level in levels {
        sum += level.quantity * weight;
        weight *= decay;
    }
    sum
}
