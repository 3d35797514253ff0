//! Trade log fold
//!
//! Buys move the average entry price; sells realise P&L against it and never
//! revise it. Events are taken in the order given.

use std::collections::BTreeMap;

use rust_decimal::Decimal;

use super::{Position, PriceLookup, TradeEvent, TradeSide};

/// Positions for every symbol in `events`, ordered by symbol
pub fn compute(events: &[TradeEvent]) -> Vec<Position> {
    fold(events).into_values().collect()
}

/// Like [`compute`], also marking positions the lookup can price
pub fn compute_with_prices<P: PriceLookup + ?Sized>(events: &[TradeEvent], prices: &P) -> Vec<Position> {
    fold(events)
        .into_values()
        .map(|mut position| {
            if let Some(mark) = prices.mark_price(&position.symbol) {
                position.mark_price = Some(mark);
                position.unrealized_pnl = Some(position.amount * (mark - position.avg_entry_price));
            }
            position
        })
        .collect()
}

fn fold(events: &[TradeEvent]) -> BTreeMap<String, Position> {
    let mut positions: BTreeMap<String, Position> = BTreeMap::new();

    for event in events {
        if event.amount <= Decimal::ZERO {
            continue;
        }

        let position = positions
            .entry(event.symbol.clone())
            .or_insert_with(|| Position::flat(&event.symbol));

        match event.side {
            TradeSide::Buy => {
                let amount = position.amount + event.amount;
                position.avg_entry_price = (position.amount * position.avg_entry_price
                    + event.amount * event.price)
                    / amount;
                position.amount = amount;
            }
            TradeSide::Sell => {
                position.realized_pnl += event.amount * (event.price - position.avg_entry_price);
                // Floor guards against histories missing earlier buys
                position.amount = (position.amount - event.amount).max(Decimal::ZERO);
            }
        }

        position.cost_basis = position.amount * position.avg_entry_price;
    }

    positions
}
