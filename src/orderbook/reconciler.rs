//! Snapshot + diff reconciliation
//!
//! Diffs are buffered until a snapshot arrives. The snapshot is accepted only if
//! the first buffered diff it does not already contain starts at or before
//! `lastUpdateId + 1`; the remaining buffer is then replayed in arrival order and
//! the reconciler goes live. A gap while live drops back to buffering.

use tracing::{debug, warn};

use super::{DiffBuffer, OrderBook, OrderBookState};
use crate::error::{Result, SyncError};
use crate::parser::{DepthUpdate, OrderBookSnapshot};
use crate::telemetry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    /// Buffering diffs until a consistent snapshot is loaded
    AwaitingSnapshot,
    /// Applying diffs as they arrive
    Live,
}

/// Result of feeding one diff to the reconciler
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffOutcome {
    Buffered,
    Applied,
    /// Already represented in the book
    Stale,
    /// Sequence hole while live; the diff was buffered and a new snapshot is needed
    Gap { expected: u64, got: u64 },
}

#[derive(Debug)]
pub struct OrderBookReconciler {
    book: OrderBook,
    buffer: DiffBuffer,
    phase: SyncPhase,
}

impl OrderBookReconciler {
    pub fn new(symbol: &str, max_depth: usize, max_buffered: usize) -> Self {
        Self {
            book: OrderBook::new(symbol, max_depth),
            buffer: DiffBuffer::new(max_buffered),
            phase: SyncPhase::AwaitingSnapshot,
        }
    }

    /// Forget everything; used on every new connection
    pub fn reset(&mut self) {
        self.book.clear();
        self.buffer.clear();
        self.phase = SyncPhase::AwaitingSnapshot;
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    pub fn book(&self) -> &OrderBook {
        &self.book
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn buffer_overflows(&self) -> u64 {
        self.buffer.overflowed()
    }

    pub fn state(&self) -> OrderBookState {
        self.book.state()
    }

    /// Feed one diff in arrival order
    pub fn on_diff(&mut self, diff: DepthUpdate) -> DiffOutcome {
        match self.phase {
            SyncPhase::AwaitingSnapshot => {
                self.buffer_diff(diff);
                DiffOutcome::Buffered
            }
            SyncPhase::Live => {
                let last = self.book.last_update_id();
                if diff.final_update_id <= last {
                    return DiffOutcome::Stale;
                }
                if diff.first_update_id > last.saturating_add(1) {
                    let gap = DiffOutcome::Gap {
                        expected: last.saturating_add(1),
                        got: diff.first_update_id,
                    };
                    self.phase = SyncPhase::AwaitingSnapshot;
                    self.buffer_diff(diff);
                    return gap;
                }
                self.book.apply_update(&diff);
                DiffOutcome::Applied
            }
        }
    }

    fn buffer_diff(&mut self, diff: DepthUpdate) {
        if let Some(evicted) = self.buffer.push(diff) {
            telemetry::DIFFS_EVICTED.inc();
            warn!(
                symbol = %self.book.symbol(),
                first_update_id = evicted.first_update_id,
                final_update_id = evicted.final_update_id,
                overflows = self.buffer.overflowed(),
                "Diff buffer full, dropped oldest diff"
            );
        }
    }

    /// Reconcile a freshly fetched snapshot with the buffered diffs
    ///
    /// On success returns the number of buffered diffs replayed and the
    /// reconciler is live. On error the snapshot must be re-fetched; buffered
    /// diffs newer than the snapshot are kept.
    pub fn on_snapshot(&mut self, snapshot: &OrderBookSnapshot) -> Result<usize> {
        let snapshot_id = snapshot.last_update_id;
        let discarded = self.buffer.discard_through(snapshot_id);

        if let Some(first) = self.buffer.front() {
            if first.first_update_id > snapshot_id.saturating_add(1) {
                return Err(SyncError::StaleSnapshot {
                    snapshot_id,
                    first_update_id: first.first_update_id,
                });
            }
        }

        self.book.init_snapshot(snapshot);

        let mut pending = self.buffer.drain().collect::<Vec<DepthUpdate>>().into_iter();
        let mut applied = 0;
        while let Some(diff) = pending.next() {
            let last = self.book.last_update_id();
            if diff.final_update_id <= last {
                continue;
            }
            if diff.first_update_id > last.saturating_add(1) {
                let err = SyncError::SequenceGap {
                    expected: last.saturating_add(1),
                    got: diff.first_update_id,
                };
                self.book.clear();
                self.buffer_diff(diff);
                for rest in pending {
                    self.buffer_diff(rest);
                }
                return Err(err);
            }
            self.book.apply_update(&diff);
            applied += 1;
        }

        debug!(
            snapshot_id,
            discarded,
            applied,
            last_update_id = self.book.last_update_id(),
            "Snapshot reconciled"
        );

        self.phase = SyncPhase::Live;
        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::PriceLevel;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn diff(first: u64, last: u64, bids: Vec<(Decimal, Decimal)>) -> DepthUpdate {
        DepthUpdate {
            event_type: "depthUpdate".to_string(),
            event_time: last,
            symbol: "BTCUSDT".to_string(),
            first_update_id: first,
            final_update_id: last,
            bids: bids.into_iter().map(|(p, q)| PriceLevel::new(p, q)).collect(),
            asks: vec![],
        }
    }

    fn snapshot(last_update_id: u64) -> OrderBookSnapshot {
        OrderBookSnapshot {
            last_update_id,
            bids: vec![PriceLevel::new(dec!(100), dec!(1))],
            asks: vec![PriceLevel::new(dec!(101), dec!(1))],
        }
    }

    fn reconciler() -> OrderBookReconciler {
        OrderBookReconciler::new("BTCUSDT", 10, 100)
    }

    #[test]
    fn test_buffers_until_snapshot() {
        let mut rec = reconciler();
        assert_eq!(rec.on_diff(diff(95, 99, vec![])), DiffOutcome::Buffered);
        assert_eq!(rec.on_diff(diff(100, 102, vec![(dec!(99), dec!(3))])), DiffOutcome::Buffered);
        assert_eq!(rec.on_diff(diff(103, 104, vec![(dec!(98), dec!(1))])), DiffOutcome::Buffered);
        assert!(!rec.book().is_initialized());

        assert_eq!(rec.on_snapshot(&snapshot(100)).unwrap(), 2);
        assert_eq!(rec.phase(), SyncPhase::Live);
        assert_eq!(rec.book().last_update_id(), 104);
        assert_eq!(rec.book().bids().len(), 3);
        assert_eq!(rec.buffered(), 0);
    }

    #[test]
    fn test_gap_after_snapshot_requires_refetch() {
        let mut rec = reconciler();
        rec.on_diff(diff(105, 110, vec![(dec!(99), dec!(1))]));

        let err = rec.on_snapshot(&snapshot(100)).unwrap_err();
        assert!(matches!(
            err,
            SyncError::StaleSnapshot {
                snapshot_id: 100,
                first_update_id: 105
            }
        ));
        assert!(!rec.book().is_initialized());
        assert_eq!(rec.phase(), SyncPhase::AwaitingSnapshot);
        assert_eq!(rec.buffered(), 1);

        assert_eq!(rec.on_snapshot(&snapshot(107)).unwrap(), 1);
        assert_eq!(rec.book().last_update_id(), 110);
    }

    #[test]
    fn test_snapshot_newer_than_buffer_goes_live() {
        let mut rec = reconciler();
        rec.on_diff(diff(90, 95, vec![]));

        assert_eq!(rec.on_snapshot(&snapshot(200)).unwrap(), 0);
        assert_eq!(rec.phase(), SyncPhase::Live);
        assert_eq!(rec.book().last_update_id(), 200);
    }

    #[test]
    fn test_hole_inside_buffer_requires_refetch() {
        let mut rec = reconciler();
        rec.on_diff(diff(100, 102, vec![]));
        rec.on_diff(diff(110, 112, vec![]));

        let err = rec.on_snapshot(&snapshot(101)).unwrap_err();
        assert!(matches!(err, SyncError::SequenceGap { expected: 103, got: 110 }));
        assert!(!rec.book().is_initialized());
        assert_eq!(rec.buffered(), 1);

        assert_eq!(rec.on_snapshot(&snapshot(111)).unwrap(), 1);
        assert_eq!(rec.book().last_update_id(), 112);
    }

    #[test]
    fn test_live_replay_is_idempotent() {
        let mut rec = reconciler();
        rec.on_snapshot(&snapshot(100)).unwrap();
        assert_eq!(rec.on_diff(diff(101, 101, vec![(dec!(100), dec!(0))])), DiffOutcome::Applied);
        let before = rec.state();

        assert_eq!(rec.on_diff(diff(101, 101, vec![(dec!(100), dec!(5))])), DiffOutcome::Stale);
        assert_eq!(rec.on_diff(diff(90, 100, vec![(dec!(50), dec!(5))])), DiffOutcome::Stale);
        assert_eq!(rec.state().bids, before.bids);
        assert_eq!(rec.book().last_update_id(), 101);
    }

    #[test]
    fn test_live_gap_returns_to_buffering() {
        let mut rec = reconciler();
        rec.on_snapshot(&snapshot(100)).unwrap();

        assert_eq!(
            rec.on_diff(diff(105, 106, vec![])),
            DiffOutcome::Gap {
                expected: 101,
                got: 105
            }
        );
        assert_eq!(rec.phase(), SyncPhase::AwaitingSnapshot);
        assert_eq!(rec.on_diff(diff(107, 107, vec![])), DiffOutcome::Buffered);
        assert_eq!(rec.buffered(), 2);

        assert_eq!(rec.on_snapshot(&snapshot(104)).unwrap(), 2);
        assert_eq!(rec.book().last_update_id(), 107);
    }

    #[test]
    fn test_buffer_overflow_forces_refetch() {
        let mut rec = OrderBookReconciler::new("BTCUSDT", 10, 2);
        let evicted_before = telemetry::DIFFS_EVICTED.get();
        rec.on_diff(diff(101, 101, vec![]));
        rec.on_diff(diff(102, 102, vec![]));
        rec.on_diff(diff(103, 103, vec![]));

        assert_eq!(rec.buffer_overflows(), 1);
        assert!(telemetry::DIFFS_EVICTED.get() > evicted_before);
        assert!(matches!(
            rec.on_snapshot(&snapshot(100)),
            Err(SyncError::StaleSnapshot {
                first_update_id: 102,
                ..
            })
        ));
    }

    #[test]
    fn test_extreme_update_ids_do_not_overflow() {
        let mut rec = reconciler();
        rec.on_diff(diff(u64::MAX, u64::MAX, vec![(dec!(99), dec!(1))]));
        assert_eq!(rec.on_snapshot(&snapshot(u64::MAX - 1)).unwrap(), 1);
        assert_eq!(rec.book().last_update_id(), u64::MAX);
        assert_eq!(rec.book().bids().len(), 2);

        assert_eq!(rec.on_diff(diff(u64::MAX, u64::MAX, vec![])), DiffOutcome::Stale);
    }

    #[test]
    fn test_reset_discards_sequence_state() {
        let mut rec = reconciler();
        rec.on_snapshot(&snapshot(100)).unwrap();
        rec.on_diff(diff(101, 101, vec![]));

        rec.reset();
        assert_eq!(rec.phase(), SyncPhase::AwaitingSnapshot);
        assert!(!rec.book().is_initialized());
        assert_eq!(rec.on_diff(diff(5, 6, vec![])), DiffOutcome::Buffered);
    }
}
