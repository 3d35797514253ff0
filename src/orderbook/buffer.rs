//! Diff buffer
//!
//! Holds depth updates that arrive while a snapshot is in flight, in arrival order.

use std::collections::VecDeque;

use crate::parser::DepthUpdate;

#[derive(Debug)]
pub struct DiffBuffer {
    diffs: VecDeque<DepthUpdate>,
    capacity: usize,
    /// Diffs evicted because the buffer was full
    overflowed: u64,
}

impl DiffBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            diffs: VecDeque::new(),
            capacity: capacity.max(1),
            overflowed: 0,
        }
    }

    /// Append a diff, evicting the oldest when full; returns the evicted diff
    ///
    /// An eviction leaves a hole in front of the buffer, which the continuity
    /// check turns into a snapshot re-fetch.
    pub fn push(&mut self, diff: DepthUpdate) -> Option<DepthUpdate> {
        let evicted = if self.diffs.len() == self.capacity {
            self.overflowed += 1;
            self.diffs.pop_front()
        } else {
            None
        };
        self.diffs.push_back(diff);
        evicted
    }

    /// Drop every diff already represented by a snapshot with id `last_update_id`
    pub fn discard_through(&mut self, last_update_id: u64) -> usize {
        let before = self.diffs.len();
        self.diffs.retain(|d| d.final_update_id > last_update_id);
        before - self.diffs.len()
    }

    pub fn front(&self) -> Option<&DepthUpdate> {
        self.diffs.front()
    }

    /// Take all buffered diffs in arrival order
    pub fn drain(&mut self) -> impl Iterator<Item = DepthUpdate> + '_ {
        self.diffs.drain(..)
    }

    pub fn clear(&mut self) {
        self.diffs.clear();
    }

    pub fn len(&self) -> usize {
        self.diffs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.diffs.is_empty()
    }

    pub fn overflowed(&self) -> u64 {
        self.overflowed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diff(first: u64, last: u64) -> DepthUpdate {
        DepthUpdate {
            event_type: "depthUpdate".to_string(),
            event_time: 0,
            symbol: String::new(),
            first_update_id: first,
            final_update_id: last,
            bids: vec![],
            asks: vec![],
        }
    }

    #[test]
    fn test_discard_through_keeps_straddling_diff() {
        let mut buffer = DiffBuffer::new(16);
        buffer.push(diff(90, 95));
        buffer.push(diff(96, 100));
        buffer.push(diff(101, 103));
        buffer.push(diff(98, 104));

        assert_eq!(buffer.discard_through(100), 2);
        let ids: Vec<_> = buffer.drain().map(|d| d.first_update_id).collect();
        assert_eq!(ids, vec![101, 98]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_overflow_evicts_oldest() {
        let mut buffer = DiffBuffer::new(2);
        assert!(buffer.push(diff(1, 1)).is_none());
        assert!(buffer.push(diff(2, 2)).is_none());
        let evicted = buffer.push(diff(3, 3));
        assert_eq!(evicted.map(|d| d.first_update_id), Some(1));

        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.overflowed(), 1);
        assert_eq!(buffer.front().map(|d| d.first_update_id), Some(2));
    }
}
