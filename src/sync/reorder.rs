//! Sequence reorder buffer.
//!
//! Holds early-arriving items until the sequence gap before them is filled.
//! A gap that outlives `gap_timeout`, or a buffer that overflows its
//! capacity, is force-drained: the expected sequence jumps to the oldest
//! buffered item and the skip is reported, never dropped silently.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::SyncError;

/// A gap the buffer gave up on
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GapSkip {
    pub expected: u64,
    pub resumed_at: u64,
}

impl From<GapSkip> for SyncError {
    fn from(skip: GapSkip) -> Self {
        SyncError::GapTimeoutError {
            expected: skip.expected,
            resumed_at: skip.resumed_at,
        }
    }
}

/// What a push or expiry released
#[derive(Debug)]
pub struct Released<T> {
    /// Items now in order, ready for the next stage
    pub items: Vec<T>,
    pub skipped: Vec<GapSkip>,
    /// The pushed item was already applied or already buffered
    pub duplicate: bool,
}

impl<T> Default for Released<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            skipped: Vec::new(),
            duplicate: false,
        }
    }
}

pub struct ReorderBuffer<T> {
    expected: u64,
    capacity: usize,
    gap_timeout: Duration,
    pending: BTreeMap<u64, (Instant, T)>,
}

impl<T> ReorderBuffer<T> {
    pub fn new(capacity: usize, gap_timeout: Duration) -> Self {
        Self {
            expected: 0,
            capacity: capacity.max(1),
            gap_timeout,
            pending: BTreeMap::new(),
        }
    }

    pub fn expected(&self) -> u64 {
        self.expected
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn push(&mut self, sequence: u64, item: T, now: Instant) -> Released<T> {
        let mut out = Released::default();
        if sequence < self.expected || self.pending.contains_key(&sequence) {
            out.duplicate = true;
            return out;
        }

        if sequence == self.expected {
            out.items.push(item);
            self.expected += 1;
            self.release_contiguous(&mut out.items);
            return out;
        }

        self.pending.insert(sequence, (now, item));
        if self.pending.len() > self.capacity {
            self.force_drain(&mut out);
        }
        out
    }

    /// Force-drain every gap whose oldest buffered item has waited at least
    /// `gap_timeout`
    pub fn expire(&mut self, now: Instant) -> Released<T> {
        let mut out = Released::default();
        while let Some(oldest) = self.oldest_arrival() {
            if now.saturating_duration_since(oldest) < self.gap_timeout {
                break;
            }
            self.force_drain(&mut out);
        }
        out
    }

    /// When the next gap expires, if anything is buffered
    pub fn next_deadline(&self) -> Option<Instant> {
        self.oldest_arrival().map(|t| t + self.gap_timeout)
    }

    /// Discard everything buffered and expect `expected` next.
    /// Returns how many items were discarded.
    pub fn reset(&mut self, expected: u64) -> usize {
        let discarded = self.pending.len();
        self.pending.clear();
        self.expected = expected;
        discarded
    }

    /// Jump ahead so that `expected` is the next sequence.
    ///
    /// Buffered items before it are discarded and counted. Items at or after
    /// it stay buffered, and the contiguous run starting at `expected` is
    /// released. A target at or behind the current expectation is a no-op.
    pub fn advance_to(&mut self, expected: u64) -> (usize, Vec<T>) {
        if expected <= self.expected {
            return (0, Vec::new());
        }
        let kept = self.pending.split_off(&expected);
        let discarded = std::mem::replace(&mut self.pending, kept).len();
        self.expected = expected;

        let mut items = Vec::new();
        self.release_contiguous(&mut items);
        (discarded, items)
    }

    fn oldest_arrival(&self) -> Option<Instant> {
        self.pending.values().map(|(arrived, _)| *arrived).min()
    }

    fn force_drain(&mut self, out: &mut Released<T>) {
        let Some(&resumed_at) = self.pending.keys().next() else {
            return;
        };
        out.skipped.push(GapSkip {
            expected: self.expected,
            resumed_at,
        });
        self.expected = resumed_at;
        self.release_contiguous(&mut out.items);
    }

    fn release_contiguous(&mut self, items: &mut Vec<T>) {
        while let Some((_, item)) = self.pending.remove(&self.expected) {
            items.push(item);
            self.expected += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_order_passes_through() {
        let mut buf = ReorderBuffer::new(10, Duration::from_secs(5));
        let now = Instant::now();
        assert_eq!(buf.push(0, "a", now).items, vec!["a"]);
        assert_eq!(buf.push(1, "b", now).items, vec!["b"]);
        assert_eq!(buf.expected(), 2);
    }

    #[test]
    fn test_gap_is_held_then_released() {
        let mut buf = ReorderBuffer::new(10, Duration::from_secs(5));
        let now = Instant::now();
        buf.push(0, 0, now);
        buf.push(1, 1, now);
        assert!(buf.push(3, 3, now).items.is_empty());
        assert_eq!(buf.len(), 1);

        let out = buf.push(2, 2, now);
        assert_eq!(out.items, vec![2, 3]);
        assert!(out.skipped.is_empty());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_duplicates_flagged() {
        let mut buf = ReorderBuffer::new(10, Duration::from_secs(5));
        let now = Instant::now();
        buf.push(0, 0, now);
        assert!(buf.push(0, 0, now).duplicate);
        buf.push(5, 5, now);
        assert!(buf.push(5, 5, now).duplicate);
    }

    #[test]
    fn test_overflow_force_drains_oldest() {
        let mut buf = ReorderBuffer::new(2, Duration::from_secs(5));
        let now = Instant::now();
        buf.push(2, 2, now);
        buf.push(3, 3, now);
        let out = buf.push(5, 5, now);

        assert_eq!(
            out.skipped,
            vec![GapSkip {
                expected: 0,
                resumed_at: 2
            }]
        );
        assert_eq!(out.items, vec![2, 3]);
        assert_eq!(buf.expected(), 4);
        assert_eq!(buf.len(), 1);
    }

    #[test]
    fn test_expire_after_gap_timeout() {
        let mut buf = ReorderBuffer::new(10, Duration::from_millis(100));
        let start = Instant::now();
        buf.push(1, 1, start);
        buf.push(4, 4, start + Duration::from_millis(50));

        assert!(buf.expire(start + Duration::from_millis(99)).skipped.is_empty());
        assert_eq!(buf.next_deadline(), Some(start + Duration::from_millis(100)));

        let out = buf.expire(start + Duration::from_millis(100));
        assert_eq!(out.items, vec![1]);
        assert_eq!(out.skipped.len(), 1);
        assert_eq!(buf.expected(), 2);

        let out = buf.expire(start + Duration::from_millis(150));
        assert_eq!(out.items, vec![4]);
        assert_eq!(
            out.skipped,
            vec![GapSkip {
                expected: 2,
                resumed_at: 4
            }]
        );
    }

    #[test]
    fn test_reset_discards_pending() {
        let mut buf = ReorderBuffer::new(10, Duration::from_secs(5));
        let now = Instant::now();
        buf.push(3, 3, now);
        assert_eq!(buf.reset(10), 1);
        assert_eq!(buf.expected(), 10);
        assert!(buf.push(9, 9, now).duplicate);
    }

    #[test]
    fn test_advance_keeps_later_items() {
        let mut buf = ReorderBuffer::new(10, Duration::from_secs(5));
        let now = Instant::now();
        buf.push(1, 1, now);
        buf.push(2, 2, now);
        buf.push(3, 3, now);
        buf.push(6, 6, now);

        let (discarded, items) = buf.advance_to(2);
        assert_eq!(discarded, 1);
        assert_eq!(items, vec![2, 3]);
        assert_eq!(buf.expected(), 4);
        assert_eq!(buf.len(), 1);

        assert_eq!(buf.advance_to(1), (0, vec![]));
        assert_eq!(buf.expected(), 4);
    }
}
