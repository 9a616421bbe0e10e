//! Index bookkeeping for the rotating cache.
//!
//! A rotating buffer keeps `keep` sink slots at the front. Once the write
//! index reaches capacity it wraps back to `keep`, so after wrapping the
//! physical order is `[sink | newest .. idx | oldest idx ..]`.

use std::ops::Range;

/// Write index and token count of a rotating buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RingIndex {
    keep: usize,
    idx: usize,
    offset: usize,
}

impl RingIndex {
    pub fn new(keep: usize) -> Self {
        Self {
            keep,
            idx: 0,
            offset: 0,
        }
    }

    pub fn keep(&self) -> usize {
        self.keep
    }

    /// Next physical slot to write.
    pub fn idx(&self) -> usize {
        self.idx
    }

    /// Logical tokens written so far.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn is_wrapped(&self) -> bool {
        self.idx < self.offset
    }

    pub fn seek(&mut self, idx: usize) {
        self.idx = idx;
    }

    /// Moves the write index back to the first evictable slot at capacity.
    pub fn wrap(&mut self, capacity: usize) {
        if self.idx == capacity {
            self.idx = self.keep;
        }
    }

    /// Records `n` tokens written at the current index.
    pub fn advance(&mut self, n: usize) {
        self.idx += n;
        self.offset += n;
    }

    /// Records `n` tokens appended outside the ring (concatenation path).
    pub fn extend(&mut self, n: usize) {
        self.offset += n;
    }

    /// Forgets up to `n` recent tokens; returns how many were forgotten.
    pub fn rewind(&mut self, n: usize) -> usize {
        let n = n.min(self.offset);
        self.offset -= n;
        self.idx = self.idx.saturating_sub(n);
        n
    }

    /// Physical ranges of a `len`-slot buffer, listed in temporal order.
    pub fn linearize(&self, len: usize) -> Vec<Range<usize>> {
        if self.idx >= len {
            return vec![0..len];
        }
        if self.is_wrapped() {
            let keep = self.keep.min(self.idx);
            return [0..keep, self.idx..len, keep..self.idx]
                .into_iter()
                .filter(|r| !r.is_empty())
                .collect();
        }
        vec![0..self.idx]
    }

    /// Temporal rank of each physical slot of a `len`-slot buffer.
    ///
    /// Slots outside the linearized ranges keep rank 0.
    pub fn temporal_ranks(&self, len: usize) -> Vec<usize> {
        let mut ranks = vec![0; len];
        for (rank, slot) in self.linearize(len).into_iter().flatten().enumerate() {
            ranks[slot] = rank;
        }
        ranks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unwrapped_ring_is_a_prefix() {
        let mut ring = RingIndex::new(2);
        ring.advance(5);
        assert!(!ring.is_wrapped());
        assert_eq!(ring.linearize(8), vec![0..5]);
        assert_eq!(ring.linearize(5), vec![0..5]);
    }

    #[test]
    fn wrapped_ring_puts_sink_first_then_oldest() {
        let mut ring = RingIndex::new(2);
        ring.advance(8);
        ring.wrap(8);
        assert_eq!(ring.idx(), 2);
        ring.advance(2);
        assert_eq!(ring.offset(), 10);
        assert_eq!(ring.linearize(8), vec![0..2, 4..8, 2..4]);
        assert_eq!(ring.temporal_ranks(8), vec![0, 1, 6, 7, 2, 3, 4, 5]);
    }

    #[test]
    fn full_pass_restores_physical_order() {
        let mut ring = RingIndex::new(1);
        ring.advance(4);
        ring.wrap(4);
        ring.advance(3);
        assert_eq!(ring.idx(), 4);
        assert_eq!(ring.linearize(4), vec![0..4]);
    }

    #[test]
    fn rewind_saturates() {
        let mut ring = RingIndex::new(0);
        ring.advance(3);
        assert_eq!(ring.rewind(5), 3);
        assert_eq!((ring.idx(), ring.offset()), (0, 0));
    }
}
