//! In-order release of per-segment result streams.
//!
//! The ASR pool completes jobs out of order across segments; the subscriber
//! contract requires delivery in segment-sequence order. The single MT worker
//! funnels every result through this buffer: items for the head sequence flow
//! straight through, items for later sequences are held until the head
//! resolves (final translated, or the segment dropped).

use std::collections::{BTreeMap, VecDeque};

use tracing::debug;

pub struct ReorderBuffer<T> {
    next_seq: u64,
    ready: VecDeque<T>,
    held: BTreeMap<u64, Vec<T>>,
    /// Held-segment budget, `asr_workers + 1` by construction.
    capacity_segments: usize,
    rejected_disposable: u64,
}

impl<T> ReorderBuffer<T> {
    pub fn new(capacity_segments: usize) -> Self {
        Self {
            next_seq: 0,
            ready: VecDeque::new(),
            held: BTreeMap::new(),
            capacity_segments: capacity_segments.max(1),
            rejected_disposable: 0,
        }
    }

    /// Offer an item belonging to segment `seq`. `disposable` items (drafts)
    /// may be rejected when the buffer is over budget or the segment already
    /// resolved; non-disposable items are always accepted.
    pub fn push(&mut self, seq: u64, item: T, disposable: bool) {
        if seq < self.next_seq {
            // The segment already resolved; only disposable stragglers can
            // legally arrive here.
            self.rejected_disposable += 1;
            debug!(seq, next = self.next_seq, "stale reorder item discarded");
            return;
        }
        if seq == self.next_seq {
            self.ready.push_back(item);
            return;
        }
        let over_budget = self.held.len() >= self.capacity_segments
            && !self.held.contains_key(&seq);
        if over_budget && disposable {
            self.rejected_disposable += 1;
            debug!(seq, "reorder buffer over budget, draft rejected");
            return;
        }
        self.held.entry(seq).or_default().push(item);
    }

    /// Next item of the head segment, if any.
    pub fn next_ready(&mut self) -> Option<T> {
        self.ready.pop_front()
    }

    /// The head segment resolved; release the following segment's items.
    pub fn advance(&mut self) {
        self.next_seq += 1;
        if let Some(items) = self.held.remove(&self.next_seq) {
            self.ready.extend(items);
        }
    }

    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    pub fn held_segments(&self) -> usize {
        self.held.len()
    }

    pub fn rejected_disposable(&self) -> u64 {
        self.rejected_disposable
    }

    /// Remaining items, in order, for the shutdown drain.
    pub fn drain(&mut self) -> Vec<T> {
        let mut items: Vec<T> = self.ready.drain(..).collect();
        let held = std::mem::take(&mut self.held);
        for (_, bucket) in held {
            items.extend(bucket);
        }
        items
    }
}
