//! Per-segment lifecycle registry.
//!
//! Every segment that enters the pipeline is registered here and must leave
//! in a terminal state: emitted or dropped, never silently lost. Stages stamp
//! the trace as the segment passes through; the shutdown audit reports any
//! trace still in flight after the drain grace period as an invariant
//! violation and force-terminates it so the accounting stays closed.
//!
//! Reads (snapshots) take a shard read lock only; stage stamps touch a single
//! shard write lock, so snapshotting never stalls the hot path for long.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tracing::warn;
use uuid::Uuid;

use crate::events::DropReason;

const SHARD_COUNT: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalState {
    InFlight,
    Emitted,
    Dropped,
}

/// Stage timestamps for one segment, all on the injected monotonic clock.
#[derive(Debug, Clone)]
pub struct SegmentTrace {
    pub id: Uuid,
    pub seq: u64,
    pub created_ms: u64,
    pub vad_closed_ms: Option<u64>,
    /// Capture time of the segment's last audio frame.
    pub last_audio_ms: Option<u64>,
    /// Delivery time of the first user-visible event (drives TTFT).
    pub first_output_ms: Option<u64>,
    pub asr_draft_ms: Vec<u64>,
    pub asr_final_ms: Option<u64>,
    pub mt_draft_ms: Vec<u64>,
    pub mt_final_ms: Option<u64>,
    pub emitted_ms: Option<u64>,
    pub dropped_ms: Option<u64>,
    pub terminal: TerminalState,
    pub drop_reason: Option<DropReason>,
}

impl SegmentTrace {
    fn new(id: Uuid, seq: u64, created_ms: u64) -> Self {
        Self {
            id,
            seq,
            created_ms,
            vad_closed_ms: None,
            last_audio_ms: None,
            first_output_ms: None,
            asr_draft_ms: Vec::new(),
            asr_final_ms: None,
            mt_draft_ms: Vec::new(),
            mt_final_ms: None,
            emitted_ms: None,
            dropped_ms: None,
            terminal: TerminalState::InFlight,
            drop_reason: None,
        }
    }
}

pub struct SegmentTracker {
    shards: Vec<RwLock<HashMap<Uuid, SegmentTrace>>>,
    created: AtomicU64,
    emitted: AtomicU64,
    dropped: AtomicU64,
}

impl SegmentTracker {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT)
                .map(|_| RwLock::new(HashMap::new()))
                .collect(),
            created: AtomicU64::new(0),
            emitted: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    fn shard(&self, id: Uuid) -> &RwLock<HashMap<Uuid, SegmentTrace>> {
        &self.shards[id.as_bytes()[0] as usize % SHARD_COUNT]
    }

    fn with_trace(&self, id: Uuid, update: impl FnOnce(&mut SegmentTrace)) {
        if let Some(trace) = self.shard(id).write().get_mut(&id) {
            update(trace);
        }
    }

    pub fn register(&self, id: Uuid, seq: u64, now_ms: u64) {
        self.shard(id)
            .write()
            .insert(id, SegmentTrace::new(id, seq, now_ms));
        self.created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_vad_closed(&self, id: Uuid, now_ms: u64, last_audio_ms: u64) {
        self.with_trace(id, |t| {
            t.vad_closed_ms = Some(now_ms);
            t.last_audio_ms = Some(last_audio_ms);
        });
    }

    pub fn record_asr_draft(&self, id: Uuid, now_ms: u64) {
        self.with_trace(id, |t| t.asr_draft_ms.push(now_ms));
    }

    pub fn record_asr_final(&self, id: Uuid, now_ms: u64) {
        self.with_trace(id, |t| t.asr_final_ms = Some(now_ms));
    }

    pub fn record_mt_draft(&self, id: Uuid, now_ms: u64) {
        self.with_trace(id, |t| t.mt_draft_ms.push(now_ms));
    }

    pub fn record_mt_final(&self, id: Uuid, now_ms: u64) {
        self.with_trace(id, |t| t.mt_final_ms = Some(now_ms));
    }

    /// First user-visible event for this segment; only the first call sticks.
    pub fn record_first_output(&self, id: Uuid, now_ms: u64) {
        self.with_trace(id, |t| {
            if t.first_output_ms.is_none() {
                t.first_output_ms = Some(now_ms);
            }
        });
    }

    pub fn mark_emitted(&self, id: Uuid, now_ms: u64) {
        let mut transitioned = false;
        self.with_trace(id, |t| {
            if t.terminal == TerminalState::InFlight {
                t.terminal = TerminalState::Emitted;
                t.emitted_ms = Some(now_ms);
                transitioned = true;
            }
        });
        if transitioned {
            self.emitted.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn mark_dropped(&self, id: Uuid, reason: DropReason, now_ms: u64) {
        let mut transitioned = false;
        self.with_trace(id, |t| {
            if t.terminal == TerminalState::InFlight {
                t.terminal = TerminalState::Dropped;
                t.dropped_ms = Some(now_ms);
                t.drop_reason = Some(reason);
                transitioned = true;
            }
        });
        if transitioned {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn trace(&self, id: Uuid) -> Option<SegmentTrace> {
        self.shard(id).read().get(&id).cloned()
    }

    pub fn created_count(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }

    pub fn emitted_count(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn in_flight_count(&self) -> u64 {
        self.created_count() - self.emitted_count() - self.dropped_count()
    }

    /// Shutdown audit: any trace still in flight is a bug, not expected
    /// runtime behavior. Each one is logged with its stage timestamps and
    /// force-terminated as `Dropped(InvariantViolated)` so that
    /// `created == emitted + dropped` holds when this returns.
    pub fn audit_at_stop(&self, now_ms: u64) -> Vec<SegmentTrace> {
        let mut violations = Vec::new();
        for shard in &self.shards {
            for trace in shard.read().values() {
                if trace.terminal == TerminalState::InFlight {
                    violations.push(trace.clone());
                }
            }
        }
        violations.sort_by_key(|t| t.seq);
        for trace in &violations {
            warn!(
                id = %trace.id,
                seq = trace.seq,
                created_ms = trace.created_ms,
                vad_closed_ms = ?trace.vad_closed_ms,
                asr_final_ms = ?trace.asr_final_ms,
                mt_final_ms = ?trace.mt_final_ms,
                "segment still in flight after shutdown grace period"
            );
            self.mark_dropped(trace.id, DropReason::InvariantViolated, now_ms);
        }
        violations
    }
}

impl Default for SegmentTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_accounting_balances() {
        let tracker = SegmentTracker::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        tracker.register(a, 0, 100);
        tracker.register(b, 1, 200);

        tracker.mark_emitted(a, 900);
        tracker.mark_dropped(b, DropReason::Timeout, 950);

        assert_eq!(tracker.created_count(), 2);
        assert_eq!(tracker.emitted_count(), 1);
        assert_eq!(tracker.dropped_count(), 1);
        assert_eq!(tracker.in_flight_count(), 0);
        assert!(tracker.audit_at_stop(1000).is_empty());
    }

    #[test]
    fn terminal_state_is_sticky() {
        let tracker = SegmentTracker::new();
        let id = Uuid::new_v4();
        tracker.register(id, 0, 0);
        tracker.mark_emitted(id, 10);
        tracker.mark_dropped(id, DropReason::Timeout, 20);

        let trace = tracker.trace(id).unwrap();
        assert_eq!(trace.terminal, TerminalState::Emitted);
        assert_eq!(tracker.dropped_count(), 0);
    }

    #[test]
    fn audit_terminates_stragglers() {
        let tracker = SegmentTracker::new();
        let id = Uuid::new_v4();
        tracker.register(id, 0, 0);
        tracker.record_asr_draft(id, 50);

        let violations = tracker.audit_at_stop(5000);
        assert_eq!(violations.len(), 1);
        let trace = tracker.trace(id).unwrap();
        assert_eq!(trace.terminal, TerminalState::Dropped);
        assert_eq!(trace.drop_reason, Some(DropReason::InvariantViolated));
        assert_eq!(tracker.in_flight_count(), 0);
    }

    #[test]
    fn first_output_only_records_once() {
        let tracker = SegmentTracker::new();
        let id = Uuid::new_v4();
        tracker.register(id, 0, 0);
        tracker.record_first_output(id, 100);
        tracker.record_first_output(id, 200);
        assert_eq!(tracker.trace(id).unwrap().first_output_ms, Some(100));
    }
}
