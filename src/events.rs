//! Events delivered to the pipeline subscriber.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::streaming_recognizer::AsrResult;
use crate::translation_processor::TranslationResult;
use crate::translation_stats::HealthSnapshot;

/// Pipeline stage names, used for drop attribution and trace stamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Capture,
    Vad,
    Segmentation,
    Asr,
    Mt,
    Output,
}

/// Why a segment (or a segment's final) stopped making progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// A bounded queue hit its overflow policy.
    BackpressureDrop,
    /// A per-call timeout expired and the call was abandoned.
    Timeout,
    /// The post-processor rejected the transcript.
    Hallucination,
    /// The ASR port kept failing (circuit open or retries exhausted).
    AsrUnavailable,
    /// A correctness invariant broke; the segment is surfaced rather than lost.
    InvariantViolated,
}

/// Metadata of a segment, announced to the subscriber when the segment first
/// produces a user-visible result. Audio stays inside the engine.
#[derive(Debug, Clone)]
pub struct SegmentDescriptor {
    pub id: Uuid,
    pub seq: u64,
    pub start_sample: u64,
    pub pre_roll_ms: u64,
    pub is_partial: bool,
    pub creation_time: DateTime<Utc>,
}

/// The unit that reaches the subscriber callback.
///
/// Ordering guarantees: events are delivered in segment-sequence order, and
/// within one segment in `(draft_1, ..., draft_n, final)` order. `HealthTick`
/// and `SessionReset` are stream-level and carry no segment sequence of their
/// own; a reset is delivered only after every earlier segment has resolved.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    NewSegment(SegmentDescriptor),
    DraftAsr(AsrResult),
    FinalAsr(AsrResult),
    Translation(TranslationResult),
    Dropped {
        segment_id: Uuid,
        seq: u64,
        stage: Stage,
        reason: DropReason,
    },
    /// The capture stream had a sample gap; the previous run was flushed.
    SessionReset {
        expected_sample: u64,
        received_sample: u64,
    },
    HealthTick(HealthSnapshot),
}

impl PipelineEvent {
    /// Segment sequence this event belongs to, if any.
    pub fn seq(&self) -> Option<u64> {
        match self {
            PipelineEvent::NewSegment(d) => Some(d.seq),
            PipelineEvent::DraftAsr(r) | PipelineEvent::FinalAsr(r) => Some(r.seq),
            PipelineEvent::Translation(t) => Some(t.seq),
            PipelineEvent::Dropped { seq, .. } => Some(*seq),
            PipelineEvent::SessionReset { .. } | PipelineEvent::HealthTick(_) => None,
        }
    }
}
