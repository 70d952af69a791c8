//! Pipeline counters, latency metrics and health reporting.
//!
//! Counters are recorded by the stages as events happen; per-segment
//! latencies land in a rolling window of the last 100 segments from which the
//! snapshot derives means and p95s. `MetricsSnapshot` is the frozen read-only
//! surface handed to hosts; `HealthSnapshot` rides the 250 ms `HealthTick`.

use std::collections::VecDeque;

use serde::Serialize;

use crate::queue::QueueDepth;

/// Rolling window length, in segments.
const LATENCY_WINDOW: usize = 100;

/// End-to-end latencies of one segment, all in milliseconds.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SegmentLatency {
    /// First user-visible event minus segment creation.
    pub ttft_ms: u64,
    /// Final translation delivery minus last audio frame time.
    pub meaning_ms: u64,
    /// Final translation delivery minus segment close.
    pub ear_voice_ms: u64,
    pub asr_ms: u64,
    pub mt_ms: u64,
    pub overlap_savings_ms: u64,
}

/// Mean and p95 of one latency series.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct LatencySummary {
    pub mean_ms: f64,
    pub p95_ms: u64,
}

fn summarize(values: &[u64]) -> LatencySummary {
    if values.is_empty() {
        return LatencySummary::default();
    }
    let mean_ms = values.iter().sum::<u64>() as f64 / values.len() as f64;
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    let index = ((sorted.len() - 1) as f64 * 0.95).ceil() as usize;
    LatencySummary {
        mean_ms,
        p95_ms: sorted[index.min(sorted.len() - 1)],
    }
}

/// Occupancy of the five inter-stage queues.
#[derive(Debug, Clone, Serialize)]
pub struct QueueDepths {
    pub audio_to_vad: QueueDepth,
    pub vad_to_seg: QueueDepth,
    pub seg_to_asr: QueueDepth,
    pub asr_to_mt: QueueDepth,
    pub mt_to_out: QueueDepth,
}

impl QueueDepths {
    pub fn any_warning(&self) -> bool {
        [
            &self.audio_to_vad,
            &self.vad_to_seg,
            &self.seg_to_asr,
            &self.asr_to_mt,
            &self.mt_to_out,
        ]
        .iter()
        .any(|d| d.is_warning())
    }
}

/// Payload of the periodic `HealthTick` event.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub at_ms: u64,
    pub queues: QueueDepths,
    pub asr_in_flight: usize,
    pub segments_in_flight: u64,
}

/// Frozen read-only metrics view.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub segments_created: u64,
    pub segments_emitted: u64,
    pub segments_dropped: u64,
    pub frames_dropped: u64,
    pub drafts_emitted: u64,
    pub drafts_skipped: u64,
    pub hallucinations_filtered: u64,
    pub segments_too_short: u64,
    pub vad_frames_seen: u64,
    pub vad_frames_prefiltered: u64,
    /// Share of frames the energy pre-filter resolved without inference.
    pub vad_filter_efficiency: f64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub mt_failures: u64,
    pub session_resets: u64,
    pub ttft: LatencySummary,
    pub meaning_latency: LatencySummary,
    pub ear_voice_lag: LatencySummary,
    pub asr_time: LatencySummary,
    pub mt_time: LatencySummary,
    pub overlap_savings_ms_total: u64,
    pub queues: Option<QueueDepths>,
}

/// Mutable counter store, shared behind a mutex by all stages. Segment
/// terminal counts are owned by the segment tracker, not duplicated here.
pub struct TranslationStats {
    pub frames_dropped: u64,
    pub drafts_emitted: u64,
    pub drafts_skipped: u64,
    pub hallucinations_filtered: u64,
    pub segments_too_short: u64,
    pub vad_frames_seen: u64,
    pub vad_frames_prefiltered: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub mt_failures: u64,
    pub session_resets: u64,
    pub overlap_savings_ms_total: u64,
    window: VecDeque<SegmentLatency>,
}

impl TranslationStats {
    pub fn new() -> Self {
        Self {
            frames_dropped: 0,
            drafts_emitted: 0,
            drafts_skipped: 0,
            hallucinations_filtered: 0,
            segments_too_short: 0,
            vad_frames_seen: 0,
            vad_frames_prefiltered: 0,
            cache_hits: 0,
            cache_misses: 0,
            mt_failures: 0,
            session_resets: 0,
            overlap_savings_ms_total: 0,
            window: VecDeque::with_capacity(LATENCY_WINDOW),
        }
    }

    pub fn record_frame_drop(&mut self, count: u64) -> u64 {
        self.frames_dropped += count;
        self.frames_dropped
    }

    pub fn record_segment_latency(&mut self, latency: SegmentLatency) {
        if self.window.len() == LATENCY_WINDOW {
            self.window.pop_front();
        }
        self.overlap_savings_ms_total += latency.overlap_savings_ms;
        self.window.push_back(latency);
    }

    /// Sync the VAD stage's absolute frame counters.
    pub fn set_vad_frames(&mut self, seen: u64, prefiltered: u64) {
        self.vad_frames_seen = seen;
        self.vad_frames_prefiltered = prefiltered;
    }

    pub fn snapshot(&self, queues: Option<QueueDepths>) -> MetricsSnapshot {
        let series = |f: fn(&SegmentLatency) -> u64| -> Vec<u64> {
            self.window.iter().map(f).collect()
        };
        let efficiency = if self.vad_frames_seen == 0 {
            0.0
        } else {
            self.vad_frames_prefiltered as f64 / self.vad_frames_seen as f64
        };
        MetricsSnapshot {
            // Filled in from the segment tracker by the pipeline.
            segments_created: 0,
            segments_emitted: 0,
            segments_dropped: 0,
            frames_dropped: self.frames_dropped,
            drafts_emitted: self.drafts_emitted,
            drafts_skipped: self.drafts_skipped,
            hallucinations_filtered: self.hallucinations_filtered,
            segments_too_short: self.segments_too_short,
            vad_frames_seen: self.vad_frames_seen,
            vad_frames_prefiltered: self.vad_frames_prefiltered,
            vad_filter_efficiency: efficiency,
            cache_hits: self.cache_hits,
            cache_misses: self.cache_misses,
            mt_failures: self.mt_failures,
            session_resets: self.session_resets,
            ttft: summarize(&series(|l| l.ttft_ms)),
            meaning_latency: summarize(&series(|l| l.meaning_ms)),
            ear_voice_lag: summarize(&series(|l| l.ear_voice_ms)),
            asr_time: summarize(&series(|l| l.asr_ms)),
            mt_time: summarize(&series(|l| l.mt_ms)),
            overlap_savings_ms_total: self.overlap_savings_ms_total,
            queues,
        }
    }
}

impl Default for TranslationStats {
    fn default() -> Self {
        Self::new()
    }
}
