//! Segmentation: turns per-frame VAD decisions into bounded speech segments.
//!
//! A state machine over `Idle -> PreRoll -> Speaking -> Hanging`. Audio from
//! before the VAD trigger is pulled out of a lookback buffer so sentence
//! onsets are not clipped; short pauses are absorbed by the hanging state;
//! over-long utterances are force-split at the quietest stretch of recent
//! audio with an overlap carried into the next part.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::audio_ring::AudioFrame;
use crate::config::SegmenterConfig;
use crate::events::SegmentDescriptor;
use crate::ports::Clock;
use crate::vad_processor::{VadEvent, VadFrame};

/// Minimum quiet-run length the forced split will target, in ms.
const PAUSE_RUN_MS: u64 = 50;
/// A run counts as a pause when its mean level is below this share of the
/// scan window's mean level.
const PAUSE_LEVEL_RATIO: f32 = 0.3;

/// One contiguous utterance candidate, closed and ready for the final decode.
#[derive(Debug, Clone)]
pub struct SpeechSegment {
    pub id: Uuid,
    /// Strictly increasing, gap-free within a pipeline instance.
    pub seq: u64,
    pub start_sample: u64,
    pub end_sample: u64,
    pub duration_ms: u64,
    /// Set when a forced split produced this segment.
    pub is_partial: bool,
    pub pre_roll_ms: u64,
    pub creation_time: DateTime<Utc>,
    /// Monotonic clock stamp of segment creation.
    pub created_ms: u64,
    /// Monotonic clock stamp of the last appended frame.
    pub last_audio_ms: u64,
    pub samples: Vec<f32>,
}

impl SpeechSegment {
    pub fn descriptor(&self) -> SegmentDescriptor {
        SegmentDescriptor {
            id: self.id,
            seq: self.seq,
            start_sample: self.start_sample,
            pre_roll_ms: self.pre_roll_ms,
            is_partial: self.is_partial,
            creation_time: self.creation_time,
        }
    }
}

/// The open segment, shared with the draft timer through `ActiveSegmentSlot`.
/// Frames are pinned here by cloning their `Arc` storage; the ring is free to
/// recycle its own slots.
#[derive(Debug)]
pub struct ActiveSegment {
    pub id: Uuid,
    pub seq: u64,
    pub start_sample: u64,
    pub pre_roll_ms: u64,
    pub is_partial: bool,
    pub creation_time: DateTime<Utc>,
    pub created_ms: u64,
    pub last_audio_ms: u64,
    pub frames: Vec<AudioFrame>,
    /// Speech observed after the pre-roll, in ms.
    pub speech_ms: u64,
    pub trailing_silence_ms: u64,
    /// Cumulative audio length covered by the most recent dispatched draft.
    pub last_draft_audio_ms: u64,
    sample_rate: u32,
}

impl ActiveSegment {
    pub fn audio_ms(&self) -> u64 {
        self.frames
            .iter()
            .map(|f| f.duration_ms(self.sample_rate))
            .sum()
    }

    pub fn flatten(&self) -> Vec<f32> {
        let total: usize = self.frames.iter().map(|f| f.len()).sum();
        let mut samples = Vec::with_capacity(total);
        for frame in &self.frames {
            samples.extend_from_slice(&frame.samples);
        }
        samples
    }

    fn into_segment(self, is_partial: bool) -> SpeechSegment {
        let duration_ms = self.audio_ms();
        let end_sample = self
            .frames
            .last()
            .map(|f| f.first_sample + f.len() as u64)
            .unwrap_or(self.start_sample);
        let samples = self.flatten();
        SpeechSegment {
            id: self.id,
            seq: self.seq,
            start_sample: self.start_sample,
            end_sample,
            duration_ms,
            is_partial: is_partial || self.is_partial,
            pre_roll_ms: self.pre_roll_ms,
            creation_time: self.creation_time,
            created_ms: self.created_ms,
            last_audio_ms: self.last_audio_ms,
            samples,
        }
    }
}

pub type ActiveSegmentSlot = Arc<Mutex<Option<ActiveSegment>>>;

/// What one input frame produced.
#[derive(Debug)]
pub enum SegmenterOutput {
    /// A segment crossed the minimum-speech bar and entered the pipeline.
    Opened(SegmentDescriptor),
    /// A segment closed; hand it to the final decode.
    Closed(SpeechSegment),
    /// A sub-minimum utterance was discarded. Counter only, no event.
    DiscardedTooShort,
}

enum State {
    Idle,
    /// Builder exists but has not yet crossed `min_speech_duration_ms`.
    PreRoll,
    Speaking,
    Hanging,
}

/// Uncommitted builder used while in `PreRoll`.
struct PendingSegment {
    frames: Vec<AudioFrame>,
    pre_roll_ms: u64,
    start_sample: u64,
    speech_ms: u64,
    silence_ms: u64,
    is_partial: bool,
}

pub struct Segmenter {
    config: SegmenterConfig,
    frame_ms: u64,
    sample_rate: u32,
    clock: Arc<dyn Clock>,
    state: State,
    lookback: VecDeque<AudioFrame>,
    pending: Option<PendingSegment>,
    active: ActiveSegmentSlot,
    next_seq: u64,
}

impl Segmenter {
    pub fn new(
        config: SegmenterConfig,
        frame_ms: u64,
        sample_rate: u32,
        clock: Arc<dyn Clock>,
        active: ActiveSegmentSlot,
    ) -> Self {
        Self {
            config,
            frame_ms: frame_ms.max(1),
            sample_rate,
            clock,
            state: State::Idle,
            lookback: VecDeque::new(),
            pending: None,
            active,
            next_seq: 0,
        }
    }

    fn lookback_capacity(&self) -> usize {
        (self.config.pre_roll_ms / self.frame_ms).max(1) as usize
    }

    fn push_lookback(&mut self, frame: AudioFrame) {
        let capacity = self.lookback_capacity();
        if self.lookback.len() == capacity {
            self.lookback.pop_front();
        }
        self.lookback.push_back(frame);
    }

    /// Advance the state machine by one VAD-annotated frame.
    pub fn process(&mut self, vad_frame: VadFrame) -> Vec<SegmenterOutput> {
        let mut outputs = Vec::new();
        let frame = vad_frame.frame.clone();
        let event = vad_frame.event;
        let frame_duration = frame.duration_ms(self.sample_rate);

        match self.state {
            State::Idle => {
                if event == VadEvent::Speech {
                    self.begin_pending(frame.clone());
                } else {
                    self.push_lookback(frame.clone());
                    return outputs;
                }
            }
            State::PreRoll => {
                let commit = {
                    let pending = self.pending.as_mut().expect("pending in PreRoll");
                    pending.frames.push(frame.clone());
                    match event {
                        VadEvent::Speech | VadEvent::SpeechContinuing => {
                            pending.speech_ms += frame_duration;
                            pending.silence_ms = 0;
                        }
                        VadEvent::Silence => {
                            pending.silence_ms += frame_duration;
                        }
                    }
                    if pending.silence_ms >= self.config.min_silence_duration_ms {
                        // Never reached the minimum speech bar.
                        self.pending = None;
                        self.state = State::Idle;
                        outputs.push(SegmenterOutput::DiscardedTooShort);
                        false
                    } else {
                        pending.speech_ms >= self.config.min_speech_duration_ms
                    }
                };
                if commit {
                    outputs.push(self.commit_pending());
                    self.state = State::Speaking;
                }
            }
            State::Speaking | State::Hanging => {
                enum Action {
                    Keep,
                    Close,
                    Split,
                }
                let action = {
                    let mut slot = self.active.lock();
                    let segment = slot.as_mut().expect("active segment while speaking");
                    segment.frames.push(frame.clone());
                    segment.last_audio_ms = self.clock.now_ms();
                    match event {
                        VadEvent::Speech | VadEvent::SpeechContinuing => {
                            segment.speech_ms += frame_duration;
                            segment.trailing_silence_ms = 0;
                            self.state = State::Speaking;
                        }
                        VadEvent::Silence => {
                            segment.trailing_silence_ms += frame_duration;
                            self.state = State::Hanging;
                        }
                    }
                    if segment.trailing_silence_ms >= self.config.min_silence_duration_ms {
                        Action::Close
                    } else if segment.audio_ms() >= self.config.max_segment_duration_ms {
                        Action::Split
                    } else {
                        Action::Keep
                    }
                };
                match action {
                    Action::Close => {
                        let closed = self.take_active().into_segment(false);
                        debug!(
                            seq = closed.seq,
                            duration_ms = closed.duration_ms,
                            "segment closed on silence"
                        );
                        outputs.push(SegmenterOutput::Closed(closed));
                        self.state = State::Idle;
                    }
                    Action::Split => outputs.extend(self.forced_split()),
                    Action::Keep => {}
                }
            }
        }

        self.push_lookback(frame);
        outputs
    }

    /// Flush the open segment (shutdown or capture gap). A committed segment
    /// closes normally; an uncommitted one is a too-short discard.
    pub fn flush(&mut self) -> Vec<SegmenterOutput> {
        let mut outputs = Vec::new();
        if self.active.lock().is_some() {
            let closed = self.take_active().into_segment(false);
            debug!(seq = closed.seq, "segment flushed");
            outputs.push(SegmenterOutput::Closed(closed));
        }
        if self.pending.take().is_some() {
            outputs.push(SegmenterOutput::DiscardedTooShort);
        }
        self.state = State::Idle;
        self.lookback.clear();
        outputs
    }

    fn begin_pending(&mut self, trigger_frame: AudioFrame) {
        let mut frames: Vec<AudioFrame> = self.lookback.iter().cloned().collect();
        let pre_roll_ms: u64 = frames
            .iter()
            .map(|f| f.duration_ms(self.sample_rate))
            .sum();
        let start_sample = frames
            .first()
            .map(|f| f.first_sample)
            .unwrap_or(trigger_frame.first_sample);
        let frame_duration = trigger_frame.duration_ms(self.sample_rate);
        frames.push(trigger_frame);
        self.pending = Some(PendingSegment {
            frames,
            pre_roll_ms,
            start_sample,
            speech_ms: frame_duration,
            silence_ms: 0,
            is_partial: false,
        });
        self.state = State::PreRoll;
    }

    fn commit_pending(&mut self) -> SegmenterOutput {
        let pending = self.pending.take().expect("pending to commit");
        let seq = self.next_seq;
        self.next_seq += 1;
        let now_ms = self.clock.now_ms();
        let segment = ActiveSegment {
            id: Uuid::new_v4(),
            seq,
            start_sample: pending.start_sample,
            pre_roll_ms: pending.pre_roll_ms,
            is_partial: pending.is_partial,
            creation_time: Utc::now(),
            created_ms: now_ms,
            last_audio_ms: now_ms,
            frames: pending.frames,
            speech_ms: pending.speech_ms,
            trailing_silence_ms: 0,
            last_draft_audio_ms: 0,
            sample_rate: self.sample_rate,
        };
        let descriptor = SegmentDescriptor {
            id: segment.id,
            seq: segment.seq,
            start_sample: segment.start_sample,
            pre_roll_ms: segment.pre_roll_ms,
            is_partial: segment.is_partial,
            creation_time: segment.creation_time,
        };
        *self.active.lock() = Some(segment);
        SegmenterOutput::Opened(descriptor)
    }

    fn take_active(&mut self) -> ActiveSegment {
        self.active.lock().take().expect("active segment")
    }

    /// Sequence number the next committed segment will receive.
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Split the over-long active segment at the quietest recent stretch, or
    /// hard-split at the end. The tail is carried into the next part as its
    /// pre-roll and both parts are marked partial.
    fn forced_split(&mut self) -> Vec<SegmenterOutput> {
        let segment = self.take_active();
        let frames = segment.frames;
        let frame_count = frames.len();

        let run_frames = (PAUSE_RUN_MS.div_ceil(self.frame_ms)).max(1) as usize;
        let window_frames = ((self.config.pause_threshold_ms / self.frame_ms).max(1) as usize)
            .min(frame_count);
        let window_start = frame_count - window_frames;

        let split_at = find_pause(&frames[window_start..], run_frames)
            .map(|offset| window_start + offset)
            .unwrap_or(frame_count);

        let overlap_frames = ((self.config.split_overlap_ms / self.frame_ms).max(1) as usize)
            .min(split_at);
        let head: Vec<AudioFrame> = frames[..split_at].to_vec();
        let tail: Vec<AudioFrame> = frames[split_at - overlap_frames..].to_vec();

        let head_segment = ActiveSegment {
            id: segment.id,
            seq: segment.seq,
            start_sample: segment.start_sample,
            pre_roll_ms: segment.pre_roll_ms,
            is_partial: true,
            creation_time: segment.creation_time,
            created_ms: segment.created_ms,
            last_audio_ms: segment.last_audio_ms,
            frames: head,
            speech_ms: segment.speech_ms,
            trailing_silence_ms: 0,
            last_draft_audio_ms: 0,
            sample_rate: self.sample_rate,
        }
        .into_segment(true);

        let seq = self.next_seq;
        self.next_seq += 1;
        let now_ms = self.clock.now_ms();
        let overlap_ms: u64 = tail
            .iter()
            .take(overlap_frames)
            .map(|f| f.duration_ms(self.sample_rate))
            .sum();
        let tail_speech_ms: u64 = tail
            .iter()
            .skip(overlap_frames)
            .map(|f| f.duration_ms(self.sample_rate))
            .sum();
        let successor = ActiveSegment {
            id: Uuid::new_v4(),
            seq,
            start_sample: tail.first().map(|f| f.first_sample).unwrap_or(0),
            pre_roll_ms: overlap_ms,
            is_partial: true,
            creation_time: Utc::now(),
            created_ms: now_ms,
            last_audio_ms: now_ms,
            frames: tail,
            // The carried overlap alone clears the minimum-speech bar;
            // config validation enforces split_overlap_ms >= min_speech.
            speech_ms: tail_speech_ms.max(self.config.min_speech_duration_ms),
            trailing_silence_ms: 0,
            last_draft_audio_ms: 0,
            sample_rate: self.sample_rate,
        };
        let descriptor = SegmentDescriptor {
            id: successor.id,
            seq: successor.seq,
            start_sample: successor.start_sample,
            pre_roll_ms: successor.pre_roll_ms,
            is_partial: true,
            creation_time: successor.creation_time,
        };
        debug!(
            head_seq = head_segment.seq,
            head_ms = head_segment.duration_ms,
            overlap_ms,
            "forced split"
        );
        *self.active.lock() = Some(successor);
        self.state = State::Speaking;

        vec![
            SegmenterOutput::Closed(head_segment),
            SegmenterOutput::Opened(descriptor),
        ]
    }
}

/// Offset of the quietest `run_frames`-long stretch inside `window`, if its
/// level is low enough relative to the window to count as a pause.
fn find_pause(window: &[AudioFrame], run_frames: usize) -> Option<usize> {
    if window.len() < run_frames * 2 {
        return None;
    }
    let window_mean: f32 =
        window.iter().map(|f| f.rms).sum::<f32>() / window.len() as f32;
    let mut best: Option<(usize, f32)> = None;
    for start in 0..=window.len() - run_frames {
        let run_mean: f32 = window[start..start + run_frames]
            .iter()
            .map(|f| f.rms)
            .sum::<f32>()
            / run_frames as f32;
        if best.map_or(true, |(_, level)| run_mean < level) {
            best = Some((start, run_mean));
        }
    }
    best.and_then(|(start, level)| {
        if level < PAUSE_LEVEL_RATIO * window_mean {
            Some(start)
        } else {
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::SystemClock;

    const FRAME_MS: u64 = 30;
    const RATE: u32 = 16_000;

    struct Harness {
        segmenter: Segmenter,
        slot: ActiveSegmentSlot,
        next_sample: u64,
    }

    impl Harness {
        fn new(config: SegmenterConfig) -> Self {
            let slot: ActiveSegmentSlot = Arc::new(Mutex::new(None));
            let segmenter = Segmenter::new(
                config,
                FRAME_MS,
                RATE,
                Arc::new(SystemClock::new()),
                slot.clone(),
            );
            Self {
                segmenter,
                slot,
                next_sample: 0,
            }
        }

        fn feed(&mut self, event: VadEvent, rms: f32) -> Vec<SegmenterOutput> {
            let samples = vec![rms; (RATE as u64 * FRAME_MS / 1000) as usize];
            let frame = AudioFrame::new(samples, self.next_sample, Utc::now());
            self.next_sample += frame.len() as u64;
            self.segmenter.process(VadFrame {
                frame,
                event,
                probability: match event {
                    VadEvent::Silence => 0.0,
                    _ => 0.9,
                },
            })
        }

        fn feed_speech_ms(&mut self, ms: u64, rms: f32) -> Vec<SegmenterOutput> {
            let mut outputs = self.feed(VadEvent::Speech, rms);
            for _ in 1..(ms / FRAME_MS) {
                outputs.extend(self.feed(VadEvent::SpeechContinuing, rms));
            }
            outputs
        }

        fn feed_silence_ms(&mut self, ms: u64) -> Vec<SegmenterOutput> {
            let mut outputs = Vec::new();
            for _ in 0..(ms / FRAME_MS) {
                outputs.extend(self.feed(VadEvent::Silence, 0.0005));
            }
            outputs
        }
    }

    fn closed(outputs: &[SegmenterOutput]) -> Vec<&SpeechSegment> {
        outputs
            .iter()
            .filter_map(|o| match o {
                SegmenterOutput::Closed(s) => Some(s),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn opens_after_min_speech_and_closes_on_silence() {
        let mut h = Harness::new(SegmenterConfig::default());
        // Lookback to fill the pre-roll.
        h.feed_silence_ms(600);

        let outputs = h.feed_speech_ms(900, 0.2);
        assert!(outputs
            .iter()
            .any(|o| matches!(o, SegmenterOutput::Opened(_))));
        assert!(h.slot.lock().is_some());

        let outputs = h.feed_silence_ms(450);
        let segments = closed(&outputs);
        assert_eq!(segments.len(), 1);
        let segment = segments[0];
        assert_eq!(segment.seq, 0);
        assert!(!segment.is_partial);
        // 500 ms pre-roll + 900 ms speech + absorbed silence.
        assert!(segment.duration_ms >= 900 + segment.pre_roll_ms);
        assert!(segment.pre_roll_ms >= 450);
        assert!(h.slot.lock().is_none());
    }

    #[test]
    fn sub_minimum_speech_is_discarded() {
        let mut h = Harness::new(SegmenterConfig::default());
        h.feed_silence_ms(600);

        // 120 ms of speech, below the 250 ms bar.
        let mut outputs = h.feed(VadEvent::Speech, 0.2);
        for _ in 0..3 {
            outputs.extend(h.feed(VadEvent::SpeechContinuing, 0.2));
        }
        outputs.extend(h.feed_silence_ms(450));
        assert!(outputs
            .iter()
            .any(|o| matches!(o, SegmenterOutput::DiscardedTooShort)));
        assert!(!outputs
            .iter()
            .any(|o| matches!(o, SegmenterOutput::Closed(_) | SegmenterOutput::Opened(_))));
    }

    #[test]
    fn short_pause_does_not_split_the_segment() {
        let mut h = Harness::new(SegmenterConfig::default());
        h.feed_silence_ms(600);
        h.feed_speech_ms(600, 0.2);
        // 300 ms pause, under the 400 ms close budget.
        let outputs = h.feed_silence_ms(300);
        assert!(closed(&outputs).is_empty());
        let outputs = h.feed_speech_ms(600, 0.2);
        assert!(closed(&outputs).is_empty());
        let outputs = h.feed_silence_ms(450);
        assert_eq!(closed(&outputs).len(), 1);
    }

    #[test]
    fn continuous_speech_is_force_split_with_overlap() {
        let mut h = Harness::new(SegmenterConfig::default());
        h.feed_silence_ms(600);

        let mut outputs = Vec::new();
        // 14 s of uniform speech with no pauses.
        outputs.extend(h.feed_speech_ms(14_000, 0.2));
        outputs.extend(h.feed_silence_ms(450));

        let segments = closed(&outputs);
        assert_eq!(segments.len(), 2);
        assert!(segments[0].is_partial);
        assert!(segments[1].is_partial);
        assert_eq!(segments[0].seq, 0);
        assert_eq!(segments[1].seq, 1);
        // First part lands near the maximum; overlap shows up as the second
        // part's pre-roll.
        assert!(
            (7700..=8300).contains(&segments[0].duration_ms),
            "head duration {}",
            segments[0].duration_ms
        );
        assert!(segments[1].pre_roll_ms >= 280);
        // The overlap means the tail re-covers the head's last samples.
        assert!(segments[1].start_sample < segments[0].end_sample);
    }

    #[test]
    fn forced_split_tail_meets_minimum_duration() {
        let mut h = Harness::new(SegmenterConfig::default());
        h.feed_silence_ms(600);
        // Trip the maximum, then fall silent immediately: the successor is
        // closed with little more than the carried overlap.
        let mut outputs = h.feed_speech_ms(7600, 0.2);
        outputs.extend(h.feed_silence_ms(450));

        let segments = closed(&outputs);
        assert_eq!(segments.len(), 2);
        assert!(
            segments[1].duration_ms >= SegmenterConfig::default().min_speech_duration_ms,
            "tail duration {}",
            segments[1].duration_ms
        );
    }

    #[test]
    fn forced_split_prefers_a_natural_pause() {
        let mut h = Harness::new(SegmenterConfig::default());
        h.feed_silence_ms(600);
        // Speech up to just short of the maximum, then a quiet dip the VAD
        // still calls speech, then more speech to push past the limit.
        h.feed_speech_ms(7200, 0.2);
        for _ in 0..4 {
            h.feed(VadEvent::SpeechContinuing, 0.001);
        }
        let mut outputs = Vec::new();
        outputs.extend(h.feed_speech_ms(600, 0.2));
        outputs.extend(h.feed_silence_ms(450));

        let segments = closed(&outputs);
        assert_eq!(segments.len(), 2);
        // The split happened at the dip, not at the hard maximum.
        assert!(
            segments[0].duration_ms < 8000,
            "head duration {}",
            segments[0].duration_ms
        );
    }

    #[test]
    fn flush_closes_open_segment() {
        let mut h = Harness::new(SegmenterConfig::default());
        h.feed_silence_ms(600);
        h.feed_speech_ms(900, 0.2);
        let outputs = h.segmenter.flush();
        let segments = closed(&outputs);
        assert_eq!(segments.len(), 1);
        assert!(h.slot.lock().is_none());
    }

    #[test]
    fn sequence_numbers_are_gap_free() {
        let mut h = Harness::new(SegmenterConfig::default());
        let mut seqs = Vec::new();
        for _ in 0..3 {
            h.feed_silence_ms(600);
            let mut outputs = h.feed_speech_ms(600, 0.2);
            outputs.extend(h.feed_silence_ms(450));
            for segment in closed(&outputs) {
                seqs.push(segment.seq);
            }
        }
        assert_eq!(seqs, vec![0, 1, 2]);
    }
}
