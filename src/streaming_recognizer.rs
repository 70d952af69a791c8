//! Streaming recognition bookkeeping.
//!
//! The ASR pool calls the port; this module owns everything around those
//! calls: the rolling-draft admission rules (cumulative-context invariant,
//! longest-common-prefix dedup, language locking), the adaptive draft-skip
//! decision, and the draft/final result types.

use std::collections::{HashMap, HashSet, VecDeque};

use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::config::RecognizerConfig;
use crate::ports::{AsrOutput, WordTiming};
use crate::segmenter::ActiveSegment;

/// How many finalized segment ids are remembered to reject late drafts.
const FINALIZED_MEMORY: usize = 64;
/// A draft tick is skipped when the segment saw silence for at least this
/// long (the segment is likely about to close).
const CLOSING_SILENCE_MS: u64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsrKind {
    Draft,
    Final,
}

/// A recognized transcript for one segment.
#[derive(Debug, Clone)]
pub struct AsrResult {
    pub segment_id: Uuid,
    pub seq: u64,
    pub kind: AsrKind,
    /// Full cumulative transcript of the audio seen so far.
    pub text: String,
    /// For drafts: the suffix that is new relative to the previous draft,
    /// when the new text merely extends it. `None` means the draft rewrote
    /// earlier output and the UI should re-render the whole text.
    pub delta: Option<String>,
    pub language: String,
    pub confidence: f32,
    pub word_timings: Option<Vec<WordTiming>>,
    pub compute_time_ms: u64,
    /// Cumulative audio length covered by this decode.
    pub consumed_ms: u64,
}

/// Why a draft tick did not dispatch a decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DraftSkip {
    /// The ASR pool already has enough queued work.
    Backpressure,
    /// Not enough new audio since the previous draft.
    NotEnoughNewAudio,
    /// The user paused drafts.
    Paused,
    /// Trailing silence; the final decode is imminent.
    ClosingSilence,
}

/// Decide whether the draft timer should dispatch a decode for the open
/// segment. `in_flight` counts queued plus running ASR jobs.
pub fn should_dispatch_draft(
    segment: &ActiveSegment,
    in_flight: usize,
    drafts_paused: bool,
    config: &RecognizerConfig,
) -> Result<(), DraftSkip> {
    if drafts_paused {
        return Err(DraftSkip::Paused);
    }
    if in_flight >= 2 {
        return Err(DraftSkip::Backpressure);
    }
    let audio_ms = segment.audio_ms();
    if audio_ms.saturating_sub(segment.last_draft_audio_ms) < config.min_draft_audio_ms {
        return Err(DraftSkip::NotEnoughNewAudio);
    }
    if segment.trailing_silence_ms >= CLOSING_SILENCE_MS {
        return Err(DraftSkip::ClosingSilence);
    }
    Ok(())
}

struct SegmentAsrState {
    previous_text: String,
    previous_consumed_ms: u64,
    locked_language: Option<String>,
    draft_index: u32,
}

/// Shared draft/final admission state, used concurrently by the ASR workers.
pub struct StreamingRecognizer {
    config: RecognizerConfig,
    /// "auto" or a fixed code, from the translator section.
    source_lang: String,
    states: Mutex<HashMap<Uuid, SegmentAsrState>>,
    finalized: Mutex<(VecDeque<Uuid>, HashSet<Uuid>)>,
}

impl StreamingRecognizer {
    pub fn new(config: RecognizerConfig, source_lang: String) -> Self {
        Self {
            config,
            source_lang,
            states: Mutex::new(HashMap::new()),
            finalized: Mutex::new((VecDeque::new(), HashSet::new())),
        }
    }

    /// Language to request from the port for this segment: the fixed source
    /// language, or the locked detection, or `None` for auto.
    pub fn request_language(&self, segment_id: Uuid) -> Option<String> {
        if self.source_lang != "auto" {
            return Some(self.source_lang.clone());
        }
        if !self.config.lock_language_after_first_draft {
            return None;
        }
        self.states
            .lock()
            .get(&segment_id)
            .and_then(|s| s.locked_language.clone())
    }

    /// Admit a draft decode. Returns `None` when the draft must be discarded:
    /// the segment already finalized, or the decode went backwards on the
    /// cumulative-context invariant.
    pub fn admit_draft(
        &self,
        segment_id: Uuid,
        seq: u64,
        output: AsrOutput,
        audio_ms: u64,
        compute_time_ms: u64,
    ) -> Option<AsrResult> {
        if self.is_finalized(segment_id) {
            debug!(%segment_id, "late draft after final, discarded");
            return None;
        }
        let consumed_ms = output.consumed_ms.unwrap_or(audio_ms);

        let mut states = self.states.lock();
        let state = states.entry(segment_id).or_insert_with(|| SegmentAsrState {
            previous_text: String::new(),
            previous_consumed_ms: 0,
            locked_language: None,
            draft_index: 0,
        });

        if consumed_ms <= state.previous_consumed_ms {
            debug!(
                %segment_id,
                consumed_ms,
                previous = state.previous_consumed_ms,
                "draft went backwards, discarded"
            );
            return None;
        }

        if state.locked_language.is_none() && self.config.lock_language_after_first_draft {
            state.locked_language = Some(output.language.clone());
        }
        let language = if self.source_lang != "auto" {
            self.source_lang.clone()
        } else {
            state
                .locked_language
                .clone()
                .unwrap_or_else(|| output.language.clone())
        };

        let delta = extension_of(&state.previous_text, &output.text);
        state.previous_text = output.text.clone();
        state.previous_consumed_ms = consumed_ms;
        state.draft_index += 1;

        Some(AsrResult {
            segment_id,
            seq,
            kind: AsrKind::Draft,
            text: output.text,
            delta,
            language,
            confidence: output.confidence,
            word_timings: output.word_timings,
            compute_time_ms,
            consumed_ms,
        })
    }

    /// Admit the final decode and retire the segment's draft state.
    pub fn admit_final(
        &self,
        segment_id: Uuid,
        seq: u64,
        output: AsrOutput,
        audio_ms: u64,
        compute_time_ms: u64,
    ) -> AsrResult {
        let state = self.states.lock().remove(&segment_id);
        self.mark_finalized(segment_id);

        let consumed_ms = output
            .consumed_ms
            .unwrap_or(audio_ms)
            .max(state.as_ref().map_or(0, |s| s.previous_consumed_ms));
        let language = if self.source_lang != "auto" {
            self.source_lang.clone()
        } else {
            state
                .and_then(|s| s.locked_language)
                .unwrap_or_else(|| output.language.clone())
        };

        AsrResult {
            segment_id,
            seq,
            kind: AsrKind::Final,
            text: output.text,
            delta: None,
            language,
            confidence: output.confidence,
            word_timings: output.word_timings,
            compute_time_ms,
            consumed_ms,
        }
    }

    /// Forget a segment that was dropped before its final decode.
    pub fn discard_segment(&self, segment_id: Uuid) {
        self.states.lock().remove(&segment_id);
        self.mark_finalized(segment_id);
    }

    fn is_finalized(&self, segment_id: Uuid) -> bool {
        self.finalized.lock().1.contains(&segment_id)
    }

    fn mark_finalized(&self, segment_id: Uuid) {
        let mut finalized = self.finalized.lock();
        if finalized.1.insert(segment_id) {
            finalized.0.push_back(segment_id);
            if finalized.0.len() > FINALIZED_MEMORY {
                if let Some(evicted) = finalized.0.pop_front() {
                    finalized.1.remove(&evicted);
                }
            }
        }
    }
}

/// If `current` extends `previous`, the new suffix; `None` otherwise.
/// Comparison is on characters, so multi-byte text never splits mid-glyph.
fn extension_of(previous: &str, current: &str) -> Option<String> {
    if previous.is_empty() {
        return Some(current.to_string());
    }
    let mut current_chars = current.chars();
    for expected in previous.chars() {
        match current_chars.next() {
            Some(c) if c == expected => {}
            _ => return None,
        }
    }
    Some(current_chars.collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(text: &str, language: &str, consumed_ms: Option<u64>) -> AsrOutput {
        AsrOutput {
            text: text.to_string(),
            language: language.to_string(),
            confidence: 0.9,
            word_timings: None,
            consumed_ms,
        }
    }

    fn recognizer(source_lang: &str) -> StreamingRecognizer {
        StreamingRecognizer::new(RecognizerConfig::default(), source_lang.to_string())
    }

    #[test]
    fn drafts_carry_the_new_suffix() {
        let r = recognizer("en");
        let id = Uuid::new_v4();
        let first = r
            .admit_draft(id, 0, output("The cat", "en", Some(1500)), 1500, 80)
            .unwrap();
        assert_eq!(first.delta.as_deref(), Some("The cat"));

        let second = r
            .admit_draft(id, 0, output("The cat sat", "en", Some(3000)), 3000, 80)
            .unwrap();
        assert_eq!(second.text, "The cat sat");
        assert_eq!(second.delta.as_deref(), Some(" sat"));
    }

    #[test]
    fn rewritten_draft_has_no_delta() {
        let r = recognizer("en");
        let id = Uuid::new_v4();
        r.admit_draft(id, 0, output("The cap", "en", Some(1500)), 1500, 80)
            .unwrap();
        let second = r
            .admit_draft(id, 0, output("The cat sat", "en", Some(3000)), 3000, 80)
            .unwrap();
        assert_eq!(second.delta, None);
    }

    #[test]
    fn backwards_consumed_ms_is_discarded() {
        let r = recognizer("en");
        let id = Uuid::new_v4();
        r.admit_draft(id, 0, output("one", "en", Some(2000)), 2000, 80)
            .unwrap();
        assert!(r
            .admit_draft(id, 0, output("two", "en", Some(1000)), 1000, 80)
            .is_none());
    }

    #[test]
    fn language_locks_on_first_draft() {
        let r = recognizer("auto");
        let id = Uuid::new_v4();
        assert_eq!(r.request_language(id), None);
        let first = r
            .admit_draft(id, 0, output("hola", "es", Some(1500)), 1500, 80)
            .unwrap();
        assert_eq!(first.language, "es");
        assert_eq!(r.request_language(id).as_deref(), Some("es"));

        // A later decode that flips its detection is overridden by the lock.
        let second = r
            .admit_draft(id, 0, output("hola amigos", "pt", Some(3000)), 3000, 80)
            .unwrap();
        assert_eq!(second.language, "es");
        let fin = r.admit_final(id, 0, output("hola amigos.", "pt", None), 4000, 200);
        assert_eq!(fin.language, "es");
    }

    #[test]
    fn fixed_language_is_passed_through() {
        let r = recognizer("ja");
        let id = Uuid::new_v4();
        assert_eq!(r.request_language(id).as_deref(), Some("ja"));
    }

    #[test]
    fn late_draft_after_final_is_discarded() {
        let r = recognizer("en");
        let id = Uuid::new_v4();
        r.admit_final(id, 0, output("done.", "en", Some(2500)), 2500, 200);
        assert!(r
            .admit_draft(id, 0, output("done", "en", Some(2000)), 2000, 80)
            .is_none());
    }

    #[test]
    fn final_consumed_ms_never_regresses_below_drafts() {
        let r = recognizer("en");
        let id = Uuid::new_v4();
        r.admit_draft(id, 0, output("one two", "en", Some(3000)), 3000, 80)
            .unwrap();
        let fin = r.admit_final(id, 0, output("one two.", "en", Some(2500)), 2500, 200);
        assert_eq!(fin.consumed_ms, 3000);
    }

    #[test]
    fn extension_of_handles_multibyte_text() {
        assert_eq!(
            extension_of("こんにち", "こんにちは").as_deref(),
            Some("は")
        );
        assert_eq!(extension_of("こんにちは", "こんばんは"), None);
    }
}
