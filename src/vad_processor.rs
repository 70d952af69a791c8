//! Adaptive voice-activity detection.
//!
//! Wraps the neural VAD port with a noise-floor tracker, an adaptive
//! threshold, an energy pre-filter that short-circuits obvious silence
//! without paying for inference, and a Schmitt-trigger state machine that
//! keeps edge frames from flapping between speech and silence.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::warn;

use crate::audio_ring::AudioFrame;
use crate::circuit_breaker::CircuitBreaker;
use crate::config::VadConfig;
use crate::ports::{Clock, VadPort};

/// Silence budget that must be observed before the noise estimate replaces
/// the configured initial value.
const NOISE_WARMUP_MS: u64 = 500;
/// Exponential smoothing factor for the noise floor.
const NOISE_EMA_ALPHA: f32 = 0.1;
/// Frames with a speech probability below this feed the noise estimator.
const NOISE_PROB_CEILING: f32 = 0.1;
/// Largest threshold step per update, as a share of the remaining delta.
const THRESHOLD_RATE_LIMIT: f32 = 0.2;

/// Per-frame decision emitted to the segmentation stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadEvent {
    Silence,
    /// Speech confirmed on this frame (the trigger edge).
    Speech,
    /// Still inside a confirmed speech run.
    SpeechContinuing,
}

/// A frame annotated with the VAD decision.
#[derive(Debug, Clone)]
pub struct VadFrame {
    pub frame: AudioFrame,
    pub event: VadEvent,
    pub probability: f32,
}

/// Smoothed 10th-percentile RMS over a sliding window of silence frames.
struct NoiseFloorEstimator {
    window: VecDeque<f32>,
    window_capacity: usize,
    silence_observed_ms: u64,
    smoothed: Option<f32>,
    initial: f32,
}

impl NoiseFloorEstimator {
    fn new(initial: f32, window_ms: u64, frame_ms: u64) -> Self {
        let window_capacity = (window_ms / frame_ms.max(1)).max(1) as usize;
        Self {
            window: VecDeque::with_capacity(window_capacity),
            window_capacity,
            silence_observed_ms: 0,
            smoothed: None,
            initial,
        }
    }

    fn observe_silence(&mut self, rms: f32, frame_ms: u64) {
        if self.window.len() == self.window_capacity {
            self.window.pop_front();
        }
        self.window.push_back(rms);
        self.silence_observed_ms = self.silence_observed_ms.saturating_add(frame_ms);

        if self.silence_observed_ms < NOISE_WARMUP_MS {
            return;
        }
        let percentile = self.percentile_10();
        self.smoothed = Some(match self.smoothed {
            Some(previous) => NOISE_EMA_ALPHA * percentile + (1.0 - NOISE_EMA_ALPHA) * previous,
            None => percentile,
        });
    }

    fn percentile_10(&self) -> f32 {
        let mut sorted: Vec<f32> = self.window.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let index = ((sorted.len() - 1) as f32 * 0.1).round() as usize;
        sorted[index]
    }

    fn current(&self) -> f32 {
        self.smoothed.unwrap_or(self.initial)
    }

    fn reset(&mut self) {
        self.window.clear();
        self.silence_observed_ms = 0;
        self.smoothed = None;
    }
}

/// The adaptive VAD stage. Owns the neural port; single-consumer by design.
pub struct AdaptiveVad {
    config: VadConfig,
    frame_ms: u64,
    port: Box<dyn VadPort>,
    breaker: Arc<CircuitBreaker>,
    clock: Arc<dyn Clock>,
    noise: NoiseFloorEstimator,
    threshold: f32,
    in_speech: bool,
    frames_above: u32,
    frames_below: u32,
    last_fallback_warn_ms: Option<u64>,
    frames_seen: u64,
    frames_prefiltered: u64,
}

impl AdaptiveVad {
    pub fn new(
        config: VadConfig,
        frame_ms: u64,
        port: Box<dyn VadPort>,
        breaker: Arc<CircuitBreaker>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let noise = NoiseFloorEstimator::new(config.initial_noise_floor, config.noise_window_ms, frame_ms);
        let threshold = quiet_room_threshold(config.initial_noise_floor)
            .clamp(config.min_threshold, config.max_threshold);
        Self {
            config,
            frame_ms,
            port,
            breaker,
            clock,
            noise,
            threshold,
            in_speech: false,
            frames_above: 0,
            frames_below: 0,
            last_fallback_warn_ms: None,
            frames_seen: 0,
            frames_prefiltered: 0,
        }
    }

    /// Classify one frame. Never fails: port errors degrade to the
    /// energy-only decision.
    pub fn process_frame(&mut self, frame: &AudioFrame) -> VadFrame {
        self.frames_seen += 1;
        let noise = self.noise.current();
        let rms = frame.rms;

        // Energy pre-filter: under ~6 dB above the noise floor, skip the
        // neural port entirely.
        let probability = if rms < 2.0 * noise {
            self.frames_prefiltered += 1;
            0.0
        } else if self.breaker.allows_call() {
            match self.port.probe(&frame.samples) {
                Ok((probability, _confidence)) => {
                    self.breaker.record_success();
                    probability
                }
                Err(err) => {
                    self.breaker.record_failure(err.is_fatal());
                    self.warn_fallback(&err);
                    self.energy_only_probability(rms, noise)
                }
            }
        } else {
            self.energy_only_probability(rms, noise)
        };

        if probability < NOISE_PROB_CEILING {
            self.noise.observe_silence(rms, self.frame_ms);
        }
        self.update_threshold();

        let event = self.schmitt_step(probability);
        VadFrame {
            frame: frame.clone(),
            event,
            probability,
        }
    }

    fn energy_only_probability(&self, rms: f32, noise: f32) -> f32 {
        if rms > 4.0 * noise {
            1.0
        } else {
            0.0
        }
    }

    fn warn_fallback(&mut self, err: &crate::ports::PortError) {
        let now = self.clock.now_ms();
        let due = self
            .last_fallback_warn_ms
            .map_or(true, |last| now.saturating_sub(last) >= 1000);
        if due {
            warn!(error = %err, "vad port failed, falling back to energy-only decision");
            self.last_fallback_warn_ms = Some(now);
        }
    }

    /// Step the threshold toward the tier target for the current noise floor,
    /// moving at most 20 % of the remaining delta per update.
    fn update_threshold(&mut self) {
        let target = quiet_room_threshold(self.noise.current())
            .clamp(self.config.min_threshold, self.config.max_threshold);
        let delta = target - self.threshold;
        self.threshold = (self.threshold + delta * THRESHOLD_RATE_LIMIT)
            .clamp(self.config.min_threshold, self.config.max_threshold);
    }

    fn schmitt_step(&mut self, probability: f32) -> VadEvent {
        if !self.in_speech {
            if probability >= self.threshold {
                self.frames_above += 1;
                if self.frames_above >= self.config.speech_confirm_frames {
                    self.in_speech = true;
                    self.frames_above = 0;
                    self.frames_below = 0;
                    return VadEvent::Speech;
                }
            } else {
                self.frames_above = 0;
            }
            VadEvent::Silence
        } else {
            if probability < self.threshold {
                self.frames_below += 1;
                if self.frames_below >= self.config.silence_release_frames {
                    self.in_speech = false;
                    self.frames_below = 0;
                    return VadEvent::Silence;
                }
            } else {
                self.frames_below = 0;
            }
            VadEvent::SpeechContinuing
        }
    }

    /// Reset trigger state and noise history after a capture gap.
    pub fn reset(&mut self) {
        self.in_speech = false;
        self.frames_above = 0;
        self.frames_below = 0;
        self.noise.reset();
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn noise_floor(&self) -> f32 {
        self.noise.current()
    }

    pub fn frames_seen(&self) -> u64 {
        self.frames_seen
    }

    /// Frames resolved by the energy pre-filter without a port call.
    pub fn frames_prefiltered(&self) -> u64 {
        self.frames_prefiltered
    }
}

/// Threshold tier for a given noise floor.
fn quiet_room_threshold(noise: f32) -> f32 {
    if noise < 0.001 {
        0.35
    } else if noise < 0.01 {
        0.50
    } else {
        0.65
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{PortError, SystemClock};
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedVad {
        probability: f32,
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    impl VadPort for ScriptedVad {
        fn probe(&mut self, _frame: &[f32]) -> Result<(f32, f32), PortError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(PortError::transient(anyhow::anyhow!("boom")))
            } else {
                Ok((self.probability, 1.0))
            }
        }
    }

    fn vad_with(probability: f32, fail: bool) -> (AdaptiveVad, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
        let breaker = Arc::new(CircuitBreaker::new("vad", clock.clone()));
        let vad = AdaptiveVad::new(
            VadConfig::default(),
            30,
            Box::new(ScriptedVad {
                probability,
                calls: calls.clone(),
                fail,
            }),
            breaker,
            clock,
        );
        (vad, calls)
    }

    fn frame_with_rms(rms: f32) -> AudioFrame {
        AudioFrame::new(vec![rms; 480], 0, Utc::now())
    }

    #[test]
    fn energy_prefilter_skips_the_port() {
        let (mut vad, calls) = vad_with(0.9, false);
        // Initial noise floor is 0.001; rms below 0.002 never reaches the port.
        let out = vad.process_frame(&frame_with_rms(0.0005));
        assert_eq!(out.event, VadEvent::Silence);
        assert_eq!(out.probability, 0.0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(vad.frames_prefiltered(), 1);
    }

    #[test]
    fn speech_needs_three_consecutive_frames() {
        let (mut vad, _) = vad_with(0.9, false);
        let frame = frame_with_rms(0.2);
        assert_eq!(vad.process_frame(&frame).event, VadEvent::Silence);
        assert_eq!(vad.process_frame(&frame).event, VadEvent::Silence);
        assert_eq!(vad.process_frame(&frame).event, VadEvent::Speech);
        assert_eq!(vad.process_frame(&frame).event, VadEvent::SpeechContinuing);
    }

    #[test]
    fn silence_needs_five_consecutive_frames() {
        let (mut vad, calls) = vad_with(0.9, false);
        let loud = frame_with_rms(0.2);
        for _ in 0..3 {
            vad.process_frame(&loud);
        }
        // Quiet frames are pre-filtered to probability 0 regardless of the
        // scripted port value.
        let quiet = frame_with_rms(0.0001);
        let before = calls.load(Ordering::SeqCst);
        for _ in 0..4 {
            assert_eq!(vad.process_frame(&quiet).event, VadEvent::SpeechContinuing);
        }
        assert_eq!(vad.process_frame(&quiet).event, VadEvent::Silence);
        assert_eq!(calls.load(Ordering::SeqCst), before);
    }

    #[test]
    fn port_failure_degrades_to_energy_decision() {
        let (mut vad, _) = vad_with(0.9, true);
        // Loud enough to clear both the pre-filter and the 4x fallback bar.
        let loud = frame_with_rms(0.3);
        for _ in 0..2 {
            assert_eq!(vad.process_frame(&loud).event, VadEvent::Silence);
        }
        assert_eq!(vad.process_frame(&loud).event, VadEvent::Speech);
    }

    #[test]
    fn threshold_rises_with_noise() {
        let (mut vad, _) = vad_with(0.05, false);
        let initial = vad.threshold();
        // Sustained loud noise: low speech probability, high rms, pushing
        // the noise floor into the top tier.
        for _ in 0..200 {
            vad.process_frame(&frame_with_rms(0.02));
        }
        assert!(vad.noise_floor() >= 0.01);
        assert!(vad.threshold() > initial);
        assert!(vad.threshold() <= 0.8);
    }

    #[test]
    fn threshold_moves_at_most_a_fifth_of_the_delta() {
        let (mut vad, _) = vad_with(0.05, false);
        let before = vad.threshold();
        vad.process_frame(&frame_with_rms(0.05));
        let after = vad.threshold();
        // Target tier for this noise is at most 0.65.
        assert!((after - before).abs() <= (0.65f32 - before).abs() * 0.2 + 1e-6);
    }
}
