//! Pipeline configuration.
//!
//! Every tunable lives here, grouped into sections that mirror the pipeline
//! stages. All sections carry serde defaults so a partial TOML document is
//! enough; `AppConfig::validate` runs once at pipeline construction and is the
//! only place a configuration problem can become a hard error.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Languages the gating tables and filler lists know about.
pub const SUPPORTED_LANGUAGES: &[&str] = &["en", "zh", "ja", "fr", "de", "es", "ko", "zh-TW"];

/// Target languages with subject-object-verb word order, for which draft
/// translation is gated on terminal punctuation only.
pub const SOV_LANGUAGES: &[&str] = &["ja", "ko", "de", "tr", "hi", "fa"];

/// Capture/frame geometry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Audio sample rate in Hz. Only 16000 is supported.
    pub sample_rate: u32,
    /// Capture and VAD frame duration in milliseconds.
    pub frame_ms: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            frame_ms: 30,
        }
    }
}

impl AudioConfig {
    pub fn samples_per_frame(&self) -> usize {
        (self.sample_rate as usize * self.frame_ms as usize) / 1000
    }
}

/// Adaptive voice-activity detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    /// Lower clamp for the adaptive speech threshold.
    pub min_threshold: f32,
    /// Upper clamp for the adaptive speech threshold.
    pub max_threshold: f32,
    /// Noise floor assumed until 500 ms of silence has been observed.
    pub initial_noise_floor: f32,
    /// Sliding window over which the noise percentile is tracked, in ms.
    pub noise_window_ms: u64,
    /// Consecutive frames at/above threshold before entering speech.
    pub speech_confirm_frames: u32,
    /// Consecutive frames below threshold before leaving speech.
    pub silence_release_frames: u32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            min_threshold: 0.3,
            max_threshold: 0.8,
            initial_noise_floor: 0.001,
            noise_window_ms: 2000,
            speech_confirm_frames: 3,
            silence_release_frames: 5,
        }
    }
}

/// Segmentation state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmenterConfig {
    /// Audio kept from before the VAD trigger, in ms.
    pub pre_roll_ms: u64,
    /// Segments with less speech than this are discarded.
    pub min_speech_duration_ms: u64,
    /// Silence required to close a segment, in ms.
    pub min_silence_duration_ms: u64,
    /// Force-split threshold, in ms.
    pub max_segment_duration_ms: u64,
    /// Window searched for a natural pause when force-splitting, in ms.
    pub pause_threshold_ms: u64,
    /// Overlap carried into the next part of a forced split, in ms.
    pub split_overlap_ms: u64,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            pre_roll_ms: 500,
            min_speech_duration_ms: 250,
            min_silence_duration_ms: 400,
            max_segment_duration_ms: 8000,
            pause_threshold_ms: 800,
            split_overlap_ms: 300,
        }
    }
}

/// Streaming recognizer cadence and worker pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecognizerConfig {
    /// Rolling draft cadence, in ms.
    pub draft_interval_ms: u64,
    /// Skip a draft tick when less new audio than this accumulated.
    pub min_draft_audio_ms: u64,
    /// ASR worker pool size.
    pub asr_workers: usize,
    /// Per-call timeout for draft decodes, in ms.
    pub draft_timeout_ms: u64,
    /// Per-call timeout for the final decode, in ms.
    pub final_timeout_ms: u64,
    /// With `source_lang = "auto"`, lock the language detected on the first
    /// draft for the rest of the segment to prevent UI flicker.
    pub lock_language_after_first_draft: bool,
}

impl Default for RecognizerConfig {
    fn default() -> Self {
        Self {
            draft_interval_ms: 2000,
            min_draft_audio_ms: 1500,
            asr_workers: 2.min(num_cpus::get().max(1)),
            draft_timeout_ms: 1500,
            final_timeout_ms: 5000,
            lock_language_after_first_draft: true,
        }
    }
}

/// Hallucination filtering and text normalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PostProcessConfig {
    /// Transcripts below this confidence are rejected.
    pub min_confidence: f32,
    /// Minimum unique/total character ratio for texts longer than 50 chars.
    pub min_diversity_ratio: f32,
    /// Strip language-specific filler words.
    pub remove_filler_words: bool,
}

impl Default for PostProcessConfig {
    fn default() -> Self {
        Self {
            min_confidence: 0.30,
            min_diversity_ratio: 0.30,
            remove_filler_words: true,
        }
    }
}

/// Translation gating, cache and retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranslatorConfig {
    /// Source language code, or "auto" for detection on the first draft.
    pub source_lang: String,
    /// Target language code.
    pub target_lang: String,
    pub enable_translation_cache: bool,
    pub cache_capacity: usize,
    /// Per-call MT timeout, in ms.
    pub mt_timeout_ms: u64,
    /// Accept language codes outside the supported set.
    pub allow_experimental_languages: bool,
}

impl Default for TranslatorConfig {
    fn default() -> Self {
        Self {
            source_lang: "en".to_string(),
            target_lang: "zh".to_string(),
            enable_translation_cache: true,
            cache_capacity: 10_000,
            mt_timeout_ms: 2000,
            allow_experimental_languages: false,
        }
    }
}

/// Bounded queue capacities between the pipeline stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub audio_to_vad: usize,
    pub vad_to_seg: usize,
    pub seg_to_asr: usize,
    pub asr_to_mt: usize,
    pub mt_to_out: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            audio_to_vad: 10,
            vad_to_seg: 10,
            seg_to_asr: 5,
            asr_to_mt: 5,
            mt_to_out: 20,
        }
    }
}

/// Optional debug sinks, all off by default.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    /// Write every closed segment as a WAV file into `recording_dir`.
    pub save_segment_audio: bool,
    pub recording_dir: String,
    /// Append final translations with timestamps to `history_path`.
    pub save_translation_history: bool,
    pub history_path: String,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            save_segment_audio: false,
            recording_dir: "recordings".to_string(),
            save_translation_history: false,
            history_path: "translation_history.txt".to_string(),
        }
    }
}

/// Segmentation presets for different speaking styles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineMode {
    /// Low-latency conversational streaming.
    Streaming,
    /// Longer utterances, split on sentence-sized pauses.
    Sentence,
    /// Very long turns; hallucination filtering loosened, fillers kept.
    Interview,
}

impl Default for PipelineMode {
    fn default() -> Self {
        PipelineMode::Streaming
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub mode: PipelineMode,
    pub audio: AudioConfig,
    pub vad: VadConfig,
    pub segmenter: SegmenterConfig,
    pub recognizer: RecognizerConfig,
    pub post_process: PostProcessConfig,
    pub translator: TranslatorConfig,
    pub queues: QueueConfig,
    pub debug: DebugConfig,
    /// Drain budget after `stop()` before tasks are forced out, in ms.
    pub shutdown_grace_ms: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            mode: PipelineMode::Streaming,
            audio: AudioConfig::default(),
            vad: VadConfig::default(),
            segmenter: SegmenterConfig::default(),
            recognizer: RecognizerConfig::default(),
            post_process: PostProcessConfig::default(),
            translator: TranslatorConfig::default(),
            queues: QueueConfig::default(),
            debug: DebugConfig::default(),
            shutdown_grace_ms: 5000,
        }
    }
}

impl AppConfig {
    /// Default configuration for a language pair.
    pub fn for_languages(source_lang: &str, target_lang: &str) -> Self {
        let mut config = Self::default();
        config.translator.source_lang = source_lang.to_string();
        config.translator.target_lang = target_lang.to_string();
        config
    }

    /// Apply the segmentation and filtering preset for `mode`.
    pub fn with_mode(mut self, mode: PipelineMode) -> Self {
        self.mode = mode;
        match mode {
            PipelineMode::Streaming => {}
            PipelineMode::Sentence => {
                self.segmenter.max_segment_duration_ms = 12_000;
            }
            PipelineMode::Interview => {
                self.segmenter.max_segment_duration_ms = 15_000;
                self.post_process.min_diversity_ratio = 0.12;
                self.post_process.remove_filler_words = false;
            }
        }
        self
    }

    /// Parse a configuration from TOML text. Reading the file is the host's
    /// responsibility.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: AppConfig =
            toml::from_str(text).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn language_supported(&self, lang: &str) -> bool {
        SUPPORTED_LANGUAGES.contains(&lang) || self.translator.allow_experimental_languages
    }

    /// Validate cross-field invariants. Called by the pipeline constructor.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.audio.sample_rate != 16000 {
            return Err(ConfigError::UnsupportedSampleRate(self.audio.sample_rate));
        }
        if !(10..=100).contains(&self.audio.frame_ms) {
            return Err(ConfigError::InvalidFrameDuration(self.audio.frame_ms));
        }
        for threshold in [self.vad.min_threshold, self.vad.max_threshold] {
            if !(0.0..=1.0).contains(&threshold) {
                return Err(ConfigError::ThresholdRange(threshold));
            }
        }
        if self.vad.min_threshold >= self.vad.max_threshold {
            return Err(ConfigError::ThresholdOrder {
                min: self.vad.min_threshold,
                max: self.vad.max_threshold,
            });
        }
        let max = self.segmenter.max_segment_duration_ms;
        for (name, value) in [
            (
                "min_silence_duration_ms",
                self.segmenter.min_silence_duration_ms,
            ),
            ("pre_roll_ms", self.segmenter.pre_roll_ms),
            (
                "min_speech_duration_ms",
                self.segmenter.min_speech_duration_ms,
            ),
        ] {
            if value >= max {
                return Err(ConfigError::DurationOrder { name, value, max });
            }
        }
        // A forced-split successor starts from the carried overlap alone; it
        // must already satisfy the minimum-duration guarantee when silence
        // closes it right away.
        if self.segmenter.split_overlap_ms < self.segmenter.min_speech_duration_ms {
            return Err(ConfigError::SplitOverlapTooShort {
                overlap: self.segmenter.split_overlap_ms,
                min_speech: self.segmenter.min_speech_duration_ms,
            });
        }
        if self.recognizer.asr_workers < 1 {
            return Err(ConfigError::NoAsrWorkers);
        }
        let source = self.translator.source_lang.as_str();
        if source != "auto" && !self.language_supported(source) {
            return Err(ConfigError::UnsupportedLanguage(source.to_string()));
        }
        let target = self.translator.target_lang.as_str();
        if target == "auto" || !self.language_supported(target) {
            return Err(ConfigError::UnsupportedLanguage(target.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        AppConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_unordered_thresholds() {
        let mut config = AppConfig::default();
        config.vad.min_threshold = 0.8;
        config.vad.max_threshold = 0.3;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ThresholdOrder { .. })
        ));
    }

    #[test]
    fn rejects_silence_longer_than_segment() {
        let mut config = AppConfig::default();
        config.segmenter.min_silence_duration_ms = 9000;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DurationOrder { .. })
        ));
    }

    #[test]
    fn rejects_overlap_below_min_speech() {
        let mut config = AppConfig::default();
        config.segmenter.split_overlap_ms = 50;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::SplitOverlapTooShort { .. })
        ));
        config.segmenter.min_speech_duration_ms = 50;
        config.validate().unwrap();
    }

    #[test]
    fn rejects_unknown_language_unless_experimental() {
        let mut config = AppConfig::for_languages("en", "xx");
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnsupportedLanguage(_))
        ));
        config.translator.allow_experimental_languages = true;
        config.validate().unwrap();
    }

    #[test]
    fn auto_target_is_rejected() {
        let config = AppConfig::for_languages("auto", "auto");
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnsupportedLanguage(_))
        ));
    }

    #[test]
    fn interview_mode_loosens_diversity() {
        let config = AppConfig::default().with_mode(PipelineMode::Interview);
        assert_eq!(config.segmenter.max_segment_duration_ms, 15_000);
        assert!((config.post_process.min_diversity_ratio - 0.12).abs() < f32::EPSILON);
        assert!(!config.post_process.remove_filler_words);
    }

    #[test]
    fn parses_partial_toml() {
        let config = AppConfig::from_toml_str(
            r#"
            [translator]
            source_lang = "ja"
            target_lang = "en"

            [segmenter]
            max_segment_duration_ms = 12000
            "#,
        )
        .unwrap();
        assert_eq!(config.translator.source_lang, "ja");
        assert_eq!(config.segmenter.max_segment_duration_ms, 12_000);
        assert_eq!(config.recognizer.draft_interval_ms, 2000);
    }
}
