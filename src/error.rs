//! Error taxonomy for the translation pipeline.
//!
//! Only configuration errors are fatal; everything that happens after
//! `TranslatePipeline::new` is absorbed by the per-port circuit breakers and
//! surfaces as `Dropped` events rather than as `Err` returns.

use thiserror::Error;

/// Fatal configuration problems, returned from pipeline construction.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unsupported sample rate {0} Hz (only 16000 Hz is supported)")]
    UnsupportedSampleRate(u32),

    #[error("invalid frame duration {0} ms (must be in 10..=100)")]
    InvalidFrameDuration(u32),

    #[error("vad thresholds out of order: min {min} must be < max {max}")]
    ThresholdOrder { min: f32, max: f32 },

    #[error("vad threshold {0} outside [0, 1]")]
    ThresholdRange(f32),

    #[error("{name} = {value} ms must be smaller than max_segment_duration_ms = {max} ms")]
    DurationOrder {
        name: &'static str,
        value: u64,
        max: u64,
    },

    #[error(
        "split_overlap_ms = {overlap} ms must be at least min_speech_duration_ms = {min_speech} ms"
    )]
    SplitOverlapTooShort { overlap: u64, min_speech: u64 },

    #[error("asr_workers must be >= 1")]
    NoAsrWorkers,

    #[error("unsupported language '{0}' (set allow_experimental_languages to opt in)")]
    UnsupportedLanguage(String),

    #[error("{0}")]
    Invalid(String),
}

/// Errors returned by the pipeline lifecycle methods.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("pipeline is already running")]
    AlreadyRunning,

    #[error("pipeline was never started")]
    NotStarted,
}
