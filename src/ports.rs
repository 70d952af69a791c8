//! Ports consumed by the pipeline: VAD, ASR, MT and a monotonic clock.
//!
//! The engine never touches a neural model directly. Each inference concern
//! is a narrow trait with an enumerated operation set; concrete backends live
//! with the host application and are handed in at pipeline construction.

use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;

/// Failure of a port call. Transient failures feed the circuit breaker's
/// failure counter; fatal failures open it immediately.
#[derive(Debug, Error)]
pub enum PortError {
    /// One-off failure (timeout inside the backend, busy device, ...).
    #[error("transient port failure")]
    Transient(#[source] anyhow::Error),

    /// Unrecoverable failure (model missing, wrong tensor shape, ...).
    #[error("fatal port failure")]
    Fatal(#[source] anyhow::Error),
}

impl PortError {
    pub fn transient(err: impl Into<anyhow::Error>) -> Self {
        PortError::Transient(err.into())
    }

    pub fn fatal(err: impl Into<anyhow::Error>) -> Self {
        PortError::Fatal(err.into())
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, PortError::Fatal(_))
    }
}

/// Neural voice-activity detection over a single frame.
///
/// Called from the VAD task only; implementations need not be `Sync`.
pub trait VadPort: Send {
    /// Returns `(speech_probability, confidence)` for one frame of mono
    /// 16 kHz samples, both in `[0, 1]`.
    fn probe(&mut self, frame: &[f32]) -> Result<(f32, f32), PortError>;
}

/// Decode quality requested from the recognizer backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsrMode {
    /// Rolling draft: smallest beam, quantized compute path if available.
    Fast,
    /// Segment-final: full beam, high-precision compute path.
    Accurate,
}

/// Word-level timing reported by backends that support it.
#[derive(Debug, Clone)]
pub struct WordTiming {
    pub word: String,
    pub start_ms: u64,
    pub end_ms: u64,
}

/// Raw recognizer output before post-processing.
#[derive(Debug, Clone)]
pub struct AsrOutput {
    pub text: String,
    /// Detected (or echoed) two-letter language code.
    pub language: String,
    pub confidence: f32,
    pub word_timings: Option<Vec<WordTiming>>,
    /// How much of the supplied audio the decode consumed, if the backend
    /// reports it. The recognizer falls back to the buffer length otherwise.
    pub consumed_ms: Option<u64>,
}

/// Speech recognition over a cumulative audio buffer.
///
/// Must tolerate up to `asr_workers` concurrent callers.
pub trait AsrPort: Send + Sync {
    fn transcribe(
        &self,
        audio: &[f32],
        language: Option<&str>,
        mode: AsrMode,
    ) -> Result<AsrOutput, PortError>;
}

/// Machine translation of one text. Called from the single MT worker only,
/// but through `spawn_blocking`, so `Sync` is still required.
pub trait MtPort: Send + Sync {
    fn translate(
        &self,
        text: &str,
        source_lang: &str,
        target_lang: &str,
    ) -> Result<String, PortError>;
}

/// Monotonic millisecond clock, injected so tests can control time.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// Default clock anchored at its own construction.
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

/// The full set of collaborators a pipeline instance drives.
pub struct PipelinePorts {
    pub vad: Box<dyn VadPort>,
    pub asr: Arc<dyn AsrPort>,
    pub mt: Arc<dyn MtPort>,
    pub clock: Arc<dyn Clock>,
}

impl PipelinePorts {
    /// Wire up the three inference ports with the default system clock.
    pub fn new(vad: Box<dyn VadPort>, asr: Arc<dyn AsrPort>, mt: Arc<dyn MtPort>) -> Self {
        Self {
            vad,
            asr,
            mt,
            clock: Arc::new(SystemClock::new()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}
