//! polyvox: real-time streaming voice translation engine.
//!
//! Consumes a live 16 kHz mono audio stream pushed by the host and emits
//! draft and final transcriptions plus translations with bounded latency.
//! Neural models (VAD, ASR, MT) are supplied by the host through the ports
//! in [`ports`]; the engine owns segmentation, scheduling, ordering,
//! backpressure and the no-segment-lost guarantee.
//!
//! ```no_run
//! use std::sync::Arc;
//! use polyvox::{AppConfig, PipelinePorts, TranslatePipeline};
//! # use polyvox::ports::{AsrMode, AsrOutput, AsrPort, MtPort, PortError, VadPort};
//! # struct MyVad; struct MyAsr; struct MyMt;
//! # impl VadPort for MyVad {
//! #     fn probe(&mut self, _f: &[f32]) -> Result<(f32, f32), PortError> { Ok((0.0, 1.0)) }
//! # }
//! # impl AsrPort for MyAsr {
//! #     fn transcribe(&self, _a: &[f32], _l: Option<&str>, _m: AsrMode)
//! #         -> Result<AsrOutput, PortError> { unimplemented!() }
//! # }
//! # impl MtPort for MyMt {
//! #     fn translate(&self, _t: &str, _s: &str, _g: &str) -> Result<String, PortError> {
//! #         unimplemented!()
//! #     }
//! # }
//!
//! # #[tokio::main] async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AppConfig::for_languages("en", "zh");
//! let ports = PipelinePorts::new(Box::new(MyVad), Arc::new(MyAsr), Arc::new(MyMt));
//! let mut pipeline = TranslatePipeline::new(config, ports)?;
//! pipeline.start(|event| println!("{event:?}"))?;
//! // capture layer calls pipeline.push_frame(...) per frame
//! pipeline.stop().await;
//! # Ok(()) }
//! ```

pub mod audio_ring;
pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod events;
pub mod ports;
pub mod post_processor;
pub mod queue;
pub mod real_time_translator;
pub mod reorder_buffer;
pub mod segment_tracker;
pub mod segment_writer;
pub mod segmenter;
pub mod streaming_recognizer;
pub mod translation_processor;
pub mod translation_stats;
pub mod vad_processor;

// Re-export key components for easier access
pub use config::{AppConfig, PipelineMode};
pub use error::{ConfigError, PipelineError};
pub use events::{DropReason, PipelineEvent, SegmentDescriptor, Stage};
pub use ports::{Clock, PipelinePorts, SystemClock};
pub use real_time_translator::TranslatePipeline;
pub use segmenter::SpeechSegment;
pub use streaming_recognizer::{AsrKind, AsrResult};
pub use translation_processor::TranslationResult;
pub use translation_stats::MetricsSnapshot;
