//! Optional debug sinks: translation history file and segment WAV dumps.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use tracing::{debug, error};

use crate::config::DebugConfig;
use crate::segmenter::SpeechSegment;
use crate::translation_processor::TranslationResult;

/// Append a final translation to the history file with a timestamp.
pub fn append_translation_history(
    result: &TranslationResult,
    config: &DebugConfig,
) -> Result<(), std::io::Error> {
    if !config.save_translation_history || result.translated_text.trim().is_empty() {
        return Ok(());
    }

    let path = Path::new(&config.history_path);
    let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
    let entry = format!(
        "[{}] [{}->{}] {} | {}\n",
        timestamp,
        result.source_lang,
        result.target_lang,
        result.source_text.trim(),
        result.translated_text.trim()
    );

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(entry.as_bytes())
}

/// Dump a closed segment as 16-bit PCM WAV into the recording directory.
/// Failures are logged and swallowed; a debug sink must never stall the
/// pipeline.
pub fn save_segment_wav(segment: &SpeechSegment, sample_rate: u32, config: &DebugConfig) {
    if !config.save_segment_audio {
        return;
    }
    if let Err(e) = write_wav(segment, sample_rate, config) {
        error!(seq = segment.seq, error = %e, "failed to save segment audio");
    }
}

fn write_wav(
    segment: &SpeechSegment,
    sample_rate: u32,
    config: &DebugConfig,
) -> Result<(), hound::Error> {
    fs::create_dir_all(&config.recording_dir)?;
    let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    let filename = format!("segment_{:05}_{}.wav", segment.seq, timestamp);
    let path = Path::new(&config.recording_dir).join(filename);

    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(&path, spec)?;
    for &sample in &segment.samples {
        let value = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
        writer.write_sample(value)?;
    }
    writer.finalize()?;
    debug!(seq = segment.seq, path = %path.display(), "segment audio saved");
    Ok(())
}
