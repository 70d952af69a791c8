//! Transcript post-processing: hallucination rejection and text cleanup.
//!
//! Runs inside the recognizer stage so that a rejected transcript never costs
//! translation time. Decisions are typed return values; a rejection is a
//! normal outcome, not an error.

use crate::config::PostProcessConfig;

/// Why a transcript was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    CharRepetition,
    SequenceRepetition,
    LowDiversity,
    LowConfidence,
    EmptyText,
}

/// Result of post-processing one transcript.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Normalized text, safe to translate.
    Clean(String),
    /// Do not translate; the reason is recorded on the segment.
    Skip(SkipReason),
}

/// Longest pattern length considered by the sequence-repetition rule.
const MAX_PATTERN_LEN: usize = 20;
/// Analysis is bounded to this many characters; ASR hallucinations show their
/// structure long before this point.
const ANALYSIS_CAP: usize = 1000;

const ARTIFACT_KEYWORDS: &[&str] = &[
    "laughter", "laughing", "applause", "music", "noise", "silence", "inaudible", "cheering",
    "clapping", "coughing", "笑", "拍手", "音楽", "♪",
];

/// Language-specific filler words. Multi-word entries are matched as
/// consecutive tokens; CJK entries are matched as substrings.
fn filler_words(language: &str) -> &'static [&'static str] {
    match language {
        "en" => &[
            "um", "uh", "uhm", "erm", "hmm", "like", "you know", "i mean", "sort of", "kind of",
        ],
        "ja" => &["あの", "えーと", "ええと", "まあ", "なんか"],
        "zh" | "zh-TW" => &["那个", "就是", "嗯", "呃"],
        "fr" => &["euh", "alors", "ben", "bah"],
        _ => &[],
    }
}

fn is_cjk_language(language: &str) -> bool {
    matches!(language, "ja" | "zh" | "zh-TW" | "ko")
}

/// Apply the rejection rules and, if none fire, the normalization rules.
pub fn process_transcript(
    text: &str,
    confidence: f32,
    language: &str,
    config: &PostProcessConfig,
) -> Outcome {
    if confidence < config.min_confidence {
        return Outcome::Skip(SkipReason::LowConfidence);
    }
    if has_char_repetition(text) {
        return Outcome::Skip(SkipReason::CharRepetition);
    }
    if has_sequence_repetition(text) {
        return Outcome::Skip(SkipReason::SequenceRepetition);
    }
    if has_low_diversity(text, config.min_diversity_ratio) {
        return Outcome::Skip(SkipReason::LowDiversity);
    }
    let cleaned = normalize_text(text, language, config);
    if cleaned.is_empty() {
        return Outcome::Skip(SkipReason::EmptyText);
    }
    Outcome::Clean(cleaned)
}

/// Rule 1: the most frequent non-whitespace character appears at least four
/// times and makes up at least 30 % of the text.
fn has_char_repetition(text: &str) -> bool {
    let mut counts = std::collections::HashMap::new();
    let mut total = 0usize;
    for c in text.chars().filter(|c| !c.is_whitespace()).take(ANALYSIS_CAP) {
        *counts.entry(c).or_insert(0usize) += 1;
        total += 1;
    }
    let Some(&max) = counts.values().max() else {
        return false;
    };
    max >= 4 && max * 10 >= total * 3
}

/// Rule 2: some substring of length 2..=min(20, len/3) repeats at least four
/// times and covers at least half of the text.
fn has_sequence_repetition(text: &str) -> bool {
    let chars: Vec<char> = text.chars().take(ANALYSIS_CAP).collect();
    let len = chars.len();
    if len < 8 {
        return false;
    }
    let max_pattern = MAX_PATTERN_LEN.min(len / 3);
    for pattern_len in 2..=max_pattern {
        // Every alignment of the pattern start is a candidate; counting is
        // non-overlapping from the left.
        for start in 0..pattern_len.min(len - pattern_len + 1) {
            let pattern = &chars[start..start + pattern_len];
            let mut count = 0usize;
            let mut i = 0usize;
            while i + pattern_len <= len {
                if &chars[i..i + pattern_len] == pattern {
                    count += 1;
                    i += pattern_len;
                } else {
                    i += 1;
                }
            }
            if count >= 4 && count * pattern_len * 2 >= len {
                return true;
            }
        }
    }
    false
}

/// Rule 3: texts longer than 50 characters with too few distinct characters.
fn has_low_diversity(text: &str, min_ratio: f32) -> bool {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= 50 {
        return false;
    }
    let unique: std::collections::HashSet<&char> = chars.iter().collect();
    (unique.len() as f32) < min_ratio * chars.len() as f32
}

/// Normalization: artifact removal, punctuation dedup, filler stripping,
/// whitespace collapse. Idempotent.
pub fn normalize_text(text: &str, language: &str, config: &PostProcessConfig) -> String {
    let no_artifacts = remove_parenthetical_artifacts(text);
    let deduped = dedup_consecutive_punctuation(&no_artifacts);
    let stripped = if config.remove_filler_words {
        strip_fillers(&deduped, language)
    } else {
        deduped
    };
    collapse_whitespace(&stripped)
}

/// Remove `(Laughter)` / `(Music)` style sound descriptions, including the
/// full-width and bracketed variants ASR backends emit.
fn remove_parenthetical_artifacts(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    let chars: Vec<char> = text.chars().collect();
    let mut i = 0usize;
    while i < chars.len() {
        let open = chars[i];
        let close = match open {
            '(' => Some(')'),
            '（' => Some('）'),
            '[' => Some(']'),
            '【' => Some('】'),
            _ => None,
        };
        if let Some(close) = close {
            if let Some(offset) = chars[i + 1..].iter().position(|&c| c == close) {
                let content: String = chars[i + 1..i + 1 + offset].iter().collect();
                if is_artifact_content(&content) {
                    i += offset + 2;
                    continue;
                }
            }
        }
        result.push(open);
        i += 1;
    }
    result
}

fn is_artifact_content(content: &str) -> bool {
    let trimmed = content.trim();
    if trimmed.is_empty() || trimmed.chars().count() > 30 {
        return trimmed.is_empty();
    }
    // Pure punctuation/symbols count as a generic sound description.
    if trimmed.chars().all(|c| !c.is_alphanumeric()) {
        return true;
    }
    let lowered = trimmed.to_lowercase();
    ARTIFACT_KEYWORDS.iter().any(|k| lowered.contains(k))
}

/// Collapse runs of the same punctuation mark into one.
fn dedup_consecutive_punctuation(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    let mut previous: Option<char> = None;
    for c in text.chars() {
        let is_punct = c.is_ascii_punctuation() || "。！？、，…：；「」".contains(c);
        if is_punct && previous == Some(c) {
            continue;
        }
        result.push(c);
        previous = Some(c);
    }
    result
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Word-boundary-aware filler removal. Never empties the text: if stripping
/// would leave nothing, the input is returned unchanged.
fn strip_fillers(text: &str, language: &str) -> String {
    let fillers = filler_words(language);
    if fillers.is_empty() {
        return text.to_string();
    }

    let stripped = if is_cjk_language(language) {
        let mut out = text.to_string();
        for filler in fillers {
            out = out.replace(filler, "");
        }
        out
    } else {
        strip_token_fillers(text, fillers)
    };

    if stripped.trim().is_empty() {
        text.to_string()
    } else {
        stripped
    }
}

/// Token-level stripping for space-delimited languages, handling one- and
/// two-word fillers.
fn strip_token_fillers(text: &str, fillers: &[&str]) -> String {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    let bare: Vec<String> = tokens
        .iter()
        .map(|t| {
            t.trim_matches(|c: char| c.is_ascii_punctuation())
                .to_lowercase()
        })
        .collect();

    let mut kept = Vec::with_capacity(tokens.len());
    let mut i = 0usize;
    while i < tokens.len() {
        if i + 1 < tokens.len() {
            let pair = format!("{} {}", bare[i], bare[i + 1]);
            if fillers.contains(&pair.as_str()) {
                i += 2;
                continue;
            }
        }
        if fillers.contains(&bare[i].as_str()) {
            i += 1;
            continue;
        }
        kept.push(tokens[i]);
        i += 1;
    }
    kept.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> PostProcessConfig {
        PostProcessConfig::default()
    }

    #[test]
    fn clean_sentence_passes_through() {
        let outcome = process_transcript("Hello world, this is a test.", 0.9, "en", &config());
        assert_eq!(
            outcome,
            Outcome::Clean("Hello world, this is a test.".to_string())
        );
    }

    #[test]
    fn repeated_sequence_is_rejected() {
        let text = "99.9".repeat(110);
        let outcome = process_transcript(&text, 0.9, "en", &config());
        assert!(matches!(outcome, Outcome::Skip(_)), "got {outcome:?}");
    }

    #[test]
    fn repeated_char_is_rejected() {
        let outcome = process_transcript("aaaa aaaa b", 0.9, "en", &config());
        assert_eq!(outcome, Outcome::Skip(SkipReason::CharRepetition));
    }

    #[test]
    fn low_confidence_is_rejected() {
        let outcome = process_transcript("perfectly fine text", 0.1, "en", &config());
        assert_eq!(outcome, Outcome::Skip(SkipReason::LowConfidence));
    }

    #[test]
    fn low_diversity_is_rejected() {
        // 60 chars over a 17-character alphabet: ratio 0.283, below 0.30,
        // while no single character nears the 30 % repetition share.
        let text: String = "abcdefghijklmnopq".chars().cycle().take(60).collect();
        let outcome = process_transcript(&text, 0.9, "en", &config());
        assert_eq!(outcome, Outcome::Skip(SkipReason::LowDiversity));
    }

    #[test]
    fn artifacts_are_removed() {
        let outcome = process_transcript("(Laughter) So anyway", 0.9, "en", &config());
        assert_eq!(outcome, Outcome::Clean("So anyway".to_string()));
    }

    #[test]
    fn artifact_only_text_is_empty() {
        let outcome = process_transcript("(Applause)", 0.9, "en", &config());
        assert_eq!(outcome, Outcome::Skip(SkipReason::EmptyText));
    }

    #[test]
    fn punctuation_runs_collapse() {
        let cleaned = normalize_text("Wait!! What??", "en", &config());
        assert_eq!(cleaned, "Wait! What?");
    }

    #[test]
    fn english_fillers_are_stripped() {
        let cleaned = normalize_text("So, um, you know, it works", "en", &config());
        assert_eq!(cleaned, "So, it works");
    }

    #[test]
    fn japanese_fillers_are_stripped() {
        let cleaned = normalize_text("えーと、これはテストです", "ja", &config());
        assert_eq!(cleaned, "、これはテストです");
    }

    #[test]
    fn filler_stripping_never_empties() {
        let cleaned = normalize_text("um uh", "en", &config());
        assert_eq!(cleaned, "um uh");
    }

    #[test]
    fn fillers_kept_when_disabled() {
        let mut cfg = config();
        cfg.remove_filler_words = false;
        let cleaned = normalize_text("um, hello", "en", &cfg);
        assert_eq!(cleaned, "um, hello");
    }

    #[test]
    fn normalization_is_idempotent() {
        let cfg = config();
        for text in [
            "Hello   world!!",
            "(Music) um so like, basically (Laughter)",
            "えーと、そうですね。。",
        ] {
            for lang in ["en", "ja"] {
                let once = normalize_text(text, lang, &cfg);
                let twice = normalize_text(&once, lang, &cfg);
                assert_eq!(once, twice, "not idempotent for {text:?} ({lang})");
            }
        }
    }

    #[test]
    fn processing_twice_yields_same_result() {
        let cfg = config();
        let first = process_transcript("So, um, it   works!! fine", 0.8, "en", &cfg);
        let Outcome::Clean(text) = first else {
            panic!("expected clean outcome");
        };
        let second = process_transcript(&text, 0.8, "en", &cfg);
        assert_eq!(second, Outcome::Clean(text));
    }
}
