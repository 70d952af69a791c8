//! Streaming translation: gating, stability scoring and the result cache.
//!
//! The single MT worker owns one `TranslationProcessor` and drives the MT
//! port itself; this module holds everything around the port call. Drafts are
//! only translated when the source text is semantically far enough along to
//! survive word-order differences; for subject-object-verb target languages
//! only punctuation-terminated text qualifies, because a translation started
//! before the verb cannot be repaired incrementally.

use std::collections::{HashMap, VecDeque};

use uuid::Uuid;

use crate::config::{TranslatorConfig, SOV_LANGUAGES};
use crate::streaming_recognizer::AsrKind;

/// Sentence-ending punctuation that makes a draft safe to translate.
const TERMINAL_PUNCTUATION: &[char] = &['.', '!', '?', '。', '！', '？'];

/// A translated transcript for one segment.
#[derive(Debug, Clone)]
pub struct TranslationResult {
    pub segment_id: Uuid,
    pub seq: u64,
    pub kind: AsrKind,
    pub source_text: String,
    pub translated_text: String,
    pub source_lang: String,
    pub target_lang: String,
    /// How little this draft changed versus the previous one, in [0, 1].
    pub stability: f32,
    pub compute_time_ms: u64,
    pub from_cache: bool,
    /// Set when the final translation fell back to the source text.
    pub mt_failed: bool,
}

/// Common verbs per source language, the cheap half of the semantic gate.
fn verb_list(language: &str) -> &'static [&'static str] {
    match language {
        "en" => &[
            "is", "are", "was", "were", "am", "be", "been", "do", "does", "did", "have", "has",
            "had", "go", "goes", "went", "get", "got", "make", "makes", "made", "see", "saw",
            "sat", "know", "knows", "said", "say", "says", "think", "want", "wants", "need",
            "come", "came", "take", "took", "will", "would", "can", "could", "should", "must",
        ],
        "es" => &[
            "es", "son", "está", "están", "fue", "era", "tiene", "tienen", "hace", "hacen", "va",
            "van", "quiere", "puede",
        ],
        "fr" => &[
            "est", "sont", "était", "a", "ont", "va", "vont", "fait", "faire", "peut", "veut",
        ],
        "de" => &[
            "ist", "sind", "war", "hat", "haben", "geht", "macht", "wird", "kann", "muss",
        ],
        "zh" | "zh-TW" => &[
            "是", "有", "去", "来", "做", "想", "要", "看", "说", "在", "会", "能",
        ],
        "ja" => &["する", "します", "です", "ます", "している", "った"],
        "ko" => &["이다", "있다", "하다", "가다", "보다", "합니다", "입니다"],
        _ => &[],
    }
}

fn is_cjk_language(language: &str) -> bool {
    matches!(language, "ja" | "zh" | "zh-TW" | "ko")
}

fn ends_with_terminal_punctuation(text: &str) -> bool {
    text.trim_end()
        .chars()
        .last()
        .map_or(false, |c| TERMINAL_PUNCTUATION.contains(&c))
}

fn contains_verb(text: &str, language: &str) -> bool {
    let verbs = verb_list(language);
    if verbs.is_empty() {
        return false;
    }
    if is_cjk_language(language) {
        return verbs.iter().any(|v| text.contains(v));
    }
    let lowered = text.to_lowercase();
    lowered
        .split(|c: char| !c.is_alphanumeric())
        .any(|token| !token.is_empty() && verbs.contains(&token))
}

/// Semantic gate for draft translation. Finals bypass this entirely.
pub fn should_translate_draft(text: &str, source_lang: &str, target_lang: &str) -> bool {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return false;
    }
    if ends_with_terminal_punctuation(trimmed) {
        return true;
    }
    if SOV_LANGUAGES.contains(&target_lang) {
        // Word order makes pre-verb translations unrecoverable; wait for a
        // complete sentence.
        return false;
    }
    contains_verb(trimmed, source_lang)
}

fn tokenize(text: &str, language: &str) -> Vec<String> {
    if is_cjk_language(language) {
        text.chars().filter(|c| !c.is_whitespace()).map(String::from).collect()
    } else {
        text.split_whitespace().map(String::from).collect()
    }
}

/// Token-level Levenshtein distance, single-row DP.
fn edit_distance(a: &[String], b: &[String]) -> usize {
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }
    let mut row: Vec<usize> = (0..=b.len()).collect();
    for (i, token_a) in a.iter().enumerate() {
        let mut previous_diagonal = row[0];
        row[0] = i + 1;
        for (j, token_b) in b.iter().enumerate() {
            let substitution = if token_a == token_b {
                previous_diagonal
            } else {
                previous_diagonal + 1
            };
            previous_diagonal = row[j + 1];
            row[j + 1] = substitution.min(row[j] + 1).min(row[j + 1] + 1);
        }
    }
    row[b.len()]
}

struct CacheEntry {
    value: String,
    stamp: u64,
}

/// Bounded LRU keyed by normalized source text and language pair.
struct TranslationCache {
    entries: HashMap<String, CacheEntry>,
    order: VecDeque<(String, u64)>,
    capacity: usize,
    next_stamp: u64,
}

impl TranslationCache {
    fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
            next_stamp: 0,
        }
    }

    fn key(source_text: &str, source_lang: &str, target_lang: &str) -> String {
        let normalized = source_text.split_whitespace().collect::<Vec<_>>().join(" ");
        format!("{source_lang}\u{1}{target_lang}\u{1}{normalized}")
    }

    fn get(&mut self, key: &str) -> Option<String> {
        let stamp = self.next_stamp;
        let entry = self.entries.get_mut(key)?;
        entry.stamp = stamp;
        self.next_stamp += 1;
        self.order.push_back((key.to_string(), stamp));
        Some(entry.value.clone())
    }

    fn put(&mut self, key: String, value: String) {
        let stamp = self.next_stamp;
        self.next_stamp += 1;
        self.entries.insert(
            key.clone(),
            CacheEntry {
                value,
                stamp,
            },
        );
        self.order.push_back((key, stamp));
        self.evict();
    }

    fn evict(&mut self) {
        while self.entries.len() > self.capacity {
            let Some((key, stamp)) = self.order.pop_front() else {
                return;
            };
            // Stale order records (the entry was touched again later) are
            // skipped; only the newest stamp speaks for an entry.
            if self.entries.get(&key).is_some_and(|e| e.stamp == stamp) {
                self.entries.remove(&key);
            }
        }
        // Keep the order log from growing unboundedly under heavy hits.
        while self.order.len() > self.capacity * 4 {
            let Some((key, stamp)) = self.order.pop_front() else {
                return;
            };
            if self.entries.get(&key).is_some_and(|e| e.stamp == stamp) {
                self.order.push_back((key, stamp));
            }
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// State the single MT worker keeps across calls.
pub struct TranslationProcessor {
    config: TranslatorConfig,
    cache: TranslationCache,
    previous_tokens: HashMap<Uuid, Vec<String>>,
}

impl TranslationProcessor {
    pub fn new(config: TranslatorConfig) -> Self {
        let cache = TranslationCache::new(config.cache_capacity);
        Self {
            config,
            cache,
            previous_tokens: HashMap::new(),
        }
    }

    pub fn target_lang(&self) -> &str {
        &self.config.target_lang
    }

    /// Gate a draft against the configured target language.
    pub fn gate_draft(&self, text: &str, source_lang: &str) -> bool {
        should_translate_draft(text, source_lang, &self.config.target_lang)
    }

    pub fn cache_lookup(&mut self, source_text: &str, source_lang: &str) -> Option<String> {
        if !self.config.enable_translation_cache {
            return None;
        }
        let key = TranslationCache::key(source_text, source_lang, &self.config.target_lang);
        self.cache.get(&key)
    }

    pub fn cache_store(&mut self, source_text: &str, source_lang: &str, translated: &str) {
        if !self.config.enable_translation_cache {
            return;
        }
        let key = TranslationCache::key(source_text, source_lang, &self.config.target_lang);
        self.cache.put(key, translated.to_string());
    }

    /// Stability of this draft's translation against the segment's previous
    /// one, updating the stored tokens. First drafts score 0.
    pub fn score_stability(&mut self, segment_id: Uuid, translated: &str) -> f32 {
        let tokens = tokenize(translated, &self.config.target_lang);
        let stability = match self.previous_tokens.get(&segment_id) {
            Some(previous) if !previous.is_empty() || !tokens.is_empty() => {
                let distance = edit_distance(previous, &tokens);
                let denominator = previous.len().max(tokens.len()).max(1);
                1.0 - (distance as f32 / denominator as f32)
            }
            Some(_) => 1.0,
            None => 0.0,
        };
        self.previous_tokens.insert(segment_id, tokens);
        stability.clamp(0.0, 1.0)
    }

    /// Drop per-segment state once the final translation is out.
    pub fn finish_segment(&mut self, segment_id: Uuid) {
        self.previous_tokens.remove(&segment_id);
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn punctuated_text_is_always_translatable() {
        assert!(should_translate_draft("That is done.", "en", "ja"));
        assert!(should_translate_draft("もう終わりました。", "ja", "en"));
    }

    #[test]
    fn sov_target_requires_punctuation() {
        // Verb present, but the Japanese target disables the verb path.
        assert!(!should_translate_draft("The cat sat on the", "en", "ja"));
        assert!(!should_translate_draft("The cat sat on the mat", "en", "ja"));
        assert!(should_translate_draft("The cat sat on the mat.", "en", "ja"));
    }

    #[test]
    fn verb_presence_unlocks_non_sov_targets() {
        assert!(should_translate_draft("this is a test", "en", "zh"));
        assert!(!should_translate_draft("the red cat", "en", "zh"));
    }

    #[test]
    fn verb_matching_is_word_boundary_aware() {
        // "island" contains "is" but is not the verb.
        assert!(!should_translate_draft("the island shore", "en", "zh"));
    }

    #[test]
    fn empty_text_is_never_translated() {
        assert!(!should_translate_draft("   ", "en", "zh"));
    }

    #[test]
    fn stability_grows_as_drafts_converge() {
        let mut p = TranslationProcessor::new(TranslatorConfig::default());
        let id = Uuid::new_v4();
        assert_eq!(p.score_stability(id, "你好 世界"), 0.0);
        let partial = p.score_stability(id, "你好 世界 这是");
        assert!(partial > 0.0 && partial < 1.0);
        let stable = p.score_stability(id, "你好 世界 这是");
        assert!((stable - 1.0).abs() < f32::EPSILON);
        p.finish_segment(id);
    }

    #[test]
    fn cache_round_trips_and_counts() {
        let mut p = TranslationProcessor::new(TranslatorConfig::default());
        assert!(p.cache_lookup("hello world", "en").is_none());
        p.cache_store("hello world", "en", "你好世界");
        assert_eq!(
            p.cache_lookup("hello  world", "en").as_deref(),
            Some("你好世界"),
            "whitespace differences share a cache slot"
        );
        assert_eq!(p.cache_len(), 1);
    }

    #[test]
    fn cache_respects_capacity() {
        let mut config = TranslatorConfig::default();
        config.cache_capacity = 2;
        let mut p = TranslationProcessor::new(config);
        p.cache_store("one", "en", "一");
        p.cache_store("two", "en", "二");
        // Touch "one" so "two" is the least recently used.
        assert!(p.cache_lookup("one", "en").is_some());
        p.cache_store("three", "en", "三");
        assert_eq!(p.cache_len(), 2);
        assert!(p.cache_lookup("two", "en").is_none());
        assert!(p.cache_lookup("one", "en").is_some());
        assert!(p.cache_lookup("three", "en").is_some());
    }

    #[test]
    fn cache_can_be_disabled() {
        let mut config = TranslatorConfig::default();
        config.enable_translation_cache = false;
        let mut p = TranslationProcessor::new(config);
        p.cache_store("hello", "en", "你好");
        assert!(p.cache_lookup("hello", "en").is_none());
    }

    #[test]
    fn edit_distance_basics() {
        let a: Vec<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
        let b: Vec<String> = ["a", "x", "c"].iter().map(|s| s.to_string()).collect();
        assert_eq!(edit_distance(&a, &b), 1);
        assert_eq!(edit_distance(&a, &[]), 3);
        assert_eq!(edit_distance(&[], &b), 3);
    }
}
