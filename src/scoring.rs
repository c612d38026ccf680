use std::sync::LazyLock;

use regex::{Regex, RegexBuilder};
use tracing::warn;

use crate::config::Keywords;

static HASHTAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"#\S+").expect("valid hashtag pattern"));

/// Scoring result: distinct keyword surface forms hit, sorted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScoreResult {
    pub score: u32,
    pub matched: Vec<String>,
}

impl ScoreResult {
    pub fn zero() -> Self {
        Self {
            score: 0,
            matched: Vec::new(),
        }
    }

    /// UTF-8 JSON array, non-ASCII preserved.
    pub fn matched_json(&self) -> String {
        serde_json::to_string(&self.matched).unwrap_or_else(|_| "[]".to_string())
    }
}

/// Multilingual substring matcher. The per-language buckets collapse into one
/// combined set at construction; substring (not word-boundary) matching is
/// intentional — CJK and mixed-script keywords have no universal word
/// boundary. A single alternation regex over all keywords serves as a fast
/// rejection filter for the common no-hit case.
pub struct Scorer {
    /// Surface forms in curation order (ja, en, zh, ru, ar), deduplicated by
    /// case-folded form, empties stripped.
    keywords: Vec<String>,
    keywords_folded: Vec<String>,
    negatives: Vec<String>,
    prefilter: Option<Regex>,
}

impl Scorer {
    pub fn new(keywords: &Keywords, negatives: &[String]) -> Self {
        let mut surface: Vec<String> = Vec::new();
        let mut folded: Vec<String> = Vec::new();
        for word in keywords.combined() {
            let f = word.to_lowercase();
            if f.is_empty() || folded.contains(&f) {
                continue;
            }
            surface.push(word.clone());
            folded.push(f);
        }

        let prefilter = if folded.is_empty() {
            None
        } else {
            let mut by_len: Vec<&String> = folded.iter().collect();
            by_len.sort_by(|a, b| b.len().cmp(&a.len()));
            let pattern = by_len
                .iter()
                .map(|w| regex::escape(w))
                .collect::<Vec<_>>()
                .join("|");
            match RegexBuilder::new(&pattern).case_insensitive(true).build() {
                Ok(re) => Some(re),
                Err(e) => {
                    warn!(error = %e, "failed to build keyword pre-filter");
                    None
                }
            }
        };

        let negatives = negatives
            .iter()
            .map(|n| n.to_lowercase())
            .filter(|n| !n.is_empty())
            .collect();

        Self {
            keywords: surface,
            keywords_folded: folded,
            negatives,
            prefilter,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.keywords.is_empty()
    }

    /// Does any configured negative term occur in the text?
    pub fn matches_negative(&self, text: &str) -> bool {
        if self.negatives.is_empty() {
            return false;
        }
        let folded = text.to_lowercase();
        self.negatives.iter().any(|n| folded.contains(n.as_str()))
    }

    pub fn score(&self, text: &str) -> ScoreResult {
        let body = HASHTAG_RE.replace_all(text, " ").to_lowercase();
        if body.trim().is_empty() {
            return ScoreResult::zero();
        }
        if self.negatives.iter().any(|n| body.contains(n.as_str())) {
            return ScoreResult::zero();
        }
        if self.keywords.is_empty() {
            return ScoreResult::zero();
        }
        if let Some(prefilter) = &self.prefilter
            && !prefilter.is_match(&body)
        {
            return ScoreResult::zero();
        }

        let mut matched: Vec<String> = self
            .keywords_folded
            .iter()
            .zip(&self.keywords)
            .filter(|(folded, _)| body.contains(folded.as_str()))
            .map(|(_, surface)| surface.clone())
            .collect();
        matched.sort();

        ScoreResult {
            score: matched.len() as u32,
            matched,
        }
    }
}

/// Detect the dominant language of a text. Two-letter codes for the target
/// languages, ISO 639-3 otherwise, "und" when detection fails.
pub fn detect_lang(text: &str) -> String {
    match whatlang::detect(text) {
        Some(info) => match info.lang() {
            whatlang::Lang::Jpn => "ja".to_string(),
            whatlang::Lang::Eng => "en".to_string(),
            whatlang::Lang::Cmn => "zh".to_string(),
            whatlang::Lang::Rus => "ru".to_string(),
            whatlang::Lang::Ara => "ar".to_string(),
            whatlang::Lang::Spa => "es".to_string(),
            other => other.code().to_string(),
        },
        None => "und".to_string(),
    }
}
