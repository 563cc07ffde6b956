//! Canonical cache/lock keys derived from user input.
//!
//! Two pure functions: [`normalize_query`] folds free text into a
//! [`NormalizedQuery`], and [`extract_stable_id`] pulls a video identifier out
//! of a pasted link. Neither does I/O and neither can fail.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{fmt, sync::LazyLock};
use unicode_normalization::{char::is_combining_mark, UnicodeNormalization};

/// Forma de URL: `?v=` / `&v=`, dominio corto y embed
const STABLE_ID_PATTERNS: &[&str] = &[
    r"(?i)[?&]v=([\w-]{6,})",
    r"(?i)youtu\.be/([\w-]{6,})",
    r"(?i)/embed/([\w-]{6,})",
];

static STABLE_ID_REGEXES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    STABLE_ID_PATTERNS
        .iter()
        .filter_map(|pattern| Regex::new(pattern).ok())
        .collect()
});

/// Lowercase, whitespace-collapsed, diacritic-free form of a search query.
///
/// An empty value is never used as a cache or lock key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NormalizedQuery(String);

impl NormalizedQuery {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for NormalizedQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque video identifier taken from a recognized link.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StableId(String);

impl StableId {
    /// Wraps an identifier coming from a trusted source (extractor output,
    /// stored cache fields). Blank input yields `None`.
    pub fn new(raw: impl Into<String>) -> Option<Self> {
        let raw = raw.into();
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            None
        } else if trimmed.len() == raw.len() {
            Some(Self(raw))
        } else {
            Some(Self(trimmed.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Letras árabes con variantes visuales/fonéticas equivalentes
fn fold_script(c: char) -> char {
    match c {
        'أ' | 'إ' | 'آ' => 'ا',
        'ة' => 'ه',
        'ى' => 'ي',
        other => other,
    }
}

/// Folds free text into its canonical search form.
///
/// Lowercases, maps equivalent script variants to one letter, decomposes
/// (NFD) and drops combining marks without recomposing, then trims and
/// collapses whitespace runs into single spaces. Whitespace handling runs
/// last so removed marks can never leave double spaces behind, which keeps
/// the function idempotent.
pub fn normalize_query(text: &str) -> NormalizedQuery {
    let folded: String = text
        .to_lowercase()
        .chars()
        .map(fold_script)
        .nfd()
        .filter(|c| !is_combining_mark(*c))
        .collect();

    NormalizedQuery(folded.split_whitespace().collect::<Vec<_>>().join(" "))
}

/// Extracts a video identifier (6+ word characters or hyphens) from a link.
///
/// Returns `None` for text without a recognized pattern.
pub fn extract_stable_id(text: &str) -> Option<StableId> {
    if text.is_empty() {
        return None;
    }
    STABLE_ID_REGEXES
        .iter()
        .find_map(|regex| regex.captures(text))
        .and_then(|captures| captures.get(1))
        .map(|m| StableId(m.as_str().to_string()))
}
