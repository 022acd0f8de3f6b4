//! Ingredient text normalization.
//!
//! Two forms are produced from raw text: the *spaced* form (lowercase,
//! diacritics folded, whitespace runs collapsed to one space) and the
//! *compact* form (the spaced form with every non-alphanumeric character
//! removed). Compact text backs substring checks; spaced text backs the
//! positional regex checks.

use unicode_normalization::UnicodeNormalization;
use unicode_normalization::char::is_combining_mark;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedText {
    pub spaced: String,
    pub compact: String,
}

#[must_use]
pub fn normalize(raw: &str) -> NormalizedText {
    let spaced = spaced(raw);
    let compact = compact(&spaced);
    NormalizedText { spaced, compact }
}

/// Lowercase, fold diacritics ("ö" -> "o") and collapse whitespace.
#[must_use]
pub fn spaced(raw: &str) -> String {
    let folded: String = raw
        .to_lowercase()
        .nfd()
        .filter(|c| !is_combining_mark(*c))
        .collect();
    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Keep only letters and digits.
#[must_use]
pub fn compact(text: &str) -> String {
    text.chars().filter(|c| c.is_alphanumeric()).collect()
}
