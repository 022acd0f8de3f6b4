//! Palm oil detection over free-text ingredient lists.
//!
//! Classification runs three passes over the normalized text, first match wins:
//!
//! 1. ignore phrases ("hearts of palm", "coconut", ...) are located and masked;
//! 2. the compact form of the masked text is searched for a known palm
//!    variant (canonical names, misspellings, translations);
//! 3. failing that, a context pattern looks for an oil/fat keyword followed by
//!    a bracketed "palm" within a bounded window.
//!
//! Masking keeps one space per masked character, so the positional context
//! pattern still sees the original layout.

use std::ops::Range;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::normalize;

/// Bumped whenever any of the tables below change. Recorded next to the
/// dataset version so past classifications can be reproduced.
pub const PHRASE_TABLE_VERSION: i64 = 1;

/// Tag added at ingest time to products detected from their ingredient text.
pub const DETECTED_TAG: &str = "detected-palm-oil";

/// Maximum distance, in characters, between a context keyword and the
/// opening bracket that precedes "palm".
pub const CONTEXT_WINDOW: usize = 100;

pub const IGNORE_PHRASES: &[&str] = &[
    "hearts of palm",
    "palm sugar",
    "coconut",
    "palmitic acid",
    "palmesukker",
    "coeurs de palmiers",
    "palmito",
    "palmeherz",
];

pub const PALM_VARIANTS: &[&str] = &[
    "palm oil",
    "palm fat",
    "palm kernel",
    "palmitate",
    "elaeis guineensis",
    "sustainable palm",
    "huile de palme",
    "graisse de palme",
    "palmfett",
    "palmolie",
    "ölpalme",
    "palmkerne",
    "palmkern",
    "palm- und",
    "palm und",
    "huile de palmiste",
    "huile palme",
    "palm õil",
    "grăsime palmier",
    "palmöl",
    "palmekjerne",
    "fat palm",
    "fats palm",
    "oil palm",
    "palm oll",
    "palm ol",
    "palm oi",
    "palm 0i",
    "palm lemal oll",
    "vegetable palm",
    "olio di palma",
    "palm and rapeseed",
    "palm & rapeseed",
    "palm and/or",
    "palm and or",
    "palm & or",
];

pub const CONTEXT_KEYWORDS: &[&str] = &[
    "vegetable",
    "vegtable",
    "végétal",
    "margarine",
    "fette",
    "fetter",
    "graisse",
    "fat",
    "oil",
    "oils",
    "vegetabte",
];

static BUILTIN: LazyLock<Classifier> = LazyLock::new(|| {
    Classifier::with_tables(IGNORE_PHRASES, PALM_VARIANTS, CONTEXT_KEYWORDS)
        .expect("built-in phrase tables are valid")
});

/// Which pass produced a positive detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchPass {
    Variant,
    Context,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Detection {
    pub pass: Option<MatchPass>,
    /// The variant phrase that matched, for diagnostics.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phrase: Option<String>,
}

impl Detection {
    fn none() -> Self {
        Self {
            pass: None,
            phrase: None,
        }
    }

    #[must_use]
    pub fn detected(&self) -> bool {
        self.pass.is_some()
    }
}

/// Spaced ingredient text with ignore phrases blanked out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaskedText {
    text: String,
    masked: Vec<Range<usize>>,
}

impl MaskedText {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Byte ranges of the masked regions, sorted and non-overlapping.
    #[must_use]
    pub fn masked_spans(&self) -> &[Range<usize>] {
        &self.masked
    }

    /// Compact form of the whole masked text. Blanked regions vanish, so the
    /// words on either side of one become adjacent.
    #[must_use]
    pub fn compact(&self) -> String {
        normalize::compact(&self.text)
    }
}

#[derive(Debug, Clone)]
pub struct Classifier {
    ignore: Vec<Regex>,
    /// (original phrase, compact form)
    variants: Vec<(String, String)>,
    context: Regex,
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Classifier {
    /// Classifier over the built-in phrase tables.
    #[must_use]
    pub fn new() -> Self {
        BUILTIN.clone()
    }

    pub fn with_tables(
        ignore_phrases: &[&str],
        variants: &[&str],
        context_keywords: &[&str],
    ) -> Result<Self, regex::Error> {
        let ignore = ignore_phrases
            .iter()
            .map(|phrase| {
                let pattern = normalize::spaced(phrase)
                    .split(' ')
                    .map(regex::escape)
                    .collect::<Vec<_>>()
                    .join(r"[^\p{L}\p{N}]+");
                Regex::new(&pattern)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let variants = variants
            .iter()
            .map(|v| ((*v).to_string(), normalize::compact(&normalize::spaced(v))))
            .filter(|(_, compact)| !compact.is_empty())
            .collect();

        let keywords = context_keywords
            .iter()
            .map(|k| regex::escape(&normalize::spaced(k)))
            .collect::<Vec<_>>()
            .join("|");
        let context = Regex::new(&format!(
            r"(?i)(?:{keywords}).{{0,{CONTEXT_WINDOW}}}[:(\[][^)\]]*palm"
        ))?;

        Ok(Self {
            ignore,
            variants,
            context,
        })
    }

    /// Classify one ingredient list. Absent or blank text is never detected.
    #[must_use]
    pub fn classify(&self, ingredients: Option<&str>) -> Detection {
        let Some(raw) = ingredients.filter(|s| !s.trim().is_empty()) else {
            return Detection::none();
        };

        let masked = self.mask_ignored(&normalize::spaced(raw));

        if let Some(phrase) = self.match_variant(&masked) {
            return Detection {
                pass: Some(MatchPass::Variant),
                phrase: Some(phrase.to_string()),
            };
        }

        if self.match_context(&masked) {
            return Detection {
                pass: Some(MatchPass::Context),
                phrase: None,
            };
        }

        Detection::none()
    }

    #[must_use]
    pub fn detects(&self, ingredients: Option<&str>) -> bool {
        self.classify(ingredients).detected()
    }

    /// Exclusion pass. Every ignore phrase is matched against the unmodified
    /// input, so phrases never enable or disable each other; overlapping hits
    /// are merged and each character is blanked once.
    #[must_use]
    pub fn mask_ignored(&self, spaced: &str) -> MaskedText {
        let mut hits: Vec<Range<usize>> = self
            .ignore
            .iter()
            .flat_map(|re| re.find_iter(spaced).map(|m| m.range()))
            .collect();
        hits.sort_by_key(|r| r.start);

        let mut merged: Vec<Range<usize>> = Vec::with_capacity(hits.len());
        for hit in hits {
            match merged.last_mut() {
                Some(last) if hit.start <= last.end => last.end = last.end.max(hit.end),
                _ => merged.push(hit),
            }
        }

        // Rebuild with one space per masked char; spans are re-expressed in
        // output byte offsets since multi-byte chars shrink to one byte.
        let mut text = String::with_capacity(spaced.len());
        let mut masked = Vec::with_capacity(merged.len());
        let mut pending = merged.iter().peekable();
        let mut open: Option<usize> = None;

        for (idx, c) in spaced.char_indices() {
            while pending.peek().is_some_and(|r| idx >= r.end) {
                pending.next();
                if let Some(start) = open.take() {
                    masked.push(start..text.len());
                }
            }
            let inside = pending.peek().is_some_and(|r| idx >= r.start);
            if inside {
                if open.is_none() {
                    open = Some(text.len());
                }
                text.push(' ');
            } else {
                if let Some(start) = open.take() {
                    masked.push(start..text.len());
                }
                text.push(c);
            }
        }
        if let Some(start) = open {
            masked.push(start..text.len());
        }

        MaskedText { text, masked }
    }

    /// Known-variant pass: returns the first table phrase found.
    #[must_use]
    pub fn match_variant(&self, masked: &MaskedText) -> Option<&str> {
        let text = masked.compact();
        self.variants
            .iter()
            .find(|(_, compact)| text.contains(compact.as_str()))
            .map(|(phrase, _)| phrase.as_str())
    }

    /// Context pass over the spaced, masked text.
    #[must_use]
    pub fn match_context(&self, masked: &MaskedText) -> bool {
        self.context.is_match(masked.as_str())
    }
}
