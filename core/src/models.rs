use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Result, bail};
use serde::de::{DeserializeOwned, Deserializer};
use serde::{Deserialize, Serialize};

use crate::classifier::{Classifier, DETECTED_TAG, Detection};
use crate::openfoodfacts::image_url_for_code;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub code: String,
    pub name: Option<String>,
    pub ingredients: Option<String>,
    #[serde(default)]
    pub palm_oil_tags: BTreeSet<String>,
    #[serde(default)]
    pub palm_oil_may_be_tags: BTreeSet<String>,
    pub image_url: Option<String>,
    pub nutriscore_grade: Option<String>,
    pub nova_group: Option<i64>,
    #[serde(default)]
    pub nutrient_levels: BTreeMap<String, String>,
    #[serde(default)]
    pub additives_tags: BTreeSet<String>,
    /// Epoch milliseconds; 0 means never synced.
    #[serde(default)]
    pub last_updated: i64,
}

impl Product {
    /// Derived palm oil status.
    ///
    /// Explicit confirmed tags win; otherwise the ingredient text is classified
    /// before falling back to "may contain" tags. Ingest-time tagging runs the
    /// same classifier, so precomputed and lazy results agree.
    #[must_use]
    pub fn classification(&self, classifier: &Classifier) -> Classification {
        if !self.palm_oil_tags.is_empty() {
            return Classification::Confirmed;
        }
        if classifier.detects(self.ingredients.as_deref()) {
            return Classification::Confirmed;
        }
        if !self.palm_oil_may_be_tags.is_empty() {
            return Classification::Possible;
        }
        Classification::None
    }

    /// Whether there is anything to classify from: a tag of either kind or
    /// ingredient text. Without it the status is unknown, not negative.
    #[must_use]
    pub fn has_palm_evidence(&self) -> bool {
        !self.palm_oil_tags.is_empty()
            || !self.palm_oil_may_be_tags.is_empty()
            || self.ingredients.as_deref().is_some_and(|i| !i.trim().is_empty())
    }

    /// Ingest-time tagging. Adds [`DETECTED_TAG`] when the ingredient text is
    /// detected and no confirmed tag exists yet; returns whether it did.
    pub fn apply_detected_tag(&mut self, classifier: &Classifier) -> bool {
        if !self.palm_oil_tags.is_empty() || !classifier.detects(self.ingredients.as_deref()) {
            return false;
        }
        self.palm_oil_tags.insert(DETECTED_TAG.to_string());
        true
    }

    #[must_use]
    pub fn display_image_url(&self) -> Option<String> {
        self.image_url
            .clone()
            .or_else(|| image_url_for_code(&self.code))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Confirmed,
    Possible,
    None,
}

impl Classification {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Confirmed => "confirmed",
            Self::Possible => "possible",
            Self::None => "none",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "confirmed" => Some(Self::Confirmed),
            "possible" => Some(Self::Possible),
            "none" => Some(Self::None),
            _ => None,
        }
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Confirmed => "Contains Palm Oil",
            Self::Possible => "May Contain Palm Oil",
            Self::None => "No Palm Oil Detected",
        }
    }
}

/// One line of the bulk dataset. Keys are abbreviated on the wire; the long
/// names are accepted as aliases.
#[derive(Debug, Clone, Deserialize)]
pub struct ProductRecord {
    #[serde(rename = "c", alias = "code")]
    pub code: String,
    #[serde(rename = "n", alias = "name", alias = "product_name", default)]
    pub name: Option<String>,
    #[serde(
        rename = "i",
        alias = "ingredients",
        alias = "ingredients_text",
        default
    )]
    pub ingredients: Option<String>,
    #[serde(
        rename = "pt",
        alias = "palm_oil_tags",
        default,
        deserialize_with = "embedded_json"
    )]
    pub palm_oil_tags: BTreeSet<String>,
    #[serde(
        rename = "pmt",
        alias = "palm_oil_may_be_tags",
        default,
        deserialize_with = "embedded_json"
    )]
    pub palm_oil_may_be_tags: BTreeSet<String>,
    #[serde(rename = "img", alias = "image_url", default)]
    pub image_url: Option<String>,
    #[serde(rename = "ns", alias = "nutriscore_grade", default)]
    pub nutriscore_grade: Option<String>,
    #[serde(
        rename = "ng",
        alias = "nova_group",
        default,
        deserialize_with = "lenient_int"
    )]
    pub nova_group: Option<i64>,
    #[serde(
        rename = "nl",
        alias = "nutrient_levels",
        default,
        deserialize_with = "embedded_json"
    )]
    pub nutrient_levels: BTreeMap<String, String>,
    #[serde(
        rename = "at",
        alias = "additives_tags",
        default,
        deserialize_with = "embedded_json"
    )]
    pub additives_tags: BTreeSet<String>,
    #[serde(
        rename = "l",
        alias = "last_updated",
        default,
        deserialize_with = "lenient_int"
    )]
    pub last_updated: Option<i64>,
}

impl From<ProductRecord> for Product {
    fn from(r: ProductRecord) -> Self {
        Product {
            code: r.code.trim().to_string(),
            name: non_empty(r.name),
            ingredients: non_empty(r.ingredients),
            palm_oil_tags: r.palm_oil_tags,
            palm_oil_may_be_tags: r.palm_oil_may_be_tags,
            image_url: non_empty(r.image_url),
            nutriscore_grade: normalize_grade(r.nutriscore_grade),
            nova_group: r.nova_group,
            nutrient_levels: r.nutrient_levels,
            additives_tags: r.additives_tags,
            last_updated: r.last_updated.unwrap_or(0),
        }
    }
}

pub(crate) fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// "A" -> "a"; placeholder grades ("unknown", "not-applicable") become absent.
pub(crate) fn normalize_grade(grade: Option<String>) -> Option<String> {
    let grade = grade?.trim().to_lowercase();
    match grade.as_str() {
        "" | "unknown" | "not-applicable" => None,
        _ => Some(grade),
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Embedded<T> {
    Value(T),
    Encoded(String),
}

/// Accepts either a JSON value or a string holding serialized JSON. The
/// republished dataset stores tag sets pre-serialized.
fn embedded_json<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + Default,
{
    match Option::<Embedded<T>>::deserialize(deserializer)? {
        None => Ok(T::default()),
        Some(Embedded::Value(v)) => Ok(v),
        Some(Embedded::Encoded(s)) if s.trim().is_empty() => Ok(T::default()),
        Some(Embedded::Encoded(s)) => serde_json::from_str(&s).map_err(serde::de::Error::custom),
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum IntOrString {
    Int(i64),
    Str(String),
}

fn lenient_int<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<IntOrString>::deserialize(deserializer)? {
        None => Ok(None),
        Some(IntOrString::Int(n)) => Ok(Some(n)),
        Some(IntOrString::Str(s)) if s.trim().is_empty() => Ok(None),
        Some(IntOrString::Str(s)) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

pub fn validate_product(p: &Product) -> Result<()> {
    if p.code.is_empty() {
        bail!("code must not be empty");
    }
    if !p.code.bytes().all(|b| b.is_ascii_digit()) {
        bail!("code '{}' must contain only digits", p.code);
    }
    if let Some(grade) = &p.nutriscore_grade {
        if !matches!(grade.as_str(), "a" | "b" | "c" | "d" | "e") {
            bail!("nutrition grade '{grade}' must be a single letter a-e");
        }
    }
    if let Some(nova) = p.nova_group {
        if !(1..=4).contains(&nova) {
            bail!("processing level {nova} must be between 1 and 4");
        }
    }
    if p.last_updated < 0 {
        bail!("last_updated must not be negative");
    }
    Ok(())
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub product_count: i64,
    /// Newest record timestamp in the table, epoch ms.
    pub last_updated: Option<i64>,
    /// Dataset generation currently applied.
    pub version_marker: Option<i64>,
    /// Classifier table version the current generation was tagged with.
    pub phrase_table_version: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanEntry {
    pub code: String,
    pub scanned_at: i64,
    pub found: bool,
    pub product_name: Option<String>,
    pub status: Option<Classification>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LookupSource {
    Local,
    Remote,
    NotFound,
}

#[derive(Debug, Clone, Serialize)]
pub struct LookupResult {
    pub code: String,
    pub source: LookupSource,
    pub product: Option<Product>,
    pub classification: Option<Classification>,
    /// Set when the classification came from the ingredient text rather
    /// than from tags.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detection: Option<Detection>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub version: i64,
    pub previous_version: Option<i64>,
    pub imported: u64,
    pub skipped: u64,
    /// Records tagged by the classifier during ingest.
    pub tagged: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SyncOutcome {
    UpToDate { version: i64 },
    Updated(SyncReport),
}
