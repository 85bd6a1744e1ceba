//! Core data models used throughout parcel-harvest.
//!
//! These types represent the search keys, per-source results, and merged
//! parcel records that flow through the collection pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

/// Canonical field names tracked for completeness scoring.
///
/// Adapters map source-specific labels (`"ownerName"`, `"Year Built"`, ...)
/// onto these names before returning fields.
pub mod fields {
    pub const APN: &str = "apn";
    pub const OWNER: &str = "owner";
    pub const SITUS_ADDRESS: &str = "situs_address";

    pub const ASSESSED_VALUE: &str = "assessed_value";
    pub const LAND_VALUE: &str = "land_value";
    pub const IMPROVEMENT_VALUE: &str = "improvement_value";
    pub const TAX_AMOUNT: &str = "tax_amount";
    pub const YEAR_BUILT: &str = "year_built";
    pub const LAND_USE: &str = "land_use";
    pub const LOT_SIZE_SQFT: &str = "lot_size_sqft";

    pub const LAST_SALE_DATE: &str = "last_sale_date";
    pub const LAST_SALE_PRICE: &str = "last_sale_price";

    /// Untracked markers set by the synthesis adapter.
    pub const DATA_QUALITY: &str = "data_quality";
    pub const PLACEHOLDER_ID: &str = "placeholder_id";
    pub const MARKERS: &[&str] = &[DATA_QUALITY, PLACEHOLDER_ID];

    pub const IDENTITY: &[&str] = &[APN, OWNER, SITUS_ADDRESS];
    pub const VALUATION: &[&str] = &[
        ASSESSED_VALUE,
        LAND_VALUE,
        IMPROVEMENT_VALUE,
        TAX_AMOUNT,
        YEAR_BUILT,
        LAND_USE,
        LOT_SIZE_SQFT,
    ];
    pub const SALES: &[&str] = &[LAST_SALE_DATE, LAST_SALE_PRICE];

    /// Every field that counts towards completeness.
    pub fn tracked() -> impl Iterator<Item = &'static str> {
        IDENTITY
            .iter()
            .chain(VALUATION.iter())
            .chain(SALES.iter())
            .copied()
    }

    pub fn is_tracked(name: &str) -> bool {
        tracked().any(|f| f == name)
    }
}

/// What kind of identifier a search key is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyKind {
    Apn,
    Address,
    OwnerName,
}

impl KeyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyKind::Apn => "apn",
            KeyKind::Address => "address",
            KeyKind::OwnerName => "owner",
        }
    }
}

impl fmt::Display for KeyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for KeyKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "apn" | "parcel" => Ok(KeyKind::Apn),
            "address" | "addr" => Ok(KeyKind::Address),
            "owner" | "owner_name" | "name" => Ok(KeyKind::OwnerName),
            other => Err(format!(
                "unknown key kind '{}'. Must be apn, address, or owner.",
                other
            )),
        }
    }
}

/// Canonical identifier for a collection target.
///
/// Built once by [`crate::normalize::normalize`] and immutable afterwards.
/// Equality and hashing only consider `(kind, normalized_value)`, so two raw
/// inputs that normalize the same way are the same collection target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParcelKey {
    kind: KeyKind,
    normalized_value: String,
    raw_value: String,
}

impl ParcelKey {
    pub(crate) fn from_parts(
        kind: KeyKind,
        normalized_value: impl Into<String>,
        raw_value: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            normalized_value: normalized_value.into(),
            raw_value: raw_value.into(),
        }
    }

    pub fn kind(&self) -> KeyKind {
        self.kind
    }

    pub fn normalized_value(&self) -> &str {
        &self.normalized_value
    }

    /// The input exactly as the caller supplied it.
    pub fn raw_value(&self) -> &str {
        &self.raw_value
    }
}

impl PartialEq for ParcelKey {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.normalized_value == other.normalized_value
    }
}

impl Eq for ParcelKey {}

impl Hash for ParcelKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.kind.hash(state);
        self.normalized_value.hash(state);
    }
}

impl fmt::Display for ParcelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.normalized_value)
    }
}

/// Scheduling priority. Declaration order gives `Low < Normal < High < Critical`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Critical => "critical",
        };
        f.pad(s)
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "critical" => Ok(Priority::Critical),
            other => Err(format!(
                "unknown priority '{}'. Must be low, normal, high, or critical.",
                other
            )),
        }
    }
}

/// Outcome class of a single adapter attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    Success,
    PartialSuccess,
    Failure,
    Timeout,
}

impl SourceStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, SourceStatus::Success | SourceStatus::PartialSuccess)
    }
}

impl fmt::Display for SourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SourceStatus::Success => "success",
            SourceStatus::PartialSuccess => "partial",
            SourceStatus::Failure => "failure",
            SourceStatus::Timeout => "timeout",
        };
        f.pad(s)
    }
}

/// A single value produced by an adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldValue {
    pub value: Value,
    /// Low-confidence values may be replaced by a later, verified source.
    #[serde(default)]
    pub low_confidence: bool,
}

impl FieldValue {
    pub fn new(value: impl Into<Value>) -> Self {
        Self {
            value: value.into(),
            low_confidence: false,
        }
    }

    pub fn low_confidence(value: impl Into<Value>) -> Self {
        Self {
            value: value.into(),
            low_confidence: true,
        }
    }
}

/// The output of one adapter attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceResult {
    pub source_name: String,
    pub status: SourceStatus,
    /// Always empty unless `status` is a success variant.
    pub fields: BTreeMap<String, FieldValue>,
    pub error_detail: Option<String>,
    pub elapsed_ms: u64,
    /// Number of tries spent on this stage, including retries.
    #[serde(default = "default_attempts")]
    pub attempts: u32,
}

fn default_attempts() -> u32 {
    1
}

impl SourceResult {
    pub fn success(
        source_name: impl Into<String>,
        fields: BTreeMap<String, FieldValue>,
        partial: bool,
        elapsed_ms: u64,
    ) -> Self {
        Self {
            source_name: source_name.into(),
            status: if partial {
                SourceStatus::PartialSuccess
            } else {
                SourceStatus::Success
            },
            fields,
            error_detail: None,
            elapsed_ms,
            attempts: 1,
        }
    }

    pub fn failure(source_name: impl Into<String>, detail: impl Into<String>, elapsed_ms: u64) -> Self {
        Self {
            source_name: source_name.into(),
            status: SourceStatus::Failure,
            fields: BTreeMap::new(),
            error_detail: Some(detail.into()),
            elapsed_ms,
            attempts: 1,
        }
    }

    pub fn timeout(source_name: impl Into<String>, detail: impl Into<String>, elapsed_ms: u64) -> Self {
        Self {
            status: SourceStatus::Timeout,
            ..Self::failure(source_name, detail, elapsed_ms)
        }
    }
}

/// Coarse ordinal measure of how much of a record is populated.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Completeness {
    #[default]
    None,
    Basic,
    Detailed,
    Complete,
}

impl Completeness {
    /// Scores a field map.
    ///
    /// No tracked field is `None`, every tracked field is `Complete`, an
    /// identity field plus a valuation/tax field is `Detailed`, anything
    /// else is `Basic`.
    pub fn assess<'a, I>(present: I) -> Completeness
    where
        I: IntoIterator<Item = &'a str>,
    {
        let present: Vec<&str> = present
            .into_iter()
            .filter(|name| fields::is_tracked(name))
            .collect();
        if present.is_empty() {
            return Completeness::None;
        }
        if fields::tracked().all(|f| present.contains(&f)) {
            return Completeness::Complete;
        }
        let has_identity = fields::IDENTITY.iter().any(|f| present.contains(f));
        let has_valuation = fields::VALUATION.iter().any(|f| present.contains(f));
        if has_identity && has_valuation {
            Completeness::Detailed
        } else {
            Completeness::Basic
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Completeness::None => "none",
            Completeness::Basic => "basic",
            Completeness::Detailed => "detailed",
            Completeness::Complete => "complete",
        }
    }
}

impl fmt::Display for Completeness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for Completeness {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "none" => Ok(Completeness::None),
            "basic" => Ok(Completeness::Basic),
            "detailed" => Ok(Completeness::Detailed),
            "complete" => Ok(Completeness::Complete),
            other => Err(format!("unknown completeness '{}'", other)),
        }
    }
}

/// A field in the merged record, remembering which source supplied it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedField {
    pub value: Value,
    pub source: String,
    #[serde(default)]
    pub low_confidence: bool,
    /// Copied from an earlier collection and not confirmed by this one.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub carried_over: bool,
}

impl MergedField {
    fn verified(&self) -> bool {
        !self.low_confidence && !self.carried_over
    }
}

/// Accumulated view of one parcel across all sources.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionRecord {
    pub key: ParcelKey,
    pub fields: BTreeMap<String, MergedField>,
    pub completeness: Completeness,
    pub sources_attempted: Vec<SourceResult>,
    pub last_updated: DateTime<Utc>,
}

impl CollectionRecord {
    pub fn new(key: ParcelKey, now: DateTime<Utc>) -> Self {
        Self {
            key,
            fields: BTreeMap::new(),
            completeness: Completeness::None,
            sources_attempted: Vec::new(),
            last_updated: now,
        }
    }

    /// Starts a fresh record from an older snapshot of the same parcel.
    ///
    /// Every value is marked `carried_over`, so any source in the new run can
    /// replace it. The old completeness is kept as the floor.
    pub fn seeded(key: ParcelKey, previous: &CollectionRecord, now: DateTime<Utc>) -> Self {
        let fields: BTreeMap<String, MergedField> = previous
            .fields
            .iter()
            .map(|(name, field)| {
                (
                    name.clone(),
                    MergedField {
                        carried_over: true,
                        ..field.clone()
                    },
                )
            })
            .collect();
        let completeness = Completeness::assess(fields.keys().map(String::as_str));
        Self {
            key,
            fields,
            completeness,
            sources_attempted: Vec::new(),
            last_updated: now,
        }
    }

    /// Folds one adapter result into the record and appends it to
    /// `sources_attempted`. Returns how many fields were written.
    ///
    /// The first successful source wins per field. A populated field is only
    /// replaced when it was carried over from an earlier collection, or when
    /// it is low confidence and the incoming value is not. Once a verified
    /// tracked value lands, the synthesis markers are dropped. Completeness
    /// never decreases.
    pub fn merge(&mut self, result: SourceResult, now: DateTime<Utc>) -> usize {
        let mut written = 0;
        if result.status.is_success() {
            let mut verified_tracked = false;
            for (name, incoming) in &result.fields {
                let replace = match self.fields.get(name) {
                    None => true,
                    Some(existing) => {
                        existing.carried_over
                            || (existing.low_confidence && !incoming.low_confidence)
                    }
                };
                if replace {
                    self.fields.insert(
                        name.clone(),
                        MergedField {
                            value: incoming.value.clone(),
                            source: result.source_name.clone(),
                            low_confidence: incoming.low_confidence,
                            carried_over: false,
                        },
                    );
                    written += 1;
                    verified_tracked |= !incoming.low_confidence && fields::is_tracked(name);
                }
            }
            if verified_tracked {
                for marker in fields::MARKERS {
                    self.fields.remove(*marker);
                }
            }
            let assessed = Completeness::assess(self.fields.keys().map(String::as_str));
            self.completeness = self.completeness.max(assessed);
        }
        self.sources_attempted.push(result);
        self.last_updated = now;
        written
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name).map(|f| &f.value)
    }

    /// Completeness counting only values a source confirmed in this
    /// collection. Stale and synthesized values do not count.
    pub fn verified_completeness(&self) -> Completeness {
        Completeness::assess(
            self.fields
                .iter()
                .filter(|(_, f)| f.verified())
                .map(|(name, _)| name.as_str()),
        )
    }

    /// True when no field ever came from a verified source.
    pub fn is_placeholder(&self) -> bool {
        self.fields.values().all(|f| f.low_confidence)
    }

    /// Tracked fields still missing.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        fields::tracked()
            .filter(|f| !self.fields.contains_key(*f))
            .collect()
    }
}
