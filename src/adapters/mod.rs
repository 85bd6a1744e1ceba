//! Source adapters and the ordered fallback chain.
//!
//! Every external data source sits behind the [`SourceAdapter`] trait. The
//! worker walks an [`AdapterChain`] in registration order:
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌────────────────┐
//! │ primary_api  │──▶│ web_fallback │──▶│ local_synthesis │
//! │ JSON + token │   │ HTML scrape  │   │ placeholder     │
//! └──────────────┘   └──────────────┘   └────────────────┘
//! ```
//!
//! Adapters never see each other's results directly; they only get the
//! merged partial record. Timeouts are enforced here by [`attempt`], retries
//! by the worker.

pub mod primary_api;
pub mod synthesis;
pub mod web_fallback;

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::credentials::CredentialProvider;
use crate::error::SourceError;
use crate::models::{Completeness, CollectionRecord, FieldValue, ParcelKey, SourceResult};

pub use primary_api::PrimaryApiAdapter;
pub use synthesis::LocalSynthesisAdapter;
pub use web_fallback::{LabelValueExtractor, PageExtractor, WebFallbackAdapter};

/// Fields returned by a successful fetch.
#[derive(Debug, Clone, Default)]
pub struct Fetched {
    pub fields: BTreeMap<String, FieldValue>,
    /// Set when the source is known to have returned only part of the record.
    pub partial: bool,
}

impl Fetched {
    pub fn complete(fields: BTreeMap<String, FieldValue>) -> Self {
        Self {
            fields,
            partial: false,
        }
    }

    pub fn partial(fields: BTreeMap<String, FieldValue>) -> Self {
        Self {
            fields,
            partial: true,
        }
    }
}

/// A pluggable strategy for obtaining parcel data.
///
/// # Example
///
/// ```rust
/// use async_trait::async_trait;
/// use parcel_harvest::adapters::{Fetched, SourceAdapter};
/// use parcel_harvest::error::SourceError;
/// use parcel_harvest::models::{CollectionRecord, FieldValue, ParcelKey};
/// use std::collections::BTreeMap;
/// use std::time::Duration;
///
/// struct CountyMirror;
///
/// #[async_trait]
/// impl SourceAdapter for CountyMirror {
///     fn name(&self) -> &str { "county_mirror" }
///     fn description(&self) -> &str { "Nightly county data mirror" }
///     fn timeout(&self) -> Duration { Duration::from_secs(5) }
///
///     async fn fetch(
///         &self,
///         key: &ParcelKey,
///         _partial: &CollectionRecord,
///     ) -> Result<Fetched, SourceError> {
///         let mut fields = BTreeMap::new();
///         fields.insert("apn".to_string(), FieldValue::new(key.normalized_value()));
///         Ok(Fetched::partial(fields))
///     }
/// }
/// ```
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Short identifier recorded in `sources_attempted` (e.g. `"primary_api"`).
    fn name(&self) -> &str;

    /// One-line description for `parcel sources`.
    fn description(&self) -> &str;

    /// Upper bound for a single fetch.
    fn timeout(&self) -> Duration;

    /// The stage only runs while the record is below this level.
    ///
    /// Real sources keep the default so the chain stops once a record is
    /// complete. Degraded-mode sources return a lower level.
    fn runs_below(&self) -> Completeness {
        Completeness::Complete
    }

    /// Local adapters make no network calls. They still run after the job
    /// deadline has passed, bounded by their own timeout.
    fn is_local(&self) -> bool {
        false
    }

    /// Fetch whatever the source knows about `key`.
    ///
    /// `partial` is the record merged so far (possibly seeded from a stale
    /// cache entry); adapters may use it to skip work but must not assume
    /// any other adapter has or has not run.
    async fn fetch(
        &self,
        key: &ParcelKey,
        partial: &CollectionRecord,
    ) -> Result<Fetched, SourceError>;
}

/// One adapter attempt with its classified error, if any.
#[derive(Debug, Clone)]
pub struct AttemptOutcome {
    pub result: SourceResult,
    pub error: Option<SourceError>,
}

impl AttemptOutcome {
    pub fn is_transient_failure(&self) -> bool {
        self.error.as_ref().is_some_and(SourceError::is_transient)
    }
}

/// Runs `adapter.fetch` raced against `timeout`.
///
/// Always returns within the timeout (plus scheduling slack). Errors are
/// folded into the [`SourceResult`] so a failing adapter never aborts the
/// chain.
pub async fn attempt(
    adapter: &dyn SourceAdapter,
    key: &ParcelKey,
    partial: &CollectionRecord,
    timeout: Duration,
) -> AttemptOutcome {
    let started = Instant::now();
    let outcome = tokio::time::timeout(timeout, adapter.fetch(key, partial)).await;
    let elapsed_ms = started.elapsed().as_millis() as u64;

    match outcome {
        Ok(Ok(fetched)) => AttemptOutcome {
            result: SourceResult::success(adapter.name(), fetched.fields, fetched.partial, elapsed_ms),
            error: None,
        },
        Ok(Err(err)) => AttemptOutcome {
            result: SourceResult::failure(adapter.name(), err.to_string(), elapsed_ms),
            error: Some(err),
        },
        Err(_) => {
            let err = SourceError::Timeout(timeout);
            AttemptOutcome {
                result: SourceResult::timeout(adapter.name(), err.to_string(), elapsed_ms),
                error: Some(err),
            }
        }
    }
}

/// Ordered list of adapters. Registration order is execution order.
#[derive(Clone, Default)]
pub struct AdapterChain {
    adapters: Vec<Arc<dyn SourceAdapter>>,
}

impl AdapterChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the standard chain from config: primary API, web fallback,
    /// then local synthesis. Disabled sources are left out entirely; local
    /// synthesis is always present.
    pub fn from_config(config: &Config, credentials: Arc<dyn CredentialProvider>) -> anyhow::Result<Self> {
        let mut chain = Self::new();
        let adapters = &config.adapters;
        if adapters.primary_api.enabled {
            chain.register(Arc::new(PrimaryApiAdapter::new(
                &adapters.primary_api,
                credentials,
            )?));
        }
        if adapters.web_fallback.enabled {
            chain.register(Arc::new(WebFallbackAdapter::new(&adapters.web_fallback)?));
        }
        chain.register(Arc::new(LocalSynthesisAdapter::new(Duration::from_millis(
            adapters.synthesis.timeout_ms,
        ))));
        Ok(chain)
    }

    pub fn register(&mut self, adapter: Arc<dyn SourceAdapter>) {
        self.adapters.push(adapter);
    }

    pub fn adapters(&self) -> &[Arc<dyn SourceAdapter>] {
        &self.adapters
    }

    pub fn names(&self) -> Vec<String> {
        self.adapters.iter().map(|a| a.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

/// Maps a source-specific label onto a canonical field name.
///
/// Matching ignores case, spaces, underscores, dashes and a trailing colon,
/// so `"Owner Name:"`, `"ownerName"` and `"owner_name"` all resolve alike.
pub(crate) fn canonical_field(label: &str) -> Option<&'static str> {
    use crate::models::fields::*;

    let squashed: String = label
        .trim()
        .trim_end_matches(':')
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect();
    let field = match squashed.as_str() {
        "apn" | "parcel" | "parcelnumber" | "parcelid" => APN,
        "owner" | "ownername" | "owner1" => OWNER,
        "situsaddress" | "propertyaddress" | "address" | "situs" => SITUS_ADDRESS,
        "assessedvalue" | "fullcashvalue" | "fcv" | "totalvalue" => ASSESSED_VALUE,
        "landvalue" => LAND_VALUE,
        "improvementvalue" | "improvements" => IMPROVEMENT_VALUE,
        "taxamount" | "taxes" | "annualtax" => TAX_AMOUNT,
        "yearbuilt" | "constructionyear" => YEAR_BUILT,
        "landuse" | "usecode" | "propertyuse" => LAND_USE,
        "lotsize" | "lotsizesqft" | "lotsqft" | "lotarea" => LOT_SIZE_SQFT,
        "saledate" | "lastsaledate" => LAST_SALE_DATE,
        "saleprice" | "lastsaleprice" => LAST_SALE_PRICE,
        _ => return None,
    };
    Some(field)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{KeyKind, SourceStatus};
    use chrono::Utc;

    struct Sleepy(Duration);

    #[async_trait]
    impl SourceAdapter for Sleepy {
        fn name(&self) -> &str {
            "sleepy"
        }
        fn description(&self) -> &str {
            "sleeps before answering"
        }
        fn timeout(&self) -> Duration {
            Duration::from_millis(20)
        }
        async fn fetch(
            &self,
            _key: &ParcelKey,
            _partial: &CollectionRecord,
        ) -> Result<Fetched, SourceError> {
            tokio::time::sleep(self.0).await;
            Ok(Fetched::default())
        }
    }

    fn key() -> ParcelKey {
        ParcelKey::from_parts(KeyKind::Apn, "50138237", "50138237")
    }

    #[tokio::test]
    async fn attempt_times_out_instead_of_blocking() {
        let adapter = Sleepy(Duration::from_secs(30));
        let record = CollectionRecord::new(key(), Utc::now());
        let started = Instant::now();
        let outcome = attempt(&adapter, &key(), &record, Duration::from_millis(20)).await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(outcome.result.status, SourceStatus::Timeout);
        assert!(outcome.result.fields.is_empty());
        assert!(outcome.is_transient_failure());
    }

    #[tokio::test]
    async fn attempt_reports_success() {
        let adapter = Sleepy(Duration::from_millis(1));
        let record = CollectionRecord::new(key(), Utc::now());
        let outcome = attempt(&adapter, &key(), &record, Duration::from_secs(5)).await;
        assert_eq!(outcome.result.status, SourceStatus::Success);
        assert!(outcome.error.is_none());
    }

    #[test]
    fn canonical_field_names() {
        assert_eq!(canonical_field("Owner Name:"), Some("owner"));
        assert_eq!(canonical_field("ownerName"), Some("owner"));
        assert_eq!(canonical_field("Year Built"), Some("year_built"));
        assert_eq!(canonical_field("Full Cash Value"), Some("assessed_value"));
        assert_eq!(canonical_field("Subdivision"), None);
    }
}
