//! Web portal fallback adapter.
//!
//! Fetches the public assessor search page and scrapes the detail table.
//! Slower than the API and only ever partial, but it needs no credential.
//!
//! Request: `GET {base_url}/search?type=<apn|address|owner>&q=<value>`.
//! Page parsing lives behind [`PageExtractor`] so a portal redesign only
//! needs a new extractor.

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use super::{canonical_field, Fetched, SourceAdapter};
use crate::config::WebFallbackConfig;
use crate::error::SourceError;
use crate::models::{fields, CollectionRecord, FieldValue, ParcelKey};

/// Turns a fetched page into canonical fields.
pub trait PageExtractor: Send + Sync {
    fn extract(&self, html: &str) -> Result<BTreeMap<String, FieldValue>, SourceError>;
}

/// Reads `<th>Label</th><td>Value</td>` (or `<td>`/`<td>`) pairs.
///
/// Labels are mapped with the same synonym table as the API adapter;
/// unknown labels are ignored. Money, year and area fields are parsed
/// into numbers.
#[derive(Debug, Default, Clone, Copy)]
pub struct LabelValueExtractor;

fn pair_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?is)<t[hd][^>]*>\s*([^<]+?)\s*</t[hd]>\s*<td[^>]*>\s*([^<]*?)\s*</td>")
            .expect("static regex")
    })
}

const NUMERIC_FIELDS: &[&str] = &[
    fields::ASSESSED_VALUE,
    fields::LAND_VALUE,
    fields::IMPROVEMENT_VALUE,
    fields::TAX_AMOUNT,
    fields::YEAR_BUILT,
    fields::LOT_SIZE_SQFT,
    fields::LAST_SALE_PRICE,
];

impl PageExtractor for LabelValueExtractor {
    fn extract(&self, html: &str) -> Result<BTreeMap<String, FieldValue>, SourceError> {
        if html.contains("No records found") {
            return Err(SourceError::NotFound);
        }

        let mut out = BTreeMap::new();
        for caps in pair_regex().captures_iter(html) {
            let Some(name) = canonical_field(&caps[1]) else {
                continue;
            };
            let raw = decode_entities(caps[2].trim());
            if raw.is_empty() || out.contains_key(name) {
                continue;
            }
            let value = if NUMERIC_FIELDS.contains(&name) {
                parse_number(&raw).unwrap_or(Value::String(raw))
            } else {
                Value::String(raw)
            };
            out.insert(name.to_string(), FieldValue::new(value));
        }

        if out.is_empty() {
            return Err(SourceError::Malformed(
                "no parcel detail table on page".to_string(),
            ));
        }
        Ok(out)
    }
}

fn decode_entities(s: &str) -> String {
    s.replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&#39;", "'")
        .replace("&quot;", "\"")
}

/// `"$1,234,500"` -> `1234500`, `"0.25"` -> `0.25`.
fn parse_number(raw: &str) -> Option<Value> {
    let cleaned: String = raw
        .chars()
        .filter(|c| !matches!(c, '$' | ',' | ' '))
        .collect();
    if let Ok(n) = cleaned.parse::<i64>() {
        return Some(Value::from(n));
    }
    cleaned
        .parse::<f64>()
        .ok()
        .and_then(serde_json::Number::from_f64)
        .map(Value::Number)
}

pub struct WebFallbackAdapter {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
    extractor: Arc<dyn PageExtractor>,
}

impl WebFallbackAdapter {
    pub fn new(config: &WebFallbackConfig) -> anyhow::Result<Self> {
        let timeout = Duration::from_secs(config.timeout_secs);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("parcel-harvest/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            timeout,
            extractor: Arc::new(LabelValueExtractor),
        })
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn PageExtractor>) -> Self {
        self.extractor = extractor;
        self
    }
}

#[async_trait]
impl SourceAdapter for WebFallbackAdapter {
    fn name(&self) -> &str {
        "web_fallback"
    }

    fn description(&self) -> &str {
        "Public assessor web portal (HTML scrape)"
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn fetch(
        &self,
        key: &ParcelKey,
        _partial: &CollectionRecord,
    ) -> Result<Fetched, SourceError> {
        let url = format!("{}/search", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[("type", key.kind().as_str()), ("q", key.normalized_value())])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SourceError::from_status(status.as_u16(), &body));
        }

        let html = response.text().await?;
        let fields = self.extractor.extract(&html)?;
        let partial = fields::tracked().any(|f| !fields.contains_key(f));
        Ok(Fetched { fields, partial })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const DETAIL_PAGE: &str = r#"
        <html><body>
        <table class="parcel-detail">
          <tr><th>Parcel Number</th><td>501-38-237</td></tr>
          <tr><th>Owner Name:</th><td>CITY OF GLENDALE</td></tr>
          <tr><th>Property Address</th><td>5850 W GLENDALE AVE</td></tr>
          <tr><th>Full Cash Value</th><td>$12,450,000</td></tr>
          <tr><td>Year Built</td><td>2009</td></tr>
          <tr><th>Subdivision</th><td>GLENDALE CIVIC CENTER</td></tr>
          <tr><th>Land Use</th><td>Municipal &amp; Civic</td></tr>
        </table>
        </body></html>
    "#;

    #[test]
    fn extracts_label_value_pairs() {
        let fields = LabelValueExtractor.extract(DETAIL_PAGE).unwrap();
        assert_eq!(fields["apn"].value, json!("501-38-237"));
        assert_eq!(fields["owner"].value, json!("CITY OF GLENDALE"));
        assert_eq!(fields["situs_address"].value, json!("5850 W GLENDALE AVE"));
        assert_eq!(fields["assessed_value"].value, json!(12450000));
        assert_eq!(fields["year_built"].value, json!(2009));
        assert_eq!(fields["land_use"].value, json!("Municipal & Civic"));
        assert_eq!(fields.len(), 6);
    }

    #[test]
    fn no_results_page_is_not_found() {
        let html = "<html><p>No records found for your search.</p></html>";
        assert_eq!(LabelValueExtractor.extract(html).unwrap_err(), SourceError::NotFound);
    }

    #[test]
    fn redesigned_page_is_malformed() {
        let html = "<html><div class='card'>Owner: SOMEONE</div></html>";
        assert!(matches!(
            LabelValueExtractor.extract(html).unwrap_err(),
            SourceError::Malformed(_)
        ));
    }

    #[test]
    fn number_parsing() {
        assert_eq!(parse_number("$1,234,500"), Some(json!(1234500)));
        assert_eq!(parse_number("0.25"), Some(json!(0.25)));
        assert_eq!(parse_number("n/a"), None);
    }
}
