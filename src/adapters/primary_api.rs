//! Primary JSON API adapter.
//!
//! Fastest and most authoritative source, and the most fragile: tokens
//! expire and the service returns 5xx under load.
//!
//! Request: `GET {base_url}/lookup?kind=<apn|address|owner>&q=<value>` with
//! `Authorization: Bearer <token>`. The response is either a parcel object,
//! `{ "parcel": { ... } }`, or an array whose first element is used.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use super::{canonical_field, Fetched, SourceAdapter};
use crate::config::PrimaryApiConfig;
use crate::credentials::CredentialProvider;
use crate::error::SourceError;
use crate::models::{fields, CollectionRecord, FieldValue, ParcelKey};

pub struct PrimaryApiAdapter {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
    credentials: Arc<dyn CredentialProvider>,
}

impl PrimaryApiAdapter {
    pub fn new(
        config: &PrimaryApiConfig,
        credentials: Arc<dyn CredentialProvider>,
    ) -> anyhow::Result<Self> {
        let timeout = Duration::from_secs(config.timeout_secs);
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            timeout,
            credentials,
        })
    }
}

#[async_trait]
impl SourceAdapter for PrimaryApiAdapter {
    fn name(&self) -> &str {
        "primary_api"
    }

    fn description(&self) -> &str {
        "Assessor JSON API (token authenticated)"
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn fetch(
        &self,
        key: &ParcelKey,
        _partial: &CollectionRecord,
    ) -> Result<Fetched, SourceError> {
        // A missing or expired token would only produce a doomed 401.
        let token = self
            .credentials
            .current_token()
            .ok_or(SourceError::MissingCredential)?;

        let url = format!("{}/lookup", self.base_url);
        let response = self
            .client
            .get(&url)
            .bearer_auth(token)
            .query(&[("kind", key.kind().as_str()), ("q", key.normalized_value())])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SourceError::from_status(status.as_u16(), &body));
        }

        let json: Value = response
            .json()
            .await
            .map_err(|e| SourceError::Malformed(e.to_string()))?;
        parse_parcel_json(&json)
    }
}

/// Extracts canonical fields from an API response body.
pub fn parse_parcel_json(json: &Value) -> Result<Fetched, SourceError> {
    let object = match json {
        Value::Array(items) => items.first().ok_or(SourceError::NotFound)?,
        Value::Object(map) => map.get("parcel").unwrap_or(json),
        _ => return Err(SourceError::Malformed("expected a JSON object".to_string())),
    };
    let map = object
        .as_object()
        .ok_or_else(|| SourceError::Malformed("parcel is not an object".to_string()))?;

    let mut out = BTreeMap::new();
    for (label, value) in map {
        if value.is_null() {
            continue;
        }
        if let Some(name) = canonical_field(label) {
            out.insert(name.to_string(), FieldValue::new(value.clone()));
        }
    }
    if out.is_empty() {
        return Err(SourceError::Malformed(
            "response contained no recognizable parcel fields".to_string(),
        ));
    }

    let partial = fields::tracked().any(|f| !out.contains_key(f));
    Ok(Fetched {
        fields: out,
        partial,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_wrapped_object() {
        let fetched = parse_parcel_json(&json!({
            "parcel": {
                "apn": "50138237",
                "ownerName": "CITY OF GLENDALE",
                "yearBuilt": 2009,
                "legalDescription": "ignored",
                "landUse": null
            }
        }))
        .unwrap();
        assert!(fetched.partial);
        assert_eq!(fetched.fields["owner"].value, json!("CITY OF GLENDALE"));
        assert_eq!(fetched.fields["year_built"].value, json!(2009));
        assert!(!fetched.fields.contains_key("land_use"));
        assert_eq!(fetched.fields.len(), 3);
    }

    #[test]
    fn empty_result_array_is_not_found() {
        assert_eq!(parse_parcel_json(&json!([])).unwrap_err(), SourceError::NotFound);
    }

    #[test]
    fn unrecognized_body_is_malformed() {
        let err = parse_parcel_json(&json!({"status": "maintenance"})).unwrap_err();
        assert!(matches!(err, SourceError::Malformed(_)));
        assert!(!err.is_transient());
    }
}
