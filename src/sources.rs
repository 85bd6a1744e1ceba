use anyhow::Result;

use crate::config::Config;
use crate::credentials::{CredentialProvider, EnvCredentials};

/// One row of `parcel sources`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceStatusRow {
    pub name: &'static str,
    pub status: String,
    pub timeout: String,
}

/// Describes the configured chain in execution order.
pub fn source_rows(config: &Config, credentials: &dyn CredentialProvider) -> Vec<SourceStatusRow> {
    let api = &config.adapters.primary_api;
    let api_status = if !api.enabled {
        "DISABLED".to_string()
    } else if credentials.current_token().is_none() {
        format!("NO TOKEN (${})", api.token_env)
    } else {
        "OK".to_string()
    };

    let web = &config.adapters.web_fallback;
    let web_status = if web.enabled { "OK" } else { "DISABLED" };

    vec![
        SourceStatusRow {
            name: "primary_api",
            status: api_status,
            timeout: format!("{}s", api.timeout_secs),
        },
        SourceStatusRow {
            name: "web_fallback",
            status: web_status.to_string(),
            timeout: format!("{}s", web.timeout_secs),
        },
        SourceStatusRow {
            name: "local_synthesis",
            status: "OK".to_string(),
            timeout: format!("{}ms", config.adapters.synthesis.timeout_ms),
        },
    ]
}

pub fn list_sources(config: &Config) -> Result<()> {
    let credentials = EnvCredentials::new(config.adapters.primary_api.token_env.clone());
    println!("{:<16} {:<28} TIMEOUT", "ADAPTER", "STATUS");
    for row in source_rows(config, &credentials) {
        println!("{:<16} {:<28} {}", row.name, row.status, row.timeout);
    }
    Ok(())
}
