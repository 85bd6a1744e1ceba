use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub collector: CollectorConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub adapters: AdaptersConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CollectorConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_freshness_hours")]
    pub freshness_hours: u64,
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u64,
    #[serde(default = "default_job_deadline_secs")]
    pub job_deadline_secs: u64,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            freshness_hours: default_freshness_hours(),
            retention_hours: default_retention_hours(),
            job_deadline_secs: default_job_deadline_secs(),
            event_capacity: default_event_capacity(),
        }
    }
}

fn default_workers() -> usize {
    3
}
fn default_freshness_hours() -> u64 {
    24
}
fn default_retention_hours() -> u64 {
    168
}
fn default_job_deadline_secs() -> u64 {
    90
}
fn default_event_capacity() -> usize {
    256
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

fn default_max_retries() -> u32 {
    2
}
fn default_base_delay_ms() -> u64 {
    250
}
fn default_max_delay_ms() -> u64 {
    4000
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AdaptersConfig {
    #[serde(default)]
    pub primary_api: PrimaryApiConfig,
    #[serde(default)]
    pub web_fallback: WebFallbackConfig,
    #[serde(default)]
    pub synthesis: SynthesisConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PrimaryApiConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub base_url: String,
    #[serde(default = "default_api_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_token_env")]
    pub token_env: String,
}

impl Default for PrimaryApiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: String::new(),
            timeout_secs: default_api_timeout_secs(),
            token_env: default_token_env(),
        }
    }
}

fn default_api_timeout_secs() -> u64 {
    10
}
fn default_token_env() -> String {
    "PARCEL_API_TOKEN".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct WebFallbackConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub base_url: String,
    #[serde(default = "default_web_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for WebFallbackConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: String::new(),
            timeout_secs: default_web_timeout_secs(),
        }
    }
}

fn default_web_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct SynthesisConfig {
    #[serde(default = "default_synthesis_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_synthesis_timeout_ms(),
        }
    }
}

fn default_synthesis_timeout_ms() -> u64 {
    50
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7341".to_string()
}

impl CollectorConfig {
    pub fn freshness(&self) -> chrono::Duration {
        chrono::Duration::hours(self.freshness_hours as i64)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::hours(self.retention_hours as i64)
    }

    pub fn job_deadline(&self) -> Duration {
        Duration::from_secs(self.job_deadline_secs)
    }
}

impl Config {
    /// Defaults with only local synthesis enabled and the database under
    /// `./data`. Used when no config file exists and by tests.
    pub fn minimal() -> Self {
        Self {
            db: DbConfig {
                path: PathBuf::from("./data/parcels.sqlite"),
            },
            collector: CollectorConfig::default(),
            retry: RetryConfig::default(),
            adapters: AdaptersConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    let collector = &config.collector;
    if collector.workers == 0 {
        anyhow::bail!("collector.workers must be > 0");
    }
    if collector.freshness_hours == 0 {
        anyhow::bail!("collector.freshness_hours must be > 0");
    }
    if collector.retention_hours < collector.freshness_hours {
        anyhow::bail!("collector.retention_hours must be >= collector.freshness_hours");
    }
    if collector.job_deadline_secs == 0 {
        anyhow::bail!("collector.job_deadline_secs must be > 0");
    }
    if collector.event_capacity == 0 {
        anyhow::bail!("collector.event_capacity must be > 0");
    }

    if config.retry.max_delay_ms < config.retry.base_delay_ms {
        anyhow::bail!("retry.max_delay_ms must be >= retry.base_delay_ms");
    }

    let api = &config.adapters.primary_api;
    if api.enabled && api.base_url.trim().is_empty() {
        anyhow::bail!("adapters.primary_api.base_url must be set when the adapter is enabled");
    }
    let web = &config.adapters.web_fallback;
    if web.enabled && web.base_url.trim().is_empty() {
        anyhow::bail!("adapters.web_fallback.base_url must be set when the adapter is enabled");
    }

    Ok(())
}
