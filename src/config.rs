use anyhow::{bail, Context, Result};
use chrono::{NaiveDate, Utc};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use crate::logging::{LogFormat, LogLevel};
use crate::quality::QualityCheck;
use crate::storage::Layer;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub log: LogSettings,
    pub storage: StorageConfig,
    #[serde(default)]
    pub secrets: SecretsConfig,
    pub warehouse: WarehouseConfig,
    #[serde(default)]
    pub sources: SourcesConfig,
    #[serde(default)]
    pub load: LoadConfig,
    #[serde(default)]
    pub quality: QualitySettings,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct RunConfig {
    /// Fixed run date (`YYYY-MM-DD`). Usually left unset so it resolves to today.
    #[serde(default)]
    pub run_date: Option<NaiveDate>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct LogSettings {
    #[serde(default)]
    pub level: LogLevel,
    #[serde(default)]
    pub format: LogFormat,
    /// Extra filter directives, e.g. `"sqlx=warn,hyper=info"`.
    #[serde(default)]
    pub filter: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Directory holding one sub-directory per container.
    pub root: PathBuf,
    #[serde(default = "default_container")]
    pub container: String,
}

fn default_container() -> String {
    "datalake".to_string()
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct SecretsConfig {
    /// Directory with one file per secret. When unset, only environment
    /// fallbacks are available.
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WarehouseConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct SourcesConfig {
    /// Generic paginated REST sources, keyed by source name.
    #[serde(default)]
    pub rest: BTreeMap<String, RestSourceConfig>,
    #[serde(default)]
    pub quickbooks: Option<QuickBooksConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RestSourceConfig {
    pub base_url: String,
    #[serde(default)]
    pub auth: Option<ApiKeyAuthConfig>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
}

/// API key sent as a single request header.
#[derive(Debug, Deserialize, Clone)]
pub struct ApiKeyAuthConfig {
    /// Secret name holding the API key.
    pub secret: String,
    /// Environment variable consulted when no secrets directory is configured.
    #[serde(default)]
    pub env_fallback: Option<String>,
    #[serde(default = "default_header_name")]
    pub header_name: String,
    /// Header value; `{api_key}` is replaced with the secret.
    #[serde(default = "default_header_template")]
    pub header_template: String,
}

fn default_header_name() -> String {
    "Authorization".to_string()
}
fn default_header_template() -> String {
    "Bearer {api_key}".to_string()
}
fn default_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct EndpointConfig {
    pub name: String,
    pub path: String,
    #[serde(default)]
    pub pagination: PaginationConfig,
    #[serde(default)]
    pub incremental: Option<IncrementalConfig>,
}

/// Page-number pagination settings.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct PaginationConfig {
    #[serde(default = "default_page_param")]
    pub page_param: String,
    #[serde(default = "default_page_size_param")]
    pub page_size_param: String,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    /// Hard ceiling on pages fetched. Reaching it ends the extraction
    /// silently, so a run that hits it may be incomplete.
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
    /// Pause between consecutive page requests, in milliseconds.
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
}

impl Default for PaginationConfig {
    fn default() -> Self {
        Self {
            page_param: default_page_param(),
            page_size_param: default_page_size_param(),
            page_size: default_page_size(),
            max_pages: default_max_pages(),
            delay_ms: default_delay_ms(),
        }
    }
}

impl PaginationConfig {
    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 {
            bail!("pagination.page_size must be > 0");
        }
        if self.max_pages == 0 {
            bail!("pagination.max_pages must be > 0");
        }
        if self.page_param.is_empty() || self.page_size_param.is_empty() {
            bail!("pagination parameter names must not be empty");
        }
        if self.page_param == self.page_size_param {
            bail!("pagination.page_param and page_size_param must differ");
        }
        Ok(())
    }
}

fn default_page_param() -> String {
    "page".to_string()
}
fn default_page_size_param() -> String {
    "per_page".to_string()
}
fn default_page_size() -> u32 {
    500
}
fn default_max_pages() -> u32 {
    10_000
}
fn default_delay_ms() -> u64 {
    200
}

/// "Changed since N days ago" filter passed as one query parameter.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct IncrementalConfig {
    pub param: String,
    #[serde(default = "default_from_days_ago")]
    pub from_days_ago: u32,
}

fn default_from_days_ago() -> u32 {
    7
}

#[derive(Debug, Deserialize, Clone)]
pub struct QuickBooksConfig {
    pub company_id: String,
    /// `production` or `sandbox`.
    #[serde(default = "default_qb_environment")]
    pub environment: String,
    #[serde(default = "default_qb_token_url")]
    pub token_url: String,
    /// Overrides the host derived from `environment`.
    #[serde(default)]
    pub base_url: Option<String>,
    pub client_id_secret: String,
    pub client_secret_secret: String,
    pub refresh_token_secret: String,
    #[serde(default = "default_minor_version")]
    pub minor_version: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub pagination: PaginationConfig,
    #[serde(default)]
    pub entities: Vec<QuickBooksEntityConfig>,
}

fn default_qb_environment() -> String {
    "production".to_string()
}
fn default_qb_token_url() -> String {
    "https://oauth.platform.intuit.com/oauth2/v1/tokens/bearer".to_string()
}
fn default_minor_version() -> u32 {
    75
}

#[derive(Debug, Deserialize, Clone)]
pub struct QuickBooksEntityConfig {
    /// Endpoint name used in the bronze path.
    pub name: String,
    /// Query entity, e.g. `Customer` or `Payment`.
    pub entity: String,
    #[serde(default)]
    pub incremental: Option<IncrementalConfig>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct LoadConfig {
    #[serde(default)]
    pub tables: Vec<LoadTableConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoadTableConfig {
    /// Warehouse table, optionally schema-qualified (`main.dim_customers`).
    pub table: String,
    #[serde(default = "default_layer")]
    pub layer: Layer,
    pub domain: String,
    /// Lake table name under `{layer}/{domain}/`.
    pub name: String,
    pub keys: Vec<String>,
    #[serde(default)]
    pub checks: Vec<QualityCheck>,
}

fn default_layer() -> Layer {
    Layer::Gold
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct QualitySettings {
    /// Abort the load of a table when any of its checks fails.
    #[serde(default)]
    pub halt_on_failure: bool,
}

impl Config {
    /// Resolve the run date: explicit override, then `RUN_DATE`, then
    /// `[run].run_date`, then today in UTC.
    pub fn resolve_run_date(&self, cli: Option<NaiveDate>) -> Result<NaiveDate> {
        if let Some(date) = cli {
            return Ok(date);
        }
        if let Ok(raw) = std::env::var("RUN_DATE") {
            if !raw.trim().is_empty() {
                return NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
                    .with_context(|| format!("RUN_DATE is not a YYYY-MM-DD date: '{}'", raw));
            }
        }
        Ok(self.run.run_date.unwrap_or_else(|| Utc::now().date_naive()))
    }

    pub fn load_table(&self, table: &str) -> Option<&LoadTableConfig> {
        self.load.tables.iter().find(|t| t.table == table)
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    if config.storage.container.is_empty() {
        bail!("storage.container must not be empty");
    }

    for (name, source) in &config.sources.rest {
        if source.base_url.trim().is_empty() {
            bail!("sources.rest.{}.base_url must not be empty", name);
        }
        if source.timeout_secs == 0 {
            bail!("sources.rest.{}.timeout_secs must be > 0", name);
        }
        let mut seen = HashSet::new();
        for ep in &source.endpoints {
            if ep.name.is_empty() || !seen.insert(ep.name.as_str()) {
                bail!(
                    "sources.rest.{}: endpoint names must be non-empty and unique (got '{}')",
                    name,
                    ep.name
                );
            }
            ep.pagination
                .validate()
                .with_context(|| format!("sources.rest.{}.endpoints.{}", name, ep.name))?;
        }
    }

    if let Some(qb) = &config.sources.quickbooks {
        match qb.environment.as_str() {
            "production" | "sandbox" => {}
            other => bail!(
                "sources.quickbooks.environment must be production or sandbox (got '{}')",
                other
            ),
        }
        qb.pagination
            .validate()
            .with_context(|| "sources.quickbooks.pagination")?;
        let mut seen = HashSet::new();
        for e in &qb.entities {
            if e.name.is_empty() || !seen.insert(e.name.as_str()) {
                bail!("sources.quickbooks: entity names must be non-empty and unique");
            }
        }
    }

    for table in &config.load.tables {
        if table.keys.is_empty() {
            bail!("load.tables.{}: keys must not be empty", table.table);
        }
        if table.layer == Layer::Bronze {
            bail!(
                "load.tables.{}: layer must be silver or gold (bronze holds raw JSONL)",
                table.table
            );
        }
        for check in &table.checks {
            check
                .validate()
                .with_context(|| format!("load.tables.{}.checks", table.table))?;
        }
    }

    Ok(config)
}
