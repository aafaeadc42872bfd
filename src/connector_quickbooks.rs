//! QuickBooks Online connector.
//!
//! Data comes from the `/query` endpoint, which takes an SQL-like statement
//! instead of page parameters. [`QuickBooksClient`] implements
//! [`PageFetcher`] by translating the page cursor into that statement:
//!
//! ```text
//! select * from Customer where MetaData.LastUpdatedTime >= '2026-01-25' startposition 501 maxresults 500
//! ```
//!
//! and unwrapping `QueryResponse.{Entity}` into a bare list, so the regular
//! producer drives it.
//!
//! # Authentication
//!
//! OAuth2 refresh-token grant. The access token is fetched on first use and
//! cached in the client. A 401 surfaces as [`EtlError::AuthExpired`]; the
//! producer then calls [`PageFetcher::refresh_credentials`] once and retries.
//!
//! ```toml
//! [sources.quickbooks]
//! company_id = "9130350000000000"
//! environment = "sandbox"
//! client_id_secret = "qb-client-id"
//! client_secret_secret = "qb-client-secret"
//! refresh_token_secret = "qb-refresh-token"
//!
//! [[sources.quickbooks.entities]]
//! name = "customers"
//! entity = "Customer"
//! incremental = { param = "MetaData.LastUpdatedTime", from_days_ago = 7 }
//! ```

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::QuickBooksConfig;
use crate::error::{EtlError, Result};
use crate::pagination::{PageFetcher, QueryParams};
use crate::secrets::SecretProvider;

pub struct QuickBooksClient {
    client: reqwest::Client,
    token_url: String,
    base_url: String,
    client_id: String,
    client_secret: String,
    refresh_token: String,
    minor_version: u32,
    page_param: String,
    page_size_param: String,
    access_token: Mutex<Option<String>>,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// API root for a company: `https://{host}/v3/company/{company_id}`.
pub fn company_base_url(environment: &str, company_id: &str) -> String {
    let host = if environment == "production" {
        "quickbooks.api.intuit.com"
    } else {
        "sandbox-quickbooks.api.intuit.com"
    };
    format!("https://{}/v3/company/{}", host, company_id)
}

impl QuickBooksClient {
    pub fn from_config(config: &QuickBooksConfig, secrets: &SecretProvider) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        let base_url = match &config.base_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => company_base_url(&config.environment, &config.company_id),
        };

        Ok(Self {
            client,
            token_url: config.token_url.clone(),
            base_url,
            client_id: secrets.get_secret(&config.client_id_secret, Some("QB_CLIENT_ID"))?,
            client_secret: secrets
                .get_secret(&config.client_secret_secret, Some("QB_CLIENT_SECRET"))?,
            refresh_token: secrets
                .get_secret(&config.refresh_token_secret, Some("QB_REFRESH_TOKEN"))?,
            minor_version: config.minor_version,
            page_param: config.pagination.page_param.clone(),
            page_size_param: config.pagination.page_size_param.clone(),
            access_token: Mutex::new(None),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Exchange the refresh token for a new access token and cache it.
    pub async fn refresh_access_token(&self) -> Result<String> {
        let basic = base64::engine::general_purpose::STANDARD
            .encode(format!("{}:{}", self.client_id, self.client_secret));

        let resp = self
            .client
            .post(&self.token_url)
            .header(AUTHORIZATION, format!("Basic {}", basic))
            .header(ACCEPT, "application/json")
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", self.refresh_token.as_str()),
            ])
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(EtlError::Http {
                status: status.as_u16(),
                url: self.token_url.clone(),
            });
        }

        let token: TokenResponse = serde_json::from_slice(&resp.bytes().await?)?;
        info!("refreshed QuickBooks access token");
        *self.access_token.lock().await = Some(token.access_token.clone());
        Ok(token.access_token)
    }

    async fn current_token(&self) -> Result<String> {
        let cached = self.access_token.lock().await.clone();
        match cached {
            Some(token) => Ok(token),
            None => self.refresh_access_token().await,
        }
    }

    /// One request to `/query`. A 401 becomes [`EtlError::AuthExpired`].
    async fn send_query(&self, statement: &str) -> Result<Value> {
        let token = self.current_token().await?;
        let url = format!("{}/query", self.base_url);
        debug!(url = %url, statement, "QuickBooks query");

        let resp = self
            .client
            .get(&url)
            .bearer_auth(token)
            .header(ACCEPT, "application/json")
            .header(CONTENT_TYPE, "application/text")
            .query(&[
                ("query", statement.to_string()),
                ("minorversion", self.minor_version.to_string()),
            ])
            .send()
            .await?;

        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(EtlError::AuthExpired { url });
        }
        if !status.is_success() {
            return Err(EtlError::Http {
                status: status.as_u16(),
                url,
            });
        }
        Ok(serde_json::from_slice(&resp.bytes().await?)?)
    }

    /// Run a single query, refreshing the token once on a 401.
    pub async fn query(&self, statement: &str) -> Result<Value> {
        match self.send_query(statement).await {
            Err(EtlError::AuthExpired { .. }) => {
                self.refresh_access_token().await?;
                self.send_query(statement).await
            }
            other => other,
        }
    }

    fn page_statement(&self, entity: &str, params: &QueryParams) -> Result<String> {
        check_name(entity)?;
        let page = numeric_param(params, &self.page_param)?.max(1);
        let size = numeric_param(params, &self.page_size_param)?.max(1);

        let mut filters = Vec::new();
        for (name, value) in params {
            if *name == self.page_param || *name == self.page_size_param {
                continue;
            }
            check_name(name)?;
            if value.contains('\'') {
                return Err(EtlError::Configuration(format!(
                    "filter value for '{}' must not contain quotes",
                    name
                )));
            }
            filters.push(format!("{} >= '{}'", name, value));
        }

        let mut statement = format!("select * from {}", entity);
        if !filters.is_empty() {
            statement.push_str(" where ");
            statement.push_str(&filters.join(" and "));
        }
        statement.push_str(&format!(
            " startposition {} maxresults {}",
            (page - 1) * size + 1,
            size
        ));
        Ok(statement)
    }
}

fn numeric_param(params: &QueryParams, name: &str) -> Result<u64> {
    let raw = params
        .get(name)
        .ok_or_else(|| EtlError::Configuration(format!("missing paging parameter '{}'", name)))?;
    raw.parse()
        .map_err(|_| EtlError::Configuration(format!("paging parameter '{}' is not a number", name)))
}

/// Entity and field names: letters, digits, `_` and `.`.
fn check_name(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');
    if ok {
        Ok(())
    } else {
        Err(EtlError::Configuration(format!(
            "invalid QuickBooks name '{}'",
            name
        )))
    }
}

/// Pull the records list out of a query response.
fn entity_items(mut body: Value, entity: &str) -> Result<Value> {
    let Some(response) = body.get_mut("QueryResponse").and_then(Value::as_object_mut) else {
        return Err(EtlError::UnsupportedResponseShape(
            "QuickBooks body without QueryResponse".into(),
        ));
    };
    Ok(response
        .remove(entity)
        .unwrap_or_else(|| Value::Array(Vec::new())))
}

#[async_trait]
impl PageFetcher for QuickBooksClient {
    /// `path` is the entity name (`Customer`, `Invoice`, ...).
    async fn fetch(&self, path: &str, params: &QueryParams) -> Result<Value> {
        let statement = self.page_statement(path, params)?;
        let body = self.send_query(&statement).await?;
        entity_items(body, path)
    }

    async fn refresh_credentials(&self) -> Result<bool> {
        self.refresh_access_token().await?;
        Ok(true)
    }
}
