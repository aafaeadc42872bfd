//! Generic paginated REST connector.
//!
//! Issues `GET {base_url}{path}?{params}` with a fixed set of headers. The
//! API key, if any, is resolved once through the [`SecretProvider`] and sent
//! in a single header built from a template:
//!
//! ```toml
//! [sources.rest.superoperator]
//! base_url = "https://api.superoperator.example"
//!
//! [sources.rest.superoperator.auth]
//! secret = "superoperator-api-key"
//! header_name = "X-Api-Key"
//! header_template = "{api_key}"
//! ```
//!
//! A 401 is an ordinary [`EtlError::Http`]: static API keys cannot be
//! refreshed.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT};
use serde_json::Value;
use tracing::debug;

use crate::config::RestSourceConfig;
use crate::error::{EtlError, Result};
use crate::pagination::{PageFetcher, QueryParams};
use crate::secrets::SecretProvider;

pub struct RestApiClient {
    base_url: String,
    headers: HeaderMap,
    client: reqwest::Client,
}

impl RestApiClient {
    pub fn new(base_url: &str, headers: HeaderMap, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            headers,
            client,
        })
    }

    /// Build a client for a configured source, resolving its API key.
    pub fn from_config(source: &RestSourceConfig, secrets: &SecretProvider) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        if let Some(auth) = &source.auth {
            let api_key = secrets.get_secret(&auth.secret, auth.env_fallback.as_deref())?;
            let name = HeaderName::from_bytes(auth.header_name.as_bytes()).map_err(|e| {
                EtlError::Configuration(format!("invalid header name '{}': {}", auth.header_name, e))
            })?;
            let mut value = HeaderValue::from_str(&auth.header_template.replace("{api_key}", &api_key))
                .map_err(|_| EtlError::Configuration("API key is not a valid header value".into()))?;
            value.set_sensitive(true);
            headers.insert(name, value);
        }

        Self::new(
            &source.base_url,
            headers,
            Duration::from_secs(source.timeout_secs),
        )
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl PageFetcher for RestApiClient {
    async fn fetch(&self, path: &str, params: &QueryParams) -> Result<Value> {
        let url = self.url(path);
        debug!(url = %url, ?params, "GET");

        let resp = self
            .client
            .get(&url)
            .headers(self.headers.clone())
            .query(params)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(EtlError::Http {
                status: status.as_u16(),
                url,
            });
        }

        let body = resp.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }
}
