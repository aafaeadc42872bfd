//! Incremental page-number extraction.
//!
//! A [`PageFetcher`] issues one request per page; [`paginate`] turns it into a
//! lazy stream of [`Record`]s. The stream is finite and cannot be resumed
//! mid-way: calling [`paginate`] again starts over from page 1.
//!
//! # Termination
//!
//! Checked in order after every page:
//!
//! 1. an empty page ends the stream without yielding anything;
//! 2. otherwise every record of the page is yielded in response order;
//! 3. a page with fewer than `page_size` records is taken as the last one.
//!    This is a heuristic, not something sources guarantee: a source whose
//!    final page is exactly full costs one extra request that comes back
//!    empty;
//! 4. otherwise the next page is requested, after `delay_ms`.
//!
//! Reaching `max_pages` ends the stream quietly (a warning is logged). Treat
//! that as a possibly incomplete extraction.
//!
//! # Retries
//!
//! The only retry is for expired credentials: an [`EtlError::AuthExpired`]
//! triggers one [`PageFetcher::refresh_credentials`] and one reissue of the
//! same page request. Every other error ends the stream with that error.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Days, NaiveDate, Utc};
use futures::stream::{self, Stream, TryStreamExt};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::{IncrementalConfig, PaginationConfig};
use crate::error::{EtlError, Result};
use crate::models::Record;

/// Query parameters for one request, in a stable order.
pub type QueryParams = BTreeMap<String, String>;

/// Keys searched, in priority order, when a page is a JSON object.
pub const ITEM_KEYS: [&str; 3] = ["data", "items", "results"];

/// One HTTP-like request per page.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    /// Fetch `path` with `params` and return the decoded body.
    ///
    /// Non-success statuses must come back as [`EtlError::Http`], or as
    /// [`EtlError::AuthExpired`] for a 401 the fetcher can recover from.
    async fn fetch(&self, path: &str, params: &QueryParams) -> Result<Value>;

    /// Renew credentials after an [`EtlError::AuthExpired`].
    ///
    /// Returns `false` when the source has no way to refresh, in which case
    /// the auth failure propagates unchanged.
    async fn refresh_credentials(&self) -> Result<bool> {
        Ok(false)
    }
}

/// Normalize a page payload into its list of records.
///
/// Accepts a bare list, or an object holding a list under `data`, `items` or
/// `results` (first match wins; a key whose value is not a list is skipped).
/// Every list element must be an object.
pub fn parse_items(payload: Value) -> Result<Vec<Record>> {
    let items = match payload {
        Value::Array(items) => items,
        Value::Object(mut map) => {
            let key = ITEM_KEYS
                .iter()
                .find(|k| matches!(map.get(**k), Some(Value::Array(_))));
            match key.and_then(|k| map.remove(*k)) {
                Some(Value::Array(items)) => items,
                _ => {
                    let keys: Vec<&String> = map.keys().collect();
                    return Err(EtlError::UnsupportedResponseShape(format!(
                        "object without a list under data, items or results (keys: {:?})",
                        keys
                    )));
                }
            }
        }
        other => {
            return Err(EtlError::UnsupportedResponseShape(format!(
                "expected a list or an object, got {}",
                json_kind(&other)
            )))
        }
    };

    items
        .into_iter()
        .enumerate()
        .map(|(i, item)| match item {
            Value::Object(record) => Ok(record),
            other => Err(EtlError::UnsupportedResponseShape(format!(
                "item {} is {}, expected an object",
                i,
                json_kind(&other)
            ))),
        })
        .collect()
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "an object",
    }
}

/// First day of the incremental window: `today - from_days_ago`.
pub fn window_start(incremental: &IncrementalConfig, today: NaiveDate) -> NaiveDate {
    today
        .checked_sub_days(Days::new(u64::from(incremental.from_days_ago)))
        .unwrap_or(NaiveDate::MIN)
}

/// Parameters shared by every page of one extraction.
pub fn base_params(
    pagination: &PaginationConfig,
    incremental: Option<&IncrementalConfig>,
    today: NaiveDate,
) -> QueryParams {
    let mut params = QueryParams::new();
    params.insert(
        pagination.page_size_param.clone(),
        pagination.page_size.to_string(),
    );
    if let Some(inc) = incremental {
        params.insert(
            inc.param.clone(),
            window_start(inc, today).format("%Y-%m-%d").to_string(),
        );
    }
    params
}

/// Stream every record of `path`, page by page, with the window anchored
/// on today's UTC date.
pub fn paginate<'a, F>(
    fetcher: &'a F,
    path: &'a str,
    pagination: &'a PaginationConfig,
    incremental: Option<&IncrementalConfig>,
) -> impl Stream<Item = Result<Record>> + Send + 'a
where
    F: PageFetcher + ?Sized,
{
    paginate_as_of(
        fetcher,
        path,
        pagination,
        incremental,
        Utc::now().date_naive(),
    )
}

/// [`paginate`] with an explicit "today" for the incremental window.
pub fn paginate_as_of<'a, F>(
    fetcher: &'a F,
    path: &'a str,
    pagination: &'a PaginationConfig,
    incremental: Option<&IncrementalConfig>,
    today: NaiveDate,
) -> impl Stream<Item = Result<Record>> + Send + 'a
where
    F: PageFetcher + ?Sized,
{
    let state = PageState {
        page: 1,
        yielded: 0,
        finished: false,
        base: base_params(pagination, incremental, today),
    };

    stream::try_unfold(state, move |state| {
        next_page(fetcher, path, pagination, state)
    })
    .map_ok(|items| stream::iter(items.into_iter().map(Ok::<Record, EtlError>)))
    .try_flatten()
}

struct PageState {
    page: u32,
    yielded: usize,
    finished: bool,
    base: QueryParams,
}

async fn next_page<F>(
    fetcher: &F,
    path: &str,
    pagination: &PaginationConfig,
    mut state: PageState,
) -> Result<Option<(Vec<Record>, PageState)>>
where
    F: PageFetcher + ?Sized,
{
    if state.finished {
        return Ok(None);
    }
    if state.page > pagination.max_pages {
        warn!(
            path,
            max_pages = pagination.max_pages,
            records = state.yielded,
            "max_pages reached; extraction may be incomplete"
        );
        return Ok(None);
    }

    if state.page > 1 && pagination.delay_ms > 0 {
        tokio::time::sleep(Duration::from_millis(pagination.delay_ms)).await;
    }

    let mut params = state.base.clone();
    params.insert(pagination.page_param.clone(), state.page.to_string());

    let payload = fetch_with_refresh(fetcher, path, &params).await?;
    let items = parse_items(payload)?;
    debug!(path, page = state.page, count = items.len(), "fetched page");

    if items.is_empty() {
        info!(path, pages = state.page, records = state.yielded, "empty page; done");
        return Ok(None);
    }

    state.yielded += items.len();
    if items.len() < pagination.page_size as usize {
        info!(path, pages = state.page, records = state.yielded, "short page; done");
        state.finished = true;
    } else {
        state.page += 1;
    }

    Ok(Some((items, state)))
}

async fn fetch_with_refresh<F>(fetcher: &F, path: &str, params: &QueryParams) -> Result<Value>
where
    F: PageFetcher + ?Sized,
{
    match fetcher.fetch(path, params).await {
        Err(EtlError::AuthExpired { url }) => {
            if !fetcher.refresh_credentials().await? {
                return Err(EtlError::AuthExpired { url });
            }
            warn!(url = %url, "credentials expired; refreshed, retrying once");
            fetcher.fetch(path, params).await
        }
        other => other,
    }
}
