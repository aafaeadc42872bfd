//! Extract pipeline: sources → bronze JSONL.
//!
//! For each selected REST endpoint and QuickBooks entity, streams every record
//! through [`paginate`], renders the result with [`to_jsonl`] and writes it to
//! `bronze/{source}/{endpoint}/run_date=YYYY-MM-DD/data.jsonl`, replacing any
//! earlier file for the same run date. Each step is recorded in the run
//! ledger. The first failing endpoint stops the run.
//!
//! [`to_jsonl`]: crate::jsonl::to_jsonl

use std::str::FromStr;

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use sqlx::SqlitePool;
use tracing::{error, info};

use crate::config::{Config, IncrementalConfig, PaginationConfig};
use crate::connector_quickbooks::QuickBooksClient;
use crate::connector_rest::RestApiClient;
use crate::db;
use crate::error::EtlError;
use crate::jsonl::collect_jsonl;
use crate::ledger::{self, LedgerEntry, Stage, Status};
use crate::migrate;
use crate::pagination::{paginate, PageFetcher};
use crate::secrets::SecretProvider;
use crate::storage::{bronze_path, BlobStore, LocalBlobStore};

/// Source name used for QuickBooks in bronze paths.
pub const QUICKBOOKS_SOURCE: &str = "quickbooks";

/// Which endpoints to extract.
///
/// `all`, `rest`, `rest:<source>`, `quickbooks`, `quickbooks:<entity>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    All,
    Rest(Option<String>),
    QuickBooks(Option<String>),
}

impl FromStr for Selector {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (kind, name) = match s.split_once(':') {
            Some((kind, name)) if !name.is_empty() => (kind, Some(name.to_string())),
            Some(_) => bail!("selector '{}' has an empty name", s),
            None => (s, None),
        };
        match (kind, name) {
            ("all", None) => Ok(Selector::All),
            ("rest", name) => Ok(Selector::Rest(name)),
            ("quickbooks", name) => Ok(Selector::QuickBooks(name)),
            _ => bail!(
                "Unknown selector: '{}'. Available: all, rest[:<source>], quickbooks[:<entity>]",
                s
            ),
        }
    }
}

impl Selector {
    fn wants_rest(&self, source: &str) -> bool {
        match self {
            Selector::All | Selector::Rest(None) => true,
            Selector::Rest(Some(name)) => name == source,
            Selector::QuickBooks(_) => false,
        }
    }

    fn wants_quickbooks(&self, entity: &str) -> bool {
        match self {
            Selector::All | Selector::QuickBooks(None) => true,
            Selector::QuickBooks(Some(name)) => name == entity,
            Selector::Rest(_) => false,
        }
    }
}

/// One endpoint to extract and where it lands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractTarget {
    pub source: String,
    pub endpoint: String,
    pub blob_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractOutcome {
    pub target: ExtractTarget,
    pub records: usize,
    pub bytes: usize,
}

/// Everything an extraction writes to.
pub struct ExtractContext<'a> {
    pub store: &'a dyn BlobStore,
    pub container: &'a str,
    pub pool: &'a SqlitePool,
    pub run_id: &'a str,
    pub run_date: NaiveDate,
}

/// Resolve `selector` against the configured sources, in config order.
///
/// Fails when the selector names something that is not configured.
pub fn plan(config: &Config, selector: &Selector, run_date: NaiveDate) -> Result<Vec<ExtractTarget>> {
    let mut targets = Vec::new();

    for (source, rest) in &config.sources.rest {
        if !selector.wants_rest(source) {
            continue;
        }
        for ep in &rest.endpoints {
            targets.push(ExtractTarget {
                source: source.clone(),
                endpoint: ep.name.clone(),
                blob_path: bronze_path(source, &ep.name, run_date),
            });
        }
    }

    if let Some(qb) = &config.sources.quickbooks {
        for entity in &qb.entities {
            if selector.wants_quickbooks(&entity.name) {
                targets.push(ExtractTarget {
                    source: QUICKBOOKS_SOURCE.to_string(),
                    endpoint: entity.name.clone(),
                    blob_path: bronze_path(QUICKBOOKS_SOURCE, &entity.name, run_date),
                });
            }
        }
    }

    match selector {
        Selector::Rest(Some(name)) if !config.sources.rest.contains_key(name) => {
            bail!("No REST source named '{}' in config", name)
        }
        Selector::QuickBooks(Some(name)) if targets.is_empty() => {
            bail!("No QuickBooks entity named '{}' in config", name)
        }
        Selector::QuickBooks(None) if config.sources.quickbooks.is_none() => {
            bail!("QuickBooks is not configured")
        }
        _ => {}
    }

    Ok(targets)
}

/// Extract the selected endpoints into the bronze layer.
pub async fn extract_selected(
    config: &Config,
    selector: &Selector,
    secrets: &SecretProvider,
    ctx: &ExtractContext<'_>,
) -> Result<Vec<ExtractOutcome>> {
    let mut outcomes = Vec::new();

    for (source, rest) in &config.sources.rest {
        if !selector.wants_rest(source) || rest.endpoints.is_empty() {
            continue;
        }
        let client = RestApiClient::from_config(rest, secrets)
            .with_context(|| format!("building client for REST source '{}'", source))?;
        for ep in &rest.endpoints {
            let target = ExtractTarget {
                source: source.clone(),
                endpoint: ep.name.clone(),
                blob_path: bronze_path(source, &ep.name, ctx.run_date),
            };
            outcomes.push(
                extract_endpoint(
                    &client,
                    &ep.path,
                    &ep.pagination,
                    ep.incremental.as_ref(),
                    target,
                    ctx,
                )
                .await?,
            );
        }
    }

    if let Some(qb) = &config.sources.quickbooks {
        let entities: Vec<_> = qb
            .entities
            .iter()
            .filter(|e| selector.wants_quickbooks(&e.name))
            .collect();
        if !entities.is_empty() {
            let client = QuickBooksClient::from_config(qb, secrets)
                .context("building QuickBooks client")?;
            for entity in entities {
                let target = ExtractTarget {
                    source: QUICKBOOKS_SOURCE.to_string(),
                    endpoint: entity.name.clone(),
                    blob_path: bronze_path(QUICKBOOKS_SOURCE, &entity.name, ctx.run_date),
                };
                outcomes.push(
                    extract_endpoint(
                        &client,
                        &entity.entity,
                        &qb.pagination,
                        entity.incremental.as_ref(),
                        target,
                        ctx,
                    )
                    .await?,
                );
            }
        }
    }

    Ok(outcomes)
}

/// Stream one endpoint into its bronze file and record the step.
pub async fn extract_endpoint<F>(
    fetcher: &F,
    path: &str,
    pagination: &PaginationConfig,
    incremental: Option<&IncrementalConfig>,
    target: ExtractTarget,
    ctx: &ExtractContext<'_>,
) -> Result<ExtractOutcome>
where
    F: PageFetcher + ?Sized,
{
    info!(
        source = %target.source,
        endpoint = %target.endpoint,
        path,
        "extracting"
    );

    let written = async {
        let (text, count) = collect_jsonl(paginate(fetcher, path, pagination, incremental)).await?;
        ctx.store
            .put_text(ctx.container, &target.blob_path, &text, true)
            .await?;
        Ok::<_, EtlError>((text, count))
    }
    .await;

    let source_label = format!("{}/{}", target.source, target.endpoint);
    let entry = LedgerEntry::new(
        ctx.run_id,
        Stage::Extract,
        &source_label,
        &target.blob_path,
        ctx.run_date,
    );

    match written {
        Ok((text, count)) => {
            ledger::record(ctx.pool, &entry.rows(count).sha256(text.as_bytes())).await?;
            info!(blob = %target.blob_path, records = count, "wrote bronze file");
            Ok(ExtractOutcome {
                target,
                records: count,
                bytes: text.len(),
            })
        }
        Err(e) => {
            error!(source = %source_label, error = %e, "extraction failed");
            ledger::record(ctx.pool, &entry.status(Status::Failed, Some(e.to_string()))).await?;
            Err(anyhow::Error::new(e).context(format!("extracting {}", source_label)))
        }
    }
}

/// `etl extract`: extract into the configured lake and print a summary.
pub async fn run_extract(
    config: &Config,
    selector: &str,
    run_date: NaiveDate,
    dry_run: bool,
) -> Result<()> {
    let selector: Selector = selector.parse()?;
    let targets = plan(config, &selector, run_date)?;

    if dry_run {
        println!("extract {} (dry-run)", run_date);
        for t in &targets {
            println!("  {}/{} -> {}", t.source, t.endpoint, t.blob_path);
        }
        println!("  endpoints: {}", targets.len());
        return Ok(());
    }

    if targets.is_empty() {
        println!("Nothing to extract: no matching endpoints configured.");
        return Ok(());
    }

    let pool = db::connect(config).await?;
    migrate::migrate(&pool).await?;
    let store = LocalBlobStore::new(&config.storage.root);
    let secrets = SecretProvider::new(config.secrets.dir.clone());
    let run_id = ledger::new_run_id();

    let ctx = ExtractContext {
        store: &store,
        container: &config.storage.container,
        pool: &pool,
        run_id: &run_id,
        run_date,
    };
    let result = extract_selected(config, &selector, &secrets, &ctx).await;
    pool.close().await;
    let outcomes = result?;

    println!("extract {}", run_date);
    for o in &outcomes {
        println!(
            "  {}/{}: {} records ({} bytes) -> {}",
            o.target.source, o.target.endpoint, o.records, o.bytes, o.target.blob_path
        );
    }
    println!("  run: {}", run_id);
    println!("ok");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;
    use crate::jsonl::parse_jsonl;
    use crate::storage::MemoryBlobStore;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use tempfile::TempDir;

    const CONFIG: &str = r#"
[storage]
root = "/tmp/lake"

[warehouse]
path = "/tmp/w.sqlite"

[sources.rest.superoperator]
base_url = "https://api.superoperator.example"

[[sources.rest.superoperator.endpoints]]
name = "customers"
path = "/v1/customers"

[[sources.rest.superoperator.endpoints]]
name = "orders"
path = "/v1/orders"

[sources.quickbooks]
company_id = "1"
client_id_secret = "a"
client_secret_secret = "b"
refresh_token_secret = "c"

[[sources.quickbooks.entities]]
name = "payments"
entity = "Payment"
"#;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 2, 1).unwrap()
    }

    #[test]
    fn test_selector_parsing() {
        assert_eq!("all".parse::<Selector>().unwrap(), Selector::All);
        assert_eq!("rest".parse::<Selector>().unwrap(), Selector::Rest(None));
        assert_eq!(
            "quickbooks:payments".parse::<Selector>().unwrap(),
            Selector::QuickBooks(Some("payments".into()))
        );
        assert!("rest:".parse::<Selector>().is_err());
        assert!("slack".parse::<Selector>().is_err());
        assert!("all:x".parse::<Selector>().is_err());
    }

    #[test]
    fn test_plan_paths() {
        let config = parse_config(CONFIG).unwrap();
        let all = plan(&config, &Selector::All, date()).unwrap();
        let paths: Vec<&str> = all.iter().map(|t| t.blob_path.as_str()).collect();
        assert_eq!(
            paths,
            vec![
                "bronze/superoperator/customers/run_date=2026-02-01/data.jsonl",
                "bronze/superoperator/orders/run_date=2026-02-01/data.jsonl",
                "bronze/quickbooks/payments/run_date=2026-02-01/data.jsonl",
            ]
        );

        let qb = plan(&config, &"quickbooks".parse().unwrap(), date()).unwrap();
        assert_eq!(qb.len(), 1);

        assert!(plan(&config, &"rest:nope".parse().unwrap(), date()).is_err());
        assert!(plan(&config, &"quickbooks:nope".parse().unwrap(), date()).is_err());
    }

    struct Pages(Vec<Value>);

    #[async_trait]
    impl PageFetcher for Pages {
        async fn fetch(
            &self,
            _path: &str,
            params: &crate::pagination::QueryParams,
        ) -> crate::error::Result<Value> {
            let page: usize = params["page"].parse().unwrap();
            Ok(self.0.get(page - 1).cloned().unwrap_or_else(|| json!([])))
        }
    }

    struct Broken;

    #[async_trait]
    impl PageFetcher for Broken {
        async fn fetch(
            &self,
            path: &str,
            _params: &crate::pagination::QueryParams,
        ) -> crate::error::Result<Value> {
            Err(EtlError::Http {
                status: 500,
                url: path.to_string(),
            })
        }
    }

    fn target() -> ExtractTarget {
        ExtractTarget {
            source: "api".into(),
            endpoint: "things".into(),
            blob_path: bronze_path("api", "things", date()),
        }
    }

    #[tokio::test]
    async fn test_extract_endpoint_writes_bronze_and_ledger() {
        let tmp = TempDir::new().unwrap();
        let pool = db::connect_path(&tmp.path().join("w.sqlite")).await.unwrap();
        migrate::migrate(&pool).await.unwrap();
        let store = MemoryBlobStore::new();
        let ctx = ExtractContext {
            store: &store,
            container: "datalake",
            pool: &pool,
            run_id: "run-1",
            run_date: date(),
        };
        let pagination = PaginationConfig {
            page_size: 2,
            delay_ms: 0,
            ..PaginationConfig::default()
        };
        let fetcher = Pages(vec![
            json!([{"id": 1}, {"id": 2}]),
            json!({"data": [{"id": 3, "name": "Zoë"}]}),
        ]);

        let outcome = extract_endpoint(&fetcher, "/things", &pagination, None, target(), &ctx)
            .await
            .unwrap();
        assert_eq!(outcome.records, 3);

        let text = store
            .get_text("datalake", "bronze/api/things/run_date=2026-02-01/data.jsonl")
            .await
            .unwrap();
        let records = parse_jsonl(&text).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[2]["name"], json!("Zoë"));

        let entries = ledger::recent(&pool, 5).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].source, "api/things");
        assert_eq!(entries[0].row_count, 3);
        assert_eq!(
            entries[0].content_sha256.as_deref(),
            Some(ledger::sha256_hex(text.as_bytes()).as_str())
        );
    }

    #[tokio::test]
    async fn test_failed_extraction_writes_nothing_and_is_recorded() {
        let tmp = TempDir::new().unwrap();
        let pool = db::connect_path(&tmp.path().join("w.sqlite")).await.unwrap();
        migrate::migrate(&pool).await.unwrap();
        let store = MemoryBlobStore::new();
        let ctx = ExtractContext {
            store: &store,
            container: "datalake",
            pool: &pool,
            run_id: "run-2",
            run_date: date(),
        };

        let err = extract_endpoint(
            &Broken,
            "/things",
            &PaginationConfig::default(),
            None,
            target(),
            &ctx,
        )
        .await
        .unwrap_err();
        assert!(format!("{:#}", err).contains("HTTP 500"));
        assert!(store.list("datalake", "bronze/").await.unwrap().is_empty());

        let entries = ledger::recent(&pool, 5).await.unwrap();
        assert_eq!(entries[0].status, "failed");
    }
}
