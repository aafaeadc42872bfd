//! Load pipeline: curated parquet → quality gate → warehouse.
//!
//! For each configured table, the `part-*.parquet` files under
//! `{layer}/{domain}/{name}/run_date=YYYY-MM-DD/` are decoded into one
//! [`Batch`], checked, reported through the [`Notifier`], and upserted into
//! the warehouse table by its keys.
//!
//! With `[quality].halt_on_failure`, a failing check stops the load before
//! anything is written. Otherwise the failure is reported and the load goes
//! ahead.

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use chrono::NaiveDate;
use parquet::file::reader::{FileReader, SerializedFileReader};
use serde_json::Value;
use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::config::{Config, LoadTableConfig};
use crate::db;
use crate::ledger::{self, LedgerEntry, Stage, Status};
use crate::migrate;
use crate::models::{Batch, Record};
use crate::quality::{all_passed, format_results, run_checks, LogNotifier, Notifier, QualityResult};
use crate::storage::{curated_prefix, part_files, BlobStore, LocalBlobStore};
use crate::warehouse::{upsert_batch, UpsertOutcome};

/// Decode every row of a parquet file into a record.
pub fn decode_parquet(data: Vec<u8>) -> Result<Vec<Record>> {
    let reader = SerializedFileReader::new(Bytes::from(data)).context("not a parquet file")?;
    let mut records = Vec::new();
    for row in reader.get_row_iter(None)? {
        match row?.to_json_value() {
            Value::Object(record) => records.push(record),
            other => bail!("parquet row did not decode to an object: {}", other),
        }
    }
    Ok(records)
}

/// Curated parts of one table for one run date, decoded into a batch.
pub struct CuratedBatch {
    pub prefix: String,
    pub parts: Vec<String>,
    pub batch: Batch,
}

/// Read every `part-*.parquet` under the table's prefix.
///
/// Fails when there are no parts: a missing partition means the transform
/// did not run, which is not the same thing as an empty result.
pub async fn read_curated(
    store: &dyn BlobStore,
    container: &str,
    table: &LoadTableConfig,
    run_date: NaiveDate,
) -> Result<CuratedBatch> {
    let prefix = curated_prefix(table.layer, &table.domain, &table.name, run_date);
    let parts = part_files(&store.list(container, &prefix).await?)?;
    if parts.is_empty() {
        bail!("No part-*.parquet files under {}/{}", container, prefix);
    }

    let mut records = Vec::new();
    for part in &parts {
        let data = store.get_bytes(container, part).await?;
        records.extend(decode_parquet(data).with_context(|| format!("reading {}", part))?);
    }
    info!(prefix = %prefix, parts = parts.len(), rows = records.len(), "read curated parts");

    Ok(CuratedBatch {
        prefix,
        parts,
        batch: Batch::from_records(&records),
    })
}

/// Run the table's checks and hand the report to the notifier. Notifier
/// failures are logged, not propagated.
pub async fn gate(
    table: &LoadTableConfig,
    batch: &Batch,
    notifier: &dyn Notifier,
) -> Vec<QualityResult> {
    let results = run_checks(batch, &table.checks);
    if results.is_empty() {
        return results;
    }
    let subject = format!("quality: {}", table.table);
    if let Err(e) = notifier.notify(&subject, &format_results(&results)).await {
        warn!(table = %table.table, error = %e, "failed to send quality report");
    }
    results
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoadOutcome {
    pub table: String,
    pub rows: usize,
    pub checks: Vec<QualityResult>,
    pub upsert: UpsertOutcome,
}

/// Everything a load reads from and writes to.
pub struct LoadContext<'a> {
    pub store: &'a dyn BlobStore,
    pub container: &'a str,
    pub pool: &'a SqlitePool,
    pub notifier: &'a dyn Notifier,
    pub run_id: &'a str,
    pub run_date: NaiveDate,
    pub halt_on_failure: bool,
}

/// Load one table: read, check, upsert, record.
pub async fn load_table(table: &LoadTableConfig, ctx: &LoadContext<'_>) -> Result<LoadOutcome> {
    let curated = read_curated(ctx.store, ctx.container, table, ctx.run_date).await?;
    let checks = gate(table, &curated.batch, ctx.notifier).await;
    let entry = LedgerEntry::new(
        ctx.run_id,
        Stage::Load,
        &curated.prefix,
        &table.table,
        ctx.run_date,
    )
    .rows(curated.batch.len());

    if !all_passed(&checks) {
        let failed: Vec<&str> = checks
            .iter()
            .filter(|r| !r.passed)
            .map(|r| r.check_name.as_str())
            .collect();
        if ctx.halt_on_failure {
            let detail = format!("quality checks failed: {}", failed.join(", "));
            ledger::record(ctx.pool, &entry.status(Status::Failed, Some(detail.clone()))).await?;
            bail!("{}: {}", table.table, detail);
        }
        warn!(table = %table.table, failed = ?failed, "quality checks failed; loading anyway");
    }

    match upsert_batch(ctx.pool, &curated.batch, &table.table, &table.keys).await {
        Ok(upsert) => {
            let entry = match upsert {
                UpsertOutcome::Skipped => entry.status(Status::Skipped, Some("empty batch".into())),
                UpsertOutcome::Merged { .. } => entry,
            };
            ledger::record(ctx.pool, &entry).await?;
            Ok(LoadOutcome {
                table: table.table.clone(),
                rows: curated.batch.len(),
                checks,
                upsert,
            })
        }
        Err(e) => {
            ledger::record(ctx.pool, &entry.status(Status::Failed, Some(e.to_string()))).await?;
            Err(anyhow::Error::new(e).context(format!("upserting into {}", table.table)))
        }
    }
}

/// Tables to load: the named one, or all configured tables.
pub fn select_tables<'c>(config: &'c Config, table: Option<&str>) -> Result<Vec<&'c LoadTableConfig>> {
    match table {
        Some(name) => match config.load_table(name) {
            Some(t) => Ok(vec![t]),
            None => bail!("No load table named '{}' in config", name),
        },
        None => Ok(config.load.tables.iter().collect()),
    }
}

/// `etl load`: load tables into the warehouse and print a summary.
pub async fn run_load(config: &Config, table: Option<&str>, run_date: NaiveDate) -> Result<()> {
    let tables = select_tables(config, table)?;
    if tables.is_empty() {
        println!("Nothing to load: no [[load.tables]] configured.");
        return Ok(());
    }

    let pool = db::connect(config).await?;
    migrate::migrate(&pool).await?;
    let store = LocalBlobStore::new(&config.storage.root);
    let run_id = ledger::new_run_id();
    let ctx = LoadContext {
        store: &store,
        container: &config.storage.container,
        pool: &pool,
        notifier: &LogNotifier,
        run_id: &run_id,
        run_date,
        halt_on_failure: config.quality.halt_on_failure,
    };

    println!("load {}", run_date);
    for t in tables {
        let outcome = match load_table(t, &ctx).await {
            Ok(o) => o,
            Err(e) => {
                pool.close().await;
                return Err(e);
            }
        };
        let failed = outcome.checks.iter().filter(|r| !r.passed).count();
        match outcome.upsert {
            UpsertOutcome::Skipped => println!("  {}: empty batch, skipped", outcome.table),
            UpsertOutcome::Merged {
                staged,
                updated,
                inserted,
            } => println!(
                "  {}: {} rows, {} staged, {} updated, {} inserted, {} check(s) failed",
                outcome.table, outcome.rows, staged, updated, inserted, failed
            ),
        }
    }
    println!("  run: {}", run_id);
    println!("ok");

    pool.close().await;
    Ok(())
}

/// `etl check <table>`: run a table's checks against its curated parts
/// without loading. Exits non-zero when a check fails.
pub async fn run_check(config: &Config, table: &str, run_date: NaiveDate) -> Result<()> {
    let table = select_tables(config, Some(table))?[0];
    let store = LocalBlobStore::new(&config.storage.root);
    let curated = read_curated(&store, &config.storage.container, table, run_date).await?;
    let results = gate(table, &curated.batch, &LogNotifier).await;

    println!("check {} ({} rows from {} parts)", table.table, curated.batch.len(), curated.parts.len());
    if results.is_empty() {
        println!("  no checks configured");
    } else {
        for line in format_results(&results).lines() {
            println!("  {}", line);
        }
    }

    if !all_passed(&results) {
        bail!("quality checks failed for {}", table.table);
    }
    Ok(())
}
