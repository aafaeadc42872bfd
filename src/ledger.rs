//! Run ledger.
//!
//! Every extract and load step appends one row to `etl_runs`: what moved
//! where, how many rows, and a SHA-256 of the payload written to the lake.
//! `etl runs` prints the most recent entries.

use anyhow::Result;
use chrono::NaiveDate;
use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::config::Config;
use crate::db;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Extract,
    Load,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Extract => "extract",
            Stage::Load => "load",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Succeeded,
    Skipped,
    Failed,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Succeeded => "succeeded",
            Status::Skipped => "skipped",
            Status::Failed => "failed",
        }
    }
}

/// One ledger row.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerEntry {
    pub run_id: String,
    pub stage: String,
    pub source: String,
    pub target: String,
    pub run_date: String,
    pub row_count: i64,
    pub content_sha256: Option<String>,
    pub status: String,
    pub detail: Option<String>,
    pub finished_at: i64,
}

impl LedgerEntry {
    pub fn new(run_id: &str, stage: Stage, source: &str, target: &str, run_date: NaiveDate) -> Self {
        Self {
            run_id: run_id.to_string(),
            stage: stage.as_str().to_string(),
            source: source.to_string(),
            target: target.to_string(),
            run_date: run_date.format("%Y-%m-%d").to_string(),
            row_count: 0,
            content_sha256: None,
            status: Status::Succeeded.as_str().to_string(),
            detail: None,
            finished_at: chrono::Utc::now().timestamp(),
        }
    }

    pub fn rows(mut self, count: usize) -> Self {
        self.row_count = count as i64;
        self
    }

    pub fn sha256(mut self, payload: &[u8]) -> Self {
        self.content_sha256 = Some(sha256_hex(payload));
        self
    }

    pub fn status(mut self, status: Status, detail: Option<String>) -> Self {
        self.status = status.as_str().to_string();
        self.detail = detail;
        self
    }
}

pub fn new_run_id() -> String {
    Uuid::new_v4().to_string()
}

pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

pub async fn record(pool: &SqlitePool, entry: &LedgerEntry) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO etl_runs
            (id, run_id, stage, source, target, run_date, row_count,
             content_sha256, status, detail, finished_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(Uuid::new_v4().to_string())
    .bind(&entry.run_id)
    .bind(&entry.stage)
    .bind(&entry.source)
    .bind(&entry.target)
    .bind(&entry.run_date)
    .bind(entry.row_count)
    .bind(&entry.content_sha256)
    .bind(&entry.status)
    .bind(&entry.detail)
    .bind(entry.finished_at)
    .execute(pool)
    .await?;
    Ok(())
}

/// Most recent entries first.
pub async fn recent(pool: &SqlitePool, limit: i64) -> Result<Vec<LedgerEntry>> {
    let rows = sqlx::query(
        r#"
        SELECT run_id, stage, source, target, run_date, row_count,
               content_sha256, status, detail, finished_at
        FROM etl_runs
        ORDER BY finished_at DESC, rowid DESC
        LIMIT ?
        "#,
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| LedgerEntry {
            run_id: row.get("run_id"),
            stage: row.get("stage"),
            source: row.get("source"),
            target: row.get("target"),
            run_date: row.get("run_date"),
            row_count: row.get("row_count"),
            content_sha256: row.get("content_sha256"),
            status: row.get("status"),
            detail: row.get("detail"),
            finished_at: row.get("finished_at"),
        })
        .collect())
}

/// `etl runs`: print the last `limit` ledger entries.
pub async fn run_list(config: &Config, limit: i64) -> Result<()> {
    let pool = db::connect(config).await?;
    let entries = recent(&pool, limit).await?;
    pool.close().await;

    if entries.is_empty() {
        println!("No runs recorded. Run `etl extract` or `etl load` first.");
        return Ok(());
    }

    println!(
        "{:<17} {:<8} {:<10} {:<28} {:<36} {:>8}  {:<9} {}",
        "FINISHED", "STAGE", "RUN DATE", "SOURCE", "TARGET", "ROWS", "STATUS", "RUN"
    );
    for e in &entries {
        println!(
            "{:<17} {:<8} {:<10} {:<28} {:<36} {:>8}  {:<9} {}",
            format_ts(e.finished_at),
            e.stage,
            e.run_date,
            e.source,
            e.target,
            e.row_count,
            e.status,
            &e.run_id[..8.min(e.run_id.len())]
        );
        if let Some(detail) = &e.detail {
            println!("  {}", detail);
        }
    }
    Ok(())
}

fn format_ts(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate;
    use tempfile::TempDir;

    #[test]
    fn test_sha256_hex() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[tokio::test]
    async fn test_record_and_list_recent() {
        let tmp = TempDir::new().unwrap();
        let pool = db::connect_path(&tmp.path().join("w.sqlite")).await.unwrap();
        migrate::migrate(&pool).await.unwrap();

        let date = NaiveDate::from_ymd_opt(2026, 2, 1).unwrap();
        let run_id = new_run_id();
        let first = LedgerEntry::new(&run_id, Stage::Extract, "api/things", "bronze/x", date)
            .rows(3)
            .sha256(b"{}\n");
        let second = LedgerEntry::new(&run_id, Stage::Load, "gold/core/t", "dim_t", date)
            .status(Status::Failed, Some("checks failed".into()));
        record(&pool, &first).await.unwrap();
        record(&pool, &second).await.unwrap();

        let entries = recent(&pool, 10).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].stage, "load");
        assert_eq!(entries[0].status, "failed");
        assert_eq!(entries[1].row_count, 3);
        assert_eq!(entries[1].run_date, "2026-02-01");
        assert_eq!(entries[1].content_sha256.as_deref(), Some(sha256_hex(b"{}\n").as_str()));

        assert_eq!(recent(&pool, 1).await.unwrap().len(), 1);
    }
}
