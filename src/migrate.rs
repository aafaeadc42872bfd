use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create the run ledger. Idempotent.
pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS etl_runs (
            id TEXT PRIMARY KEY,
            run_id TEXT NOT NULL,
            stage TEXT NOT NULL,
            source TEXT NOT NULL,
            target TEXT NOT NULL,
            run_date TEXT NOT NULL,
            row_count INTEGER NOT NULL,
            content_sha256 TEXT,
            status TEXT NOT NULL,
            detail TEXT,
            finished_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_etl_runs_run_id ON etl_runs(run_id)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_etl_runs_finished_at ON etl_runs(finished_at DESC)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
