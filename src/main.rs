//! # Lakehouse ETL CLI (`etl`)
//!
//! ## Usage
//!
//! ```bash
//! etl --config ./config/etl.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `etl init` | Create the warehouse database and the run ledger |
//! | `etl sources` | List configured endpoints and load tables |
//! | `etl extract [selector]` | Pull API data into bronze JSONL |
//! | `etl load [--table T]` | Check and upsert curated parquet into the warehouse |
//! | `etl check <table>` | Run a table's quality checks without loading |
//! | `etl run` | `extract all`, then `load` |
//! | `etl runs` | Show recent ledger entries |
//!
//! ## Examples
//!
//! ```bash
//! # Only one REST source, for a past date
//! etl extract rest:superoperator --run-date 2026-02-01
//!
//! # See what would be written without calling any API
//! etl extract all --dry-run
//!
//! # Load a single table
//! etl load --table dim_customers
//! ```

use anyhow::Context;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::error;

use lakehouse_etl::{config, extract, ledger, load, logging, migrate, sources};

/// Lakehouse ETL: paginated APIs → bronze/silver/gold lake → SQL warehouse.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/etl.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "etl",
    about = "Batch ETL from paginated APIs through a layered data lake into a SQL warehouse",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/etl.toml")]
    config: PathBuf,

    /// Partition date (YYYY-MM-DD). Overrides `RUN_DATE` and `[run].run_date`;
    /// defaults to today in UTC.
    #[arg(long, global = true)]
    run_date: Option<NaiveDate>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the warehouse database and the run ledger. Idempotent.
    Init,

    /// List configured sources, endpoints and load tables.
    Sources,

    /// Extract API data into the bronze layer.
    ///
    /// Selector format: `all`, `rest`, `rest:<source>`, `quickbooks`,
    /// or `quickbooks:<entity>`.
    Extract {
        #[arg(default_value = "all")]
        selector: String,

        /// Print the bronze paths that would be written, without fetching.
        #[arg(long)]
        dry_run: bool,
    },

    /// Load curated parquet parts into warehouse tables.
    Load {
        /// Load only this warehouse table.
        #[arg(long)]
        table: Option<String>,
    },

    /// Run a table's quality checks against its curated parts.
    Check { table: String },

    /// Extract everything, then load everything, for one run date.
    Run,

    /// Show recent run ledger entries.
    Runs {
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env is fine
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    logging::init_logging(&cfg.log).context("initializing logging")?;

    let result = dispatch(&cli, &cfg).await;
    if let Err(e) = &result {
        error!(error = %format!("{:#}", e), "command failed");
    }
    result
}

async fn dispatch(cli: &Cli, cfg: &config::Config) -> anyhow::Result<()> {
    match &cli.command {
        Commands::Init => {
            migrate::run_migrations(cfg).await?;
            println!("Warehouse initialized at {}.", cfg.warehouse.path.display());
        }
        Commands::Sources => {
            sources::list_sources(cfg)?;
        }
        Commands::Extract { selector, dry_run } => {
            let run_date = cfg.resolve_run_date(cli.run_date)?;
            extract::run_extract(cfg, selector, run_date, *dry_run).await?;
        }
        Commands::Load { table } => {
            let run_date = cfg.resolve_run_date(cli.run_date)?;
            load::run_load(cfg, table.as_deref(), run_date).await?;
        }
        Commands::Check { table } => {
            let run_date = cfg.resolve_run_date(cli.run_date)?;
            load::run_check(cfg, table, run_date).await?;
        }
        Commands::Run => {
            let run_date = cfg.resolve_run_date(cli.run_date)?;
            extract::run_extract(cfg, "all", run_date, false).await?;
            load::run_load(cfg, None, run_date).await?;
        }
        Commands::Runs { limit } => {
            ledger::run_list(cfg, *limit).await?;
        }
    }
    Ok(())
}
