//! # Lakehouse ETL
//!
//! Batch ETL from paginated HTTP APIs through a bronze/silver/gold data lake
//! into a SQLite warehouse.
//!
//! Two pieces carry the weight:
//!
//! - the incremental paginated extraction in [`pagination`]: a lazy stream of
//!   records that stops on an empty or short page, applies a "changed since"
//!   window, paces requests and survives one credential expiry;
//! - the upsert in [`warehouse`]: a staging + merge that makes loading the
//!   same batch twice a no-op.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌────────────┐   ┌───────────┐
//! │  Fetchers   │──▶│  paginate  │──▶│  bronze   │
//! │ REST / QBO  │   │  (Stream)  │   │  JSONL    │
//! └─────────────┘   └────────────┘   └─────┬─────┘
//!                                          │  external transform
//!                                          ▼
//! ┌─────────────┐   ┌────────────┐   ┌───────────┐
//! │  warehouse  │◀──│  quality   │◀──│  curated  │
//! │   upsert    │   │   gate     │   │  parquet  │
//! └─────────────┘   └────────────┘   └───────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! etl init                          # create the warehouse ledger
//! etl sources                       # show configured endpoints and tables
//! etl extract all                   # APIs -> bronze
//! etl load                          # gold parts -> warehouse
//! etl runs                          # recent ledger entries
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`logging`] | `tracing` subscriber setup |
//! | [`error`] | Error taxonomy |
//! | [`models`] | Records and tabular batches |
//! | [`pagination`] | Page fetcher contract and the record stream |
//! | [`connector_rest`] | Generic REST fetcher |
//! | [`connector_quickbooks`] | QuickBooks Online fetcher |
//! | [`jsonl`] | Bronze JSONL rendering |
//! | [`storage`] | Blob store and lake paths |
//! | [`secrets`] | Secret lookup |
//! | [`quality`] | Quality checks and notification |
//! | [`warehouse`] | Staging + merge upsert |
//! | [`extract`] | Extract pipeline |
//! | [`load`] | Load pipeline |
//! | [`ledger`] | Run ledger |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod config;
pub mod connector_quickbooks;
pub mod connector_rest;
pub mod db;
pub mod error;
pub mod extract;
pub mod jsonl;
pub mod ledger;
pub mod load;
pub mod logging;
pub mod migrate;
pub mod models;
pub mod pagination;
pub mod quality;
pub mod secrets;
pub mod sources;
pub mod storage;
pub mod warehouse;
