//! Error types for the extraction and load core.
//!
//! Pipelines and the CLI wrap these in `anyhow` with context; the core
//! components return [`EtlError`] so callers can match on the failure kind
//! (for example the producer's single retry on [`EtlError::AuthExpired`]).

use thiserror::Error;

/// Result alias for core operations.
pub type Result<T> = std::result::Result<T, EtlError>;

/// Failure kinds surfaced by fetchers, the sequence producer, the sink
/// collaborators and the upsert engine.
#[derive(Error, Debug)]
pub enum EtlError {
    /// Non-2xx response. Never retried by the fetcher.
    #[error("HTTP {status} from {url}")]
    Http { status: u16, url: String },

    /// A page payload that is neither a list of records nor an object with a
    /// list under `data`, `items` or `results`.
    #[error("unsupported response shape: {0}")]
    UnsupportedResponseShape(String),

    /// HTTP 401 from a source that can refresh its credentials.
    #[error("authentication expired for {url}")]
    AuthExpired { url: String },

    /// Missing or invalid configuration value or secret.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Network failure or client timeout.
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error(transparent)]
    Merge(#[from] MergeError),
}

/// Failures of the staging + merge sequence.
#[derive(Error, Debug)]
pub enum MergeError {
    #[error("invalid key columns: {0}")]
    InvalidKeys(String),

    #[error("null value in key column '{column}' at batch row {row}")]
    NullKey { column: String, row: usize },

    #[error("invalid identifier: '{0}'")]
    InvalidIdentifier(String),

    #[error("target table '{0}' does not exist")]
    TargetMissing(String),

    #[error(
        "column mismatch for '{table}': missing in target {missing_in_target:?}, missing in batch {missing_in_batch:?}"
    )]
    SchemaMismatch {
        table: String,
        missing_in_target: Vec<String>,
        missing_in_batch: Vec<String>,
    },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl EtlError {
    /// HTTP status carried by the error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            EtlError::Http { status, .. } => Some(*status),
            EtlError::AuthExpired { .. } => Some(401),
            EtlError::Transport(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}
