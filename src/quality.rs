//! Data quality checks over tabular batches.
//!
//! Checks never fail with an error: a failed check is a [`QualityResult`]
//! with `passed = false`. [`run_checks`] always runs every check.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::models::Batch;

/// Outcome of one check.
#[derive(Debug, Clone, PartialEq)]
pub struct QualityResult {
    pub check_name: String,
    pub passed: bool,
    pub detail: String,
}

/// A configured check, as written in `[[load.tables]].checks`.
///
/// ```toml
/// checks = [
///   { kind = "min_rows", min_rows = 1 },
///   { kind = "non_null", column = "id", max_null_rate = 0.0 },
/// ]
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QualityCheck {
    MinRows {
        min_rows: usize,
        #[serde(default = "default_min_rows_name")]
        name: String,
    },
    NonNull {
        column: String,
        #[serde(default = "default_max_null_rate")]
        max_null_rate: f64,
        #[serde(default = "default_non_null_name")]
        name: String,
    },
}

fn default_min_rows_name() -> String {
    "min_rows".to_string()
}
fn default_non_null_name() -> String {
    "non_null".to_string()
}
fn default_max_null_rate() -> f64 {
    0.01
}

impl QualityCheck {
    pub fn validate(&self) -> Result<()> {
        if let QualityCheck::NonNull {
            column,
            max_null_rate,
            ..
        } = self
        {
            if column.is_empty() {
                bail!("non_null check needs a column");
            }
            if !(0.0..=1.0).contains(max_null_rate) {
                bail!("max_null_rate must be in [0.0, 1.0] (got {})", max_null_rate);
            }
        }
        Ok(())
    }

    pub fn run(&self, batch: &Batch) -> QualityResult {
        match self {
            QualityCheck::MinRows { min_rows, name } => check_min_rows(batch, *min_rows, name),
            QualityCheck::NonNull {
                column,
                max_null_rate,
                name,
            } => check_non_null(batch, column, *max_null_rate, name),
        }
    }
}

/// Passes iff the batch has at least `min_rows` rows.
pub fn check_min_rows(batch: &Batch, min_rows: usize, name: &str) -> QualityResult {
    let rows = batch.len();
    QualityResult {
        check_name: name.to_string(),
        passed: rows >= min_rows,
        detail: format!("rows={} min_rows={}", rows, min_rows),
    }
}

/// Passes iff the share of null values in `column` is at most
/// `max_null_rate`. A missing column fails. An empty batch has rate 0.
pub fn check_non_null(batch: &Batch, column: &str, max_null_rate: f64, name: &str) -> QualityResult {
    let check_name = format!("{}:{}", name, column);
    let Some(values) = batch.column_values(column) else {
        return QualityResult {
            check_name,
            passed: false,
            detail: format!("missing_column={}", column),
        };
    };

    let nulls = values.filter(|v| matches!(v, Value::Null)).count();
    let null_rate = if batch.is_empty() {
        0.0
    } else {
        nulls as f64 / batch.len() as f64
    };

    QualityResult {
        check_name,
        passed: null_rate <= max_null_rate,
        detail: format!(
            "null_rate={:.4} max_null_rate={:.4}",
            null_rate, max_null_rate
        ),
    }
}

/// Run every check against `batch`, in order.
pub fn run_checks(batch: &Batch, checks: &[QualityCheck]) -> Vec<QualityResult> {
    checks.iter().map(|c| c.run(batch)).collect()
}

/// One line per result: `✅ name: detail` or `❌ name: detail`.
pub fn format_results(results: &[QualityResult]) -> String {
    results
        .iter()
        .map(|r| {
            let icon = if r.passed { "✅" } else { "❌" };
            format!("{} {}: {}", icon, r.check_name, r.detail)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn all_passed(results: &[QualityResult]) -> bool {
    results.iter().all(|r| r.passed)
}

/// Delivery channel for pre-formatted check reports.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, subject: &str, text: &str) -> Result<()>;
}

/// Writes reports to the log.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, subject: &str, text: &str) -> Result<()> {
        if text.contains('❌') {
            warn!(subject, "quality checks failed:\n{}", text);
        } else {
            info!(subject, "quality checks passed:\n{}", text);
        }
        Ok(())
    }
}
