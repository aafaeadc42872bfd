//! Upsert of tabular batches into warehouse tables.
//!
//! [`upsert_batch`] stages the batch in `tmp_{table}` and merges it into the
//! target: rows whose key tuple already exists get every non-key column
//! overwritten, the rest are inserted. Key tuples not in the batch are left
//! alone.
//!
//! # Transaction scope
//!
//! Staging, merge and staging removal run in one transaction. The staging
//! table is created inside that transaction, so any failure rolls back its
//! creation together with the partial merge. A staging table left behind by
//! some other path is dropped and recreated before use, never appended to.
//!
//! Concurrent upserts into the same target are not supported: they would share
//! the staging table name.
//!
//! # Matching
//!
//! Staged values go through the target's column affinities first, so a key
//! compares the way it is stored: the integer `1` bound into a `TEXT` key
//! column matches the stored text `'1'` on the next load. After that, key
//! equality is strict: values must be equal and share the same SQLite storage
//! class, so in an untyped column the text `'1'` never matches the integer
//! `1`. Within one batch the last occurrence of a key tuple wins. Null keys
//! are rejected.

use std::collections::HashMap;

use serde_json::Value;
use sqlx::{QueryBuilder, Sqlite, SqliteConnection, SqlitePool};
use tracing::{debug, info};

use crate::error::{MergeError, Result};
use crate::models::Batch;

/// SQLite's default bound-parameter limit on older builds.
const MAX_BIND_PARAMS: usize = 999;

/// What an upsert did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// The batch was empty; nothing was touched.
    Skipped,
    Merged {
        /// Rows staged after collapsing duplicate keys.
        staged: usize,
        updated: u64,
        inserted: u64,
    },
}

/// A possibly schema-qualified table name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableName {
    schema: Option<String>,
    name: String,
}

impl TableName {
    pub fn parse(raw: &str) -> std::result::Result<Self, MergeError> {
        let parts: Vec<&str> = raw.split('.').collect();
        let (schema, name) = match parts.as_slice() {
            [name] => (None, *name),
            [schema, name] => (Some(*schema), *name),
            _ => return Err(MergeError::InvalidIdentifier(raw.to_string())),
        };
        if let Some(s) = schema {
            check_identifier(s)?;
        }
        check_identifier(name)?;
        Ok(Self {
            schema: schema.map(str::to_string),
            name: name.to_string(),
        })
    }

    pub fn quoted(&self) -> String {
        match &self.schema {
            Some(schema) => format!("{}.{}", quote(schema), quote(&self.name)),
            None => quote(&self.name),
        }
    }

    /// `tmp_{name}` in the same schema.
    pub fn staging(&self) -> TableName {
        TableName {
            schema: self.schema.clone(),
            name: format!("tmp_{}", self.name),
        }
    }

    fn schema_or_main(&self) -> &str {
        self.schema.as_deref().unwrap_or("main")
    }
}

fn check_identifier(ident: &str) -> std::result::Result<(), MergeError> {
    if ident.is_empty() || ident.contains('"') || ident.contains('\0') {
        return Err(MergeError::InvalidIdentifier(ident.to_string()));
    }
    Ok(())
}

fn quote(ident: &str) -> String {
    format!("\"{}\"", ident)
}

/// Merge `batch` into `table`, keyed by `key_columns`.
///
/// # Errors
///
/// - [`MergeError::InvalidKeys`]: no keys, a repeated key, or a key that is
///   not a batch column;
/// - [`MergeError::NullKey`]: a key value is null;
/// - [`MergeError::TargetMissing`] / [`MergeError::SchemaMismatch`]: the
///   target does not exist or its columns differ from the batch's;
/// - [`MergeError::Database`]: any statement failed. The transaction is rolled
///   back and the target is unchanged.
pub async fn upsert_batch(
    pool: &SqlitePool,
    batch: &Batch,
    table: &str,
    key_columns: &[String],
) -> Result<UpsertOutcome> {
    if batch.is_empty() {
        info!(table, "batch is empty; skipping upsert");
        return Ok(UpsertOutcome::Skipped);
    }

    let target = TableName::parse(table)?;
    let key_idx = key_indexes(batch, key_columns)?;
    for column in batch.columns() {
        check_identifier(column)?;
    }

    let rows = latest_rows(batch, &key_idx)?;
    if rows.len() < batch.len() {
        debug!(
            table,
            duplicates = batch.len() - rows.len(),
            "collapsed duplicate keys (last occurrence wins)"
        );
    }

    let mut tx = pool.begin().await.map_err(MergeError::from)?;

    check_target_columns(&mut tx, &target, batch.columns()).await?;

    let staging = StagingTable::create(&mut tx, &target, batch.columns()).await?;
    staging.load(&mut tx, &rows).await?;
    let (updated, inserted) = staging.merge_into(&mut tx, &target, key_columns).await?;
    staging.remove(&mut tx).await?;

    tx.commit().await.map_err(MergeError::from)?;

    info!(
        table,
        staged = rows.len(),
        updated,
        inserted,
        "upserted batch"
    );
    Ok(UpsertOutcome::Merged {
        staged: rows.len(),
        updated,
        inserted,
    })
}

fn key_indexes(batch: &Batch, key_columns: &[String]) -> std::result::Result<Vec<usize>, MergeError> {
    if key_columns.is_empty() {
        return Err(MergeError::InvalidKeys("at least one key column is required".into()));
    }
    let mut idx = Vec::with_capacity(key_columns.len());
    for (i, key) in key_columns.iter().enumerate() {
        if key_columns[..i].contains(key) {
            return Err(MergeError::InvalidKeys(format!("'{}' listed twice", key)));
        }
        let pos = batch
            .column_index(key)
            .ok_or_else(|| MergeError::InvalidKeys(format!("'{}' is not a batch column", key)))?;
        idx.push(pos);
    }
    Ok(idx)
}

/// Rows with duplicate key tuples collapsed to their last occurrence, in
/// the order those last occurrences appear.
fn latest_rows<'b>(
    batch: &'b Batch,
    key_idx: &[usize],
) -> std::result::Result<Vec<&'b Vec<Value>>, MergeError> {
    let mut last: HashMap<String, usize> = HashMap::with_capacity(batch.len());
    for (row_no, row) in batch.rows().iter().enumerate() {
        let mut key = Vec::with_capacity(key_idx.len());
        for &i in key_idx {
            if row[i].is_null() {
                return Err(MergeError::NullKey {
                    column: batch.columns()[i].clone(),
                    row: row_no,
                });
            }
            key.push(&row[i]);
        }
        // JSON text keeps the type: "1" and 1 stay distinct
        last.insert(Value::from(key.into_iter().cloned().collect::<Vec<_>>()).to_string(), row_no);
    }

    let mut keep: Vec<usize> = last.into_values().collect();
    keep.sort_unstable();
    Ok(keep.into_iter().map(|i| &batch.rows()[i]).collect())
}

async fn check_target_columns(
    conn: &mut SqliteConnection,
    target: &TableName,
    columns: &[String],
) -> std::result::Result<(), MergeError> {
    let existing: Vec<String> =
        sqlx::query_scalar("SELECT name FROM pragma_table_info(?1, ?2) ORDER BY cid")
            .bind(&target.name)
            .bind(target.schema_or_main())
            .fetch_all(&mut *conn)
            .await?;

    if existing.is_empty() {
        return Err(MergeError::TargetMissing(target.quoted()));
    }

    let has = |set: &[String], c: &str| set.iter().any(|s| s.eq_ignore_ascii_case(c));
    let missing_in_target: Vec<String> = columns
        .iter()
        .filter(|c| !has(&existing, c))
        .cloned()
        .collect();
    let missing_in_batch: Vec<String> = existing
        .iter()
        .filter(|c| !has(columns, c))
        .cloned()
        .collect();

    if missing_in_target.is_empty() && missing_in_batch.is_empty() {
        Ok(())
    } else {
        Err(MergeError::SchemaMismatch {
            table: target.quoted(),
            missing_in_target,
            missing_in_batch,
        })
    }
}

/// The staging table, alive for the duration of one transaction.
struct StagingTable {
    table: TableName,
    columns: Vec<String>,
}

impl StagingTable {
    /// Drop any leftover staging table and create an empty copy of the
    /// target's columns.
    ///
    /// The copy carries the target's column affinities, so a staged value is
    /// converted exactly as it would be on insert into the target.
    async fn create(
        conn: &mut SqliteConnection,
        target: &TableName,
        columns: &[String],
    ) -> std::result::Result<Self, MergeError> {
        let table = target.staging();
        sqlx::query(&format!("DROP TABLE IF EXISTS {}", table.quoted()))
            .execute(&mut *conn)
            .await?;

        sqlx::query(&format!(
            "CREATE TABLE {} AS SELECT * FROM {} WHERE 0",
            table.quoted(),
            target.quoted()
        ))
        .execute(&mut *conn)
        .await?;

        Ok(Self {
            table,
            columns: columns.to_vec(),
        })
    }

    async fn load(
        &self,
        conn: &mut SqliteConnection,
        rows: &[&Vec<Value>],
    ) -> std::result::Result<(), MergeError> {
        let cols = self.column_list(None);
        let rows_per_insert = (MAX_BIND_PARAMS / self.columns.len()).max(1);

        for chunk in rows.chunks(rows_per_insert) {
            let mut qb: QueryBuilder<'_, Sqlite> =
                QueryBuilder::new(format!("INSERT INTO {} ({}) ", self.table.quoted(), cols));
            qb.push_values(chunk, |mut b, row| {
                for value in row.iter() {
                    match value {
                        Value::Null => {
                            b.push_bind(Option::<String>::None);
                        }
                        Value::Bool(v) => {
                            b.push_bind(*v);
                        }
                        Value::Number(n) => {
                            if let Some(i) = n.as_i64() {
                                b.push_bind(i);
                            } else {
                                b.push_bind(n.as_f64());
                            }
                        }
                        Value::String(s) => {
                            b.push_bind(s.clone());
                        }
                        nested => {
                            b.push_bind(nested.to_string());
                        }
                    }
                }
            });
            qb.build().execute(&mut *conn).await?;
        }
        Ok(())
    }

    /// Update matched rows, then insert unmatched ones. Returns
    /// `(updated, inserted)`.
    async fn merge_into(
        &self,
        conn: &mut SqliteConnection,
        target: &TableName,
        keys: &[String],
    ) -> std::result::Result<(u64, u64), MergeError> {
        let is_key = |c: &String| keys.iter().any(|k| k.eq_ignore_ascii_case(c));
        let matches = |alias: &str| {
            keys.iter()
                .map(|k| {
                    let k = quote(k);
                    format!(
                        "{a}.{k} = s.{k} AND typeof({a}.{k}) = typeof(s.{k})",
                        a = alias,
                        k = k
                    )
                })
                .collect::<Vec<_>>()
                .join(" AND ")
        };

        let set_clause = self
            .columns
            .iter()
            .filter(|c| !is_key(c))
            .map(|c| format!("{c} = s.{c}", c = quote(c)))
            .collect::<Vec<_>>()
            .join(", ");

        let updated = if set_clause.is_empty() {
            0
        } else {
            let sql = format!(
                "UPDATE {target} AS t SET {set} FROM {staging} AS s WHERE {on}",
                target = target.quoted(),
                set = set_clause,
                staging = self.table.quoted(),
                on = matches("t"),
            );
            sqlx::query(&sql).execute(&mut *conn).await?.rows_affected()
        };

        let sql = format!(
            "INSERT INTO {target} ({cols}) SELECT {s_cols} FROM {staging} AS s \
             WHERE NOT EXISTS (SELECT 1 FROM {target} AS x WHERE {on})",
            target = target.quoted(),
            cols = self.column_list(None),
            s_cols = self.column_list(Some("s")),
            staging = self.table.quoted(),
            on = matches("x"),
        );
        let inserted = sqlx::query(&sql).execute(&mut *conn).await?.rows_affected();

        Ok((updated, inserted))
    }

    async fn remove(self, conn: &mut SqliteConnection) -> std::result::Result<(), MergeError> {
        sqlx::query(&format!("DROP TABLE {}", self.table.quoted()))
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    fn column_list(&self, alias: Option<&str>) -> String {
        self.columns
            .iter()
            .map(|c| match alias {
                Some(a) => format!("{}.{}", a, quote(c)),
                None => quote(c),
            })
            .collect::<Vec<_>>()
            .join(", ")
    }
}
