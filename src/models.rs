//! Core data types flowing through the pipeline.
//!
//! Sources produce [`Record`]s (schemaless JSON objects). The load side works
//! on [`Batch`]es: records aligned to one ordered column set.

use anyhow::{bail, Result};
use serde_json::{Map, Value};

/// One item produced by a source: field name → scalar or nested value.
pub type Record = Map<String, Value>;

/// An ordered sequence of rows sharing a common column set.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Batch {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

impl Batch {
    /// Build a batch from explicit columns and rows.
    ///
    /// Fails if a column name repeats or a row's width differs from the
    /// column count.
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Result<Self> {
        for (i, c) in columns.iter().enumerate() {
            if columns[..i].contains(c) {
                bail!("duplicate column '{}'", c);
            }
        }
        for (i, row) in rows.iter().enumerate() {
            if row.len() != columns.len() {
                bail!(
                    "row {} has {} values, expected {}",
                    i,
                    row.len(),
                    columns.len()
                );
            }
        }
        Ok(Self { columns, rows })
    }

    /// Align records to the union of their fields, in first-seen order.
    ///
    /// A field absent from a record becomes `null` in that row.
    pub fn from_records(records: &[Record]) -> Self {
        let mut columns: Vec<String> = Vec::new();
        for record in records {
            for key in record.keys() {
                if !columns.iter().any(|c| c == key) {
                    columns.push(key.clone());
                }
            }
        }

        let rows = records
            .iter()
            .map(|record| {
                columns
                    .iter()
                    .map(|c| record.get(c).cloned().unwrap_or(Value::Null))
                    .collect()
            })
            .collect();

        Self { columns, rows }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Values of one column, in row order.
    pub fn column_values<'a>(&'a self, name: &str) -> Option<impl Iterator<Item = &'a Value>> {
        let idx = self.column_index(name)?;
        Some(self.rows.iter().map(move |row| &row[idx]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(v: Value) -> Record {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_from_records_unions_columns_and_fills_nulls() {
        let records = vec![
            record(json!({"id": 1, "name": "a"})),
            record(json!({"id": 2, "email": "b@example.com"})),
        ];
        let batch = Batch::from_records(&records);

        assert_eq!(batch.len(), 2);
        assert_eq!(batch.columns().len(), 3);
        let email: Vec<&Value> = batch.column_values("email").unwrap().collect();
        assert_eq!(email, vec![&Value::Null, &json!("b@example.com")]);
        let name: Vec<&Value> = batch.column_values("name").unwrap().collect();
        assert_eq!(name, vec![&json!("a"), &Value::Null]);
    }

    #[test]
    fn test_from_no_records_is_empty() {
        let batch = Batch::from_records(&[]);
        assert!(batch.is_empty());
        assert!(batch.columns().is_empty());
    }

    #[test]
    fn test_new_rejects_ragged_rows() {
        let result = Batch::new(
            vec!["id".into(), "name".into()],
            vec![vec![json!(1), json!("a")], vec![json!(2)]],
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_new_rejects_duplicate_columns() {
        let result = Batch::new(vec!["id".into(), "id".into()], vec![]);
        assert!(result.is_err());
    }
}
