//! Newline-delimited JSON rendering for the bronze layer.
//!
//! [`to_jsonl`] is total: every [`Record`] serializes. Non-ASCII text is
//! written as-is rather than `\u` escaped.

use anyhow::{Context, Result};
use futures::{Stream, TryStreamExt};

use crate::error::EtlError;
use crate::models::Record;

/// Render records as one JSON object per line, each line ending in `\n`.
///
/// Order is preserved; nothing is deduplicated. No records gives `""`.
pub fn to_jsonl<'a, I>(records: I) -> String
where
    I: IntoIterator<Item = &'a Record>,
{
    let mut out = String::new();
    for record in records {
        out.push_str(&serde_json::Value::Object(record.clone()).to_string());
        out.push('\n');
    }
    out
}

/// Parse text produced by [`to_jsonl`]. Blank lines are skipped.
pub fn parse_jsonl(text: &str) -> Result<Vec<Record>> {
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            serde_json::from_str::<Record>(line)
                .with_context(|| format!("invalid JSON object on line {}", i + 1))
        })
        .collect()
}

/// Drain a record stream into JSONL text, returning the text and the
/// number of records. The first stream error aborts.
pub async fn collect_jsonl<S>(records: S) -> Result<(String, usize), EtlError>
where
    S: Stream<Item = Result<Record, EtlError>>,
{
    let records: Vec<Record> = records.try_collect().await?;
    Ok((to_jsonl(&records), records.len()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn records() -> Vec<Record> {
        vec![
            json!({"id": 1, "name": "Zoë", "active": true, "balance": 12.5}),
            json!({"id": 2, "name": null, "tags": ["a", "b"], "address": {"city": "Oslo", "zip": "0150"}}),
            json!({"id": -3, "big": 9007199254740993u64, "ratio": 1e-7, "note": "line\nbreak \"quoted\""}),
        ]
        .into_iter()
        .map(|v| v.as_object().cloned().unwrap())
        .collect()
    }

    #[test]
    fn test_one_line_per_record() {
        let text = to_jsonl(&records());
        assert_eq!(text.lines().count(), 3);
        assert!(text.ends_with('\n'));
        assert!(text.contains("Zoë"));
    }

    #[test]
    fn test_empty_input_is_empty_string() {
        let none: Vec<Record> = Vec::new();
        assert_eq!(to_jsonl(&none), "");
    }

    #[test]
    fn test_round_trip() {
        let original = records();
        let parsed = parse_jsonl(&to_jsonl(&original)).unwrap();
        assert_eq!(parsed, original);
    }

    #[test]
    fn test_round_trip_keeps_full_precision_doubles() {
        // xorshift64 over raw bit patterns covers every exponent range
        let mut state: u64 = 0x9E37_79B9_7F4A_7C15;
        let mut originals = Vec::new();
        while originals.len() < 20_000 {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            let v = f64::from_bits(state);
            if v.is_finite() {
                originals.push(json!({ "v": v }).as_object().cloned().unwrap());
            }
        }
        for v in [0.1, 1.0 / 3.0, f64::MAX, f64::MIN_POSITIVE, 5e-324, 1.0715660391465826e-75] {
            originals.push(json!({ "v": v }).as_object().cloned().unwrap());
        }

        let parsed = parse_jsonl(&to_jsonl(&originals)).unwrap();
        assert_eq!(parsed.len(), originals.len());
        for (before, after) in originals.iter().zip(&parsed) {
            assert_eq!(
                before["v"].as_f64().unwrap().to_bits(),
                after["v"].as_f64().unwrap().to_bits(),
                "{} came back as {}",
                before["v"],
                after["v"]
            );
        }
    }

    #[test]
    fn test_idempotent() {
        let materialized = records();
        assert_eq!(to_jsonl(&materialized), to_jsonl(&materialized));
    }

    #[test]
    fn test_parse_reports_bad_line() {
        let err = parse_jsonl("{\"id\": 1}\nnot json\n").unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }

    #[tokio::test]
    async fn test_collect_jsonl_counts_records() {
        let stream = futures::stream::iter(records().into_iter().map(Ok::<Record, EtlError>));
        let (text, count) = collect_jsonl(stream).await.unwrap();
        assert_eq!(count, 3);
        assert_eq!(parse_jsonl(&text).unwrap().len(), 3);
    }
}
