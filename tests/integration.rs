use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use parquet::data_type::{ByteArray, ByteArrayType, Int64Type};
use parquet::file::properties::WriterProperties;
use parquet::file::writer::SerializedFileWriter;
use parquet::schema::parser::parse_message_type;
use serde_json::json;
use tempfile::TempDir;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use lakehouse_etl::config::parse_config;
use lakehouse_etl::extract::{extract_selected, ExtractContext, Selector};
use lakehouse_etl::jsonl::parse_jsonl;
use lakehouse_etl::secrets::SecretProvider;
use lakehouse_etl::storage::{BlobStore, LocalBlobStore};
use lakehouse_etl::{db, ledger, migrate};

fn etl_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("etl");
    path
}

/// Config with one REST source pointing at `api_url` and one load table.
fn write_config(root: &Path, api_url: &str) -> PathBuf {
    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    let secrets_dir = root.join("secrets");
    fs::create_dir_all(&secrets_dir).unwrap();
    fs::write(secrets_dir.join("superoperator-api-key"), "test-key\n").unwrap();

    let config_content = format!(
        r#"[log]
level = "warn"

[storage]
root = "{root}/lake"

[secrets]
dir = "{root}/secrets"

[warehouse]
path = "{root}/data/warehouse.sqlite"

[sources.rest.superoperator]
base_url = "{api_url}"

[sources.rest.superoperator.auth]
secret = "superoperator-api-key"
header_name = "X-Api-Key"
header_template = "{{api_key}}"

[[sources.rest.superoperator.endpoints]]
name = "customers"
path = "/v1/customers"
pagination = {{ page_size = 2, delay_ms = 0 }}
incremental = {{ param = "updated_since", from_days_ago = 3 }}

[[load.tables]]
table = "dim_customers"
domain = "core"
name = "dim_customers"
keys = ["id"]
checks = [
  {{ kind = "min_rows", min_rows = 1 }},
  {{ kind = "non_null", column = "id", max_null_rate = 0.0 }},
]
"#,
        root = root.display(),
        api_url = api_url,
    );

    let config_path = config_dir.join("etl.toml");
    fs::write(&config_path, config_content).unwrap();
    config_path
}

fn run_etl(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = etl_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .env_remove("RUN_DATE")
        .env_remove("LOG_LEVEL")
        .env_remove("LOG_FORMAT")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run etl binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

async fn mount_customers(server: &MockServer) {
    for (page, ids) in [("1", vec![1, 2]), ("2", vec![3])] {
        let items: Vec<serde_json::Value> = ids
            .iter()
            .map(|id| json!({ "id": id, "name": format!("customer {}", id) }))
            .collect();
        Mock::given(method("GET"))
            .and(path("/v1/customers"))
            .and(header("x-api-key", "test-key"))
            .and(query_param("page", page))
            .and(query_param("per_page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": items })))
            .mount(server)
            .await;
    }
}

/// A gold part with `id INT64` and a UTF8 `name`.
fn write_gold_part(root: &Path, run_date: &str, ids: &[i64], names: &[&str]) {
    let dir = root
        .join("lake/datalake/gold/core/dim_customers")
        .join(format!("run_date={}", run_date));
    fs::create_dir_all(&dir).unwrap();

    let schema = Arc::new(
        parse_message_type("message t { REQUIRED INT64 id; REQUIRED BYTE_ARRAY name (UTF8); }")
            .unwrap(),
    );
    let file = fs::File::create(dir.join("part-00000-test.snappy.parquet")).unwrap();
    let mut writer =
        SerializedFileWriter::new(file, schema, Arc::new(WriterProperties::builder().build()))
            .unwrap();
    let mut group = writer.next_row_group().unwrap();

    let mut col = group.next_column().unwrap().unwrap();
    col.typed::<Int64Type>().write_batch(ids, None, None).unwrap();
    col.close().unwrap();

    let values: Vec<ByteArray> = names.iter().map(|n| ByteArray::from(*n)).collect();
    let mut col = group.next_column().unwrap().unwrap();
    col.typed::<ByteArrayType>()
        .write_batch(&values, None, None)
        .unwrap();
    col.close().unwrap();

    group.close().unwrap();
    writer.close().unwrap();
    fs::write(dir.join("_SUCCESS"), "").unwrap();
}

#[test]
fn test_init_creates_warehouse() {
    let tmp = TempDir::new().unwrap();
    let config_path = write_config(tmp.path(), "http://127.0.0.1:9");

    let (stdout, stderr, success) = run_etl(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data/warehouse.sqlite").exists());
}

#[test]
fn test_init_idempotent() {
    let tmp = TempDir::new().unwrap();
    let config_path = write_config(tmp.path(), "http://127.0.0.1:9");

    let (_, _, first) = run_etl(&config_path, &["init"]);
    assert!(first, "First init failed");
    let (_, _, second) = run_etl(&config_path, &["init"]);
    assert!(second, "Second init failed (not idempotent)");
}

#[test]
fn test_sources_lists_endpoints_and_tables() {
    let tmp = TempDir::new().unwrap();
    let config_path = write_config(tmp.path(), "http://127.0.0.1:9");

    let (stdout, _, success) = run_etl(&config_path, &["sources"]);
    assert!(success);
    assert!(stdout.contains("superoperator"));
    assert!(stdout.contains("customers"));
    assert!(stdout.contains("dim_customers"));
    assert!(stdout.contains("quickbooks"));
}

#[test]
fn test_extract_dry_run_makes_no_requests() {
    let tmp = TempDir::new().unwrap();
    // Nothing listens on the discard port; a real request would fail.
    let config_path = write_config(tmp.path(), "http://127.0.0.1:9");

    let (stdout, stderr, success) = run_etl(
        &config_path,
        &["extract", "all", "--dry-run", "--run-date", "2026-02-01"],
    );
    assert!(success, "dry run failed: stderr={}", stderr);
    assert!(stdout.contains("bronze/superoperator/customers/run_date=2026-02-01/data.jsonl"));
    assert!(!tmp.path().join("lake").exists());
}

#[test]
fn test_unknown_selector_fails() {
    let tmp = TempDir::new().unwrap();
    let config_path = write_config(tmp.path(), "http://127.0.0.1:9");

    let (_, _, success) = run_etl(&config_path, &["extract", "rest:nope", "--dry-run"]);
    assert!(!success);
}

#[test]
fn test_invalid_config_fails() {
    let tmp = TempDir::new().unwrap();
    let config_path = tmp.path().join("etl.toml");
    fs::write(&config_path, "[storage]\nroot = \"/tmp\"\n").unwrap();

    let (_, stderr, success) = run_etl(&config_path, &["sources"]);
    assert!(!success);
    assert!(stderr.contains("Failed to parse config file"));
}

#[tokio::test]
async fn test_extract_then_load_through_binary() {
    let server = MockServer::start().await;
    mount_customers(&server).await;

    let tmp = TempDir::new().unwrap();
    let config_path = write_config(tmp.path(), &server.uri());

    let (stdout, stderr, success) = run_etl(
        &config_path,
        &["extract", "rest:superoperator", "--run-date", "2026-02-01"],
    );
    assert!(success, "extract failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("3 records"));

    let bronze = tmp
        .path()
        .join("lake/datalake/bronze/superoperator/customers/run_date=2026-02-01/data.jsonl");
    let records = parse_jsonl(&fs::read_to_string(bronze).unwrap()).unwrap();
    assert_eq!(records.len(), 3);

    // the transform step is external; stand in for it with a gold part
    write_gold_part(tmp.path(), "2026-02-01", &[1, 2, 3], &["a", "b", "c"]);

    let pool = db::connect_path(&tmp.path().join("data/warehouse.sqlite"))
        .await
        .unwrap();
    sqlx::query("CREATE TABLE dim_customers (id INTEGER, name TEXT)")
        .execute(&pool)
        .await
        .unwrap();

    let (stdout, stderr, success) = run_etl(&config_path, &["load", "--run-date", "2026-02-01"]);
    assert!(success, "load failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("3 inserted"));

    // same partition again: nothing new
    let (stdout, _, success) = run_etl(&config_path, &["load", "--run-date", "2026-02-01"]);
    assert!(success);
    assert!(stdout.contains("0 inserted"));

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM dim_customers")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count, 3);
    pool.close().await;

    let (stdout, _, success) = run_etl(&config_path, &["runs", "--limit", "10"]);
    assert!(success);
    assert!(stdout.contains("extract"));
    assert!(stdout.contains("load"));
}

#[tokio::test]
async fn test_check_command_fails_on_missing_partition() {
    let tmp = TempDir::new().unwrap();
    let config_path = write_config(tmp.path(), "http://127.0.0.1:9");

    let (_, _, success) = run_etl(
        &config_path,
        &["check", "dim_customers", "--run-date", "2026-02-01"],
    );
    assert!(!success);

    write_gold_part(tmp.path(), "2026-02-01", &[1], &["a"]);
    let (stdout, stderr, success) = run_etl(
        &config_path,
        &["check", "dim_customers", "--run-date", "2026-02-01"],
    );
    assert!(success, "check failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("✅ min_rows"));
    assert!(stdout.contains("✅ non_null:id"));
}

#[tokio::test]
async fn test_library_extract_into_local_lake() {
    let server = MockServer::start().await;
    mount_customers(&server).await;

    let tmp = TempDir::new().unwrap();
    let config_path = write_config(tmp.path(), &server.uri());
    let config = parse_config(&fs::read_to_string(&config_path).unwrap()).unwrap();

    let pool = db::connect(&config).await.unwrap();
    migrate::migrate(&pool).await.unwrap();
    let store = LocalBlobStore::new(&config.storage.root);
    let secrets = SecretProvider::new(config.secrets.dir.clone());
    let run_id = ledger::new_run_id();
    let run_date = chrono::NaiveDate::from_ymd_opt(2026, 2, 1).unwrap();
    let ctx = ExtractContext {
        store: &store,
        container: &config.storage.container,
        pool: &pool,
        run_id: &run_id,
        run_date,
    };

    let outcomes = extract_selected(&config, &Selector::All, &secrets, &ctx)
        .await
        .unwrap();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].records, 3);

    let text = store
        .get_text("datalake", &outcomes[0].target.blob_path)
        .await
        .unwrap();
    let names: Vec<String> = parse_jsonl(&text)
        .unwrap()
        .iter()
        .map(|r| r["name"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(names, vec!["customer 1", "customer 2", "customer 3"]);

    let entries = ledger::recent(&pool, 10).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].run_id, run_id);
    assert_eq!(entries[0].status, "succeeded");
}
