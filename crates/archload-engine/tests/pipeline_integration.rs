//! End-to-end tests: pipeline files through extraction, loading, and run
//! history, against `SQLite` stores in scratch directories.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use archload_engine::config::parser;
use archload_engine::errors::{IngestError, Stage};
use archload_engine::registry;
use archload_engine::{check_pipeline, Pipeline, ViolationKind};
use archload_types::dataset::{DatasetId, SourceFormat};
use archload_types::state::RunState;
use zip::write::SimpleFileOptions;

fn fixture(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .unwrap()
        .parent()
        .unwrap()
        .join("tests/fixtures/pipelines")
        .join(name)
}

fn build_zip(path: &Path, entries: &[(&str, &str)]) {
    let mut writer = zip::ZipWriter::new(File::create(path).unwrap());
    for (name, body) in entries {
        writer.start_file(*name, SimpleFileOptions::default()).unwrap();
        writer.write_all(body.as_bytes()).unwrap();
    }
    writer.finish().unwrap();
}

const CUSTOMERS_JSON: &str = r#"[
  {"id": 1, "name": "Ada", "address": {"city": "London"}},
  {"id": 2, "name": "Grace", "address": {"city": null}}
]"#;

const ORDERS_CSV: &str = "id,total,note\n10,9.5,x\n11,3,y\n";

/// Pipeline YAML rooted at `root`, with the given dataset list.
fn pipeline_yaml(root: &Path, datasets: &str) -> String {
    let root = root.display();
    format!(
        r#"
version: "1.0"
archive:
  path: {root}/drop.zip
  extract_dir: {root}/unzipped
destination:
  backend: sqlite
  connection: {root}/warehouse.db
  schema_policy: additive
state:
  backend: sqlite
  connection: {root}/state.db
resources:
  concurrency: 1
  max_retries: 0
  retry_delay_seconds: 0
dependencies:
  timeout_seconds: 2
  poll_interval_seconds: 1
datasets:
{datasets}
"#
    )
}

const CUSTOMERS_AND_ORDERS: &str = r"
  - {identifier: customers, file_name: customers.json, format: json, columns: [id, name, address.city]}
  - {identifier: orders, file_name: exports/orders.csv, format: csv, columns: [id, total], depends_on: customers}
";

async fn pipeline(root: &Path, datasets: &str) -> Pipeline {
    let config = parser::parse_pipeline_str(&pipeline_yaml(root, datasets)).unwrap();
    Pipeline::from_config(config).await.unwrap()
}

fn warehouse_rows(root: &Path, sql: &str) -> Vec<Vec<Option<String>>> {
    let conn = rusqlite::Connection::open(root.join("warehouse.db")).unwrap();
    let mut stmt = conn.prepare(sql).unwrap();
    let width = stmt.column_count();
    let rows = stmt
        .query_map([], |row| {
            (0..width)
                .map(|i| row.get::<_, Option<String>>(i))
                .collect::<Result<Vec<_>, _>>()
        })
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    rows
}

fn text(values: &[Option<&str>]) -> Vec<Option<String>> {
    values.iter().map(|v| v.map(str::to_string)).collect()
}

#[test]
fn test_parse_and_validate_fixture_pipeline() {
    std::env::set_var("AL_FIXTURE_ROOT", "/srv/drops");

    let config = parser::parse_pipeline(&fixture("daily_drop.yaml")).unwrap();
    assert_eq!(config.archive.path, Path::new("/srv/drops/drop.zip"));
    assert_eq!(config.destination.connection, "/srv/drops/warehouse.db");

    let definitions = registry::load_pipeline(&config).expect("fixture should validate");
    let ids: Vec<_> = definitions.iter().map(|d| d.id.as_str()).collect();
    assert_eq!(ids, vec!["customers", "orders", "regions"]);
    assert_eq!(definitions[1].depends_on, Some(DatasetId::new("customers")));
    assert_eq!(definitions[2].format, SourceFormat::Spreadsheet);

    std::env::remove_var("AL_FIXTURE_ROOT");
}

#[test]
fn test_invalid_fixture_reports_every_record() {
    let config = parser::parse_pipeline(&fixture("invalid_records.yaml")).unwrap();
    let err = registry::load_pipeline(&config).unwrap_err();

    let first = err.first().unwrap();
    assert_eq!(first.index, Some(1));
    assert_eq!(first.field, "columns");
    let located: Vec<_> = err
        .violations
        .iter()
        .map(|v| (v.index, v.field.as_str()))
        .collect();
    assert_eq!(
        located,
        vec![
            (Some(1), "columns"),
            (Some(2), "format"),
            (Some(3), "depends_on"),
        ]
    );
    let unsupported: Vec<_> = err.of_kind(ViolationKind::UnsupportedFormat).collect();
    assert_eq!(unsupported.len(), 1);
    assert_eq!(unsupported[0].index, Some(2));
}

#[tokio::test]
async fn test_cycle_loads_all_datasets_in_order() {
    let dir = tempfile::tempdir().unwrap();
    build_zip(
        &dir.path().join("drop.zip"),
        &[
            ("customers.json", CUSTOMERS_JSON),
            ("exports/orders.csv", ORDERS_CSV),
        ],
    );
    let pipeline = pipeline(dir.path(), CUSTOMERS_AND_ORDERS).await;

    let report = pipeline.run_cycle().await.unwrap();
    assert_eq!(report.failed(), 0, "{:?}", report.failures().collect::<Vec<_>>());
    assert_eq!(report.rows_written(), 4);

    let rows = warehouse_rows(
        dir.path(),
        r#"SELECT "id", "name", "address.city", "total" FROM unified_rows ORDER BY rowid"#,
    );
    assert_eq!(
        rows,
        vec![
            text(&[Some("1"), Some("Ada"), Some("London"), None]),
            text(&[Some("2"), Some("Grace"), Some(""), None]),
            text(&[Some("10"), None, None, Some("9.5")]),
            text(&[Some("11"), None, None, Some("3")]),
        ]
    );

    let ledger = pipeline.ledger();
    for id in ["customers", "orders"] {
        assert_eq!(
            ledger.latest_run_state(&DatasetId::new(id)).unwrap(),
            Some(RunState::Success)
        );
    }
    let runs = ledger.recent_runs(10).unwrap();
    let orders = runs.iter().find(|r| r.dataset.as_str() == "orders").unwrap();
    assert_eq!(orders.stats.rows_read, 2);
    assert_eq!(orders.stats.rows_written, 2);
}

#[tokio::test]
async fn test_second_cycle_appends_and_reuses_extraction() {
    let dir = tempfile::tempdir().unwrap();
    build_zip(
        &dir.path().join("drop.zip"),
        &[
            ("customers.json", CUSTOMERS_JSON),
            ("exports/orders.csv", ORDERS_CSV),
        ],
    );
    let pipeline = pipeline(dir.path(), CUSTOMERS_AND_ORDERS).await;

    pipeline.run_cycle().await.unwrap();
    let extracted = dir.path().join("unzipped/exports/orders.csv");
    let first_modified = std::fs::metadata(&extracted).unwrap().modified().unwrap();

    let report = pipeline.run_cycle().await.unwrap();
    assert_eq!(report.failed(), 0);
    let count = warehouse_rows(dir.path(), "SELECT CAST(COUNT(*) AS TEXT) FROM unified_rows");
    assert_eq!(count, vec![text(&[Some("8")])]);
    assert_eq!(
        std::fs::metadata(&extracted).unwrap().modified().unwrap(),
        first_modified
    );
}

#[tokio::test]
async fn test_malformed_row_leaves_no_partial_load() {
    let dir = tempfile::tempdir().unwrap();
    let mut csv = String::from("id,total\n");
    for i in 1..=10 {
        if i == 4 {
            csv.push_str("4\n");
        } else {
            csv.push_str(&format!("{i},{}\n", i * 10));
        }
    }
    build_zip(
        &dir.path().join("drop.zip"),
        &[("customers.json", CUSTOMERS_JSON), ("orders.csv", &csv)],
    );
    let pipeline = pipeline(
        dir.path(),
        r"
  - {identifier: customers, file_name: customers.json, format: json, columns: [id, name]}
  - {identifier: orders, file_name: orders.csv, format: csv, columns: [id, total]}
",
    )
    .await;

    let report = pipeline.run_cycle().await.unwrap();
    assert_eq!(report.succeeded(), 1);
    let failure = report.failures().next().unwrap();
    assert_eq!(failure.dataset.as_str(), "orders");
    assert_eq!(failure.stage, Stage::Read);
    assert!(matches!(
        failure.source,
        IngestError::Parse { line: Some(5), .. }
    ));

    let rows = warehouse_rows(dir.path(), "SELECT \"id\" FROM unified_rows ORDER BY rowid");
    assert_eq!(rows, vec![text(&[Some("1")]), text(&[Some("2")])]);

    let runs = pipeline.ledger().recent_runs(10).unwrap();
    let orders = runs.iter().find(|r| r.dataset.as_str() == "orders").unwrap();
    assert_eq!(orders.state, RunState::Failed);
    assert_eq!(orders.stats.rows_read, 4);
    assert_eq!(orders.stats.rows_written, 0);
    assert!(orders
        .stats
        .error_message
        .as_deref()
        .unwrap()
        .contains("line 5"));
}

#[tokio::test]
async fn test_failed_dependency_fails_dependent_at_gate() {
    let dir = tempfile::tempdir().unwrap();
    build_zip(
        &dir.path().join("drop.zip"),
        &[
            ("customers.json", CUSTOMERS_JSON),
            ("exports/orders.csv", ORDERS_CSV),
        ],
    );
    let pipeline = pipeline(
        dir.path(),
        r"
  - {identifier: customers, file_name: customers.json, format: json, columns: [id, email]}
  - {identifier: orders, file_name: exports/orders.csv, format: csv, columns: [id, total], depends_on: customers}
",
    )
    .await;

    let report = pipeline.run_cycle().await.unwrap();
    let failures: Vec<_> = report.failures().collect();
    assert_eq!(failures.len(), 2);

    assert_eq!(failures[0].stage, Stage::Project);
    assert!(matches!(
        &failures[0].source,
        IngestError::MissingColumn { column, row: 1 } if column == "email"
    ));

    assert_eq!(failures[1].dataset.as_str(), "orders");
    assert_eq!(failures[1].stage, Stage::Gate);
    assert!(matches!(
        failures[1].source,
        IngestError::DependencyFailed {
            state: RunState::Failed,
            ..
        }
    ));
}

#[tokio::test]
async fn test_single_dataset_trigger_uses_latest_dependency_run() {
    let dir = tempfile::tempdir().unwrap();
    build_zip(
        &dir.path().join("drop.zip"),
        &[
            ("customers.json", CUSTOMERS_JSON),
            ("exports/orders.csv", ORDERS_CSV),
        ],
    );
    let pipeline = pipeline(dir.path(), CUSTOMERS_AND_ORDERS).await;

    let customers = pipeline
        .run_dataset(&DatasetId::new("customers"))
        .await
        .unwrap();
    assert_eq!(customers.result.unwrap().rows_written, 2);

    let orders = pipeline.run_dataset(&DatasetId::new("orders")).await.unwrap();
    let summary = orders.result.unwrap();
    assert_eq!(summary.rows_written, 2);
    assert_eq!(summary.attempts, 1);
}

#[tokio::test]
async fn test_dependency_cycle_rejected_before_extraction() {
    let dir = tempfile::tempdir().unwrap();
    build_zip(&dir.path().join("drop.zip"), &[("a.csv", "x\n1\n")]);
    let config = parser::parse_pipeline_str(&pipeline_yaml(
        dir.path(),
        r"
  - {identifier: a, file_name: a.csv, format: csv, columns: [x], depends_on: b}
  - {identifier: b, file_name: a.csv, format: csv, columns: [x], depends_on: a}
",
    ))
    .unwrap();

    let err = Pipeline::from_config(config).await.err().unwrap();
    assert!(err.to_string().contains("dependency cycle"), "got: {err}");
    assert!(!dir.path().join("unzipped").exists());
}

#[tokio::test]
async fn test_check_reports_files_missing_from_archive() {
    let dir = tempfile::tempdir().unwrap();
    build_zip(
        &dir.path().join("drop.zip"),
        &[("customers.json", CUSTOMERS_JSON)],
    );
    let config =
        parser::parse_pipeline_str(&pipeline_yaml(dir.path(), CUSTOMERS_AND_ORDERS)).unwrap();

    let check = check_pipeline(&config).await.unwrap();
    assert_eq!(check.archive_entries, 1);
    assert_eq!(
        check.missing_files,
        vec![(DatasetId::new("orders"), "exports/orders.csv".to_string())]
    );
    assert!(check.backends_ok);
    assert!(!dir.path().join("unzipped").exists());
}
