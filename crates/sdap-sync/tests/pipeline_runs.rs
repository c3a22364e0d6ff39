use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sdap_adapters::{normalize_row, AdapterError, Extractor};
use sdap_core::{CleanRecord, RawRecord};
use sdap_storage::{Column, ColumnType, Row, TableSchema, Value, WarehouseConfig, WarehouseError};
use sdap_sync::staging::row_to_clean_record;
use sdap_sync::{extractor_from_config, Pipeline, PipelineConfig, PipelineError, RunOutcome, RunSummary};
use tempfile::TempDir;

const RAW_LATEST: &str = "stg_raw_latest";
const RAW_HISTORY: &str = "fct_raw_history";
const CLEAN_LATEST: &str = "stg_clean_latest";
const CLEAN_HISTORY: &str = "fct_clean_history";

/// Hands out the same rows on every call.
struct StaticExtractor {
    rows: Vec<Vec<(String, String)>>,
}

impl StaticExtractor {
    fn new(rows: Vec<Vec<(String, String)>>) -> Self {
        Self { rows }
    }

    fn empty() -> Self {
        Self { rows: Vec::new() }
    }
}

#[async_trait]
impl Extractor for StaticExtractor {
    async fn extract(&mut self, scraped_at: DateTime<Utc>) -> Result<Vec<RawRecord>, AdapterError> {
        Ok(self
            .rows
            .iter()
            .map(|cells| normalize_row(cells, scraped_at))
            .collect())
    }
}

fn startup(name: &str, industry: &str, amount: &str, date: &str) -> Vec<(String, String)> {
    [
        ("Name", name),
        ("Country", "India"),
        ("Website", "https://example.com"),
        ("Industry", industry),
        ("Funding Amount (USD)", amount),
        ("Funding Type", "Seed"),
        ("Last Funding Date", date),
    ]
    .into_iter()
    .map(|(label, text)| (label.to_string(), text.to_string()))
    .collect()
}

fn config_in(dir: &Path) -> PipelineConfig {
    PipelineConfig::new(WarehouseConfig::sqlite_file(dir.join("warehouse.sqlite3")))
}

async fn pipeline_in(dir: &Path) -> Pipeline {
    Pipeline::connect(config_in(dir)).await.expect("connect")
}

async fn run(pipeline: &Pipeline, rows: Vec<Vec<(String, String)>>) -> RunSummary {
    match pipeline
        .run_once(&mut StaticExtractor::new(rows))
        .await
        .expect("run")
    {
        RunOutcome::Completed(summary) => summary,
        other => panic!("expected a completed run, got {other:?}"),
    }
}

async fn count(pipeline: &Pipeline, table: &str) -> Option<u64> {
    pipeline.warehouse().count_rows(table).await.expect("count")
}

async fn clean_rows(pipeline: &Pipeline, table: &str) -> Vec<CleanRecord> {
    pipeline
        .warehouse()
        .read_table(table)
        .await
        .expect("read")
        .iter()
        .map(row_to_clean_record)
        .collect()
}

fn find<'a>(records: &'a [CleanRecord], company: &str, tag: &str) -> Vec<&'a CleanRecord> {
    records
        .iter()
        .filter(|r| r.company.as_deref() == Some(company) && r.industry_tag.as_deref() == Some(tag))
        .collect()
}

#[tokio::test]
async fn latest_snapshot_is_replaced_and_history_appended() {
    let dir = TempDir::new().expect("tempdir");
    let pipeline = pipeline_in(dir.path()).await;

    let first = run(
        &pipeline,
        vec![
            startup("Acme", "Fintech, Edtech", "$10", "Jan 2023"),
            startup("Beta", "Health", "$20", "Mar 2022"),
        ],
    )
    .await;
    assert_eq!(first.landing.latest_rows, 2);
    assert_eq!(first.clean.clean_rows, 3);
    assert!(first.merge.history_created);

    run(&pipeline, vec![startup("Gamma", "Retail", "$30", "Apr 2024")]).await;

    assert_eq!(count(&pipeline, RAW_LATEST).await, Some(1));
    assert_eq!(count(&pipeline, RAW_HISTORY).await, Some(3));
    assert_eq!(count(&pipeline, CLEAN_LATEST).await, Some(1));
    assert_eq!(count(&pipeline, CLEAN_HISTORY).await, Some(4));

    let latest = pipeline.warehouse().read_table(RAW_LATEST).await.expect("read");
    assert_eq!(latest[0].text("Name"), Some("Gamma"));
    assert_eq!(latest[0].text("Funding Amount USD"), Some("$30"));
}

#[tokio::test]
async fn clean_snapshot_is_exploded_upper_cased_and_typed() {
    let dir = TempDir::new().expect("tempdir");
    let pipeline = pipeline_in(dir.path()).await;
    let summary = run(
        &pipeline,
        vec![
            startup("acme labs", "Fintech,Edtech", "$10", "Jan 2023"),
            startup("Beta", "", "$20", "2023"),
        ],
    )
    .await;
    assert_eq!(summary.clean.null_funding_dates, 1);

    let clean = clean_rows(&pipeline, CLEAN_LATEST).await;
    assert_eq!(clean.len(), 3);

    let fintech = find(&clean, "ACME LABS", "FINTECH");
    let edtech = find(&clean, "ACME LABS", "EDTECH");
    assert_eq!(fintech.len(), 1);
    assert_eq!(edtech.len(), 1);
    assert_eq!(fintech[0].country.as_deref(), Some("INDIA"));
    assert_eq!(fintech[0].funding_type.as_deref(), Some("SEED"));
    assert_eq!(fintech[0].last_funding_date, NaiveDate::from_ymd_opt(2023, 1, 1));
    assert_eq!(fintech[0].scraped_date, Some(summary.scraped_at.date_naive()));
    assert_eq!(fintech[0].scraped_time, Some(summary.scraped_at.time()));

    let beta = find(&clean, "BETA", "");
    assert_eq!(beta.len(), 1);
    assert_eq!(beta[0].last_funding_date, None);
}

#[tokio::test]
async fn rerunning_the_same_batch_does_not_grow_keyed_history() {
    let dir = TempDir::new().expect("tempdir");
    let pipeline = pipeline_in(dir.path()).await;
    let batch = vec![
        startup("Acme", "Fintech,Edtech", "$10", "Jan 2023"),
        startup("Beta", "Health", "$20", "Mar 2022"),
    ];

    run(&pipeline, batch.clone()).await;
    let before = clean_rows(&pipeline, CLEAN_HISTORY).await;
    let second = run(&pipeline, batch).await;
    let after = clean_rows(&pipeline, CLEAN_HISTORY).await;

    assert_eq!(before.len(), 3);
    assert_eq!(after.len(), 3);
    assert_eq!(second.merge.rows_inserted, 0);
    assert_eq!(second.merge.rows_updated, 3);
    assert!(!second.merge.history_created);
    for record in &after {
        let tag = record.industry_tag.as_deref().unwrap_or_default();
        let company = record.company.as_deref().unwrap_or_default();
        assert_eq!(find(&before, company, tag)[0].funding_amount, record.funding_amount);
    }
}

#[tokio::test]
async fn update_touches_only_the_matching_key_and_keeps_missing_keys() {
    let dir = TempDir::new().expect("tempdir");
    let pipeline = pipeline_in(dir.path()).await;

    run(
        &pipeline,
        vec![
            startup("X", "Edtech", "100", "Jan 2023"),
            startup("X", "Fintech", "100", "Jan 2023"),
            startup("Y", "Retail", "5", "Feb 2021"),
        ],
    )
    .await;
    let second = run(&pipeline, vec![startup("X", "Edtech", "150", "Jan 2023")]).await;
    assert_eq!(second.merge.rows_updated, 1);
    assert_eq!(second.merge.rows_inserted, 0);

    let history = clean_rows(&pipeline, CLEAN_HISTORY).await;
    assert_eq!(history.len(), 3);
    assert_eq!(find(&history, "X", "EDTECH")[0].funding_amount.as_deref(), Some("150"));
    assert_eq!(find(&history, "X", "FINTECH")[0].funding_amount.as_deref(), Some("100"));
    assert_eq!(find(&history, "Y", "RETAIL")[0].funding_amount.as_deref(), Some("5"));
}

#[tokio::test]
async fn rows_without_a_funding_date_are_inserted_every_run() {
    let dir = TempDir::new().expect("tempdir");
    let pipeline = pipeline_in(dir.path()).await;
    let batch = vec![startup("Y", "Edtech", "1", "sometime in 2023")];

    let first = run(&pipeline, batch.clone()).await;
    let second = run(&pipeline, batch).await;
    assert_eq!(first.merge.rows_inserted, 1);
    assert_eq!(second.merge.rows_inserted, 1);
    assert_eq!(second.merge.rows_updated, 0);

    let history = clean_rows(&pipeline, CLEAN_HISTORY).await;
    assert_eq!(history.len(), 2);
    assert!(history.iter().all(|r| r.last_funding_date.is_none()));
}

#[tokio::test]
async fn empty_batch_leaves_every_table_as_it_was() {
    let dir = TempDir::new().expect("tempdir");
    let pipeline = pipeline_in(dir.path()).await;

    let outcome = pipeline
        .run_once(&mut StaticExtractor::empty())
        .await
        .expect("empty run");
    assert!(matches!(outcome, RunOutcome::NothingToDo { .. }));
    for (_, rows) in pipeline.table_counts().await.expect("counts") {
        assert_eq!(rows, None);
    }

    run(&pipeline, vec![startup("Acme", "Fintech", "$10", "Jan 2023")]).await;
    let before = pipeline.table_counts().await.expect("counts");
    let outcome = pipeline
        .run_once(&mut StaticExtractor::empty())
        .await
        .expect("empty run");
    assert!(matches!(outcome, RunOutcome::NothingToDo { .. }));
    assert_eq!(pipeline.table_counts().await.expect("counts"), before);
}

#[tokio::test]
async fn transform_without_a_raw_snapshot_fails_before_merging() {
    let dir = TempDir::new().expect("tempdir");
    let pipeline = pipeline_in(dir.path()).await;

    let err = pipeline.transform().await.expect_err("no raw snapshot");
    assert!(
        matches!(&err, PipelineError::Rebuild(WarehouseError::TableNotFound(t)) if t == RAW_LATEST),
        "unexpected error: {err}"
    );
    assert_eq!(count(&pipeline, CLEAN_LATEST).await, None);
    assert_eq!(count(&pipeline, CLEAN_HISTORY).await, None);
}

#[tokio::test]
async fn transform_rebuilds_from_the_current_raw_snapshot() {
    let dir = TempDir::new().expect("tempdir");
    let pipeline = pipeline_in(dir.path()).await;
    run(&pipeline, vec![startup("Acme", "Fintech,Edtech", "$10", "Jan 2023")]).await;

    let summary = pipeline.transform().await.expect("transform");
    assert_eq!(summary.clean.source_rows, 1);
    assert_eq!(summary.clean.clean_rows, 2);
    assert_eq!(summary.merge.rows_updated, 2);
    assert_eq!(count(&pipeline, CLEAN_HISTORY).await, Some(2));
}

#[tokio::test]
async fn failed_history_append_leaves_latest_snapshot_unchanged() {
    let dir = TempDir::new().expect("tempdir");
    let pipeline = pipeline_in(dir.path()).await;
    run(&pipeline, vec![startup("Acme", "Fintech", "$10", "Jan 2023")]).await;

    let foreign = TableSchema::new(vec![Column::new("Other", ColumnType::Text)]);
    pipeline
        .warehouse()
        .replace_table(
            RAW_HISTORY,
            &foreign,
            &[Row::new().with("Other", Value::Text("x".into()))],
        )
        .await
        .expect("replace history");

    let err = pipeline
        .run_once(&mut StaticExtractor::new(vec![
            startup("Beta", "Health", "$20", "Mar 2022"),
            startup("Gamma", "Retail", "$30", "Apr 2024"),
        ]))
        .await
        .expect_err("history append must fail");
    assert!(
        matches!(err, PipelineError::Landing(WarehouseError::SchemaMismatch { .. })),
        "unexpected error: {err}"
    );

    let latest = pipeline.warehouse().read_table(RAW_LATEST).await.expect("read");
    assert_eq!(latest.len(), 1);
    assert_eq!(latest[0].text("Name"), Some("Acme"));
    assert_eq!(count(&pipeline, RAW_HISTORY).await, Some(1));
}

#[tokio::test]
async fn failed_history_insert_rolls_back_updates() {
    let dir = TempDir::new().expect("tempdir");
    let pipeline = pipeline_in(dir.path()).await;
    sqlx::query(
        "CREATE TABLE fct_clean_history (
            company TEXT, country TEXT, website TEXT, industry_tag TEXT,
            funding_amount TEXT, funding_type TEXT, last_funding_date DATE,
            scraped_date DATE, scraped_time TIME, note TEXT NOT NULL
        )",
    )
    .execute(pipeline.warehouse().pool())
    .await
    .expect("create history");
    sqlx::query(
        "INSERT INTO fct_clean_history (company, country, industry_tag, funding_amount, last_funding_date, note)
         VALUES ('X', 'INDIA', 'EDTECH', '100', '2023-01-01', 'seed')",
    )
    .execute(pipeline.warehouse().pool())
    .await
    .expect("seed history");

    let err = pipeline
        .run_once(&mut StaticExtractor::new(vec![
            startup("X", "Edtech", "150", "Jan 2023"),
            startup("X", "Fintech", "150", "Jan 2023"),
        ]))
        .await
        .expect_err("insert into history must fail");
    assert!(matches!(err, PipelineError::Merge(_)), "unexpected error: {err}");

    let history = pipeline.warehouse().read_table(CLEAN_HISTORY).await.expect("read");
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].text("funding_amount"), Some("100"));
    assert_eq!(history[0].text("note"), Some("seed"));
}

#[tokio::test]
async fn merging_the_same_snapshot_twice_changes_nothing() {
    let dir = TempDir::new().expect("tempdir");
    let pipeline = pipeline_in(dir.path()).await;
    run(
        &pipeline,
        vec![
            startup("Acme", "Fintech, Edtech", "$10", "Jan 2023"),
            startup("Beta", "Health", "$20", "Mar 2022"),
        ],
    )
    .await;
    let before = pipeline.warehouse().read_table(CLEAN_HISTORY).await.expect("read");

    let merger = pipeline.history_merger();
    for _ in 0..2 {
        let stats = merger.merge().await.expect("merge");
        assert_eq!(stats.rows_inserted, 0);
        assert_eq!(stats.rows_updated, 3);
        assert!(!stats.history_created);
    }

    let after = pipeline.warehouse().read_table(CLEAN_HISTORY).await.expect("read");
    assert_eq!(after, before);
    assert_eq!(count(&pipeline, CLEAN_HISTORY).await, Some(3));
}

#[tokio::test]
async fn headers_differing_only_in_case_land_as_separate_columns() {
    let dir = TempDir::new().expect("tempdir");
    let pipeline = pipeline_in(dir.path()).await;
    let row = |name: &str, shout: &str| {
        let mut cells = startup(name, "Retail", "$5", "Feb 2024");
        cells.push(("NAME".to_string(), shout.to_string()));
        cells.push(("Scraped_At".to_string(), "yesterday".to_string()));
        cells.push(("rowid".to_string(), "7".to_string()));
        cells
    };
    let summary = run(&pipeline, vec![row("Acme", "ACME"), row("Beta", "BETA")]).await;
    assert_eq!(summary.landing.latest_rows, 2);
    assert_eq!(count(&pipeline, RAW_HISTORY).await, Some(2));

    let latest = pipeline.warehouse().read_table(RAW_LATEST).await.expect("read");
    assert_eq!(latest[1].text("Name"), Some("Beta"));
    assert_eq!(latest[1].text("NAME_2"), Some("BETA"));
    assert_eq!(latest[1].text("Scraped_At_2"), Some("yesterday"));
    assert_eq!(latest[1].text("rowid_2"), Some("7"));
    assert!(matches!(latest[1].get("scraped_at"), Value::Timestamp(_)));
    assert_eq!(count(&pipeline, CLEAN_HISTORY).await, Some(2));
}

#[tokio::test]
async fn completed_run_writes_report_with_manifest() {
    let dir = TempDir::new().expect("tempdir");
    let mut config = config_in(dir.path());
    config.reports_dir = Some(dir.path().join("reports"));
    let pipeline = Pipeline::connect(config).await.expect("connect");

    let summary = run(&pipeline, vec![startup("Acme", "Fintech,Edtech", "$10", "Jan 2023")]).await;
    let report_dir = dir.path().join("reports").join(summary.run_id.to_string());
    assert_eq!(summary.report_dir, Some(report_dir.display().to_string()));
    assert!(report_dir.join("summary.json").exists());
    assert!(report_dir.join("clean_latest.parquet").exists());

    let manifest: serde_json::Value = serde_json::from_slice(
        &std::fs::read(report_dir.join("manifest.json")).expect("manifest"),
    )
    .expect("manifest json");
    let files = manifest["files"].as_array().expect("files");
    assert_eq!(files.len(), 2);
    for file in files {
        assert_eq!(file["sha256"].as_str().map(str::len), Some(64));
        assert!(file["bytes"].as_u64().unwrap_or_default() > 0);
    }

    let written: serde_json::Value = serde_json::from_slice(
        &std::fs::read(report_dir.join("summary.json")).expect("summary"),
    )
    .expect("summary json");
    assert_eq!(written["clean"]["clean_rows"], 2);
}

#[tokio::test]
async fn fixture_page_runs_end_to_end() {
    let dir = TempDir::new().expect("tempdir");
    let mut config = config_in(dir.path());
    config.fixture_path = Some(
        Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/startups/funding_table.html"),
    );
    config.table_selector = "table#startups".to_string();
    config.artifacts_dir = Some(dir.path().join("artifacts"));

    let mut extractor = extractor_from_config(&config).expect("extractor");
    let pipeline = Pipeline::connect(config).await.expect("connect");
    let summary = match pipeline.run_once(extractor.as_mut()).await.expect("run") {
        RunOutcome::Completed(summary) => summary,
        other => panic!("expected a completed run, got {other:?}"),
    };

    assert_eq!(summary.extracted_records, 4);
    assert_eq!(summary.clean.clean_rows, 6);
    assert_eq!(summary.clean.null_funding_dates, 1);
    assert_eq!(summary.merge.rows_inserted, 6);

    let clean = clean_rows(&pipeline, CLEAN_LATEST).await;
    let razorpay = find(&clean, "RAZORPAY", "PAYMENTS");
    assert_eq!(razorpay.len(), 1);
    assert_eq!(razorpay[0].funding_amount.as_deref(), Some("$75,000,000"));
    assert_eq!(razorpay[0].last_funding_date, NaiveDate::from_ymd_opt(2021, 12, 1));
    assert_eq!(find(&clean, "NORTHVOLT", "MANUFACTURING").len(), 1);
    assert!(dir.path().join("artifacts").join("fixture").exists());
}
