use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{ArrayRef, Date32Array, RecordBatch, StringArray, Time32SecondArray};
use arrow_schema::{DataType, Field as ArrowField, Schema, TimeUnit};
use chrono::{NaiveDate, Timelike};
use parquet::arrow::ArrowWriter;
use sdap_core::{columns, CleanRecord};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::info;

use crate::RunSummary;

#[derive(Debug, Clone, Serialize)]
pub struct ReportManifest {
    pub schema_version: u32,
    pub files: Vec<ReportManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Directory a run's report lands in: `<reports_root>/<run_id>`.
pub fn report_dir_for(reports_root: &Path, summary: &RunSummary) -> PathBuf {
    reports_root.join(summary.run_id.to_string())
}

/// Writes `summary.json`, a parquet export of the clean snapshot and a
/// manifest with the size and sha256 of both. Returns the report directory.
pub async fn write_run_report(
    reports_root: &Path,
    summary: &RunSummary,
    clean: &[CleanRecord],
) -> Result<PathBuf> {
    let report_dir = report_dir_for(reports_root, summary);
    fs::create_dir_all(&report_dir)
        .await
        .with_context(|| format!("creating {}", report_dir.display()))?;

    let summary_path = report_dir.join("summary.json");
    let bytes = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(&summary_path, bytes)
        .await
        .with_context(|| format!("writing {}", summary_path.display()))?;

    let parquet_path = report_dir.join("clean_latest.parquet");
    write_clean_parquet(&parquet_path, clean)?;

    let manifest = ReportManifest {
        schema_version: 1,
        files: vec![
            manifest_entry("summary", &report_dir, &summary_path)?,
            manifest_entry("clean_latest", &report_dir, &parquet_path)?,
        ],
    };
    let manifest_path = report_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing report manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;

    info!(dir = %report_dir.display(), clean_rows = clean.len(), "wrote run report");
    Ok(report_dir)
}

fn days_since_epoch(date: NaiveDate) -> i32 {
    let epoch = NaiveDate::from_ymd_opt(1970, 1, 1).unwrap_or_default();
    (date - epoch).num_days() as i32
}

fn write_clean_parquet(path: &Path, clean: &[CleanRecord]) -> Result<()> {
    let text = |name: &str| ArrowField::new(name, DataType::Utf8, true);
    let schema = Arc::new(Schema::new(vec![
        text(columns::COMPANY),
        text(columns::COUNTRY),
        text(columns::WEBSITE),
        text(columns::INDUSTRY_TAG),
        text(columns::FUNDING_AMOUNT),
        text(columns::FUNDING_TYPE),
        ArrowField::new(columns::LAST_FUNDING_DATE, DataType::Date32, true),
        ArrowField::new(columns::SCRAPED_DATE, DataType::Date32, true),
        ArrowField::new(columns::SCRAPED_TIME, DataType::Time32(TimeUnit::Second), true),
    ]));

    let strings = |get: fn(&CleanRecord) -> Option<&str>| -> ArrayRef {
        Arc::new(StringArray::from(clean.iter().map(get).collect::<Vec<_>>()))
    };
    let dates = |get: fn(&CleanRecord) -> Option<NaiveDate>| -> ArrayRef {
        Arc::new(Date32Array::from(
            clean
                .iter()
                .map(|r| get(r).map(days_since_epoch))
                .collect::<Vec<_>>(),
        ))
    };
    let times: ArrayRef = Arc::new(Time32SecondArray::from(
        clean
            .iter()
            .map(|r| r.scraped_time.map(|t| t.num_seconds_from_midnight() as i32))
            .collect::<Vec<_>>(),
    ));

    let batch = RecordBatch::try_new(
        schema,
        vec![
            strings(|r| r.company.as_deref()),
            strings(|r| r.country.as_deref()),
            strings(|r| r.website.as_deref()),
            strings(|r| r.industry_tag.as_deref()),
            strings(|r| r.funding_amount.as_deref()),
            strings(|r| r.funding_type.as_deref()),
            dates(|r| r.last_funding_date),
            dates(|r| r.scraped_date),
            times,
        ],
    )
    .context("building clean record batch")?;

    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn manifest_entry(name: &str, report_dir: &Path, path: &Path) -> Result<ReportManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let sha256 = hex::encode(Sha256::digest(&bytes));
    let rel = path
        .strip_prefix(report_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ReportManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
    })
}
