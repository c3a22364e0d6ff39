//! Run orchestration: extract, land, rebuild the clean snapshot, merge history.

pub mod config;
pub mod landing;
pub mod merge;
pub mod report;
pub mod staging;

use std::time::Duration;

use anyhow::bail;
use chrono::{DateTime, SubsecRound, Utc};
use sdap_adapters::{
    AdapterError, Extractor, FixturePageSource, HttpPageSource, HttpSourceConfig, TableExtractor,
};
use sdap_storage::{DocumentArchive, Warehouse, WarehouseError};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

pub use config::{PipelineConfig, RawColumns, TableNames};
pub use landing::{LandingReceipt, LandingWriter};
pub use merge::{plan_merge, HistoryMerger, MergePlan, MergeStats};
pub use staging::{CleanBuild, CleanBuildStats, CleanStagingBuilder};

pub const CRATE_NAME: &str = "sdap-sync";

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("connecting to warehouse: {0}")]
    Connect(#[source] WarehouseError),
    #[error("extraction failed: {0}")]
    Extraction(#[from] AdapterError),
    #[error("landing raw batch: {0}")]
    Landing(#[source] WarehouseError),
    #[error("rebuilding clean snapshot: {0}")]
    Rebuild(#[source] WarehouseError),
    #[error("merging clean history: {0}")]
    Merge(#[source] WarehouseError),
    #[error("reading table counts: {0}")]
    Status(#[source] WarehouseError),
    #[error("writing run report: {0:#}")]
    Report(anyhow::Error),
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub scraped_at: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub location: String,
    pub extracted_records: usize,
    pub landing: LandingReceipt,
    pub clean: CleanBuildStats,
    pub merge: MergeStats,
    pub report_dir: Option<String>,
}

#[derive(Debug, Clone)]
pub enum RunOutcome {
    Completed(RunSummary),
    /// The extractor returned no rows; no table was touched.
    NothingToDo { run_id: Uuid, scraped_at: DateTime<Utc> },
}

#[derive(Debug, Clone)]
pub struct TransformSummary {
    pub clean: CleanBuildStats,
    pub merge: MergeStats,
}

pub struct Pipeline {
    warehouse: Warehouse,
    config: PipelineConfig,
}

impl Pipeline {
    pub async fn connect(config: PipelineConfig) -> Result<Self, PipelineError> {
        let warehouse = Warehouse::connect(&config.warehouse)
            .await
            .map_err(PipelineError::Connect)?;
        Ok(Self::new(warehouse, config))
    }

    pub fn new(warehouse: Warehouse, config: PipelineConfig) -> Self {
        Self { warehouse, config }
    }

    pub fn warehouse(&self) -> &Warehouse {
        &self.warehouse
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn landing_writer(&self) -> LandingWriter {
        LandingWriter::new(self.warehouse.clone(), self.config.tables.clone())
    }

    pub fn staging_builder(&self) -> CleanStagingBuilder {
        CleanStagingBuilder::new(
            self.warehouse.clone(),
            self.config.tables.clone(),
            self.config.raw_columns.clone(),
        )
    }

    pub fn history_merger(&self) -> HistoryMerger {
        HistoryMerger::new(self.warehouse.clone(), self.config.tables.clone())
    }

    /// One full run. Every row of the batch shares one scrape timestamp.
    /// An empty batch ends the run before any table is written.
    pub async fn run_once<E: Extractor + ?Sized>(
        &self,
        extractor: &mut E,
    ) -> Result<RunOutcome, PipelineError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let scraped_at = started_at.trunc_subsecs(0);
        self.run_stages(extractor, run_id, started_at, scraped_at)
            .instrument(info_span!("run", %run_id))
            .await
    }

    async fn run_stages<E: Extractor + ?Sized>(
        &self,
        extractor: &mut E,
        run_id: Uuid,
        started_at: DateTime<Utc>,
        scraped_at: DateTime<Utc>,
    ) -> Result<RunOutcome, PipelineError> {
        let batch = extractor
            .extract(scraped_at)
            .instrument(info_span!("extract_stage"))
            .await?;
        if batch.is_empty() {
            info!("extraction returned no rows, nothing to do");
            return Ok(RunOutcome::NothingToDo { run_id, scraped_at });
        }

        let landing = self
            .landing_writer()
            .land(&batch)
            .instrument(info_span!("land_stage"))
            .await
            .map_err(PipelineError::Landing)?;
        let TransformOutput { summary, records } = self.transform_inner().await?;

        let mut run = RunSummary {
            run_id,
            scraped_at,
            started_at,
            finished_at: Utc::now(),
            location: self.warehouse.location().to_string(),
            extracted_records: batch.len(),
            landing,
            clean: summary.clean,
            merge: summary.merge,
            report_dir: None,
        };
        if let Some(root) = &self.config.reports_dir {
            run.report_dir = Some(report::report_dir_for(root, &run).display().to_string());
            report::write_run_report(root, &run, &records)
                .instrument(info_span!("report_stage"))
                .await
                .map_err(PipelineError::Report)?;
        }

        info!(
            extracted = run.extracted_records,
            clean_rows = run.clean.clean_rows,
            inserted = run.merge.rows_inserted,
            updated = run.merge.rows_updated,
            "run completed"
        );
        Ok(RunOutcome::Completed(run))
    }

    /// Rebuilds the clean snapshot from the current raw snapshot and merges
    /// it into history, without extracting.
    pub async fn transform(&self) -> Result<TransformSummary, PipelineError> {
        Ok(self
            .transform_inner()
            .instrument(info_span!("transform"))
            .await?
            .summary)
    }

    async fn transform_inner(&self) -> Result<TransformOutput, PipelineError> {
        let build = self
            .staging_builder()
            .rebuild()
            .instrument(info_span!("rebuild_stage"))
            .await
            .map_err(PipelineError::Rebuild)?;
        let merge = self
            .history_merger()
            .merge()
            .instrument(info_span!("merge_stage"))
            .await
            .map_err(PipelineError::Merge)?;
        Ok(TransformOutput {
            summary: TransformSummary {
                clean: build.stats,
                merge,
            },
            records: build.records,
        })
    }

    /// Row count per pipeline table, `None` for tables not created yet.
    pub async fn table_counts(&self) -> Result<Vec<(String, Option<u64>)>, PipelineError> {
        let mut counts = Vec::with_capacity(4);
        for table in self.config.tables.all() {
            let count = self
                .warehouse
                .count_rows(table)
                .await
                .map_err(PipelineError::Status)?;
            counts.push((table.to_string(), count));
        }
        Ok(counts)
    }

    pub async fn close(&self) {
        self.warehouse.close().await;
    }
}

struct TransformOutput {
    summary: TransformSummary,
    records: Vec<sdap_core::CleanRecord>,
}

/// Picks the page source from configuration: a local fixture file wins over
/// a source URL.
pub fn extractor_from_config(config: &PipelineConfig) -> anyhow::Result<Box<dyn Extractor>> {
    let archive = config.artifacts_dir.as_ref().map(DocumentArchive::new);

    if let Some(path) = &config.fixture_path {
        let mut extractor = TableExtractor::new(FixturePageSource::file(path), &config.table_selector)
            .with_wait(config.wait);
        if let Some(archive) = archive {
            extractor = extractor.with_archive(archive, "fixture");
        }
        return Ok(Box::new(extractor));
    }

    let Some(url) = &config.source_url else {
        bail!("no page source configured: set SDAP_SOURCE_URL or SDAP_FIXTURE_PATH");
    };
    let mut http = HttpSourceConfig::new(url);
    http.user_agent = Some(config.user_agent.clone());
    http.timeout = Duration::from_secs(config.http_timeout_secs);
    let mut extractor = TableExtractor::new(HttpPageSource::new(http)?, &config.table_selector)
        .with_wait(config.wait);
    if let Some(archive) = archive {
        extractor = extractor.with_archive(archive, "source");
    }
    Ok(Box::new(extractor))
}

pub async fn run_once_from_env() -> anyhow::Result<RunOutcome> {
    let config = PipelineConfig::from_env()?;
    let mut extractor = extractor_from_config(&config)?;
    let pipeline = Pipeline::connect(config).await?;
    let outcome = pipeline.run_once(extractor.as_mut()).await;
    pipeline.close().await;
    Ok(outcome?)
}
