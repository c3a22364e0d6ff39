use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sdap_sync::{extractor_from_config, Pipeline, PipelineConfig, RunOutcome};
use tracing::info;
use tracing_subscriber::prelude::*;

const DEFAULT_LOG_FILTER: &str = "info,sqlx=warn,html5ever=error,selectors=error";

#[derive(Debug, Parser)]
#[command(name = "sdap-cli")]
#[command(about = "Startup funding scrape pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Extract, land, rebuild the clean snapshot and merge history.
    Run {
        /// Read the page from a local HTML file instead of SDAP_SOURCE_URL.
        #[arg(long)]
        fixture: Option<PathBuf>,
        /// Write a run report under this directory (overrides REPORTS_DIR).
        #[arg(long)]
        reports_dir: Option<PathBuf>,
    },
    /// Rebuild the clean snapshot from the current raw snapshot and merge it.
    Transform,
    /// Print row counts of the pipeline tables.
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .init();

    let cli = Cli::parse();
    let mut config = PipelineConfig::from_env().context("loading configuration")?;

    match cli.command.unwrap_or(Commands::Run {
        fixture: None,
        reports_dir: None,
    }) {
        Commands::Run {
            fixture,
            reports_dir,
        } => {
            if fixture.is_some() {
                config.fixture_path = fixture;
            }
            if reports_dir.is_some() {
                config.reports_dir = reports_dir;
            }
            let mut extractor = extractor_from_config(&config)?;
            let pipeline = Pipeline::connect(config).await?;
            let outcome = pipeline.run_once(extractor.as_mut()).await;
            pipeline.close().await;
            match outcome? {
                RunOutcome::Completed(summary) => {
                    println!(
                        "run complete: run_id={} extracted={} clean={} inserted={} updated={} report={}",
                        summary.run_id,
                        summary.extracted_records,
                        summary.clean.clean_rows,
                        summary.merge.rows_inserted,
                        summary.merge.rows_updated,
                        summary.report_dir.as_deref().unwrap_or("-"),
                    );
                }
                RunOutcome::NothingToDo { run_id, .. } => {
                    println!("nothing to do: run_id={run_id} extracted no rows");
                }
            }
        }
        Commands::Transform => {
            let pipeline = Pipeline::connect(config).await?;
            let summary = pipeline.transform().await;
            pipeline.close().await;
            let summary = summary?;
            println!(
                "transform complete: clean={} inserted={} updated={}",
                summary.clean.clean_rows, summary.merge.rows_inserted, summary.merge.rows_updated
            );
        }
        Commands::Status => {
            let pipeline = Pipeline::connect(config).await?;
            let counts = pipeline.table_counts().await;
            info!(location = pipeline.warehouse().location(), "read table counts");
            pipeline.close().await;
            for (table, rows) in counts? {
                match rows {
                    Some(rows) => println!("{table}: {rows}"),
                    None => println!("{table}: missing"),
                }
            }
        }
    }

    Ok(())
}
