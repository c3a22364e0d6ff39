use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use sdap_adapters::WaitPolicy;
use sdap_core::SCRAPED_AT_FIELD;
use sdap_storage::{WarehouseConfig, DEFAULT_LOCATION};
use serde::{Deserialize, Serialize};

/// Names of the four pipeline tables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TableNames {
    pub raw_latest: String,
    pub raw_history: String,
    pub clean_latest: String,
    pub clean_history: String,
}

impl Default for TableNames {
    fn default() -> Self {
        Self {
            raw_latest: "stg_raw_latest".to_string(),
            raw_history: "fct_raw_history".to_string(),
            clean_latest: "stg_clean_latest".to_string(),
            clean_history: "fct_clean_history".to_string(),
        }
    }
}

impl TableNames {
    pub fn all(&self) -> [&str; 4] {
        [
            self.raw_latest.as_str(),
            self.raw_history.as_str(),
            self.clean_latest.as_str(),
            self.clean_history.as_str(),
        ]
    }
}

/// Raw (sanitized header) column names the clean-staging step reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawColumns {
    pub company: String,
    pub country: String,
    pub website: String,
    pub industry: String,
    pub funding_amount: String,
    pub funding_type: String,
    pub last_funding_date: String,
    pub scraped_at: String,
}

impl Default for RawColumns {
    fn default() -> Self {
        Self {
            company: "Name".to_string(),
            country: "Country".to_string(),
            website: "Website".to_string(),
            industry: "Industry".to_string(),
            funding_amount: "Funding Amount USD".to_string(),
            funding_type: "Funding Type".to_string(),
            last_funding_date: "Last Funding Date".to_string(),
            scraped_at: SCRAPED_AT_FIELD.to_string(),
        }
    }
}

impl RawColumns {
    pub fn all(&self) -> [&str; 8] {
        [
            self.company.as_str(),
            self.country.as_str(),
            self.website.as_str(),
            self.industry.as_str(),
            self.funding_amount.as_str(),
            self.funding_type.as_str(),
            self.last_funding_date.as_str(),
            self.scraped_at.as_str(),
        ]
    }
}

/// Optional YAML overrides, see `SDAP_CONFIG`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct ConfigFile {
    tables: Option<TableNames>,
    raw_columns: Option<RawColumns>,
    source_url: Option<String>,
    table_selector: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub warehouse: WarehouseConfig,
    pub tables: TableNames,
    pub raw_columns: RawColumns,
    pub source_url: Option<String>,
    pub fixture_path: Option<PathBuf>,
    pub table_selector: String,
    pub wait: WaitPolicy,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub artifacts_dir: Option<PathBuf>,
    pub reports_dir: Option<PathBuf>,
}

impl PipelineConfig {
    pub fn new(warehouse: WarehouseConfig) -> Self {
        Self {
            warehouse,
            tables: TableNames::default(),
            raw_columns: RawColumns::default(),
            source_url: None,
            fixture_path: None,
            table_selector: "table".to_string(),
            wait: WaitPolicy::default(),
            user_agent: "sdap-bot/0.1".to_string(),
            http_timeout_secs: 20,
            artifacts_dir: None,
            reports_dir: None,
        }
    }

    pub fn from_env() -> Result<Self> {
        let mut warehouse = WarehouseConfig::new(
            std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://warehouse.sqlite3".to_string()),
        );
        warehouse.credentials_path = std::env::var("SDAP_CREDENTIALS_PATH").ok().map(PathBuf::from);
        warehouse.location =
            std::env::var("SDAP_LOCATION").unwrap_or_else(|_| DEFAULT_LOCATION.to_string());

        let mut config = Self::new(warehouse);
        config.source_url = std::env::var("SDAP_SOURCE_URL").ok();
        config.fixture_path = std::env::var("SDAP_FIXTURE_PATH").ok().map(PathBuf::from);
        if let Ok(selector) = std::env::var("SDAP_TABLE_SELECTOR") {
            config.table_selector = selector;
        }
        config.wait = WaitPolicy {
            timeout: Duration::from_secs(env_parse("SDAP_RENDER_TIMEOUT_SECS").unwrap_or(30)),
            poll_interval: Duration::from_millis(env_parse("SDAP_POLL_INTERVAL_MS").unwrap_or(500)),
        };
        if let Ok(user_agent) = std::env::var("SDAP_USER_AGENT") {
            config.user_agent = user_agent;
        }
        config.http_timeout_secs = env_parse("SDAP_HTTP_TIMEOUT_SECS").unwrap_or(20);
        config.artifacts_dir = std::env::var("ARTIFACTS_DIR").ok().map(PathBuf::from);
        config.reports_dir = std::env::var("REPORTS_DIR").ok().map(PathBuf::from);

        if let Ok(path) = std::env::var("SDAP_CONFIG") {
            config.apply_file(Path::new(&path))?;
        }
        Ok(config)
    }

    /// Overlays table names, raw column names and source settings from a
    /// YAML file. Keys missing from the file keep their current values.
    pub fn apply_file(&mut self, path: &Path) -> Result<()> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        self.apply_yaml(&text)
            .with_context(|| format!("parsing {}", path.display()))
    }

    pub fn apply_yaml(&mut self, text: &str) -> Result<()> {
        let file: ConfigFile = serde_yaml::from_str(text)?;
        if let Some(tables) = file.tables {
            self.tables = tables;
        }
        if let Some(raw_columns) = file.raw_columns {
            self.raw_columns = raw_columns;
        }
        if file.source_url.is_some() {
            self.source_url = file.source_url;
        }
        if let Some(selector) = file.table_selector {
            self.table_selector = selector;
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}
