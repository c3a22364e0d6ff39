//! Extraction side of the pipeline: page sources, the bounded render wait,
//! HTML table extraction and the record normalizer.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use scraper::{ElementRef, Html, Selector};
use sdap_core::{sanitize_label, RawRecord, SCRAPED_AT_FIELD};
use sdap_storage::DocumentArchive;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "sdap-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("invalid selector `{selector}`: {reason}")]
    Selector { selector: String, reason: String },
    #[error("`{selector}` did not render within {waited:?}")]
    RenderTimeout { selector: String, waited: Duration },
    #[error("no table matches `{0}`")]
    MissingTable(String),
    #[error("table `{0}` has data rows but no header cells")]
    NoHeaders(String),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("page source already released")]
    Released,
    #[error(transparent)]
    Archive(#[from] anyhow::Error),
}

/// A rendered page that can be read repeatedly until it is released.
#[async_trait]
pub trait PageSource: Send {
    fn describe(&self) -> String;

    /// Current document HTML.
    async fn render(&mut self) -> Result<String, AdapterError>;

    async fn release(&mut self) -> Result<(), AdapterError>;
}

/// Produces the batch of raw records for one run.
#[async_trait]
pub trait Extractor: Send {
    async fn extract(&mut self, scraped_at: DateTime<Utc>) -> Result<Vec<RawRecord>, AdapterError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_request_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpSourceConfig {
    pub url: String,
    pub user_agent: Option<String>,
    pub timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl HttpSourceConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            user_agent: None,
            timeout: Duration::from_secs(20),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Fetches the page over HTTP on every render.
#[derive(Debug)]
pub struct HttpPageSource {
    client: Option<reqwest::Client>,
    url: String,
    backoff: BackoffPolicy,
}

impl HttpPageSource {
    pub fn new(config: HttpSourceConfig) -> Result<Self, AdapterError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        Ok(Self {
            client: Some(builder.build()?),
            url: config.url,
            backoff: config.backoff,
        })
    }
}

#[async_trait]
impl PageSource for HttpPageSource {
    fn describe(&self) -> String {
        self.url.clone()
    }

    async fn render(&mut self) -> Result<String, AdapterError> {
        let client = self.client.as_ref().ok_or(AdapterError::Released)?;
        let mut attempt = 0usize;
        loop {
            let (disposition, err) = match client.get(&self.url).send().await {
                Ok(resp) if resp.status().is_success() => return Ok(resp.text().await?),
                Ok(resp) => (
                    classify_status(resp.status()),
                    AdapterError::HttpStatus {
                        status: resp.status().as_u16(),
                        url: resp.url().to_string(),
                    },
                ),
                Err(err) => (classify_request_error(&err), AdapterError::Request(err)),
            };
            if disposition == RetryDisposition::NonRetryable || attempt >= self.backoff.max_retries {
                return Err(err);
            }
            let delay = self.backoff.delay_for_attempt(attempt);
            warn!(url = %self.url, attempt, ?delay, error = %err, "render request failed, retrying");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    async fn release(&mut self) -> Result<(), AdapterError> {
        self.client = None;
        Ok(())
    }
}

#[derive(Debug, Clone)]
enum FixtureDocument {
    Frames(Vec<String>),
    File(PathBuf),
}

/// Serves HTML from memory or disk. With several frames each render returns
/// the next one and the last frame repeats, which stands in for a page that
/// finishes rendering asynchronously.
#[derive(Debug, Clone)]
pub struct FixturePageSource {
    document: FixtureDocument,
    renders: usize,
    released: bool,
}

impl FixturePageSource {
    pub fn inline(html: impl Into<String>) -> Self {
        Self::frames(vec![html.into()])
    }

    pub fn frames(frames: Vec<String>) -> Self {
        Self {
            document: FixtureDocument::Frames(frames),
            renders: 0,
            released: false,
        }
    }

    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            document: FixtureDocument::File(path.into()),
            renders: 0,
            released: false,
        }
    }

    pub fn renders(&self) -> usize {
        self.renders
    }

    pub fn is_released(&self) -> bool {
        self.released
    }
}

#[async_trait]
impl PageSource for FixturePageSource {
    fn describe(&self) -> String {
        match &self.document {
            FixtureDocument::Frames(frames) => format!("inline fixture ({} frames)", frames.len()),
            FixtureDocument::File(path) => path.display().to_string(),
        }
    }

    async fn render(&mut self) -> Result<String, AdapterError> {
        if self.released {
            return Err(AdapterError::Released);
        }
        let index = self.renders;
        self.renders += 1;
        match &self.document {
            FixtureDocument::Frames(frames) => Ok(frames
                .get(index)
                .or_else(|| frames.last())
                .cloned()
                .unwrap_or_default()),
            FixtureDocument::File(path) => tokio::fs::read_to_string(path)
                .await
                .map_err(|source| AdapterError::Io {
                    path: path.clone(),
                    source,
                }),
        }
    }

    async fn release(&mut self) -> Result<(), AdapterError> {
        self.released = true;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WaitPolicy {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(500),
        }
    }
}

fn parse_selector(selector: &str) -> Result<Selector, AdapterError> {
    Selector::parse(selector).map_err(|e| AdapterError::Selector {
        selector: selector.to_string(),
        reason: e.to_string(),
    })
}

fn document_matches(html: &str, selector: &str) -> Result<bool, AdapterError> {
    let sel = parse_selector(selector)?;
    Ok(Html::parse_document(html).select(&sel).next().is_some())
}

/// Renders `source` until `selector` matches, polling every
/// `policy.poll_interval`. Gives up with [`AdapterError::RenderTimeout`]
/// once `policy.timeout` has elapsed.
pub async fn wait_for_selector<S: PageSource + ?Sized>(
    source: &mut S,
    selector: &str,
    policy: WaitPolicy,
) -> Result<String, AdapterError> {
    parse_selector(selector)?;
    let poll = async {
        loop {
            let html = source.render().await?;
            if document_matches(&html, selector)? {
                return Ok::<_, AdapterError>(html);
            }
            debug!(selector, "selector not rendered yet");
            tokio::time::sleep(policy.poll_interval).await;
        }
    };
    match tokio::time::timeout(policy.timeout, poll).await {
        Ok(result) => result,
        Err(_) => Err(AdapterError::RenderTimeout {
            selector: selector.to_string(),
            waited: policy.timeout,
        }),
    }
}

/// Header labels and cell texts of one HTML table, as displayed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedTable {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl RenderedTable {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

fn display_text(element: ElementRef<'_>) -> String {
    element
        .text()
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Reads the first table matching `selector`. Headers come from `thead th`,
/// or from the `th` cells of the first row when there is no `thead`; every
/// row with `td` cells is a data row.
pub fn extract_table(html: &str, selector: &str) -> Result<RenderedTable, AdapterError> {
    let table_sel = parse_selector(selector)?;
    let thead_sel = parse_selector("thead th")?;
    let row_sel = parse_selector("tr")?;
    let th_sel = parse_selector("th")?;
    let td_sel = parse_selector("td")?;

    let document = Html::parse_document(html);
    let table = document
        .select(&table_sel)
        .next()
        .ok_or_else(|| AdapterError::MissingTable(selector.to_string()))?;

    let mut headers: Vec<String> = table.select(&thead_sel).map(display_text).collect();
    if headers.is_empty() {
        if let Some(first) = table.select(&row_sel).next() {
            headers = first.select(&th_sel).map(display_text).collect();
        }
    }

    let rows: Vec<Vec<String>> = table
        .select(&row_sel)
        .map(|tr| tr.select(&td_sel).map(display_text).collect::<Vec<_>>())
        .filter(|cells| !cells.is_empty())
        .collect();
    if headers.is_empty() && !rows.is_empty() {
        return Err(AdapterError::NoHeaders(selector.to_string()));
    }

    Ok(RenderedTable { headers, rows })
}

/// Column names the warehouse already uses for the implicit row id.
const RESERVED_COLUMNS: [&str; 3] = ["rowid", "oid", "_rowid_"];

/// Sanitizes header labels into column names. Labels that sanitize to
/// nothing become `column_<n>`. Repeats get a `_<k>` suffix, and so do
/// clashes with the injected timestamp field or a row id alias. Names are
/// compared ignoring ASCII case, as the warehouse does.
pub fn sanitized_headers<S: AsRef<str>>(labels: &[S]) -> Vec<String> {
    let mut taken: Vec<String> = RESERVED_COLUMNS
        .iter()
        .map(|name| name.to_string())
        .chain([SCRAPED_AT_FIELD.to_string()])
        .collect();
    let mut out = Vec::with_capacity(labels.len());
    for (idx, label) in labels.iter().enumerate() {
        let mut base = sanitize_label(label.as_ref());
        if base.is_empty() {
            base = format!("column_{}", idx + 1);
        }
        let mut name = base.clone();
        let mut suffix = 2;
        while taken.iter().any(|t| t.eq_ignore_ascii_case(&name)) {
            name = format!("{base}_{suffix}");
            suffix += 1;
        }
        taken.push(name.clone());
        out.push(name);
    }
    out
}

/// Normalizes one row given as `(header label, display text)` pairs.
pub fn normalize_row<L: AsRef<str>, T: AsRef<str>>(
    cells: &[(L, T)],
    scraped_at: DateTime<Utc>,
) -> RawRecord {
    let labels = cells.iter().map(|(l, _)| l.as_ref()).collect::<Vec<_>>();
    let fields = sanitized_headers(&labels)
        .into_iter()
        .zip(cells.iter().map(|(_, t)| t.as_ref().trim().to_string()))
        .collect();
    RawRecord::new(fields, scraped_at)
}

/// Normalizes every data row of `table`. Missing trailing cells become empty
/// strings; cells past the last header are dropped.
pub fn normalize_table(table: &RenderedTable, scraped_at: DateTime<Utc>) -> Vec<RawRecord> {
    let columns = sanitized_headers(&table.headers);
    table
        .rows
        .iter()
        .map(|cells| {
            if cells.len() > columns.len() {
                debug!(
                    cells = cells.len(),
                    columns = columns.len(),
                    "dropping cells without a header"
                );
            }
            let fields = columns
                .iter()
                .enumerate()
                .map(|(idx, column)| {
                    let text = cells.get(idx).map(|c| c.trim()).unwrap_or_default();
                    (column.clone(), text.to_string())
                })
                .collect();
            RawRecord::new(fields, scraped_at)
        })
        .collect()
}

/// Waits for the table to render, reads it, and normalizes its rows. The
/// page source is released on every exit path.
pub struct TableExtractor<S: PageSource> {
    source: S,
    selector: String,
    wait: WaitPolicy,
    archive: Option<DocumentArchive>,
    label: String,
}

impl<S: PageSource> TableExtractor<S> {
    pub fn new(source: S, selector: impl Into<String>) -> Self {
        Self {
            source,
            selector: selector.into(),
            wait: WaitPolicy::default(),
            archive: None,
            label: "page".to_string(),
        }
    }

    pub fn with_wait(mut self, wait: WaitPolicy) -> Self {
        self.wait = wait;
        self
    }

    /// Keeps a copy of every rendered document under `label` in `archive`.
    pub fn with_archive(mut self, archive: DocumentArchive, label: impl Into<String>) -> Self {
        self.archive = Some(archive);
        self.label = label.into();
        self
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    async fn render_and_parse(&mut self, scraped_at: DateTime<Utc>) -> Result<Vec<RawRecord>, AdapterError> {
        let html = wait_for_selector(&mut self.source, &self.selector, self.wait).await?;
        if let Some(archive) = &self.archive {
            let stored = archive.store(scraped_at, &self.label, &html).await?;
            debug!(path = %stored.path.display(), deduplicated = stored.deduplicated, "archived document");
        }
        let table = extract_table(&html, &self.selector)?;
        Ok(normalize_table(&table, scraped_at))
    }
}

#[async_trait]
impl<S: PageSource> Extractor for TableExtractor<S> {
    async fn extract(&mut self, scraped_at: DateTime<Utc>) -> Result<Vec<RawRecord>, AdapterError> {
        let span = info_span!("extract", source = %self.source.describe(), selector = %self.selector);
        async {
            let outcome = self.render_and_parse(scraped_at).await;
            let released = self.source.release().await;
            match (outcome, released) {
                (Ok(records), Ok(())) => {
                    info!(rows = records.len(), "extracted table");
                    Ok(records)
                }
                (Ok(_), Err(err)) => Err(err),
                (Err(err), released) => {
                    if let Err(release_err) = released {
                        warn!(error = %release_err, "releasing page source failed");
                    }
                    Err(err)
                }
            }
        }
        .instrument(span)
        .await
    }
}
