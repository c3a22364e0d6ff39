//! Warehouse tables + rendered-document archive for the funding pipeline.
//!
//! The warehouse is a SQLite database reached through `sqlx`. Tables are
//! schema-on-write: a batch's shape decides the columns of a table the first
//! time it is created. Every table operation exists in two forms, a
//! `*_in` function that runs on a caller-owned connection (so several writes
//! can share one transaction) and a [`Warehouse`] method that wraps the same
//! call in its own transaction.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::Context;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use sdap_core::{format_timestamp, parse_timestamp, DATE_FORMAT, TIME_FORMAT};
use sha2::{Digest, Sha256};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row as _, Sqlite, SqliteConnection, SqlitePool, Transaction};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "sdap-storage";

/// Regional execution location used when none is configured.
pub const DEFAULT_LOCATION: &str = "asia-south2";

const META_TABLE: &str = "_sdap_meta";

#[derive(Debug, Error)]
pub enum WarehouseError {
    #[error("warehouse query failed: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("table `{0}` does not exist")]
    TableNotFound(String),
    #[error("table `{table}` has no column `{column}`")]
    SchemaMismatch { table: String, column: String },
    #[error("refusing to write an empty batch to `{0}`")]
    EmptyBatch(String),
    #[error("credentials at {path}: {reason}")]
    Credentials { path: PathBuf, reason: String },
    #[error("table `{0}` shadows every row id alias")]
    NoRowId(String),
    #[error("warehouse is pinned to location `{pinned}`, client configured for `{configured}`")]
    LocationMismatch { pinned: String, configured: String },
}

/// Everything needed to open a warehouse client. Passed explicitly; nothing
/// is read from process-wide state.
#[derive(Debug, Clone)]
pub struct WarehouseConfig {
    pub database_url: String,
    pub credentials_path: Option<PathBuf>,
    pub location: String,
    pub max_connections: u32,
}

impl WarehouseConfig {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            credentials_path: None,
            location: DEFAULT_LOCATION.to_string(),
            max_connections: 4,
        }
    }

    pub fn sqlite_file(path: impl AsRef<Path>) -> Self {
        Self::new(format!("sqlite://{}", path.as_ref().display()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Text,
    Date,
    Time,
    Timestamp,
}

impl ColumnType {
    pub fn sql_name(self) -> &'static str {
        match self {
            ColumnType::Text => "TEXT",
            ColumnType::Date => "DATE",
            ColumnType::Time => "TIME",
            ColumnType::Timestamp => "TIMESTAMP",
        }
    }

    pub fn from_sql_name(name: &str) -> Self {
        match name.trim().to_ascii_uppercase().as_str() {
            "DATE" => ColumnType::Date,
            "TIME" => ColumnType::Time,
            "TIMESTAMP" | "DATETIME" => ColumnType::Timestamp,
            _ => ColumnType::Text,
        }
    }
}

/// A single cell.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Value {
    #[default]
    Null,
    Text(String),
    Date(NaiveDate),
    Time(NaiveTime),
    Timestamp(DateTime<Utc>),
}

impl Value {
    pub fn column_type(&self) -> Option<ColumnType> {
        match self {
            Value::Null => None,
            Value::Text(_) => Some(ColumnType::Text),
            Value::Date(_) => Some(ColumnType::Date),
            Value::Time(_) => Some(ColumnType::Time),
            Value::Timestamp(_) => Some(ColumnType::Timestamp),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            Value::Date(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_time(&self) -> Option<NaiveTime> {
        match self {
            Value::Time(t) => Some(*t),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::Timestamp(ts) => Some(*ts),
            _ => None,
        }
    }

    /// Stored text form, `None` for null.
    pub fn encode(&self) -> Option<String> {
        match self {
            Value::Null => None,
            Value::Text(s) => Some(s.clone()),
            Value::Date(d) => Some(d.format(DATE_FORMAT).to_string()),
            Value::Time(t) => Some(t.format(TIME_FORMAT).to_string()),
            Value::Timestamp(ts) => Some(format_timestamp(*ts)),
        }
    }

    /// Inverse of [`Value::encode`]. Text that does not parse as the declared
    /// type decodes to null.
    pub fn decode(ty: ColumnType, stored: Option<String>) -> Value {
        let Some(text) = stored else {
            return Value::Null;
        };
        let decoded = match ty {
            ColumnType::Text => return Value::Text(text),
            ColumnType::Date => NaiveDate::parse_from_str(&text, DATE_FORMAT)
                .ok()
                .map(Value::Date),
            ColumnType::Time => NaiveTime::parse_from_str(&text, TIME_FORMAT)
                .ok()
                .map(Value::Time),
            ColumnType::Timestamp => parse_timestamp(&text).map(Value::Timestamp),
        };
        decoded.unwrap_or_else(|| {
            warn!(stored = %text, column_type = ty.sql_name(), "undecodable cell read as null");
            Value::Null
        })
    }
}

impl From<Option<String>> for Value {
    fn from(value: Option<String>) -> Self {
        value.map(Value::Text).unwrap_or_default()
    }
}

impl From<Option<NaiveDate>> for Value {
    fn from(value: Option<NaiveDate>) -> Self {
        value.map(Value::Date).unwrap_or_default()
    }
}

impl From<Option<NaiveTime>> for Value {
    fn from(value: Option<NaiveTime>) -> Self {
        value.map(Value::Time).unwrap_or_default()
    }
}

/// One table row keyed by column name. Absent columns read as null.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Row(BTreeMap<String, Value>);

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, column: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(column.into(), value.into());
    }

    pub fn with(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(column, value);
        self
    }

    pub fn get(&self, column: &str) -> &Value {
        static NULL: Value = Value::Null;
        self.0.get(column).unwrap_or(&NULL)
    }

    pub fn text(&self, column: &str) -> Option<&str> {
        self.get(column).as_text()
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, Value)> for Row {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub ty: ColumnType,
}

impl Column {
    pub fn new(name: impl Into<String>, ty: ColumnType) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TableSchema {
    pub columns: Vec<Column>,
}

impl TableSchema {
    pub fn new(columns: Vec<Column>) -> Self {
        Self { columns }
    }

    /// Union of the columns of `rows` in first-seen order. A column's type is
    /// that of its first non-null value; columns whose values disagree on
    /// type, or that are null everywhere, are `TEXT`.
    pub fn infer(rows: &[Row]) -> Self {
        let mut columns: Vec<Column> = Vec::new();
        let mut typed: BTreeMap<String, Option<ColumnType>> = BTreeMap::new();

        for row in rows {
            for (name, value) in row.iter() {
                let seen = typed.entry(name.to_string()).or_insert_with(|| {
                    columns.push(Column::new(name, ColumnType::Text));
                    None
                });
                match (*seen, value.column_type()) {
                    (None, Some(ty)) => *seen = Some(ty),
                    (Some(prev), Some(ty)) if prev != ty => *seen = Some(ColumnType::Text),
                    _ => {}
                }
            }
        }

        for column in &mut columns {
            if let Some(Some(ty)) = typed.get(&column.name) {
                column.ty = *ty;
            }
        }
        Self { columns }
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    fn create_sql(&self, table: &str) -> String {
        let columns = self
            .columns
            .iter()
            .map(|c| format!("{} {}", quote_ident(&c.name), c.ty.sql_name()))
            .collect::<Vec<_>>()
            .join(", ");
        format!("CREATE TABLE {} ({})", quote_ident(table), columns)
    }
}

/// Double-quotes an SQL identifier.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub async fn table_schema_in(
    conn: &mut SqliteConnection,
    table: &str,
) -> Result<Option<TableSchema>, WarehouseError> {
    let rows = sqlx::query("SELECT name, type FROM pragma_table_info(?1) ORDER BY cid")
        .bind(table)
        .fetch_all(&mut *conn)
        .await?;
    if rows.is_empty() {
        return Ok(None);
    }
    let mut columns = Vec::with_capacity(rows.len());
    for row in rows {
        let name: String = row.try_get("name")?;
        let ty: String = row.try_get("type")?;
        columns.push(Column::new(name, ColumnType::from_sql_name(&ty)));
    }
    Ok(Some(TableSchema::new(columns)))
}

pub async fn table_exists_in(
    conn: &mut SqliteConnection,
    table: &str,
) -> Result<bool, WarehouseError> {
    Ok(
        sqlx::query("SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1")
            .bind(table)
            .fetch_optional(&mut *conn)
            .await?
            .is_some(),
    )
}

async fn create_table_in(
    conn: &mut SqliteConnection,
    table: &str,
    schema: &TableSchema,
) -> Result<(), WarehouseError> {
    sqlx::query(&schema.create_sql(table))
        .execute(&mut *conn)
        .await?;
    debug!(table, columns = schema.columns.len(), "created table");
    Ok(())
}

async fn insert_rows_in(
    conn: &mut SqliteConnection,
    table: &str,
    schema: &TableSchema,
    rows: &[Row],
) -> Result<u64, WarehouseError> {
    if let Some(column) = rows
        .iter()
        .flat_map(Row::columns)
        .find(|name| !schema.contains(name))
    {
        return Err(WarehouseError::SchemaMismatch {
            table: table.to_string(),
            column: column.to_string(),
        });
    }

    let names = schema
        .columns
        .iter()
        .map(|c| quote_ident(&c.name))
        .collect::<Vec<_>>()
        .join(", ");
    let placeholders = vec!["?"; schema.columns.len()].join(", ");
    let sql = format!(
        "INSERT INTO {} ({names}) VALUES ({placeholders})",
        quote_ident(table)
    );

    let mut inserted = 0u64;
    for row in rows {
        let mut query = sqlx::query(&sql);
        for column in &schema.columns {
            query = query.bind(row.get(&column.name).encode());
        }
        inserted += query.execute(&mut *conn).await?.rows_affected();
    }
    Ok(inserted)
}

/// Drops `table` and recreates it with `schema` holding exactly `rows`.
/// Run inside a transaction so readers never see a partial table.
pub async fn replace_table_in(
    conn: &mut SqliteConnection,
    table: &str,
    schema: &TableSchema,
    rows: &[Row],
) -> Result<u64, WarehouseError> {
    if schema.is_empty() {
        return Err(WarehouseError::EmptyBatch(table.to_string()));
    }
    sqlx::query(&format!("DROP TABLE IF EXISTS {}", quote_ident(table)))
        .execute(&mut *conn)
        .await?;
    create_table_in(conn, table, schema).await?;
    insert_rows_in(conn, table, schema, rows).await
}

/// Appends `rows` to `table`, creating it from the batch shape when missing.
/// Existing rows are never touched.
pub async fn append_rows_in(
    conn: &mut SqliteConnection,
    table: &str,
    rows: &[Row],
) -> Result<u64, WarehouseError> {
    if rows.is_empty() {
        return Err(WarehouseError::EmptyBatch(table.to_string()));
    }
    let schema = match table_schema_in(conn, table).await? {
        Some(schema) => schema,
        None => {
            let schema = TableSchema::infer(rows);
            create_table_in(conn, table, &schema).await?;
            schema
        }
    };
    insert_rows_in(conn, table, &schema, rows).await
}

/// First implicit row id alias that no column of `schema` shadows.
fn rowid_alias(table: &str, schema: &TableSchema) -> Result<&'static str, WarehouseError> {
    ["_rowid_", "rowid", "oid"]
        .into_iter()
        .find(|alias| {
            !schema
                .columns
                .iter()
                .any(|c| c.name.eq_ignore_ascii_case(alias))
        })
        .ok_or_else(|| WarehouseError::NoRowId(table.to_string()))
}

/// All rows of `table` in insertion order, paired with their row id.
pub async fn read_rows_with_ids_in(
    conn: &mut SqliteConnection,
    table: &str,
) -> Result<Vec<(i64, Row)>, WarehouseError> {
    let schema = table_schema_in(conn, table)
        .await?
        .ok_or_else(|| WarehouseError::TableNotFound(table.to_string()))?;
    let rowid = rowid_alias(table, &schema)?;
    let names = schema
        .columns
        .iter()
        .map(|c| quote_ident(&c.name))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "SELECT {rowid}, {names} FROM {} ORDER BY {rowid}",
        quote_ident(table)
    );

    let fetched = sqlx::query(&sql).fetch_all(&mut *conn).await?;
    let mut out = Vec::with_capacity(fetched.len());
    for db_row in fetched {
        let rowid: i64 = db_row.try_get(0)?;
        let mut row = Row::new();
        for (idx, column) in schema.columns.iter().enumerate() {
            let stored: Option<String> = db_row.try_get(idx + 1)?;
            row.insert(column.name.clone(), Value::decode(column.ty, stored));
        }
        out.push((rowid, row));
    }
    Ok(out)
}

pub async fn read_table_in(
    conn: &mut SqliteConnection,
    table: &str,
) -> Result<Vec<Row>, WarehouseError> {
    Ok(read_rows_with_ids_in(conn, table)
        .await?
        .into_iter()
        .map(|(_, row)| row)
        .collect())
}

/// Overwrites the given columns of the row identified by `rowid`.
pub async fn update_row_in(
    conn: &mut SqliteConnection,
    table: &str,
    rowid: i64,
    values: &Row,
) -> Result<u64, WarehouseError> {
    if values.is_empty() {
        return Ok(0);
    }
    let schema = table_schema_in(conn, table)
        .await?
        .ok_or_else(|| WarehouseError::TableNotFound(table.to_string()))?;
    let rowid_column = rowid_alias(table, &schema)?;
    let assignments = values
        .columns()
        .map(|c| format!("{} = ?", quote_ident(c)))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "UPDATE {} SET {assignments} WHERE {rowid_column} = ?",
        quote_ident(table)
    );
    let mut query = sqlx::query(&sql);
    for (_, value) in values.iter() {
        query = query.bind(value.encode());
    }
    Ok(query.bind(rowid).execute(&mut *conn).await?.rows_affected())
}

/// Inserts rows into an existing table.
pub async fn insert_into_in(
    conn: &mut SqliteConnection,
    table: &str,
    rows: &[Row],
) -> Result<u64, WarehouseError> {
    let schema = table_schema_in(conn, table)
        .await?
        .ok_or_else(|| WarehouseError::TableNotFound(table.to_string()))?;
    insert_rows_in(conn, table, &schema, rows).await
}

/// Creates `target` with the columns of `source` unless `target` already
/// exists. Returns whether a table was created. An existing `target` is
/// never dropped or altered.
pub async fn ensure_table_like_in(
    conn: &mut SqliteConnection,
    target: &str,
    source: &str,
) -> Result<bool, WarehouseError> {
    if table_exists_in(conn, target).await? {
        return Ok(false);
    }
    let schema = table_schema_in(conn, source)
        .await?
        .ok_or_else(|| WarehouseError::TableNotFound(source.to_string()))?;
    create_table_in(conn, target, &schema).await?;
    Ok(true)
}

pub async fn count_rows_in(
    conn: &mut SqliteConnection,
    table: &str,
) -> Result<Option<u64>, WarehouseError> {
    if !table_exists_in(conn, table).await? {
        return Ok(None);
    }
    let count: i64 = sqlx::query(&format!("SELECT COUNT(*) FROM {}", quote_ident(table)))
        .fetch_one(&mut *conn)
        .await?
        .try_get(0)?;
    Ok(Some(count.max(0) as u64))
}

#[derive(Debug, Clone)]
pub struct Warehouse {
    pool: SqlitePool,
    location: String,
    principal: Option<String>,
}

impl Warehouse {
    pub async fn connect(config: &WarehouseConfig) -> Result<Self, WarehouseError> {
        let principal = match &config.credentials_path {
            Some(path) => load_credentials(path).await?,
            None => None,
        };

        let options = SqliteConnectOptions::from_str(&config.database_url)?.create_if_missing(true);
        // Every connection to an in-memory database sees its own empty copy,
        // so those pools keep exactly one connection alive for their lifetime.
        let pool = if is_in_memory(&config.database_url) {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(config.max_connections.max(1))
        }
        .connect_with(options)
        .await?;

        let warehouse = Self {
            pool,
            location: config.location.clone(),
            principal,
        };
        warehouse.pin_location().await?;
        info!(
            location = %warehouse.location,
            principal = warehouse.principal.as_deref().unwrap_or("anonymous"),
            "connected to warehouse"
        );
        Ok(warehouse)
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn principal(&self) -> Option<&str> {
        self.principal.as_deref()
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>, WarehouseError> {
        Ok(self.pool.begin().await?)
    }

    /// The first client to connect records its location; later clients must
    /// be configured for the same one.
    async fn pin_location(&self) -> Result<(), WarehouseError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {} (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
            quote_ident(META_TABLE)
        ))
        .execute(&mut *tx)
        .await?;

        let pinned: Option<String> = sqlx::query(&format!(
            "SELECT value FROM {} WHERE key = 'location'",
            quote_ident(META_TABLE)
        ))
        .fetch_optional(&mut *tx)
        .await?
        .map(|row| row.try_get(0))
        .transpose()?;

        match pinned {
            Some(pinned) if pinned != self.location => {
                return Err(WarehouseError::LocationMismatch {
                    pinned,
                    configured: self.location.clone(),
                });
            }
            Some(_) => {}
            None => {
                sqlx::query(&format!(
                    "INSERT INTO {} (key, value) VALUES ('location', ?1)",
                    quote_ident(META_TABLE)
                ))
                .bind(&self.location)
                .execute(&mut *tx)
                .await?;
            }
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn table_exists(&self, table: &str) -> Result<bool, WarehouseError> {
        let mut conn = self.pool.acquire().await?;
        table_exists_in(&mut conn, table).await
    }

    pub async fn table_schema(&self, table: &str) -> Result<Option<TableSchema>, WarehouseError> {
        let mut conn = self.pool.acquire().await?;
        table_schema_in(&mut conn, table).await
    }

    pub async fn replace_table(
        &self,
        table: &str,
        schema: &TableSchema,
        rows: &[Row],
    ) -> Result<u64, WarehouseError> {
        let mut tx = self.pool.begin().await?;
        let written = replace_table_in(&mut tx, table, schema, rows).await?;
        tx.commit().await?;
        Ok(written)
    }

    pub async fn append_rows(&self, table: &str, rows: &[Row]) -> Result<u64, WarehouseError> {
        let mut tx = self.pool.begin().await?;
        let written = append_rows_in(&mut tx, table, rows).await?;
        tx.commit().await?;
        Ok(written)
    }

    pub async fn read_table(&self, table: &str) -> Result<Vec<Row>, WarehouseError> {
        let mut conn = self.pool.acquire().await?;
        read_table_in(&mut conn, table).await
    }

    pub async fn ensure_table_like(&self, target: &str, source: &str) -> Result<bool, WarehouseError> {
        let mut tx = self.pool.begin().await?;
        let created = ensure_table_like_in(&mut tx, target, source).await?;
        tx.commit().await?;
        Ok(created)
    }

    pub async fn count_rows(&self, table: &str) -> Result<Option<u64>, WarehouseError> {
        let mut conn = self.pool.acquire().await?;
        count_rows_in(&mut conn, table).await
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn is_in_memory(database_url: &str) -> bool {
    database_url.contains(":memory:") || database_url.contains("mode=memory")
}

/// Reads a service credential file. It must be a JSON object; its
/// `client_email`, when present, names the principal.
async fn load_credentials(path: &Path) -> Result<Option<String>, WarehouseError> {
    let fail = |reason: String| WarehouseError::Credentials {
        path: path.to_path_buf(),
        reason,
    };
    let text = fs::read_to_string(path)
        .await
        .map_err(|err| fail(err.to_string()))?;
    let parsed: serde_json::Value =
        serde_json::from_str(&text).map_err(|err| fail(err.to_string()))?;
    let object = parsed
        .as_object()
        .ok_or_else(|| fail("expected a JSON object".to_string()))?;
    Ok(object
        .get("client_email")
        .and_then(|v| v.as_str())
        .map(str::to_string))
}

#[derive(Debug, Clone)]
pub struct ArchivedDocument {
    pub content_hash: String,
    pub path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Hash-addressed archive of rendered pages, one file per distinct document.
#[derive(Debug, Clone)]
pub struct DocumentArchive {
    root: PathBuf,
}

impl DocumentArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn content_hash(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    pub fn document_path(&self, scraped_at: DateTime<Utc>, label: &str, content_hash: &str) -> PathBuf {
        self.root
            .join(label)
            .join(scraped_at.format("%Y%m%d_%H%M%S").to_string())
            .join(format!("{content_hash}.html"))
    }

    /// Writes `html` through a temp file and an atomic rename. A document
    /// already on disk under the same path is left as is.
    pub async fn store(
        &self,
        scraped_at: DateTime<Utc>,
        label: &str,
        html: &str,
    ) -> anyhow::Result<ArchivedDocument> {
        let bytes = html.as_bytes();
        let content_hash = Self::content_hash(bytes);
        let path = self.document_path(scraped_at, label, &content_hash);
        let parent = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        let archived = |deduplicated| ArchivedDocument {
            content_hash: content_hash.clone(),
            path: path.clone(),
            byte_size: bytes.len(),
            deduplicated,
        };

        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating archive directory {}", parent.display()))?;
        if fs::try_exists(&path)
            .await
            .with_context(|| format!("checking archive path {}", path.display()))?
        {
            return Ok(archived(true));
        }

        let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!("renaming {} -> {}", temp_path.display(), path.display())
            });
        }
        Ok(archived(false))
    }
}
