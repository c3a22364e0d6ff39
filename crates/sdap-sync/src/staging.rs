use sdap_core::{
    columns, fold_upper, parse_month_year, split_tags, split_timestamp, split_timestamp_str,
    CleanRecord, INDUSTRY_DELIMITER,
};
use sdap_storage::{
    read_table_in, replace_table_in, table_schema_in, Column, ColumnType, Row, TableSchema,
    Value, Warehouse, WarehouseError,
};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::{RawColumns, TableNames};

/// Fixed column layout of the clean tables.
pub fn clean_schema() -> TableSchema {
    let ty = |name: &str| match name {
        columns::LAST_FUNDING_DATE | columns::SCRAPED_DATE => ColumnType::Date,
        columns::SCRAPED_TIME => ColumnType::Time,
        _ => ColumnType::Text,
    };
    TableSchema::new(
        columns::ALL
            .iter()
            .map(|name| Column::new(*name, ty(name)))
            .collect(),
    )
}

pub fn clean_record_to_row(record: &CleanRecord) -> Row {
    Row::new()
        .with(columns::COMPANY, record.company.clone())
        .with(columns::COUNTRY, record.country.clone())
        .with(columns::WEBSITE, record.website.clone())
        .with(columns::INDUSTRY_TAG, record.industry_tag.clone())
        .with(columns::FUNDING_AMOUNT, record.funding_amount.clone())
        .with(columns::FUNDING_TYPE, record.funding_type.clone())
        .with(columns::LAST_FUNDING_DATE, record.last_funding_date)
        .with(columns::SCRAPED_DATE, record.scraped_date)
        .with(columns::SCRAPED_TIME, record.scraped_time)
}

pub fn row_to_clean_record(row: &Row) -> CleanRecord {
    let text = |column: &str| row.text(column).map(str::to_string);
    CleanRecord {
        company: text(columns::COMPANY),
        country: text(columns::COUNTRY),
        website: text(columns::WEBSITE),
        industry_tag: text(columns::INDUSTRY_TAG),
        funding_amount: text(columns::FUNDING_AMOUNT),
        funding_type: text(columns::FUNDING_TYPE),
        last_funding_date: row.get(columns::LAST_FUNDING_DATE).as_date(),
        scraped_date: row.get(columns::SCRAPED_DATE).as_date(),
        scraped_time: row.get(columns::SCRAPED_TIME).as_time(),
    }
}

/// Expands one raw row into one clean record per industry tag.
///
/// An absent industry yields a single record with a null tag; a blank one a
/// single record with an empty tag. A funding date that is not
/// `<Mon> <YYYY>` becomes null; the row is kept either way.
pub fn explode_raw_row(row: &Row, raw: &RawColumns) -> Vec<CleanRecord> {
    let upper = |column: &str| row.text(column).map(fold_upper);
    let trimmed = |column: &str| row.text(column).map(|s| s.trim().to_string());

    let (scraped_date, scraped_time) = match row.get(&raw.scraped_at) {
        Value::Timestamp(ts) => split_timestamp(*ts),
        Value::Text(text) => split_timestamp_str(text),
        _ => (None, None),
    };

    let base = CleanRecord {
        company: upper(&raw.company),
        country: upper(&raw.country),
        website: trimmed(&raw.website),
        industry_tag: None,
        funding_amount: trimmed(&raw.funding_amount),
        funding_type: upper(&raw.funding_type),
        last_funding_date: row.text(&raw.last_funding_date).and_then(parse_month_year),
        scraped_date,
        scraped_time,
    };

    let tags: Vec<Option<String>> = match row.text(&raw.industry) {
        None => vec![None],
        Some(value) => {
            let tags = split_tags(value, INDUSTRY_DELIMITER);
            if tags.is_empty() {
                vec![Some(String::new())]
            } else {
                tags.iter().map(|tag| Some(fold_upper(tag))).collect()
            }
        }
    };

    tags.into_iter()
        .map(|industry_tag| CleanRecord {
            industry_tag,
            ..base.clone()
        })
        .collect()
}

pub fn build_clean_records(rows: &[Row], raw: &RawColumns) -> Vec<CleanRecord> {
    rows.iter().flat_map(|row| explode_raw_row(row, raw)).collect()
}

#[derive(Debug, Clone, Serialize)]
pub struct CleanBuildStats {
    pub source_rows: usize,
    pub clean_rows: usize,
    pub null_funding_dates: usize,
}

#[derive(Debug, Clone)]
pub struct CleanBuild {
    pub stats: CleanBuildStats,
    pub records: Vec<CleanRecord>,
}

/// Rebuilds the clean latest snapshot from the raw latest snapshot.
#[derive(Debug, Clone)]
pub struct CleanStagingBuilder {
    warehouse: Warehouse,
    tables: TableNames,
    raw: RawColumns,
}

impl CleanStagingBuilder {
    pub fn new(warehouse: Warehouse, tables: TableNames, raw: RawColumns) -> Self {
        Self {
            warehouse,
            tables,
            raw,
        }
    }

    /// Reads the raw latest snapshot and fully replaces the clean latest
    /// snapshot in one transaction. A missing raw snapshot is an error; no
    /// previous clean snapshot is reused.
    pub async fn rebuild(&self) -> Result<CleanBuild, WarehouseError> {
        let mut tx = self.warehouse.begin().await?;

        let source_schema = table_schema_in(&mut tx, &self.tables.raw_latest)
            .await?
            .ok_or_else(|| WarehouseError::TableNotFound(self.tables.raw_latest.clone()))?;
        for column in self.raw.all() {
            if !source_schema.contains(column) {
                warn!(table = %self.tables.raw_latest, column, "raw column missing, values will be null");
            }
        }

        let raw_rows = read_table_in(&mut tx, &self.tables.raw_latest).await?;
        let records = build_clean_records(&raw_rows, &self.raw);
        let rows = records.iter().map(clean_record_to_row).collect::<Vec<_>>();
        replace_table_in(&mut tx, &self.tables.clean_latest, &clean_schema(), &rows).await?;
        tx.commit().await?;

        let stats = CleanBuildStats {
            source_rows: raw_rows.len(),
            clean_rows: records.len(),
            null_funding_dates: records
                .iter()
                .filter(|r| r.last_funding_date.is_none())
                .count(),
        };
        info!(
            table = %self.tables.clean_latest,
            source_rows = stats.source_rows,
            clean_rows = stats.clean_rows,
            null_funding_dates = stats.null_funding_dates,
            "rebuilt clean snapshot"
        );
        Ok(CleanBuild { stats, records })
    }
}
