use sdap_core::{RawRecord, SCRAPED_AT_FIELD};
use sdap_storage::{
    append_rows_in, replace_table_in, Row, TableSchema, Value, Warehouse, WarehouseError,
};
use serde::Serialize;
use tracing::info;

use crate::config::TableNames;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LandingReceipt {
    pub latest_rows: u64,
    pub history_rows: u64,
}

pub fn raw_record_to_row(record: &RawRecord) -> Row {
    let mut row: Row = record
        .fields()
        .iter()
        .map(|(name, text)| (name.clone(), Value::Text(text.clone())))
        .collect();
    row.insert(SCRAPED_AT_FIELD, Value::Timestamp(record.scraped_at()));
    row
}

/// Writes a raw batch to the latest snapshot (full replace) and the history
/// log (append). Both writes share one transaction, so after a failure
/// neither table has changed.
#[derive(Debug, Clone)]
pub struct LandingWriter {
    warehouse: Warehouse,
    tables: TableNames,
}

impl LandingWriter {
    pub fn new(warehouse: Warehouse, tables: TableNames) -> Self {
        Self { warehouse, tables }
    }

    pub async fn land(&self, batch: &[RawRecord]) -> Result<LandingReceipt, WarehouseError> {
        if batch.is_empty() {
            return Err(WarehouseError::EmptyBatch(self.tables.raw_latest.clone()));
        }
        let rows = batch.iter().map(raw_record_to_row).collect::<Vec<_>>();
        let schema = TableSchema::infer(&rows);

        let mut tx = self.warehouse.begin().await?;
        let latest_rows = replace_table_in(&mut tx, &self.tables.raw_latest, &schema, &rows).await?;
        let history_rows = append_rows_in(&mut tx, &self.tables.raw_history, &rows).await?;
        tx.commit().await?;

        info!(
            latest = %self.tables.raw_latest,
            history = %self.tables.raw_history,
            latest_rows,
            history_rows,
            "landed raw batch"
        );
        Ok(LandingReceipt {
            latest_rows,
            history_rows,
        })
    }
}
