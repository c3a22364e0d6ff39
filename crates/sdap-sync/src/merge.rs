use std::collections::HashMap;

use sdap_core::{columns, CleanRecord, MergeKey};
use sdap_storage::{
    ensure_table_like_in, insert_into_in, read_rows_with_ids_in, read_table_in, update_row_in,
    Row, Warehouse, WarehouseError,
};
use serde::Serialize;
use tracing::{debug, info};

use crate::config::TableNames;
use crate::staging::{clean_record_to_row, row_to_clean_record};

/// Writes against the history table decided before anything is written.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergePlan {
    /// History rowid and the source record whose mutable columns replace it.
    pub updates: Vec<(i64, CleanRecord)>,
    pub inserts: Vec<CleanRecord>,
}

#[derive(Debug, Clone, Copy)]
enum Slot {
    Existing(usize),
    Pending(usize),
}

/// Matches `source` against the keyed history rows in `existing`.
///
/// A record with a complete key that is already in history becomes an
/// update; any other record is inserted. Records without a complete key
/// never match anything, each one is a fresh insert. When the source holds
/// the same key twice, the later record wins and only one write happens.
pub fn plan_merge(existing: &HashMap<MergeKey, i64>, source: &[CleanRecord]) -> MergePlan {
    let mut plan = MergePlan::default();
    let mut seen: HashMap<MergeKey, Slot> = HashMap::new();
    let mut updates: Vec<(i64, CleanRecord)> = Vec::new();

    for record in source {
        let Some(key) = record.merge_key() else {
            plan.inserts.push(record.clone());
            continue;
        };
        match seen.get(&key).copied() {
            Some(Slot::Existing(idx)) => updates[idx].1 = record.clone(),
            Some(Slot::Pending(idx)) => plan.inserts[idx] = record.clone(),
            None => {
                let slot = match existing.get(&key) {
                    Some(rowid) => {
                        updates.push((*rowid, record.clone()));
                        Slot::Existing(updates.len() - 1)
                    }
                    None => {
                        plan.inserts.push(record.clone());
                        Slot::Pending(plan.inserts.len() - 1)
                    }
                };
                seen.insert(key, slot);
            }
        }
    }
    plan.updates = updates;
    plan
}

fn mutable_columns(record: &CleanRecord) -> Row {
    let full = clean_record_to_row(record);
    columns::MUTABLE
        .iter()
        .map(|name| (name.to_string(), full.get(name).clone()))
        .collect()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeStats {
    pub rows_inserted: u64,
    pub rows_updated: u64,
    pub history_created: bool,
}

/// Upserts the clean latest snapshot into the clean history table.
#[derive(Debug, Clone)]
pub struct HistoryMerger {
    warehouse: Warehouse,
    tables: TableNames,
}

impl HistoryMerger {
    pub fn new(warehouse: Warehouse, tables: TableNames) -> Self {
        Self { warehouse, tables }
    }

    /// Creates the history table from the clean snapshot's columns if it is
    /// missing, then applies the merge in a single transaction. History rows
    /// whose key is absent from the snapshot are left as they are.
    pub async fn merge(&self) -> Result<MergeStats, WarehouseError> {
        let source_table = &self.tables.clean_latest;
        let history_table = &self.tables.clean_history;

        let mut tx = self.warehouse.begin().await?;
        let history_created = ensure_table_like_in(&mut tx, history_table, source_table).await?;

        let source = read_table_in(&mut tx, source_table)
            .await?
            .iter()
            .map(row_to_clean_record)
            .collect::<Vec<_>>();

        let mut existing = HashMap::new();
        for (rowid, row) in read_rows_with_ids_in(&mut tx, history_table).await? {
            if let Some(key) = row_to_clean_record(&row).merge_key() {
                existing.entry(key).or_insert(rowid);
            }
        }

        let plan = plan_merge(&existing, &source);
        debug!(
            source_rows = source.len(),
            keyed_history_rows = existing.len(),
            updates = plan.updates.len(),
            inserts = plan.inserts.len(),
            "planned merge"
        );

        let mut rows_updated = 0;
        for (rowid, record) in &plan.updates {
            rows_updated += update_row_in(&mut tx, history_table, *rowid, &mutable_columns(record)).await?;
        }
        let rows_inserted = if plan.inserts.is_empty() {
            0
        } else {
            let rows = plan.inserts.iter().map(clean_record_to_row).collect::<Vec<_>>();
            insert_into_in(&mut tx, history_table, &rows).await?
        };
        tx.commit().await?;

        let stats = MergeStats {
            rows_inserted,
            rows_updated,
            history_created,
        };
        info!(
            table = %history_table,
            rows_inserted,
            rows_updated,
            history_created,
            "merged clean snapshot into history"
        );
        Ok(stats)
    }
}
