//! Delta-to-columnar merge.
//!
//! Walks the delta region backward, newest slot first, collecting rows that
//! every snapshot can see. Each full batch of `row_group_capacity` rows
//! becomes one row group: it is persisted, index entries are re-pointed to
//! the new columnar ids, then the delta copies are removed. Walking from the
//! tail means the freed slots sit at the end of the heap and can be
//! truncated right away. Rows no snapshot can see any more are removed on
//! the way.
//!
//! Merge needs the table's exclusive lock and never waits for it.

use strata_common::datum::OwnedRow;
use strata_common::error::StorageError;

use crate::delta::{DeltaCursor, ScanDirection};
use crate::row_group::RowGroup;
use crate::row_id::ItemPointer;
use crate::table::ColumnarTable;

/// What a merge pass did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The table lock was held elsewhere; retry on a later pass.
    Skipped,
    /// The delta region is below the merge threshold.
    NotNeeded,
    Merged(MergeReport),
}

impl MergeOutcome {
    pub fn report(&self) -> Option<&MergeReport> {
        match self {
            MergeOutcome::Merged(r) => Some(r),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Ids of the row groups written, in creation order.
    pub row_groups: Vec<u64>,
    pub rows_moved: u64,
    pub dead_rows_removed: u64,
    pub pages_truncated: u64,
}

pub(crate) fn merge_table(table: &ColumnarTable) -> Result<MergeOutcome, StorageError> {
    let Some(_guard) = table.lock.try_write() else {
        tracing::debug!("{}: merge skipped, table lock busy", table.schema.name);
        return Ok(MergeOutcome::Skipped);
    };

    let capacity = table.config.row_group_capacity;
    let mut report = MergeReport::default();
    let mut pending: Vec<(ItemPointer, OwnedRow)> = Vec::with_capacity(capacity);
    let mut cursor = DeltaCursor::new(ScanDirection::Backward);

    while !cursor.is_exhausted() {
        let chunk = table.delta.read_chunk(&mut cursor, capacity);
        for (ptr, tuple) in chunk {
            if table.txns.is_dead(&tuple.header) {
                let row_id = table.id_space.delta(ptr)?;
                for idx in table.indexes.read().iter() {
                    idx.remove(&idx.key_of(&tuple.row), row_id);
                }
                table.delta.remove(ptr)?;
                report.dead_rows_removed += 1;
                continue;
            }
            if !table.txns.is_all_visible(&tuple.header) {
                continue;
            }
            pending.push((ptr, tuple.row));
            if pending.len() == capacity {
                flush(table, &mut pending, &mut report)?;
            }
        }
    }
    if !pending.is_empty() && table.config.merge_drain_all {
        flush(table, &mut pending, &mut report)?;
    }

    report.pages_truncated = table.delta.truncate_empty_tail();
    tracing::info!(
        "{}: merge wrote {} row groups ({} rows), removed {} dead rows, released {} pages",
        table.schema.name,
        report.row_groups.len(),
        report.rows_moved,
        report.dead_rows_removed,
        report.pages_truncated
    );
    Ok(MergeOutcome::Merged(report))
}

/// Persist `pending` as one row group and retire the delta copies.
fn flush(
    table: &ColumnarTable,
    pending: &mut Vec<(ItemPointer, OwnedRow)>,
    report: &mut MergeReport,
) -> Result<(), StorageError> {
    // Collected newest first; store in insertion order.
    pending.reverse();
    let batch = std::mem::take(pending);
    let rows: Vec<OwnedRow> = batch.iter().map(|(_, r)| r.clone()).collect();

    let id = table.catalog.next_row_group_id()?;
    let group = RowGroup::from_rows(id, &table.schema, &rows, table.config.row_group_capacity)?;
    table.catalog.insert_row_group(&group)?;

    let indexes = table.indexes.read();
    for (offset, (ptr, row)) in batch.iter().enumerate() {
        let old_id = table.id_space.delta(*ptr)?;
        let new_id = table.id_space.columnar(id, offset as u32)?;
        for idx in indexes.iter() {
            let key = idx.key_of(row);
            idx.remove(&key, old_id);
            idx.insert(key, new_id);
        }
        table.delta.remove(*ptr)?;
    }

    report.row_groups.push(id);
    report.rows_moved += batch.len() as u64;
    tracing::debug!(
        "{}: row group {} written with {} rows",
        table.schema.name,
        id,
        batch.len()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use strata_common::config::StorageConfig;
    use strata_common::datum::Datum;
    use strata_common::schema::{ColumnDef, TableSchema};
    use strata_common::types::{DataType, TableId, TxnId};

    use super::*;
    use crate::index::BTreeSecondaryIndex;
    use crate::mvcc::TxnManager;
    use crate::scan::ScanOptions;

    fn table(capacity: usize, drain_all: bool) -> ColumnarTable {
        let schema = TableSchema::new(
            TableId(1),
            "m",
            vec![
                ColumnDef::new("id", DataType::Int64).not_null(),
                ColumnDef::new("name", DataType::Text),
            ],
        );
        let config = StorageConfig {
            row_group_capacity: capacity,
            delta_max_rows: 1 << 20,
            merge_drain_all: drain_all,
            ..StorageConfig::default()
        };
        ColumnarTable::new(schema, config, Arc::new(TxnManager::new()))
    }

    fn row(i: i64) -> OwnedRow {
        OwnedRow::new(vec![Datum::Int64(i), Datum::Text(format!("n{}", i))])
    }

    #[test]
    fn test_full_batches_only() {
        let t = table(4, false);
        for i in 0..10 {
            t.insert(TxnId::FROZEN, row(i)).unwrap();
        }
        let report = t.merge().unwrap().report().cloned().unwrap();
        assert_eq!(report.row_groups.len(), 2);
        assert_eq!(report.rows_moved, 8);
        assert_eq!(t.delta().live_tuples(), 2);
        // the two oldest rows stay behind
        let g0 = t.catalog().read_column(report.row_groups[0], 0).unwrap();
        assert_eq!(g0.get(0), Datum::Int64(6));
        assert_eq!(g0.get(3), Datum::Int64(9));
        assert_eq!(report.pages_truncated, 0);
    }

    #[test]
    fn test_drain_all_merges_remainder() {
        let t = table(4, true);
        for i in 0..6 {
            t.insert(TxnId::FROZEN, row(i)).unwrap();
        }
        let report = t.merge().unwrap().report().cloned().unwrap();
        assert_eq!(report.rows_moved, 6);
        assert_eq!(t.delta().live_tuples(), 0);
        assert_eq!(t.delta().allocated_slots(), 0);
    }

    #[test]
    fn test_uncommitted_rows_stay_in_delta() {
        let t = table(2, true);
        let mgr = Arc::clone(t.txn_manager());
        let open = mgr.begin();
        t.insert(TxnId::FROZEN, row(1)).unwrap();
        t.insert(open, row(2)).unwrap();
        t.merge().unwrap();
        assert_eq!(t.delta().live_tuples(), 1);
        mgr.commit(open);
        let n = t
            .begin_scan(ScanOptions::new(t.latest_snapshot()))
            .count()
            .unwrap();
        assert_eq!(n, 2);
    }

    #[test]
    fn test_dead_rows_removed() {
        let t = table(8, false);
        let mgr = Arc::clone(t.txn_manager());
        let aborted = mgr.begin();
        t.insert(aborted, row(1)).unwrap();
        mgr.abort(aborted);
        let report = t.merge().unwrap().report().cloned().unwrap();
        assert_eq!(report.dead_rows_removed, 1);
        assert_eq!(t.delta().live_tuples(), 0);
    }

    #[test]
    fn test_index_entries_follow_rows() {
        let t = table(2, false);
        t.build_index(Arc::new(BTreeSecondaryIndex::new("by_id", vec![0])))
            .unwrap();
        let before: Vec<_> = (0..2).map(|i| t.insert(TxnId::FROZEN, row(i)).unwrap()).collect();
        t.merge().unwrap();
        let idx = t.index("by_id").unwrap();
        let after = idx.lookup(&[Datum::Int64(1)]);
        assert_eq!(after.len(), 1);
        assert_ne!(after[0], before[1]);
        assert!(t.id_space().is_columnar(after[0]));
        t.validate_index("by_id").unwrap();
    }

    #[test]
    fn test_skipped_while_scan_open() {
        let t = table(2, true);
        t.insert(TxnId::FROZEN, row(1)).unwrap();
        let scan = t.begin_scan(ScanOptions::new(t.latest_snapshot()));
        assert_eq!(t.merge().unwrap(), MergeOutcome::Skipped);
        drop(scan);
        assert!(matches!(t.merge().unwrap(), MergeOutcome::Merged(_)));
    }

    #[test]
    fn test_delete_during_merges_is_never_lost() {
        let t = table(8, true);
        t.build_index(Arc::new(BTreeSecondaryIndex::new("by_id", vec![0])))
            .unwrap();
        for i in 0..64 {
            t.insert(TxnId::FROZEN, row(i)).unwrap();
        }
        let mgr = Arc::clone(t.txn_manager());
        let idx = t.index("by_id").unwrap();
        let done = AtomicBool::new(false);
        let deleted: Vec<i64> = (0..64).step_by(3).collect();

        let passes = std::thread::scope(|s| {
            let merger = s.spawn(|| {
                let mut passes = 0u32;
                while !done.load(Ordering::Acquire) {
                    if matches!(t.merge().unwrap(), MergeOutcome::Merged(_)) {
                        passes += 1;
                    }
                    std::thread::yield_now();
                }
                passes
            });
            let xid = mgr.begin();
            for &i in &deleted {
                // the row may move to a row group between lookup and delete
                loop {
                    let found = idx.lookup(&[Datum::Int64(i)]);
                    match found.first().map(|id| t.delete(xid, *id)) {
                        Some(Ok(())) => break,
                        Some(Err(StorageError::TupleNotFound)) | None => std::thread::yield_now(),
                        Some(Err(e)) => panic!("delete of {} failed: {}", i, e),
                    }
                }
            }
            mgr.commit(xid);
            done.store(true, Ordering::Release);
            merger.join().unwrap()
        });
        assert!(passes > 0);

        t.merge().unwrap();
        let mut scan = t.begin_scan(ScanOptions::new(t.latest_snapshot()));
        let mut seen = Vec::new();
        while let Some((_, r)) = scan.next_row().unwrap() {
            seen.push(r.values[0].as_i64().unwrap());
        }
        drop(scan);
        seen.sort();
        let want: Vec<i64> = (0..64).filter(|i| i % 3 != 0).collect();
        assert_eq!(seen, want);
        assert_eq!(t.delta().live_tuples(), 0);
    }
}
