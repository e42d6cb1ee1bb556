//! Columnar table: a delta heap in front of a row-group catalog.
//!
//! Row identifiers of both regions share one space (see `row_id`). Inserts
//! always land in the delta region; housekeeping merges its all-visible
//! tail into row groups. Deleting a columnar row sets a bit in the group's
//! delete bitmap instead of rewriting the group.

use std::ops::Bound;
use std::sync::Arc;

use parking_lot::RwLock;

use strata_common::config::StorageConfig;
use strata_common::datum::OwnedRow;
use strata_common::error::StorageError;
use strata_common::schema::TableSchema;
use strata_common::types::TxnId;

use crate::batch::Batch;
use crate::catalog::RowGroupCatalog;
use crate::delta::{DeltaCursor, DeltaHeap, PagedDeltaHeap, ScanDirection};
use crate::index::SecondaryIndex;
use crate::merge::{self, MergeOutcome};
use crate::mvcc::{Snapshot, TupleHeader, TxnManager};
use crate::row_id::{RowId, RowIdSpace, RowOrigin};
use crate::scan::{HybridScan, ScanOptions};

/// Planner-facing size estimate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableSizeEstimate {
    /// Delta heap pages.
    pub pages: u64,
    /// Live rows in both regions (deleted columnar rows excluded).
    pub tuples: u64,
    pub row_groups: u64,
    /// Serialized column payload bytes.
    pub columnar_bytes: u64,
}

pub struct ColumnarTable {
    pub(crate) schema: TableSchema,
    pub(crate) config: StorageConfig,
    pub(crate) id_space: RowIdSpace,
    pub(crate) delta: Box<dyn DeltaHeap>,
    pub(crate) catalog: RowGroupCatalog,
    pub(crate) indexes: RwLock<Vec<Arc<dyn SecondaryIndex>>>,
    pub(crate) txns: Arc<TxnManager>,
    /// Shared by scans and writes, exclusive for merge and truncate. Writes
    /// take it recursively so a thread with an open scan can still write.
    pub(crate) lock: RwLock<()>,
}

impl ColumnarTable {
    pub fn new(schema: TableSchema, config: StorageConfig, txns: Arc<TxnManager>) -> Self {
        Self::with_delta(schema, config, txns, Box::new(PagedDeltaHeap::new()))
    }

    pub fn with_delta(
        schema: TableSchema,
        config: StorageConfig,
        txns: Arc<TxnManager>,
        delta: Box<dyn DeltaHeap>,
    ) -> Self {
        let id_space = RowIdSpace::new(config.delta_max_rows, config.row_group_capacity);
        let catalog = RowGroupCatalog::new(
            schema.id,
            id_space.max_row_group_id(),
            config.compression,
            config.minmax_prefix_len,
        );
        Self::from_parts(schema, config, txns, delta, catalog)
    }

    /// Reattach a catalog loaded with [`RowGroupCatalog::open`].
    pub fn from_parts(
        schema: TableSchema,
        config: StorageConfig,
        txns: Arc<TxnManager>,
        delta: Box<dyn DeltaHeap>,
        catalog: RowGroupCatalog,
    ) -> Self {
        Self {
            id_space: RowIdSpace::new(config.delta_max_rows, config.row_group_capacity),
            schema,
            config,
            delta,
            catalog,
            indexes: RwLock::new(Vec::new()),
            txns,
            lock: RwLock::new(()),
        }
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn catalog(&self) -> &RowGroupCatalog {
        &self.catalog
    }

    pub fn delta(&self) -> &dyn DeltaHeap {
        self.delta.as_ref()
    }

    pub fn id_space(&self) -> RowIdSpace {
        self.id_space
    }

    pub fn txn_manager(&self) -> &Arc<TxnManager> {
        &self.txns
    }

    /// Snapshot seeing everything committed so far.
    pub fn latest_snapshot(&self) -> Snapshot {
        Snapshot::latest(self.txns.log())
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    pub fn insert(&self, xid: TxnId, row: OwnedRow) -> Result<RowId, StorageError> {
        let row = self.schema.conform_row(row)?;
        let _guard = self.lock.read_recursive();
        let limit = self.id_space.delta_limit();
        if self.delta.allocated_slots() >= limit {
            return Err(StorageError::DeltaFull {
                rows: self.delta.allocated_slots(),
                limit,
            });
        }
        let keys: Vec<_> = self
            .indexes
            .read()
            .iter()
            .map(|idx| (Arc::clone(idx), idx.key_of(&row)))
            .collect();
        let ptr = self.delta.insert(TupleHeader::inserted_by(xid), row);
        let row_id = match self.id_space.delta(ptr) {
            Ok(id) => id,
            Err(e) => {
                self.delta.remove(ptr)?;
                return Err(e);
            }
        };
        for (idx, key) in keys {
            idx.insert(key, row_id);
        }
        Ok(row_id)
    }

    pub fn insert_rows(
        &self,
        xid: TxnId,
        rows: impl IntoIterator<Item = OwnedRow>,
    ) -> Result<Vec<RowId>, StorageError> {
        let _guard = self.lock.read_recursive();
        rows.into_iter().map(|r| self.insert(xid, r)).collect()
    }

    /// Devectorize a batch into delta inserts; skipped rows are ignored.
    /// The batch must carry every table column.
    pub fn insert_batch(&self, xid: TxnId, batch: &Batch<'_>) -> Result<Vec<RowId>, StorageError> {
        if batch.num_columns() != self.schema.num_columns() {
            return Err(StorageError::ArityMismatch {
                expected: self.schema.num_columns(),
                got: batch.num_columns(),
            });
        }
        let _guard = self.lock.read_recursive();
        batch
            .active_rows(None)
            .map(|r| self.insert(xid, batch.row(r)))
            .collect()
    }

    pub fn delete(&self, xid: TxnId, row_id: RowId) -> Result<(), StorageError> {
        let _guard = self.lock.read_recursive();
        match self.id_space.decode(row_id)? {
            RowOrigin::Delta(ptr) => {
                let log = self.txns.log();
                self.delta.delete(ptr, xid, &log)
            }
            RowOrigin::Columnar {
                row_group_id,
                row_offset,
            } => {
                let row = self
                    .fetch_columnar(row_group_id, row_offset)?
                    .ok_or(StorageError::TupleNotFound)?;
                if !self.catalog.update_delete_bit(row_group_id, row_offset)? {
                    return Err(StorageError::TupleNotFound);
                }
                for idx in self.indexes.read().iter() {
                    idx.remove(&idx.key_of(&row), row_id);
                }
                tracing::debug!(
                    "{}: deleted columnar row {} (group {}, offset {})",
                    self.schema.name,
                    row_id,
                    row_group_id,
                    row_offset
                );
                Ok(())
            }
        }
    }

    /// Delete then re-insert into the delta region; returns the new id.
    pub fn update(&self, xid: TxnId, row_id: RowId, row: OwnedRow) -> Result<RowId, StorageError> {
        let row = self.schema.conform_row(row)?;
        let _guard = self.lock.read_recursive();
        self.delete(xid, row_id)?;
        self.insert(xid, row)
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Point lookup. Columnar rows are visible unless their delete bit is set.
    pub fn fetch(&self, row_id: RowId, snapshot: &Snapshot) -> Result<Option<OwnedRow>, StorageError> {
        match self.id_space.decode(row_id)? {
            RowOrigin::Delta(ptr) => Ok(self
                .delta
                .fetch(ptr)
                .filter(|t| snapshot.is_visible(&t.header))
                .map(|t| t.row)),
            RowOrigin::Columnar {
                row_group_id,
                row_offset,
            } => self.fetch_columnar(row_group_id, row_offset),
        }
    }

    fn fetch_columnar(&self, row_group_id: u64, row_offset: u32) -> Result<Option<OwnedRow>, StorageError> {
        if self.catalog.entry(row_group_id, 0).is_none() {
            return Ok(None);
        }
        let rows = self.catalog.row_count(row_group_id)?;
        if row_offset as usize >= rows {
            return Ok(None);
        }
        if let Some(bm) = self.catalog.read_delete_bitmap(row_group_id)? {
            if bm.get(row_offset as usize) {
                return Ok(None);
            }
        }
        let mut values = Vec::with_capacity(self.schema.num_columns());
        for col in 0..self.schema.num_columns() {
            values.push(self.catalog.value_at(row_group_id, col, row_offset as usize)?);
        }
        Ok(Some(OwnedRow::new(values)))
    }

    pub fn begin_scan(&self, options: ScanOptions) -> HybridScan<'_> {
        HybridScan::new(self, options)
    }

    pub fn estimate_size(&self) -> Result<TableSizeEstimate, StorageError> {
        let (stored, deleted) = self.catalog.totals()?;
        Ok(TableSizeEstimate {
            pages: self.delta.pages(),
            tuples: (self.delta.live_tuples() + stored - deleted) as u64,
            row_groups: self.catalog.row_group_count() as u64,
            columnar_bytes: self.catalog.payload_bytes() as u64,
        })
    }

    // -----------------------------------------------------------------------
    // Maintenance
    // -----------------------------------------------------------------------

    /// Whether the delta region has outgrown its merge threshold.
    pub fn needs_merge(&self) -> bool {
        let threshold = self.config.delta_merge_threshold * self.config.delta_max_rows as f64;
        self.delta.live_tuples() as f64 > threshold
    }

    /// Merge if the delta region is over threshold. Never blocks on the
    /// table lock.
    pub fn housekeeping(&self) -> Result<MergeOutcome, StorageError> {
        if !self.needs_merge() {
            return Ok(MergeOutcome::NotNeeded);
        }
        self.merge()
    }

    pub fn merge(&self) -> Result<MergeOutcome, StorageError> {
        merge::merge_table(self)
    }

    /// Drop every row of both regions. Blocks until running scans finish.
    pub fn truncate(&self) {
        let _guard = self.lock.write();
        self.catalog.clear();
        self.delta.clear();
        for idx in self.indexes.read().iter() {
            idx.clear();
        }
        tracing::info!("{}: truncated", self.schema.name);
    }

    // -----------------------------------------------------------------------
    // Secondary indexes
    // -----------------------------------------------------------------------

    pub fn indexes(&self) -> Vec<Arc<dyn SecondaryIndex>> {
        self.indexes.read().clone()
    }

    pub fn index(&self, name: &str) -> Option<Arc<dyn SecondaryIndex>> {
        self.indexes.read().iter().find(|i| i.name() == name).cloned()
    }

    /// Populate `index` from every stored row that is not known dead, then
    /// register it for maintenance. Returns the number of entries added.
    pub fn build_index(&self, index: Arc<dyn SecondaryIndex>) -> Result<usize, StorageError> {
        index.clear();
        let mut added = 0;
        {
            let mut scan = self.begin_scan(ScanOptions::new(self.latest_snapshot()));
            while let Some((row_id, row)) = scan.next_row()? {
                index.insert(index.key_of(&row), row_id);
                added += 1;
            }
        }
        // In-flight delta rows are indexed too so they stay reachable once
        // their inserting transactions commit.
        let mut cursor = DeltaCursor::new(ScanDirection::Forward);
        loop {
            let chunk = self.delta.read_chunk(&mut cursor, 1024);
            if chunk.is_empty() {
                break;
            }
            let snapshot = self.latest_snapshot();
            for (ptr, t) in chunk {
                if !snapshot.is_visible(&t.header) && !self.txns.is_dead(&t.header) {
                    index.insert(index.key_of(&t.row), self.id_space.delta(ptr)?);
                    added += 1;
                }
            }
        }
        tracing::info!(
            "{}: built index {} with {} entries",
            self.schema.name,
            index.name(),
            added
        );
        self.indexes.write().push(index);
        Ok(added)
    }

    /// Every row visible to the latest snapshot has exactly one entry, and
    /// every entry points at a row that still exists.
    pub fn validate_index(&self, name: &str) -> Result<(), StorageError> {
        let index = self.index(name).ok_or_else(|| {
            StorageError::IndexInconsistent(name.to_string(), "no such index".into())
        })?;
        let mut visible = 0usize;
        let mut scan = self.begin_scan(ScanOptions::new(self.latest_snapshot()));
        while let Some((row_id, row)) = scan.next_row()? {
            let hits = index
                .lookup(&index.key_of(&row))
                .into_iter()
                .filter(|id| *id == row_id)
                .count();
            if hits != 1 {
                return Err(StorageError::IndexInconsistent(
                    name.to_string(),
                    format!("row {} has {} entries", row_id, hits),
                ));
            }
            visible += 1;
        }
        drop(scan);
        let dangling = index
            .range_scan(Bound::Unbounded, Bound::Unbounded)
            .into_iter()
            .filter(|id| !self.row_exists(*id))
            .count();
        if dangling > 0 {
            return Err(StorageError::IndexInconsistent(
                name.to_string(),
                format!("{} entries point at missing rows", dangling),
            ));
        }
        tracing::debug!("{}: index {} valid over {} rows", self.schema.name, name, visible);
        Ok(())
    }

    fn row_exists(&self, row_id: RowId) -> bool {
        match self.id_space.decode(row_id) {
            Ok(RowOrigin::Delta(ptr)) => self.delta.fetch(ptr).is_some(),
            Ok(RowOrigin::Columnar {
                row_group_id,
                row_offset,
            }) => matches!(self.fetch_columnar(row_group_id, row_offset), Ok(Some(_))),
            Err(_) => false,
        }
    }
}
