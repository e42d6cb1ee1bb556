//! Row-group catalog: persisted metadata keyed by (row_group_id, column_index).
//!
//! Each real column of a row group has exactly one entry holding its
//! serialized payload plus min/max statistics. Column index `-2` holds the
//! group's delete bitmap; it is the only entry ever rewritten in place and
//! its absence means "no rows deleted". Column index `-1` is reserved.
//!
//! Writes of a whole row group are all-or-nothing: every entry is encoded
//! before any of them becomes visible.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use strata_common::config::CompressionMethod;
use strata_common::datum::Datum;
use strata_common::error::{EncodingError, StorageError};
use strata_common::types::{DataType, TableId};

use crate::bitmap::Bitmap;
use crate::codec::{self, ColumnOptions, EncodedColumn};
use crate::column_vector::{ColumnVector, ZoneMap};
use crate::row_group::RowGroup;

pub const DELETE_BITMAP_COLUMN: i32 = -2;
/// Historically held row identifiers; never written.
pub const TID_COLUMN: i32 = -1;

const SNAPSHOT_MAGIC: u32 = 0x5354_5247; // "STRG"

// ---------------------------------------------------------------------------
// Entries
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMode {
    /// No null stream stored.
    pub non_null: bool,
    pub fixed_width: bool,
}

/// One persisted catalog record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub row_group_id: u64,
    pub column_index: i32,
    pub min: Option<Datum>,
    pub max: Option<Datum>,
    pub row_count: u32,
    pub null_count: u32,
    pub mode: EntryMode,
    pub element_width: i16,
    /// `None` for the delete-bitmap entry.
    pub data_type: Option<DataType>,
    pub serialized_values: Vec<u8>,
    pub serialized_nulls: Option<Vec<u8>>,
    /// JSON options document (compression, format version).
    pub options: String,
}

impl CatalogEntry {
    fn for_column(
        row_group_id: u64,
        column_index: i32,
        encoded: EncodedColumn,
        zone: ZoneMap,
    ) -> Result<Self, StorageError> {
        Ok(Self {
            row_group_id,
            column_index,
            min: zone.min,
            max: zone.max,
            row_count: encoded.row_count,
            null_count: zone.null_count as u32,
            mode: EntryMode {
                non_null: encoded.is_non_null(),
                fixed_width: encoded.data_type.is_fixed_width(),
            },
            element_width: encoded.element_width,
            data_type: Some(encoded.data_type),
            options: encoded.options.to_json()?,
            serialized_values: encoded.values,
            serialized_nulls: encoded.nulls,
        })
    }

    fn for_delete_bitmap(row_group_id: u64, row_count: u32, bitmap: &Bitmap) -> Self {
        Self {
            row_group_id,
            column_index: DELETE_BITMAP_COLUMN,
            min: None,
            max: None,
            row_count,
            null_count: 0,
            mode: EntryMode {
                non_null: true,
                fixed_width: true,
            },
            element_width: 1,
            data_type: None,
            serialized_values: bitmap.to_bytes(),
            serialized_nulls: None,
            options: String::new(),
        }
    }

    pub fn is_delete_bitmap(&self) -> bool {
        self.column_index == DELETE_BITMAP_COLUMN
    }

    pub fn encoded(&self) -> Result<EncodedColumn, StorageError> {
        let data_type = self.data_type.ok_or_else(|| {
            StorageError::Serialization(format!(
                "entry ({}, {}) has no column type",
                self.row_group_id, self.column_index
            ))
        })?;
        Ok(EncodedColumn {
            data_type,
            element_width: self.element_width,
            row_count: self.row_count,
            values: self.serialized_values.clone(),
            nulls: self.serialized_nulls.clone(),
            options: ColumnOptions::from_json(&self.options)?,
        })
    }

    pub fn zone_map(&self) -> ZoneMap {
        ZoneMap {
            min: self.min.clone(),
            max: self.max.clone(),
            null_count: self.null_count as usize,
            row_count: self.row_count as usize,
        }
    }

    pub fn payload_bytes(&self) -> usize {
        self.serialized_values.len() + self.serialized_nulls.as_ref().map_or(0, Vec::len)
    }
}

// ---------------------------------------------------------------------------
// Row-group id sequence
// ---------------------------------------------------------------------------

/// Monotonic per-table row-group id allocator.
#[derive(Debug)]
pub struct RowGroupSequence {
    next: AtomicU64,
    max: u64,
}

impl RowGroupSequence {
    pub fn new(start: u64, max: u64) -> Self {
        Self {
            next: AtomicU64::new(start),
            max,
        }
    }

    pub fn next(&self, table: TableId) -> Result<u64, StorageError> {
        let max = self.max;
        self.next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                (v <= max).then_some(v + 1)
            })
            .map_err(|_| StorageError::SequenceExhausted { table, max })
    }

    pub fn peek(&self) -> u64 {
        self.next.load(Ordering::SeqCst)
    }

    fn reset(&self, next: u64) {
        self.next.store(next, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize)]
struct CatalogSnapshot {
    magic: u32,
    table: TableId,
    next_row_group_id: u64,
    entries: Vec<CatalogEntry>,
}

pub struct RowGroupCatalog {
    table: TableId,
    entries: RwLock<BTreeMap<(u64, i32), Arc<CatalogEntry>>>,
    sequence: RowGroupSequence,
    compression: CompressionMethod,
    prefix_len: usize,
    /// Bumped when stored row groups are replaced or dropped; decode caches
    /// compare against it.
    storage_generation: AtomicU64,
    /// Bumped after every delete-bitmap write.
    bitmap_generation: AtomicU64,
}

impl RowGroupCatalog {
    pub fn new(
        table: TableId,
        max_row_group_id: u64,
        compression: CompressionMethod,
        prefix_len: usize,
    ) -> Self {
        Self {
            table,
            entries: RwLock::new(BTreeMap::new()),
            sequence: RowGroupSequence::new(0, max_row_group_id),
            compression,
            prefix_len,
            storage_generation: AtomicU64::new(0),
            bitmap_generation: AtomicU64::new(0),
        }
    }

    pub fn table(&self) -> TableId {
        self.table
    }

    pub fn next_row_group_id(&self) -> Result<u64, StorageError> {
        self.sequence.next(self.table)
    }

    pub fn storage_generation(&self) -> u64 {
        self.storage_generation.load(Ordering::Acquire)
    }

    pub fn bitmap_generation(&self) -> u64 {
        self.bitmap_generation.load(Ordering::Acquire)
    }

    /// Persist every column of `rg` (and its delete bitmap, first, if any).
    pub fn insert_row_group(&self, rg: &RowGroup) -> Result<(), StorageError> {
        let mut pending = Vec::with_capacity(rg.num_columns() + 1);
        if let Some(bm) = rg.delete_bitmap() {
            pending.push(CatalogEntry::for_delete_bitmap(rg.id, rg.dim() as u32, bm));
        }
        for (idx, col) in rg.columns().iter().enumerate() {
            let encoded = codec::serialize(col, self.compression)?;
            let zone = col.zone_map(self.prefix_len);
            pending.push(CatalogEntry::for_column(rg.id, idx as i32, encoded, zone)?);
        }

        let mut entries = self.entries.write();
        if entries.range((rg.id, i32::MIN)..=(rg.id, i32::MAX)).next().is_some() {
            return Err(StorageError::DuplicateRowGroup(rg.id));
        }
        let bytes: usize = pending.iter().map(CatalogEntry::payload_bytes).sum();
        for entry in pending {
            entries.insert((entry.row_group_id, entry.column_index), Arc::new(entry));
        }
        tracing::debug!(
            "row group {} persisted for {}: rows={}, columns={}, bytes={}",
            rg.id,
            self.table,
            rg.dim(),
            rg.num_columns(),
            bytes
        );
        Ok(())
    }

    pub fn entry(&self, row_group_id: u64, column_index: i32) -> Option<Arc<CatalogEntry>> {
        self.entries.read().get(&(row_group_id, column_index)).cloned()
    }

    fn column_entry(&self, row_group_id: u64, column_index: usize) -> Result<Arc<CatalogEntry>, StorageError> {
        self.entry(row_group_id, column_index as i32)
            .ok_or(StorageError::CatalogEntryMissing {
                row_group_id,
                column_index: column_index as i32,
            })
    }

    /// Decode one stored column.
    pub fn read_column(
        &self,
        row_group_id: u64,
        column_index: usize,
    ) -> Result<ColumnVector<'static>, StorageError> {
        let entry = self.column_entry(row_group_id, column_index)?;
        codec::fill(&entry.encoded()?)
    }

    /// One stored value. Dense fixed-width columns are read in place; any
    /// other column is decoded first.
    pub fn value_at(&self, row_group_id: u64, column_index: usize, row: usize) -> Result<Datum, StorageError> {
        let entry = self.column_entry(row_group_id, column_index)?;
        if row >= entry.row_count as usize {
            return Err(StorageError::TupleNotFound);
        }
        if let Some(data_type) = entry.data_type {
            let compression = ColumnOptions::from_json(&entry.options)?.compression;
            if let Some(view) = codec::view_in_place(
                data_type,
                entry.element_width,
                entry.row_count as usize,
                &entry.serialized_values,
                entry.serialized_nulls.is_some(),
                compression,
            ) {
                return Ok(view.get(row));
            }
        }
        Ok(codec::fill(&entry.encoded()?)?.get(row))
    }

    pub fn zone_map(&self, row_group_id: u64, column_index: usize) -> Result<ZoneMap, StorageError> {
        Ok(self.column_entry(row_group_id, column_index)?.zone_map())
    }

    pub fn row_count(&self, row_group_id: u64) -> Result<usize, StorageError> {
        Ok(self.column_entry(row_group_id, 0)?.row_count as usize)
    }

    pub fn read_delete_bitmap(&self, row_group_id: u64) -> Result<Option<Bitmap>, StorageError> {
        match self.entry(row_group_id, DELETE_BITMAP_COLUMN) {
            None => Ok(None),
            Some(e) => decode_bitmap(&e).map(Some),
        }
    }

    pub fn deleted_count(&self, row_group_id: u64) -> Result<usize, StorageError> {
        Ok(self
            .read_delete_bitmap(row_group_id)?
            .map_or(0, |b| b.count_ones()))
    }

    /// Mark `row_offset` deleted. Returns `false` when it already was.
    ///
    /// The read-modify-write of the `-2` entry happens under the catalog
    /// write lock, so one writer at a time touches a group's bitmap. The
    /// generation bump afterwards makes later reads observe the new bit.
    pub fn update_delete_bit(&self, row_group_id: u64, row_offset: u32) -> Result<bool, StorageError> {
        let newly_set = {
            let mut entries = self.entries.write();
            let rows = entries
                .get(&(row_group_id, 0))
                .map(|e| e.row_count)
                .ok_or(StorageError::RowGroupNotFound(row_group_id))?;
            if row_offset >= rows {
                return Err(StorageError::RowIdOutOfRange(row_offset as u64));
            }
            let mut bitmap = match entries.get(&(row_group_id, DELETE_BITMAP_COLUMN)) {
                Some(e) => decode_bitmap(e)?,
                None => Bitmap::with_len(rows as usize),
            };
            let newly_set = bitmap.set(row_offset as usize);
            entries.insert(
                (row_group_id, DELETE_BITMAP_COLUMN),
                Arc::new(CatalogEntry::for_delete_bitmap(row_group_id, rows, &bitmap)),
            );
            newly_set
        };
        self.bitmap_generation.fetch_add(1, Ordering::AcqRel);
        Ok(newly_set)
    }

    /// Row-group ids in ascending order.
    pub fn row_group_ids(&self) -> Vec<u64> {
        let entries = self.entries.read();
        let mut ids: Vec<u64> = entries
            .keys()
            .filter(|(_, col)| *col >= 0)
            .map(|(rg, _)| *rg)
            .collect();
        ids.dedup();
        ids
    }

    pub fn max_row_group_id(&self) -> Option<u64> {
        self.entries
            .read()
            .keys()
            .rev()
            .find(|(_, col)| *col >= 0)
            .map(|(rg, _)| *rg)
    }

    pub fn row_group_count(&self) -> usize {
        self.row_group_ids().len()
    }

    /// Total rows stored and total rows marked deleted, across all groups.
    pub fn totals(&self) -> Result<(usize, usize), StorageError> {
        let entries = self.entries.read();
        let mut rows = 0;
        let mut deleted = 0;
        for ((_, col), e) in entries.iter() {
            if *col == 0 {
                rows += e.row_count as usize;
            } else if *col == DELETE_BITMAP_COLUMN {
                deleted += decode_bitmap(e)?.count_ones();
            }
        }
        Ok((rows, deleted))
    }

    pub fn payload_bytes(&self) -> usize {
        self.entries.read().values().map(|e| e.payload_bytes()).sum()
    }

    pub fn remove_row_group(&self, row_group_id: u64) -> Result<(), StorageError> {
        let mut entries = self.entries.write();
        let keys: Vec<(u64, i32)> = entries
            .range((row_group_id, i32::MIN)..=(row_group_id, i32::MAX))
            .map(|(k, _)| *k)
            .collect();
        if keys.is_empty() {
            return Err(StorageError::RowGroupNotFound(row_group_id));
        }
        for k in keys {
            entries.remove(&k);
        }
        drop(entries);
        self.storage_generation.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Drop every row group. The id sequence keeps counting.
    pub fn clear(&self) {
        self.entries.write().clear();
        self.storage_generation.fetch_add(1, Ordering::AcqRel);
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    /// Write a bincode snapshot followed by a crc32 trailer.
    pub fn save(&self, path: &Path) -> Result<(), StorageError> {
        let snapshot = CatalogSnapshot {
            magic: SNAPSHOT_MAGIC,
            table: self.table,
            next_row_group_id: self.sequence.peek(),
            entries: self.entries.read().values().map(|e| (**e).clone()).collect(),
        };
        let mut data =
            bincode::serialize(&snapshot).map_err(|e| StorageError::Serialization(e.to_string()))?;
        let checksum = crc32fast::hash(&data);
        data.extend_from_slice(&checksum.to_le_bytes());

        let tmp = path.with_extension("tmp");
        {
            let mut f = fs::File::create(&tmp)?;
            f.write_all(&data)?;
            f.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        tracing::debug!(
            "catalog snapshot for {} saved: entries={}, bytes={}",
            self.table,
            snapshot.entries.len(),
            data.len()
        );
        Ok(())
    }

    /// Load a snapshot written by [`save`](Self::save).
    pub fn open(
        path: &Path,
        max_row_group_id: u64,
        compression: CompressionMethod,
        prefix_len: usize,
    ) -> Result<Self, StorageError> {
        let data = fs::read(path)?;
        if data.len() < 4 {
            return Err(StorageError::Serialization("catalog snapshot too short".into()));
        }
        let (body, trailer) = data.split_at(data.len() - 4);
        let expected = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
        let actual = crc32fast::hash(body);
        if expected != actual {
            tracing::warn!(
                "catalog snapshot {} failed checksum: expected={:#010x}, actual={:#010x}",
                path.display(),
                expected,
                actual
            );
            return Err(StorageError::Serialization("catalog checksum mismatch".into()));
        }
        let snapshot: CatalogSnapshot =
            bincode::deserialize(body).map_err(|e| StorageError::Serialization(e.to_string()))?;
        if snapshot.magic != SNAPSHOT_MAGIC {
            return Err(StorageError::Serialization("not a catalog snapshot".into()));
        }

        let catalog = Self::new(snapshot.table, max_row_group_id, compression, prefix_len);
        catalog.sequence.reset(snapshot.next_row_group_id);
        {
            let mut entries = catalog.entries.write();
            for e in snapshot.entries {
                if e.column_index == TID_COLUMN {
                    return Err(StorageError::Serialization(format!(
                        "reserved column index in row group {}",
                        e.row_group_id
                    )));
                }
                entries.insert((e.row_group_id, e.column_index), Arc::new(e));
            }
        }
        Ok(catalog)
    }
}

fn decode_bitmap(entry: &CatalogEntry) -> Result<Bitmap, StorageError> {
    Bitmap::from_bytes(&entry.serialized_values, entry.row_count as usize).ok_or_else(|| {
        EncodingError::LengthOverflow {
            declared: (entry.row_count as usize).div_ceil(8),
            available: entry.serialized_values.len(),
        }
        .into()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_common::datum::OwnedRow;
    use strata_common::schema::{ColumnDef, TableSchema};

    fn schema() -> TableSchema {
        TableSchema::new(
            TableId(9),
            "t",
            vec![
                ColumnDef::new("k", DataType::Int32),
                ColumnDef::new("s", DataType::Text),
            ],
        )
    }

    fn group(id: u64, n: i32) -> RowGroup {
        let rows: Vec<OwnedRow> = (0..n)
            .map(|i| OwnedRow::new(vec![Datum::Int32(i * 10), Datum::Text(format!("v{}", i))]))
            .collect();
        RowGroup::from_rows(id, &schema(), &rows, 1024).unwrap()
    }

    fn catalog() -> RowGroupCatalog {
        RowGroupCatalog::new(TableId(9), 100, CompressionMethod::None, 16)
    }

    #[test]
    fn test_insert_and_read_back() {
        let cat = catalog();
        cat.insert_row_group(&group(0, 5)).unwrap();
        let col = cat.read_column(0, 0).unwrap();
        assert_eq!(col.get(4), Datum::Int32(40));
        let z = cat.zone_map(0, 0).unwrap();
        assert_eq!((z.min, z.max), (Some(Datum::Int32(0)), Some(Datum::Int32(40))));
        assert_eq!(cat.row_group_ids(), vec![0]);
        assert!(cat.read_delete_bitmap(0).unwrap().is_none());
    }

    #[test]
    fn test_duplicate_group_rejected_without_partial_write() {
        let cat = catalog();
        cat.insert_row_group(&group(3, 2)).unwrap();
        let before = cat.payload_bytes();
        assert!(matches!(
            cat.insert_row_group(&group(3, 4)),
            Err(StorageError::DuplicateRowGroup(3))
        ));
        assert_eq!(cat.payload_bytes(), before);
        assert_eq!(cat.row_count(3).unwrap(), 2);
    }

    #[test]
    fn test_value_at_agrees_with_decoded_column() {
        for method in [CompressionMethod::None, CompressionMethod::Fast] {
            let cat = RowGroupCatalog::new(TableId(9), 100, method, 16);
            cat.insert_row_group(&group(0, 7)).unwrap();
            for col in 0..2 {
                let decoded = cat.read_column(0, col).unwrap();
                for row in 0..7 {
                    assert_eq!(cat.value_at(0, col, row).unwrap(), decoded.get(row));
                }
            }
            assert!(matches!(cat.value_at(0, 0, 7), Err(StorageError::TupleNotFound)));
        }
    }

    #[test]
    fn test_missing_column_entry_is_an_error() {
        let cat = catalog();
        cat.insert_row_group(&group(0, 1)).unwrap();
        assert!(matches!(
            cat.read_column(0, 5),
            Err(StorageError::CatalogEntryMissing { row_group_id: 0, column_index: 5 })
        ));
    }

    #[test]
    fn test_delete_bits_are_monotonic() {
        let cat = catalog();
        cat.insert_row_group(&group(1, 8)).unwrap();
        let g0 = cat.bitmap_generation();
        assert!(cat.update_delete_bit(1, 3).unwrap());
        assert!(!cat.update_delete_bit(1, 3).unwrap());
        assert!(cat.update_delete_bit(1, 6).unwrap());
        assert_eq!(cat.bitmap_generation(), g0 + 3);
        let bm = cat.read_delete_bitmap(1).unwrap().unwrap();
        assert_eq!(bm.iter_ones().collect::<Vec<_>>(), vec![3, 6]);
        assert_eq!(cat.deleted_count(1).unwrap(), 2);
        assert!(cat.update_delete_bit(1, 8).is_err());
        assert!(matches!(
            cat.update_delete_bit(2, 0),
            Err(StorageError::RowGroupNotFound(2))
        ));
    }

    #[test]
    fn test_sequence_exhaustion() {
        let cat = RowGroupCatalog::new(TableId(1), 1, CompressionMethod::None, 16);
        assert_eq!(cat.next_row_group_id().unwrap(), 0);
        assert_eq!(cat.next_row_group_id().unwrap(), 1);
        assert!(matches!(
            cat.next_row_group_id(),
            Err(StorageError::SequenceExhausted { max: 1, .. })
        ));
    }

    #[test]
    fn test_remove_bumps_storage_generation() {
        let cat = catalog();
        cat.insert_row_group(&group(0, 1)).unwrap();
        cat.insert_row_group(&group(1, 1)).unwrap();
        let g = cat.storage_generation();
        cat.remove_row_group(0).unwrap();
        assert_eq!(cat.storage_generation(), g + 1);
        assert_eq!(cat.row_group_ids(), vec![1]);
        assert_eq!(cat.max_row_group_id(), Some(1));
    }
}
