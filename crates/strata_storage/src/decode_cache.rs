//! Per-session cache of decoded row-group columns.
//!
//! A [`ScanSession`] stands for one worker and keeps one [`DecodeCache`] per
//! table; every scan begun with the session reads through it, so a group
//! decoded by one scan is reused by the next. Batches borrow reference views
//! out of the cached buffers. A table's cache is dropped when its catalog's
//! storage generation moves, which happens when row groups are removed or
//! the table is truncated.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;

use strata_common::error::StorageError;
use strata_common::types::TableId;

use crate::bitmap::Bitmap;
use crate::catalog::RowGroupCatalog;
use crate::column_vector::ColumnVector;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecodeCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub invalidations: u64,
}

pub struct DecodeCache {
    columns: LruCache<(u64, usize), Arc<ColumnVector<'static>>>,
    /// row group -> (bitmap generation it was read at, bitmap)
    bitmaps: HashMap<u64, (u64, Option<Arc<Bitmap>>)>,
    generation: Option<u64>,
    stats: DecodeCacheStats,
}

impl DecodeCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            columns: LruCache::new(NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN)),
            bitmaps: HashMap::new(),
            generation: None,
            stats: DecodeCacheStats::default(),
        }
    }

    pub fn stats(&self) -> DecodeCacheStats {
        self.stats
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn clear(&mut self) {
        self.columns.clear();
        self.bitmaps.clear();
    }

    /// Drop everything if the catalog's stored row groups changed since the
    /// cache was filled.
    pub fn sync_generation(&mut self, catalog: &RowGroupCatalog) {
        let current = catalog.storage_generation();
        if self.generation != Some(current) {
            if self.generation.is_some() && !self.columns.is_empty() {
                tracing::debug!(
                    "decode cache invalidated for {}: generation {:?} -> {}, dropped {} columns",
                    catalog.table(),
                    self.generation,
                    current,
                    self.columns.len()
                );
                self.stats.invalidations += 1;
            }
            self.clear();
            self.generation = Some(current);
        }
    }

    pub fn column(
        &mut self,
        catalog: &RowGroupCatalog,
        row_group_id: u64,
        column: usize,
    ) -> Result<Arc<ColumnVector<'static>>, StorageError> {
        self.sync_generation(catalog);
        if let Some(v) = self.columns.get(&(row_group_id, column)) {
            self.stats.hits += 1;
            return Ok(Arc::clone(v));
        }
        self.stats.misses += 1;
        let decoded = Arc::new(catalog.read_column(row_group_id, column)?);
        self.columns.put((row_group_id, column), Arc::clone(&decoded));
        Ok(decoded)
    }

    /// Latest delete bitmap of a group. Re-read whenever any bitmap of the
    /// table was written since it was cached.
    pub fn delete_bitmap(
        &mut self,
        catalog: &RowGroupCatalog,
        row_group_id: u64,
    ) -> Result<Option<Arc<Bitmap>>, StorageError> {
        self.sync_generation(catalog);
        let current = catalog.bitmap_generation();
        if let Some((seen, bm)) = self.bitmaps.get(&row_group_id) {
            if *seen == current {
                return Ok(bm.clone());
            }
        }
        let bm = catalog.read_delete_bitmap(row_group_id)?.map(Arc::new);
        self.bitmaps.insert(row_group_id, (current, bm.clone()));
        Ok(bm)
    }
}

/// Decode caches of one worker, one per table id. Table ids must be unique
/// among the tables a session scans.
#[derive(Default)]
pub struct ScanSession {
    caches: Mutex<HashMap<TableId, DecodeCache>>,
}

impl ScanSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` against the cache of `table`, creating it with room for
    /// `capacity` columns on first use.
    pub(crate) fn with_cache<R>(
        &self,
        table: TableId,
        capacity: usize,
        f: impl FnOnce(&mut DecodeCache) -> R,
    ) -> R {
        let mut caches = self.caches.lock();
        let cache = caches
            .entry(table)
            .or_insert_with(|| DecodeCache::new(capacity));
        f(cache)
    }

    pub fn stats(&self, table: TableId) -> DecodeCacheStats {
        self.caches
            .lock()
            .get(&table)
            .map(DecodeCache::stats)
            .unwrap_or_default()
    }

    /// Decoded columns currently held for `table`.
    pub fn cached_columns(&self, table: TableId) -> usize {
        self.caches.lock().get(&table).map_or(0, DecodeCache::len)
    }

    pub fn forget(&self, table: TableId) {
        self.caches.lock().remove(&table);
    }
}
