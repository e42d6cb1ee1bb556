//! Hybrid table scan: row groups first, then the delta region.
//!
//! Row groups are visited in ascending id order for a forward scan and
//! descending for a backward one. Each group is checked against the scan
//! keys' zone maps before anything is decoded; surviving groups are decoded
//! column by column through the session's decode cache and handed out as
//! batches of reference views. Once the last group is done the scan flips,
//! once, to the delta region, whose visible rows are copied into owned
//! batches.
//!
//! A scan holds the table's shared lock for its whole lifetime, so a merge
//! never runs underneath it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLockReadGuard;

use strata_common::config::DEFAULT_BATCH_SIZE;
use strata_common::datum::OwnedRow;
use strata_common::error::StorageError;
use strata_common::types::DataType;

use crate::batch::{Batch, RowIndex};
use crate::bitmap::Bitmap;
use crate::column_vector::ColumnVector;
use crate::decode_cache::{DecodeCacheStats, ScanSession};
use crate::delta::{DeltaCursor, ScanDirection};
use crate::mvcc::Snapshot;
use crate::pruner::{self, ScanKey};
use crate::row_id::RowId;
use crate::table::ColumnarTable;

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Cooperative cancellation, polled between row groups and between delta rows.
pub trait InterruptCheck: Send + Sync {
    fn check(&self) -> Result<(), StorageError>;
}

/// Never interrupts.
#[derive(Debug, Default, Clone, Copy)]
pub struct Never;

impl InterruptCheck for Never {
    fn check(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

/// Interrupts once `cancel` has been called.
#[derive(Debug, Default)]
pub struct CancelFlag(AtomicBool);

impl CancelFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }
}

impl InterruptCheck for CancelFlag {
    fn check(&self) -> Result<(), StorageError> {
        if self.0.load(Ordering::Acquire) {
            Err(StorageError::Cancelled)
        } else {
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Parallel coordination
// ---------------------------------------------------------------------------

/// Shared state for workers scanning one table in parallel. Each row-group
/// id is handed to exactly one worker; the delta region goes to whichever
/// worker asks for it first.
#[derive(Debug)]
pub struct ParallelScanState {
    cursor: AtomicU64,
    max: Option<u64>,
    direction: ScanDirection,
    delta_claimed: AtomicBool,
}

impl ParallelScanState {
    pub fn new(max_row_group_id: Option<u64>, direction: ScanDirection) -> Self {
        let start = match direction {
            ScanDirection::Forward => 0,
            ScanDirection::Backward => max_row_group_id.map_or(0, |m| m + 1),
        };
        Self {
            cursor: AtomicU64::new(start),
            max: max_row_group_id,
            direction,
            delta_claimed: AtomicBool::new(false),
        }
    }

    pub fn for_table(table: &ColumnarTable, direction: ScanDirection) -> Self {
        Self::new(table.catalog().max_row_group_id(), direction)
    }

    /// Next unclaimed id, or `None` when every id has been handed out.
    pub fn claim_next(&self) -> Option<u64> {
        let max = self.max?;
        match self.direction {
            ScanDirection::Forward => {
                let id = self.cursor.fetch_add(1, Ordering::SeqCst);
                (id <= max).then_some(id)
            }
            ScanDirection::Backward => self
                .cursor
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| c.checked_sub(1))
                .ok()
                .map(|prev| prev - 1),
        }
    }

    pub fn claim_delta(&self) -> bool {
        !self.delta_claimed.swap(true, Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Options and statistics
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct ScanOptions {
    /// Columns to materialize; `None` means all.
    pub projection: Option<Vec<usize>>,
    pub scan_keys: Vec<ScanKey>,
    pub direction: ScanDirection,
    pub snapshot: Snapshot,
    /// Always within `1..=RowIndex::MAX`.
    batch_size: usize,
    pub parallel: Option<Arc<ParallelScanState>>,
    pub interrupt: Arc<dyn InterruptCheck>,
    /// Decode caches to read through; a scan without one gets its own.
    session: Option<Arc<ScanSession>>,
}

impl ScanOptions {
    pub fn new(snapshot: Snapshot) -> Self {
        Self {
            projection: None,
            scan_keys: Vec::new(),
            direction: ScanDirection::Forward,
            snapshot,
            batch_size: DEFAULT_BATCH_SIZE,
            parallel: None,
            interrupt: Arc::new(Never),
            session: None,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn with_projection(mut self, columns: Vec<usize>) -> Self {
        self.projection = Some(columns);
        self
    }

    pub fn with_keys(mut self, keys: Vec<ScanKey>) -> Self {
        self.scan_keys = keys;
        self
    }

    pub fn with_direction(mut self, direction: ScanDirection) -> Self {
        self.direction = direction;
        self
    }

    /// Rows per batch, clamped so every row stays addressable by a
    /// [`RowIndex`].
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.clamp(1, RowIndex::MAX as usize);
        self
    }

    pub fn with_session(mut self, session: Arc<ScanSession>) -> Self {
        self.session = Some(session);
        self
    }

    pub fn with_parallel(mut self, state: Arc<ParallelScanState>) -> Self {
        self.parallel = Some(state);
        self
    }

    pub fn with_interrupt(mut self, interrupt: Arc<dyn InterruptCheck>) -> Self {
        self.interrupt = interrupt;
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanStats {
    pub row_groups_read: u64,
    pub row_groups_pruned: u64,
    pub rows_skipped_by_key: u64,
    pub rows_deleted: u64,
    pub delta_rows_read: u64,
    pub batches: u64,
}

// ---------------------------------------------------------------------------
// Scan
// ---------------------------------------------------------------------------

struct CurrentGroup {
    id: u64,
    dim: usize,
    offset: usize,
    /// Decoded columns, indexed by table column; `None` when not needed.
    columns: Vec<Option<Arc<ColumnVector<'static>>>>,
    deleted: Option<Arc<Bitmap>>,
}

pub struct HybridScan<'t> {
    table: &'t ColumnarTable,
    _guard: RwLockReadGuard<'t, ()>,
    options: ScanOptions,
    /// Per table column: part of the projection.
    projected: Vec<bool>,
    /// Per table column: decoded for projection or scan keys.
    needed: Vec<bool>,
    session: Arc<ScanSession>,
    pending: VecDeque<u64>,
    current: Option<CurrentGroup>,
    scanning_delta: bool,
    delta_cursor: DeltaCursor,
    delta_done: bool,
    rows: VecDeque<(RowId, OwnedRow)>,
    stats: ScanStats,
}

impl<'t> HybridScan<'t> {
    pub(crate) fn new(table: &'t ColumnarTable, options: ScanOptions) -> Self {
        let guard = table.lock.read();
        let ncols = table.schema().num_columns();
        let mut projected = vec![options.projection.is_none(); ncols];
        for &c in options.projection.iter().flatten() {
            if c < ncols {
                projected[c] = true;
            }
        }
        let mut needed = projected.clone();
        for k in &options.scan_keys {
            if k.column < ncols {
                needed[k.column] = true;
            }
        }
        let pending: VecDeque<u64> = if options.parallel.is_some() {
            VecDeque::new()
        } else {
            let mut ids = table.catalog().row_group_ids();
            if options.direction == ScanDirection::Backward {
                ids.reverse();
            }
            ids.into()
        };
        Self {
            table,
            _guard: guard,
            projected,
            needed,
            session: options.session.clone().unwrap_or_default(),
            pending,
            current: None,
            scanning_delta: false,
            delta_cursor: DeltaCursor::new(options.direction),
            delta_done: false,
            rows: VecDeque::new(),
            stats: ScanStats::default(),
            options,
        }
    }

    /// Flips from `false` to `true` exactly once, after the last row group.
    pub fn is_scanning_delta(&self) -> bool {
        self.scanning_delta
    }

    pub fn stats(&self) -> ScanStats {
        self.stats
    }

    /// Decode-cache counters of the scan's session for this table.
    pub fn cache_stats(&self) -> DecodeCacheStats {
        self.session.stats(self.table.schema().id)
    }

    /// Column types of the batches this scan produces (`None` = not projected).
    pub fn output_types(&self) -> Vec<Option<DataType>> {
        self.table
            .schema()
            .columns
            .iter()
            .zip(&self.projected)
            .map(|(c, p)| p.then_some(c.data_type))
            .collect()
    }

    fn next_group_id(&mut self) -> Option<u64> {
        match &self.options.parallel {
            Some(p) => p.claim_next(),
            None => self.pending.pop_front(),
        }
    }

    /// Open the next row group that survives pruning. `false` when none left.
    fn open_next_group(&mut self) -> Result<bool, StorageError> {
        let catalog = self.table.catalog();
        while let Some(id) = self.next_group_id() {
            self.options.interrupt.check()?;
            // Ids handed out by the parallel cursor may have no group.
            if catalog.entry(id, 0).is_none() {
                continue;
            }
            let keys = &self.options.scan_keys;
            let mut zone_error = None;
            let keep = pruner::row_group_may_match(keys, |col| match catalog.zone_map(id, col) {
                Ok(z) => Some(z),
                Err(e) => {
                    zone_error.get_or_insert(e);
                    None
                }
            });
            if let Some(e) = zone_error {
                return Err(e);
            }
            if !keep {
                self.stats.row_groups_pruned += 1;
                tracing::trace!("{}: row group {} pruned", catalog.table(), id);
                continue;
            }
            let dim = catalog.row_count(id)?;
            let needed = &self.needed;
            let capacity = self.table.config().decode_cache_entries;
            let (columns, deleted) = self.session.with_cache(self.table.schema().id, capacity, |cache| {
                let mut columns = Vec::with_capacity(needed.len());
                for (col, needed) in needed.iter().enumerate() {
                    columns.push(if *needed {
                        Some(cache.column(catalog, id, col)?)
                    } else {
                        None
                    });
                }
                Ok::<_, StorageError>((columns, cache.delete_bitmap(catalog, id)?))
            })?;
            self.stats.row_groups_read += 1;
            self.current = Some(CurrentGroup {
                id,
                dim,
                offset: 0,
                columns,
                deleted,
            });
            return Ok(true);
        }
        Ok(false)
    }

    /// Next window of the current row groups with its skip bits.
    fn next_columnar_window(&mut self) -> Result<Option<(usize, usize, Vec<bool>)>, StorageError> {
        loop {
            self.options.interrupt.check()?;
            let exhausted = self.current.as_ref().map_or(true, |g| g.offset >= g.dim);
            if exhausted {
                self.current = None;
                if !self.open_next_group()? {
                    return Ok(None);
                }
            }
            let Some(group) = self.current.as_mut() else {
                return Ok(None);
            };
            let start = group.offset;
            let len = self.options.batch_size().min(group.dim - start);
            group.offset += len;

            let mut skip = vec![false; len];
            if let Some(bm) = &group.deleted {
                for (i, s) in skip.iter_mut().enumerate() {
                    if bm.get(start + i) {
                        *s = true;
                        self.stats.rows_deleted += 1;
                    }
                }
            }
            for key in &self.options.scan_keys {
                let Some(Some(col)) = group.columns.get(key.column) else {
                    continue;
                };
                for (i, s) in skip.iter_mut().enumerate() {
                    if !*s && !key.matches(&col.get(start + i)) {
                        *s = true;
                        self.stats.rows_skipped_by_key += 1;
                    }
                }
            }
            if skip.iter().all(|s| *s) {
                continue;
            }
            return Ok(Some((start, len, skip)));
        }
    }

    fn next_delta_batch(&mut self) -> Result<Option<Batch<'static>>, StorageError> {
        if self.delta_done {
            return Ok(None);
        }
        let types = self.output_types();
        let mut batch = Batch::with_types(&types, self.options.batch_size());
        let id_space = self.table.id_space();
        while !batch.is_full() {
            let want = self.options.batch_size() - batch.dim();
            let chunk = self.table.delta().read_chunk(&mut self.delta_cursor, want);
            if chunk.is_empty() && self.delta_cursor.is_exhausted() {
                self.delta_done = true;
                break;
            }
            for (ptr, tuple) in chunk {
                self.options.interrupt.check()?;
                if !self.options.snapshot.is_visible(&tuple.header) {
                    continue;
                }
                self.stats.delta_rows_read += 1;
                let matches = self.options.scan_keys.iter().all(|k| {
                    tuple.row.get(k.column).is_some_and(|v| k.matches(v))
                });
                if !matches {
                    self.stats.rows_skipped_by_key += 1;
                    continue;
                }
                batch.push_row(id_space.delta(ptr)?, &tuple.row)?;
            }
        }
        batch.set_exhausted(self.delta_done);
        if batch.dim() == 0 {
            return Ok(None);
        }
        Ok(Some(batch))
    }

    /// Next batch of rows, or `None` at end of scan. Columnar batches borrow
    /// the scan's decoded buffers, so the batch must be dropped before the
    /// next call.
    pub fn next_batch(&mut self) -> Result<Option<Batch<'_>>, StorageError> {
        if !self.scanning_delta {
            if let Some((start, len, skip)) = self.next_columnar_window()? {
                self.stats.batches += 1;
                let Some(group) = self.current.as_ref() else {
                    return Ok(None);
                };
                let id_space = self.table.id_space();
                let mut row_ids = Vec::with_capacity(len);
                for off in start..start + len {
                    row_ids.push(id_space.columnar(group.id, off as u32)?);
                }
                let columns = group
                    .columns
                    .iter()
                    .zip(&self.projected)
                    .map(|(c, p)| match (c, p) {
                        (Some(c), true) => Some(c.slice(start, len)),
                        _ => None,
                    })
                    .collect();
                return Ok(Some(Batch::from_columns(columns, row_ids, skip)));
            }
            self.scanning_delta = true;
            // Among parallel workers, the first to run out of row groups
            // takes the delta region.
            if let Some(p) = &self.options.parallel {
                self.delta_done = !p.claim_delta();
            }
            tracing::trace!("{}: scan switched to delta region", self.table.schema().name);
        }
        let batch = self.next_delta_batch()?;
        if batch.is_some() {
            self.stats.batches += 1;
        }
        Ok(batch)
    }

    /// Row-at-a-time interface over the same batches.
    pub fn next_row(&mut self) -> Result<Option<(RowId, OwnedRow)>, StorageError> {
        loop {
            if let Some(r) = self.rows.pop_front() {
                return Ok(Some(r));
            }
            let rows = match self.next_batch()? {
                Some(batch) => batch.to_rows(),
                None => return Ok(None),
            };
            self.rows.extend(rows);
        }
    }

    /// Drain the scan, counting visible rows.
    pub fn count(mut self) -> Result<u64, StorageError> {
        let mut n = 0u64;
        while let Some(batch) = self.next_batch()? {
            n += batch.active_count() as u64;
        }
        Ok(n)
    }
}
