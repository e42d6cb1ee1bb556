//! Batch-producing operators.
//!
//! A `BatchSource` lends out one batch at a time; the batch borrows the
//! source until the next call. Scans lend batches that view decoded
//! row-group buffers, so consumers that need rows past the next call copy
//! them out (`unbatch`, `Batch::into_owned`).

use std::sync::Arc;

use strata_common::config::ExecutorConfig;
use strata_common::datum::OwnedRow;
use strata_common::error::{ExecutionError, StorageError};
use strata_common::types::DataType;
use strata_storage::batch::Batch;
use strata_storage::row_id::RowId;
use strata_storage::scan::{HybridScan, ScanOptions, ScanStats};
use strata_storage::table::ColumnarTable;

use crate::compile::{CompiledQual, FallbackReason};
use crate::expr::Expr;
use crate::grouping::{GroupingSpec, GroupingStats, HashGrouping};
use crate::interp::{Interpreter, SubqueryRunner};
use crate::sorted::SortedGrouping;
use crate::spill::PartitionReader;

pub trait BatchSource {
    /// Next batch, or `None` once the source is drained.
    fn next_batch(&mut self) -> Result<Option<Batch<'_>>, ExecutionError>;
}

pub fn storage_error(e: StorageError) -> ExecutionError {
    match e {
        StorageError::Cancelled => ExecutionError::Cancelled,
        other => ExecutionError::Internal(other.to_string()),
    }
}

/// Column types taken from the first non-NULL value of each column.
pub fn infer_types(rows: &[OwnedRow]) -> Vec<Option<DataType>> {
    let width = rows.iter().map(OwnedRow::len).max().unwrap_or(0);
    (0..width)
        .map(|c| {
            rows.iter()
                .filter_map(|r| r.get(c))
                .find(|d| !d.is_null())
                .and_then(|d| d.data_type())
        })
        .collect()
}

/// Owned batch holding `rows`; a `None` type reads back as NULL.
pub fn batch_from_rows(
    types: &[Option<DataType>],
    rows: &[OwnedRow],
) -> Result<Batch<'static>, ExecutionError> {
    let mut batch = Batch::with_types(types, rows.len());
    for (i, row) in rows.iter().enumerate() {
        batch
            .push_row(RowId(i as u64), row)
            .map_err(|e| ExecutionError::TypeError(e.to_string()))?;
    }
    Ok(batch)
}

/// Non-skipped rows of a batch, at the row-at-a-time boundary.
pub fn unbatch(batch: &Batch<'_>) -> Vec<OwnedRow> {
    batch.to_rows().into_iter().map(|(_, r)| r).collect()
}

pub fn collect_rows(source: &mut dyn BatchSource) -> Result<Vec<OwnedRow>, ExecutionError> {
    let mut out = Vec::new();
    while let Some(batch) = source.next_batch()? {
        out.extend(unbatch(&batch));
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// RowBatchSource
// ---------------------------------------------------------------------------

enum Feed {
    Memory(std::vec::IntoIter<OwnedRow>),
    Partition(PartitionReader),
}

/// Batches cut from rows held in memory or read back from a spill file.
pub struct RowBatchSource {
    types: Vec<Option<DataType>>,
    feed: Feed,
    batch_size: usize,
}

impl RowBatchSource {
    pub fn from_rows(rows: Vec<OwnedRow>, batch_size: usize) -> Self {
        let types = infer_types(&rows);
        Self::with_types(types, rows, batch_size)
    }

    pub fn with_types(types: Vec<Option<DataType>>, rows: Vec<OwnedRow>, batch_size: usize) -> Self {
        Self {
            types,
            feed: Feed::Memory(rows.into_iter()),
            batch_size: batch_size.max(1),
        }
    }

    pub fn from_partition(types: Vec<Option<DataType>>, reader: PartitionReader, batch_size: usize) -> Self {
        Self {
            types,
            feed: Feed::Partition(reader),
            batch_size: batch_size.max(1),
        }
    }

    pub fn types(&self) -> &[Option<DataType>] {
        &self.types
    }
}

impl BatchSource for RowBatchSource {
    fn next_batch(&mut self) -> Result<Option<Batch<'_>>, ExecutionError> {
        let rows: Vec<OwnedRow> = match &mut self.feed {
            Feed::Memory(it) => it.by_ref().take(self.batch_size).collect(),
            Feed::Partition(reader) => reader.next_chunk(self.batch_size)?,
        };
        if rows.is_empty() {
            return Ok(None);
        }
        let mut batch = batch_from_rows(&self.types, &rows)?;
        batch.set_exhausted(rows.len() < self.batch_size);
        Ok(Some(batch))
    }
}

// ---------------------------------------------------------------------------
// BatchScanOperator
// ---------------------------------------------------------------------------

/// Hybrid scan plus a compiled filter. Batches keep their full width;
/// columns outside the projection are absent.
pub struct BatchScanOperator<'t> {
    scan: HybridScan<'t>,
    qual: CompiledQual,
    subqueries: Option<Arc<dyn SubqueryRunner>>,
    rows_filtered: u64,
}

impl<'t> BatchScanOperator<'t> {
    /// Columns the filter reads are added to the projection.
    pub fn new(
        table: &'t ColumnarTable,
        mut options: ScanOptions,
        quals: &[Expr],
    ) -> Result<Self, FallbackReason> {
        let qual = CompiledQual::compile(quals)?;
        if let Some(projection) = options.projection.as_mut() {
            let mut needed = Vec::new();
            for q in quals {
                q.referenced_columns(&mut needed);
            }
            for c in needed {
                if !projection.contains(&c) {
                    projection.push(c);
                }
            }
        }
        Ok(Self {
            scan: table.begin_scan(options),
            qual,
            subqueries: None,
            rows_filtered: 0,
        })
    }

    pub fn with_subqueries(mut self, runner: Arc<dyn SubqueryRunner>) -> Self {
        self.subqueries = Some(runner);
        self
    }

    pub fn scan_stats(&self) -> ScanStats {
        self.scan.stats()
    }

    /// Rows the compiled filter rejected (scan keys not included).
    pub fn rows_filtered(&self) -> u64 {
        self.rows_filtered
    }
}

impl BatchSource for BatchScanOperator<'_> {
    fn next_batch(&mut self) -> Result<Option<Batch<'_>>, ExecutionError> {
        let interp = match &self.subqueries {
            Some(r) => Interpreter::with_subqueries(r.as_ref()),
            None => Interpreter::new(),
        };
        let Some(mut batch) = self.scan.next_batch().map_err(storage_error)? else {
            return Ok(None);
        };
        if !self.qual.is_empty() {
            let before = batch.active_count();
            interp.apply_qual(&self.qual, &mut batch)?;
            self.rows_filtered += (before - batch.active_count()) as u64;
        }
        Ok(Some(batch))
    }
}

// ---------------------------------------------------------------------------
// VectorAggOperator
// ---------------------------------------------------------------------------

pub enum GroupingEngine {
    Hash(HashGrouping),
    Sorted(SortedGrouping),
}

impl GroupingEngine {
    fn consume(&mut self, batch: &Batch<'_>) -> Result<(), ExecutionError> {
        match self {
            GroupingEngine::Hash(g) => g.consume(batch),
            GroupingEngine::Sorted(g) => g.consume(batch),
        }
    }

    fn finish(&mut self) -> Result<Vec<OwnedRow>, ExecutionError> {
        match self {
            GroupingEngine::Hash(g) => g.finish(),
            GroupingEngine::Sorted(g) => g.finish(),
        }
    }
}

/// Drains its input into a grouping engine on the first call, then lends
/// the result rows in batches.
pub struct VectorAggOperator<S> {
    input: S,
    engine: GroupingEngine,
    batch_size: usize,
    output: Option<RowBatchSource>,
}

impl<S: BatchSource> VectorAggOperator<S> {
    pub fn hash(input: S, spec: GroupingSpec, config: &ExecutorConfig) -> Result<Self, FallbackReason> {
        Ok(Self {
            input,
            engine: GroupingEngine::Hash(HashGrouping::new(spec, config)?),
            batch_size: config.batch_size,
            output: None,
        })
    }

    pub fn sorted(input: S, spec: GroupingSpec, config: &ExecutorConfig) -> Result<Self, FallbackReason> {
        Ok(Self {
            input,
            engine: GroupingEngine::Sorted(SortedGrouping::new(spec)?),
            batch_size: config.batch_size,
            output: None,
        })
    }

    pub fn with_subqueries(mut self, runner: Arc<dyn SubqueryRunner>) -> Self {
        self.engine = match self.engine {
            GroupingEngine::Hash(g) => GroupingEngine::Hash(g.with_subqueries(runner)),
            GroupingEngine::Sorted(g) => GroupingEngine::Sorted(g.with_subqueries(runner)),
        };
        self
    }

    /// Hash-engine counters; `None` for sorted grouping.
    pub fn grouping_stats(&self) -> Option<GroupingStats> {
        match &self.engine {
            GroupingEngine::Hash(g) => Some(g.stats()),
            GroupingEngine::Sorted(_) => None,
        }
    }

    fn drain_input(&mut self) -> Result<Vec<OwnedRow>, ExecutionError> {
        while let Some(batch) = self.input.next_batch()? {
            self.engine.consume(&batch)?;
        }
        self.engine.finish()
    }
}

impl<S: BatchSource> BatchSource for VectorAggOperator<S> {
    fn next_batch(&mut self) -> Result<Option<Batch<'_>>, ExecutionError> {
        if self.output.is_none() {
            let rows = self.drain_input()?;
            self.output = Some(RowBatchSource::from_rows(rows, self.batch_size));
        }
        match self.output.as_mut() {
            Some(out) => out.next_batch(),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_common::datum::Datum;

    #[test]
    fn test_row_source_cuts_batches() {
        let rows: Vec<OwnedRow> = (0..10)
            .map(|i| OwnedRow::new(vec![Datum::Int32(i), Datum::Null]))
            .collect();
        let mut src = RowBatchSource::from_rows(rows.clone(), 4);
        assert_eq!(src.types(), &[Some(DataType::Int32), None]);
        let mut dims = Vec::new();
        let mut exhausted = Vec::new();
        while let Some(b) = src.next_batch().unwrap() {
            dims.push(b.dim());
            exhausted.push(b.is_exhausted());
        }
        assert_eq!(dims, vec![4, 4, 2]);
        assert_eq!(exhausted, vec![false, false, true]);
        let mut again = RowBatchSource::from_rows(rows.clone(), 3);
        assert_eq!(collect_rows(&mut again).unwrap(), rows);
    }

    #[test]
    fn test_unbatch_drops_skipped_rows() {
        let rows: Vec<OwnedRow> = (0..3).map(|i| OwnedRow::new(vec![Datum::Int64(i)])).collect();
        let mut b = batch_from_rows(&[Some(DataType::Int64)], &rows).unwrap();
        b.skip_mut()[0] = true;
        assert_eq!(unbatch(&b), rows[1..].to_vec());
    }

    #[test]
    fn test_storage_errors_map() {
        assert!(matches!(storage_error(StorageError::Cancelled), ExecutionError::Cancelled));
        assert!(matches!(
            storage_error(StorageError::TupleNotFound),
            ExecutionError::Internal(_)
        ));
    }
}
