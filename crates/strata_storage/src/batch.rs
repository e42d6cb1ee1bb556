//! The batch tuple container: up to `capacity` rows held column-wise.
//!
//! Columns filled straight from a row group are reference views into the
//! session's decoded buffers; columns filled from delta rows are owned and
//! grow one value at a time. `skip[i]` marks row `i` filtered out.
//!
//! Consumers that process a subset of rows (one aggregation group, say)
//! pass that subset explicitly as `Option<&[RowIndex]>` alongside the batch.

use strata_common::datum::{Datum, OwnedRow};
use strata_common::error::{EncodingError, StorageError};
use strata_common::types::DataType;

use crate::column_vector::ColumnVector;
use crate::row_id::RowId;

/// Index of a row inside one batch.
pub type RowIndex = u16;

#[derive(Debug, Clone)]
pub struct Batch<'a> {
    capacity: usize,
    dim: usize,
    skip: Vec<bool>,
    /// `None` for columns outside the projection.
    columns: Vec<Option<ColumnVector<'a>>>,
    row_ids: Vec<RowId>,
    exhausted: bool,
}

impl Batch<'static> {
    /// Empty batch with owned columns of the given types, for row-by-row fill.
    pub fn with_types(types: &[Option<DataType>], capacity: usize) -> Self {
        Self {
            capacity,
            dim: 0,
            skip: Vec::with_capacity(capacity),
            columns: types
                .iter()
                .map(|t| t.map(|t| ColumnVector::build(t, capacity)))
                .collect(),
            row_ids: Vec::with_capacity(capacity),
            exhausted: false,
        }
    }
}

impl<'a> Batch<'a> {
    /// Assemble a batch from already filled columns (all of `dim` rows).
    pub fn from_columns(
        columns: Vec<Option<ColumnVector<'a>>>,
        row_ids: Vec<RowId>,
        skip: Vec<bool>,
    ) -> Self {
        let dim = row_ids.len();
        debug_assert_eq!(skip.len(), dim);
        debug_assert!(columns.iter().flatten().all(|c| c.len() == dim));
        Self {
            capacity: dim,
            dim,
            skip,
            columns,
            row_ids,
            exhausted: false,
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.dim >= self.capacity
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn column(&self, idx: usize) -> Option<&ColumnVector<'a>> {
        self.columns.get(idx).and_then(Option::as_ref)
    }

    pub fn columns(&self) -> &[Option<ColumnVector<'a>>] {
        &self.columns
    }

    pub fn row_id(&self, row: usize) -> RowId {
        self.row_ids[row]
    }

    pub fn row_ids(&self) -> &[RowId] {
        &self.row_ids
    }

    pub fn skip(&self) -> &[bool] {
        &self.skip
    }

    pub fn skip_mut(&mut self) -> &mut [bool] {
        &mut self.skip
    }

    pub fn is_skipped(&self, row: usize) -> bool {
        self.skip[row]
    }

    pub fn active_count(&self) -> usize {
        self.skip.iter().filter(|s| !**s).count()
    }

    pub fn all_skipped(&self) -> bool {
        self.skip.iter().all(|s| *s)
    }

    /// Source ran dry while (or before) this batch was filled.
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    pub fn set_exhausted(&mut self, exhausted: bool) {
        self.exhausted = exhausted;
    }

    /// Rows that feed the current consumer: the redirect list when present,
    /// otherwise every row not skipped.
    pub fn active_rows<'r>(
        &'r self,
        redirect: Option<&'r [RowIndex]>,
    ) -> Box<dyn Iterator<Item = usize> + 'r> {
        match redirect {
            Some(rows) => Box::new(rows.iter().map(|&r| r as usize)),
            None => Box::new((0..self.dim).filter(move |&r| !self.skip[r])),
        }
    }

    pub fn value(&self, column: usize, row: usize) -> Datum {
        self.column(column).map_or(Datum::Null, |c| c.get(row))
    }

    /// Values of one row; columns outside the projection read as NULL.
    pub fn row(&self, row: usize) -> OwnedRow {
        OwnedRow::new((0..self.columns.len()).map(|c| self.value(c, row)).collect())
    }

    /// Non-skipped rows with their identifiers.
    pub fn to_rows(&self) -> Vec<(RowId, OwnedRow)> {
        (0..self.dim)
            .filter(|&r| !self.skip[r])
            .map(|r| (self.row_ids[r], self.row(r)))
            .collect()
    }

    /// Append one row to owned columns (the delta path). `row` holds every
    /// table column; only projected ones are kept.
    pub fn push_row(&mut self, row_id: RowId, row: &OwnedRow) -> Result<(), StorageError> {
        if self.is_full() {
            return Err(EncodingError::TooManyRows {
                rows: self.dim + 1,
                capacity: self.capacity,
            }
            .into());
        }
        // coerce every column first so a bad value leaves the batch untouched
        let mut coerced = Vec::with_capacity(self.columns.len());
        for (idx, col) in self.columns.iter().enumerate() {
            coerced.push(match col {
                Some(col) => Some(col.coerce(row.get(idx).unwrap_or(&Datum::Null))?),
                None => None,
            });
        }
        for (col, value) in self.columns.iter_mut().zip(coerced) {
            if let (Some(col), Some(value)) = (col, value) {
                col.push(&value)?;
            }
        }
        self.row_ids.push(row_id);
        self.skip.push(false);
        self.dim += 1;
        Ok(())
    }

    /// Empty the batch for the next fill, keeping column allocations.
    pub fn clear(&mut self) {
        for col in self.columns.iter_mut().flatten() {
            col.clear();
        }
        self.row_ids.clear();
        self.skip.clear();
        self.dim = 0;
        self.exhausted = false;
    }

    /// Copy every column into owned storage.
    pub fn into_owned(self) -> Batch<'static> {
        Batch {
            capacity: self.capacity,
            dim: self.dim,
            skip: self.skip,
            columns: self
                .columns
                .into_iter()
                .map(|c| c.map(ColumnVector::into_owned))
                .collect(),
            row_ids: self.row_ids,
            exhausted: self.exhausted,
        }
    }

    /// Dense owned copy holding only the rows not skipped.
    pub fn compact(&self) -> Batch<'static> {
        let keep: Vec<usize> = (0..self.dim).filter(|&r| !self.skip[r]).collect();
        Batch {
            capacity: keep.len(),
            dim: keep.len(),
            skip: vec![false; keep.len()],
            columns: self
                .columns
                .iter()
                .map(|c| c.as_ref().map(|c| c.gather(&keep)))
                .collect(),
            row_ids: keep.iter().map(|&r| self.row_ids[r]).collect(),
            exhausted: self.exhausted,
        }
    }
}
