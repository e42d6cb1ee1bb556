//! Row groups: an ordered set of column vectors sharing one row count.

use std::sync::Arc;

use strata_common::datum::OwnedRow;
use strata_common::error::{EncodingError, StorageError};
use strata_common::schema::TableSchema;

use crate::bitmap::Bitmap;
use crate::column_vector::{ColumnVector, ZoneMap};

/// An immutable block of up to `capacity` rows, one vector per column.
///
/// Built transiently by merge, or assembled by a scan from decoded catalog
/// columns. Only the delete bitmap changes after the group is persisted.
#[derive(Debug, Clone)]
pub struct RowGroup {
    pub id: u64,
    dim: usize,
    columns: Vec<Arc<ColumnVector<'static>>>,
    delete_bitmap: Option<Bitmap>,
}

impl RowGroup {
    pub fn new(id: u64, columns: Vec<Arc<ColumnVector<'static>>>) -> Result<Self, StorageError> {
        let dim = columns.first().map_or(0, |c| c.len());
        if let Some(bad) = columns.iter().find(|c| c.len() != dim) {
            return Err(EncodingError::LengthOverflow {
                declared: bad.len(),
                available: dim,
            }
            .into());
        }
        Ok(Self {
            id,
            dim,
            columns,
            delete_bitmap: None,
        })
    }

    /// Transpose rows (already conformed to `schema`) into column vectors.
    pub fn from_rows(
        id: u64,
        schema: &TableSchema,
        rows: &[OwnedRow],
        capacity: usize,
    ) -> Result<Self, StorageError> {
        if rows.len() > capacity {
            return Err(EncodingError::TooManyRows {
                rows: rows.len(),
                capacity,
            }
            .into());
        }
        let mut columns: Vec<ColumnVector<'static>> = schema
            .columns
            .iter()
            .map(|c| ColumnVector::build(c.data_type, rows.len()))
            .collect();
        for row in rows {
            if row.len() != columns.len() {
                return Err(StorageError::ArityMismatch {
                    expected: columns.len(),
                    got: row.len(),
                });
            }
            for (col, value) in columns.iter_mut().zip(&row.values) {
                col.push(value)?;
            }
        }
        Ok(Self {
            id,
            dim: rows.len(),
            columns: columns.into_iter().map(Arc::new).collect(),
            delete_bitmap: None,
        })
    }

    pub fn with_delete_bitmap(mut self, bitmap: Option<Bitmap>) -> Self {
        self.delete_bitmap = bitmap;
        self
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn column(&self, idx: usize) -> Option<&Arc<ColumnVector<'static>>> {
        self.columns.get(idx)
    }

    pub fn columns(&self) -> &[Arc<ColumnVector<'static>>] {
        &self.columns
    }

    pub fn has_delete_bitmap(&self) -> bool {
        self.delete_bitmap.is_some()
    }

    pub fn delete_bitmap(&self) -> Option<&Bitmap> {
        self.delete_bitmap.as_ref()
    }

    pub fn is_deleted(&self, row: usize) -> bool {
        self.delete_bitmap.as_ref().is_some_and(|b| b.get(row))
    }

    pub fn live_rows(&self) -> usize {
        self.dim - self.delete_bitmap.as_ref().map_or(0, Bitmap::count_ones)
    }

    pub fn row(&self, offset: usize) -> OwnedRow {
        OwnedRow::new(self.columns.iter().map(|c| c.get(offset)).collect())
    }

    pub fn zone_maps(&self, prefix_len: usize) -> Vec<ZoneMap> {
        self.columns.iter().map(|c| c.zone_map(prefix_len)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_common::datum::Datum;
    use strata_common::schema::ColumnDef;
    use strata_common::types::{DataType, TableId};

    fn schema() -> TableSchema {
        TableSchema::new(
            TableId(1),
            "t",
            vec![
                ColumnDef::new("a", DataType::Int64),
                ColumnDef::new("b", DataType::Text),
            ],
        )
    }

    #[test]
    fn test_from_rows_transposes() {
        let rows: Vec<OwnedRow> = (0..3)
            .map(|i| OwnedRow::new(vec![Datum::Int64(i), Datum::Text(format!("r{}", i))]))
            .collect();
        let rg = RowGroup::from_rows(7, &schema(), &rows, 10).unwrap();
        assert_eq!(rg.dim(), 3);
        assert_eq!(rg.column(1).unwrap().get(2), Datum::Text("r2".into()));
        assert_eq!(rg.row(1), rows[1]);
        assert_eq!(rg.live_rows(), 3);
    }

    #[test]
    fn test_capacity_enforced() {
        let rows = vec![OwnedRow::new(vec![Datum::Int64(1), Datum::Null]); 3];
        assert!(matches!(
            RowGroup::from_rows(0, &schema(), &rows, 2),
            Err(StorageError::Encoding(EncodingError::TooManyRows { .. }))
        ));
    }

    #[test]
    fn test_delete_overlay() {
        let rows = vec![OwnedRow::new(vec![Datum::Int64(1), Datum::Null]); 4];
        let mut bm = Bitmap::with_len(4);
        bm.set(2);
        let rg = RowGroup::from_rows(0, &schema(), &rows, 4)
            .unwrap()
            .with_delete_bitmap(Some(bm));
        assert!(rg.is_deleted(2));
        assert!(!rg.is_deleted(3));
        assert_eq!(rg.live_rows(), 3);
    }
}
