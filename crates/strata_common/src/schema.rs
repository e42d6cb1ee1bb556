use serde::{Deserialize, Serialize};

use crate::datum::{Datum, OwnedRow};
use crate::error::StorageError;
use crate::types::{DataType, TableId};

/// Column definition in a table schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub data_type: DataType,
    pub nullable: bool,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable: true,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }
}

/// Table schema metadata. Column ordinals are the catalog's column_index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    pub id: TableId,
    pub name: String,
    pub columns: Vec<ColumnDef>,
}

impl TableSchema {
    pub fn new(id: TableId, name: impl Into<String>, columns: Vec<ColumnDef>) -> Self {
        Self {
            id,
            name: name.into(),
            columns,
        }
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn data_type(&self, idx: usize) -> Option<DataType> {
        self.columns.get(idx).map(|c| c.data_type)
    }

    /// Coerce a row to this schema's physical types, enforcing NOT NULL.
    pub fn conform_row(&self, row: OwnedRow) -> Result<OwnedRow, StorageError> {
        if row.len() != self.columns.len() {
            return Err(StorageError::ArityMismatch {
                expected: self.columns.len(),
                got: row.len(),
            });
        }
        let mut values = Vec::with_capacity(row.len());
        for (col, value) in self.columns.iter().zip(row.values) {
            if value.is_null() && !col.nullable {
                return Err(StorageError::NullViolation(col.name.clone()));
            }
            let coerced: Datum =
                value
                    .coerce_to(col.data_type)
                    .ok_or_else(|| StorageError::TypeMismatch {
                        column: col.name.clone(),
                        expected: col.data_type,
                        got: value.data_type(),
                    })?;
            values.push(coerced);
        }
        Ok(OwnedRow::new(values))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> TableSchema {
        TableSchema::new(
            TableId(1),
            "t",
            vec![
                ColumnDef::new("id", DataType::Int64).not_null(),
                ColumnDef::new("name", DataType::Text),
            ],
        )
    }

    #[test]
    fn test_conform_row_widens_integers() {
        let row = schema()
            .conform_row(OwnedRow::new(vec![Datum::Int32(5), Datum::Null]))
            .unwrap();
        assert!(matches!(row.values[0], Datum::Int64(5)));
    }

    #[test]
    fn test_conform_row_rejects_null_in_not_null() {
        let err = schema()
            .conform_row(OwnedRow::new(vec![Datum::Null, Datum::Null]))
            .unwrap_err();
        assert!(matches!(err, StorageError::NullViolation(_)));
    }

    #[test]
    fn test_column_lookup_is_case_insensitive() {
        assert_eq!(schema().column_index("NAME"), Some(1));
        assert_eq!(schema().column_index("missing"), None);
    }
}
