use thiserror::Error;

use crate::types::{DataType, TableId, TxnId};

/// Convenience alias for `Result<T, StrataError>`.
pub type StrataResult<T> = Result<T, StrataError>;

/// Error classification for escalation decisions.
///
/// - `UserError`: bad input, wrong type, constraint violation
/// - `Transient`: resource exhaustion or cancellation; MAY succeed later
/// - `InternalBug`: corrupt state or broken invariant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    UserError,
    Transient,
    InternalBug,
}

/// Top-level error type that all layer-specific errors convert into.
#[derive(Error, Debug)]
pub enum StrataError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<EncodingError> for StrataError {
    fn from(e: EncodingError) -> Self {
        StrataError::Storage(StorageError::Encoding(e))
    }
}

/// Wire-format errors raised while (de)serializing column payloads.
/// Always fatal to the current operation; data is never silently truncated.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodingError {
    #[error("serialized length {declared} exceeds available {available} bytes")]
    LengthOverflow { declared: usize, available: usize },

    #[error("unsupported width {width} for fixed-width type {data_type}")]
    UnsupportedWidth { data_type: DataType, width: usize },

    #[error("value of type {got:?} cannot be stored in a {expected} column")]
    TypeMismatch {
        expected: DataType,
        got: Option<DataType>,
    },

    #[error("invalid UTF-8 in text payload")]
    InvalidUtf8,

    #[error("{rows} rows exceed column capacity {capacity}")]
    TooManyRows { rows: usize, capacity: usize },

    #[error("payload truncated: expected {expected} more bytes")]
    Truncated { expected: usize },

    #[error("unknown encoding tag {0}")]
    UnknownTag(u8),
}

/// Storage layer errors.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Table not found: {0}")]
    TableNotFound(TableId),

    #[error("Table already exists: {0}")]
    TableAlreadyExists(String),

    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    #[error("Catalog entry missing for row group {row_group_id} column {column_index}")]
    CatalogEntryMissing { row_group_id: u64, column_index: i32 },

    #[error("Row group {0} already exists in the catalog")]
    DuplicateRowGroup(u64),

    #[error("Row group {0} not found")]
    RowGroupNotFound(u64),

    #[error("Row-group id sequence exhausted for {table} (max {max})")]
    SequenceExhausted { table: TableId, max: u64 },

    #[error("Row identifier {0:#x} out of range")]
    RowIdOutOfRange(u64),

    #[error("Delta region full: {rows} rows (limit {limit})")]
    DeltaFull { rows: u64, limit: u64 },

    #[error("Tuple not found")]
    TupleNotFound,

    #[error("Tuple updated or deleted concurrently by {0}")]
    TupleConcurrentlyModified(TxnId),

    #[error("Expected {expected} columns, got {got}")]
    ArityMismatch { expected: usize, got: usize },

    #[error("Null value in NOT NULL column {0}")]
    NullViolation(String),

    #[error("Type mismatch for column {column}: expected {expected}, got {got:?}")]
    TypeMismatch {
        column: String,
        expected: DataType,
        got: Option<DataType>,
    },

    #[error("Index {0} is inconsistent with table contents: {1}")]
    IndexInconsistent(String, String),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Scan cancelled")]
    Cancelled,
}

/// Execution engine errors.
#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("Division by zero")]
    DivisionByZero,

    #[error("Type error: {0}")]
    TypeError(String),

    #[error("Column index out of bounds: {0}")]
    ColumnOutOfBounds(usize),

    #[error("Hash table limit exceeded: {groups} groups (limit {limit})")]
    HashTableFull { groups: usize, limit: usize },

    #[error("Spill setup failed: {0}")]
    SpillSetup(String),

    #[error("Spill I/O error: {0}")]
    SpillIo(String),

    #[error("Invalid batch plan: {0}")]
    InvalidPlan(String),

    #[error("Sub-query error: {0}")]
    Subquery(String),

    #[error("Query cancelled")]
    Cancelled,

    #[error("Internal: {0}")]
    Internal(String),
}

/// Configuration load/validation errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid TOML: {0}")]
    Parse(String),

    #[error("Invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

// ── StrataError classification ──────────────────────────────────────────────

impl StrataError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StrataError::Storage(StorageError::TableNotFound(_))
            | StrataError::Storage(StorageError::TableAlreadyExists(_))
            | StrataError::Storage(StorageError::ArityMismatch { .. })
            | StrataError::Storage(StorageError::NullViolation(_))
            | StrataError::Storage(StorageError::TypeMismatch { .. })
            | StrataError::Storage(StorageError::TupleNotFound)
            | StrataError::Execution(ExecutionError::DivisionByZero)
            | StrataError::Execution(ExecutionError::TypeError(_))
            | StrataError::Config(_) => ErrorKind::UserError,

            StrataError::Storage(StorageError::SequenceExhausted { .. })
            | StrataError::Storage(StorageError::DeltaFull { .. })
            | StrataError::Storage(StorageError::TupleConcurrentlyModified(_))
            | StrataError::Storage(StorageError::Cancelled)
            | StrataError::Storage(StorageError::Io(_))
            | StrataError::Execution(ExecutionError::HashTableFull { .. })
            | StrataError::Execution(ExecutionError::SpillSetup(_))
            | StrataError::Execution(ExecutionError::SpillIo(_))
            | StrataError::Execution(ExecutionError::Cancelled) => ErrorKind::Transient,

            _ => ErrorKind::InternalBug,
        }
    }

    pub fn is_user_error(&self) -> bool {
        matches!(self.kind(), ErrorKind::UserError)
    }

    pub fn is_transient(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transient)
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        StrataError::Internal(msg.into())
    }
}

#[cfg(test)]
mod error_classification {
    use super::*;

    #[test]
    fn test_encoding_error_is_internal() {
        let e: StrataError = EncodingError::LengthOverflow {
            declared: 10,
            available: 4,
        }
        .into();
        assert_eq!(e.kind(), ErrorKind::InternalBug);
        assert!(e.to_string().contains("exceeds available"));
    }

    #[test]
    fn test_resource_exhaustion_is_transient() {
        let e = StrataError::Execution(ExecutionError::HashTableFull {
            groups: 10,
            limit: 5,
        });
        assert!(e.is_transient());
        let e = StrataError::Storage(StorageError::SequenceExhausted {
            table: TableId(3),
            max: 7,
        });
        assert!(e.is_transient());
    }

    #[test]
    fn test_missing_catalog_entry_is_internal_bug() {
        let e = StrataError::Storage(StorageError::CatalogEntryMissing {
            row_group_id: 1,
            column_index: 0,
        });
        assert_eq!(e.kind(), ErrorKind::InternalBug);
    }

    #[test]
    fn test_type_error_is_user_error() {
        let e = StrataError::Execution(ExecutionError::TypeError("text + int".into()));
        assert!(e.is_user_error());
    }
}
