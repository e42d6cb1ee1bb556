//! Columnar storage: row groups of encoded column vectors behind a
//! row-oriented delta region, with a delete-bitmap overlay, zone-map
//! pruning and a batch-producing hybrid scan.

pub mod batch;
pub mod bitmap;
pub mod catalog;
pub mod codec;
pub mod column_vector;
pub mod decode_cache;
pub mod delta;
pub mod engine;
pub mod index;
pub mod merge;
pub mod mvcc;
pub mod pruner;
pub mod row_group;
pub mod row_id;
pub mod scan;
pub mod table;


pub use batch::{Batch, RowIndex};
pub use column_vector::{ColumnVector, ZoneMap};
pub use decode_cache::ScanSession;
pub use engine::StorageEngine;
pub use merge::{MergeOutcome, MergeReport};
pub use row_id::RowId;
pub use scan::{HybridScan, ScanOptions, ScanStats};
pub use table::ColumnarTable;
