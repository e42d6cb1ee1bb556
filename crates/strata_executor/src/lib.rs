//! Vectorized execution over columnar batches: expression compilation and
//! interpretation, hash and sorted grouping with spill, batch operators
//! and planner hooks.

pub mod aggregate;
pub mod compile;
pub mod expr;
pub mod grouping;
pub mod hash_table;
pub mod hashing;
pub mod interp;
pub mod operator;
pub mod planner;
pub mod sorted;
pub mod spill;


pub use compile::{CompiledQual, FallbackReason, Program};
pub use expr::{AggFunc, AggregateCall, BinOp, Expr, ScalarFunc};
pub use grouping::{GroupingSpec, GroupingStats, HashGrouping};
pub use interp::{Interpreter, SubqueryRunner};
pub use operator::{unbatch, BatchScanOperator, BatchSource, RowBatchSource, VectorAggOperator};
pub use planner::{plan_vectorized_agg, plan_vectorized_scan, PathCandidate, PathStrategy};
pub use sorted::SortedGrouping;
