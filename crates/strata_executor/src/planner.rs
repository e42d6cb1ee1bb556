//! Planner hooks: offer vectorized scan and aggregate paths with a cost,
//! or say why none exists.
//!
//! Costs are in abstract units comparable with each other only. A row
//! group whose zone maps rule out every scan key costs nothing; every
//! other group pays a fixed decode cost plus a per-value cost for each
//! materialized column.

use strata_common::config::ExecutorConfig;
use strata_common::datum::Datum;
use strata_storage::delta::DeltaHeap;
use strata_storage::pruner::{row_group_may_match, Operand, ScanKey, Strategy};
use strata_storage::table::ColumnarTable;

use crate::compile::{compile_aggregates, CompiledQual, FallbackReason};
use crate::expr::{BinOp, Expr};
use crate::grouping::GroupingSpec;

pub const ROW_GROUP_DECODE_COST: f64 = 1.0;
pub const COLUMN_VALUE_COST: f64 = 0.000_5;
pub const DELTA_ROW_COST: f64 = 0.01;
pub const QUAL_ROW_COST: f64 = 0.002_5;
pub const HASH_ROW_COST: f64 = 0.005;
pub const SORTED_ROW_COST: f64 = 0.002;
pub const GROUP_OUTPUT_COST: f64 = 0.01;
pub const SPILL_ROW_COST: f64 = 0.02;

const EQ_SELECTIVITY: f64 = 0.005;
const RANGE_SELECTIVITY: f64 = 1.0 / 3.0;
const QUAL_SELECTIVITY: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathStrategy {
    ColumnarScan,
    HashAggregate,
    SortedAggregate,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PathCandidate {
    pub strategy: PathStrategy,
    pub startup_cost: f64,
    pub total_cost: f64,
    pub rows: f64,
}

/// A vectorized scan path with what it needs to run.
#[derive(Debug, Clone)]
pub struct ScanPath {
    pub candidate: PathCandidate,
    pub scan_keys: Vec<ScanKey>,
    pub qual: CompiledQual,
    pub row_groups_pruned: usize,
}

fn strategy_of(op: BinOp) -> Option<Strategy> {
    match op {
        BinOp::Lt => Some(Strategy::Lt),
        BinOp::Le => Some(Strategy::Le),
        BinOp::Eq => Some(Strategy::Eq),
        BinOp::Ge => Some(Strategy::Ge),
        BinOp::Gt => Some(Strategy::Gt),
        _ => None,
    }
}

fn operand(e: &Expr) -> Option<Operand> {
    match e {
        Expr::Column(c) => Some(Operand::Column(*c)),
        Expr::Literal(d) => Some(Operand::Literal(d.clone())),
        _ => None,
    }
}

/// Scan keys from the top-level conjuncts of `quals` that compare one
/// column with one non-NULL literal.
pub fn extract_scan_keys(quals: &[Expr]) -> Vec<ScanKey> {
    quals
        .iter()
        .cloned()
        .flat_map(Expr::conjuncts)
        .filter_map(|e| match e {
            Expr::Binary { op, left, right } => {
                ScanKey::normalize(operand(&left)?, strategy_of(op)?, operand(&right)?)
            }
            _ => None,
        })
        .collect()
}

fn key_selectivity(keys: &[ScanKey], other_conjuncts: usize) -> f64 {
    let keyed: f64 = keys
        .iter()
        .map(|k| match k.strategy {
            Strategy::Eq => EQ_SELECTIVITY,
            _ => RANGE_SELECTIVITY,
        })
        .product();
    keyed * QUAL_SELECTIVITY.powi(other_conjuncts as i32)
}

/// Cost a batch scan of `table` under `quals`, materializing `projection`
/// (all columns when `None`).
pub fn plan_vectorized_scan(
    table: &ColumnarTable,
    quals: &[Expr],
    projection: Option<&[usize]>,
) -> Result<ScanPath, FallbackReason> {
    let qual = CompiledQual::compile(quals)?;
    let scan_keys = extract_scan_keys(quals);
    let catalog = table.catalog();
    let columns = projection.map_or(table.schema().columns.len(), <[usize]>::len).max(1);

    let mut cost = 0.0;
    let mut startup = 0.0;
    let mut columnar_rows = 0.0;
    let mut pruned = 0;
    for id in catalog.row_group_ids() {
        // unreadable zone maps never prune
        if !row_group_may_match(&scan_keys, |c| catalog.zone_map(id, c).ok()) {
            pruned += 1;
            continue;
        }
        let stored = catalog.row_count(id).unwrap_or(0);
        let deleted = catalog.deleted_count(id).unwrap_or(0);
        let rows = stored.saturating_sub(deleted) as f64;
        if startup == 0.0 {
            startup = ROW_GROUP_DECODE_COST;
        }
        cost += ROW_GROUP_DECODE_COST + rows * columns as f64 * COLUMN_VALUE_COST;
        columnar_rows += rows;
    }
    let delta_rows = table.delta().live_tuples() as f64;
    let input_rows = columnar_rows + delta_rows;
    cost += delta_rows * DELTA_ROW_COST;
    cost += input_rows * qual.conjuncts().len() as f64 * QUAL_ROW_COST;

    let other = qual.conjuncts().len().saturating_sub(scan_keys.len());
    let rows = (input_rows * key_selectivity(&scan_keys, other)).max(if input_rows > 0.0 { 1.0 } else { 0.0 });
    tracing::debug!(
        "{}: vectorized scan path, {} row groups pruned, cost {:.2}",
        table.schema().name,
        pruned,
        cost
    );
    Ok(ScanPath {
        candidate: PathCandidate {
            strategy: PathStrategy::ColumnarScan,
            startup_cost: startup,
            total_cost: cost.max(startup),
            rows,
        },
        scan_keys,
        qual,
        row_groups_pruned: pruned,
    })
}

/// Cost grouping on top of `input`. Sorted grouping is offered when the
/// input is ordered on the grouping keys and there is a single set.
pub fn plan_vectorized_agg(
    input: &PathCandidate,
    spec: &GroupingSpec,
    input_sorted: bool,
    config: &ExecutorConfig,
) -> Result<PathCandidate, FallbackReason> {
    compile_aggregates(&spec.aggregates, spec.has_grouping_sets())?;
    let sets = spec.sets.len().max(1) as f64;
    let per_set_groups = if spec.group_columns.is_empty() {
        1.0
    } else {
        (input.rows / 10.0).clamp(1.0, input.rows.max(1.0))
    };
    let groups = per_set_groups * sets;
    let aggs = spec.aggregates.len().max(1) as f64;

    if input_sorted && !spec.has_grouping_sets() {
        let run = input.rows * SORTED_ROW_COST * aggs;
        return Ok(PathCandidate {
            strategy: PathStrategy::SortedAggregate,
            startup_cost: input.startup_cost,
            total_cost: input.total_cost + run + groups * GROUP_OUTPUT_COST,
            rows: groups,
        });
    }

    let mut build = input.total_cost + input.rows * sets * HASH_ROW_COST * aggs;
    let per_group_bytes = 64.0 + 32.0 * (spec.group_columns.len() as f64 + aggs);
    let budget = config.hash_agg.memory_budget_bytes as f64;
    let over_groups =
        config.hash_agg.max_groups > 0 && per_set_groups > config.hash_agg.max_groups as f64;
    if (budget > 0.0 && groups * per_group_bytes > budget) || over_groups {
        build += input.rows * sets * SPILL_ROW_COST;
    }
    Ok(PathCandidate {
        strategy: PathStrategy::HashAggregate,
        startup_cost: build,
        total_cost: build + groups * GROUP_OUTPUT_COST,
        rows: groups,
    })
}

/// Literal helper for building `column <op> value` quals.
pub fn compare(column: usize, op: BinOp, value: Datum) -> Expr {
    Expr::binary(op, Expr::col(column), Expr::lit(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{AggFunc, AggregateCall};

    #[test]
    fn test_scan_keys_from_conjuncts() {
        let quals = vec![Expr::And(vec![
            compare(0, BinOp::Gt, Datum::Int64(100)),
            Expr::binary(BinOp::Le, Expr::lit(Datum::Int64(7)), Expr::col(2)),
            compare(1, BinOp::NotEq, Datum::Int64(1)),
            compare(1, BinOp::Eq, Datum::Null),
            Expr::Or(vec![compare(3, BinOp::Eq, Datum::Int64(1))]),
        ])];
        let keys = extract_scan_keys(&quals);
        assert_eq!(
            keys,
            vec![
                ScanKey::new(0, Strategy::Gt, Datum::Int64(100)),
                ScanKey::new(2, Strategy::Ge, Datum::Int64(7)),
            ]
        );
    }

    #[test]
    fn test_agg_paths() {
        let input = PathCandidate {
            strategy: PathStrategy::ColumnarScan,
            startup_cost: 1.0,
            total_cost: 100.0,
            rows: 10_000.0,
        };
        let config = ExecutorConfig::default();
        let spec = GroupingSpec::group_by(vec![0], vec![AggregateCall::count_star()]);
        let hash = plan_vectorized_agg(&input, &spec, false, &config).unwrap();
        let sorted = plan_vectorized_agg(&input, &spec, true, &config).unwrap();
        assert_eq!(hash.strategy, PathStrategy::HashAggregate);
        assert_eq!(sorted.strategy, PathStrategy::SortedAggregate);
        assert!(sorted.startup_cost < hash.startup_cost);

        let sets = GroupingSpec::grouping_sets(
            vec![vec![0], vec![]],
            vec![AggregateCall::new(AggFunc::Count, Expr::col(1)).distinct()],
        );
        assert_eq!(
            plan_vectorized_agg(&input, &sets, false, &config).unwrap_err(),
            FallbackReason::DistinctWithGroupingSets
        );
    }
}
