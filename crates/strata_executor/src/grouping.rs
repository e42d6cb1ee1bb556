//! Vectorized hash grouping with grouping sets and hash-partitioned spill.
//!
//! Each grouping set owns one hash table. Per batch, every active row is
//! hashed over the set's key columns and looked up; rows that land on the
//! same entry are coalesced into one row-index run, so each aggregate
//! transition runs once per entry per batch. After the batch, resident
//! memory and the live group count are checked against the budget. Past
//! it, every table switches to spilling: known groups keep absorbing rows,
//! rows of unknown groups go to disk. At finish, spilled partitions are
//! re-grouped by a child engine one level deeper.
//!
//! Output rows are the union of all grouping columns (NULL where a column
//! is not in the row's set) followed by one value per aggregate.

use std::collections::HashMap;
use std::sync::Arc;

use strata_common::config::{ExecutorConfig, HashAggConfig, SpillConfig};
use strata_common::datum::{Datum, OwnedRow};
use strata_common::error::ExecutionError;
use strata_common::types::DataType;
use strata_storage::batch::{Batch, RowIndex};

use crate::aggregate::{initial_states, AggState};
use crate::compile::{compile_aggregates, FallbackReason, Program};
use crate::expr::AggregateCall;
use crate::hash_table::{Lookup, VectorHashTable};
use crate::hashing::hash_batch_keys;
use crate::interp::{ArgView, Interpreter, SubqueryRunner, TransitionSink};
use crate::operator::{BatchSource, RowBatchSource};
use crate::spill::{SpillPartitions, SpillRun};

/// Entry indexes must fit the bucket array's `u32` slots.
const HARD_GROUP_LIMIT: usize = (u32::MAX - 1) as usize;

#[derive(Debug, Clone, PartialEq)]
pub struct GroupingSpec {
    /// Union of all grouping columns, in output order.
    pub group_columns: Vec<usize>,
    /// Input column ordinals of each grouping set.
    pub sets: Vec<Vec<usize>>,
    pub aggregates: Vec<AggregateCall>,
}

impl GroupingSpec {
    /// Plain `GROUP BY columns`; empty `columns` is a global aggregate.
    pub fn group_by(columns: Vec<usize>, aggregates: Vec<AggregateCall>) -> Self {
        Self {
            group_columns: columns.clone(),
            sets: vec![columns],
            aggregates,
        }
    }

    pub fn grouping_sets(sets: Vec<Vec<usize>>, aggregates: Vec<AggregateCall>) -> Self {
        let mut group_columns = Vec::new();
        for c in sets.iter().flatten() {
            if !group_columns.contains(c) {
                group_columns.push(*c);
            }
        }
        Self {
            group_columns,
            sets,
            aggregates,
        }
    }

    pub fn has_grouping_sets(&self) -> bool {
        self.sets.len() > 1
    }

    pub fn output_width(&self) -> usize {
        self.group_columns.len() + self.aggregates.len()
    }

    fn single_set(&self, set: &[usize]) -> Self {
        Self {
            group_columns: self.group_columns.clone(),
            sets: vec![set.to_vec()],
            aggregates: self.aggregates.clone(),
        }
    }

    /// Build one output row for a group of `set`.
    pub(crate) fn output_row(
        &self,
        set: &[usize],
        key: &[Datum],
        states: &[AggState],
    ) -> Result<OwnedRow, ExecutionError> {
        let mut values = Vec::with_capacity(self.output_width());
        for c in &self.group_columns {
            values.push(
                set.iter()
                    .position(|k| k == c)
                    .map_or(Datum::Null, |p| key[p].clone()),
            );
        }
        for s in states {
            values.push(s.finalize()?);
        }
        Ok(OwnedRow::new(values))
    }
}

#[derive(Debug, Clone)]
pub struct GroupEntry {
    pub key: Vec<Datum>,
    pub states: Vec<AggState>,
}

impl GroupEntry {
    pub fn new(key: Vec<Datum>, aggregates: &[AggregateCall]) -> Self {
        Self {
            key,
            states: initial_states(aggregates),
        }
    }

    fn estimated_size(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.key.iter().map(Datum::estimated_size).sum::<usize>()
            + self.states.iter().map(AggState::estimated_size).sum::<usize>()
    }
}

/// Feed one aggregate state from the rows of one run.
pub(crate) fn advance(
    state: &mut AggState,
    call: &AggregateCall,
    arg: Option<&ArgView<'_, '_>>,
    rows: &[RowIndex],
) -> Result<(), ExecutionError> {
    match arg {
        None if call.func.is_count_like() => state.add_count(rows.len() as u64),
        None => {
            return Err(ExecutionError::InvalidPlan(format!(
                "{:?} without an argument",
                call.func
            )))
        }
        Some(a) if call.func.is_count_like() && !state.is_distinct() => {
            let n = rows.iter().filter(|&&r| !a.is_null(r as usize)).count();
            state.add_count(n as u64);
        }
        Some(a) => {
            for &r in rows {
                let r = r as usize;
                match a.var_len(r) {
                    Some(v) => state.update_var_len(v)?,
                    None => state.update(&a.get(r))?,
                }
            }
        }
    }
    Ok(())
}

/// Counters for one grouping run, children included.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GroupingStats {
    pub batches: u64,
    pub rows: u64,
    pub groups: u64,
    pub spilled_rows: u64,
    pub spill_bytes: u64,
    pub partitions_drained: u64,
    pub max_depth: u32,
}

impl GroupingStats {
    fn absorb(&mut self, child: &GroupingStats) {
        self.batches += child.batches;
        self.rows += child.rows;
        self.groups += child.groups;
        self.spilled_rows += child.spilled_rows;
        self.spill_bytes += child.spill_bytes;
        self.partitions_drained += child.partitions_drained;
        self.max_depth = self.max_depth.max(child.max_depth);
    }
}

struct SetState {
    key_columns: Vec<usize>,
    table: VectorHashTable<GroupEntry>,
    /// Group metadata bytes: keys plus aggregate states.
    group_bytes: usize,
    spill: Option<SpillPartitions>,
    /// (entry, rows) hitting each entry in the current batch.
    runs: Vec<(usize, Vec<RowIndex>)>,
    /// Active rows of the current batch that found no entry.
    missing: usize,
}

impl SetState {
    fn new(key_columns: Vec<usize>, config: &HashAggConfig) -> Self {
        Self {
            key_columns,
            table: VectorHashTable::new(config.initial_buckets, config.fill_factor)
                .with_max_entries(HARD_GROUP_LIMIT),
            group_bytes: 0,
            spill: None,
            runs: Vec::new(),
            missing: 0,
        }
    }

    fn resident_bytes(&self) -> usize {
        self.table.overhead_bytes() + self.group_bytes
    }

    fn look_up(
        &mut self,
        batch: &Batch<'_>,
        hashes: &mut Vec<u32>,
        aggregates: &[AggregateCall],
        spill_config: &SpillConfig,
        depth: u32,
        stats: &mut GroupingStats,
    ) -> Result<(), ExecutionError> {
        hash_batch_keys(batch, &self.key_columns, hashes);
        self.runs.clear();
        self.missing = 0;
        let mut run_of: HashMap<usize, usize> = HashMap::new();
        for r in 0..batch.dim() {
            if batch.is_skipped(r) {
                continue;
            }
            let row_index = RowIndex::try_from(r).map_err(|_| {
                ExecutionError::InvalidPlan(format!("batch row {} exceeds row index range", r))
            })?;
            let key: Vec<Datum> = self.key_columns.iter().map(|&c| batch.value(c, r)).collect();
            let hash = hashes[r];
            let found = self.table.find_or_insert(
                hash,
                |e| e.key == key,
                || GroupEntry::new(key.clone(), aggregates),
            )?;
            let idx = match found {
                Lookup::Found(idx) => idx,
                Lookup::Inserted(idx) => {
                    self.group_bytes += self.table.entry(idx).estimated_size();
                    idx
                }
                Lookup::Missed => {
                    let spill = match self.spill.as_mut() {
                        Some(s) => s,
                        None => self.spill.insert(SpillPartitions::create(spill_config, depth)?),
                    };
                    spill.write(hash, &batch.row(r))?;
                    self.missing += 1;
                    stats.spilled_rows += 1;
                    continue;
                }
            };
            let runs = &mut self.runs;
            let slot = *run_of.entry(idx).or_insert_with(|| {
                runs.push((idx, Vec::new()));
                runs.len() - 1
            });
            self.runs[slot].1.push(row_index);
        }
        Ok(())
    }
}

struct HashSink<'a> {
    sets: &'a mut [SetState],
    aggregates: &'a [AggregateCall],
}

impl TransitionSink for HashSink<'_> {
    fn transition(
        &mut self,
        agg: usize,
        arg: Option<ArgView<'_, '_>>,
        tolerate_missing: bool,
    ) -> Result<(), ExecutionError> {
        let call = &self.aggregates[agg];
        for set in self.sets.iter_mut() {
            if set.missing > 0 && !tolerate_missing {
                return Err(ExecutionError::Internal(format!(
                    "{} rows without a group outside spill mode",
                    set.missing
                )));
            }
            for (idx, rows) in &set.runs {
                let state = &mut set.table.entry_mut(*idx).states[agg];
                advance(state, call, arg.as_ref(), rows)?;
            }
        }
        Ok(())
    }
}

pub struct HashGrouping {
    spec: GroupingSpec,
    agg_config: HashAggConfig,
    spill_config: SpillConfig,
    batch_size: usize,
    depth: u32,
    program: Program,
    spilling: bool,
    sets: Vec<SetState>,
    input_types: Option<Vec<Option<DataType>>>,
    subqueries: Option<Arc<dyn SubqueryRunner>>,
    hashes: Vec<u32>,
    stats: GroupingStats,
}

impl HashGrouping {
    pub fn new(spec: GroupingSpec, config: &ExecutorConfig) -> Result<Self, FallbackReason> {
        Self::at_depth(spec, config.hash_agg.clone(), config.spill.clone(), config.batch_size, 0)
    }

    fn at_depth(
        mut spec: GroupingSpec,
        agg_config: HashAggConfig,
        spill_config: SpillConfig,
        batch_size: usize,
        depth: u32,
    ) -> Result<Self, FallbackReason> {
        if spec.sets.is_empty() {
            spec.sets.push(spec.group_columns.clone());
        }
        let program = compile_aggregates(&spec.aggregates, spec.has_grouping_sets())?;
        let sets = spec
            .sets
            .iter()
            .map(|s| SetState::new(s.clone(), &agg_config))
            .collect();
        Ok(Self {
            spec,
            agg_config,
            spill_config,
            batch_size,
            depth,
            program,
            spilling: false,
            sets,
            input_types: None,
            subqueries: None,
            hashes: Vec::new(),
            stats: GroupingStats {
                max_depth: depth,
                ..GroupingStats::default()
            },
        })
    }

    pub fn with_subqueries(mut self, runner: Arc<dyn SubqueryRunner>) -> Self {
        self.subqueries = Some(runner);
        self
    }

    pub fn spec(&self) -> &GroupingSpec {
        &self.spec
    }

    pub fn is_spilling(&self) -> bool {
        self.spilling
    }

    pub fn stats(&self) -> GroupingStats {
        self.stats
    }

    pub fn group_count(&self) -> usize {
        self.sets.iter().map(|s| s.table.len()).sum()
    }

    pub fn consume(&mut self, batch: &Batch<'_>) -> Result<(), ExecutionError> {
        if self.input_types.is_none() {
            self.input_types = Some(
                batch
                    .columns()
                    .iter()
                    .map(|c| c.as_ref().map(|c| c.data_type()))
                    .collect(),
            );
        }
        let active = batch.active_count();
        if active == 0 {
            return Ok(());
        }
        self.stats.batches += 1;
        self.stats.rows += active as u64;

        for set in self.sets.iter_mut() {
            set.look_up(
                batch,
                &mut self.hashes,
                &self.spec.aggregates,
                &self.spill_config,
                self.depth,
                &mut self.stats,
            )?;
        }

        let interp = match &self.subqueries {
            Some(r) => Interpreter::with_subqueries(r.as_ref()),
            None => Interpreter::new(),
        };
        let mut sink = HashSink {
            sets: &mut self.sets,
            aggregates: &self.spec.aggregates,
        };
        interp.execute(&self.program, batch, None, &mut sink)?;
        self.account();
        Ok(())
    }

    fn account(&mut self) {
        if self.spilling || self.depth >= self.spill_config.max_depth {
            return;
        }
        let groups = self.group_count();
        let bytes: usize = self.sets.iter().map(SetState::resident_bytes).sum();
        let budget = self.agg_config.memory_budget_bytes;
        let over_budget = budget > 0 && bytes as u64 > budget;
        let over_groups = self.agg_config.max_groups > 0 && groups > self.agg_config.max_groups;
        if over_budget || over_groups {
            tracing::info!(
                "hash grouping switching to spill at depth {}: {} groups, {} bytes resident",
                self.depth,
                groups,
                bytes
            );
            for set in self.sets.iter_mut() {
                set.table.start_spilling();
            }
            self.spilling = true;
            self.program = self.program.tolerating_missing_groups();
        }
    }

    /// Emit every group, then re-group spilled rows. Leaves the engine
    /// empty; `stats()` stays readable.
    pub fn finish(&mut self) -> Result<Vec<OwnedRow>, ExecutionError> {
        let mut out = Vec::new();
        for mut set in std::mem::take(&mut self.sets) {
            let entries = set.table.drain();
            self.stats.groups += entries.len() as u64;
            let spilled = set.spill.take();
            if entries.is_empty()
                && spilled.is_none()
                && set.key_columns.is_empty()
                && self.depth == 0
            {
                let states = initial_states(&self.spec.aggregates);
                out.push(self.spec.output_row(&[], &[], &states)?);
            }
            for e in entries {
                out.push(self.spec.output_row(&set.key_columns, &e.key, &e.states)?);
            }
            if let Some(spill) = spilled {
                self.stats.spill_bytes += spill.bytes_written();
                let run = spill.finish()?;
                out.extend(self.drain_spill(&set.key_columns, run)?);
            }
        }
        tracing::debug!(
            "hash grouping depth {} finished: {} groups from {} rows, {} rows spilled",
            self.depth,
            self.stats.groups,
            self.stats.rows,
            self.stats.spilled_rows
        );
        Ok(out)
    }

    fn drain_spill(&mut self, key_columns: &[usize], run: SpillRun) -> Result<Vec<OwnedRow>, ExecutionError> {
        let types = self.input_types.clone().unwrap_or_default();
        let mut out = Vec::new();
        for part in &run.partitions {
            let mut child = Self::at_depth(
                self.spec.single_set(key_columns),
                self.agg_config.clone(),
                self.spill_config.clone(),
                self.batch_size,
                self.depth + 1,
            )
            .map_err(|r| ExecutionError::InvalidPlan(r.to_string()))?;
            child.subqueries = self.subqueries.clone();
            let mut source = RowBatchSource::from_partition(types.clone(), part.reader()?, self.batch_size);
            while let Some(batch) = source.next_batch()? {
                child.consume(&batch)?;
            }
            out.extend(child.finish()?);
            self.stats.absorb(&child.stats());
            self.stats.partitions_drained += 1;
        }
        Ok(out)
    }
}
