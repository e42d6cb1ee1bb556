//! Grouping over input already ordered on the grouping keys.
//!
//! Equal keys arrive adjacent, so a group is complete as soon as the key
//! changes. Only the group open at the end of a batch is carried over;
//! nothing is hashed and nothing spills.

use std::sync::Arc;

use strata_common::datum::{Datum, OwnedRow};
use strata_common::error::ExecutionError;
use strata_storage::batch::{Batch, RowIndex};

use crate::aggregate::initial_states;
use crate::compile::{compile_aggregates, FallbackReason, Program};
use crate::expr::AggregateCall;
use crate::grouping::{advance, GroupEntry, GroupingSpec};
use crate::interp::{ArgView, Interpreter, SubqueryRunner, TransitionSink};

struct SortedSink<'a> {
    groups: &'a mut [GroupEntry],
    runs: &'a [(usize, Vec<RowIndex>)],
    aggregates: &'a [AggregateCall],
}

impl TransitionSink for SortedSink<'_> {
    fn transition(
        &mut self,
        agg: usize,
        arg: Option<ArgView<'_, '_>>,
        _tolerate_missing: bool,
    ) -> Result<(), ExecutionError> {
        let call = &self.aggregates[agg];
        for (g, rows) in self.runs {
            advance(&mut self.groups[*g].states[agg], call, arg.as_ref(), rows)?;
        }
        Ok(())
    }
}

pub struct SortedGrouping {
    spec: GroupingSpec,
    program: Program,
    open: Option<GroupEntry>,
    done: Vec<OwnedRow>,
    saw_rows: bool,
    subqueries: Option<Arc<dyn SubqueryRunner>>,
}

impl SortedGrouping {
    /// Requires a single grouping set.
    pub fn new(spec: GroupingSpec) -> Result<Self, FallbackReason> {
        if spec.has_grouping_sets() {
            return Err(FallbackReason::SortedGroupingSets);
        }
        let program = compile_aggregates(&spec.aggregates, spec.has_grouping_sets())?;
        Ok(Self {
            spec,
            program,
            open: None,
            done: Vec::new(),
            saw_rows: false,
            subqueries: None,
        })
    }

    pub fn with_subqueries(mut self, runner: Arc<dyn SubqueryRunner>) -> Self {
        self.subqueries = Some(runner);
        self
    }

    fn key_columns(&self) -> &[usize] {
        self.spec.sets.first().map_or(&[], Vec::as_slice)
    }

    pub fn consume(&mut self, batch: &Batch<'_>) -> Result<(), ExecutionError> {
        let mut groups: Vec<GroupEntry> = self.open.take().into_iter().collect();
        let mut runs: Vec<(usize, Vec<RowIndex>)> = Vec::new();
        for r in 0..batch.dim() {
            if batch.is_skipped(r) {
                continue;
            }
            let row_index = RowIndex::try_from(r).map_err(|_| {
                ExecutionError::InvalidPlan(format!("batch row {} exceeds row index range", r))
            })?;
            let key: Vec<Datum> = self.key_columns().iter().map(|&c| batch.value(c, r)).collect();
            if groups.last().map_or(true, |g| g.key != key) {
                groups.push(GroupEntry::new(key, &self.spec.aggregates));
            }
            let g = groups.len() - 1;
            match runs.last_mut() {
                Some((last, rows)) if *last == g => rows.push(row_index),
                _ => runs.push((g, vec![row_index])),
            }
        }
        if runs.is_empty() {
            self.open = groups.pop();
            return Ok(());
        }
        self.saw_rows = true;

        let interp = match &self.subqueries {
            Some(r) => Interpreter::with_subqueries(r.as_ref()),
            None => Interpreter::new(),
        };
        let mut sink = SortedSink {
            groups: &mut groups,
            runs: &runs,
            aggregates: &self.spec.aggregates,
        };
        interp.execute(&self.program, batch, None, &mut sink)?;

        self.open = groups.pop();
        let set = self.key_columns().to_vec();
        for g in groups {
            self.done.push(self.spec.output_row(&set, &g.key, &g.states)?);
        }
        Ok(())
    }

    /// Rows of groups completed so far.
    pub fn take_completed(&mut self) -> Vec<OwnedRow> {
        std::mem::take(&mut self.done)
    }

    pub fn finish(&mut self) -> Result<Vec<OwnedRow>, ExecutionError> {
        let set = self.key_columns().to_vec();
        if let Some(g) = self.open.take() {
            self.done.push(self.spec.output_row(&set, &g.key, &g.states)?);
        } else if !self.saw_rows && set.is_empty() {
            let states = initial_states(&self.spec.aggregates);
            self.done.push(self.spec.output_row(&set, &[], &states)?);
        }
        Ok(self.take_completed())
    }
}
