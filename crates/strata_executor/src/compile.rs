//! Expression compiler: bound expression trees to linear step programs.
//!
//! A program is a flat list of steps over numbered registers. Each step
//! works on whole columns of the current batch, restricted to the rows of
//! the active mask. Masks form a stack: `PushMask` narrows a copy of the
//! top, `NarrowMask` narrows the top in place, `PopMask` restores. CASE
//! and the short-circuit of AND/OR are expressed with masks plus forward
//! jumps, so rows a branch never reaches are never evaluated by it.
//!
//! Shapes the interpreter does not handle are refused here, before any
//! batch is touched; the caller then falls back to row-at-a-time
//! evaluation.

use std::fmt;

use strata_common::datum::Datum;

use crate::expr::{AggFunc, AggregateCall, BinOp, Expr, ScalarFunc};

pub type Reg = usize;

/// How a condition register narrows the active mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaskMode {
    /// Keep rows where the condition is TRUE.
    IfTrue,
    /// Keep rows where the condition is FALSE or NULL.
    IfNotTrue,
    /// Keep rows where the condition is TRUE or NULL.
    IfNotFalse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Binary(BinOp),
    And,
    Or,
    Not,
    IsNull,
    IsNotNull,
    Func(ScalarFunc),
    Coalesce,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Const {
        dst: Reg,
        value: Datum,
    },
    Column {
        dst: Reg,
        column: usize,
    },
    Call {
        dst: Reg,
        op: Op,
        args: Vec<Reg>,
    },
    /// Uncorrelated sub-query, run once per program execution.
    Subquery {
        dst: Reg,
        id: usize,
    },
    PushMask {
        cond: Option<(Reg, MaskMode)>,
    },
    NarrowMask {
        cond: Reg,
        mode: MaskMode,
    },
    PopMask,
    JumpIfNoneActive {
        target: usize,
    },
    /// Copy `src` into `dst` for the active rows only.
    Assign {
        dst: Reg,
        src: Reg,
    },
    /// Feed aggregate `agg` with `arg` (none for `count(*)`).
    AggTransition {
        agg: usize,
        arg: Option<Reg>,
        /// Rows without a group are allowed (spill mode); otherwise such a
        /// row is an internal error.
        tolerate_missing: bool,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    steps: Vec<Step>,
    registers: usize,
    results: Vec<Reg>,
}

impl Program {
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn registers(&self) -> usize {
        self.registers
    }

    /// Registers holding the program's output values, in order.
    pub fn results(&self) -> &[Reg] {
        &self.results
    }

    /// Same program with every aggregate transition tolerating rows that
    /// have no group.
    pub fn tolerating_missing_groups(&self) -> Program {
        let mut p = self.clone();
        for step in p.steps.iter_mut() {
            if let Step::AggTransition {
                tolerate_missing, ..
            } = step
            {
                *tolerate_missing = true;
            }
        }
        p
    }
}

/// Why an expression or aggregate list has no batch plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FallbackReason {
    RowValuedExpression,
    NestedBoolean { depth: usize },
    MultiColumnDistinct,
    DistinctWithGroupingSets,
    MultiArgumentAggregate,
    SortedGroupingSets,
}

impl fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FallbackReason::RowValuedExpression => write!(f, "row-valued expression"),
            FallbackReason::NestedBoolean { depth } => {
                write!(f, "boolean expression nested {} levels deep", depth)
            }
            FallbackReason::MultiColumnDistinct => write!(f, "DISTINCT over several columns"),
            FallbackReason::DistinctWithGroupingSets => {
                write!(f, "DISTINCT aggregate with grouping sets")
            }
            FallbackReason::MultiArgumentAggregate => write!(f, "aggregate with several arguments"),
            FallbackReason::SortedGroupingSets => write!(f, "grouping sets over sorted input"),
        }
    }
}

/// Refuse shapes without a batch form: row constructors anywhere, and
/// AND/OR/NOT nested inside one another after flattening.
pub fn check_shape(expr: &Expr) -> Result<(), FallbackReason> {
    let depth = connective_depth(expr)?;
    if depth > 1 {
        return Err(FallbackReason::NestedBoolean { depth });
    }
    Ok(())
}

fn connective_depth(expr: &Expr) -> Result<usize, FallbackReason> {
    if matches!(expr, Expr::Row(_)) {
        return Err(FallbackReason::RowValuedExpression);
    }
    let mut below = 0;
    for child in expr.children() {
        below = below.max(connective_depth(child)?);
    }
    Ok(if expr.is_connective() { below + 1 } else { below })
}

pub fn check_aggregates(calls: &[AggregateCall], grouping_sets: bool) -> Result<(), FallbackReason> {
    for call in calls {
        if call.distinct && call.args.len() > 1 {
            return Err(FallbackReason::MultiColumnDistinct);
        }
        if call.distinct && grouping_sets {
            return Err(FallbackReason::DistinctWithGroupingSets);
        }
        if call.args.len() > 1 {
            return Err(FallbackReason::MultiArgumentAggregate);
        }
        for arg in &call.args {
            check_shape(&arg.clone().flatten())?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Compiler
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Compiler {
    steps: Vec<Step>,
    registers: usize,
}

impl Compiler {
    fn alloc(&mut self) -> Reg {
        self.registers += 1;
        self.registers - 1
    }

    fn emit(&mut self, step: Step) -> usize {
        self.steps.push(step);
        self.steps.len() - 1
    }

    fn here(&self) -> usize {
        self.steps.len()
    }

    fn patch_jump(&mut self, at: usize, target: usize) {
        if let Step::JumpIfNoneActive { target: t } = &mut self.steps[at] {
            *t = target;
        }
    }

    fn expr(&mut self, expr: &Expr) -> Reg {
        match expr {
            Expr::Literal(value) => {
                let dst = self.alloc();
                self.emit(Step::Const {
                    dst,
                    value: value.clone(),
                });
                dst
            }
            Expr::Column(column) => {
                let dst = self.alloc();
                self.emit(Step::Column {
                    dst,
                    column: *column,
                });
                dst
            }
            Expr::Binary { op, left, right } => {
                let l = self.expr(left);
                let r = self.expr(right);
                self.call(Op::Binary(*op), vec![l, r])
            }
            Expr::And(parts) => self.connective(Op::And, parts),
            Expr::Or(parts) => self.connective(Op::Or, parts),
            Expr::Not(inner) => {
                let a = self.expr(inner);
                self.call(Op::Not, vec![a])
            }
            Expr::IsNull(inner) => {
                let a = self.expr(inner);
                self.call(Op::IsNull, vec![a])
            }
            Expr::IsNotNull(inner) => {
                let a = self.expr(inner);
                self.call(Op::IsNotNull, vec![a])
            }
            Expr::Func { func, args } => {
                let regs = args.iter().map(|a| self.expr(a)).collect();
                self.call(Op::Func(*func), regs)
            }
            Expr::Coalesce(args) => {
                let regs = args.iter().map(|a| self.expr(a)).collect();
                self.call(Op::Coalesce, regs)
            }
            Expr::Case {
                conditions,
                results,
                else_result,
            } => self.case(conditions, results, else_result.as_deref()),
            Expr::Subquery(id) => {
                let dst = self.alloc();
                self.emit(Step::Subquery { dst, id: *id });
                dst
            }
            // refused by check_shape
            Expr::Row(_) => {
                let dst = self.alloc();
                self.emit(Step::Const {
                    dst,
                    value: Datum::Null,
                });
                dst
            }
        }
    }

    fn call(&mut self, op: Op, args: Vec<Reg>) -> Reg {
        let dst = self.alloc();
        self.emit(Step::Call { dst, op, args });
        dst
    }

    /// Later operands only see rows the earlier ones left undecided.
    fn connective(&mut self, op: Op, parts: &[Expr]) -> Reg {
        if parts.is_empty() {
            let dst = self.alloc();
            self.emit(Step::Const {
                dst,
                value: Datum::Boolean(op == Op::And),
            });
            return dst;
        }
        let mode = if op == Op::And {
            MaskMode::IfNotFalse
        } else {
            MaskMode::IfNotTrue
        };
        let mut regs = Vec::with_capacity(parts.len());
        for (i, part) in parts.iter().enumerate() {
            let r = self.expr(part);
            regs.push(r);
            if i + 1 < parts.len() {
                self.emit(Step::PushMask {
                    cond: Some((r, mode)),
                });
            }
        }
        for _ in 1..parts.len() {
            self.emit(Step::PopMask);
        }
        self.call(op, regs)
    }

    fn case(&mut self, conditions: &[Expr], results: &[Expr], else_result: Option<&Expr>) -> Reg {
        let dst = self.alloc();
        self.emit(Step::Const {
            dst,
            value: Datum::Null,
        });
        // top of stack: rows no branch has claimed yet
        self.emit(Step::PushMask { cond: None });
        let mut to_end = Vec::new();
        for (cond, result) in conditions.iter().zip(results) {
            let c = self.expr(cond);
            self.emit(Step::PushMask {
                cond: Some((c, MaskMode::IfTrue)),
            });
            let skip_branch = self.emit(Step::JumpIfNoneActive { target: 0 });
            let r = self.expr(result);
            self.emit(Step::Assign { dst, src: r });
            let after = self.emit(Step::PopMask);
            self.patch_jump(skip_branch, after);
            self.emit(Step::NarrowMask {
                cond: c,
                mode: MaskMode::IfNotTrue,
            });
            to_end.push(self.emit(Step::JumpIfNoneActive { target: 0 }));
        }
        if let Some(e) = else_result {
            let r = self.expr(e);
            self.emit(Step::Assign { dst, src: r });
        }
        let end = self.here();
        self.emit(Step::PopMask);
        for at in to_end {
            self.patch_jump(at, end);
        }
        dst
    }

    fn finish(self, results: Vec<Reg>) -> Program {
        Program {
            steps: self.steps,
            registers: self.registers,
            results,
        }
    }
}

/// Compile one scalar expression; its value is the single result register.
pub fn compile_expr(expr: &Expr) -> Result<Program, FallbackReason> {
    compile_projection(std::slice::from_ref(expr))
}

/// Compile several output expressions into one program.
pub fn compile_projection(exprs: &[Expr]) -> Result<Program, FallbackReason> {
    let flat: Vec<Expr> = exprs.iter().cloned().map(Expr::flatten).collect();
    for e in &flat {
        check_shape(e)?;
    }
    let mut c = Compiler::default();
    let results = flat.iter().map(|e| c.expr(e)).collect();
    Ok(c.finish(results))
}

/// Compile argument evaluation plus one transition step per aggregate.
pub fn compile_aggregates(
    calls: &[AggregateCall],
    grouping_sets: bool,
) -> Result<Program, FallbackReason> {
    check_aggregates(calls, grouping_sets)?;
    let mut c = Compiler::default();
    for (agg, call) in calls.iter().enumerate() {
        let arg = match (call.func, call.args.first()) {
            (AggFunc::CountStar, _) | (_, None) => None,
            (_, Some(e)) => Some(c.expr(&e.clone().flatten())),
        };
        c.emit(Step::AggTransition {
            agg,
            arg,
            tolerate_missing: false,
        });
    }
    Ok(c.finish(Vec::new()))
}

/// A filter compiled conjunct by conjunct; each conjunct narrows the
/// batch's skip bits before the next one runs.
#[derive(Debug, Clone, Default)]
pub struct CompiledQual {
    conjuncts: Vec<Program>,
}

impl CompiledQual {
    pub fn compile(quals: &[Expr]) -> Result<Self, FallbackReason> {
        let conjuncts = quals
            .iter()
            .cloned()
            .flat_map(Expr::conjuncts)
            .map(|e| compile_expr(&e))
            .collect::<Result<_, _>>()?;
        Ok(Self { conjuncts })
    }

    pub fn is_empty(&self) -> bool {
        self.conjuncts.is_empty()
    }

    pub fn conjuncts(&self) -> &[Program] {
        &self.conjuncts
    }
}
