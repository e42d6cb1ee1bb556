//! Batch interpreter for compiled step programs.
//!
//! Registers hold a constant, a reference to a batch column, a typed
//! column vector, or a materialized vector of `dim` datums. Only rows of
//! the active mask are computed; the rest of a result holds NULL.
//! Comparisons and arithmetic over fixed-width numeric operands read the
//! column slices directly and produce typed vectors. Everything else goes
//! through the datum path.

use std::cmp::Ordering;

use strata_common::datum::{float_cmp, Datum};
use strata_common::error::ExecutionError;
use strata_common::types::DataType;
use strata_storage::batch::{Batch, RowIndex};
use strata_storage::column_vector::{ColumnData, ColumnStorage, ColumnVector};

use crate::compile::{CompiledQual, MaskMode, Op, Program, Step};
use crate::expr::{BinOp, ScalarFunc};

/// Runs uncorrelated scalar sub-queries on behalf of the interpreter.
pub trait SubqueryRunner: Send + Sync {
    fn run(&self, id: usize) -> Result<Datum, ExecutionError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Scalar(Datum),
    Column(usize),
    Typed(ColumnVector<'static>),
    Vector(Vec<Datum>),
}

impl Value {
    pub fn at(&self, batch: &Batch<'_>, row: usize) -> Datum {
        match self {
            Value::Scalar(d) => d.clone(),
            Value::Column(c) => batch.value(*c, row),
            Value::Typed(v) => v.get(row),
            Value::Vector(v) => v[row].clone(),
        }
    }

    /// The column vector behind this value, if it has one.
    fn vector<'v>(&'v self, batch: &'v Batch<'_>) -> Option<&'v ColumnVector<'v>> {
        match self {
            Value::Column(c) => batch.column(*c),
            Value::Typed(v) => Some(v),
            Value::Scalar(_) | Value::Vector(_) => None,
        }
    }
}

/// A variable-length argument value read without copying it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarLenRef<'a> {
    Text(&'a str),
    Bytea(&'a [u8]),
}

impl VarLenRef<'_> {
    pub fn to_datum(self) -> Datum {
        match self {
            VarLenRef::Text(s) => Datum::Text(s.to_owned()),
            VarLenRef::Bytea(b) => Datum::Bytea(b.to_vec()),
        }
    }
}

/// An aggregate argument as seen by a transition.
pub struct ArgView<'v, 'b> {
    value: &'v Value,
    batch: &'v Batch<'b>,
}

impl<'v, 'b> ArgView<'v, 'b> {
    pub fn get(&self, row: usize) -> Datum {
        self.value.at(self.batch, row)
    }

    pub fn is_null(&self, row: usize) -> bool {
        match self.value {
            Value::Scalar(d) => d.is_null(),
            Value::Column(c) => self.batch.column(*c).map_or(true, |col| col.is_null(row)),
            Value::Typed(v) => v.is_null(row),
            Value::Vector(v) => v[row].is_null(),
        }
    }

    /// Text or bytes at `row`, borrowed. `None` for NULL and for every
    /// other type.
    pub fn var_len(&self, row: usize) -> Option<VarLenRef<'_>> {
        let datum = match self.value {
            Value::Scalar(d) => d,
            Value::Vector(v) => &v[row],
            Value::Column(_) | Value::Typed(_) => {
                let col = self.value.vector(self.batch)?;
                if col.is_null(row) {
                    return None;
                }
                return match col.data() {
                    ColumnData::Text(s) => Some(VarLenRef::Text(&s[row])),
                    ColumnData::Bytea(b) => Some(VarLenRef::Bytea(&b[row])),
                    _ => None,
                };
            }
        };
        match datum {
            Datum::Text(s) => Some(VarLenRef::Text(s)),
            Datum::Bytea(b) => Some(VarLenRef::Bytea(b)),
            _ => None,
        }
    }
}

/// Receives aggregate transition steps.
pub trait TransitionSink {
    fn transition(
        &mut self,
        agg: usize,
        arg: Option<ArgView<'_, '_>>,
        tolerate_missing: bool,
    ) -> Result<(), ExecutionError>;
}

/// Sink for programs that must not contain transitions.
pub struct NoTransitions;

impl TransitionSink for NoTransitions {
    fn transition(
        &mut self,
        agg: usize,
        _arg: Option<ArgView<'_, '_>>,
        _tolerate_missing: bool,
    ) -> Result<(), ExecutionError> {
        Err(ExecutionError::InvalidPlan(format!(
            "aggregate transition {} outside grouping",
            agg
        )))
    }
}

#[derive(Clone, Copy, Default)]
pub struct Interpreter<'s> {
    subqueries: Option<&'s dyn SubqueryRunner>,
}

impl<'s> Interpreter<'s> {
    pub fn new() -> Self {
        Self { subqueries: None }
    }

    pub fn with_subqueries(runner: &'s dyn SubqueryRunner) -> Self {
        Self {
            subqueries: Some(runner),
        }
    }

    /// Run `program` over `batch`. The base mask is `redirect` when given,
    /// otherwise every row not skipped. Returns the result registers.
    pub fn execute(
        &self,
        program: &Program,
        batch: &Batch<'_>,
        redirect: Option<&[RowIndex]>,
        sink: &mut dyn TransitionSink,
    ) -> Result<Vec<Value>, ExecutionError> {
        let dim = batch.dim();
        let base = match redirect {
            Some(rows) => {
                let mut m = vec![false; dim];
                for &r in rows {
                    m[r as usize] = true;
                }
                m
            }
            None => batch.skip().iter().map(|s| !s).collect(),
        };
        let mut regs = vec![Value::Scalar(Datum::Null); program.registers()];
        let mut masks = vec![base];
        let steps = program.steps();
        let mut pc = 0;
        while pc < steps.len() {
            let mask = masks.last().map(Vec::as_slice).unwrap_or(&[]);
            match &steps[pc] {
                Step::Const { dst, value } => regs[*dst] = Value::Scalar(value.clone()),
                Step::Column { dst, column } => {
                    if *column >= batch.num_columns() {
                        return Err(ExecutionError::ColumnOutOfBounds(*column));
                    }
                    regs[*dst] = Value::Column(*column);
                }
                Step::Call { dst, op, args } => {
                    let args: Vec<&Value> = args.iter().map(|a| &regs[*a]).collect();
                    let v = eval_call(*op, &args, batch, mask)?;
                    regs[*dst] = v;
                }
                Step::Subquery { dst, id } => {
                    let runner = self.subqueries.ok_or_else(|| {
                        ExecutionError::Subquery(format!("no runner for sub-query {}", id))
                    })?;
                    regs[*dst] = Value::Scalar(runner.run(*id)?);
                }
                Step::PushMask { cond } => {
                    let next = match cond {
                        None => mask.to_vec(),
                        Some((r, mode)) => narrow(mask, &regs[*r], *mode, batch)?,
                    };
                    masks.push(next);
                }
                Step::NarrowMask { cond, mode } => {
                    let next = narrow(mask, &regs[*cond], *mode, batch)?;
                    if let Some(top) = masks.last_mut() {
                        *top = next;
                    }
                }
                Step::PopMask => {
                    if masks.len() < 2 {
                        return Err(ExecutionError::InvalidPlan("mask stack underflow".into()));
                    }
                    masks.pop();
                }
                Step::JumpIfNoneActive { target } => {
                    if !mask.iter().any(|m| *m) {
                        pc = *target;
                        continue;
                    }
                }
                Step::Assign { dst, src } => {
                    let mut out = match std::mem::replace(&mut regs[*dst], Value::Scalar(Datum::Null)) {
                        Value::Vector(v) => v,
                        other => (0..dim).map(|r| other.at(batch, r)).collect(),
                    };
                    for (r, slot) in out.iter_mut().enumerate() {
                        if mask[r] {
                            *slot = regs[*src].at(batch, r);
                        }
                    }
                    regs[*dst] = Value::Vector(out);
                }
                Step::AggTransition {
                    agg,
                    arg,
                    tolerate_missing,
                } => {
                    let view = arg.map(|r| ArgView {
                        value: &regs[r],
                        batch,
                    });
                    sink.transition(*agg, view, *tolerate_missing)?;
                }
            }
            pc += 1;
        }
        Ok(program
            .results()
            .iter()
            .map(|r| std::mem::replace(&mut regs[*r], Value::Scalar(Datum::Null)))
            .collect())
    }

    /// Narrow the batch's skip bits by each conjunct in turn. Stops once
    /// every row is skipped.
    pub fn apply_qual(&self, qual: &CompiledQual, batch: &mut Batch<'_>) -> Result<(), ExecutionError> {
        for program in qual.conjuncts() {
            if batch.all_skipped() {
                break;
            }
            let values = self.execute(program, batch, None, &mut NoTransitions)?;
            let Some(value) = values.first() else {
                continue;
            };
            let mut reject = vec![false; batch.dim()];
            for (r, rej) in reject.iter_mut().enumerate() {
                if !batch.is_skipped(r) {
                    *rej = truth(value, batch, r)? != Some(true);
                }
            }
            for (s, rej) in batch.skip_mut().iter_mut().zip(reject) {
                *s |= rej;
            }
        }
        Ok(())
    }
}

/// Boolean reading of a value; anything but a boolean or NULL is an error.
pub(crate) fn truth(value: &Value, batch: &Batch<'_>, row: usize) -> Result<Option<bool>, ExecutionError> {
    if let Value::Typed(v) = value {
        if let ColumnData::Boolean(bits) = v.data() {
            return Ok((!v.is_null(row)).then(|| bits[row]));
        }
    }
    match value.at(batch, row) {
        Datum::Null => Ok(None),
        Datum::Boolean(b) => Ok(Some(b)),
        other => Err(ExecutionError::TypeError(format!(
            "expected boolean, got {:?}",
            other.data_type()
        ))),
    }
}

fn narrow(mask: &[bool], cond: &Value, mode: MaskMode, batch: &Batch<'_>) -> Result<Vec<bool>, ExecutionError> {
    let mut out = vec![false; mask.len()];
    for (r, o) in out.iter_mut().enumerate() {
        if mask[r] {
            let t = truth(cond, batch, r)?;
            *o = match mode {
                MaskMode::IfTrue => t == Some(true),
                MaskMode::IfNotTrue => t != Some(true),
                MaskMode::IfNotFalse => t != Some(false),
            };
        }
    }
    Ok(out)
}

fn eval_call(op: Op, args: &[&Value], batch: &Batch<'_>, mask: &[bool]) -> Result<Value, ExecutionError> {
    if !mask.iter().any(|m| *m) {
        return Ok(Value::Scalar(Datum::Null));
    }
    if args.iter().all(|a| matches!(a, Value::Scalar(_))) {
        let vals: Vec<Datum> = args.iter().map(|a| a.at(batch, 0)).collect();
        return scalar_op(op, &vals).map(Value::Scalar);
    }
    if let (Op::Binary(bin), [l, r]) = (op, args) {
        if let (Some(l), Some(r)) = (Operand::of(l, batch), Operand::of(r, batch)) {
            let typed = if bin.is_comparison() {
                Some(compare_numeric(bin, &l, &r, mask))
            } else {
                arith_numeric(bin, &l, &r, mask)
            };
            if let Some(v) = typed {
                return v.map(Value::Typed);
            }
        }
    }
    let mut out = vec![Datum::Null; mask.len()];
    let mut vals = Vec::with_capacity(args.len());
    for (r, slot) in out.iter_mut().enumerate() {
        if mask[r] {
            vals.clear();
            vals.extend(args.iter().map(|a| a.at(batch, r)));
            *slot = scalar_op(op, &vals)?;
        }
    }
    Ok(Value::Vector(out))
}

fn accepts(op: BinOp, ord: Ordering) -> bool {
    match op {
        BinOp::Eq => ord.is_eq(),
        BinOp::NotEq => ord.is_ne(),
        BinOp::Lt => ord.is_lt(),
        BinOp::Le => ord.is_le(),
        BinOp::Gt => ord.is_gt(),
        BinOp::Ge => ord.is_ge(),
        _ => false,
    }
}

/// Fixed-width numeric values of one operand.
#[derive(Clone, Copy)]
enum Numbers<'a> {
    Int16(&'a [i16]),
    Int32(&'a [i32]),
    Int64(&'a [i64]),
    Float64(&'a [f64]),
    ConstInt(i64),
    ConstFloat(f64),
}

/// An operand of the typed path: numbers plus the null flags of a column.
struct Operand<'a> {
    numbers: Numbers<'a>,
    nulls: Option<&'a [bool]>,
}

impl<'a> Operand<'a> {
    /// `None` unless `value` is a non-null numeric constant or a column of
    /// `Int16`, `Int32`, `Int64` or `Float64`.
    fn of(value: &'a Value, batch: &'a Batch<'_>) -> Option<Self> {
        let numbers = match value {
            Value::Scalar(d @ (Datum::Int16(_) | Datum::Int32(_) | Datum::Int64(_))) => {
                Numbers::ConstInt(d.as_i64()?)
            }
            Value::Scalar(Datum::Float64(f)) => Numbers::ConstFloat(*f),
            Value::Scalar(_) | Value::Vector(_) => return None,
            Value::Column(_) | Value::Typed(_) => {
                let col = value.vector(batch)?;
                let numbers = match (col.data(), col.data_type()) {
                    (ColumnData::Int16(v), DataType::Int16) => Numbers::Int16(v.as_slice()),
                    (ColumnData::Int32(v), DataType::Int32) => Numbers::Int32(v.as_slice()),
                    (ColumnData::Int64(v), DataType::Int64) => Numbers::Int64(v.as_slice()),
                    (ColumnData::Float64(v), DataType::Float64) => Numbers::Float64(v.as_slice()),
                    _ => return None,
                };
                return Some(Self {
                    numbers,
                    nulls: col.nulls(),
                });
            }
        };
        Some(Self { numbers, nulls: None })
    }

    fn is_float(&self) -> bool {
        matches!(self.numbers, Numbers::Float64(_) | Numbers::ConstFloat(_))
    }

    fn is_null(&self, row: usize) -> bool {
        self.nulls.is_some_and(|n| n[row])
    }

    /// Integer value; floats never reach here.
    fn int(&self, row: usize) -> i64 {
        match self.numbers {
            Numbers::Int16(v) => v[row] as i64,
            Numbers::Int32(v) => v[row] as i64,
            Numbers::Int64(v) => v[row],
            Numbers::ConstInt(c) => c,
            Numbers::Float64(v) => v[row] as i64,
            Numbers::ConstFloat(c) => c as i64,
        }
    }

    fn float(&self, row: usize) -> f64 {
        match self.numbers {
            Numbers::Float64(v) => v[row],
            Numbers::ConstFloat(c) => c,
            _ => self.int(row) as f64,
        }
    }
}

/// Rows of the result that stay NULL: outside the mask or NULL on a side.
fn null_rows(l: &Operand<'_>, r: &Operand<'_>, mask: &[bool]) -> Vec<bool> {
    (0..mask.len()).map(|row| !mask[row] || l.is_null(row) || r.is_null(row)).collect()
}

fn typed(
    data_type: DataType,
    data: ColumnData<'static>,
    nulls: Vec<bool>,
) -> Result<ColumnVector<'static>, ExecutionError> {
    let nulls = nulls.iter().any(|n| *n).then_some(ColumnStorage::Owned(nulls));
    ColumnVector::from_parts(data_type, data, nulls).map_err(|e| ExecutionError::Internal(e.to_string()))
}

fn compare_numeric(
    op: BinOp,
    l: &Operand<'_>,
    r: &Operand<'_>,
    mask: &[bool],
) -> Result<ColumnVector<'static>, ExecutionError> {
    let nulls = null_rows(l, r, mask);
    let float = l.is_float() || r.is_float();
    let bits = (0..mask.len())
        .map(|row| {
            !nulls[row] && {
                let ord = if float {
                    float_cmp(l.float(row), r.float(row))
                } else {
                    l.int(row).cmp(&r.int(row))
                };
                accepts(op, ord)
            }
        })
        .collect();
    typed(DataType::Boolean, ColumnData::Boolean(ColumnStorage::Owned(bits)), nulls)
}

/// `None` when the operator has no typed form for these operands.
fn arith_numeric(
    op: BinOp,
    l: &Operand<'_>,
    r: &Operand<'_>,
    mask: &[bool],
) -> Option<Result<ColumnVector<'static>, ExecutionError>> {
    let nulls = null_rows(l, r, mask);
    let rows = 0..mask.len();
    if l.is_float() || r.is_float() {
        let apply: fn(f64, f64) -> f64 = match op {
            BinOp::Add => |a, b| a + b,
            BinOp::Sub => |a, b| a - b,
            BinOp::Mul => |a, b| a * b,
            BinOp::Div => |a, b| a / b,
            _ => return None,
        };
        let mut out = Vec::with_capacity(mask.len());
        for row in rows {
            if nulls[row] {
                out.push(0.0);
                continue;
            }
            let b = r.float(row);
            if op == BinOp::Div && b == 0.0 {
                return Some(Err(ExecutionError::DivisionByZero));
            }
            out.push(apply(l.float(row), b));
        }
        return Some(typed(DataType::Float64, ColumnData::Float64(ColumnStorage::Owned(out)), nulls));
    }
    let apply: fn(i64, i64) -> Option<i64> = match op {
        BinOp::Add => i64::checked_add,
        BinOp::Sub => i64::checked_sub,
        BinOp::Mul => i64::checked_mul,
        BinOp::Div => i64::checked_div,
        BinOp::Mod => i64::checked_rem,
        _ => return None,
    };
    let mut out = Vec::with_capacity(mask.len());
    for row in rows {
        if nulls[row] {
            out.push(0);
            continue;
        }
        let b = r.int(row);
        if matches!(op, BinOp::Div | BinOp::Mod) && b == 0 {
            return Some(Err(ExecutionError::DivisionByZero));
        }
        match apply(l.int(row), b) {
            Some(v) => out.push(v),
            None => {
                return Some(Err(ExecutionError::TypeError(format!(
                    "result of {} out of range",
                    op
                ))))
            }
        }
    }
    Some(typed(DataType::Int64, ColumnData::Int64(ColumnStorage::Owned(out)), nulls))
}

// ---------------------------------------------------------------------------
// Scalar semantics
// ---------------------------------------------------------------------------

fn scalar_op(op: Op, vals: &[Datum]) -> Result<Datum, ExecutionError> {
    match op {
        Op::Binary(bin) => {
            let (l, r) = match vals {
                [l, r] => (l, r),
                _ => return Err(arity(op, vals.len())),
            };
            if bin.is_comparison() {
                compare(bin, l, r)
            } else {
                arith(bin, l, r)
            }
        }
        Op::And | Op::Or => {
            let decisive = op == Op::Or;
            let mut saw_null = false;
            for v in vals {
                match v {
                    Datum::Null => saw_null = true,
                    Datum::Boolean(b) if *b == decisive => return Ok(Datum::Boolean(decisive)),
                    Datum::Boolean(_) => {}
                    other => return Err(not_boolean(other)),
                }
            }
            Ok(if saw_null {
                Datum::Null
            } else {
                Datum::Boolean(!decisive)
            })
        }
        Op::Not => match vals.first() {
            Some(Datum::Null) => Ok(Datum::Null),
            Some(Datum::Boolean(b)) => Ok(Datum::Boolean(!b)),
            Some(other) => Err(not_boolean(other)),
            None => Err(arity(op, 0)),
        },
        Op::IsNull => Ok(Datum::Boolean(vals.first().map_or(true, Datum::is_null))),
        Op::IsNotNull => Ok(Datum::Boolean(vals.first().is_some_and(|v| !v.is_null()))),
        Op::Coalesce => Ok(vals.iter().find(|v| !v.is_null()).cloned().unwrap_or(Datum::Null)),
        Op::Func(f) => match vals {
            [v] => func(f, v),
            _ => Err(arity(op, vals.len())),
        },
    }
}

fn compare(op: BinOp, l: &Datum, r: &Datum) -> Result<Datum, ExecutionError> {
    if l.is_null() || r.is_null() {
        return Ok(Datum::Null);
    }
    let ord = l.sql_cmp(r).ok_or_else(|| {
        ExecutionError::TypeError(format!(
            "cannot compare {:?} {} {:?}",
            l.data_type(),
            op,
            r.data_type()
        ))
    })?;
    Ok(Datum::Boolean(accepts(op, ord)))
}

fn is_integer(d: &Datum) -> bool {
    d.data_type().is_some_and(|t| t.is_integer())
}

fn arith(op: BinOp, l: &Datum, r: &Datum) -> Result<Datum, ExecutionError> {
    if l.is_null() || r.is_null() {
        return Ok(Datum::Null);
    }
    let type_err = || {
        ExecutionError::TypeError(format!(
            "operator {} does not apply to {:?} and {:?}",
            op,
            l.data_type(),
            r.data_type()
        ))
    };
    let out_of_range = || ExecutionError::TypeError(format!("result of {} out of range", op));
    match (l, r) {
        (Datum::Date(d), n) if is_integer(n) && matches!(op, BinOp::Add | BinOp::Sub) => {
            let n = i32::try_from(n.as_i64().unwrap_or_default()).map_err(|_| out_of_range())?;
            let v = if op == BinOp::Add {
                d.checked_add(n)
            } else {
                d.checked_sub(n)
            };
            v.map(Datum::Date).ok_or_else(out_of_range)
        }
        (a, b) if is_integer(a) && is_integer(b) => {
            let (a, b) = (a.as_i64().unwrap_or_default(), b.as_i64().unwrap_or_default());
            if matches!(op, BinOp::Div | BinOp::Mod) && b == 0 {
                return Err(ExecutionError::DivisionByZero);
            }
            let v = match op {
                BinOp::Add => a.checked_add(b),
                BinOp::Sub => a.checked_sub(b),
                BinOp::Mul => a.checked_mul(b),
                BinOp::Div => a.checked_div(b),
                BinOp::Mod => a.checked_rem(b),
                _ => return Err(type_err()),
            };
            v.map(Datum::Int64).ok_or_else(out_of_range)
        }
        (a, b) if a.data_type().is_some_and(|t| t.is_numeric()) && b.data_type().is_some_and(|t| t.is_numeric()) => {
            let (a, b) = (a.as_f64().unwrap_or_default(), b.as_f64().unwrap_or_default());
            let v = match op {
                BinOp::Add => a + b,
                BinOp::Sub => a - b,
                BinOp::Mul => a * b,
                BinOp::Div if b == 0.0 => return Err(ExecutionError::DivisionByZero),
                BinOp::Div => a / b,
                _ => return Err(type_err()),
            };
            Ok(Datum::Float64(v))
        }
        _ => Err(type_err()),
    }
}

fn func(f: ScalarFunc, v: &Datum) -> Result<Datum, ExecutionError> {
    let bad = || ExecutionError::TypeError(format!("{:?} does not accept {:?}", f, v.data_type()));
    let overflow = || ExecutionError::TypeError(format!("{:?} result out of range", f));
    if v.is_null() {
        return Ok(Datum::Null);
    }
    match (f, v) {
        (ScalarFunc::Abs, Datum::Int16(x)) => x.checked_abs().map(Datum::Int16).ok_or_else(overflow),
        (ScalarFunc::Abs, Datum::Int32(x)) => x.checked_abs().map(Datum::Int32).ok_or_else(overflow),
        (ScalarFunc::Abs, Datum::Int64(x)) => x.checked_abs().map(Datum::Int64).ok_or_else(overflow),
        (ScalarFunc::Abs, Datum::Float64(x)) => Ok(Datum::Float64(x.abs())),
        (ScalarFunc::Lower, Datum::Text(s)) => Ok(Datum::Text(s.to_lowercase())),
        (ScalarFunc::Upper, Datum::Text(s)) => Ok(Datum::Text(s.to_uppercase())),
        (ScalarFunc::Length, Datum::Text(s)) => Ok(Datum::Int32(s.chars().count() as i32)),
        (ScalarFunc::Length, Datum::Bytea(b)) => Ok(Datum::Int32(b.len() as i32)),
        _ => Err(bad()),
    }
}

fn not_boolean(d: &Datum) -> ExecutionError {
    ExecutionError::TypeError(format!("expected boolean, got {:?}", d.data_type()))
}

fn arity(op: Op, got: usize) -> ExecutionError {
    ExecutionError::InvalidPlan(format!("{:?} called with {} arguments", op, got))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::{compile_expr, compile_projection};
    use crate::expr::Expr;
    use strata_common::datum::OwnedRow;
    use strata_storage::row_id::RowId;

    fn batch() -> Batch<'static> {
        let mut b = Batch::with_types(&[Some(DataType::Int64), Some(DataType::Text)], 8);
        let rows = [
            (Datum::Int64(0), Datum::Text("Zero".into())),
            (Datum::Int64(5), Datum::Null),
            (Datum::Null, Datum::Text("Nil".into())),
            (Datum::Int64(-7), Datum::Text("neg".into())),
        ];
        for (i, (a, b2)) in rows.into_iter().enumerate() {
            b.push_row(RowId(i as u64), &OwnedRow::new(vec![a, b2])).unwrap();
        }
        b
    }

    fn eval(expr: Expr, b: &Batch<'_>) -> Result<Vec<Datum>, ExecutionError> {
        let p = compile_expr(&expr).map_err(|r| ExecutionError::InvalidPlan(r.to_string()))?;
        let v = Interpreter::new().execute(&p, b, None, &mut NoTransitions)?;
        Ok((0..b.dim()).map(|r| v[0].at(b, r)).collect())
    }

    fn lit(v: i64) -> Expr {
        Expr::lit(Datum::Int64(v))
    }

    #[test]
    fn test_fast_compare_matches_generic_path() {
        let b = batch();
        let fast = eval(Expr::binary(BinOp::Ge, Expr::col(0), lit(0)), &b).unwrap();
        let flipped = eval(Expr::binary(BinOp::Le, lit(0), Expr::col(0)), &b).unwrap();
        let generic = eval(
            Expr::binary(BinOp::Ge, Expr::col(0), Expr::lit(Datum::Float64(0.0))),
            &b,
        )
        .unwrap();
        let want = vec![
            Datum::Boolean(true),
            Datum::Boolean(true),
            Datum::Null,
            Datum::Boolean(false),
        ];
        assert_eq!(fast, want);
        assert_eq!(flipped, want);
        assert_eq!(generic, want);
    }

    #[test]
    fn test_arithmetic_errors() {
        let b = batch();
        assert!(matches!(
            eval(Expr::binary(BinOp::Div, lit(10), Expr::col(0)), &b),
            Err(ExecutionError::DivisionByZero)
        ));
        assert!(matches!(
            eval(Expr::binary(BinOp::Add, Expr::col(0), lit(i64::MAX)), &b),
            Err(ExecutionError::TypeError(_))
        ));
        assert!(matches!(
            eval(Expr::binary(BinOp::Add, Expr::col(0), Expr::col(1)), &b),
            Err(ExecutionError::TypeError(_))
        ));
    }

    #[test]
    fn test_and_guards_later_operands() {
        // col0 <> 0 AND 10 / col0 > 1 must not divide by zero on row 0
        let b = batch();
        let e = Expr::And(vec![
            Expr::binary(BinOp::NotEq, Expr::col(0), lit(0)),
            Expr::binary(BinOp::Gt, Expr::binary(BinOp::Div, lit(10), Expr::col(0)), lit(1)),
        ]);
        let out = eval(e, &b).unwrap();
        assert_eq!(
            out,
            vec![
                Datum::Boolean(false),
                Datum::Boolean(true),
                Datum::Null,
                Datum::Boolean(false)
            ]
        );
    }

    #[test]
    fn test_case_and_functions() {
        let b = batch();
        let case = Expr::Case {
            conditions: vec![
                Expr::binary(BinOp::Eq, Expr::col(0), lit(0)),
                Expr::binary(BinOp::Lt, Expr::col(0), lit(0)),
            ],
            results: vec![
                // would fail on every other row
                Expr::binary(BinOp::Div, lit(1), lit(1)),
                Expr::Func {
                    func: ScalarFunc::Abs,
                    args: vec![Expr::col(0)],
                },
            ],
            else_result: Some(Box::new(Expr::Coalesce(vec![
                Expr::Func {
                    func: ScalarFunc::Length,
                    args: vec![Expr::col(1)],
                },
                lit(-1),
            ]))),
        };
        assert_eq!(
            eval(case, &b).unwrap(),
            vec![Datum::Int64(1), Datum::Int64(-1), Datum::Int32(3), Datum::Int64(7)]
        );
        let p = compile_projection(&[
            Expr::Func {
                func: ScalarFunc::Upper,
                args: vec![Expr::col(1)],
            },
            Expr::IsNull(Box::new(Expr::col(0))),
        ])
        .unwrap();
        let v = Interpreter::new().execute(&p, &b, None, &mut NoTransitions).unwrap();
        assert_eq!(v[0].at(&b, 0), Datum::Text("ZERO".into()));
        assert_eq!(v[1].at(&b, 2), Datum::Boolean(true));
    }

    #[test]
    fn test_qual_narrows_and_redirect_limits_rows() {
        let mut b = batch();
        let qual = CompiledQual::compile(&[Expr::And(vec![
            Expr::IsNotNull(Box::new(Expr::col(1))),
            Expr::binary(BinOp::Lt, Expr::col(0), lit(3)),
        ])])
        .unwrap();
        Interpreter::new().apply_qual(&qual, &mut b).unwrap();
        assert_eq!(b.skip(), &[false, true, true, false]);

        let p = compile_expr(&Expr::binary(BinOp::Div, lit(10), Expr::col(0))).unwrap();
        let redirect: [RowIndex; 1] = [1];
        let v = Interpreter::new()
            .execute(&p, &batch(), Some(&redirect), &mut NoTransitions)
            .unwrap();
        let got: Vec<Datum> = (0..4).map(|r| v[0].at(&batch(), r)).collect();
        assert_eq!(got, vec![Datum::Null, Datum::Int64(2), Datum::Null, Datum::Null]);
    }

    fn run_one(expr: Expr, b: &Batch<'_>) -> Value {
        let p = compile_expr(&expr).unwrap();
        Interpreter::new()
            .execute(&p, b, None, &mut NoTransitions)
            .unwrap()
            .remove(0)
    }

    #[test]
    fn test_numeric_results_are_typed_vectors() {
        let b = batch();
        let cases = [
            (
                Expr::binary(BinOp::Mul, Expr::col(0), lit(2)),
                DataType::Int64,
                vec![Datum::Int64(0), Datum::Int64(10), Datum::Null, Datum::Int64(-14)],
            ),
            (
                Expr::binary(BinOp::Mul, Expr::col(0), Expr::lit(Datum::Float64(1.5))),
                DataType::Float64,
                vec![Datum::Float64(0.0), Datum::Float64(7.5), Datum::Null, Datum::Float64(-10.5)],
            ),
            (
                Expr::binary(BinOp::Gt, Expr::col(0), Expr::lit(Datum::Float64(0.5))),
                DataType::Boolean,
                vec![Datum::Boolean(false), Datum::Boolean(true), Datum::Null, Datum::Boolean(false)],
            ),
            (
                // typed result compared against a column
                Expr::binary(
                    BinOp::Gt,
                    Expr::binary(BinOp::Add, Expr::col(0), Expr::col(0)),
                    Expr::col(0),
                ),
                DataType::Boolean,
                vec![Datum::Boolean(false), Datum::Boolean(true), Datum::Null, Datum::Boolean(false)],
            ),
        ];
        for (expr, data_type, want) in cases {
            let Value::Typed(v) = run_one(expr, &b) else {
                panic!("expected a typed vector for {:?}", data_type);
            };
            assert_eq!(v.data_type(), data_type);
            assert_eq!((0..4).map(|r| v.get(r)).collect::<Vec<_>>(), want);
        }
        let neg = Expr::lit(Datum::Text("neg".into()));
        let text = run_one(Expr::binary(BinOp::Eq, Expr::col(1), neg), &b);
        assert!(matches!(text, Value::Vector(_)));
    }

    #[test]
    fn test_text_argument_read_by_reference() {
        let b = batch();
        let text = Value::Column(1);
        let view = ArgView { value: &text, batch: &b };
        let Some(VarLenRef::Text(s)) = view.var_len(0) else {
            panic!("row 0 holds text");
        };
        assert_eq!(s, "Zero");
        let Some(ColumnData::Text(stored)) = b.column(1).map(ColumnVector::data) else {
            panic!("column 1 is text");
        };
        assert_eq!(s.as_ptr(), stored[0].as_ptr());
        assert_eq!(view.var_len(1), None);
        let ints = Value::Column(0);
        assert_eq!(ArgView { value: &ints, batch: &b }.var_len(0), None);
    }

    struct Fixed(i64);

    impl SubqueryRunner for Fixed {
        fn run(&self, _id: usize) -> Result<Datum, ExecutionError> {
            Ok(Datum::Int64(self.0))
        }
    }

    #[test]
    fn test_subquery_runs_through_runner() {
        let b = batch();
        let p = compile_expr(&Expr::binary(BinOp::Gt, Expr::col(0), Expr::Subquery(0))).unwrap();
        assert!(matches!(
            Interpreter::new().execute(&p, &b, None, &mut NoTransitions),
            Err(ExecutionError::Subquery(_))
        ));
        let runner = Fixed(1);
        let v = Interpreter::with_subqueries(&runner)
            .execute(&p, &b, None, &mut NoTransitions)
            .unwrap();
        assert_eq!(v[0].at(&b, 1), Datum::Boolean(true));
        assert_eq!(v[0].at(&b, 0), Datum::Boolean(false));
    }
}
