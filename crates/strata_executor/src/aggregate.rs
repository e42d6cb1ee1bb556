//! Per-group aggregate state: transition and finalize.
//!
//! Integer sums accumulate in `i128` and are range-checked once, at
//! finalize. A float input anywhere in the group turns the sum into a
//! float. DISTINCT keeps the set of seen values and folds it through a
//! plain state at finalize, in value order so float sums do not depend on
//! set iteration order.

use std::collections::HashSet;

use strata_common::datum::Datum;
use strata_common::error::ExecutionError;

use crate::expr::{AggFunc, AggregateCall};
use crate::interp::VarLenRef;

#[derive(Debug, Clone)]
enum Accumulator {
    Count(i64),
    Sum {
        int: i128,
        float: f64,
        has_float: bool,
        seen: bool,
    },
    Avg {
        sum: f64,
        count: u64,
    },
    Extreme(Datum),
    Bool(Option<bool>),
}

#[derive(Debug, Clone)]
pub struct AggState {
    func: AggFunc,
    acc: Accumulator,
    distinct: Option<HashSet<Datum>>,
}

impl AggState {
    pub fn new(call: &AggregateCall) -> Self {
        Self {
            func: call.func,
            acc: Self::initial(call.func),
            distinct: call.distinct.then(HashSet::new),
        }
    }

    fn initial(func: AggFunc) -> Accumulator {
        match func {
            AggFunc::CountStar | AggFunc::Count => Accumulator::Count(0),
            AggFunc::Sum => Accumulator::Sum {
                int: 0,
                float: 0.0,
                has_float: false,
                seen: false,
            },
            AggFunc::Avg => Accumulator::Avg { sum: 0.0, count: 0 },
            AggFunc::Min | AggFunc::Max => Accumulator::Extreme(Datum::Null),
            AggFunc::BoolAnd | AggFunc::BoolOr => Accumulator::Bool(None),
        }
    }

    pub fn func(&self) -> AggFunc {
        self.func
    }

    pub fn is_distinct(&self) -> bool {
        self.distinct.is_some()
    }

    /// Count-style transition for `n` contributing rows at once.
    pub fn add_count(&mut self, n: u64) {
        if let Accumulator::Count(c) = &mut self.acc {
            *c += n as i64;
        }
    }

    /// Transition with one input value. NULL inputs are ignored by every
    /// aggregate except `count(*)`, which never reaches here.
    pub fn update(&mut self, value: &Datum) -> Result<(), ExecutionError> {
        if value.is_null() {
            return Ok(());
        }
        if let Some(seen) = self.distinct.as_mut() {
            seen.insert(value.clone());
            return Ok(());
        }
        Self::step(self.func, &mut self.acc, value)
    }

    /// Transition with a borrowed text or byte value. MIN and MAX copy it
    /// only when it becomes the new extreme.
    pub fn update_var_len(&mut self, value: VarLenRef<'_>) -> Result<(), ExecutionError> {
        let func = self.func;
        if let (None, Accumulator::Extreme(current)) = (&self.distinct, &mut self.acc) {
            let ord = match (value, &*current) {
                (_, Datum::Null) => None,
                (VarLenRef::Text(s), Datum::Text(c)) => Some(s.cmp(c.as_str())),
                (VarLenRef::Bytea(b), Datum::Bytea(c)) => Some(b.cmp(c.as_slice())),
                _ => return Err(type_error(func, &value.to_datum())),
            };
            let replace = ord.map_or(true, |o| match func {
                AggFunc::Min => o.is_lt(),
                _ => o.is_gt(),
            });
            if replace {
                *current = value.to_datum();
            }
            return Ok(());
        }
        self.update(&value.to_datum())
    }

    fn step(func: AggFunc, acc: &mut Accumulator, value: &Datum) -> Result<(), ExecutionError> {
        match acc {
            Accumulator::Count(c) => *c += 1,
            Accumulator::Sum {
                int,
                float,
                has_float,
                seen,
            } => {
                match value {
                    Datum::Float64(f) => {
                        *float += *f;
                        *has_float = true;
                    }
                    other => match other.as_i64() {
                        Some(v) if other.data_type().is_some_and(|t| t.is_integer()) => {
                            *int += v as i128
                        }
                        _ => return Err(type_error(func, value)),
                    },
                }
                *seen = true;
            }
            Accumulator::Avg { sum, count } => {
                let v = match value {
                    Datum::Int16(_) | Datum::Int32(_) | Datum::Int64(_) | Datum::Float64(_) => {
                        value.as_f64().unwrap_or_default()
                    }
                    _ => return Err(type_error(func, value)),
                };
                *sum += v;
                *count += 1;
            }
            Accumulator::Extreme(current) => {
                if current.is_null() {
                    *current = value.clone();
                } else {
                    let ord = value
                        .sql_cmp(current)
                        .ok_or_else(|| type_error(func, value))?;
                    let replace = match func {
                        AggFunc::Min => ord.is_lt(),
                        _ => ord.is_gt(),
                    };
                    if replace {
                        *current = value.clone();
                    }
                }
            }
            Accumulator::Bool(current) => {
                let b = value.as_bool().ok_or_else(|| type_error(func, value))?;
                *current = Some(match (func, *current) {
                    (AggFunc::BoolAnd, Some(c)) => c && b,
                    (AggFunc::BoolOr, Some(c)) => c || b,
                    (_, None) => b,
                    (_, Some(c)) => c,
                });
            }
        }
        Ok(())
    }

    pub fn finalize(&self) -> Result<Datum, ExecutionError> {
        match &self.distinct {
            Some(seen) => {
                let mut values: Vec<&Datum> = seen.iter().collect();
                values.sort();
                let mut acc = Self::initial(self.func);
                for v in values {
                    Self::step(self.func, &mut acc, v)?;
                }
                Self::result(self.func, &acc)
            }
            None => Self::result(self.func, &self.acc),
        }
    }

    fn result(func: AggFunc, acc: &Accumulator) -> Result<Datum, ExecutionError> {
        Ok(match acc {
            Accumulator::Count(c) => Datum::Int64(*c),
            Accumulator::Sum { seen: false, .. } => Datum::Null,
            Accumulator::Sum {
                int,
                float,
                has_float: true,
                ..
            } => Datum::Float64(*float + *int as f64),
            Accumulator::Sum { int, .. } => i64::try_from(*int)
                .map(Datum::Int64)
                .map_err(|_| ExecutionError::TypeError(format!("{:?} result out of range", func)))?,
            Accumulator::Avg { count: 0, .. } => Datum::Null,
            Accumulator::Avg { sum, count } => Datum::Float64(*sum / *count as f64),
            Accumulator::Extreme(v) => v.clone(),
            Accumulator::Bool(b) => b.map_or(Datum::Null, Datum::Boolean),
        })
    }

    /// Approximate bytes held by this state.
    pub fn estimated_size(&self) -> usize {
        let inline = std::mem::size_of::<Self>();
        let extra = match &self.acc {
            Accumulator::Extreme(v) => v.estimated_size(),
            _ => 0,
        };
        let distinct = self
            .distinct
            .as_ref()
            .map_or(0, |s| s.iter().map(Datum::estimated_size).sum());
        inline + extra + distinct
    }
}

fn type_error(func: AggFunc, value: &Datum) -> ExecutionError {
    ExecutionError::TypeError(format!("{:?} does not accept {:?}", func, value.data_type()))
}

/// Fresh states for every aggregate of a grouping.
pub fn initial_states(calls: &[AggregateCall]) -> Vec<AggState> {
    calls.iter().map(AggState::new).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::Expr;

    fn run(call: AggregateCall, values: &[Datum]) -> Result<Datum, ExecutionError> {
        let mut s = AggState::new(&call);
        for v in values {
            s.update(v)?;
        }
        s.finalize()
    }

    #[test]
    fn test_sum_widths_and_floats() {
        let sum = AggregateCall::new(AggFunc::Sum, Expr::col(0));
        assert_eq!(
            run(sum.clone(), &[Datum::Int32(2), Datum::Int64(3), Datum::Null]).unwrap(),
            Datum::Int64(5)
        );
        assert_eq!(
            run(sum.clone(), &[Datum::Int32(2), Datum::Float64(0.5)]).unwrap(),
            Datum::Float64(2.5)
        );
        assert_eq!(run(sum.clone(), &[Datum::Null]).unwrap(), Datum::Null);
        // transient overflow that comes back into range is fine
        assert_eq!(
            run(sum.clone(), &[Datum::Int64(i64::MAX), Datum::Int64(1), Datum::Int64(-2)]).unwrap(),
            Datum::Int64(i64::MAX - 1)
        );
        assert!(run(sum.clone(), &[Datum::Int64(i64::MAX), Datum::Int64(1)]).is_err());
        assert!(run(sum, &[Datum::Text("x".into())]).is_err());
    }

    #[test]
    fn test_min_max_avg_bool() {
        let vals = [Datum::Int64(4), Datum::Null, Datum::Int64(-1), Datum::Int64(9)];
        assert_eq!(
            run(AggregateCall::new(AggFunc::Min, Expr::col(0)), &vals).unwrap(),
            Datum::Int64(-1)
        );
        assert_eq!(
            run(AggregateCall::new(AggFunc::Max, Expr::col(0)), &vals).unwrap(),
            Datum::Int64(9)
        );
        assert_eq!(
            run(AggregateCall::new(AggFunc::Avg, Expr::col(0)), &vals).unwrap(),
            Datum::Float64(4.0)
        );
        let bools = [Datum::Boolean(true), Datum::Null, Datum::Boolean(false)];
        assert_eq!(
            run(AggregateCall::new(AggFunc::BoolAnd, Expr::col(0)), &bools).unwrap(),
            Datum::Boolean(false)
        );
        assert_eq!(
            run(AggregateCall::new(AggFunc::BoolOr, Expr::col(0)), &bools).unwrap(),
            Datum::Boolean(true)
        );
        assert_eq!(
            run(AggregateCall::new(AggFunc::BoolOr, Expr::col(0)), &[]).unwrap(),
            Datum::Null
        );
    }

    #[test]
    fn test_count_paths_and_distinct() {
        let mut star = AggState::new(&AggregateCall::count_star());
        star.add_count(3);
        star.add_count(2);
        assert_eq!(star.finalize().unwrap(), Datum::Int64(5));

        let vals = [Datum::Int64(1), Datum::Int64(1), Datum::Int32(1), Datum::Int64(2), Datum::Null];
        assert_eq!(
            run(AggregateCall::new(AggFunc::Count, Expr::col(0)).distinct(), &vals).unwrap(),
            Datum::Int64(2)
        );
        assert_eq!(
            run(AggregateCall::new(AggFunc::Sum, Expr::col(0)).distinct(), &vals).unwrap(),
            Datum::Int64(3)
        );
        assert_eq!(
            run(AggregateCall::new(AggFunc::Count, Expr::col(0)), &vals).unwrap(),
            Datum::Int64(4)
        );
    }

    #[test]
    fn test_borrowed_text_matches_owned_updates() {
        let words = ["pear", "apple", "quince", "apple"];
        for func in [AggFunc::Min, AggFunc::Max, AggFunc::Count] {
            let call = AggregateCall::new(func, Expr::col(0));
            let mut borrowed = AggState::new(&call);
            for w in words {
                borrowed.update_var_len(VarLenRef::Text(w)).unwrap();
            }
            let owned: Vec<Datum> = words.iter().map(|w| Datum::Text(w.to_string())).collect();
            assert_eq!(borrowed.finalize().unwrap(), run(call, &owned).unwrap());
        }
        let mut min = AggState::new(&AggregateCall::new(AggFunc::Min, Expr::col(0)));
        min.update_var_len(VarLenRef::Bytea(&[2, 0])).unwrap();
        min.update_var_len(VarLenRef::Bytea(&[1, 9])).unwrap();
        assert_eq!(min.finalize().unwrap(), Datum::Bytea(vec![1, 9]));
        assert!(matches!(
            min.update_var_len(VarLenRef::Text("x")),
            Err(ExecutionError::TypeError(_))
        ));
    }

    #[test]
    fn test_distinct_float_sum_ignores_arrival_order() {
        let sum = AggregateCall::new(AggFunc::Sum, Expr::col(0)).distinct();
        let avg = AggregateCall::new(AggFunc::Avg, Expr::col(0)).distinct();
        let vals = [Datum::Float64(1e16), Datum::Float64(1.0), Datum::Float64(-1e16), Datum::Float64(1.0)];
        let want_sum = run(sum.clone(), &vals).unwrap();
        let want_avg = run(avg.clone(), &vals).unwrap();
        for rotation in 1..vals.len() {
            let mut v = vals.to_vec();
            v.rotate_left(rotation);
            v.reverse();
            assert_eq!(run(sum.clone(), &v).unwrap(), want_sum);
            assert_eq!(run(avg.clone(), &v).unwrap(), want_avg);
        }
        // -1e16 + 1.0 rounds back to -1e16
        assert_eq!(want_sum, Datum::Float64(0.0));
    }
}
