//! Bound expression trees handed to the batch compiler by the planner.

use std::fmt;

use strata_common::datum::Datum;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
}

impl BinOp {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinOp::Eq | BinOp::NotEq | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge
        )
    }
}

impl fmt::Display for BinOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Mod => "%",
            BinOp::Eq => "=",
            BinOp::NotEq => "<>",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarFunc {
    Abs,
    Lower,
    Upper,
    Length,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Datum),
    /// Column ordinal in the input batch.
    Column(usize),
    Binary {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Not(Box<Expr>),
    IsNull(Box<Expr>),
    IsNotNull(Box<Expr>),
    Func {
        func: ScalarFunc,
        args: Vec<Expr>,
    },
    Coalesce(Vec<Expr>),
    Case {
        conditions: Vec<Expr>,
        results: Vec<Expr>,
        else_result: Option<Box<Expr>>,
    },
    /// Uncorrelated scalar sub-query, run once per batch.
    Subquery(usize),
    /// Row constructor `(a, b, ...)`; never compiled in batch form.
    Row(Vec<Expr>),
}

impl Expr {
    pub fn col(idx: usize) -> Self {
        Expr::Column(idx)
    }

    pub fn lit(value: Datum) -> Self {
        Expr::Literal(value)
    }

    pub fn binary(op: BinOp, left: Expr, right: Expr) -> Self {
        Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn is_connective(&self) -> bool {
        matches!(self, Expr::And(_) | Expr::Or(_) | Expr::Not(_))
    }

    /// Split a top-level AND chain into its conjuncts.
    pub fn conjuncts(self) -> Vec<Expr> {
        match self {
            Expr::And(parts) => parts.into_iter().flat_map(Expr::conjuncts).collect(),
            other => vec![other],
        }
    }

    /// Merge directly nested ANDs into one AND, and ORs into one OR.
    pub fn flatten(self) -> Expr {
        match self {
            Expr::And(parts) => Expr::And(
                parts
                    .into_iter()
                    .map(Expr::flatten)
                    .flat_map(|p| match p {
                        Expr::And(inner) => inner,
                        other => vec![other],
                    })
                    .collect(),
            ),
            Expr::Or(parts) => Expr::Or(
                parts
                    .into_iter()
                    .map(Expr::flatten)
                    .flat_map(|p| match p {
                        Expr::Or(inner) => inner,
                        other => vec![other],
                    })
                    .collect(),
            ),
            Expr::Not(inner) => Expr::Not(Box::new(inner.flatten())),
            other => other,
        }
    }

    pub fn children(&self) -> Vec<&Expr> {
        match self {
            Expr::Literal(_) | Expr::Column(_) | Expr::Subquery(_) => Vec::new(),
            Expr::Binary { left, right, .. } => vec![left.as_ref(), right.as_ref()],
            Expr::And(v) | Expr::Or(v) | Expr::Coalesce(v) | Expr::Row(v) => v.iter().collect(),
            Expr::Func { args, .. } => args.iter().collect(),
            Expr::Not(e) | Expr::IsNull(e) | Expr::IsNotNull(e) => vec![e.as_ref()],
            Expr::Case {
                conditions,
                results,
                else_result,
            } => conditions
                .iter()
                .chain(results.iter())
                .chain(else_result.as_deref())
                .collect(),
        }
    }

    /// Column ordinals read anywhere in the tree.
    pub fn referenced_columns(&self, out: &mut Vec<usize>) {
        if let Expr::Column(c) = self {
            if !out.contains(c) {
                out.push(*c);
            }
        }
        for child in self.children() {
            child.referenced_columns(out);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AggFunc {
    /// `count(*)`; takes no argument.
    CountStar,
    Count,
    Sum,
    Avg,
    Min,
    Max,
    BoolAnd,
    BoolOr,
}

impl AggFunc {
    /// Aggregates whose result is a row count and never look at values
    /// beyond their null-ness.
    pub fn is_count_like(self) -> bool {
        matches!(self, AggFunc::CountStar | AggFunc::Count)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregateCall {
    pub func: AggFunc,
    /// Argument expressions; more than one only makes sense for DISTINCT
    /// over several columns, which is not compiled in batch form.
    pub args: Vec<Expr>,
    pub distinct: bool,
}

impl AggregateCall {
    pub fn count_star() -> Self {
        Self {
            func: AggFunc::CountStar,
            args: Vec::new(),
            distinct: false,
        }
    }

    pub fn new(func: AggFunc, arg: Expr) -> Self {
        Self {
            func,
            args: vec![arg],
            distinct: false,
        }
    }

    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }
}
