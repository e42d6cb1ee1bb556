use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::types::DataType;

/// A single scalar value as it crosses the row-at-a-time boundary.
/// Fixed-size variants carry no heap allocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Datum {
    Null,
    Boolean(bool),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float64(f64),
    Date(i32),      // days since Unix epoch (1970-01-01)
    Timestamp(i64), // microseconds since Unix epoch
    Text(String),
    Bytea(Vec<u8>),
}

impl Datum {
    pub fn data_type(&self) -> Option<DataType> {
        match self {
            Datum::Null => None,
            Datum::Boolean(_) => Some(DataType::Boolean),
            Datum::Int16(_) => Some(DataType::Int16),
            Datum::Int32(_) => Some(DataType::Int32),
            Datum::Int64(_) => Some(DataType::Int64),
            Datum::Float64(_) => Some(DataType::Float64),
            Datum::Date(_) => Some(DataType::Date),
            Datum::Timestamp(_) => Some(DataType::Timestamp),
            Datum::Text(_) => Some(DataType::Text),
            Datum::Bytea(_) => Some(DataType::Bytea),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Datum::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Datum::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Datum::Int16(v) => Some(*v as i64),
            Datum::Int32(v) => Some(*v as i64),
            Datum::Int64(v) => Some(*v),
            Datum::Date(v) => Some(*v as i64),
            Datum::Timestamp(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Datum::Int16(v) => Some(*v as f64),
            Datum::Int32(v) => Some(*v as f64),
            Datum::Int64(v) => Some(*v as f64),
            Datum::Float64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Datum::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Raw bytes of a text or bytea value.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Datum::Text(s) => Some(s.as_bytes()),
            Datum::Bytea(b) => Some(b.as_slice()),
            _ => None,
        }
    }

    /// Convert a value to the physical representation of `target`.
    /// Integer widening/narrowing is checked; returns `None` when the value
    /// cannot be represented.
    pub fn coerce_to(&self, target: DataType) -> Option<Datum> {
        if self.is_null() {
            return Some(Datum::Null);
        }
        match target {
            DataType::Boolean => self.as_bool().map(Datum::Boolean),
            DataType::Int16 => self.int_value().and_then(|v| i16::try_from(v).ok()).map(Datum::Int16),
            DataType::Int32 => self.int_value().and_then(|v| i32::try_from(v).ok()).map(Datum::Int32),
            DataType::Int64 => self.int_value().map(Datum::Int64),
            DataType::Float64 => self.as_f64().map(Datum::Float64),
            DataType::Date => match self {
                Datum::Date(d) => Some(Datum::Date(*d)),
                Datum::Int32(d) => Some(Datum::Date(*d)),
                _ => None,
            },
            DataType::Timestamp => match self {
                Datum::Timestamp(t) => Some(Datum::Timestamp(*t)),
                Datum::Int64(t) => Some(Datum::Timestamp(*t)),
                Datum::Date(d) => Some(Datum::Timestamp(*d as i64 * 86_400_000_000)),
                _ => None,
            },
            DataType::Text => match self {
                Datum::Text(s) => Some(Datum::Text(s.clone())),
                _ => None,
            },
            DataType::Bytea => self.as_bytes().map(|b| Datum::Bytea(b.to_vec())),
        }
    }

    fn int_value(&self) -> Option<i64> {
        match self {
            Datum::Int16(v) => Some(*v as i64),
            Datum::Int32(v) => Some(*v as i64),
            Datum::Int64(v) => Some(*v),
            _ => None,
        }
    }

    /// Approximate heap + inline footprint, used for memory accounting.
    pub fn estimated_size(&self) -> usize {
        let heap = match self {
            Datum::Text(s) => s.len(),
            Datum::Bytea(b) => b.len(),
            _ => 0,
        };
        std::mem::size_of::<Datum>() + heap
    }

    /// SQL three-valued comparison: `None` when either side is NULL or the
    /// types are not comparable. Integers and floats compare numerically.
    pub fn sql_cmp(&self, other: &Datum) -> Option<Ordering> {
        match (self, other) {
            (Datum::Null, _) | (_, Datum::Null) => None,
            (Datum::Float64(a), b) if b.int_value().is_some() => {
                Some(float_cmp(*a, b.int_value()? as f64))
            }
            (a, Datum::Float64(b)) if a.int_value().is_some() => {
                Some(float_cmp(a.int_value()? as f64, *b))
            }
            (a, b) if a.rank() == b.rank() => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// Type family used for the total order and for hashing. Integer
    /// widths share one family so `Int32(7)` and `Int64(7)` group together.
    fn rank(&self) -> u8 {
        match self {
            Datum::Null => 0,
            Datum::Boolean(_) => 1,
            Datum::Int16(_) | Datum::Int32(_) | Datum::Int64(_) => 2,
            Datum::Float64(_) => 3,
            Datum::Date(_) => 4,
            Datum::Timestamp(_) => 5,
            Datum::Text(_) => 6,
            Datum::Bytea(_) => 7,
        }
    }
}

impl fmt::Display for Datum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Datum::Null => write!(f, "NULL"),
            Datum::Boolean(b) => write!(f, "{}", if *b { "t" } else { "f" }),
            Datum::Int16(v) => write!(f, "{}", v),
            Datum::Int32(v) => write!(f, "{}", v),
            Datum::Int64(v) => write!(f, "{}", v),
            Datum::Float64(v) => write!(f, "{}", v),
            Datum::Date(v) => write!(f, "date:{}", v),
            Datum::Timestamp(v) => write!(f, "ts:{}", v),
            Datum::Text(s) => write!(f, "{}", s),
            Datum::Bytea(b) => {
                write!(f, "\\x")?;
                for byte in b {
                    write!(f, "{:02x}", byte)?;
                }
                Ok(())
            }
        }
    }
}

/// Float order shared by SQL comparison, sorting and grouping: `-0.0`
/// equals `0.0`, and NaN equals NaN and sorts above every number.
pub fn float_cmp(a: f64, b: f64) -> Ordering {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
    }
}

/// Bit pattern that is equal for floats `float_cmp` calls equal.
pub fn canonical_f64_bits(v: f64) -> u64 {
    if v.is_nan() {
        f64::NAN.to_bits()
    } else if v == 0.0 {
        0.0f64.to_bits()
    } else {
        v.to_bits()
    }
}

// Equality and ordering are *total* (NULL equals NULL and sorts first) so
// datums can key grouping tables and sort runs. SQL semantics live in
// `sql_cmp`.
impl PartialEq for Datum {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Datum {}

impl PartialOrd for Datum {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Datum {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Datum::Boolean(a), Datum::Boolean(b)) => a.cmp(b),
            (Datum::Float64(a), Datum::Float64(b)) => float_cmp(*a, *b),
            (Datum::Date(a), Datum::Date(b)) => a.cmp(b),
            (Datum::Timestamp(a), Datum::Timestamp(b)) => a.cmp(b),
            (Datum::Text(a), Datum::Text(b)) => a.cmp(b),
            (Datum::Bytea(a), Datum::Bytea(b)) => a.cmp(b),
            (a, b) => match (a.int_value(), b.int_value()) {
                (Some(x), Some(y)) => x.cmp(&y),
                _ => a.rank().cmp(&b.rank()),
            },
        }
    }
}

impl Hash for Datum {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.rank().hash(state);
        match self {
            Datum::Null => {}
            Datum::Boolean(b) => b.hash(state),
            Datum::Int16(_) | Datum::Int32(_) | Datum::Int64(_) => self.int_value().hash(state),
            Datum::Float64(v) => canonical_f64_bits(*v).hash(state),
            Datum::Date(v) => v.hash(state),
            Datum::Timestamp(v) => v.hash(state),
            Datum::Text(s) => s.hash(state),
            Datum::Bytea(b) => b.hash(state),
        }
    }
}

/// A row is an ordered list of datums.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OwnedRow {
    pub values: Vec<Datum>,
}

impl OwnedRow {
    pub fn new(values: Vec<Datum>) -> Self {
        Self { values }
    }

    pub fn get(&self, idx: usize) -> Option<&Datum> {
        self.values.get(idx)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn estimated_size(&self) -> usize {
        self.values.iter().map(Datum::estimated_size).sum()
    }
}

impl fmt::Display for OwnedRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, v) in self.values.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", v)?;
        }
        write!(f, ")")
    }
}
