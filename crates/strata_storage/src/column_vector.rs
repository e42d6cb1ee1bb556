//! Column vectors: one column's values for a row group or a batch.
//!
//! A vector is either *owned* (private arrays sized to its capacity, filled
//! row by row) or a *reference* view borrowing a slice of a decoded row-group
//! buffer. The borrow checker enforces that a reference view never outlives
//! the buffer it points into.

use std::ops::Deref;

use strata_common::config::ROW_GROUP_CAPACITY;
use strata_common::datum::Datum;
use strata_common::error::EncodingError;
use strata_common::types::DataType;

/// Storage of one homogeneous array: owned or borrowed.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnStorage<'a, T> {
    Owned(Vec<T>),
    Borrowed(&'a [T]),
}

impl<'a, T: Clone> ColumnStorage<'a, T> {
    pub fn as_slice(&self) -> &[T] {
        match self {
            ColumnStorage::Owned(v) => v.as_slice(),
            ColumnStorage::Borrowed(s) => s,
        }
    }

    pub fn is_reference(&self) -> bool {
        matches!(self, ColumnStorage::Borrowed(_))
    }

    /// Mutable access; a borrowed view is copied into owned storage first.
    pub fn to_mut(&mut self) -> &mut Vec<T> {
        if let ColumnStorage::Borrowed(s) = self {
            *self = ColumnStorage::Owned(s.to_vec());
        }
        match self {
            ColumnStorage::Owned(v) => v,
            ColumnStorage::Borrowed(_) => unreachable!("converted to owned above"),
        }
    }

    /// Borrowed view of `start..end`.
    pub fn window(&self, start: usize, end: usize) -> ColumnStorage<'_, T> {
        ColumnStorage::Borrowed(&self.as_slice()[start..end])
    }

    pub fn into_owned(self) -> ColumnStorage<'static, T> {
        match self {
            ColumnStorage::Owned(v) => ColumnStorage::Owned(v),
            ColumnStorage::Borrowed(s) => ColumnStorage::Owned(s.to_vec()),
        }
    }

    fn gather(&self, rows: &[usize]) -> ColumnStorage<'static, T> {
        let src = self.as_slice();
        ColumnStorage::Owned(rows.iter().map(|&r| src[r].clone()).collect())
    }
}

impl<'a, T: Clone> Deref for ColumnStorage<'a, T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        self.as_slice()
    }
}

/// Physical value arrays, one variant per physical width. `Date` shares
/// `Int32` and `Timestamp` shares `Int64`; the logical type lives on the
/// owning vector.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnData<'a> {
    Boolean(ColumnStorage<'a, bool>),
    Int16(ColumnStorage<'a, i16>),
    Int32(ColumnStorage<'a, i32>),
    Int64(ColumnStorage<'a, i64>),
    Float64(ColumnStorage<'a, f64>),
    Text(ColumnStorage<'a, String>),
    Bytea(ColumnStorage<'a, Vec<u8>>),
}

macro_rules! each_storage {
    ($data:expr, $s:ident => $body:expr) => {
        match $data {
            ColumnData::Boolean($s) => $body,
            ColumnData::Int16($s) => $body,
            ColumnData::Int32($s) => $body,
            ColumnData::Int64($s) => $body,
            ColumnData::Float64($s) => $body,
            ColumnData::Text($s) => $body,
            ColumnData::Bytea($s) => $body,
        }
    };
}

impl<'a> ColumnData<'a> {
    fn empty_for(data_type: DataType, capacity: usize) -> ColumnData<'static> {
        match data_type {
            DataType::Boolean => ColumnData::Boolean(ColumnStorage::Owned(Vec::with_capacity(capacity))),
            DataType::Int16 => ColumnData::Int16(ColumnStorage::Owned(Vec::with_capacity(capacity))),
            DataType::Int32 | DataType::Date => {
                ColumnData::Int32(ColumnStorage::Owned(Vec::with_capacity(capacity)))
            }
            DataType::Int64 | DataType::Timestamp => {
                ColumnData::Int64(ColumnStorage::Owned(Vec::with_capacity(capacity)))
            }
            DataType::Float64 => ColumnData::Float64(ColumnStorage::Owned(Vec::with_capacity(capacity))),
            DataType::Text => ColumnData::Text(ColumnStorage::Owned(Vec::with_capacity(capacity))),
            DataType::Bytea => ColumnData::Bytea(ColumnStorage::Owned(Vec::with_capacity(capacity))),
        }
    }

    pub fn len(&self) -> usize {
        each_storage!(self, s => s.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_reference(&self) -> bool {
        each_storage!(self, s => s.is_reference())
    }

    fn window(&self, start: usize, end: usize) -> ColumnData<'_> {
        match self {
            ColumnData::Boolean(s) => ColumnData::Boolean(s.window(start, end)),
            ColumnData::Int16(s) => ColumnData::Int16(s.window(start, end)),
            ColumnData::Int32(s) => ColumnData::Int32(s.window(start, end)),
            ColumnData::Int64(s) => ColumnData::Int64(s.window(start, end)),
            ColumnData::Float64(s) => ColumnData::Float64(s.window(start, end)),
            ColumnData::Text(s) => ColumnData::Text(s.window(start, end)),
            ColumnData::Bytea(s) => ColumnData::Bytea(s.window(start, end)),
        }
    }

    fn into_owned(self) -> ColumnData<'static> {
        match self {
            ColumnData::Boolean(s) => ColumnData::Boolean(s.into_owned()),
            ColumnData::Int16(s) => ColumnData::Int16(s.into_owned()),
            ColumnData::Int32(s) => ColumnData::Int32(s.into_owned()),
            ColumnData::Int64(s) => ColumnData::Int64(s.into_owned()),
            ColumnData::Float64(s) => ColumnData::Float64(s.into_owned()),
            ColumnData::Text(s) => ColumnData::Text(s.into_owned()),
            ColumnData::Bytea(s) => ColumnData::Bytea(s.into_owned()),
        }
    }

    fn truncate(&mut self) {
        each_storage!(self, s => s.to_mut().clear())
    }

    fn gather(&self, rows: &[usize]) -> ColumnData<'static> {
        match self {
            ColumnData::Boolean(s) => ColumnData::Boolean(s.gather(rows)),
            ColumnData::Int16(s) => ColumnData::Int16(s.gather(rows)),
            ColumnData::Int32(s) => ColumnData::Int32(s.gather(rows)),
            ColumnData::Int64(s) => ColumnData::Int64(s.gather(rows)),
            ColumnData::Float64(s) => ColumnData::Float64(s.gather(rows)),
            ColumnData::Text(s) => ColumnData::Text(s.gather(rows)),
            ColumnData::Bytea(s) => ColumnData::Bytea(s.gather(rows)),
        }
    }
}

/// One column of up to `capacity` values plus an optional null mask.
///
/// `nulls == None` is the *non-null* flag: no row of the vector is null.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnVector<'a> {
    data_type: DataType,
    capacity: usize,
    data: ColumnData<'a>,
    nulls: Option<ColumnStorage<'a, bool>>,
}

impl ColumnVector<'static> {
    /// Allocate an empty owned vector.
    pub fn build(data_type: DataType, capacity: usize) -> Self {
        Self {
            data_type,
            capacity,
            data: ColumnData::empty_for(data_type, capacity.min(ROW_GROUP_CAPACITY)),
            nulls: None,
        }
    }

    pub fn from_datums(data_type: DataType, values: &[Datum]) -> Result<Self, EncodingError> {
        let mut v = Self::build(data_type, values.len());
        for d in values {
            v.push(d)?;
        }
        Ok(v)
    }
}

impl<'a> ColumnVector<'a> {
    /// Assemble a vector from parts produced by the codec or a batch window.
    pub fn from_parts(
        data_type: DataType,
        data: ColumnData<'a>,
        nulls: Option<ColumnStorage<'a, bool>>,
    ) -> Result<Self, EncodingError> {
        let physical_ok = matches!(
            (&data, data_type),
            (ColumnData::Boolean(_), DataType::Boolean)
                | (ColumnData::Int16(_), DataType::Int16)
                | (ColumnData::Int32(_), DataType::Int32 | DataType::Date)
                | (ColumnData::Int64(_), DataType::Int64 | DataType::Timestamp)
                | (ColumnData::Float64(_), DataType::Float64)
                | (ColumnData::Text(_), DataType::Text)
                | (ColumnData::Bytea(_), DataType::Bytea)
        );
        if !physical_ok {
            return Err(EncodingError::TypeMismatch {
                expected: data_type,
                got: None,
            });
        }
        if let Some(n) = &nulls {
            if n.len() != data.len() {
                return Err(EncodingError::LengthOverflow {
                    declared: n.len(),
                    available: data.len(),
                });
            }
        }
        let dim = data.len();
        Ok(Self {
            data_type,
            capacity: dim,
            data,
            nulls,
        })
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn element_width(&self) -> Option<usize> {
        self.data_type.fixed_width()
    }

    pub fn is_fixed_width(&self) -> bool {
        self.data_type.is_fixed_width()
    }

    /// Number of rows held (`dim`).
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_reference(&self) -> bool {
        self.data.is_reference()
    }

    pub fn is_non_null(&self) -> bool {
        self.nulls.is_none()
    }

    pub fn data(&self) -> &ColumnData<'a> {
        &self.data
    }

    pub fn nulls(&self) -> Option<&[bool]> {
        self.nulls.as_deref()
    }

    pub fn is_null(&self, row: usize) -> bool {
        self.nulls.as_ref().is_some_and(|n| n[row])
    }

    pub fn null_count(&self) -> usize {
        self.nulls
            .as_ref()
            .map_or(0, |n| n.iter().filter(|b| **b).count())
    }

    /// Value at `row` as a datum (`Datum::Null` for null slots).
    pub fn get(&self, row: usize) -> Datum {
        if self.is_null(row) {
            return Datum::Null;
        }
        match (&self.data, self.data_type) {
            (ColumnData::Boolean(s), _) => Datum::Boolean(s[row]),
            (ColumnData::Int16(s), _) => Datum::Int16(s[row]),
            (ColumnData::Int32(s), DataType::Date) => Datum::Date(s[row]),
            (ColumnData::Int32(s), _) => Datum::Int32(s[row]),
            (ColumnData::Int64(s), DataType::Timestamp) => Datum::Timestamp(s[row]),
            (ColumnData::Int64(s), _) => Datum::Int64(s[row]),
            (ColumnData::Float64(s), _) => Datum::Float64(s[row]),
            (ColumnData::Text(s), _) => Datum::Text(s[row].clone()),
            (ColumnData::Bytea(s), _) => Datum::Bytea(s[row].clone()),
        }
    }

    /// `value` as stored in this vector, or the type mismatch `push` would
    /// report.
    pub fn coerce(&self, value: &Datum) -> Result<Datum, EncodingError> {
        if value.is_null() {
            return Ok(Datum::Null);
        }
        value.coerce_to(self.data_type).ok_or(EncodingError::TypeMismatch {
            expected: self.data_type,
            got: value.data_type(),
        })
    }

    /// Append one value. The null mask is materialized on the first null.
    pub fn push(&mut self, value: &Datum) -> Result<(), EncodingError> {
        let dim = self.len();
        if dim >= self.capacity {
            return Err(EncodingError::TooManyRows {
                rows: dim + 1,
                capacity: self.capacity,
            });
        }
        let is_null = value.is_null();
        let coerced = self.coerce(value)?;
        match (&mut self.data, coerced) {
            (ColumnData::Boolean(s), d) => s.to_mut().push(d.as_bool().unwrap_or_default()),
            (ColumnData::Int16(s), Datum::Int16(v)) => s.to_mut().push(v),
            (ColumnData::Int16(s), _) => s.to_mut().push(0),
            (ColumnData::Int32(s), Datum::Int32(v) | Datum::Date(v)) => s.to_mut().push(v),
            (ColumnData::Int32(s), _) => s.to_mut().push(0),
            (ColumnData::Int64(s), Datum::Int64(v) | Datum::Timestamp(v)) => s.to_mut().push(v),
            (ColumnData::Int64(s), _) => s.to_mut().push(0),
            (ColumnData::Float64(s), Datum::Float64(v)) => s.to_mut().push(v),
            (ColumnData::Float64(s), _) => s.to_mut().push(0.0),
            (ColumnData::Text(s), Datum::Text(v)) => s.to_mut().push(v),
            (ColumnData::Text(s), _) => s.to_mut().push(String::new()),
            (ColumnData::Bytea(s), Datum::Bytea(v)) => s.to_mut().push(v),
            (ColumnData::Bytea(s), _) => s.to_mut().push(Vec::new()),
        }
        match (&mut self.nulls, is_null) {
            (Some(n), _) => n.to_mut().push(is_null),
            (None, true) => {
                let mut n = vec![false; dim];
                n.push(true);
                self.nulls = Some(ColumnStorage::Owned(n));
            }
            (None, false) => {}
        }
        Ok(())
    }

    /// Drop all rows, keeping owned allocations for the next batch.
    pub fn clear(&mut self) {
        self.data.truncate();
        self.nulls = None;
    }

    /// Reference view of rows `start..start + len`.
    pub fn slice(&self, start: usize, len: usize) -> ColumnVector<'_> {
        let end = start + len;
        ColumnVector {
            data_type: self.data_type,
            capacity: len,
            data: self.data.window(start, end),
            nulls: self.nulls.as_ref().and_then(|n| {
                let window = &n[start..end];
                window.iter().any(|b| *b).then_some(ColumnStorage::Borrowed(window))
            }),
        }
    }

    pub fn into_owned(self) -> ColumnVector<'static> {
        ColumnVector {
            data_type: self.data_type,
            capacity: self.capacity,
            data: self.data.into_owned(),
            nulls: self.nulls.map(ColumnStorage::into_owned),
        }
    }

    /// Gather the rows listed in `rows` into a new owned vector.
    pub fn gather(&self, rows: &[usize]) -> ColumnVector<'static> {
        let nulls = self
            .nulls
            .as_ref()
            .map(|n| n.gather(rows))
            .filter(|n| n.iter().any(|b| *b));
        ColumnVector {
            data_type: self.data_type,
            capacity: rows.len(),
            data: self.data.gather(rows),
            nulls,
        }
    }

    /// Min/max statistics over non-null rows. Byte-like bounds are capped to
    /// `prefix_len` bytes: the min is truncated (still a lower bound) and the
    /// max is rounded up to the next prefix (still an upper bound), or left
    /// unbounded when no shorter upper bound exists.
    pub fn zone_map(&self, prefix_len: usize) -> ZoneMap {
        let nulls = self.null_count();
        let row_count = self.len();
        let mut zone = ZoneMap {
            min: None,
            max: None,
            null_count: nulls,
            row_count,
        };
        if nulls == row_count {
            return zone;
        }
        let live = (0..row_count).filter(|&r| !self.is_null(r));
        match &self.data {
            ColumnData::Text(s) => {
                let mut it = live.map(|r| s[r].as_bytes());
                let first = it.next().unwrap_or_default();
                let (lo, hi) = it.fold((first, first), |(lo, hi), v| (lo.min(v), hi.max(v)));
                zone.min = Some(Datum::Bytea(truncate_lower(lo, prefix_len)));
                zone.max = round_upper(hi, prefix_len).map(Datum::Bytea);
            }
            ColumnData::Bytea(s) => {
                let mut it = live.map(|r| s[r].as_slice());
                let first = it.next().unwrap_or_default();
                let (lo, hi) = it.fold((first, first), |(lo, hi), v| (lo.min(v), hi.max(v)));
                zone.min = Some(Datum::Bytea(truncate_lower(lo, prefix_len)));
                zone.max = round_upper(hi, prefix_len).map(Datum::Bytea);
            }
            _ => {
                let mut it = live.map(|r| self.get(r));
                if let Some(first) = it.next() {
                    let (lo, hi) = it.fold((first.clone(), first), |(lo, hi), v| {
                        let lo = if v < lo { v.clone() } else { lo };
                        let hi = if v > hi { v } else { hi };
                        (lo, hi)
                    });
                    zone.min = Some(lo);
                    zone.max = Some(hi);
                }
            }
        }
        zone
    }
}

fn truncate_lower(v: &[u8], prefix_len: usize) -> Vec<u8> {
    v[..v.len().min(prefix_len)].to_vec()
}

fn round_upper(v: &[u8], prefix_len: usize) -> Option<Vec<u8>> {
    if v.len() <= prefix_len {
        return Some(v.to_vec());
    }
    let mut prefix = v[..prefix_len].to_vec();
    while let Some(last) = prefix.pop() {
        if last < u8::MAX {
            prefix.push(last + 1);
            return Some(prefix);
        }
    }
    None
}

/// Per-column min/max statistics of one row group.
///
/// `min == None` with rows present means every row is null. For byte-like
/// columns the bounds are `Datum::Bytea` prefixes and `max == None` with a
/// `min` present means the upper bound is unknown.
#[derive(Debug, Clone, PartialEq, Default, serde::Serialize, serde::Deserialize)]
pub struct ZoneMap {
    pub min: Option<Datum>,
    pub max: Option<Datum>,
    pub null_count: usize,
    pub row_count: usize,
}

impl ZoneMap {
    pub fn all_null(&self) -> bool {
        self.row_count > 0 && self.null_count == self.row_count
    }
}
