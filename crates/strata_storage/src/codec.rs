//! Wire encoding of column vectors.
//!
//! Values stream: one entry per *non-null* row, in row order.
//!   - fixed-width types: little-endian, exactly `element_width` bytes
//!   - variable-width types: `u32` LE byte length, the bytes, zero padding
//!     up to the next 4-byte boundary
//!
//! Null stream: LSB-first bitmap with bit `i` set when row `i` is null.
//! Omitted entirely when no row is null, which marks the column non-null.
//!
//! The values stream is optionally compressed as a whole; the method is
//! recorded in the entry's options document.

use std::io::Cursor;

use serde::{Deserialize, Serialize};

use strata_common::config::{CompressionMethod, ROW_GROUP_CAPACITY};
use strata_common::error::{EncodingError, StorageError};
use strata_common::types::DataType;

use crate::bitmap::Bitmap;
use crate::column_vector::{ColumnData, ColumnStorage, ColumnVector};

/// Bumped whenever the byte layout above changes.
pub const FORMAT_VERSION: u32 = 1;

/// `element_width` recorded for variable-width columns.
pub const VARIABLE_WIDTH: i16 = -1;

const ZSTD_LEVEL: i32 = 3;

/// Options document stored beside each serialized column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnOptions {
    pub compression: CompressionMethod,
    pub format_version: u32,
}

impl ColumnOptions {
    pub fn new(compression: CompressionMethod) -> Self {
        Self {
            compression,
            format_version: FORMAT_VERSION,
        }
    }

    pub fn to_json(&self) -> Result<String, StorageError> {
        serde_json::to_string(self).map_err(|e| StorageError::Serialization(e.to_string()))
    }

    /// An empty document means an uncompressed current-format payload.
    pub fn from_json(doc: &str) -> Result<Self, StorageError> {
        if doc.trim().is_empty() {
            return Ok(Self::new(CompressionMethod::None));
        }
        serde_json::from_str(doc).map_err(|e| StorageError::Serialization(e.to_string()))
    }
}

/// One serialized column, ready to be stored in a catalog entry.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedColumn {
    pub data_type: DataType,
    pub element_width: i16,
    pub row_count: u32,
    pub values: Vec<u8>,
    pub nulls: Option<Vec<u8>>,
    pub options: ColumnOptions,
}

impl EncodedColumn {
    pub fn is_non_null(&self) -> bool {
        self.nulls.is_none()
    }
}

pub fn element_width_of(data_type: DataType) -> i16 {
    data_type
        .fixed_width()
        .map_or(VARIABLE_WIDTH, |w| w as i16)
}

// ---------------------------------------------------------------------------
// Serialize
// ---------------------------------------------------------------------------

pub fn serialize(
    vector: &ColumnVector<'_>,
    compression: CompressionMethod,
) -> Result<EncodedColumn, StorageError> {
    let rows = vector.len();
    let mut raw = Vec::with_capacity(rows * vector.element_width().unwrap_or(8));
    let live = |r: &usize| !vector.is_null(*r);
    match vector.data() {
        ColumnData::Boolean(s) => (0..rows).filter(live).for_each(|r| raw.push(s[r] as u8)),
        ColumnData::Int16(s) => (0..rows)
            .filter(live)
            .for_each(|r| raw.extend_from_slice(&s[r].to_le_bytes())),
        ColumnData::Int32(s) => (0..rows)
            .filter(live)
            .for_each(|r| raw.extend_from_slice(&s[r].to_le_bytes())),
        ColumnData::Int64(s) => (0..rows)
            .filter(live)
            .for_each(|r| raw.extend_from_slice(&s[r].to_le_bytes())),
        ColumnData::Float64(s) => (0..rows)
            .filter(live)
            .for_each(|r| raw.extend_from_slice(&s[r].to_le_bytes())),
        ColumnData::Text(s) => {
            for r in (0..rows).filter(live) {
                put_varlena(&mut raw, s[r].as_bytes())?;
            }
        }
        ColumnData::Bytea(s) => {
            for r in (0..rows).filter(live) {
                put_varlena(&mut raw, &s[r])?;
            }
        }
    }

    let nulls = vector
        .nulls()
        .filter(|n| n.iter().any(|b| *b))
        .map(|n| Bitmap::from_bools(n).to_bytes());

    Ok(EncodedColumn {
        data_type: vector.data_type(),
        element_width: element_width_of(vector.data_type()),
        row_count: rows as u32,
        values: compress(raw, compression)?,
        nulls,
        options: ColumnOptions::new(compression),
    })
}

fn put_varlena(out: &mut Vec<u8>, bytes: &[u8]) -> Result<(), EncodingError> {
    let len = u32::try_from(bytes.len()).map_err(|_| EncodingError::LengthOverflow {
        declared: bytes.len(),
        available: u32::MAX as usize,
    })?;
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(bytes);
    let pad = (4 - bytes.len() % 4) % 4;
    out.extend(std::iter::repeat(0u8).take(pad));
    Ok(())
}

fn compress(raw: Vec<u8>, method: CompressionMethod) -> Result<Vec<u8>, StorageError> {
    match method {
        CompressionMethod::None => Ok(raw),
        CompressionMethod::Fast => Ok(lz4_flex::compress_prepend_size(&raw)),
        CompressionMethod::Generic => zstd::stream::encode_all(Cursor::new(&raw), ZSTD_LEVEL)
            .map_err(|e| StorageError::Compression(e.to_string())),
    }
}

fn decompress(payload: &[u8], method: CompressionMethod) -> Result<Vec<u8>, StorageError> {
    match method {
        CompressionMethod::None => Ok(payload.to_vec()),
        CompressionMethod::Fast => lz4_flex::decompress_size_prepended(payload)
            .map_err(|e| StorageError::Compression(e.to_string())),
        CompressionMethod::Generic => zstd::stream::decode_all(Cursor::new(payload))
            .map_err(|e| StorageError::Compression(e.to_string())),
    }
}

// ---------------------------------------------------------------------------
// Fill (decode)
// ---------------------------------------------------------------------------

struct Reader<'b> {
    buf: &'b [u8],
    pos: usize,
}

impl<'b> Reader<'b> {
    fn take(&mut self, n: usize) -> Result<&'b [u8], EncodingError> {
        let remaining = self.buf.len() - self.pos;
        if n > remaining {
            return Err(EncodingError::Truncated {
                expected: n - remaining,
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn fixed<const N: usize>(&mut self) -> Result<[u8; N], EncodingError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn varlena(&mut self) -> Result<&'b [u8], EncodingError> {
        let len = u32::from_le_bytes(self.fixed::<4>()?) as usize;
        let available = self.buf.len() - self.pos;
        if len > available {
            return Err(EncodingError::LengthOverflow {
                declared: len,
                available,
            });
        }
        let bytes = self.take(len)?;
        let pad = (4 - len % 4) % 4;
        self.take(pad.min(self.buf.len() - self.pos))?;
        Ok(bytes)
    }
}

/// Decode an encoded column into an owned vector of `row_count` rows.
/// Batches read it through reference views (see `ColumnVector::slice`).
pub fn fill(encoded: &EncodedColumn) -> Result<ColumnVector<'static>, StorageError> {
    let data_type = encoded.data_type;
    let expected_width = element_width_of(data_type);
    if encoded.element_width != expected_width {
        return Err(EncodingError::UnsupportedWidth {
            data_type,
            width: encoded.element_width.max(0) as usize,
        }
        .into());
    }

    let rows = encoded.row_count as usize;
    if rows > ROW_GROUP_CAPACITY {
        return Err(EncodingError::TooManyRows {
            rows,
            capacity: ROW_GROUP_CAPACITY,
        }
        .into());
    }
    let nulls = match &encoded.nulls {
        Some(bytes) => Some(
            Bitmap::from_bytes(bytes, rows)
                .ok_or(EncodingError::LengthOverflow {
                    declared: rows.div_ceil(8),
                    available: bytes.len(),
                })?
                .to_bools(),
        ),
        None => None,
    };
    let is_null = |r: usize| nulls.as_ref().is_some_and(|n| n[r]);

    let raw = decompress(&encoded.values, encoded.options.compression)?;
    // every live row needs at least its fixed width, or a varlena header
    let live = rows - nulls.as_ref().map_or(0, |n| n.iter().filter(|b| **b).count());
    let entry = if expected_width > 0 { expected_width as usize } else { 4 };
    let min_bytes = live * entry;
    if raw.len() < min_bytes {
        return Err(EncodingError::Truncated {
            expected: min_bytes - raw.len(),
        }
        .into());
    }
    let mut rd = Reader { buf: &raw, pos: 0 };

    macro_rules! decode_fixed {
        ($variant:ident, $t:ty, $n:literal) => {{
            let out: Vec<$t> = if nulls.is_none() {
                // dense payload: convert the whole buffer in one pass
                rd.take(rows * $n)?
                    .chunks_exact($n)
                    .map(|c| {
                        let mut b = [0u8; $n];
                        b.copy_from_slice(c);
                        <$t>::from_le_bytes(b)
                    })
                    .collect()
            } else {
                let mut out = Vec::with_capacity(rows);
                for r in 0..rows {
                    if is_null(r) {
                        out.push(<$t>::default());
                    } else {
                        out.push(<$t>::from_le_bytes(rd.fixed::<$n>()?));
                    }
                }
                out
            };
            ColumnData::$variant(ColumnStorage::Owned(out))
        }};
    }

    let data = match data_type {
        DataType::Boolean => {
            let mut out = Vec::with_capacity(rows);
            for r in 0..rows {
                out.push(!is_null(r) && rd.fixed::<1>()?[0] != 0);
            }
            ColumnData::Boolean(ColumnStorage::Owned(out))
        }
        DataType::Int16 => decode_fixed!(Int16, i16, 2),
        DataType::Int32 | DataType::Date => decode_fixed!(Int32, i32, 4),
        DataType::Int64 | DataType::Timestamp => decode_fixed!(Int64, i64, 8),
        DataType::Float64 => decode_fixed!(Float64, f64, 8),
        DataType::Text => {
            let mut out = Vec::with_capacity(rows);
            for r in 0..rows {
                if is_null(r) {
                    out.push(String::new());
                } else {
                    let bytes = rd.varlena()?;
                    let s = std::str::from_utf8(bytes).map_err(|_| EncodingError::InvalidUtf8)?;
                    out.push(s.to_owned());
                }
            }
            ColumnData::Text(ColumnStorage::Owned(out))
        }
        DataType::Bytea => {
            let mut out = Vec::with_capacity(rows);
            for r in 0..rows {
                if is_null(r) {
                    out.push(Vec::new());
                } else {
                    out.push(rd.varlena()?.to_vec());
                }
            }
            ColumnData::Bytea(ColumnStorage::Owned(out))
        }
    };

    if rd.pos != raw.len() {
        return Err(EncodingError::LengthOverflow {
            declared: raw.len(),
            available: rd.pos,
        }
        .into());
    }

    Ok(ColumnVector::from_parts(
        data_type,
        data,
        nulls.map(ColumnStorage::Owned),
    )?)
}

/// Reference view straight over a stored values stream, for columns that
/// need no decoding: fixed width, uncompressed, without nulls, and laid out
/// at the element's alignment on a little-endian target. `None` means the
/// column has to go through [`fill`].
pub fn view_in_place<'b>(
    data_type: DataType,
    element_width: i16,
    row_count: usize,
    values: &'b [u8],
    has_nulls: bool,
    compression: CompressionMethod,
) -> Option<ColumnVector<'b>> {
    if has_nulls || compression != CompressionMethod::None || element_width != element_width_of(data_type) {
        return None;
    }
    let data = match data_type {
        DataType::Int16 => ColumnData::Int16(ColumnStorage::Borrowed(reinterpret(values, row_count)?)),
        DataType::Int32 | DataType::Date => {
            ColumnData::Int32(ColumnStorage::Borrowed(reinterpret(values, row_count)?))
        }
        DataType::Int64 | DataType::Timestamp => {
            ColumnData::Int64(ColumnStorage::Borrowed(reinterpret(values, row_count)?))
        }
        DataType::Float64 => ColumnData::Float64(ColumnStorage::Borrowed(reinterpret(values, row_count)?)),
        DataType::Boolean | DataType::Text | DataType::Bytea => return None,
    };
    ColumnVector::from_parts(data_type, data, None).ok()
}

/// Marker for element types every bit pattern of which is a valid value.
trait PlainElement: Copy {}

impl PlainElement for i16 {}
impl PlainElement for i32 {}
impl PlainElement for i64 {}
impl PlainElement for f64 {}

fn reinterpret<T: PlainElement>(bytes: &[u8], rows: usize) -> Option<&[T]> {
    if cfg!(target_endian = "big") {
        return None;
    }
    // SAFETY: `T` is a plain integer or float, valid for any bit pattern;
    // `align_to` only hands out the correctly aligned middle part.
    let (head, body, tail) = unsafe { bytes.align_to::<T>() };
    (head.is_empty() && tail.is_empty() && body.len() == rows).then_some(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use strata_common::datum::Datum;

    fn roundtrip(data_type: DataType, values: &[Datum], method: CompressionMethod) -> Vec<Datum> {
        let v = ColumnVector::from_datums(data_type, values).unwrap();
        let enc = serialize(&v, method).unwrap();
        let back = fill(&enc).unwrap();
        (0..back.len()).map(|r| back.get(r)).collect()
    }

    #[test]
    fn test_non_null_column_omits_null_stream() {
        let v = ColumnVector::from_datums(DataType::Int32, &[Datum::Int32(1), Datum::Int32(2)])
            .unwrap();
        let enc = serialize(&v, CompressionMethod::None).unwrap();
        assert!(enc.is_non_null());
        assert_eq!(enc.values.len(), 8);
        assert!(fill(&enc).unwrap().is_non_null());
    }

    #[test]
    fn test_nulls_are_skipped_in_values_stream() {
        let vals = [Datum::Int64(7), Datum::Null, Datum::Int64(9)];
        let v = ColumnVector::from_datums(DataType::Int64, &vals).unwrap();
        let enc = serialize(&v, CompressionMethod::None).unwrap();
        assert_eq!(enc.values.len(), 16);
        assert_eq!(enc.nulls.as_deref(), Some(&[0b010u8][..]));
        assert_eq!(roundtrip(DataType::Int64, &vals, CompressionMethod::None), vals);
    }

    #[test]
    fn test_varlena_padding() {
        let v = ColumnVector::from_datums(DataType::Text, &[Datum::Text("abcde".into())]).unwrap();
        let enc = serialize(&v, CompressionMethod::None).unwrap();
        // 4-byte length + 5 bytes + 3 padding
        assert_eq!(enc.values.len(), 12);
        assert_eq!(enc.element_width, VARIABLE_WIDTH);
    }

    #[test]
    fn test_compressed_payloads_decode() {
        let vals: Vec<Datum> = (0..500).map(|i| Datum::Text(format!("row-{}", i % 7))).collect();
        for method in [CompressionMethod::Fast, CompressionMethod::Generic] {
            assert_eq!(roundtrip(DataType::Text, &vals, method), vals);
        }
    }

    #[test]
    fn test_wrong_width_is_rejected() {
        let v = ColumnVector::from_datums(DataType::Int32, &[Datum::Int32(1)]).unwrap();
        let mut enc = serialize(&v, CompressionMethod::None).unwrap();
        enc.element_width = 8;
        assert!(matches!(
            fill(&enc),
            Err(StorageError::Encoding(EncodingError::UnsupportedWidth { width: 8, .. }))
        ));
    }

    #[test]
    fn test_overlong_length_prefix_is_rejected() {
        let v = ColumnVector::from_datums(DataType::Bytea, &[Datum::Bytea(vec![1, 2, 3, 4])])
            .unwrap();
        let mut enc = serialize(&v, CompressionMethod::None).unwrap();
        enc.values[0] = 200;
        assert!(matches!(
            fill(&enc),
            Err(StorageError::Encoding(EncodingError::LengthOverflow { declared: 200, .. }))
        ));
    }

    #[test]
    fn test_truncated_fixed_payload_is_rejected() {
        let v = ColumnVector::from_datums(DataType::Int64, &[Datum::Int64(1), Datum::Int64(2)])
            .unwrap();
        let mut enc = serialize(&v, CompressionMethod::None).unwrap();
        enc.values.truncate(12);
        assert!(matches!(
            fill(&enc),
            Err(StorageError::Encoding(EncodingError::Truncated { expected: 4 }))
        ));
    }

    #[test]
    fn test_options_document() {
        let opts = ColumnOptions::new(CompressionMethod::Fast);
        let doc = opts.to_json().unwrap();
        assert!(doc.contains("\"fast\""));
        assert_eq!(ColumnOptions::from_json(&doc).unwrap(), opts);
        assert_eq!(
            ColumnOptions::from_json("").unwrap().compression,
            CompressionMethod::None
        );
    }

    #[test]
    fn test_oversized_row_count_is_rejected() {
        let v = ColumnVector::from_datums(DataType::Int64, &[Datum::Int64(1), Datum::Int64(2)])
            .unwrap();
        let mut enc = serialize(&v, CompressionMethod::None).unwrap();
        enc.row_count = u32::MAX;
        assert!(matches!(
            fill(&enc),
            Err(StorageError::Encoding(EncodingError::TooManyRows { .. }))
        ));
        // within the group limit but far beyond what the payload holds
        enc.row_count = 60_000;
        assert!(matches!(
            fill(&enc),
            Err(StorageError::Encoding(EncodingError::Truncated { expected })) if expected == 60_000 * 8 - 16
        ));
    }

    /// `payload` copied to an offset of `buf` that is `misalign` bytes past
    /// an 8-byte boundary.
    fn placed(buf: &mut Vec<u8>, payload: &[u8], misalign: usize) -> std::ops::Range<usize> {
        buf.clear();
        buf.resize(payload.len() + 16, 0);
        let start = buf.as_ptr().align_offset(8) + misalign;
        buf[start..start + payload.len()].copy_from_slice(payload);
        start..start + payload.len()
    }

    #[test]
    fn test_dense_fixed_column_viewed_in_place() {
        let vals: Vec<Datum> = (0..6).map(|i| Datum::Float64(i as f64 - 2.5)).collect();
        let v = ColumnVector::from_datums(DataType::Float64, &vals).unwrap();
        let enc = serialize(&v, CompressionMethod::None).unwrap();
        let mut buf = Vec::new();
        let range = placed(&mut buf, &enc.values, 0);
        let bytes = &buf[range];
        let view = view_in_place(DataType::Float64, enc.element_width, 6, bytes, false, CompressionMethod::None)
            .unwrap();
        assert!(view.is_reference());
        assert_eq!((0..6).map(|r| view.get(r)).collect::<Vec<_>>(), vals);
        let ColumnData::Float64(s) = view.data() else {
            panic!("float column viewed as {:?}", view.data_type());
        };
        assert_eq!(s.as_slice().as_ptr() as usize, bytes.as_ptr() as usize);
    }

    #[test]
    fn test_in_place_view_declines_what_needs_decoding() {
        let ints = ColumnVector::from_datums(DataType::Int64, &[Datum::Int64(1), Datum::Int64(2)]).unwrap();
        let enc = serialize(&ints, CompressionMethod::None).unwrap();
        let mut buf = Vec::new();
        let aligned = placed(&mut buf, &enc.values, 0);
        let view = |bytes: &[u8], nulls: bool, method: CompressionMethod, rows: usize| {
            view_in_place(DataType::Int64, 8, rows, bytes, nulls, method).is_some()
        };
        assert!(view(&buf[aligned.clone()], false, CompressionMethod::None, 2));
        assert!(!view(&buf[aligned.clone()], true, CompressionMethod::None, 2));
        assert!(!view(&buf[aligned.clone()], false, CompressionMethod::Fast, 2));
        assert!(!view(&buf[aligned], false, CompressionMethod::None, 3));
        let shifted = placed(&mut buf, &enc.values, 1);
        assert!(!view(&buf[shifted], false, CompressionMethod::None, 2));
        assert!(view_in_place(DataType::Text, VARIABLE_WIDTH, 0, &[], false, CompressionMethod::None).is_none());
    }

    const ALL_TYPES: [DataType; 9] = [
        DataType::Boolean,
        DataType::Int16,
        DataType::Int32,
        DataType::Int64,
        DataType::Float64,
        DataType::Date,
        DataType::Timestamp,
        DataType::Text,
        DataType::Bytea,
    ];

    const ALL_METHODS: [CompressionMethod; 3] = [
        CompressionMethod::None,
        CompressionMethod::Fast,
        CompressionMethod::Generic,
    ];

    fn value_of(data_type: DataType) -> BoxedStrategy<Datum> {
        let value = match data_type {
            DataType::Boolean => any::<bool>().prop_map(Datum::Boolean).boxed(),
            DataType::Int16 => any::<i16>().prop_map(Datum::Int16).boxed(),
            DataType::Int32 => any::<i32>().prop_map(Datum::Int32).boxed(),
            DataType::Int64 => any::<i64>().prop_map(Datum::Int64).boxed(),
            DataType::Float64 => prop_oneof![
                any::<f64>(),
                Just(f64::NAN),
                Just(-0.0),
                Just(f64::NEG_INFINITY),
            ]
            .prop_map(Datum::Float64)
            .boxed(),
            DataType::Date => any::<i32>().prop_map(Datum::Date).boxed(),
            DataType::Timestamp => any::<i64>().prop_map(Datum::Timestamp).boxed(),
            DataType::Text => ".{0,24}".prop_map(Datum::Text).boxed(),
            DataType::Bytea => proptest::collection::vec(any::<u8>(), 0..40)
                .prop_map(Datum::Bytea)
                .boxed(),
        };
        prop_oneof![1 => Just(Datum::Null), 4 => value].boxed()
    }

    fn typed_column() -> impl Strategy<Value = (DataType, Vec<Datum>)> {
        proptest::sample::select(ALL_TYPES.to_vec())
            .prop_flat_map(|t| (Just(t), proptest::collection::vec(value_of(t), 0..150)))
    }

    /// Floats compared by bit pattern, so NaN payloads and -0.0 must survive.
    fn exact(values: &[Datum]) -> Vec<Datum> {
        values
            .iter()
            .map(|d| match d {
                Datum::Float64(f) => Datum::Int64(f.to_bits() as i64),
                other => other.clone(),
            })
            .collect()
    }

    proptest! {
        #[test]
        fn prop_every_type_roundtrips_under_every_method(
            (data_type, vals) in typed_column(),
            method in proptest::sample::select(ALL_METHODS.to_vec()),
        ) {
            let back = roundtrip(data_type, &vals, method);
            prop_assert_eq!(exact(&back), exact(&vals));
            let v = ColumnVector::from_datums(data_type, &vals).unwrap();
            let enc = serialize(&v, method).unwrap();
            prop_assert_eq!(enc.is_non_null(), vals.iter().all(|d| !d.is_null()));
        }
    }
}
