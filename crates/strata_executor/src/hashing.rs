//! Row hashing for grouping.
//!
//! A row's hash folds its grouping columns in a fixed order:
//! `hash = murmur32(rotl1(hash) ^ column_hash)`, with one extra avalanche
//! right after the first column. A NULL value and a skipped row both
//! contribute 0. In-memory lookups and spill partitioning both read this
//! hash, so it must not change between passes.

use xxhash_rust::xxh3::xxh3_64_with_seed;

use strata_common::datum::{canonical_f64_bits, Datum};
use strata_storage::batch::Batch;
use strata_storage::column_vector::ColumnData;

/// murmur3 32-bit finalizer.
#[inline]
pub fn murmur32(mut h: u32) -> u32 {
    h ^= h >> 16;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2_ae35);
    h ^= h >> 16;
    h
}

#[inline]
pub fn combine(running: u32, column_hash: u32) -> u32 {
    murmur32(running.rotate_left(1) ^ column_hash)
}

/// Fold one column into a running hash; `first` marks the first column.
#[inline]
pub fn fold(running: u32, column_hash: u32, first: bool) -> u32 {
    let h = combine(running, column_hash);
    if first {
        murmur32(h)
    } else {
        h
    }
}

const TAG_BOOL: u8 = 1;
const TAG_INT: u8 = 2;
const TAG_FLOAT: u8 = 3;
const TAG_DATE: u8 = 4;
const TAG_TIMESTAMP: u8 = 5;
const TAG_TEXT: u8 = 6;
const TAG_BYTEA: u8 = 7;

#[inline]
fn tagged(tag: u8, payload: &[u8]) -> u32 {
    xxh3_64_with_seed(payload, tag as u64) as u32
}

#[inline]
pub fn hash_int(v: i64) -> u32 {
    tagged(TAG_INT, &v.to_le_bytes())
}

/// Every NaN hashes alike, and -0.0 hashes as 0.0.
#[inline]
pub fn hash_float(v: f64) -> u32 {
    tagged(TAG_FLOAT, &canonical_f64_bits(v).to_le_bytes())
}

#[inline]
pub fn hash_bool(v: bool) -> u32 {
    tagged(TAG_BOOL, &[v as u8])
}

/// Hash of one value; integer widths hash alike, as they compare equal.
pub fn hash_datum(d: &Datum) -> u32 {
    match d {
        Datum::Null => 0,
        Datum::Boolean(b) => hash_bool(*b),
        Datum::Int16(v) => hash_int(*v as i64),
        Datum::Int32(v) => hash_int(*v as i64),
        Datum::Int64(v) => hash_int(*v),
        Datum::Float64(v) => hash_float(*v),
        Datum::Date(v) => tagged(TAG_DATE, &v.to_le_bytes()),
        Datum::Timestamp(v) => tagged(TAG_TIMESTAMP, &v.to_le_bytes()),
        Datum::Text(s) => tagged(TAG_TEXT, s.as_bytes()),
        Datum::Bytea(b) => tagged(TAG_BYTEA, b),
    }
}

/// Hash of a key given as values, equal to what [`hash_batch_keys`] yields
/// for a batch row holding the same values.
pub fn hash_values<'v>(values: impl IntoIterator<Item = &'v Datum>) -> u32 {
    values
        .into_iter()
        .enumerate()
        .fold(0, |h, (i, d)| fold(h, hash_datum(d), i == 0))
}

/// Hash the key columns of every batch row into `out` (resized to `dim`).
/// Skipped rows hash to 0. Integer, float, text and byte columns take a
/// direct path over the column slice.
pub fn hash_batch_keys(batch: &Batch<'_>, key_columns: &[usize], out: &mut Vec<u32>) {
    out.clear();
    out.resize(batch.dim(), 0);
    let skip = batch.skip();
    for (i, &col_idx) in key_columns.iter().enumerate() {
        let first = i == 0;
        let Some(col) = batch.column(col_idx) else {
            // unprojected column reads as NULL
            for (r, h) in out.iter_mut().enumerate() {
                if !skip[r] {
                    *h = fold(*h, 0, first);
                }
            }
            continue;
        };
        let nulls = col.nulls();
        let is_null = |r: usize| nulls.is_some_and(|n| n[r]);
        match col.data() {
            ColumnData::Int64(v) if col.data_type() == strata_common::types::DataType::Int64 => {
                for (r, h) in out.iter_mut().enumerate() {
                    if !skip[r] {
                        let ch = if is_null(r) { 0 } else { hash_int(v[r]) };
                        *h = fold(*h, ch, first);
                    }
                }
            }
            ColumnData::Int32(v) if col.data_type() == strata_common::types::DataType::Int32 => {
                for (r, h) in out.iter_mut().enumerate() {
                    if !skip[r] {
                        let ch = if is_null(r) { 0 } else { hash_int(v[r] as i64) };
                        *h = fold(*h, ch, first);
                    }
                }
            }
            ColumnData::Float64(v) => {
                for (r, h) in out.iter_mut().enumerate() {
                    if !skip[r] {
                        let ch = if is_null(r) { 0 } else { hash_float(v[r]) };
                        *h = fold(*h, ch, first);
                    }
                }
            }
            ColumnData::Text(v) => {
                for (r, h) in out.iter_mut().enumerate() {
                    if !skip[r] {
                        let ch = if is_null(r) { 0 } else { tagged(TAG_TEXT, v[r].as_bytes()) };
                        *h = fold(*h, ch, first);
                    }
                }
            }
            ColumnData::Bytea(v) => {
                for (r, h) in out.iter_mut().enumerate() {
                    if !skip[r] {
                        let ch = if is_null(r) { 0 } else { tagged(TAG_BYTEA, &v[r]) };
                        *h = fold(*h, ch, first);
                    }
                }
            }
            _ => {
                for (r, h) in out.iter_mut().enumerate() {
                    if !skip[r] {
                        *h = fold(*h, hash_datum(&col.get(r)), first);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_common::datum::OwnedRow;
    use strata_common::types::DataType;
    use strata_storage::row_id::RowId;

    #[test]
    fn test_murmur_mixes() {
        assert_eq!(murmur32(0), 0);
        assert_ne!(murmur32(1), 1);
        assert_ne!(combine(0, 1), combine(0, 2));
    }

    #[test]
    fn test_integer_widths_hash_alike() {
        assert_eq!(hash_datum(&Datum::Int32(7)), hash_datum(&Datum::Int64(7)));
        assert_ne!(hash_datum(&Datum::Int64(7)), hash_datum(&Datum::Text("7".into())));
        assert_eq!(hash_datum(&Datum::Null), 0);
    }

    #[test]
    fn test_order_matters() {
        let a = [Datum::Int64(1), Datum::Int64(2)];
        let b = [Datum::Int64(2), Datum::Int64(1)];
        assert_ne!(hash_values(&a), hash_values(&b));
    }

    #[test]
    fn test_batch_hash_matches_value_hash() {
        let mut batch = Batch::with_types(
            &[Some(DataType::Int64), Some(DataType::Text), Some(DataType::Float64), Some(DataType::Bytea)],
            4,
        );
        let rows = [
            vec![Datum::Int64(1), Datum::Text("a".into()), Datum::Float64(0.5), Datum::Bytea(vec![7])],
            vec![Datum::Null, Datum::Text("b".into()), Datum::Null, Datum::Null],
            vec![Datum::Int64(3), Datum::Null, Datum::Float64(2.0), Datum::Bytea(vec![])],
        ];
        for (i, r) in rows.iter().enumerate() {
            batch.push_row(RowId(i as u64), &OwnedRow::new(r.clone())).unwrap();
        }
        batch.skip_mut()[2] = true;
        let mut out = Vec::new();
        hash_batch_keys(&batch, &[2, 0, 1, 3], &mut out);
        for r in 0..2 {
            let key = [rows[r][2].clone(), rows[r][0].clone(), rows[r][1].clone(), rows[r][3].clone()];
            assert_eq!(out[r], hash_values(&key));
        }
        assert_eq!(out[2], 0);
    }

    #[test]
    fn test_equal_floats_hash_alike() {
        assert_eq!(hash_float(-0.0), hash_float(0.0));
        assert_eq!(hash_float(f64::NAN), hash_float(-f64::NAN));
        assert_eq!(hash_float(f64::NAN), hash_float(f64::from_bits(0x7ff8_0000_0000_00ff)));
        assert_ne!(hash_float(1.0), hash_float(-1.0));

        let mut batch = Batch::with_types(&[Some(DataType::Float64)], 2);
        batch.push_row(RowId(0), &OwnedRow::new(vec![Datum::Float64(-0.0)])).unwrap();
        batch.push_row(RowId(1), &OwnedRow::new(vec![Datum::Float64(0.0)])).unwrap();
        let mut out = Vec::new();
        hash_batch_keys(&batch, &[0], &mut out);
        assert_eq!(out[0], out[1]);
    }
}
