use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;

use parking_lot::RwLock;

use strata_common::datum::{Datum, OwnedRow};

use crate::row_id::RowId;

/// A secondary index over a fixed list of key columns. Entries map key
/// values to row identifiers of either region; merge re-points them when
/// rows move from the delta region into a row group.
pub trait SecondaryIndex: Send + Sync {
    fn name(&self) -> &str;

    /// Ordinals of the indexed columns.
    fn key_columns(&self) -> &[usize];

    fn insert(&self, key: Vec<Datum>, row_id: RowId);

    /// Remove one mapping; returns whether it existed.
    fn remove(&self, key: &[Datum], row_id: RowId) -> bool;

    fn lookup(&self, key: &[Datum]) -> Vec<RowId>;

    /// All row ids whose key falls within the bounds, in key order.
    fn range_scan(&self, start: Bound<&[Datum]>, end: Bound<&[Datum]>) -> Vec<RowId>;

    /// Number of (key, row id) mappings.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn clear(&self);

    fn key_of(&self, row: &OwnedRow) -> Vec<Datum> {
        self.key_columns()
            .iter()
            .map(|&c| row.get(c).cloned().unwrap_or(Datum::Null))
            .collect()
    }
}

/// `BTreeMap`-based index.
#[derive(Debug)]
pub struct BTreeSecondaryIndex {
    name: String,
    columns: Vec<usize>,
    map: RwLock<BTreeMap<Vec<Datum>, BTreeSet<RowId>>>,
}

impl BTreeSecondaryIndex {
    pub fn new(name: impl Into<String>, columns: Vec<usize>) -> Self {
        Self {
            name: name.into(),
            columns,
            map: RwLock::new(BTreeMap::new()),
        }
    }
}

impl SecondaryIndex for BTreeSecondaryIndex {
    fn name(&self) -> &str {
        &self.name
    }

    fn key_columns(&self) -> &[usize] {
        &self.columns
    }

    fn insert(&self, key: Vec<Datum>, row_id: RowId) {
        self.map.write().entry(key).or_default().insert(row_id);
    }

    fn remove(&self, key: &[Datum], row_id: RowId) -> bool {
        let mut map = self.map.write();
        let Some(set) = map.get_mut(key) else {
            return false;
        };
        let removed = set.remove(&row_id);
        if set.is_empty() {
            map.remove(key);
        }
        removed
    }

    fn lookup(&self, key: &[Datum]) -> Vec<RowId> {
        self.map
            .read()
            .get(key)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    fn range_scan(&self, start: Bound<&[Datum]>, end: Bound<&[Datum]>) -> Vec<RowId> {
        let map = self.map.read();
        map.range::<[Datum], _>((start, end))
            .flat_map(|(_, ids)| ids.iter().copied())
            .collect()
    }

    fn len(&self) -> usize {
        self.map.read().values().map(BTreeSet::len).sum()
    }

    fn clear(&self) {
        self.map.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_and_remove() {
        let idx = BTreeSecondaryIndex::new("k_idx", vec![0]);
        idx.insert(vec![Datum::Int64(5)], RowId(1));
        idx.insert(vec![Datum::Int64(5)], RowId(2));
        assert_eq!(idx.lookup(&[Datum::Int64(5)]), vec![RowId(1), RowId(2)]);
        assert!(idx.remove(&[Datum::Int64(5)], RowId(1)));
        assert!(!idx.remove(&[Datum::Int64(5)], RowId(1)));
        assert_eq!(idx.len(), 1);
    }

    #[test]
    fn test_range_scan() {
        let idx = BTreeSecondaryIndex::new("k_idx", vec![0]);
        for i in 0..10 {
            idx.insert(vec![Datum::Int64(i)], RowId(i as u64));
        }
        let lo = [Datum::Int64(3)];
        let hi = [Datum::Int64(6)];
        let ids = idx.range_scan(Bound::Included(&lo[..]), Bound::Excluded(&hi[..]));
        assert_eq!(ids, vec![RowId(3), RowId(4), RowId(5)]);
    }
}
