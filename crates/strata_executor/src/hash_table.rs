//! Open-addressing hash table for grouping.
//!
//! Entries live in a dense vector; buckets hold entry indexes and are
//! scanned linearly. The caller supplies the hash and an equality closure
//! comparing a stored entry with the sought key, so the table never sees
//! the key type. Growth and spill are explicit states:
//!
//! ```text
//!   Filling --(budget exceeded)--> Spilling
//! ```
//!
//! In `Filling` a miss inserts; in `Spilling` a miss is reported back so
//! the caller can spill the row. The transition is one-way.

use strata_common::error::ExecutionError;

const EMPTY: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableState {
    Filling,
    Spilling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    Found(usize),
    Inserted(usize),
    /// Miss while spilling: nothing was inserted.
    Missed,
}

pub struct VectorHashTable<E> {
    buckets: Vec<u32>,
    hashes: Vec<u32>,
    entries: Vec<E>,
    fill_factor: f64,
    max_entries: usize,
    state: TableState,
}

impl<E> VectorHashTable<E> {
    pub fn new(initial_buckets: usize, fill_factor: f64) -> Self {
        let n = initial_buckets.max(8).next_power_of_two();
        Self {
            buckets: vec![EMPTY; n],
            hashes: Vec::new(),
            entries: Vec::new(),
            fill_factor,
            max_entries: EMPTY as usize,
            state: TableState::Filling,
        }
    }

    /// Hard cap on entries; inserting past it fails with `HashTableFull`.
    pub fn with_max_entries(mut self, max: usize) -> Self {
        self.max_entries = max.min(EMPTY as usize);
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn state(&self) -> TableState {
        self.state
    }

    pub fn start_spilling(&mut self) {
        self.state = TableState::Spilling;
    }

    pub fn entry(&self, idx: usize) -> &E {
        &self.entries[idx]
    }

    pub fn entry_mut(&mut self, idx: usize) -> &mut E {
        &mut self.entries[idx]
    }

    pub fn entries(&self) -> &[E] {
        &self.entries
    }

    /// Bytes held by the bucket array and hash column.
    pub fn overhead_bytes(&self) -> usize {
        self.buckets.len() * std::mem::size_of::<u32>()
            + self.hashes.len() * std::mem::size_of::<u32>()
    }

    pub fn find(&self, hash: u32, eq: impl Fn(&E) -> bool) -> Option<usize> {
        let mask = self.buckets.len() - 1;
        let mut pos = hash as usize & mask;
        loop {
            let slot = self.buckets[pos];
            if slot == EMPTY {
                return None;
            }
            let idx = slot as usize;
            if self.hashes[idx] == hash && eq(&self.entries[idx]) {
                return Some(idx);
            }
            pos = (pos + 1) & mask;
        }
    }

    pub fn find_or_insert(
        &mut self,
        hash: u32,
        eq: impl Fn(&E) -> bool,
        make: impl FnOnce() -> E,
    ) -> Result<Lookup, ExecutionError> {
        if let Some(idx) = self.find(hash, &eq) {
            return Ok(Lookup::Found(idx));
        }
        if self.state == TableState::Spilling {
            return Ok(Lookup::Missed);
        }
        if self.entries.len() >= self.max_entries {
            return Err(ExecutionError::HashTableFull {
                groups: self.entries.len() + 1,
                limit: self.max_entries,
            });
        }
        if (self.entries.len() + 1) as f64 > self.buckets.len() as f64 * self.fill_factor {
            self.grow();
        }
        let idx = self.entries.len();
        self.entries.push(make());
        self.hashes.push(hash);
        self.place(hash, idx as u32);
        Ok(Lookup::Inserted(idx))
    }

    fn place(&mut self, hash: u32, idx: u32) {
        let mask = self.buckets.len() - 1;
        let mut pos = hash as usize & mask;
        while self.buckets[pos] != EMPTY {
            pos = (pos + 1) & mask;
        }
        self.buckets[pos] = idx;
    }

    fn grow(&mut self) {
        let n = self.buckets.len() * 2;
        self.buckets = vec![EMPTY; n];
        for idx in 0..self.hashes.len() {
            self.place(self.hashes[idx], idx as u32);
        }
        tracing::trace!("grouping hash table grown to {} buckets", n);
    }

    /// Take every entry and reset to an empty, filling table.
    pub fn drain(&mut self) -> Vec<E> {
        self.buckets.iter_mut().for_each(|b| *b = EMPTY);
        self.hashes.clear();
        self.state = TableState::Filling;
        std::mem::take(&mut self.entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_find_and_grow() {
        let mut t: VectorHashTable<(u64, u32)> = VectorHashTable::new(8, 0.75);
        for k in 0..100u64 {
            // force collisions: 4 distinct hashes only
            let h = (k % 4) as u32;
            let p = t.find_or_insert(h, |e| e.0 == k, || (k, 0)).unwrap();
            assert_eq!(p, Lookup::Inserted(k as usize));
        }
        assert_eq!(t.len(), 100);
        assert!(t.bucket_count() >= 128);
        for k in 0..100u64 {
            assert_eq!(t.find((k % 4) as u32, |e| e.0 == k), Some(k as usize));
        }
        assert_eq!(t.find(1, |e| e.0 == 1000), None);
    }

    #[test]
    fn test_spilling_reports_misses() {
        let mut t: VectorHashTable<u64> = VectorHashTable::new(8, 0.5);
        t.find_or_insert(1, |e| *e == 1, || 1).unwrap();
        t.start_spilling();
        assert_eq!(t.find_or_insert(1, |e| *e == 1, || 1).unwrap(), Lookup::Found(0));
        assert_eq!(t.find_or_insert(2, |e| *e == 2, || 2).unwrap(), Lookup::Missed);
        assert_eq!(t.len(), 1);
        let drained = t.drain();
        assert_eq!(drained, vec![1]);
        assert_eq!(t.state(), TableState::Filling);
        assert!(t.find(1, |e| *e == 1).is_none());
    }

    #[test]
    fn test_entry_cap() {
        let mut t: VectorHashTable<u64> = VectorHashTable::new(8, 0.75).with_max_entries(2);
        t.find_or_insert(1, |e| *e == 1, || 1).unwrap();
        t.find_or_insert(2, |e| *e == 2, || 2).unwrap();
        assert!(matches!(
            t.find_or_insert(3, |e| *e == 3, || 3),
            Err(ExecutionError::HashTableFull { groups: 3, limit: 2 })
        ));
    }
}
