//! The delta region: a row-oriented, directly writable heap.
//!
//! `DeltaHeap` is the narrow surface the columnar layer needs from a host
//! row store. `PagedDeltaHeap` is an in-memory implementation with
//! `TUPLES_PER_PAGE` slots per virtual page; slots are appended at the end
//! and freed in place, and a run of free slots at the end can be given back
//! with `truncate_empty_tail`.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::RwLock;

use strata_common::datum::OwnedRow;
use strata_common::error::StorageError;
use strata_common::types::TxnId;

use crate::mvcc::{TupleHeader, TxnLog, TxnStatus};
use crate::row_id::{ItemPointer, TUPLES_PER_PAGE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScanDirection {
    #[default]
    Forward,
    Backward,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeltaTuple {
    pub header: TupleHeader,
    pub row: OwnedRow,
}

/// Resumable position in a delta scan.
#[derive(Debug, Clone, Copy)]
pub struct DeltaCursor {
    direction: ScanDirection,
    /// Next slot to examine; `None` before the first read.
    position: Option<u64>,
    exhausted: bool,
}

impl DeltaCursor {
    pub fn new(direction: ScanDirection) -> Self {
        Self {
            direction,
            position: None,
            exhausted: false,
        }
    }

    pub fn direction(&self) -> ScanDirection {
        self.direction
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }
}

pub trait DeltaHeap: Send + Sync {
    fn insert(&self, header: TupleHeader, row: OwnedRow) -> ItemPointer;

    /// Stamp `xmax` on a tuple. Fails when another live transaction already
    /// deleted it.
    fn delete(&self, ptr: ItemPointer, xid: TxnId, log: &TxnLog) -> Result<(), StorageError>;

    fn fetch(&self, ptr: ItemPointer) -> Option<DeltaTuple>;

    /// Physically remove a tuple (merge and vacuum only).
    fn remove(&self, ptr: ItemPointer) -> Result<DeltaTuple, StorageError>;

    /// Up to `max` occupied slots after the cursor, in cursor direction.
    /// Visibility is the caller's business.
    fn read_chunk(&self, cursor: &mut DeltaCursor, max: usize) -> Vec<(ItemPointer, DeltaTuple)>;

    fn live_tuples(&self) -> usize;

    /// Slots up to the highest one ever used and not truncated.
    fn allocated_slots(&self) -> u64;

    /// Release trailing free slots; returns how many pages were released.
    fn truncate_empty_tail(&self) -> u64;

    fn clear(&self);

    fn pages(&self) -> u64 {
        self.allocated_slots().div_ceil(TUPLES_PER_PAGE)
    }
}

#[derive(Debug, Default)]
pub struct PagedDeltaHeap {
    slots: RwLock<Vec<Option<DeltaTuple>>>,
    live: AtomicUsize,
}

impl PagedDeltaHeap {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DeltaHeap for PagedDeltaHeap {
    fn insert(&self, header: TupleHeader, row: OwnedRow) -> ItemPointer {
        let mut slots = self.slots.write();
        let slot = slots.len() as u64;
        slots.push(Some(DeltaTuple { header, row }));
        self.live.fetch_add(1, Ordering::Relaxed);
        ItemPointer::from_slot(slot)
    }

    fn delete(&self, ptr: ItemPointer, xid: TxnId, log: &TxnLog) -> Result<(), StorageError> {
        let mut slots = self.slots.write();
        let tuple = slots
            .get_mut(ptr.slot() as usize)
            .and_then(Option::as_mut)
            .ok_or(StorageError::TupleNotFound)?;
        if let Some(other) = tuple.header.xmax {
            if other != xid && log.status(other) != TxnStatus::Aborted {
                return Err(StorageError::TupleConcurrentlyModified(other));
            }
        }
        tuple.header.xmax = Some(xid);
        Ok(())
    }

    fn fetch(&self, ptr: ItemPointer) -> Option<DeltaTuple> {
        self.slots.read().get(ptr.slot() as usize).cloned().flatten()
    }

    fn remove(&self, ptr: ItemPointer) -> Result<DeltaTuple, StorageError> {
        let mut slots = self.slots.write();
        let tuple = slots
            .get_mut(ptr.slot() as usize)
            .and_then(Option::take)
            .ok_or(StorageError::TupleNotFound)?;
        self.live.fetch_sub(1, Ordering::Relaxed);
        Ok(tuple)
    }

    fn read_chunk(&self, cursor: &mut DeltaCursor, max: usize) -> Vec<(ItemPointer, DeltaTuple)> {
        let mut out = Vec::new();
        if cursor.exhausted || max == 0 {
            return out;
        }
        let slots = self.slots.read();
        let len = slots.len() as u64;
        match cursor.direction {
            ScanDirection::Forward => {
                let mut pos = cursor.position.unwrap_or(0);
                while pos < len && out.len() < max {
                    if let Some(t) = &slots[pos as usize] {
                        out.push((ItemPointer::from_slot(pos), t.clone()));
                    }
                    pos += 1;
                }
                cursor.position = Some(pos);
                cursor.exhausted = pos >= len;
            }
            ScanDirection::Backward => {
                // `position` is one past the next slot to examine.
                let mut pos = cursor.position.unwrap_or(len).min(len);
                while pos > 0 && out.len() < max {
                    pos -= 1;
                    if let Some(t) = &slots[pos as usize] {
                        out.push((ItemPointer::from_slot(pos), t.clone()));
                    }
                }
                cursor.position = Some(pos);
                cursor.exhausted = pos == 0;
            }
        }
        out
    }

    fn live_tuples(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    fn allocated_slots(&self) -> u64 {
        self.slots.read().len() as u64
    }

    fn truncate_empty_tail(&self) -> u64 {
        let mut slots = self.slots.write();
        let before = (slots.len() as u64).div_ceil(TUPLES_PER_PAGE);
        while matches!(slots.last(), Some(None)) {
            slots.pop();
        }
        let after = (slots.len() as u64).div_ceil(TUPLES_PER_PAGE);
        before - after
    }

    fn clear(&self) {
        self.slots.write().clear();
        self.live.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mvcc::TxnManager;
    use strata_common::datum::Datum;

    fn row(i: i64) -> OwnedRow {
        OwnedRow::new(vec![Datum::Int64(i)])
    }

    fn frozen() -> TupleHeader {
        TupleHeader::inserted_by(TxnId::FROZEN)
    }

    #[test]
    fn test_chunks_in_both_directions() {
        let heap = PagedDeltaHeap::new();
        for i in 0..5 {
            heap.insert(frozen(), row(i));
        }
        heap.remove(ItemPointer::from_slot(2)).unwrap();

        let mut fwd = DeltaCursor::new(ScanDirection::Forward);
        let a: Vec<u64> = heap.read_chunk(&mut fwd, 2).iter().map(|(p, _)| p.slot()).collect();
        let b: Vec<u64> = heap.read_chunk(&mut fwd, 10).iter().map(|(p, _)| p.slot()).collect();
        assert_eq!((a, b), (vec![0, 1], vec![3, 4]));
        assert!(fwd.is_exhausted());

        let mut back = DeltaCursor::new(ScanDirection::Backward);
        let all: Vec<u64> = heap.read_chunk(&mut back, 10).iter().map(|(p, _)| p.slot()).collect();
        assert_eq!(all, vec![4, 3, 1, 0]);
    }

    #[test]
    fn test_concurrent_delete_detected() {
        let mgr = TxnManager::new();
        let log = mgr.log();
        let heap = PagedDeltaHeap::new();
        let p = heap.insert(frozen(), row(1));
        let t1 = mgr.begin();
        let t2 = mgr.begin();
        heap.delete(p, t1, &log).unwrap();
        assert!(matches!(
            heap.delete(p, t2, &log),
            Err(StorageError::TupleConcurrentlyModified(x)) if x == t1
        ));
        mgr.abort(t1);
        heap.delete(p, t2, &log).unwrap();
        assert_eq!(heap.fetch(p).unwrap().header.xmax, Some(t2));
    }

    #[test]
    fn test_truncate_tail_releases_pages() {
        let heap = PagedDeltaHeap::new();
        let n = TUPLES_PER_PAGE * 2 + 1;
        for i in 0..n {
            heap.insert(frozen(), row(i as i64));
        }
        assert_eq!(heap.pages(), 3);
        for slot in (TUPLES_PER_PAGE..n).rev() {
            heap.remove(ItemPointer::from_slot(slot)).unwrap();
        }
        assert_eq!(heap.truncate_empty_tail(), 2);
        assert_eq!(heap.allocated_slots(), TUPLES_PER_PAGE);
        assert_eq!(heap.live_tuples(), TUPLES_PER_PAGE as usize);
    }
}
