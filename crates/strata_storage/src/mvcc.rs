//! Transaction ids, commit log and snapshot visibility for the delta region.
//!
//! Columnar rows carry no per-row transaction stamps: merge only moves rows
//! that are visible to everyone, and deletes of columnar rows go through
//! the delete bitmap.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use strata_common::types::TxnId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnStatus {
    InProgress,
    Committed,
    Aborted,
}

/// Commit log shared by the manager and all snapshots.
#[derive(Debug, Default)]
pub struct TxnLog {
    status: RwLock<HashMap<TxnId, TxnStatus>>,
}

impl TxnLog {
    pub fn status(&self, xid: TxnId) -> TxnStatus {
        if xid == TxnId::FROZEN {
            return TxnStatus::Committed;
        }
        self.status
            .read()
            .get(&xid)
            .copied()
            .unwrap_or(TxnStatus::Aborted)
    }
}

/// Insert/delete stamps of one delta tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TupleHeader {
    pub xmin: TxnId,
    pub xmax: Option<TxnId>,
}

impl TupleHeader {
    pub fn inserted_by(xmin: TxnId) -> Self {
        Self { xmin, xmax: None }
    }
}

/// A point-in-time view: which transactions count as committed.
#[derive(Debug, Clone)]
pub struct Snapshot {
    own: Option<TxnId>,
    /// First xid not yet assigned when the snapshot was taken.
    xmax: TxnId,
    active: Arc<BTreeSet<TxnId>>,
    log: Arc<TxnLog>,
}

impl Snapshot {
    /// A snapshot that sees every committed transaction, used by
    /// housekeeping and by tests.
    pub fn latest(log: Arc<TxnLog>) -> Self {
        Self {
            own: None,
            xmax: TxnId(u64::MAX),
            active: Arc::new(BTreeSet::new()),
            log,
        }
    }

    pub fn own_txn(&self) -> Option<TxnId> {
        self.own
    }

    fn xid_visible(&self, xid: TxnId) -> bool {
        if xid == TxnId::FROZEN || Some(xid) == self.own {
            return true;
        }
        xid < self.xmax
            && !self.active.contains(&xid)
            && self.log.status(xid) == TxnStatus::Committed
    }

    pub fn is_visible(&self, header: &TupleHeader) -> bool {
        self.xid_visible(header.xmin) && !header.xmax.is_some_and(|x| self.xid_visible(x))
    }
}

/// Allocates xids and tracks which are running.
#[derive(Debug)]
pub struct TxnManager {
    next_xid: AtomicU64,
    active: Mutex<BTreeSet<TxnId>>,
    log: Arc<TxnLog>,
}

impl Default for TxnManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TxnManager {
    pub fn new() -> Self {
        Self {
            next_xid: AtomicU64::new(TxnId::FIRST_NORMAL.0),
            active: Mutex::new(BTreeSet::new()),
            log: Arc::new(TxnLog::default()),
        }
    }

    pub fn log(&self) -> Arc<TxnLog> {
        Arc::clone(&self.log)
    }

    pub fn begin(&self) -> TxnId {
        let mut active = self.active.lock();
        let xid = TxnId(self.next_xid.fetch_add(1, Ordering::SeqCst));
        self.log.status.write().insert(xid, TxnStatus::InProgress);
        active.insert(xid);
        xid
    }

    pub fn commit(&self, xid: TxnId) {
        self.finish(xid, TxnStatus::Committed);
    }

    pub fn abort(&self, xid: TxnId) {
        self.finish(xid, TxnStatus::Aborted);
    }

    fn finish(&self, xid: TxnId, status: TxnStatus) {
        let mut active = self.active.lock();
        self.log.status.write().insert(xid, status);
        active.remove(&xid);
    }

    pub fn status(&self, xid: TxnId) -> TxnStatus {
        self.log.status(xid)
    }

    /// Snapshot for `own` (or for a read-only observer when `None`).
    pub fn snapshot(&self, own: Option<TxnId>) -> Snapshot {
        let active = self.active.lock();
        let mut running = active.clone();
        if let Some(x) = own {
            running.remove(&x);
        }
        Snapshot {
            own,
            xmax: TxnId(self.next_xid.load(Ordering::SeqCst)),
            active: Arc::new(running),
            log: Arc::clone(&self.log),
        }
    }

    /// Oldest xid any running or future transaction could still need.
    pub fn oldest_active(&self) -> TxnId {
        let active = self.active.lock();
        active
            .iter()
            .next()
            .copied()
            .unwrap_or(TxnId(self.next_xid.load(Ordering::SeqCst)))
    }

    /// Inserted by a committed transaction older than every running one and
    /// not deleted: every current and future snapshot sees it.
    pub fn is_all_visible(&self, header: &TupleHeader) -> bool {
        header.xmax.is_none() && self.committed_before_horizon(header.xmin)
    }

    /// Deleted (or never validly inserted) as far as every snapshot is concerned.
    pub fn is_dead(&self, header: &TupleHeader) -> bool {
        if self.status(header.xmin) == TxnStatus::Aborted {
            return true;
        }
        header.xmax.is_some_and(|x| self.committed_before_horizon(x))
    }

    fn committed_before_horizon(&self, xid: TxnId) -> bool {
        if xid == TxnId::FROZEN {
            return true;
        }
        self.status(xid) == TxnStatus::Committed && xid < self.oldest_active()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uncommitted_insert_invisible_to_others() {
        let mgr = TxnManager::new();
        let t1 = mgr.begin();
        let h = TupleHeader::inserted_by(t1);
        assert!(mgr.snapshot(Some(t1)).is_visible(&h));
        assert!(!mgr.snapshot(None).is_visible(&h));
        mgr.commit(t1);
        assert!(mgr.snapshot(None).is_visible(&h));
    }

    #[test]
    fn test_snapshot_ignores_later_commits() {
        let mgr = TxnManager::new();
        let t1 = mgr.begin();
        let snap = mgr.snapshot(None);
        mgr.commit(t1);
        assert!(!snap.is_visible(&TupleHeader::inserted_by(t1)));
    }

    #[test]
    fn test_delete_and_abort() {
        let mgr = TxnManager::new();
        let t1 = mgr.begin();
        mgr.commit(t1);
        let t2 = mgr.begin();
        let h = TupleHeader { xmin: t1, xmax: Some(t2) };
        assert!(!mgr.snapshot(Some(t2)).is_visible(&h));
        assert!(mgr.snapshot(None).is_visible(&h));
        mgr.abort(t2);
        assert!(mgr.snapshot(None).is_visible(&h));
        assert!(!mgr.is_dead(&h));
    }

    #[test]
    fn test_all_visible_waits_for_older_running_txns() {
        let mgr = TxnManager::new();
        let old = mgr.begin();
        let t = mgr.begin();
        mgr.commit(t);
        let h = TupleHeader::inserted_by(t);
        assert!(!mgr.is_all_visible(&h));
        mgr.commit(old);
        assert!(mgr.is_all_visible(&h));
        assert!(mgr.is_all_visible(&TupleHeader::inserted_by(TxnId::FROZEN)));
    }
}
