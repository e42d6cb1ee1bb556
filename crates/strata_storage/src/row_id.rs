//! Row identifiers shared by the delta region and the columnar region.
//!
//! Both regions live in one 48-bit space. Delta rows are addressed like heap
//! item pointers (block, offset) and count forward from zero up
//! to `delta_limit`; columnar rows count backward from `RowId::MAX`. The
//! origin of an id is decided by range membership alone.

use std::fmt;

use serde::{Deserialize, Serialize};

use strata_common::error::StorageError;

/// Tuple slots per delta page.
pub const TUPLES_PER_PAGE: u64 = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RowId(pub u64);

impl RowId {
    pub const MAX: RowId = RowId((1 << 48) - 1);
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#014x}", self.0)
    }
}

/// Physical location of a delta tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemPointer {
    pub block: u32,
    pub offset: u16,
}

impl ItemPointer {
    pub fn from_slot(slot: u64) -> Self {
        Self {
            block: (slot / TUPLES_PER_PAGE) as u32,
            offset: (slot % TUPLES_PER_PAGE) as u16,
        }
    }

    /// Linear slot number within the delta heap.
    pub fn slot(&self) -> u64 {
        self.block as u64 * TUPLES_PER_PAGE + self.offset as u64
    }
}

/// Where a row identifier points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowOrigin {
    Delta(ItemPointer),
    Columnar { row_group_id: u64, row_offset: u32 },
}

/// Addressing parameters of one table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowIdSpace {
    delta_limit: u64,
    capacity: u64,
}

impl RowIdSpace {
    pub fn new(delta_limit: u64, capacity: usize) -> Self {
        Self {
            delta_limit: delta_limit.min(RowId::MAX.0),
            capacity: capacity.max(1) as u64,
        }
    }

    pub fn delta_limit(&self) -> u64 {
        self.delta_limit
    }

    /// Largest row-group id whose every row still fits above the delta range.
    pub fn max_row_group_id(&self) -> u64 {
        RowId::MAX
            .0
            .saturating_sub(self.delta_limit)
            .saturating_sub(self.capacity - 1)
            / self.capacity
    }

    pub fn delta(&self, ptr: ItemPointer) -> Result<RowId, StorageError> {
        let slot = ptr.slot();
        if slot >= self.delta_limit {
            return Err(StorageError::RowIdOutOfRange(slot));
        }
        Ok(RowId(slot))
    }

    pub fn columnar(&self, row_group_id: u64, row_offset: u32) -> Result<RowId, StorageError> {
        if row_offset as u64 >= self.capacity {
            return Err(StorageError::RowIdOutOfRange(row_offset as u64));
        }
        let linear = row_group_id
            .checked_mul(self.capacity)
            .and_then(|v| v.checked_add(row_offset as u64))
            .filter(|v| *v <= RowId::MAX.0)
            .ok_or(StorageError::RowIdOutOfRange(row_group_id))?;
        let id = RowId::MAX.0 - linear;
        if id < self.delta_limit {
            return Err(StorageError::RowIdOutOfRange(id));
        }
        Ok(RowId(id))
    }

    pub fn decode(&self, id: RowId) -> Result<RowOrigin, StorageError> {
        if id > RowId::MAX {
            return Err(StorageError::RowIdOutOfRange(id.0));
        }
        if id.0 < self.delta_limit {
            return Ok(RowOrigin::Delta(ItemPointer::from_slot(id.0)));
        }
        let linear = RowId::MAX.0 - id.0;
        Ok(RowOrigin::Columnar {
            row_group_id: linear / self.capacity,
            row_offset: (linear % self.capacity) as u32,
        })
    }

    pub fn is_columnar(&self, id: RowId) -> bool {
        id.0 >= self.delta_limit && id <= RowId::MAX
    }
}
