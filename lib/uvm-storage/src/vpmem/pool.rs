// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Placement of mapped layers within one VPMEM device.

use std::collections::BTreeMap;

use thiserror::Error;

/// Granularity of VPMEM mappings.
pub const PAGE_SIZE: u64 = 0x1000;

#[derive(Debug, Error, Eq, PartialEq)]
pub enum PoolError {
    #[error("region length must be non-zero")]
    BadLength,
    #[error("no free region of {0} bytes")]
    Exhausted(u64),
    #[error("no region allocated at offset {0:#x}")]
    NotFound(u64),
}

/// Round `len` up to the next page boundary.
pub fn page_align(len: u64) -> Option<u64> {
    len.checked_add(PAGE_SIZE - 1).map(|l| l & !(PAGE_SIZE - 1))
}

/// A region handed out by [RegionPool::allocate].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Region {
    pub offset: u64,
    pub len: u64,
}

/// First-fit allocator over the byte range `[0, capacity)` of a device.
///
/// Allocated regions are tracked by offset; the free space is whatever lies
/// between them.
#[derive(Debug)]
pub struct RegionPool {
    capacity: u64,
    used: BTreeMap<u64, u64>,
}

impl RegionPool {
    pub fn new(capacity: u64) -> Self {
        Self { capacity, used: BTreeMap::new() }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.used.is_empty()
    }

    /// Bytes not covered by any allocated region.
    pub fn free_bytes(&self) -> u64 {
        self.capacity - self.used.values().sum::<u64>()
    }

    /// Allocate `len` bytes at the lowest offset with enough room.
    pub fn allocate(&mut self, len: u64) -> Result<Region, PoolError> {
        if len == 0 {
            return Err(PoolError::BadLength);
        }
        let offset = self
            .gaps()
            .find(|gap| gap.len >= len)
            .map(|gap| gap.offset)
            .ok_or(PoolError::Exhausted(len))?;
        self.used.insert(offset, len);
        Ok(Region { offset, len })
    }

    /// Return the region starting at `offset` to the pool.
    pub fn release(&mut self, offset: u64) -> Result<Region, PoolError> {
        self.used
            .remove(&offset)
            .map(|len| Region { offset, len })
            .ok_or(PoolError::NotFound(offset))
    }

    /// Unallocated extents, sorted by offset.
    pub fn gaps(&self) -> Gaps<'_> {
        Gaps { inner: self.used.iter(), next: 0, end: self.capacity }
    }
}

/// Iterator over the free space of a [RegionPool].
pub struct Gaps<'a> {
    inner: std::collections::btree_map::Iter<'a, u64, u64>,
    next: u64,
    end: u64,
}

impl Iterator for Gaps<'_> {
    type Item = Region;

    fn next(&mut self) -> Option<Region> {
        while self.next < self.end {
            match self.inner.next() {
                Some((&start, &len)) => {
                    let gap_start = self.next;
                    self.next = start + len;
                    if gap_start < start {
                        return Some(Region {
                            offset: gap_start,
                            len: start - gap_start,
                        });
                    }
                }
                None => {
                    let gap =
                        Region { offset: self.next, len: self.end - self.next };
                    self.next = self.end;
                    return Some(gap);
                }
            }
        }
        None
    }
}
