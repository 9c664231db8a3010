//! # Registration Database
//!
//! Deduplicates the application ranges pinned with the kernel driver.
//!
//! Applications register byte ranges; the driver pins pages. Two maps keep
//! the bookkeeping:
//!
//! - `requested`: exact application ranges, keyed by start, each recording
//!   the first page it pins
//! - `registered`: page-aligned blocks actually pinned with the driver, each
//!   carrying a reference count (one per requested range touching it)
//!
//! Requested ranges never overlap each other, but several may share a page,
//! in which case they share the pinned block covering it. A block is
//! unpinned when its last reference goes away.
//!
//! Both maps carry zero-length guard entries at `0` and `usize::MAX` so
//! neighbour lookups always find something.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;
use std::vec::Vec;

use hcr_core::{align_down, align_up, KernelMutex, PAGE_SIZE};
use hcr_hal::Kfd;

const GUARD_LOW: usize = 0;
const GUARD_HIGH: usize = usize::MAX;

/// One application-requested range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Range {
    size: usize,
    first_page: usize,
}

/// One pinned page block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PageRange {
    size: usize,
    ref_count: u32,
}

#[derive(Debug)]
struct Ranges {
    requested: BTreeMap<usize, Range>,
    registered: BTreeMap<usize, PageRange>,
}

impl Ranges {
    fn new() -> Self {
        let mut requested = BTreeMap::new();
        requested.insert(GUARD_LOW, Range { size: 0, first_page: GUARD_LOW });
        requested.insert(GUARD_HIGH, Range { size: 0, first_page: GUARD_HIGH });
        let mut registered = BTreeMap::new();
        registered.insert(GUARD_LOW, PageRange { size: 0, ref_count: 0 });
        registered.insert(GUARD_HIGH, PageRange { size: 0, ref_count: 0 });
        Self {
            requested,
            registered,
        }
    }

    /// Pinned blocks intersecting `[start, end)`
    fn blocks_touching(&self, start: usize, end: usize) -> Vec<usize> {
        let mut blocks = Vec::new();
        if let Some((&addr, block)) = self.registered.range(..start).next_back() {
            if addr != GUARD_LOW && addr + block.size > start {
                blocks.push(addr);
            }
        }
        blocks.extend(
            self.registered
                .range(start..end)
                .map(|(&addr, _)| addr)
                .filter(|&addr| addr != GUARD_HIGH),
        );
        blocks
    }

    /// Unpinned gaps of `[start, end)`
    fn gaps(&self, start: usize, end: usize, blocks: &[usize]) -> Vec<(usize, usize)> {
        let mut gaps = Vec::new();
        let mut cursor = start;
        for addr in blocks {
            let block_end = addr + self.registered[addr].size;
            if *addr > cursor {
                gaps.push((cursor, *addr - cursor));
            }
            cursor = cursor.max(block_end);
        }
        if cursor < end {
            gaps.push((cursor, end - cursor));
        }
        gaps
    }
}

/// Snapshot of the database contents, without guards
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DatabaseSnapshot {
    /// Requested ranges as `(start, size)`
    pub requested: Vec<(usize, usize)>,
    /// Pinned blocks as `(start, size, ref_count)`
    pub registered: Vec<(usize, usize, u32)>,
}

/// Reference-counted registration database
#[derive(Debug)]
pub struct MemoryDatabase {
    kfd: Arc<dyn Kfd>,
    ranges: KernelMutex<Ranges>,
}

impl MemoryDatabase {
    /// Create an empty database registering through `kfd`
    pub fn new(kfd: Arc<dyn Kfd>) -> Self {
        Self {
            kfd,
            ranges: KernelMutex::new(Ranges::new()),
        }
    }

    /// Register `[ptr, ptr + size)` for device access
    ///
    /// Returns `false`, leaving the database unchanged, when the range is
    /// malformed, overlaps a different requested range, or the driver refuses
    /// to pin it. Re-registering a known start with a size no larger than the
    /// recorded one succeeds without any change.
    pub fn register(&self, ptr: usize, size: usize) -> bool {
        if ptr == GUARD_LOW || size == 0 {
            return false;
        }
        let end = match ptr.checked_add(size) {
            Some(end) if end <= GUARD_HIGH - PAGE_SIZE => end,
            _ => return false,
        };

        let mut ranges = self.ranges.lock();

        if let Some(existing) = ranges.requested.get(&ptr).copied() {
            if size <= existing.size {
                return true;
            }
            return self.extend(&mut ranges, ptr, existing, end);
        }

        // A fresh range may not overlap either neighbour
        if let Some((&prev, range)) = ranges.requested.range(..ptr).next_back() {
            if prev + range.size > ptr {
                log::warn!("register {:#x}+{:#x}: overlaps range at {:#x}", ptr, size, prev);
                return false;
            }
        }
        if let Some((&next, _)) = ranges
            .requested
            .range((Bound::Excluded(ptr), Bound::Unbounded))
            .next()
        {
            if next < end {
                log::warn!("register {:#x}+{:#x}: overlaps range at {:#x}", ptr, size, next);
                return false;
            }
        }

        let first_page = align_down(ptr, PAGE_SIZE);
        let last_page = align_up(end, PAGE_SIZE);
        let blocks = ranges.blocks_touching(first_page, last_page);
        if !self.pin(&mut ranges, first_page, last_page, &blocks, 0) {
            return false;
        }

        ranges.requested.insert(ptr, Range { size, first_page });
        true
    }

    /// Grow a known range to end at `end`
    fn extend(&self, ranges: &mut Ranges, ptr: usize, existing: Range, end: usize) -> bool {
        if let Some((&next, _)) = ranges
            .requested
            .range((Bound::Excluded(ptr), Bound::Unbounded))
            .next()
        {
            if next < end {
                log::warn!("extend {:#x} to {:#x}: overlaps range at {:#x}", ptr, end, next);
                return false;
            }
        }

        let old_last_page = align_up(ptr + existing.size, PAGE_SIZE);
        let new_last_page = align_up(end, PAGE_SIZE);
        if new_last_page > old_last_page {
            // Blocks starting below the old end are already held by this range
            let blocks = ranges.blocks_touching(old_last_page, new_last_page);
            if !self.pin(ranges, old_last_page, new_last_page, &blocks, old_last_page) {
                return false;
            }
        }

        if let Some(range) = ranges.requested.get_mut(&ptr) {
            range.size = end - ptr;
        }
        true
    }

    /// Retain `blocks` and pin the gaps of `[start, end)` they leave
    ///
    /// Blocks starting below `held_below` are already held by the caller and
    /// are not retained again. Either everything is retained and pinned, or
    /// nothing is.
    fn pin(
        &self,
        ranges: &mut Ranges,
        start: usize,
        end: usize,
        blocks: &[usize],
        held_below: usize,
    ) -> bool {
        let gaps = ranges.gaps(start, end, blocks);

        for (index, &(addr, len)) in gaps.iter().enumerate() {
            if let Err(err) = self.kfd.register_memory(addr, len) {
                log::warn!("driver refused to pin {:#x}+{:#x}: {}", addr, len, err);
                for &(pinned, _) in &gaps[..index] {
                    let undone = self.kfd.deregister_memory(pinned);
                    assert!(undone.is_ok(), "rollback of pinned block {:#x} failed", pinned);
                }
                return false;
            }
        }

        for addr in blocks.iter().filter(|&&addr| addr >= held_below) {
            if let Some(block) = ranges.registered.get_mut(addr) {
                block.ref_count += 1;
            }
        }
        for (addr, len) in gaps {
            ranges.registered.insert(addr, PageRange { size: len, ref_count: 1 });
        }
        true
    }

    /// Deregister a range previously accepted by [`MemoryDatabase::register`]
    ///
    /// Returns `false` if `ptr` is not the start of a registered range.
    pub fn deregister(&self, ptr: usize) -> bool {
        if ptr == GUARD_LOW || ptr == GUARD_HIGH {
            return false;
        }
        let mut ranges = self.ranges.lock();
        let range = match ranges.requested.remove(&ptr) {
            Some(range) => range,
            None => {
                log::error!("deregister of unknown range {:#x}", ptr);
                return false;
            },
        };
        self.release(&mut ranges, ptr, range);
        true
    }

    fn release(&self, ranges: &mut Ranges, ptr: usize, range: Range) {
        let last_page = align_up(ptr + range.size, PAGE_SIZE);
        for addr in ranges.blocks_touching(range.first_page, last_page) {
            let drained = match ranges.registered.get_mut(&addr) {
                Some(block) => {
                    assert!(block.ref_count > 0, "pinned block {:#x} over-released", addr);
                    block.ref_count -= 1;
                    block.ref_count == 0
                },
                None => false,
            };
            if drained {
                let result = self.kfd.deregister_memory(addr);
                assert!(result.is_ok(), "driver failed to unpin {:#x}: {:?}", addr, result);
                ranges.registered.remove(&addr);
            }
        }
    }

    /// Deregister every range
    pub fn deregister_all(&self) {
        let mut ranges = self.ranges.lock();
        let live: Vec<(usize, Range)> = ranges
            .requested
            .iter()
            .filter(|(&addr, _)| addr != GUARD_LOW && addr != GUARD_HIGH)
            .map(|(&addr, &range)| (addr, range))
            .collect();
        for (ptr, range) in live {
            ranges.requested.remove(&ptr);
            self.release(&mut ranges, ptr, range);
        }
        debug_assert_eq!(ranges.registered.len(), 2, "pinned blocks outlived every range");
    }

    /// Is `ptr` the start of a registered range?
    pub fn is_registered(&self, ptr: usize) -> bool {
        ptr != GUARD_LOW && ptr != GUARD_HIGH && self.ranges.lock().requested.contains_key(&ptr)
    }

    /// Copy out the current contents
    pub fn snapshot(&self) -> DatabaseSnapshot {
        let ranges = self.ranges.lock();
        DatabaseSnapshot {
            requested: ranges
                .requested
                .iter()
                .filter(|(&addr, _)| addr != GUARD_LOW && addr != GUARD_HIGH)
                .map(|(&addr, range)| (addr, range.size))
                .collect(),
            registered: ranges
                .registered
                .iter()
                .filter(|(&addr, _)| addr != GUARD_LOW && addr != GUARD_HIGH)
                .map(|(&addr, block)| (addr, block.size, block.ref_count))
                .collect(),
        }
    }
}
