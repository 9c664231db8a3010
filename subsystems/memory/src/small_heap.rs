//! # Small Heap
//!
//! First-fit allocator over an arbitrary address range.
//!
//! The heap never touches the memory it manages; it only hands out
//! addresses. Free blocks form a doubly-linked list sorted by address, with
//! the links stored as addresses in an ordered map keyed by block start. Two
//! zero-length guard nodes at address `0` and `usize::MAX` bound the list.
//!
//! Adjacent free blocks are merged as soon as the second one is freed, so
//! two free blocks are never contiguous.

use std::collections::BTreeMap;
use std::vec::Vec;

const HEAD: usize = 0;
const TAIL: usize = usize::MAX;

/// Free-list node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Node {
    len: usize,
    prior: usize,
    next: usize,
}

/// First-fit allocator with eager coalescing
#[derive(Debug)]
pub struct SmallHeap {
    base: usize,
    size: usize,
    /// Free blocks plus the two guards
    free: BTreeMap<usize, Node>,
    /// Allocated blocks: start -> length
    allocated: BTreeMap<usize, usize>,
    /// Sum of free block lengths
    total_free: usize,
}

impl SmallHeap {
    /// Create a heap managing `[base, base + size)`
    ///
    /// `base` must be non-zero and the range must end below `usize::MAX`;
    /// those addresses are reserved for the guards.
    pub fn new(base: usize, size: usize) -> Self {
        assert!(base != HEAD, "small heap cannot start at address zero");
        assert!(
            base.checked_add(size).map_or(false, |end| end < TAIL),
            "small heap range overflows the address space"
        );

        let mut free = BTreeMap::new();
        if size == 0 {
            free.insert(HEAD, Node { len: 0, prior: HEAD, next: TAIL });
            free.insert(TAIL, Node { len: 0, prior: HEAD, next: TAIL });
        } else {
            free.insert(HEAD, Node { len: 0, prior: HEAD, next: base });
            free.insert(base, Node { len: size, prior: HEAD, next: TAIL });
            free.insert(TAIL, Node { len: 0, prior: base, next: TAIL });
        }

        Self {
            base,
            size,
            free,
            allocated: BTreeMap::new(),
            total_free: size,
        }
    }

    /// Start of the managed range
    pub fn base(&self) -> usize {
        self.base
    }

    /// Length of the managed range
    pub fn size(&self) -> usize {
        self.size
    }

    /// Free bytes, possibly fragmented
    pub fn remaining(&self) -> usize {
        self.total_free
    }

    /// Bytes handed out and not yet freed
    pub fn allocated_bytes(&self) -> usize {
        self.size - self.total_free
    }

    /// Number of outstanding allocations
    pub fn allocation_count(&self) -> usize {
        self.allocated.len()
    }

    /// Free blocks as `(start, len)`, in address order
    pub fn free_blocks(&self) -> Vec<(usize, usize)> {
        let mut blocks = Vec::new();
        let mut cursor = self.node(HEAD).next;
        while cursor != TAIL {
            let node = self.node(cursor);
            blocks.push((cursor, node.len));
            cursor = node.next;
        }
        blocks
    }

    /// Allocate `bytes`, searching from the lowest free address
    ///
    /// Returns `None` when no single free block is large enough, even if the
    /// total free space would be.
    pub fn alloc(&mut self, bytes: usize) -> Option<usize> {
        if bytes == 0 || bytes > self.total_free {
            return None;
        }

        let mut cursor = self.node(HEAD).next;
        while cursor != TAIL {
            let node = self.node(cursor);
            if node.len >= bytes {
                if node.len == bytes {
                    self.unlink(cursor);
                } else {
                    // Keep the tail of the block on the free list
                    let rest = cursor + bytes;
                    self.free.remove(&cursor);
                    self.free.insert(
                        rest,
                        Node {
                            len: node.len - bytes,
                            prior: node.prior,
                            next: node.next,
                        },
                    );
                    self.link_mut(node.prior).next = rest;
                    self.link_mut(node.next).prior = rest;
                }
                return Some(self.commit(cursor, bytes));
            }
            cursor = node.next;
        }
        None
    }

    /// Allocate `bytes`, searching from the highest free address
    ///
    /// Large, long-lived blocks taken from the top keep the low end of the
    /// heap available for small, frequently recycled ones.
    pub fn alloc_high(&mut self, bytes: usize) -> Option<usize> {
        if bytes == 0 || bytes > self.total_free {
            return None;
        }

        let mut cursor = self.node(TAIL).prior;
        while cursor != HEAD {
            let node = self.node(cursor);
            if node.len >= bytes {
                if node.len == bytes {
                    self.unlink(cursor);
                    return Some(self.commit(cursor, bytes));
                }
                self.link_mut(cursor).len = node.len - bytes;
                let start = cursor + node.len - bytes;
                return Some(self.commit(start, bytes));
            }
            cursor = node.prior;
        }
        None
    }

    /// Return a block to the heap
    ///
    /// Returns `false` if `ptr` is not an outstanding allocation.
    pub fn free(&mut self, ptr: usize) -> bool {
        let len = match self.allocated.remove(&ptr) {
            Some(len) => len,
            None => return false,
        };

        // The guard at HEAD guarantees a predecessor
        let prior = self
            .free
            .range(..ptr)
            .next_back()
            .map_or(HEAD, |(&addr, _)| addr);
        let next = self.node(prior).next;

        self.free.insert(ptr, Node { len, prior, next });
        self.link_mut(prior).next = ptr;
        self.link_mut(next).prior = ptr;
        self.total_free += len;

        if next != TAIL && ptr + len == next {
            self.merge_into(ptr, next);
        }
        if prior != HEAD && prior + self.node(prior).len == ptr {
            self.merge_into(prior, ptr);
        }
        true
    }

    fn commit(&mut self, start: usize, bytes: usize) -> usize {
        self.allocated.insert(start, bytes);
        self.total_free -= bytes;
        start
    }

    fn node(&self, addr: usize) -> Node {
        match self.free.get(&addr) {
            Some(node) => *node,
            None => unreachable!("free list link to {:#x} is dangling", addr),
        }
    }

    fn link_mut(&mut self, addr: usize) -> &mut Node {
        match self.free.get_mut(&addr) {
            Some(node) => node,
            None => unreachable!("free list link to {:#x} is dangling", addr),
        }
    }

    fn unlink(&mut self, addr: usize) {
        let node = self.node(addr);
        self.link_mut(node.prior).next = node.next;
        self.link_mut(node.next).prior = node.prior;
        self.free.remove(&addr);
    }

    /// Absorb the free block at `second` into the one at `first`
    fn merge_into(&mut self, first: usize, second: usize) {
        let absorbed = self.node(second);
        self.unlink(second);
        self.link_mut(first).len += absorbed.len;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: usize = 0x1000;

    fn check_accounting(heap: &SmallHeap) {
        let free: usize = heap.free_blocks().iter().map(|&(_, len)| len).sum();
        assert_eq!(free, heap.remaining());
        assert_eq!(free + heap.allocated_bytes(), heap.size());
        // No two free blocks touch
        for pair in heap.free_blocks().windows(2) {
            assert!(pair[0].0 + pair[0].1 < pair[1].0);
        }
    }

    #[test]
    fn test_first_fit_split() {
        let mut heap = SmallHeap::new(BASE, 1024);
        assert_eq!(heap.alloc(100), Some(BASE));
        assert_eq!(heap.alloc(100), Some(BASE + 100));
        assert_eq!(heap.free_blocks(), vec![(BASE + 200, 824)]);
        check_accounting(&heap);
    }

    #[test]
    fn test_exact_fit_unlinks() {
        let mut heap = SmallHeap::new(BASE, 256);
        assert_eq!(heap.alloc(256), Some(BASE));
        assert!(heap.free_blocks().is_empty());
        assert_eq!(heap.alloc(1), None);
        assert!(heap.free(BASE));
        assert_eq!(heap.free_blocks(), vec![(BASE, 256)]);
    }

    #[test]
    fn test_full_coalescence() {
        let mut heap = SmallHeap::new(BASE, 1000);
        let blocks: Vec<usize> = (0..10).map(|_| heap.alloc(100).unwrap()).collect();
        // Free odd blocks, then even ones, forcing merges on both sides
        for ptr in blocks.iter().skip(1).step_by(2) {
            assert!(heap.free(*ptr));
            check_accounting(&heap);
        }
        for ptr in blocks.iter().step_by(2) {
            assert!(heap.free(*ptr));
            check_accounting(&heap);
        }
        assert_eq!(heap.free_blocks(), vec![(BASE, 1000)]);
        assert_eq!(heap.allocation_count(), 0);
    }

    #[test]
    fn test_fragmentation_is_observable() {
        let mut heap = SmallHeap::new(BASE, 300);
        let a = heap.alloc(100).unwrap();
        let _b = heap.alloc(100).unwrap();
        let c = heap.alloc(100).unwrap();
        heap.free(a);
        heap.free(c);
        assert_eq!(heap.remaining(), 200);
        assert_eq!(heap.alloc(150), None);
        assert_eq!(heap.alloc(100), Some(a));
    }

    #[test]
    fn test_alloc_high_takes_top() {
        let mut heap = SmallHeap::new(BASE, 1024);
        assert_eq!(heap.alloc_high(24), Some(BASE + 1000));
        assert_eq!(heap.alloc(1000), Some(BASE));
        assert_eq!(heap.remaining(), 0);
        heap.free(BASE + 1000);
        heap.free(BASE);
        assert_eq!(heap.free_blocks(), vec![(BASE, 1024)]);
    }

    #[test]
    fn test_free_unknown_pointer() {
        let mut heap = SmallHeap::new(BASE, 64);
        assert!(!heap.free(BASE));
        let ptr = heap.alloc(32).unwrap();
        assert!(heap.free(ptr));
        assert!(!heap.free(ptr));
    }

    #[test]
    fn test_mixed_sequence_keeps_accounting() {
        let mut heap = SmallHeap::new(BASE, 4096);
        let mut live = Vec::new();
        let mut seed = 0x2545_F491u32;
        for step in 0..400 {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            if step % 3 != 2 {
                if let Some(ptr) = heap.alloc((seed % 200 + 1) as usize) {
                    live.push(ptr);
                }
            } else if !live.is_empty() {
                let ptr = live.swap_remove(seed as usize % live.len());
                assert!(heap.free(ptr));
            }
            check_accounting(&heap);
        }
        for ptr in live {
            assert!(heap.free(ptr));
        }
        assert_eq!(heap.free_blocks(), vec![(BASE, 4096)]);
    }
}
