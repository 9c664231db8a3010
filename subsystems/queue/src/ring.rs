//! # Packet Ring Buffer
//!
//! Ring memory for hardware queues, allocated through the driver as
//! non-paged host memory resident on the consuming GPU.
//!
//! On generations that need the queue-full workaround the ring is reserved
//! at twice its size with both halves backed by the same pages, and the
//! command processor is told the doubled size. A wrapped index then still
//! lands on valid backing pages without any copy on publish.

use hcr_core::{align_up, Error, Result, PAGE_SIZE};
use hcr_hal::{Kfd, MemFlags};
use std::sync::Arc;

use crate::packet::{self, AqlPacket, PACKET_SIZE};

/// Smallest ring in bytes
pub const MIN_RING_BYTES: u64 = 0x400;

/// Smallest ring in bytes with the queue-full workaround
pub const MIN_RING_BYTES_WORKAROUND: u64 = 0x1000;

/// Largest ring in bytes
pub const MAX_RING_BYTES: u64 = 0x1_0000_0000;

/// Clamp a requested capacity (in packets) to the legal range
///
/// The result is a power of two. With the workaround the ceiling halves,
/// since the reservation doubles.
pub fn ring_capacity(requested: u32, workaround: bool) -> u32 {
    let packet = PACKET_SIZE as u64;
    let (min_bytes, max_bytes) = if workaround {
        (MIN_RING_BYTES_WORKAROUND, MAX_RING_BYTES / 2)
    } else {
        (MIN_RING_BYTES, MAX_RING_BYTES)
    };
    let min = (min_bytes / packet) as u32;
    let max = (max_bytes / packet) as u32;
    requested
        .max(1)
        .checked_next_power_of_two()
        .unwrap_or(max)
        .clamp(min, max)
}

/// Driver-allocated packet ring
#[derive(Debug)]
pub struct RingBuffer {
    kfd: Arc<dyn Kfd>,
    base: usize,
    capacity: u32,
    alloc_bytes: usize,
    double_mapped: bool,
}

impl RingBuffer {
    /// Allocate a ring of `capacity` packets on `node`, resident on `gpu_node`
    ///
    /// `capacity` must already be sized by [`ring_capacity`]. Every slot
    /// starts with an invalid header.
    pub fn allocate(
        kfd: Arc<dyn Kfd>,
        node: u32,
        gpu_node: u32,
        capacity: u32,
        double_map: bool,
    ) -> Result<Self> {
        debug_assert!(capacity.is_power_of_two());
        let ring_bytes = capacity as usize * PACKET_SIZE;
        let alloc_bytes = align_up(ring_bytes, PAGE_SIZE);
        let mut flags = MemFlags::HOST_ACCESS | MemFlags::NON_PAGED | MemFlags::EXECUTE;
        if double_map {
            flags |= MemFlags::DOUBLE_MAP;
        }

        let base = kfd.alloc_memory(node, alloc_bytes, flags).map_err(|err| {
            log::warn!("ring: allocation of {} bytes failed: {}", alloc_bytes, err);
            Error::OutOfResources
        })?;
        let reserved = if double_map { alloc_bytes * 2 } else { alloc_bytes };
        if let Err(err) = kfd.map_memory_to_gpu(base, reserved, &[gpu_node]) {
            log::warn!("ring: residency on node {} failed: {}", gpu_node, err);
            let freed = kfd.free_memory(base, alloc_bytes);
            assert!(freed.is_ok(), "driver failed to free ring {:#x}: {:?}", base, freed);
            return Err(Error::OutOfResources);
        }

        let ring = Self {
            kfd,
            base,
            capacity,
            alloc_bytes,
            double_mapped: double_map,
        };
        for index in 0..u64::from(capacity) {
            // SAFETY: the slot lies inside the fresh allocation, which nobody
            // else can reach yet
            unsafe { packet::store_packet(ring.slot(index), &AqlPacket::invalid()) };
        }
        log::debug!(
            "ring: {} packets at {:#x}{}",
            capacity,
            base,
            if double_map { " (double mapped)" } else { "" }
        );
        Ok(ring)
    }

    /// Base address
    pub fn base(&self) -> usize {
        self.base
    }

    /// Capacity in packets
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Size the command processor is told about
    pub fn hardware_bytes(&self) -> usize {
        let bytes = self.capacity as usize * PACKET_SIZE;
        if self.double_mapped {
            bytes * 2
        } else {
            bytes
        }
    }

    /// Is the ring double mapped?
    pub fn is_double_mapped(&self) -> bool {
        self.double_mapped
    }

    /// Slot holding packet `index`
    pub fn slot(&self, index: u64) -> *mut AqlPacket {
        let offset = (index & (u64::from(self.capacity) - 1)) as usize * PACKET_SIZE;
        (self.base + offset) as *mut AqlPacket
    }
}

impl Drop for RingBuffer {
    fn drop(&mut self) {
        if let Err(err) = self.kfd.unmap_memory_from_gpu(self.base) {
            log::error!("ring: unmapping {:#x} failed: {}", self.base, err);
        }
        if let Err(err) = self.kfd.free_memory(self.base, self.alloc_bytes) {
            log::error!("ring: freeing {:#x} failed: {}", self.base, err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{load_header, PacketHeader};
    use hcr_hal::SimKfd;

    #[test]
    fn test_capacity_clamping() {
        assert_eq!(ring_capacity(1, false), 16);
        assert_eq!(ring_capacity(100, false), 128);
        assert_eq!(ring_capacity(1, true), 64);
        assert_eq!(ring_capacity(u32::MAX, false), 0x400_0000);
        assert_eq!(ring_capacity(u32::MAX, true), 0x200_0000);
        assert_eq!(ring_capacity(0x400_0000, true), 0x200_0000);
    }

    #[test]
    fn test_allocate_initializes_slots() {
        let kfd = Arc::new(SimKfd::new());
        let ring = RingBuffer::allocate(kfd.clone(), 0, 1, 16, false).unwrap();
        assert_eq!(ring.hardware_bytes(), 1024);
        assert_eq!(kfd.mapped_nodes(ring.base()), Some(vec![1]));
        for index in 0..16 {
            // SAFETY: slots of a live ring
            assert_eq!(unsafe { load_header(ring.slot(index)) }, PacketHeader::INVALID);
        }
        assert_eq!(ring.slot(16), ring.slot(0));
        drop(ring);
        assert_eq!(kfd.allocation_count(), 0);
    }

    #[test]
    fn test_double_mapped_reservation() {
        let kfd = Arc::new(SimKfd::new());
        let ring = RingBuffer::allocate(kfd.clone(), 0, 1, 64, true).unwrap();
        assert!(ring.is_double_mapped());
        assert_eq!(ring.hardware_bytes(), 8192);
    }

    #[test]
    fn test_residency_failure_frees_ring() {
        let kfd = Arc::new(SimKfd::new());
        kfd.fail_mappings(1);
        assert_eq!(
            RingBuffer::allocate(kfd.clone(), 0, 1, 16, false).err(),
            Some(Error::OutOfResources)
        );
        assert_eq!(kfd.allocation_count(), 0);
    }
}
