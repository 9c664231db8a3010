//! # Hardware Queue Descriptor
//!
//! The 256-byte structure the command processor reads directly. The public
//! ring description sits at the front; the write and read dispatch ids live
//! in separate cache lines so producer and consumer traffic does not share
//! a line.
//!
//! ```text
//! Offset  Field
//! ──────  ─────────────────────────────────────────────
//!      0  public queue (type, features, ring, doorbell, size, id)
//!     56  write_dispatch_id
//!     64  apertures, max CU / wave ids
//!     80  max_legacy_doorbell_dispatch_id_plus_1
//!     88  legacy_doorbell_lock
//!    128  read_dispatch_id
//!    140  compute_tmpring_size
//!    144  scratch resource descriptor (4 dwords)
//!    160  scratch backing location / size / per work-item size
//!    180  queue_properties
//!    192  queue_inactive_signal
//! ```

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use static_assertions::const_assert_eq;

// =============================================================================
// QUEUE TYPE AND FEATURES
// =============================================================================

/// Producer model of a queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum QueueType {
    /// Any number of producers
    Multi  = 0,
    /// One producer; the runtime may skip atomics
    Single = 1,
}

bitflags::bitflags! {
    /// Packet classes a queue accepts
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct QueueFeatures: u32 {
        /// Kernel dispatch packets
        const KERNEL_DISPATCH = 1 << 0;
        /// Agent dispatch packets
        const AGENT_DISPATCH = 1 << 1;
    }
}

bitflags::bitflags! {
    /// Property bits read by the command processor
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct QueueProperties: u32 {
        /// Trap handler installed
        const ENABLE_TRAP_HANDLER = 1 << 0;
        /// Pointers in packets are 64-bit
        const IS_PTR64 = 1 << 1;
        /// Trap handler receives debug SGPRs
        const ENABLE_TRAP_HANDLER_DEBUG_SGPRS = 1 << 2;
        /// Dispatch timestamps are recorded
        const ENABLE_PROFILING = 1 << 3;
    }
}

// =============================================================================
// LAYOUT
// =============================================================================

/// Public part of the queue descriptor
#[derive(Debug)]
#[repr(C)]
pub struct HsaQueue {
    /// [`QueueType`] as raw
    pub queue_type: u32,
    /// [`QueueFeatures`] bits
    pub features: u32,
    /// Ring base address
    pub base_address: u64,
    /// Raw handle of the doorbell signal
    pub doorbell_signal: AtomicU64,
    /// Capacity in packets, a power of two
    pub size: u32,
    reserved1: u32,
    /// Process-unique queue id
    pub id: u64,
}

/// Full hardware queue descriptor
#[derive(Debug)]
#[repr(C, align(64))]
pub struct AmdQueue {
    /// Public part
    pub hsa_queue: HsaQueue,
    reserved1: [u32; 4],
    /// Producer-owned write index
    pub write_dispatch_id: AtomicU64,
    /// Upper 32 bits of the group aperture
    pub group_segment_aperture_base_hi: u32,
    /// Upper 32 bits of the private aperture
    pub private_segment_aperture_base_hi: u32,
    /// Highest compute unit id
    pub max_cu_id: u32,
    /// Highest wave slot id per compute unit
    pub max_wave_id: u32,
    /// Last dispatch id rung on a legacy doorbell, plus one
    pub max_legacy_doorbell_dispatch_id_plus_1: AtomicU64,
    /// Spinlock serializing legacy doorbell writes
    pub legacy_doorbell_lock: AtomicU32,
    reserved2: [u32; 9],
    /// Consumer-owned read index
    pub read_dispatch_id: AtomicU64,
    /// Byte offset from the read index field to the descriptor base
    pub read_dispatch_id_field_base_byte_offset: u32,
    /// Scratch wave count and wave size as programmed in hardware
    pub compute_tmpring_size: AtomicU32,
    /// Scratch buffer resource descriptor
    pub scratch_resource_descriptor: [AtomicU32; 4],
    /// Offset of this queue's scratch in the process scratch aperture
    pub scratch_backing_memory_location: AtomicU64,
    /// Scratch bytes backing this queue
    pub scratch_backing_memory_byte_size: AtomicU64,
    /// Scratch bytes per work-item
    pub scratch_workitem_byte_size: AtomicU32,
    /// [`QueueProperties`] bits
    pub queue_properties: u32,
    reserved3: [u32; 2],
    /// Raw handle of the signal faults are reported through
    pub queue_inactive_signal: AtomicU64,
    reserved4: [u32; 14],
}

const_assert_eq!(core::mem::size_of::<HsaQueue>(), 40);
const_assert_eq!(core::mem::size_of::<AmdQueue>(), 256);
const_assert_eq!(core::mem::align_of::<AmdQueue>(), 64);
const_assert_eq!(core::mem::offset_of!(AmdQueue, write_dispatch_id), 56);
const_assert_eq!(core::mem::offset_of!(AmdQueue, max_legacy_doorbell_dispatch_id_plus_1), 80);
const_assert_eq!(core::mem::offset_of!(AmdQueue, legacy_doorbell_lock), 88);
const_assert_eq!(core::mem::offset_of!(AmdQueue, read_dispatch_id), 128);
const_assert_eq!(core::mem::offset_of!(AmdQueue, compute_tmpring_size), 140);
const_assert_eq!(core::mem::offset_of!(AmdQueue, scratch_resource_descriptor), 144);
const_assert_eq!(core::mem::offset_of!(AmdQueue, scratch_backing_memory_location), 160);
const_assert_eq!(core::mem::offset_of!(AmdQueue, queue_properties), 180);
const_assert_eq!(core::mem::offset_of!(AmdQueue, queue_inactive_signal), 192);

/// Construction parameters of an [`AmdQueue`]
#[derive(Debug, Clone, Copy)]
pub struct AmdQueueInit {
    /// Producer model
    pub queue_type: QueueType,
    /// Accepted packet classes
    pub features: QueueFeatures,
    /// Ring base address
    pub base_address: usize,
    /// Capacity in packets
    pub size: u32,
    /// Process-unique queue id
    pub id: u64,
    /// Highest compute unit id
    pub max_cu_id: u32,
    /// Highest wave slot id
    pub max_wave_id: u32,
    /// Property bits
    pub properties: QueueProperties,
}

impl AmdQueue {
    /// Build a descriptor with both indices at zero
    pub fn new(init: AmdQueueInit) -> Self {
        Self {
            hsa_queue: HsaQueue {
                queue_type: init.queue_type as u32,
                features: init.features.bits(),
                base_address: init.base_address as u64,
                doorbell_signal: AtomicU64::new(0),
                size: init.size,
                reserved1: 0,
                id: init.id,
            },
            reserved1: [0; 4],
            write_dispatch_id: AtomicU64::new(0),
            group_segment_aperture_base_hi: 0,
            private_segment_aperture_base_hi: 0,
            max_cu_id: init.max_cu_id,
            max_wave_id: init.max_wave_id,
            max_legacy_doorbell_dispatch_id_plus_1: AtomicU64::new(0),
            legacy_doorbell_lock: AtomicU32::new(0),
            reserved2: [0; 9],
            read_dispatch_id: AtomicU64::new(0),
            read_dispatch_id_field_base_byte_offset: core::mem::offset_of!(AmdQueue, read_dispatch_id)
                as u32,
            compute_tmpring_size: AtomicU32::new(0),
            scratch_resource_descriptor: Default::default(),
            scratch_backing_memory_location: AtomicU64::new(0),
            scratch_backing_memory_byte_size: AtomicU64::new(0),
            scratch_workitem_byte_size: AtomicU32::new(0),
            queue_properties: init.properties.bits(),
            reserved3: [0; 2],
            queue_inactive_signal: AtomicU64::new(0),
            reserved4: [0; 14],
        }
    }

    /// Capacity in packets
    #[inline]
    pub fn size(&self) -> u32 {
        self.hsa_queue.size
    }

    /// Ring base address
    #[inline]
    pub fn base_address(&self) -> usize {
        self.hsa_queue.base_address as usize
    }

    /// Queue type
    pub fn queue_type(&self) -> QueueType {
        if self.hsa_queue.queue_type == QueueType::Single as u32 {
            QueueType::Single
        } else {
            QueueType::Multi
        }
    }

    /// Accepted packet classes
    pub fn features(&self) -> QueueFeatures {
        QueueFeatures::from_bits_truncate(self.hsa_queue.features)
    }

    /// Property bits
    pub fn properties(&self) -> QueueProperties {
        QueueProperties::from_bits_truncate(self.queue_properties)
    }

    /// Address of the write index, as handed to the driver
    pub fn write_index_addr(&self) -> usize {
        &self.write_dispatch_id as *const AtomicU64 as usize
    }

    /// Address of the read index, as handed to the driver
    pub fn read_index_addr(&self) -> usize {
        &self.read_dispatch_id as *const AtomicU64 as usize
    }

    /// Take the legacy doorbell spinlock
    pub fn lock_legacy_doorbell(&self) -> LegacyDoorbellGuard<'_> {
        while self
            .legacy_doorbell_lock
            .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.legacy_doorbell_lock.load(Ordering::Relaxed) != 0 {
                core::hint::spin_loop();
            }
        }
        LegacyDoorbellGuard { queue: self }
    }
}

/// Holds the legacy doorbell spinlock, released on drop
pub struct LegacyDoorbellGuard<'a> {
    queue: &'a AmdQueue,
}

impl Drop for LegacyDoorbellGuard<'_> {
    fn drop(&mut self) {
        self.queue.legacy_doorbell_lock.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn descriptor() -> AmdQueue {
        AmdQueue::new(AmdQueueInit {
            queue_type: QueueType::Multi,
            features: QueueFeatures::KERNEL_DISPATCH,
            base_address: 0x10_0000,
            size: 64,
            id: 3,
            max_cu_id: 3,
            max_wave_id: 39,
            properties: QueueProperties::IS_PTR64,
        })
    }

    #[test]
    fn test_initial_state() {
        let queue = descriptor();
        assert_eq!(queue.size(), 64);
        assert_eq!(queue.base_address(), 0x10_0000);
        assert_eq!(queue.queue_type(), QueueType::Multi);
        assert_eq!(queue.features(), QueueFeatures::KERNEL_DISPATCH);
        assert_eq!(queue.read_dispatch_id_field_base_byte_offset, 128);
        assert_eq!(queue.read_index_addr() - queue.write_index_addr(), 72);
        assert!(queue.properties().contains(QueueProperties::IS_PTR64));
    }

    #[test]
    fn test_legacy_lock_is_exclusive() {
        let queue = Arc::new(descriptor());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        let _guard = queue.lock_legacy_doorbell();
                        // Non-atomic read-modify-write protected by the lock
                        let value = queue
                            .max_legacy_doorbell_dispatch_id_plus_1
                            .load(Ordering::Relaxed);
                        queue
                            .max_legacy_doorbell_dispatch_id_plus_1
                            .store(value + 1, Ordering::Relaxed);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(queue.max_legacy_doorbell_dispatch_id_plus_1.load(Ordering::Relaxed), 4000);
        assert_eq!(queue.legacy_doorbell_lock.load(Ordering::Relaxed), 0);
    }
}
