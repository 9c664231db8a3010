//! # Queue Trait
//!
//! The index protocol shared by every queue variant, plus the producer
//! helpers built on it.
//!
//! ## Producer protocol
//!
//! 1. [`Queue::reserve`] adds N to the write index; the prior value is the
//!    first of the caller's exclusive slots
//! 2. [`Queue::wait_for_space`] spins until those slots are no longer in
//!    flight
//! 3. [`Queue::write_packet`] fills each slot, header last
//! 4. [`Queue::publish`] advances the doorbell to the end of the range;
//!    the doorbell never moves backwards even when producers publish out of
//!    order

use core::fmt;

use hcr_core::atomic::{MemoryOrder, SharedAtomic};
use hcr_core::{Error, Result};
use hcr_signal::{Signal, SignalValue};

use crate::amd_queue::AmdQueue;
use crate::packet::{self, AqlPacket, PACKET_SIZE};

/// Callback invoked once with the status of a terminal queue fault
///
/// The arguments are the status and the queue id. The queue is already
/// inactive when the callback runs.
pub type ErrorCallback = std::sync::Arc<dyn Fn(Error, u64) + Send + Sync>;

macro_rules! ordered_index_ops {
    ($($order:ident => $variant:ident),* $(,)?) => {
        paste::paste! {
            $(
                #[doc = concat!("Compare-and-swap the write index with ", stringify!($order), " ordering")]
                #[inline]
                fn [<cas_write_index_ $order>](&self, expected: u64, value: u64) -> u64 {
                    self.cas_write_index(expected, value, MemoryOrder::$variant)
                }

                #[doc = concat!("Add to the write index with ", stringify!($order), " ordering")]
                #[inline]
                fn [<add_write_index_ $order>](&self, value: u64) -> u64 {
                    self.add_write_index(value, MemoryOrder::$variant)
                }
            )*
        }
    };
}

/// A packet ring with a producer write index and a consumer read index
pub trait Queue: Send + Sync + fmt::Debug {
    /// Hardware-visible descriptor
    fn amd_queue(&self) -> &AmdQueue;

    /// Signal producers ring after publishing
    fn doorbell(&self) -> &dyn Signal;

    /// Stop consumption; later calls are no-ops
    fn inactivate(&self) -> Result<()>;

    /// Is the consumer still running?
    fn is_active(&self) -> bool;

    /// Restrict the consumer to the compute units set in `mask`
    ///
    /// `count` is the number of mask bits and must be a multiple of 32.
    fn set_cu_masking(&self, count: u32, mask: &[u32]) -> Result<()>;

    // =========================================================================
    // Indices
    // =========================================================================

    /// Load the read index
    #[inline]
    fn load_read_index(&self, order: MemoryOrder) -> u64 {
        self.amd_queue().read_dispatch_id.load_with(order)
    }

    /// Load the write index
    #[inline]
    fn load_write_index(&self, order: MemoryOrder) -> u64 {
        self.amd_queue().write_dispatch_id.load_with(order)
    }

    /// Store the write index
    #[inline]
    fn store_write_index(&self, value: u64, order: MemoryOrder) {
        self.amd_queue().write_dispatch_id.store_with(value, order);
    }

    /// Compare-and-swap the write index, returning the prior value
    #[inline]
    fn cas_write_index(&self, expected: u64, value: u64, order: MemoryOrder) -> u64 {
        self.amd_queue()
            .write_dispatch_id
            .cas_with(expected, value, order)
    }

    /// Add to the write index, returning the prior value
    #[inline]
    fn add_write_index(&self, value: u64, order: MemoryOrder) -> u64 {
        self.amd_queue().write_dispatch_id.add_with(value, order)
    }

    /// Load the read index with acquire ordering
    #[inline]
    fn load_read_index_acquire(&self) -> u64 {
        self.load_read_index(MemoryOrder::Acquire)
    }

    /// Load the read index with relaxed ordering
    #[inline]
    fn load_read_index_relaxed(&self) -> u64 {
        self.load_read_index(MemoryOrder::Relaxed)
    }

    /// Load the write index with acquire ordering
    #[inline]
    fn load_write_index_acquire(&self) -> u64 {
        self.load_write_index(MemoryOrder::Acquire)
    }

    /// Load the write index with relaxed ordering
    #[inline]
    fn load_write_index_relaxed(&self) -> u64 {
        self.load_write_index(MemoryOrder::Relaxed)
    }

    /// Store the write index with relaxed ordering
    #[inline]
    fn store_write_index_relaxed(&self, value: u64) {
        self.store_write_index(value, MemoryOrder::Relaxed);
    }

    /// Store the write index with release ordering
    #[inline]
    fn store_write_index_release(&self, value: u64) {
        self.store_write_index(value, MemoryOrder::Release);
    }

    ordered_index_ops!(
        relaxed => Relaxed,
        acquire => Acquire,
        release => Release,
        acq_rel => AcqRel,
    );

    // =========================================================================
    // Ring
    // =========================================================================

    /// Capacity in packets
    #[inline]
    fn capacity(&self) -> u32 {
        self.amd_queue().size()
    }

    /// Process-unique queue id
    #[inline]
    fn id(&self) -> u64 {
        self.amd_queue().hsa_queue.id
    }

    /// Slot holding packet `index`
    #[inline]
    fn slot(&self, index: u64) -> *mut AqlPacket {
        let mask = u64::from(self.capacity()) - 1;
        let offset = (index & mask) as usize * PACKET_SIZE;
        (self.amd_queue().base_address() + offset) as *mut AqlPacket
    }

    // =========================================================================
    // Producer helpers
    // =========================================================================

    /// Reserve `count` slots, returning the index of the first
    #[inline]
    fn reserve(&self, count: u64) -> u64 {
        self.add_write_index_relaxed(count)
    }

    /// Spin until slots `[index, index + count)` are free
    ///
    /// Fails with [`Error::InvalidQueue`] if the queue is inactivated while
    /// waiting, and with [`Error::InvalidArgument`] if the range can never
    /// fit.
    fn wait_for_space(&self, index: u64, count: u64) -> Result<()> {
        let capacity = u64::from(self.capacity());
        if count > capacity {
            return Err(Error::InvalidArgument);
        }
        let end = index + count;
        loop {
            let read = self.load_read_index_acquire();
            if end - read.min(end) <= capacity {
                return Ok(());
            }
            if !self.is_active() {
                return Err(Error::InvalidQueue);
            }
            core::hint::spin_loop();
        }
    }

    /// Fill slot `index` with `packet`
    ///
    /// The header word is stored last with release ordering. `index` must
    /// have been reserved by the caller and be free per
    /// [`Queue::wait_for_space`].
    fn write_packet(&self, index: u64, packet: &AqlPacket) {
        // SAFETY: the ring outlives the queue and the caller owns the slot
        unsafe { packet::store_packet(self.slot(index), packet) };
    }

    /// Tell the consumer that every packet below `end` is written
    ///
    /// Concurrent publishers may finish in any order; the doorbell only
    /// ever moves forward.
    fn publish(&self, end: u64) {
        advance_doorbell(self.doorbell(), end as SignalValue);
    }

    /// Reserve, wait, write and publish a single packet
    ///
    /// Returns the packet index.
    fn submit(&self, packet: &AqlPacket) -> Result<u64> {
        let index = self.reserve(1);
        self.wait_for_space(index, 1)?;
        self.write_packet(index, packet);
        self.publish(index + 1);
        Ok(index)
    }
}

/// Raise a user-mode doorbell signal to `value` with a CAS loop
///
/// Returns `true` if this call moved the doorbell.
pub fn advance_doorbell(doorbell: &dyn Signal, value: SignalValue) -> bool {
    let mut current = doorbell.load_relaxed();
    loop {
        if current >= value {
            return false;
        }
        let prior = doorbell.cas_release(current, value);
        if prior == current {
            return true;
        }
        current = prior;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amd_queue::{QueueFeatures, QueueType};
    use crate::host_queue::HostQueue;
    use core::sync::atomic::{AtomicBool, Ordering};
    use hcr_hal::{HeapType, MemoryProperties, SimKfd};
    use hcr_memory::MemoryRegion;
    use hcr_signal::DefaultSignal;
    use std::sync::Arc;
    use std::thread;

    fn host_queue(doorbell: Arc<dyn Signal>) -> Arc<HostQueue> {
        let kfd = Arc::new(SimKfd::new());
        let props = MemoryProperties {
            heap: HeapType::System,
            size: 1 << 30,
            virtual_base: 0,
            width: 64,
            max_clock_mhz: 0,
        };
        let region = Arc::new(MemoryRegion::new(kfd, 0, props, true, false));
        let queue = HostQueue::new(
            region,
            64,
            QueueType::Multi,
            QueueFeatures::AGENT_DISPATCH,
            doorbell,
            0x10,
            1,
        )
        .unwrap();
        Arc::new(queue)
    }

    #[test]
    fn test_advance_doorbell_is_monotonic() {
        let doorbell = Arc::new(DefaultSignal::new(0));
        let handles: Vec<_> = (0..4i64)
            .map(|t| {
                let doorbell = Arc::clone(&doorbell);
                thread::spawn(move || {
                    for i in 0..500i64 {
                        let before = doorbell.load_relaxed();
                        advance_doorbell(&*doorbell, (i * 4 + t) as SignalValue);
                        assert!(doorbell.load_relaxed() >= before);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(doorbell.load_relaxed(), 1999);
        assert!(!advance_doorbell(&*doorbell, 5));
    }

    #[test]
    fn test_write_index_ranges_tile_without_gaps() {
        const PRODUCERS: u64 = 8;
        const ROUNDS: u64 = 250;

        let doorbell: Arc<dyn Signal> = Arc::new(DefaultSignal::new(0));
        let queue = host_queue(Arc::clone(&doorbell));
        let done = Arc::new(AtomicBool::new(false));

        let sampler = {
            let doorbell = Arc::clone(&doorbell);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let mut last = doorbell.load_acquire();
                let mut samples = 0u64;
                while !done.load(Ordering::Acquire) {
                    let value = doorbell.load_acquire();
                    assert!(value >= last, "doorbell went from {} to {}", last, value);
                    last = value;
                    samples += 1;
                }
                samples
            })
        };

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|t| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    let mut ranges = Vec::with_capacity(ROUNDS as usize);
                    for i in 0..ROUNDS {
                        let count = 1 + (t * 7 + i * 3) % 5;
                        let first = match i % 4 {
                            0 => queue.add_write_index_relaxed(count),
                            1 => queue.add_write_index_acquire(count),
                            2 => queue.add_write_index_release(count),
                            _ => queue.add_write_index_acq_rel(count),
                        };
                        queue.publish(first + count);
                        ranges.push((first, count));
                    }
                    ranges
                })
            })
            .collect();

        let mut ranges: Vec<(u64, u64)> = producers
            .into_iter()
            .flat_map(|handle| handle.join().unwrap())
            .collect();
        done.store(true, Ordering::Release);
        sampler.join().unwrap();

        let total: u64 = (0..PRODUCERS)
            .flat_map(|t| (0..ROUNDS).map(move |i| 1 + (t * 7 + i * 3) % 5))
            .sum();
        ranges.sort_unstable();
        let mut next = 0;
        for (first, count) in ranges {
            assert_eq!(first, next, "gap or overlap at {}", first);
            next = first + count;
        }
        assert_eq!(next, total);
        assert_eq!(queue.load_write_index_acquire(), total);
        assert_eq!(doorbell.load_acquire(), total as SignalValue);
    }
}
