//! # Host Queue
//!
//! A ring in ordinary system memory consumed by software, used for agent
//! dispatch to CPU agents and for soft queues. Producers follow the same
//! protocol as for hardware queues; the doorbell is a plain user signal.
//!
//! The consumer side ([`HostQueue::consume`]) is the one place the runtime
//! writes a read index.

use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use hcr_core::atomic::{MemoryOrder, SharedAtomic};
use hcr_core::{Error, Result};
use hcr_memory::MemoryRegion;
use hcr_signal::Signal;

use crate::amd_queue::{AmdQueue, AmdQueueInit, QueueFeatures, QueueProperties, QueueType};
use crate::packet::{self, AqlPacket, PacketType, PACKET_SIZE};
use crate::queue::Queue;

/// Software-consumed packet ring
#[derive(Debug)]
pub struct HostQueue {
    amd: Box<AmdQueue>,
    region: Arc<MemoryRegion>,
    ring_bytes: usize,
    doorbell: Arc<dyn Signal>,
    active: AtomicBool,
}

impl HostQueue {
    /// Allocate a ring of `capacity` packets from `region`
    ///
    /// `capacity` must be a power of two. `doorbell_handle` is the public
    /// handle of `doorbell`, recorded in the descriptor.
    pub fn new(
        region: Arc<MemoryRegion>,
        capacity: u32,
        queue_type: QueueType,
        features: QueueFeatures,
        doorbell: Arc<dyn Signal>,
        doorbell_handle: u64,
        id: u64,
    ) -> Result<Self> {
        if !capacity.is_power_of_two() {
            return Err(Error::InvalidArgument);
        }
        let ring_bytes = capacity as usize * PACKET_SIZE;
        let base = region.allocate(ring_bytes)?;

        let amd = Box::new(AmdQueue::new(AmdQueueInit {
            queue_type,
            features,
            base_address: base,
            size: capacity,
            id,
            max_cu_id: 0,
            max_wave_id: 0,
            properties: QueueProperties::IS_PTR64,
        }));
        amd.hsa_queue
            .doorbell_signal
            .store(doorbell_handle, Ordering::Relaxed);

        let queue = Self {
            amd,
            region,
            ring_bytes,
            doorbell,
            active: AtomicBool::new(true),
        };
        for index in 0..u64::from(capacity) {
            // SAFETY: the slot lies inside the fresh ring, unreachable by others
            unsafe { packet::store_packet(queue.slot(index), &AqlPacket::invalid()) };
        }
        log::debug!("host queue {}: {} packets at {:#x}", id, capacity, base);
        Ok(queue)
    }

    /// Process every published packet in order
    ///
    /// `handler` sees each packet with its index. The slot is handed back
    /// to producers and the read index advanced after the handler returns.
    /// Returns the number of packets consumed.
    pub fn consume<F>(&self, mut handler: F) -> usize
    where
        F: FnMut(u64, &AqlPacket),
    {
        let mut consumed = 0;
        while self.is_active() {
            let read = self.load_read_index_relaxed();
            let published = u64::try_from(self.doorbell.load_acquire()).unwrap_or(0);
            let limit = published.min(self.load_write_index_acquire());
            if read >= limit {
                break;
            }

            let slot = self.slot(read);
            // SAFETY: the slot belongs to the live ring and is published
            let header = unsafe { packet::load_header(slot) };
            if header.packet_type() == Some(PacketType::Invalid) {
                break;
            }
            // SAFETY: as above
            let packet = unsafe { packet::load_packet(slot) };
            handler(read, &packet);
            // SAFETY: the consumer owns the slot until the read index moves
            unsafe { packet::retire_packet(slot) };
            self.amd
                .read_dispatch_id
                .store_with(read + 1, MemoryOrder::Release);
            consumed += 1;
        }
        consumed
    }

    /// Move the read index directly
    pub fn store_read_index(&self, value: u64, order: MemoryOrder) {
        self.amd.read_dispatch_id.store_with(value, order);
    }
}

impl Queue for HostQueue {
    fn amd_queue(&self) -> &AmdQueue {
        &self.amd
    }

    fn doorbell(&self) -> &dyn Signal {
        &*self.doorbell
    }

    fn inactivate(&self) -> Result<()> {
        if self.active.swap(false, Ordering::AcqRel) {
            log::debug!("host queue {}: inactivated", self.id());
        }
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn set_cu_masking(&self, _count: u32, _mask: &[u32]) -> Result<()> {
        Err(Error::NotSupported)
    }
}

impl Drop for HostQueue {
    fn drop(&mut self) {
        self.region.free(self.amd.base_address(), self.ring_bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{AgentDispatchPacket, PacketHeader};
    use hcr_hal::{HeapType, MemoryProperties, SimKfd};
    use hcr_signal::DefaultSignal;
    use std::thread;

    fn system_region(kfd: &Arc<SimKfd>) -> Arc<MemoryRegion> {
        let props = MemoryProperties {
            heap: HeapType::System,
            size: 1 << 30,
            virtual_base: 0,
            width: 64,
            max_clock_mhz: 0,
        };
        Arc::new(MemoryRegion::new(kfd.clone(), 0, props, true, false))
    }

    fn host_queue(kfd: &Arc<SimKfd>, capacity: u32) -> (Arc<HostQueue>, Arc<dyn Signal>) {
        let doorbell: Arc<dyn Signal> = Arc::new(DefaultSignal::new(0));
        let queue = HostQueue::new(
            system_region(kfd),
            capacity,
            QueueType::Multi,
            QueueFeatures::AGENT_DISPATCH,
            doorbell.clone(),
            0x10,
            1,
        )
        .unwrap();
        (Arc::new(queue), doorbell)
    }

    fn agent_packet(tag: u64, slot: u64) -> AqlPacket {
        AgentDispatchPacket {
            header: PacketHeader::new(PacketType::AgentDispatch).raw(),
            kind: 0x8000,
            arg: [tag, slot, !tag, 0],
            ..Default::default()
        }
        .into()
    }

    #[test]
    fn test_rejects_non_power_of_two() {
        let kfd = Arc::new(SimKfd::new());
        let doorbell: Arc<dyn Signal> = Arc::new(DefaultSignal::new(0));
        let result = HostQueue::new(
            system_region(&kfd),
            6,
            QueueType::Multi,
            QueueFeatures::AGENT_DISPATCH,
            doorbell,
            0,
            1,
        );
        assert_eq!(result.err(), Some(Error::InvalidArgument));
    }

    #[test]
    fn test_concurrent_producers_publish_in_order() {
        let kfd = Arc::new(SimKfd::new());
        let (queue, doorbell) = host_queue(&kfd, 4);

        let producers: Vec<_> = [0xAAAA_u64, 0x5555_u64]
            .into_iter()
            .map(|tag| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    let first = queue.add_write_index_relaxed(2);
                    queue.wait_for_space(first, 2).unwrap();
                    for index in first..first + 2 {
                        queue.write_packet(index, &agent_packet(tag, index));
                    }
                    queue.publish(first + 2);
                    (tag, first)
                })
            })
            .collect();
        let ranges: Vec<(u64, u64)> = producers.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(doorbell.load_acquire(), 4);
        assert_eq!(queue.load_write_index_relaxed(), 4);
        let mut firsts: Vec<u64> = ranges.iter().map(|&(_, first)| first).collect();
        firsts.sort_unstable();
        assert_eq!(firsts, vec![0, 2]);

        for &(tag, first) in &ranges {
            for index in first..first + 2 {
                // SAFETY: slot of a live ring, producers have finished
                let packet = unsafe { packet::load_packet(queue.slot(index)) }.as_agent_dispatch();
                assert_eq!(packet.arg, [tag, index, !tag, 0]);
            }
        }
    }

    #[test]
    fn test_consume_advances_read_index() {
        let kfd = Arc::new(SimKfd::new());
        let (queue, _doorbell) = host_queue(&kfd, 4);
        for i in 0..3 {
            queue.submit(&agent_packet(7, i)).unwrap();
        }

        let mut seen = Vec::new();
        let consumed = queue.consume(|index, packet| {
            seen.push((index, packet.as_agent_dispatch().arg[1]));
        });
        assert_eq!(consumed, 3);
        assert_eq!(seen, vec![(0, 0), (1, 1), (2, 2)]);
        assert_eq!(queue.load_read_index_acquire(), 3);
        // SAFETY: slot of a live ring
        assert_eq!(unsafe { packet::load_header(queue.slot(0)) }, PacketHeader::INVALID);

        // Ring wraps once slots are retired
        for i in 3..7 {
            queue.submit(&agent_packet(7, i)).unwrap();
        }
        assert_eq!(queue.consume(|_, _| {}), 4);
    }

    #[test]
    fn test_unpublished_packets_are_not_consumed() {
        let kfd = Arc::new(SimKfd::new());
        let (queue, _doorbell) = host_queue(&kfd, 4);
        let index = queue.reserve(1);
        queue.write_packet(index, &agent_packet(1, index));
        assert_eq!(queue.consume(|_, _| {}), 0);
        queue.publish(index + 1);
        assert_eq!(queue.consume(|_, _| {}), 1);
    }

    #[test]
    fn test_wait_for_space_fails_when_inactive() {
        let kfd = Arc::new(SimKfd::new());
        let (queue, _doorbell) = host_queue(&kfd, 4);
        let first = queue.reserve(4);
        queue.wait_for_space(first, 4).unwrap();
        let next = queue.reserve(1);
        queue.inactivate().unwrap();
        queue.inactivate().unwrap();
        assert_eq!(queue.wait_for_space(next, 1), Err(Error::InvalidQueue));
        assert_eq!(queue.wait_for_space(0, 5), Err(Error::InvalidArgument));
        assert_eq!(queue.set_cu_masking(32, &[1]), Err(Error::NotSupported));
    }

    #[test]
    fn test_ring_freed_on_drop() {
        let kfd = Arc::new(SimKfd::new());
        let (queue, _doorbell) = host_queue(&kfd, 4);
        assert_eq!(kfd.allocation_count(), 1);
        drop(queue);
        assert_eq!(kfd.allocation_count(), 0);
    }
}
