//! # Software Command Processor
//!
//! Consumes an [`AqlQueue`] the way the GPU front end does: packets are
//! taken in order up to the published doorbell end, validated, executed
//! and retired. Kernel bodies are not run; a valid dispatch completes
//! immediately.
//!
//! A rejected packet is reported by storing its fault code into the queue's
//! inactive signal. Consumption then stalls on that packet until the fault
//! is cleared, which is what lets scratch growth resume the same dispatch.

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use hcr_core::atomic::{MemoryOrder, SharedAtomic};
use hcr_core::{time, Error, Result};
use hcr_signal::{Signal, SignalValue};

use crate::amd_queue::QueueFeatures;
use crate::aql_queue::{
    AqlQueue, FAULT_CODE_OBJECT, FAULT_GROUP_MEMORY, FAULT_INVALID_DIMENSIONS, FAULT_PACKET_FORMAT,
    FAULT_SCRATCH,
};
use crate::packet::{self, AqlPacket, BarrierPacket, KernelDispatchPacket, PacketType};
use crate::queue::Queue;

/// Largest work-group, in work-items
pub const MAX_WORKGROUP_SIZE: u64 = 1024;

const IDLE_SLEEP: Duration = Duration::from_micros(50);

/// Maps a signal handle found in a packet to the signal
pub type SignalResolver = Arc<dyn Fn(u64) -> Option<Arc<dyn Signal>> + Send + Sync>;

/// Outcome of one [`SoftCommandProcessor::step`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpStatus {
    /// Nothing published
    Idle,
    /// One packet retired
    Progress,
    /// Barrier dependencies not yet satisfied
    Blocked,
    /// Stalled on a fault with this code
    Faulted(SignalValue),
    /// Queue is inactive
    Stopped,
}

/// Packet consumer for one hardware queue
pub struct SoftCommandProcessor {
    queue: Arc<AqlQueue>,
    resolver: SignalResolver,
    retired: AtomicU64,
}

impl SoftCommandProcessor {
    /// Consumer for `queue`, resolving signal handles through `resolver`
    pub fn new(queue: Arc<AqlQueue>, resolver: SignalResolver) -> Self {
        Self {
            queue,
            resolver,
            retired: AtomicU64::new(0),
        }
    }

    /// Queue being consumed
    pub fn queue(&self) -> &Arc<AqlQueue> {
        &self.queue
    }

    /// Packets retired so far
    pub fn retired(&self) -> u64 {
        self.retired.load(Ordering::Relaxed)
    }

    /// Try to retire the packet at the read index
    pub fn step(&self) -> CpStatus {
        let queue = &*self.queue;
        if !queue.is_active() {
            return CpStatus::Stopped;
        }
        let pending = queue.inactive_signal().load_acquire();
        if pending != 0 {
            return CpStatus::Faulted(pending);
        }

        let read = queue.load_read_index_relaxed();
        if read >= queue.published_end() {
            return CpStatus::Idle;
        }
        let slot = queue.ring_slot(read);
        // SAFETY: the slot belongs to the live ring and lies below the
        // published end
        let header = unsafe { packet::load_header(slot) };
        let outcome = match header.packet_type() {
            Some(PacketType::Invalid) => return CpStatus::Idle,
            Some(PacketType::KernelDispatch) => {
                // SAFETY: as above
                let pkt = unsafe { packet::load_packet(slot) };
                self.check_dispatch(&pkt.as_kernel_dispatch())
            },
            Some(PacketType::BarrierAnd) => {
                // SAFETY: as above
                let pkt = unsafe { packet::load_packet(slot) };
                self.check_barrier(&pkt.as_barrier(), true)
            },
            Some(PacketType::BarrierOr) => {
                // SAFETY: as above
                let pkt = unsafe { packet::load_packet(slot) };
                self.check_barrier(&pkt.as_barrier(), false)
            },
            _ => Err(FAULT_PACKET_FORMAT),
        };

        match outcome {
            Ok(true) => {},
            Ok(false) => return CpStatus::Blocked,
            Err(code) => {
                log::debug!("cp {}: packet {} faulted with {:#x}", queue.id(), read, code);
                queue.inactive_signal().store_release(code);
                return CpStatus::Faulted(code);
            },
        }

        let start = time::now();
        // SAFETY: as above
        let pkt = unsafe { packet::load_packet(slot) };
        self.complete(&pkt, start);
        // SAFETY: the consumer owns the slot until the read index moves
        unsafe { packet::retire_packet(slot) };
        queue
            .amd_queue()
            .read_dispatch_id
            .store_with(read + 1, MemoryOrder::Release);
        self.retired.fetch_add(1, Ordering::Relaxed);
        log::trace!("cp {}: retired packet {}", queue.id(), read);
        CpStatus::Progress
    }

    /// Step until no packet can be retired
    ///
    /// Returns the number of packets retired and the status that stopped
    /// the loop.
    pub fn run_until_idle(&self) -> (usize, CpStatus) {
        let mut count = 0;
        loop {
            match self.step() {
                CpStatus::Progress => count += 1,
                status => return (count, status),
            }
        }
    }

    /// Consume on a dedicated thread until the queue stops or the returned
    /// handle is dropped
    pub fn spawn(self: Arc<Self>) -> Result<CpThread> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let name = format!("hcr-cp-{}", self.queue.id());
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || {
                while !flag.load(Ordering::Acquire) {
                    match self.step() {
                        CpStatus::Progress => {},
                        CpStatus::Stopped => break,
                        _ => thread::sleep(IDLE_SLEEP),
                    }
                }
                log::debug!("cp {}: exiting after {} packets", self.queue.id(), self.retired());
            })
            .map_err(|err| {
                log::error!("cp: thread creation failed: {}", err);
                Error::OutOfResources
            })?;
        Ok(CpThread {
            stop,
            handle: Some(handle),
        })
    }

    fn check_dispatch(&self, pkt: &KernelDispatchPacket) -> core::result::Result<bool, SignalValue> {
        let queue = &*self.queue;
        if !queue
            .amd_queue()
            .features()
            .contains(QueueFeatures::KERNEL_DISPATCH)
        {
            return Err(FAULT_PACKET_FORMAT);
        }

        let dims = pkt.dimensions();
        let workgroup = [pkt.workgroup_size_x, pkt.workgroup_size_y, pkt.workgroup_size_z];
        let grid = [pkt.grid_size_x, pkt.grid_size_y, pkt.grid_size_z];
        let items: u64 = workgroup.iter().map(|&w| u64::from(w)).product();
        if !(1..=3).contains(&dims)
            || workgroup.contains(&0)
            || grid.contains(&0)
            || items > MAX_WORKGROUP_SIZE
        {
            return Err(FAULT_INVALID_DIMENSIONS);
        }
        if pkt.group_segment_size > queue.group_memory_limit() {
            return Err(FAULT_GROUP_MEMORY);
        }
        if pkt.kernel_object == 0 {
            return Err(FAULT_CODE_OBJECT);
        }
        let scratch = queue
            .amd_queue()
            .scratch_workitem_byte_size
            .load(Ordering::Acquire);
        if pkt.private_segment_size > scratch {
            return Err(FAULT_SCRATCH);
        }
        Ok(true)
    }

    /// `Ok(true)` once the dependencies are satisfied
    fn check_barrier(&self, pkt: &BarrierPacket, all: bool) -> core::result::Result<bool, SignalValue> {
        let mut any_dep = false;
        let mut any_done = false;
        for &handle in pkt.dep_signal.iter().filter(|&&h| h != 0) {
            let signal = (self.resolver)(handle).ok_or(FAULT_PACKET_FORMAT)?;
            let done = signal.load_acquire() == 0;
            if all && !done {
                return Ok(false);
            }
            any_dep = true;
            any_done |= done;
        }
        Ok(all || !any_dep || any_done)
    }

    fn complete(&self, pkt: &AqlPacket, start: u64) {
        let handle = pkt.completion_signal();
        if handle == 0 {
            return;
        }
        match (self.resolver)(handle) {
            Some(signal) => {
                signal.amd_signal().set_timestamps(start, time::now());
                signal.sub_release(1);
            },
            None => log::warn!("cp {}: unknown completion signal {:#x}", self.queue.id(), handle),
        }
    }
}

impl core::fmt::Debug for SoftCommandProcessor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SoftCommandProcessor")
            .field("queue", &self.queue.id())
            .field("retired", &self.retired())
            .finish()
    }
}

/// Running consumer thread; dropping it stops and joins the thread
#[derive(Debug)]
pub struct CpThread {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl CpThread {
    /// Stop and join the thread
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("cp: consumer thread panicked");
            }
        }
    }
}

impl Drop for CpThread {
    fn drop(&mut self) {
        self.stop();
    }
}
