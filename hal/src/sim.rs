//! # Software Driver
//!
//! In-process implementation of [`Kfd`].
//!
//! Memory is backed by page-aligned host allocations, events by a table
//! guarded by one mutex and condition variable, and doorbells by heap slots
//! the queue writes into and a software command processor reads from.
//!
//! Registration is strict: pinning a range that overlaps an already pinned
//! range fails, so double registration by the runtime shows up in tests.
//! Failure injection counters make the next N calls of a kind fail.
//!
//! `DOUBLE_MAP` allocations reserve twice the requested size, but the two
//! halves are not aliased. The runtime masks every ring index into the lower
//! half, so nothing observes the difference.

use std::alloc::{self, Layout};
use std::collections::BTreeMap;
use std::boxed::Box;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Condvar, PoisonError};
use std::time::{Duration, Instant};
use std::vec::Vec;

use hashbrown::HashMap;
use hcr_core::{time, DriverError, KernelMutex, PAGE_SIZE};

use crate::kfd::{Kfd, KfdResult, WAIT_INFINITE_MS};
use crate::types::{
    ClockCounters, DoorbellType, EventHandle, GfxVersion, HeapType, MemFlags, MemoryProperties,
    NodeKind, NodeProperties, QueueDescriptor, QueueResource,
};

/// Base of the simulated scratch aperture
const SCRATCH_APERTURE_BASE: usize = 0x7F00_0000_0000;
/// Scratch reservations are aligned to this
const SCRATCH_ALIGN: usize = 0x10000;

// =============================================================================
// STATE
// =============================================================================

#[derive(Debug)]
struct Allocation {
    layout: Layout,
    flags: MemFlags,
}

#[derive(Debug, Default)]
struct MemoryState {
    allocations: HashMap<usize, Allocation>,
    registered: BTreeMap<usize, usize>,
    mapped: HashMap<usize, (usize, Vec<u32>)>,
    scratch: HashMap<usize, usize>,
    next_scratch: usize,
    register_calls: u64,
    deregister_calls: u64,
}

#[derive(Debug)]
struct SimQueue {
    node: u32,
    desc: QueueDescriptor,
    doorbell: Box<AtomicU64>,
    cu_mask: Vec<u32>,
}

#[derive(Debug, Default)]
struct QueueState {
    queues: HashMap<u64, SimQueue>,
    // Doorbell pages stay mapped until the process closes the driver
    retired_doorbells: Vec<Box<AtomicU64>>,
    next_id: u64,
}

#[derive(Debug, Clone, Copy)]
struct SimEvent {
    signaled: bool,
    manual_reset: bool,
}

#[derive(Debug, Default)]
struct EventState {
    events: HashMap<u32, SimEvent>,
    next_id: u32,
}

/// Counters making the next N calls of a kind fail
#[derive(Debug, Default)]
struct FaultInjection {
    alloc: AtomicU32,
    register: AtomicU32,
    map: AtomicU32,
    queue: AtomicU32,
}

impl FaultInjection {
    fn take(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }
}

// =============================================================================
// SIM KFD
// =============================================================================

/// In-process software driver
#[derive(Debug)]
pub struct SimKfd {
    nodes: Vec<NodeProperties>,
    memory: KernelMutex<MemoryState>,
    queues: KernelMutex<QueueState>,
    events: KernelMutex<EventState>,
    events_cv: Condvar,
    faults: FaultInjection,
    set_event_calls: AtomicUsize,
}

impl SimKfd {
    /// Driver with one CPU node and one native-doorbell GPU node
    pub fn new() -> Self {
        Self::with_nodes(vec![
            Self::cpu_node(0),
            Self::gpu_node(1, GfxVersion::new(9, 0, 0), DoorbellType::Native),
        ])
    }

    /// Driver exposing exactly `nodes`
    pub fn with_nodes(nodes: Vec<NodeProperties>) -> Self {
        Self {
            nodes,
            memory: KernelMutex::new(MemoryState {
                next_scratch: SCRATCH_APERTURE_BASE,
                ..MemoryState::default()
            }),
            queues: KernelMutex::new(QueueState {
                next_id: 1,
                ..QueueState::default()
            }),
            events: KernelMutex::new(EventState {
                next_id: 1,
                ..EventState::default()
            }),
            events_cv: Condvar::new(),
            faults: FaultInjection::default(),
            set_event_calls: AtomicUsize::new(0),
        }
    }

    /// A CPU node with 256 MiB of system memory
    pub fn cpu_node(node_id: u32) -> NodeProperties {
        NodeProperties {
            node_id,
            kind: NodeKind::Cpu,
            cpu_cores: 4,
            simd_count: 0,
            simd_per_cu: 0,
            max_waves_per_simd: 0,
            wave_front_size: 0,
            gfx_version: GfxVersion::new(0, 0, 0),
            doorbell_type: DoorbellType::Native,
            memory: vec![MemoryProperties {
                heap: HeapType::System,
                size: 256 << 20,
                virtual_base: 0,
                width: 64,
                max_clock_mhz: 2400,
            }],
        }
    }

    /// A four-CU GPU node with 256 MiB of frame buffer and 64 KiB of LDS
    pub fn gpu_node(node_id: u32, gfx_version: GfxVersion, doorbell_type: DoorbellType) -> NodeProperties {
        NodeProperties {
            node_id,
            kind: NodeKind::Gpu,
            cpu_cores: 0,
            simd_count: 16,
            simd_per_cu: 4,
            max_waves_per_simd: 10,
            wave_front_size: 64,
            gfx_version,
            doorbell_type,
            memory: vec![
                MemoryProperties {
                    heap: HeapType::FrameBufferPublic,
                    size: 256 << 20,
                    virtual_base: 0,
                    width: 256,
                    max_clock_mhz: 1000,
                },
                MemoryProperties {
                    heap: HeapType::GpuLds,
                    size: 64 << 10,
                    virtual_base: 0x1_0000_0000,
                    width: 0,
                    max_clock_mhz: 0,
                },
            ],
        }
    }

    fn node(&self, node: u32) -> KfdResult<&NodeProperties> {
        self.nodes
            .iter()
            .find(|n| n.node_id == node)
            .ok_or(DriverError::InvalidParameter)
    }

    // =========================================================================
    // Failure injection
    // =========================================================================

    /// Make the next `count` allocations fail
    pub fn fail_allocations(&self, count: u32) {
        self.faults.alloc.store(count, Ordering::Release);
    }

    /// Make the next `count` registrations fail
    pub fn fail_registrations(&self, count: u32) {
        self.faults.register.store(count, Ordering::Release);
    }

    /// Make the next `count` GPU mappings fail
    pub fn fail_mappings(&self, count: u32) {
        self.faults.map.store(count, Ordering::Release);
    }

    /// Make the next `count` queue creations fail
    pub fn fail_queue_creation(&self, count: u32) {
        self.faults.queue.store(count, Ordering::Release);
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    /// Number of live allocations
    pub fn allocation_count(&self) -> usize {
        self.memory.lock().allocations.len()
    }

    /// Pinned ranges, sorted by address
    pub fn registered_ranges(&self) -> Vec<(usize, usize)> {
        self.memory
            .lock()
            .registered
            .iter()
            .map(|(&addr, &size)| (addr, size))
            .collect()
    }

    /// Total register and deregister calls that succeeded
    pub fn registration_calls(&self) -> (u64, u64) {
        let memory = self.memory.lock();
        (memory.register_calls, memory.deregister_calls)
    }

    /// GPU nodes an address is resident on
    pub fn mapped_nodes(&self, addr: usize) -> Option<Vec<u32>> {
        self.memory.lock().mapped.get(&addr).map(|(_, nodes)| nodes.clone())
    }

    /// Live scratch reservations
    pub fn scratch_reservations(&self) -> usize {
        self.memory.lock().scratch.len()
    }

    /// Number of live hardware queues
    pub fn queue_count(&self) -> usize {
        self.queues.lock().queues.len()
    }

    /// CU mask programmed for a queue
    pub fn queue_cu_mask(&self, queue_id: u64) -> Option<Vec<u32>> {
        self.queues.lock().queues.get(&queue_id).map(|q| q.cu_mask.clone())
    }

    /// Node and descriptor a queue was created with
    pub fn queue_descriptor(&self, queue_id: u64) -> Option<(u32, QueueDescriptor)> {
        self.queues.lock().queues.get(&queue_id).map(|q| (q.node, q.desc))
    }

    /// Last value written to a live queue's doorbell
    pub fn doorbell_value(&self, queue_id: u64) -> Option<u64> {
        self.queues
            .lock()
            .queues
            .get(&queue_id)
            .map(|q| q.doorbell.load(Ordering::Acquire))
    }

    /// Number of live events
    pub fn event_count(&self) -> usize {
        self.events.lock().events.len()
    }

    /// Number of `set_event` calls so far
    pub fn set_event_calls(&self) -> usize {
        self.set_event_calls.load(Ordering::Relaxed)
    }

    fn wait_events(&self, events: &[EventHandle], wait_all: bool, timeout_ms: u32) -> KfdResult<()> {
        if events.is_empty() {
            return Err(DriverError::InvalidParameter);
        }
        let deadline = if timeout_ms == WAIT_INFINITE_MS {
            None
        } else {
            Some(Instant::now() + Duration::from_millis(u64::from(timeout_ms)))
        };

        let mut state = self.events.lock();
        loop {
            let mut ready = 0;
            for event in events {
                match state.events.get(&event.0) {
                    Some(e) if e.signaled => ready += 1,
                    Some(_) => {},
                    None => return Err(DriverError::InvalidHandle),
                }
            }

            let satisfied = if wait_all { ready == events.len() } else { ready > 0 };
            if satisfied {
                for event in events {
                    if let Some(e) = state.events.get_mut(&event.0) {
                        if e.signaled && !e.manual_reset {
                            e.signaled = false;
                            if !wait_all {
                                break;
                            }
                        }
                    }
                }
                return Ok(());
            }

            state = match deadline {
                None => self
                    .events_cv
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(DriverError::WaitTimeout);
                    }
                    self.events_cv
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                },
            };
        }
    }
}

impl Default for SimKfd {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SimKfd {
    fn drop(&mut self) {
        let memory = self.memory.get_mut();
        for (addr, allocation) in memory.allocations.drain() {
            // SAFETY: every entry was produced by alloc_zeroed with this layout
            unsafe { alloc::dealloc(addr as *mut u8, allocation.layout) };
        }
    }
}

impl Kfd for SimKfd {
    fn nodes(&self) -> KfdResult<Vec<NodeProperties>> {
        Ok(self.nodes.clone())
    }

    fn alloc_memory(&self, node: u32, size: usize, flags: MemFlags) -> KfdResult<usize> {
        self.node(node)?;
        if size == 0 {
            return Err(DriverError::InvalidParameter);
        }
        if FaultInjection::take(&self.faults.alloc) {
            return Err(DriverError::OutOfMemory);
        }

        let bytes = if flags.contains(MemFlags::DOUBLE_MAP) {
            size.checked_mul(2).ok_or(DriverError::InvalidParameter)?
        } else {
            size
        };
        let layout =
            Layout::from_size_align(bytes, PAGE_SIZE).map_err(|_| DriverError::InvalidParameter)?;
        // SAFETY: layout has non-zero size
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(DriverError::OutOfMemory);
        }

        let addr = ptr as usize;
        self.memory
            .lock()
            .allocations
            .insert(addr, Allocation { layout, flags });
        log::trace!("sim: alloc {:#x} ({} bytes, {:?}) on node {}", addr, bytes, flags, node);
        Ok(addr)
    }

    fn free_memory(&self, addr: usize, _size: usize) -> KfdResult<()> {
        let mut memory = self.memory.lock();
        let allocation = memory
            .allocations
            .remove(&addr)
            .ok_or(DriverError::InvalidHandle)?;
        memory.mapped.remove(&addr);
        drop(memory);
        log::trace!("sim: free {:#x} ({:?})", addr, allocation.flags);
        // SAFETY: the entry was produced by alloc_zeroed with this layout
        unsafe { alloc::dealloc(addr as *mut u8, allocation.layout) };
        Ok(())
    }

    fn register_memory(&self, addr: usize, size: usize) -> KfdResult<()> {
        if addr == 0 || size == 0 {
            return Err(DriverError::InvalidParameter);
        }
        let end = addr.checked_add(size).ok_or(DriverError::InvalidParameter)?;
        if FaultInjection::take(&self.faults.register) {
            return Err(DriverError::OutOfMemory);
        }

        let mut memory = self.memory.lock();
        if let Some((&prev, &prev_size)) = memory.registered.range(..addr).next_back() {
            if prev + prev_size > addr {
                return Err(DriverError::InvalidParameter);
            }
        }
        if let Some((&next, _)) = memory.registered.range(addr..).next() {
            if next < end {
                return Err(DriverError::InvalidParameter);
            }
        }
        memory.registered.insert(addr, size);
        memory.register_calls += 1;
        Ok(())
    }

    fn deregister_memory(&self, addr: usize) -> KfdResult<()> {
        let mut memory = self.memory.lock();
        memory
            .registered
            .remove(&addr)
            .ok_or(DriverError::InvalidHandle)?;
        memory.deregister_calls += 1;
        Ok(())
    }

    fn map_memory_to_gpu(&self, addr: usize, size: usize, nodes: &[u32]) -> KfdResult<u64> {
        if addr == 0 || size == 0 {
            return Err(DriverError::InvalidParameter);
        }
        for &node in nodes {
            if !self.node(node)?.is_gpu() {
                return Err(DriverError::InvalidParameter);
            }
        }
        if FaultInjection::take(&self.faults.map) {
            return Err(DriverError::OutOfMemory);
        }

        let mut memory = self.memory.lock();
        let entry = memory.mapped.entry(addr).or_insert_with(|| (size, Vec::new()));
        for &node in nodes {
            if !entry.1.contains(&node) {
                entry.1.push(node);
            }
        }
        // Host and GPU share one address space
        Ok(addr as u64)
    }

    fn unmap_memory_from_gpu(&self, addr: usize) -> KfdResult<()> {
        self.memory
            .lock()
            .mapped
            .remove(&addr)
            .map(|_| ())
            .ok_or(DriverError::InvalidHandle)
    }

    fn reserve_scratch(&self, node: u32, size: usize) -> KfdResult<usize> {
        if !self.node(node)?.is_gpu() || size == 0 {
            return Err(DriverError::InvalidParameter);
        }
        let mut memory = self.memory.lock();
        let addr = memory.next_scratch;
        let span = hcr_core::align_up(size, SCRATCH_ALIGN);
        memory.next_scratch = addr.checked_add(span).ok_or(DriverError::OutOfMemory)?;
        memory.scratch.insert(addr, size);
        Ok(addr)
    }

    fn release_scratch(&self, addr: usize, _size: usize) -> KfdResult<()> {
        self.memory
            .lock()
            .scratch
            .remove(&addr)
            .map(|_| ())
            .ok_or(DriverError::InvalidHandle)
    }

    fn create_queue(&self, node: u32, desc: &QueueDescriptor) -> KfdResult<QueueResource> {
        if !self.node(node)?.is_gpu() {
            return Err(DriverError::InvalidParameter);
        }
        if desc.ring_base == 0 || !desc.ring_bytes.is_power_of_two() {
            return Err(DriverError::InvalidParameter);
        }
        if desc.read_index_addr == 0 || desc.write_index_addr == 0 {
            return Err(DriverError::InvalidParameter);
        }
        if FaultInjection::take(&self.faults.queue) {
            return Err(DriverError::OutOfMemory);
        }

        let mut state = self.queues.lock();
        let queue_id = state.next_id;
        state.next_id += 1;
        let doorbell = Box::new(AtomicU64::new(0));
        let doorbell_addr = &*doorbell as *const AtomicU64 as usize;
        state.queues.insert(
            queue_id,
            SimQueue {
                node,
                desc: *desc,
                doorbell,
                cu_mask: Vec::new(),
            },
        );
        log::debug!("sim: created queue {} on node {}", queue_id, node);
        Ok(QueueResource {
            queue_id,
            doorbell_addr,
        })
    }

    fn destroy_queue(&self, queue_id: u64) -> KfdResult<()> {
        let mut state = self.queues.lock();
        let queue = state
            .queues
            .remove(&queue_id)
            .ok_or(DriverError::InvalidHandle)?;
        state.retired_doorbells.push(queue.doorbell);
        log::debug!("sim: destroyed queue {}", queue_id);
        Ok(())
    }

    fn set_queue_cu_mask(&self, queue_id: u64, mask: &[u32]) -> KfdResult<()> {
        if mask.is_empty() {
            return Err(DriverError::InvalidParameter);
        }
        let mut state = self.queues.lock();
        let queue = state
            .queues
            .get_mut(&queue_id)
            .ok_or(DriverError::InvalidHandle)?;
        queue.cu_mask = mask.to_vec();
        Ok(())
    }

    fn create_event(&self, manual_reset: bool, signaled: bool) -> KfdResult<EventHandle> {
        let mut state = self.events.lock();
        let id = state.next_id;
        state.next_id = state.next_id.wrapping_add(1).max(1);
        state.events.insert(
            id,
            SimEvent {
                signaled,
                manual_reset,
            },
        );
        Ok(EventHandle(id))
    }

    fn destroy_event(&self, event: EventHandle) -> KfdResult<()> {
        let removed = self.events.lock().events.remove(&event.0);
        self.events_cv.notify_all();
        removed.map(|_| ()).ok_or(DriverError::InvalidHandle)
    }

    fn set_event(&self, event: EventHandle) -> KfdResult<()> {
        let mut state = self.events.lock();
        let entry = state
            .events
            .get_mut(&event.0)
            .ok_or(DriverError::InvalidHandle)?;
        entry.signaled = true;
        drop(state);
        self.set_event_calls.fetch_add(1, Ordering::Relaxed);
        self.events_cv.notify_all();
        Ok(())
    }

    fn reset_event(&self, event: EventHandle) -> KfdResult<()> {
        let mut state = self.events.lock();
        let entry = state
            .events
            .get_mut(&event.0)
            .ok_or(DriverError::InvalidHandle)?;
        entry.signaled = false;
        Ok(())
    }

    fn wait_on_event(&self, event: EventHandle, timeout_ms: u32) -> KfdResult<()> {
        self.wait_events(&[event], false, timeout_ms)
    }

    fn wait_on_multiple_events(
        &self,
        events: &[EventHandle],
        wait_all: bool,
        timeout_ms: u32,
    ) -> KfdResult<()> {
        self.wait_events(events, wait_all, timeout_ms)
    }

    fn clock_counters(&self, node: u32) -> KfdResult<ClockCounters> {
        self.node(node)?;
        let now = time::now();
        Ok(ClockCounters {
            gpu: now,
            cpu: now,
            system: now,
            system_frequency: time::TIMESTAMP_FREQUENCY,
        })
    }
}
