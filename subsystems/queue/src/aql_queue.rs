//! # Hardware AQL Queue
//!
//! A compute queue consumed by a GPU command processor. The queue is its own
//! doorbell signal: storing to it rings the hardware doorbell.
//!
//! ## Doorbell protocols
//!
//! | Doorbell     | Written value                         | Ordering guard          |
//! |--------------|---------------------------------------|-------------------------|
//! | Native       | end of the published range            | CAS, never regresses    |
//! | Gfx8 legacy  | DWORD count of the published range    | spinlock + high mark    |
//! | Gfx7 legacy  | DWORD offset, wrapped at the ring end | spinlock + high mark    |
//!
//! Legacy doorbells are 32-bit and cannot tell a wrapped index from a stale
//! one, so the value is clamped to one ring length past the read index and
//! only written when it exceeds the highest value rung so far.
//!
//! ## Faults
//!
//! The command processor reports a fault by storing its code into the
//! queue-inactive signal and stalling on the faulting packet. Insufficient
//! scratch is recovered in place by [`AqlQueue::handle_fault`]; every other
//! code inactivates the queue and reports through the error callback.

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::vec::Vec;

use hcr_core::atomic::{self, MemoryOrder};
use hcr_core::{align_up, DriverError, Error, KernelMutex, Result};
use hcr_hal::{DoorbellType, Kfd, NodeProperties, QueueDescriptor};
use hcr_signal::{Condition, RmwOp, Signal, SignalCore, SignalKind, SignalValue, WaitState};

use crate::amd_queue::{AmdQueue, AmdQueueInit, QueueFeatures, QueueProperties, QueueType};
use crate::packet::{self, AqlPacket, PACKET_WORDS};
use crate::queue::{ErrorCallback, Queue};
use crate::ring::{ring_capacity, RingBuffer};
use crate::scratch::{ScratchInfo, ScratchPool, SCRATCH_PER_THREAD_ALIGN};

// =============================================================================
// FAULT CODES
// =============================================================================

/// Dispatch needs more scratch than the queue holds
pub const FAULT_SCRATCH: SignalValue = 1;
/// Malformed dispatch dimensions
pub const FAULT_INVALID_DIMENSIONS: SignalValue = 2;
/// Group segment larger than the device allows
pub const FAULT_GROUP_MEMORY: SignalValue = 4;
/// Null or invalid kernel code object
pub const FAULT_CODE_OBJECT: SignalValue = 8;
/// Unsupported or malformed packet
pub const FAULT_PACKET_FORMAT: SignalValue = 32;
/// OR-ed into the inactive signal when released scratch may satisfy a retry
pub const SCRATCH_RETRY: SignalValue = 1 << 30;

/// Status reported for a terminal fault code
pub fn fault_status(code: SignalValue) -> Error {
    if code & FAULT_INVALID_DIMENSIONS != 0 {
        Error::IncompatibleArguments
    } else if code & FAULT_GROUP_MEMORY != 0 {
        Error::InvalidAllocation
    } else if code & FAULT_CODE_OBJECT != 0 {
        Error::InvalidCodeObject
    } else if code & FAULT_PACKET_FORMAT != 0 {
        Error::InvalidPacketFormat
    } else {
        Error::Driver(DriverError::Failure)
    }
}

// =============================================================================
// SCRATCH DESCRIPTOR
// =============================================================================

const SRD_SWIZZLE_ENABLE: u32 = 1 << 31;
const SRD_DST_SEL_XYZW: u32 = 4 | 5 << 3 | 6 << 6 | 7 << 9;
const SRD_NUM_FORMAT_FLOAT: u32 = 7 << 12;
const SRD_DATA_FORMAT_32: u32 = 4 << 15;
const SRD_ADD_TID_ENABLE: u32 = 1 << 23;
const SRD_WORD3: u32 = SRD_DST_SEL_XYZW | SRD_NUM_FORMAT_FLOAT | SRD_DATA_FORMAT_32 | SRD_ADD_TID_ENABLE;

const TMPRING_WAVES_MASK: u32 = 0xFFF;
const TMPRING_WAVESIZE_SHIFT: u32 = 12;
const TMPRING_WAVESIZE_MASK: u32 = 0x1FFF;

// =============================================================================
// QUEUE
// =============================================================================

/// Creation parameters of an [`AqlQueue`]
#[derive(Debug, Clone)]
pub struct AqlQueueParams {
    /// GPU node consuming the queue
    pub node: NodeProperties,
    /// Node whose system memory holds the ring
    pub ring_node: u32,
    /// Requested capacity in packets
    pub capacity: u32,
    /// Producer model
    pub queue_type: QueueType,
    /// Accepted packet classes
    pub features: QueueFeatures,
    /// Process-unique queue id
    pub id: u64,
    /// Scheduling priority
    pub priority: i32,
    /// Group segment bytes available per work-group
    pub group_memory_limit: u32,
    /// Log terminal faults at error level
    pub fault_messages: bool,
}

/// Outcome of a scratch growth attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScratchGrowth {
    Resumed,
    Retry,
    Exhausted,
}

/// GPU compute queue
pub struct AqlQueue {
    amd: Box<AmdQueue>,
    core: SignalCore,
    kfd: Arc<dyn Kfd>,
    ring: RingBuffer,
    node_id: u32,
    doorbell_type: DoorbellType,
    queue_full_workaround: bool,
    queue_id: u64,
    doorbell_addr: usize,
    active: AtomicBool,
    wave_front_size: u32,
    group_memory_limit: u32,
    cu_mask: KernelMutex<Vec<u32>>,
    scratch: KernelMutex<ScratchInfo>,
    scratch_pool: Arc<ScratchPool>,
    inactive_signal: Arc<dyn Signal>,
    error_callback: Option<ErrorCallback>,
    fault_messages: bool,
}

impl AqlQueue {
    /// Create the ring, acquire default scratch and register the queue with
    /// the driver
    ///
    /// The requested capacity is rounded to a power of two and clamped to
    /// what the hardware accepts.
    pub fn new(
        kfd: Arc<dyn Kfd>,
        params: AqlQueueParams,
        scratch_pool: Arc<ScratchPool>,
        inactive_signal: Arc<dyn Signal>,
        error_callback: Option<ErrorCallback>,
    ) -> Result<Self> {
        let node = &params.node;
        if !node.is_gpu() {
            return Err(Error::InvalidAgent);
        }
        let workaround = node.gfx_version.needs_queue_full_workaround();
        let capacity = ring_capacity(params.capacity, workaround);
        let ring = RingBuffer::allocate(
            kfd.clone(),
            params.ring_node,
            node.node_id,
            capacity,
            workaround,
        )?;

        let wave_slots = node.max_waves_per_simd * node.simd_per_cu;
        let amd = Box::new(AmdQueue::new(AmdQueueInit {
            queue_type: params.queue_type,
            features: params.features,
            base_address: ring.base(),
            size: capacity,
            id: params.id,
            max_cu_id: node.compute_units().saturating_sub(1),
            max_wave_id: wave_slots.saturating_sub(1),
            properties: QueueProperties::IS_PTR64,
        }));

        let mut scratch = ScratchInfo::default();
        scratch_pool.acquire(&mut scratch);
        if !scratch.is_held() {
            log::warn!("queue {}: no default scratch, dispatches will fault", params.id);
        }

        let desc = QueueDescriptor {
            ring_base: ring.base(),
            ring_bytes: ring.hardware_bytes(),
            read_index_addr: amd.read_index_addr(),
            write_index_addr: amd.write_index_addr(),
            percentage: 100,
            priority: params.priority,
        };
        let resource = match kfd.create_queue(node.node_id, &desc) {
            Ok(resource) => resource,
            Err(err) => {
                log::warn!("queue {}: driver queue creation failed: {}", params.id, err);
                scratch_pool.release(&mut scratch);
                return Err(Error::OutOfResources);
            },
        };

        let kind = if node.doorbell_type.is_legacy() {
            SignalKind::LegacyDoorbell
        } else {
            SignalKind::Doorbell
        };
        let queue = Self {
            amd,
            core: SignalCore::new(kind, resource.doorbell_addr as SignalValue),
            kfd,
            ring,
            node_id: node.node_id,
            doorbell_type: node.doorbell_type,
            queue_full_workaround: workaround,
            queue_id: resource.queue_id,
            doorbell_addr: resource.doorbell_addr,
            active: AtomicBool::new(true),
            wave_front_size: node.wave_front_size,
            group_memory_limit: params.group_memory_limit,
            cu_mask: KernelMutex::new(Vec::new()),
            scratch: KernelMutex::new(scratch),
            scratch_pool,
            inactive_signal,
            error_callback,
            fault_messages: params.fault_messages,
        };
        queue.init_scratch_srd(&scratch);
        log::debug!(
            "queue {}: {} packets on node {}, driver queue {}, {:?} doorbell",
            params.id,
            capacity,
            queue.node_id,
            queue.queue_id,
            queue.doorbell_type
        );
        Ok(queue)
    }

    /// Record the public handles of the doorbell and inactive signals
    pub fn bind_handles(&self, doorbell: u64, inactive: u64) {
        self.amd
            .hsa_queue
            .doorbell_signal
            .store(doorbell, Ordering::Release);
        self.amd
            .queue_inactive_signal
            .store(inactive, Ordering::Release);
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Driver queue id
    pub fn queue_id(&self) -> u64 {
        self.queue_id
    }

    /// GPU node consuming the queue
    pub fn node_id(&self) -> u32 {
        self.node_id
    }

    /// Doorbell protocol
    pub fn doorbell_type(&self) -> DoorbellType {
        self.doorbell_type
    }

    /// Is the ring double mapped for the queue-full workaround?
    pub fn queue_full_workaround(&self) -> bool {
        self.queue_full_workaround
    }

    /// Signal faults are reported through
    pub fn inactive_signal(&self) -> &Arc<dyn Signal> {
        &self.inactive_signal
    }

    /// Group segment bytes available per work-group
    pub fn group_memory_limit(&self) -> u32 {
        self.group_memory_limit
    }

    /// Current scratch state
    pub fn scratch(&self) -> ScratchInfo {
        *self.scratch.lock()
    }

    /// CU mask last programmed
    pub fn cu_mask(&self) -> Vec<u32> {
        self.cu_mask.lock().clone()
    }

    /// Ring slot of packet `index`
    pub fn ring_slot(&self, index: u64) -> *mut AqlPacket {
        self.ring.slot(index)
    }

    // =========================================================================
    // Doorbell
    // =========================================================================

    fn hardware_doorbell(&self) -> &AtomicU64 {
        // SAFETY: the driver maps the 8-byte aligned doorbell slot for the
        // life of the process, and we hold the driver
        unsafe { &*(self.doorbell_addr as *const AtomicU64) }
    }

    /// End of the range the command processor has been told about
    pub fn published_end(&self) -> u64 {
        match self.doorbell_type {
            DoorbellType::Native => self.hardware_doorbell().load(Ordering::Acquire),
            DoorbellType::Gfx8Legacy => {
                self.hardware_doorbell().load(Ordering::Acquire) / PACKET_WORDS as u64
            },
            // The wrapped offset is ambiguous; the high mark is not
            DoorbellType::Gfx7Legacy => self
                .amd
                .max_legacy_doorbell_dispatch_id_plus_1
                .load(Ordering::Acquire),
        }
    }

    /// Ring the doorbell for every packet below `end`
    pub fn ring_doorbell(&self, end: u64) {
        if self.doorbell_type == DoorbellType::Native {
            atomic::advance_monotonic(self.hardware_doorbell(), end, MemoryOrder::Release);
            return;
        }

        let _lock = self.amd.lock_legacy_doorbell();
        let size = u64::from(self.amd.size());
        let read = self.amd.read_dispatch_id.load(Ordering::Acquire);
        let clamped = end.min(read + size);
        if clamped < end {
            log::trace!("queue {}: legacy doorbell clamped {} -> {}", self.id(), end, clamped);
        }
        let high = &self.amd.max_legacy_doorbell_dispatch_id_plus_1;
        if clamped <= high.load(Ordering::Relaxed) {
            return;
        }
        high.store(clamped, Ordering::Release);

        let dwords = match self.doorbell_type {
            DoorbellType::Gfx8Legacy => clamped * PACKET_WORDS as u64,
            _ => {
                let ring_packets = if self.queue_full_workaround { size * 2 } else { size };
                (clamped & (ring_packets - 1)) * PACKET_WORDS as u64
            },
        };
        self.hardware_doorbell()
            .store(u64::from(dwords as u32), Ordering::Release);
    }

    // =========================================================================
    // Scratch
    // =========================================================================

    /// Program the scratch descriptor fields for `scratch`
    fn init_scratch_srd(&self, scratch: &ScratchInfo) {
        let amd = &self.amd;
        let srd = &amd.scratch_resource_descriptor;
        if !scratch.is_held() {
            for word in srd {
                word.store(0, Ordering::Relaxed);
            }
            amd.compute_tmpring_size.store(0, Ordering::Relaxed);
            amd.scratch_backing_memory_location.store(0, Ordering::Relaxed);
            amd.scratch_backing_memory_byte_size.store(0, Ordering::Relaxed);
            amd.scratch_workitem_byte_size.store(0, Ordering::Release);
            return;
        }

        let base = scratch.queue_base as u64;
        srd[0].store(base as u32, Ordering::Relaxed);
        srd[1].store(((base >> 32) as u32 & 0xFFFF) | SRD_SWIZZLE_ENABLE, Ordering::Relaxed);
        srd[2].store(u32::try_from(scratch.size).unwrap_or(u32::MAX), Ordering::Relaxed);
        srd[3].store(SRD_WORD3, Ordering::Relaxed);

        let wave_bytes = scratch.size_per_thread * self.wave_front_size as usize;
        let (waves, wave_kib) = if wave_bytes == 0 {
            (0, 0)
        } else {
            (scratch.size / wave_bytes, wave_bytes.div_ceil(1024))
        };
        let tmpring = (waves as u32).min(TMPRING_WAVES_MASK)
            | ((wave_kib as u32).min(TMPRING_WAVESIZE_MASK) << TMPRING_WAVESIZE_SHIFT);
        amd.compute_tmpring_size.store(tmpring, Ordering::Relaxed);
        amd.scratch_backing_memory_location
            .store(scratch.queue_process_offset as u64, Ordering::Relaxed);
        amd.scratch_backing_memory_byte_size
            .store(scratch.size as u64, Ordering::Relaxed);
        amd.scratch_workitem_byte_size.store(
            u32::try_from(scratch.size_per_thread).unwrap_or(u32::MAX),
            Ordering::Release,
        );
    }

    fn grow_scratch(&self) -> ScratchGrowth {
        let mut scratch = self.scratch.lock();
        if !scratch.retry {
            self.scratch_pool.release(&mut scratch);
            let read = self.amd.read_dispatch_id.load(Ordering::Acquire);
            // SAFETY: the faulting packet stays in its slot while the
            // command processor is stalled on it
            let pkt = unsafe { packet::load_packet(self.ring.slot(read)) }.as_kernel_dispatch();
            let per_thread = (scratch.size_per_thread * 2).max(pkt.private_segment_size as usize);
            scratch.size_per_thread = align_up(per_thread, SCRATCH_PER_THREAD_ALIGN);
            scratch.size = self.scratch_pool.queue_bytes(scratch.size_per_thread);
            log::debug!(
                "queue {}: growing scratch to {} bytes per work-item",
                self.id(),
                scratch.size_per_thread
            );
        }

        self.scratch_pool.acquire_or_notify(
            &mut scratch,
            Arc::clone(&self.inactive_signal),
            SCRATCH_RETRY,
        );
        if scratch.retry {
            return ScratchGrowth::Retry;
        }
        self.init_scratch_srd(&scratch);
        if scratch.is_held() {
            ScratchGrowth::Resumed
        } else {
            ScratchGrowth::Exhausted
        }
    }

    // =========================================================================
    // Faults
    // =========================================================================

    /// React to the inactive signal holding `value`
    ///
    /// Returns the condition to wait for before calling again, or `None`
    /// once the queue is dead.
    pub fn handle_fault(&self, value: SignalValue) -> Option<(Condition, SignalValue)> {
        let mut code = value;
        if code & SCRATCH_RETRY != 0 {
            self.inactive_signal.and_acq_rel(!SCRATCH_RETRY);
            code &= !SCRATCH_RETRY;
        }
        if !self.is_active() {
            return None;
        }
        if code == 0 {
            return Some((Condition::Ne, 0));
        }

        let status = if code & FAULT_SCRATCH != 0 {
            match self.grow_scratch() {
                ScratchGrowth::Resumed => {
                    self.inactive_signal.store_release(0);
                    return Some((Condition::Ne, 0));
                },
                ScratchGrowth::Retry => return Some((Condition::Ne, code)),
                ScratchGrowth::Exhausted => Error::OutOfResources,
            }
        } else {
            fault_status(code)
        };

        if self.fault_messages {
            log::error!("queue {}: fault {:#x}: {}", self.id(), code, status);
        } else {
            log::debug!("queue {}: fault {:#x}: {}", self.id(), code, status);
        }
        if let Err(err) = self.inactivate() {
            log::error!("queue {}: inactivation after fault failed: {}", self.id(), err);
        }
        if let Some(callback) = &self.error_callback {
            callback(status, self.id());
        }
        None
    }
}

impl core::fmt::Debug for AqlQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AqlQueue")
            .field("id", &self.id())
            .field("queue_id", &self.queue_id)
            .field("node_id", &self.node_id)
            .field("capacity", &self.amd.size())
            .field("doorbell_type", &self.doorbell_type)
            .field("active", &self.is_active())
            .finish()
    }
}

impl Queue for AqlQueue {
    fn amd_queue(&self) -> &AmdQueue {
        &self.amd
    }

    fn doorbell(&self) -> &dyn Signal {
        self
    }

    fn inactivate(&self) -> Result<()> {
        if !self.active.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        self.scratch_pool.remove_notifier(&self.inactive_signal);
        log::debug!("queue {}: inactivated", self.id());
        self.kfd.destroy_queue(self.queue_id).map_err(Error::from)
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn set_cu_masking(&self, count: u32, mask: &[u32]) -> Result<()> {
        if count == 0 || count % 32 != 0 {
            return Err(Error::InvalidArgument);
        }
        let words = (count / 32) as usize;
        if mask.len() < words {
            return Err(Error::InvalidArgument);
        }
        if !self.is_active() {
            return Err(Error::InvalidQueue);
        }
        let mask = &mask[..words];
        self.kfd
            .set_queue_cu_mask(self.queue_id, mask)
            .map_err(|err| {
                log::warn!("queue {}: CU mask rejected: {}", self.id(), err);
                Error::from(err)
            })?;
        *self.cu_mask.lock() = mask.to_vec();
        Ok(())
    }

    fn publish(&self, end: u64) {
        self.ring_doorbell(end);
    }
}

/// Storing to the queue rings its doorbell; loads report the published end
///
/// Only loads and stores are meaningful on a hardware doorbell. The other
/// operations are misuse: they assert in debug builds and otherwise leave
/// the doorbell untouched, returning the published end.
impl Signal for AqlQueue {
    fn core(&self) -> &SignalCore {
        &self.core
    }

    fn load(&self, _order: MemoryOrder) -> SignalValue {
        self.published_end() as SignalValue
    }

    fn store(&self, value: SignalValue, _order: MemoryOrder) {
        self.ring_doorbell(u64::try_from(value).unwrap_or(0));
    }

    fn rmw(&self, op: RmwOp, _value: SignalValue, _order: MemoryOrder) -> SignalValue {
        debug_assert!(false, "{:?} is not supported on a doorbell", op);
        self.published_end() as SignalValue
    }

    fn cas(&self, _expected: SignalValue, _value: SignalValue, _order: MemoryOrder) -> SignalValue {
        debug_assert!(false, "compare-and-swap is not supported on a doorbell");
        self.published_end() as SignalValue
    }

    fn wait(
        &self,
        _condition: Condition,
        _compare: SignalValue,
        _timeout: u64,
        _hint: WaitState,
        _order: MemoryOrder,
    ) -> SignalValue {
        debug_assert!(false, "waiting is not supported on a doorbell");
        self.published_end() as SignalValue
    }
}

impl Drop for AqlQueue {
    fn drop(&mut self) {
        if let Err(err) = self.inactivate() {
            log::error!("queue {}: driver queue destruction failed: {}", self.id(), err);
        }
        let scratch = self.scratch.get_mut();
        self.scratch_pool.release(scratch);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{KernelDispatchPacket, PacketHeader, PacketType};
    use crate::scratch::ScratchPoolConfig;
    use hcr_hal::{GfxVersion, SimKfd};
    use hcr_signal::DefaultSignal;
    use std::sync::Mutex;

    fn pool(kfd: &Arc<SimKfd>, node: &NodeProperties, per_thread: usize) -> Arc<ScratchPool> {
        let lanes = (node.compute_units() * node.max_waves_per_simd * node.simd_per_cu
            * node.wave_front_size) as usize;
        Arc::new(
            ScratchPool::new(
                kfd.clone(),
                ScratchPoolConfig {
                    node: node.node_id,
                    pool_bytes: lanes * 1024 * 8,
                    default_per_thread: per_thread,
                    lanes,
                    min_lanes: (node.compute_units() * node.wave_front_size) as usize,
                    no_reclaim: false,
                    large_allowed: true,
                },
            )
            .unwrap(),
        )
    }

    fn params(node: NodeProperties, capacity: u32) -> AqlQueueParams {
        AqlQueueParams {
            node,
            ring_node: 0,
            capacity,
            queue_type: QueueType::Multi,
            features: QueueFeatures::KERNEL_DISPATCH,
            id: 9,
            priority: 0,
            group_memory_limit: 64 << 10,
            fault_messages: false,
        }
    }

    fn queue_on(
        gfx: GfxVersion,
        doorbell: DoorbellType,
        callback: Option<ErrorCallback>,
    ) -> (Arc<SimKfd>, AqlQueue) {
        let node = SimKfd::gpu_node(1, gfx, doorbell);
        let kfd = Arc::new(SimKfd::with_nodes(vec![SimKfd::cpu_node(0), node.clone()]));
        let pool = pool(&kfd, &node, 16);
        let inactive: Arc<dyn Signal> = Arc::new(DefaultSignal::new(0));
        let queue = AqlQueue::new(kfd.clone(), params(node, 16), pool, inactive, callback).unwrap();
        (kfd, queue)
    }

    fn dispatch(private_segment_size: u32, kernel_object: u64) -> AqlPacket {
        KernelDispatchPacket {
            header: PacketHeader::new(PacketType::KernelDispatch).raw(),
            setup: 1,
            workgroup_size_x: 64,
            workgroup_size_y: 1,
            workgroup_size_z: 1,
            grid_size_x: 256,
            grid_size_y: 1,
            grid_size_z: 1,
            private_segment_size,
            kernel_object,
            ..Default::default()
        }
        .into()
    }

    #[test]
    fn test_create_registers_driver_queue() {
        let (kfd, queue) = queue_on(GfxVersion::new(9, 0, 0), DoorbellType::Native, None);
        let (node, desc) = kfd.queue_descriptor(queue.queue_id()).unwrap();
        assert_eq!(node, 1);
        assert_eq!(desc.ring_base, queue.amd_queue().base_address());
        assert_eq!(desc.ring_bytes, 16 * 64);
        assert_eq!(desc.read_index_addr, queue.amd_queue().read_index_addr());
        assert_eq!(queue.kind(), SignalKind::Doorbell);
        assert_eq!(queue.amd_queue().max_cu_id, 3);
        assert_eq!(queue.amd_queue().max_wave_id, 39);
        assert!(queue.scratch().is_held());
        assert_eq!(queue.amd_queue().scratch_workitem_byte_size.load(Ordering::Relaxed), 16);
    }

    #[test]
    fn test_rejects_cpu_node() {
        let kfd = Arc::new(SimKfd::new());
        let gpu = SimKfd::gpu_node(1, GfxVersion::new(9, 0, 0), DoorbellType::Native);
        let pool = pool(&kfd, &gpu, 16);
        let inactive: Arc<dyn Signal> = Arc::new(DefaultSignal::new(0));
        let result = AqlQueue::new(
            kfd.clone(),
            params(SimKfd::cpu_node(0), 16),
            pool,
            inactive,
            None,
        );
        assert_eq!(result.err(), Some(Error::InvalidAgent));
    }

    #[test]
    fn test_driver_failure_releases_resources() {
        let node = SimKfd::gpu_node(1, GfxVersion::new(9, 0, 0), DoorbellType::Native);
        let kfd = Arc::new(SimKfd::with_nodes(vec![SimKfd::cpu_node(0), node.clone()]));
        let pool = pool(&kfd, &node, 16);
        kfd.fail_queue_creation(1);
        let inactive: Arc<dyn Signal> = Arc::new(DefaultSignal::new(0));
        let result = AqlQueue::new(kfd.clone(), params(node, 16), pool.clone(), inactive, None);
        assert_eq!(result.err(), Some(Error::OutOfResources));
        assert_eq!(pool.remaining(), pool.size());
        assert_eq!(kfd.allocation_count(), 0);
    }

    #[test]
    fn test_native_doorbell_never_regresses() {
        let (kfd, queue) = queue_on(GfxVersion::new(9, 0, 0), DoorbellType::Native, None);
        queue.publish(3);
        queue.publish(1);
        assert_eq!(kfd.doorbell_value(queue.queue_id()), Some(3));
        queue.store_release(5);
        assert_eq!(queue.load_acquire(), 5);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "not supported on a doorbell")]
    fn test_doorbell_rejects_cas() {
        let (_kfd, queue) = queue_on(GfxVersion::new(9, 0, 0), DoorbellType::Native, None);
        queue.cas_relaxed(0, 1);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "not supported on a doorbell")]
    fn test_doorbell_rejects_wait() {
        let (_kfd, queue) = queue_on(GfxVersion::new(9, 0, 0), DoorbellType::Native, None);
        queue.wait_relaxed(Condition::Eq, 0, 0, WaitState::Active);
    }

    #[test]
    fn test_gfx8_legacy_doorbell_clamps() {
        let (kfd, queue) = queue_on(GfxVersion::new(8, 0, 3), DoorbellType::Gfx8Legacy, None);
        assert_eq!(queue.kind(), SignalKind::LegacyDoorbell);
        queue.publish(20);
        // One ring length past the read index, as a DWORD count
        assert_eq!(kfd.doorbell_value(queue.queue_id()), Some(16 * 16));
        assert_eq!(queue.published_end(), 16);
        queue.publish(10);
        assert_eq!(queue.published_end(), 16);

        queue.amd_queue().read_dispatch_id.store(8, Ordering::Release);
        queue.publish(20);
        assert_eq!(queue.published_end(), 20);
        assert_eq!(queue.amd_queue().legacy_doorbell_lock.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_gfx7_legacy_doorbell_wraps() {
        let (kfd, queue) = queue_on(GfxVersion::new(7, 0, 0), DoorbellType::Gfx7Legacy, None);
        assert!(queue.queue_full_workaround());
        assert_eq!(queue.capacity(), 64);
        let (_, desc) = kfd.queue_descriptor(queue.queue_id()).unwrap();
        assert_eq!(desc.ring_bytes, 2 * 64 * 64);

        queue.publish(40);
        assert_eq!(kfd.doorbell_value(queue.queue_id()), Some(40 * 16));
        queue.amd_queue().read_dispatch_id.store(100, Ordering::Release);
        queue.publish(130);
        // Wrapped at twice the ring length
        assert_eq!(kfd.doorbell_value(queue.queue_id()), Some(2 * 16));
        assert_eq!(queue.published_end(), 130);
    }

    #[test]
    fn test_cu_masking() {
        let (kfd, queue) = queue_on(GfxVersion::new(9, 0, 0), DoorbellType::Native, None);
        assert_eq!(queue.set_cu_masking(31, &[0xF]), Err(Error::InvalidArgument));
        assert_eq!(queue.set_cu_masking(64, &[0xF]), Err(Error::InvalidArgument));
        queue.set_cu_masking(32, &[0x5, 0xFF]).unwrap();
        assert_eq!(kfd.queue_cu_mask(queue.queue_id()), Some(vec![0x5]));
        assert_eq!(queue.cu_mask(), vec![0x5]);
    }

    #[test]
    fn test_inactivate_is_idempotent() {
        let (kfd, queue) = queue_on(GfxVersion::new(9, 0, 0), DoorbellType::Native, None);
        assert_eq!(kfd.queue_count(), 1);
        queue.inactivate().unwrap();
        queue.inactivate().unwrap();
        assert!(!queue.is_active());
        assert_eq!(kfd.queue_count(), 0);
        assert_eq!(queue.set_cu_masking(32, &[1]), Err(Error::InvalidQueue));
    }

    #[test]
    fn test_scratch_fault_grows_and_resumes() {
        let (_kfd, queue) = queue_on(GfxVersion::new(9, 0, 0), DoorbellType::Native, None);
        let index = queue.submit(&dispatch(100, 0x1000)).unwrap();
        assert_eq!(index, 0);
        queue.inactive_signal().store_release(FAULT_SCRATCH);

        assert_eq!(queue.handle_fault(FAULT_SCRATCH), Some((Condition::Ne, 0)));
        assert_eq!(queue.inactive_signal().load_acquire(), 0);
        let scratch = queue.scratch();
        // max(2 * 16, 100) rounded to 16
        assert_eq!(scratch.size_per_thread, 112);
        assert!(scratch.is_held());
        assert_eq!(
            queue.amd_queue().scratch_workitem_byte_size.load(Ordering::Relaxed),
            112
        );
        assert!(queue.is_active());
        // Packet is still in place for the command processor
        // SAFETY: slot of a live ring
        let pkt = unsafe { packet::load_packet(queue.ring_slot(0)) };
        assert_eq!(pkt.as_kernel_dispatch().private_segment_size, 100);
    }

    #[test]
    fn test_terminal_fault_inactivates_then_reports() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callback: ErrorCallback = Arc::new(move |status, id| {
            sink.lock().unwrap().push((status, id));
        });
        let (kfd, queue) = queue_on(GfxVersion::new(9, 0, 0), DoorbellType::Native, Some(callback));
        assert_eq!(queue.handle_fault(FAULT_CODE_OBJECT), None);
        assert!(!queue.is_active());
        assert_eq!(kfd.queue_count(), 0);
        assert_eq!(*seen.lock().unwrap(), vec![(Error::InvalidCodeObject, 9)]);
        assert_eq!(queue.handle_fault(FAULT_CODE_OBJECT), None);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_fault_status_mapping() {
        assert_eq!(fault_status(FAULT_INVALID_DIMENSIONS), Error::IncompatibleArguments);
        assert_eq!(fault_status(FAULT_GROUP_MEMORY), Error::InvalidAllocation);
        assert_eq!(fault_status(FAULT_CODE_OBJECT), Error::InvalidCodeObject);
        assert_eq!(fault_status(FAULT_PACKET_FORMAT), Error::InvalidPacketFormat);
    }

    #[test]
    fn test_drop_releases_everything() {
        let node = SimKfd::gpu_node(1, GfxVersion::new(9, 0, 0), DoorbellType::Native);
        let kfd = Arc::new(SimKfd::with_nodes(vec![SimKfd::cpu_node(0), node.clone()]));
        let pool = pool(&kfd, &node, 16);
        let inactive: Arc<dyn Signal> = Arc::new(DefaultSignal::new(0));
        let queue = AqlQueue::new(kfd.clone(), params(node, 16), pool.clone(), inactive, None).unwrap();
        drop(queue);
        assert_eq!(kfd.queue_count(), 0);
        assert_eq!(kfd.allocation_count(), 0);
        assert_eq!(pool.remaining(), pool.size());
    }
}
