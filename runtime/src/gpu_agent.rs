//! # GPU Agent
//!
//! Owns the device-local, LDS and scratch regions of one GPU node, the
//! scratch pool shared by its queues, and creates AQL queues.
//!
//! ## Scratch sizing
//!
//! Each queue's default scratch covers every wave slot of the device at the
//! configured per-work-item size; the pool holds that much for every queue
//! the agent allows.

use core::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::vec::Vec;

use hcr_core::{Error, Result, RuntimeFlags};
use hcr_hal::{HeapType, Kfd, NodeProperties};
use hcr_memory::{MemoryRegion, RegionId, RegionOwner};
use hcr_queue::ring::ring_capacity;
use hcr_queue::scratch::SCRATCH_PER_THREAD_ALIGN;
use hcr_queue::{
    AqlQueue, AqlQueueParams, ErrorCallback, QueueFeatures, QueueType, ScratchPool,
    ScratchPoolConfig,
};
use hcr_signal::Signal;

use crate::agent::{Agent, AgentId, AgentKind, QueueLimits};

/// Group memory assumed when the node reports no LDS heap
pub const DEFAULT_GROUP_MEMORY: u32 = 64 << 10;

/// GPU node
#[derive(Debug)]
pub struct GpuAgent {
    props: NodeProperties,
    kfd: Arc<dyn Kfd>,
    regions: Vec<Arc<MemoryRegion>>,
    scratch_pool: Arc<ScratchPool>,
    /// Node whose system memory holds queue rings
    system_node: u32,
    max_queues: u32,
    fault_messages: bool,
    group_memory_limit: u32,
    live_queues: AtomicU32,
}

impl GpuAgent {
    /// Build the agent, its regions and its scratch pool
    pub fn new(
        kfd: Arc<dyn Kfd>,
        props: NodeProperties,
        system_node: u32,
        flags: &RuntimeFlags,
    ) -> Result<Self> {
        if !props.is_gpu() {
            return Err(Error::InvalidAgent);
        }

        let mut regions = Vec::new();
        let mut group_memory_limit = DEFAULT_GROUP_MEMORY;
        for heap in &props.memory {
            let region = Arc::new(MemoryRegion::new(kfd.clone(), props.node_id, *heap, false, false));
            match heap.heap {
                HeapType::FrameBufferPublic | HeapType::FrameBufferPrivate => {
                    region.set_map_targets(vec![props.node_id]);
                },
                HeapType::GpuLds => {
                    group_memory_limit = u32::try_from(heap.size).unwrap_or(u32::MAX);
                },
                _ => {},
            }
            regions.push(region);
        }

        let lanes = (props.compute_units()
            * props.max_waves_per_simd
            * props.simd_per_cu
            * props.wave_front_size) as usize;
        let per_thread = (flags.scratch_mem_size as usize).max(SCRATCH_PER_THREAD_ALIGN);
        let scratch_pool = Arc::new(ScratchPool::new(
            kfd.clone(),
            ScratchPoolConfig {
                node: props.node_id,
                pool_bytes: lanes * per_thread * flags.max_queues as usize,
                default_per_thread: flags.scratch_mem_size as usize,
                lanes,
                min_lanes: (props.compute_units() * props.wave_front_size) as usize,
                no_reclaim: flags.no_scratch_reclaim,
                large_allowed: props.gfx_version.major >= 8,
            },
        )?);

        log::debug!(
            "gpu agent {}: gfx {}.{}.{}, {} CUs, {} scratch bytes",
            props.node_id,
            props.gfx_version.major,
            props.gfx_version.minor,
            props.gfx_version.stepping,
            props.compute_units(),
            scratch_pool.size()
        );
        Ok(Self {
            props,
            kfd,
            regions,
            scratch_pool,
            system_node,
            max_queues: flags.max_queues,
            fault_messages: flags.enable_queue_fault_message,
            group_memory_limit,
            live_queues: AtomicU32::new(0),
        })
    }

    /// Scratch pool shared by the agent's queues
    pub fn scratch_pool(&self) -> &Arc<ScratchPool> {
        &self.scratch_pool
    }

    /// Group segment bytes available per work-group
    pub fn group_memory_limit(&self) -> u32 {
        self.group_memory_limit
    }

    /// Queues currently counted against the limit
    pub fn queue_count(&self) -> u32 {
        self.live_queues.load(Ordering::Acquire)
    }

    /// Create an AQL queue reporting faults through `inactive_signal`
    ///
    /// Counts against the agent's queue limit until
    /// [`GpuAgent::release_queue`] is called.
    pub fn create_queue(
        &self,
        capacity: u32,
        queue_type: QueueType,
        id: u64,
        inactive_signal: Arc<dyn Signal>,
        callback: Option<ErrorCallback>,
    ) -> Result<AqlQueue> {
        if !self.queue_limits().accepts(capacity) {
            return Err(Error::InvalidArgument);
        }
        let reserved = self
            .live_queues
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max_queues).then_some(n + 1)
            });
        if reserved.is_err() {
            log::warn!("gpu agent {}: queue limit {} reached", self.props.node_id, self.max_queues);
            return Err(Error::OutOfResources);
        }

        let params = AqlQueueParams {
            node: self.props.clone(),
            ring_node: self.system_node,
            capacity,
            queue_type,
            features: QueueFeatures::KERNEL_DISPATCH,
            id,
            priority: 0,
            group_memory_limit: self.group_memory_limit,
            fault_messages: self.fault_messages,
        };
        AqlQueue::new(
            self.kfd.clone(),
            params,
            Arc::clone(&self.scratch_pool),
            inactive_signal,
            callback,
        )
        .inspect_err(|_| self.release_queue())
    }

    /// Stop counting a destroyed queue
    pub fn release_queue(&self) {
        let prior = self.live_queues.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prior != 0, "gpu agent queue count underflow");
    }
}

impl RegionOwner for GpuAgent {
    fn node_id(&self) -> u32 {
        self.props.node_id
    }

    fn is_gpu(&self) -> bool {
        true
    }

    fn has_region(&self, region: RegionId) -> bool {
        self.regions.iter().any(|r| r.id() == region)
    }
}

impl Agent for GpuAgent {
    fn id(&self) -> AgentId {
        AgentId(self.props.node_id)
    }

    fn kind(&self) -> AgentKind {
        AgentKind::Gpu
    }

    fn properties(&self) -> &NodeProperties {
        &self.props
    }

    fn regions(&self) -> &[Arc<MemoryRegion>] {
        &self.regions
    }

    fn queue_limits(&self) -> QueueLimits {
        let workaround = self.props.gfx_version.needs_queue_full_workaround();
        QueueLimits {
            min_size: ring_capacity(1, workaround),
            max_size: ring_capacity(u32::MAX, workaround),
            max_queues: self.max_queues,
        }
    }

    fn as_region_owner(&self) -> &dyn RegionOwner {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hcr_core::MemoryConfig;
    use hcr_hal::{DoorbellType, GfxVersion, SimKfd};
    use hcr_memory::Segment;
    use hcr_signal::DefaultSignal;

    fn agent(kfd: &Arc<SimKfd>, max_queues: u64) -> GpuAgent {
        let mut config = MemoryConfig::new();
        config
            .set_uint(hcr_core::config::KEY_MAX_QUEUES, max_queues)
            .set_uint(hcr_core::config::KEY_SCRATCH_MEM, 256);
        let flags = RuntimeFlags::from_provider(&config);
        let node = SimKfd::gpu_node(1, GfxVersion::new(9, 0, 0), DoorbellType::Native);
        GpuAgent::new(kfd.clone(), node, 0, &flags).unwrap()
    }

    fn inactive() -> Arc<dyn Signal> {
        Arc::new(DefaultSignal::new(0))
    }

    #[test]
    fn test_regions_and_scratch_sizing() {
        let kfd = Arc::new(SimKfd::new());
        let gpu = agent(&kfd, 2);
        assert_eq!(gpu.regions().len(), 2);
        assert_eq!(gpu.regions()[0].map_targets(), vec![1]);
        assert_eq!(
            gpu.regions()[1].info(hcr_memory::RegionAttribute::Segment),
            hcr_memory::RegionInfo::Segment(Segment::Group)
        );
        assert_eq!(gpu.group_memory_limit(), 64 << 10);
        // 4 CUs x 10 waves x 4 SIMDs x 64 lanes x 256 bytes x 2 queues
        assert_eq!(gpu.scratch_pool().size(), 10240 * 256 * 2);
        assert_eq!(gpu.queue_limits().min_size, 16);
    }

    #[test]
    fn test_rejects_cpu_node() {
        let kfd = Arc::new(SimKfd::new());
        let result = GpuAgent::new(kfd.clone(), SimKfd::cpu_node(0), 0, &RuntimeFlags::default());
        assert_eq!(result.err(), Some(Error::InvalidAgent));
    }

    #[test]
    fn test_queue_limit() {
        let kfd = Arc::new(SimKfd::new());
        let gpu = agent(&kfd, 2);
        let a = gpu.create_queue(64, QueueType::Multi, 1, inactive(), None).unwrap();
        let _b = gpu.create_queue(64, QueueType::Multi, 2, inactive(), None).unwrap();
        assert_eq!(
            gpu.create_queue(64, QueueType::Multi, 3, inactive(), None).err(),
            Some(Error::OutOfResources)
        );
        drop(a);
        gpu.release_queue();
        assert!(gpu.create_queue(64, QueueType::Multi, 3, inactive(), None).is_ok());
    }

    #[test]
    fn test_invalid_size() {
        let kfd = Arc::new(SimKfd::new());
        let gpu = agent(&kfd, 2);
        assert_eq!(
            gpu.create_queue(100, QueueType::Multi, 1, inactive(), None).err(),
            Some(Error::InvalidArgument)
        );
        assert_eq!(gpu.queue_count(), 0);
    }

    #[test]
    fn test_driver_failure_releases_slot() {
        let kfd = Arc::new(SimKfd::new());
        let gpu = agent(&kfd, 1);
        kfd.fail_queue_creation(1);
        assert_eq!(
            gpu.create_queue(64, QueueType::Multi, 1, inactive(), None).err(),
            Some(Error::OutOfResources)
        );
        assert_eq!(gpu.queue_count(), 0);
    }
}
