//! # CPU Agent
//!
//! Owns the host's system-memory regions and creates host queues, which
//! the application consumes in software.

use std::sync::Arc;
use std::vec::Vec;

use hcr_core::{Error, Result};
use hcr_hal::{HeapType, Kfd, NodeProperties};
use hcr_memory::{MemoryRegion, RegionId, RegionOwner};
use hcr_queue::{HostQueue, QueueFeatures, QueueType};
use hcr_signal::Signal;

use crate::agent::{Agent, AgentId, AgentKind, QueueLimits};

/// Largest host queue in packets
pub const CPU_MAX_QUEUE_SIZE: u32 = 1 << 20;

/// Host CPU complex
#[derive(Debug)]
pub struct CpuAgent {
    props: NodeProperties,
    /// Fine-grained region first, then coarse-grained
    regions: Vec<Arc<MemoryRegion>>,
}

impl CpuAgent {
    /// Build the agent and its system regions
    pub fn new(kfd: Arc<dyn Kfd>, props: NodeProperties) -> Self {
        let mut fine = Vec::new();
        let mut coarse = Vec::new();
        for heap in props.memory.iter().filter(|m| m.heap == HeapType::System) {
            fine.push(Arc::new(MemoryRegion::new(
                kfd.clone(),
                props.node_id,
                *heap,
                true,
                false,
            )));
            coarse.push(Arc::new(MemoryRegion::new(
                kfd.clone(),
                props.node_id,
                *heap,
                false,
                false,
            )));
        }
        fine.extend(coarse);
        log::debug!(
            "cpu agent {}: {} cores, {} regions",
            props.node_id,
            props.cpu_cores,
            fine.len()
        );
        Self {
            props,
            regions: fine,
        }
    }

    /// Fine-grained system region, where host queues and kernel arguments
    /// live
    pub fn system_region(&self) -> Option<&Arc<MemoryRegion>> {
        self.regions.iter().find(|r| r.is_system() && r.fine_grain())
    }

    /// Make every system allocation resident on `gpu_nodes`
    pub fn map_system_memory_to(&self, gpu_nodes: &[u32]) {
        for region in &self.regions {
            region.set_map_targets(gpu_nodes.to_vec());
        }
    }

    /// Create a host queue rung through `doorbell`
    pub fn create_queue(
        &self,
        capacity: u32,
        queue_type: QueueType,
        doorbell: Arc<dyn Signal>,
        doorbell_handle: u64,
        id: u64,
    ) -> Result<HostQueue> {
        if !self.queue_limits().accepts(capacity) {
            return Err(Error::InvalidArgument);
        }
        let region = self.system_region().ok_or(Error::OutOfResources)?;
        HostQueue::new(
            Arc::clone(region),
            capacity,
            queue_type,
            QueueFeatures::AGENT_DISPATCH,
            doorbell,
            doorbell_handle,
            id,
        )
    }
}

impl RegionOwner for CpuAgent {
    fn node_id(&self) -> u32 {
        self.props.node_id
    }

    fn is_gpu(&self) -> bool {
        false
    }

    fn has_region(&self, region: RegionId) -> bool {
        self.regions.iter().any(|r| r.id() == region)
    }
}

impl Agent for CpuAgent {
    fn id(&self) -> AgentId {
        AgentId(self.props.node_id)
    }

    fn kind(&self) -> AgentKind {
        AgentKind::Cpu
    }

    fn properties(&self) -> &NodeProperties {
        &self.props
    }

    fn regions(&self) -> &[Arc<MemoryRegion>] {
        &self.regions
    }

    fn queue_limits(&self) -> QueueLimits {
        QueueLimits {
            min_size: 1,
            max_size: CPU_MAX_QUEUE_SIZE,
            max_queues: u32::MAX,
        }
    }

    fn as_region_owner(&self) -> &dyn RegionOwner {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hcr_hal::SimKfd;
    use hcr_signal::DefaultSignal;

    #[test]
    fn test_system_regions() {
        let kfd = Arc::new(SimKfd::new());
        let agent = CpuAgent::new(kfd, SimKfd::cpu_node(0));
        assert_eq!(agent.regions().len(), 2);
        let system = agent.system_region().unwrap();
        assert!(system.is_kernarg());
        assert!(!agent.regions()[1].fine_grain());
        assert!(agent.has_region(system.id()));
        assert_eq!(agent.region(system.id()).unwrap().id(), system.id());
    }

    #[test]
    fn test_create_queue() {
        let kfd = Arc::new(SimKfd::new());
        let agent = CpuAgent::new(kfd.clone(), SimKfd::cpu_node(0));
        let doorbell: Arc<dyn Signal> = Arc::new(DefaultSignal::new(0));
        assert_eq!(
            agent
                .create_queue(24, QueueType::Multi, doorbell.clone(), 1, 1)
                .err(),
            Some(Error::InvalidArgument)
        );
        let queue = agent
            .create_queue(64, QueueType::Single, doorbell, 1, 2)
            .unwrap();
        assert_eq!(kfd.allocation_count(), 1);
        drop(queue);
        assert_eq!(kfd.allocation_count(), 0);
    }
}
