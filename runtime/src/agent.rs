//! # Agents
//!
//! An agent is a compute node that owns memory regions and consumes
//! queues. CPU agents consume host queues in software; GPU agents consume
//! AQL queues through their command processor.

use core::fmt;
use std::sync::Arc;
use std::vec::Vec;

use hcr_hal::NodeProperties;
use hcr_memory::{MemoryRegion, RegionId, RegionOwner};

/// Agent identifier, equal to its driver node id
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AgentId(pub u32);

/// Kind of agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentKind {
    /// Host CPU
    Cpu,
    /// GPU
    Gpu,
}

/// Queue sizes an agent accepts, in packets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueLimits {
    /// Smallest capacity
    pub min_size: u32,
    /// Largest capacity
    pub max_size: u32,
    /// Live queues allowed at once
    pub max_queues: u32,
}

impl QueueLimits {
    /// Is `capacity` a legal queue size?
    pub fn accepts(&self, capacity: u32) -> bool {
        capacity.is_power_of_two() && capacity >= self.min_size && capacity <= self.max_size
    }
}

/// A compute node
pub trait Agent: RegionOwner + Send + Sync + fmt::Debug {
    /// Identifier
    fn id(&self) -> AgentId;

    /// CPU or GPU
    fn kind(&self) -> AgentKind;

    /// Driver description of the node
    fn properties(&self) -> &NodeProperties;

    /// Regions owned by the agent
    fn regions(&self) -> &[Arc<MemoryRegion>];

    /// Queue sizes the agent accepts
    fn queue_limits(&self) -> QueueLimits;

    /// The agent as a region owner
    fn as_region_owner(&self) -> &dyn RegionOwner;

    /// Find a region by id
    fn region(&self, id: RegionId) -> Option<Arc<MemoryRegion>> {
        self.regions().iter().find(|r| r.id() == id).cloned()
    }

    /// Region ids owned by the agent
    fn region_ids(&self) -> Vec<RegionId> {
        self.regions().iter().map(|r| r.id()).collect()
    }
}
