//! # Kernel Driver Interface
//!
//! The set of privileged calls the runtime core depends on. Every call is
//! fallible; callers decide whether a failure is a recoverable resource
//! condition or a broken driver invariant.

use core::fmt;
use std::vec::Vec;

use hcr_core::DriverError;

use crate::types::{
    ClockCounters, EventHandle, MemFlags, NodeProperties, QueueDescriptor, QueueResource,
};

/// Result of a driver call
pub type KfdResult<T> = core::result::Result<T, DriverError>;

/// Timeout value meaning "block until signaled"
pub const WAIT_INFINITE_MS: u32 = u32::MAX;

/// Kernel fusion driver thunk
///
/// Addresses are process virtual addresses expressed as `usize`.
pub trait Kfd: Send + Sync + fmt::Debug {
    // =========================================================================
    // Topology
    // =========================================================================

    /// Enumerate topology nodes
    fn nodes(&self) -> KfdResult<Vec<NodeProperties>>;

    // =========================================================================
    // Memory
    // =========================================================================

    /// Allocate `size` bytes from the heap `flags` selects on `node`
    fn alloc_memory(&self, node: u32, size: usize, flags: MemFlags) -> KfdResult<usize>;

    /// Release an allocation made by [`Kfd::alloc_memory`]
    fn free_memory(&self, addr: usize, size: usize) -> KfdResult<()>;

    /// Pin an application range so devices may access it
    fn register_memory(&self, addr: usize, size: usize) -> KfdResult<()>;

    /// Unpin a range pinned by [`Kfd::register_memory`]
    fn deregister_memory(&self, addr: usize) -> KfdResult<()>;

    /// Make memory resident for the given GPU nodes, returning its GPU address
    fn map_memory_to_gpu(&self, addr: usize, size: usize, nodes: &[u32]) -> KfdResult<u64>;

    /// Drop GPU residency established by [`Kfd::map_memory_to_gpu`]
    fn unmap_memory_from_gpu(&self, addr: usize) -> KfdResult<()>;

    /// Reserve a range of the scratch aperture on `node`
    fn reserve_scratch(&self, node: u32, size: usize) -> KfdResult<usize>;

    /// Release a scratch aperture reservation
    fn release_scratch(&self, addr: usize, size: usize) -> KfdResult<()>;

    // =========================================================================
    // Queues
    // =========================================================================

    /// Create a hardware compute queue
    fn create_queue(&self, node: u32, desc: &QueueDescriptor) -> KfdResult<QueueResource>;

    /// Destroy a hardware compute queue
    fn destroy_queue(&self, queue_id: u64) -> KfdResult<()>;

    /// Restrict a queue to the compute units set in `mask`
    fn set_queue_cu_mask(&self, queue_id: u64, mask: &[u32]) -> KfdResult<()>;

    // =========================================================================
    // Events
    // =========================================================================

    /// Create an OS event
    fn create_event(&self, manual_reset: bool, signaled: bool) -> KfdResult<EventHandle>;

    /// Destroy an OS event
    fn destroy_event(&self, event: EventHandle) -> KfdResult<()>;

    /// Signal an event, waking a blocked waiter
    fn set_event(&self, event: EventHandle) -> KfdResult<()>;

    /// Clear an event
    fn reset_event(&self, event: EventHandle) -> KfdResult<()>;

    /// Block until the event is signaled or `timeout_ms` passes
    ///
    /// Expiry is reported as [`DriverError::WaitTimeout`].
    fn wait_on_event(&self, event: EventHandle, timeout_ms: u32) -> KfdResult<()>;

    /// Block until any (or all) of `events` are signaled
    fn wait_on_multiple_events(
        &self,
        events: &[EventHandle],
        wait_all: bool,
        timeout_ms: u32,
    ) -> KfdResult<()>;

    // =========================================================================
    // Clocks
    // =========================================================================

    /// Read the clock counters of `node`
    fn clock_counters(&self, node: u32) -> KfdResult<ClockCounters>;
}
