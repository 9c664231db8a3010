//! # Driver Types
//!
//! Node, memory-heap and queue descriptions exchanged with the kernel driver.

use std::vec::Vec;

// =============================================================================
// NODES
// =============================================================================

/// Kind of compute node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    /// Host CPU complex
    Cpu,
    /// GPU with an AQL command processor
    Gpu,
}

/// Graphics IP version of a GPU node
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GfxVersion {
    /// Major version
    pub major: u8,
    /// Minor version
    pub minor: u8,
    /// Stepping
    pub stepping: u8,
}

impl GfxVersion {
    /// Create a version
    pub const fn new(major: u8, minor: u8, stepping: u8) -> Self {
        Self {
            major,
            minor,
            stepping,
        }
    }

    /// Generations whose command processor cannot tell a full ring from an
    /// empty one when the write pointer wraps
    pub const fn needs_queue_full_workaround(&self) -> bool {
        matches!(
            (self.major, self.minor, self.stepping),
            (7, 0, 0) | (8, 0, 1)
        )
    }
}

/// How the command processor interprets doorbell writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DoorbellType {
    /// 32-bit doorbell holding a wrapped DWORD offset into the ring
    Gfx7Legacy = 0,
    /// 32-bit doorbell holding an unwrapped DWORD count
    Gfx8Legacy = 1,
    /// 64-bit doorbell holding the packet index; hardware checks monotonicity
    Native     = 2,
}

impl DoorbellType {
    /// Is this a 32-bit legacy doorbell?
    pub const fn is_legacy(self) -> bool {
        !matches!(self, DoorbellType::Native)
    }
}

/// Memory heap class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeapType {
    /// Host system memory
    System,
    /// Device frame buffer visible through the host BAR
    FrameBufferPublic,
    /// Device frame buffer not visible to the host
    FrameBufferPrivate,
    /// On-chip group (LDS) memory
    GpuLds,
    /// Per-work-item scratch aperture
    GpuScratch,
}

impl HeapType {
    /// Is this device frame-buffer memory?
    pub const fn is_local(self) -> bool {
        matches!(self, HeapType::FrameBufferPublic | HeapType::FrameBufferPrivate)
    }
}

/// One memory heap reported for a node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryProperties {
    /// Heap class
    pub heap: HeapType,
    /// Physical size in bytes
    pub size: u64,
    /// Base of the heap in the process virtual address space
    pub virtual_base: u64,
    /// Bus width in bits
    pub width: u32,
    /// Peak memory clock in MHz
    pub max_clock_mhz: u32,
}

/// Properties of one topology node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeProperties {
    /// Driver node id
    pub node_id: u32,
    /// CPU or GPU
    pub kind: NodeKind,
    /// Number of CPU cores (CPU nodes)
    pub cpu_cores: u32,
    /// Number of SIMDs (GPU nodes)
    pub simd_count: u32,
    /// SIMDs per compute unit
    pub simd_per_cu: u32,
    /// Wave slots per SIMD
    pub max_waves_per_simd: u32,
    /// Work-items per wavefront
    pub wave_front_size: u32,
    /// Graphics IP version (GPU nodes)
    pub gfx_version: GfxVersion,
    /// Doorbell protocol (GPU nodes)
    pub doorbell_type: DoorbellType,
    /// Memory heaps attached to this node
    pub memory: Vec<MemoryProperties>,
}

impl NodeProperties {
    /// Number of compute units
    pub fn compute_units(&self) -> u32 {
        if self.simd_per_cu == 0 {
            0
        } else {
            self.simd_count / self.simd_per_cu
        }
    }

    /// Is this a GPU node?
    pub fn is_gpu(&self) -> bool {
        self.kind == NodeKind::Gpu
    }
}

// =============================================================================
// MEMORY FLAGS
// =============================================================================

bitflags::bitflags! {
    /// Memory allocation flags passed to the driver
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MemFlags: u32 {
        /// Host may access the allocation
        const HOST_ACCESS = 1 << 0;
        /// Pages may not be swapped
        const NON_PAGED = 1 << 1;
        /// Coherency requires explicit ownership transfer
        const COARSE_GRAIN = 1 << 2;
        /// Do not substitute another heap on exhaustion
        const NO_SUBSTITUTE = 1 << 3;
        /// Host-cached
        const CACHED = 1 << 4;
        /// Executable
        const EXECUTE = 1 << 5;
        /// Scratch aperture backing
        const SCRATCH = 1 << 6;
        /// Reserve twice the size, both halves backed by the same pages
        const DOUBLE_MAP = 1 << 7;
        /// Allocation comes from device-local memory
        const LOCAL = 1 << 8;
    }
}

// =============================================================================
// QUEUES
// =============================================================================

/// Hardware queue creation request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueDescriptor {
    /// Ring buffer base address
    pub ring_base: usize,
    /// Ring buffer reservation in bytes
    pub ring_bytes: usize,
    /// Address of the 64-bit read index the command processor updates
    pub read_index_addr: usize,
    /// Address of the 64-bit write index
    pub write_index_addr: usize,
    /// Percentage of the engine this queue may use
    pub percentage: u32,
    /// Scheduling priority
    pub priority: i32,
}

/// Resources returned for a created hardware queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueResource {
    /// Driver queue id
    pub queue_id: u64,
    /// Address of the 8-byte aligned doorbell slot
    pub doorbell_addr: usize,
}

// =============================================================================
// EVENTS AND CLOCKS
// =============================================================================

/// Driver event handle used for interrupt-driven waits
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventHandle(pub u32);

/// Snapshot of the node clocks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockCounters {
    /// GPU clock counter
    pub gpu: u64,
    /// CPU clock counter
    pub cpu: u64,
    /// System timestamp
    pub system: u64,
    /// System timestamp frequency in Hz
    pub system_frequency: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_full_workaround_generations() {
        assert!(GfxVersion::new(7, 0, 0).needs_queue_full_workaround());
        assert!(GfxVersion::new(8, 0, 1).needs_queue_full_workaround());
        assert!(!GfxVersion::new(8, 0, 3).needs_queue_full_workaround());
        assert!(!GfxVersion::new(9, 0, 0).needs_queue_full_workaround());
    }

    #[test]
    fn test_compute_units() {
        let node = NodeProperties {
            node_id: 1,
            kind: NodeKind::Gpu,
            cpu_cores: 0,
            simd_count: 16,
            simd_per_cu: 4,
            max_waves_per_simd: 10,
            wave_front_size: 64,
            gfx_version: GfxVersion::new(9, 0, 0),
            doorbell_type: DoorbellType::Native,
            memory: Vec::new(),
        };
        assert_eq!(node.compute_units(), 4);
        assert!(node.is_gpu());
    }
}
