//! # Memory Regions
//!
//! A region is one heap class of one agent: system memory, device frame
//! buffer, group (LDS) memory or the scratch aperture. Regions are built
//! once from driver topology and never change afterwards; the only mutable
//! state is the list of GPU nodes new allocations are made resident on.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::vec::Vec;

use hcr_core::{align_down, align_up, Error, Result, PAGE_SIZE};
use hcr_hal::{HeapType, Kfd, MemFlags, MemoryProperties};
use spin::RwLock;

/// Top of the user-mode virtual address space
const USER_VA_LIMIT: u64 = 1 << 47;

static NEXT_REGION_ID: AtomicU64 = AtomicU64::new(1);

// =============================================================================
// ATTRIBUTES
// =============================================================================

/// Process-unique region identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RegionId(pub u64);

/// Memory segment a region belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Segment {
    /// Globally addressable memory
    Global,
    /// Read-only memory
    ReadOnly,
    /// Per-work-item private memory
    Private,
    /// Per-work-group memory
    Group,
    /// Kernel argument memory
    Kernarg,
}

bitflags::bitflags! {
    /// Properties of a global-segment region
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct GlobalFlags: u32 {
        /// Kernel arguments may be placed here
        const KERNARG = 1 << 0;
        /// Coherent across agents at all times
        const FINE_GRAINED = 1 << 1;
        /// Coherent only after an ownership transfer
        const COARSE_GRAINED = 1 << 2;
    }
}

/// Region attribute selector for [`MemoryRegion::info`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegionAttribute {
    /// [`RegionInfo::Segment`]
    Segment,
    /// [`RegionInfo::GlobalFlags`]
    GlobalFlags,
    /// Physical size in bytes
    Size,
    /// Largest single allocation in bytes
    AllocMaxSize,
    /// Can the runtime allocate from this region?
    RuntimeAllocAllowed,
    /// Allocation size granularity in bytes
    RuntimeAllocGranule,
    /// Allocation alignment in bytes
    RuntimeAllocAlignment,
    /// Can the host touch allocations directly?
    HostAccessible,
    /// Base address of the region
    Base,
}

/// Value of one region attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionInfo {
    /// Segment
    Segment(Segment),
    /// Global segment flags
    GlobalFlags(GlobalFlags),
    /// Byte count
    Size(usize),
    /// Yes/no attribute
    Bool(bool),
    /// Address
    Address(usize),
}

/// Access granted by [`MemoryRegion::assign_agent`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessPermission {
    /// Read only
    ReadOnly,
    /// Write only
    WriteOnly,
    /// Read and write
    ReadWrite,
}

/// Agent view needed to grant region access
pub trait RegionOwner {
    /// Driver node id of the agent
    fn node_id(&self) -> u32;

    /// Does the agent sit behind a GPU command processor?
    fn is_gpu(&self) -> bool;

    /// Is `region` one of the agent's regions?
    fn has_region(&self, region: RegionId) -> bool;
}

// =============================================================================
// MEMORY REGION
// =============================================================================

/// One heap class of one agent
#[derive(Debug)]
pub struct MemoryRegion {
    id: RegionId,
    node_id: u32,
    props: MemoryProperties,
    fine_grain: bool,
    full_profile: bool,
    virtual_size: u64,
    max_single_alloc_size: usize,
    kfd: Arc<dyn Kfd>,
    /// GPU nodes every allocation is made resident on
    map_targets: RwLock<Vec<u32>>,
}

impl MemoryRegion {
    /// Build a region for heap `props` of node `node_id`
    ///
    /// `fine_grain` selects continuous coherence; `full_profile` means the
    /// device shares the host page tables.
    pub fn new(
        kfd: Arc<dyn Kfd>,
        node_id: u32,
        props: MemoryProperties,
        fine_grain: bool,
        full_profile: bool,
    ) -> Self {
        let virtual_size = match props.heap {
            HeapType::System => USER_VA_LIMIT,
            heap if heap.is_local() => USER_VA_LIMIT.saturating_sub(props.virtual_base),
            _ => props.size,
        };
        let physical = usize::try_from(props.size).unwrap_or(usize::MAX);
        let region = Self {
            id: RegionId(NEXT_REGION_ID.fetch_add(1, Ordering::Relaxed)),
            node_id,
            props,
            fine_grain,
            full_profile,
            virtual_size,
            max_single_alloc_size: align_down(physical, PAGE_SIZE),
            kfd,
            map_targets: RwLock::new(Vec::new()),
        };
        log::debug!(
            "region {:?}: {:?} on node {}, {} bytes",
            region.id,
            region.props.heap,
            node_id,
            region.props.size
        );
        region
    }

    /// Region identifier
    pub fn id(&self) -> RegionId {
        self.id
    }

    /// Node owning the region
    pub fn node_id(&self) -> u32 {
        self.node_id
    }

    /// Heap class
    pub fn heap(&self) -> HeapType {
        self.props.heap
    }

    /// Base of the heap in the process address space
    pub fn base(&self) -> usize {
        self.props.virtual_base as usize
    }

    /// Physical size in bytes
    pub fn size(&self) -> u64 {
        self.props.size
    }

    /// Virtual size in bytes, possibly larger than the physical size
    pub fn virtual_size(&self) -> u64 {
        self.virtual_size
    }

    /// Largest single allocation
    pub fn max_single_alloc_size(&self) -> usize {
        self.max_single_alloc_size
    }

    /// Is this host system memory?
    pub fn is_system(&self) -> bool {
        self.props.heap == HeapType::System
    }

    /// Is this device frame-buffer memory?
    pub fn is_local(&self) -> bool {
        self.props.heap.is_local()
    }

    /// Is this group (LDS) memory?
    pub fn is_lds(&self) -> bool {
        self.props.heap == HeapType::GpuLds
    }

    /// Is this the scratch aperture?
    pub fn is_scratch(&self) -> bool {
        self.props.heap == HeapType::GpuScratch
    }

    /// Continuously coherent across agents?
    pub fn fine_grain(&self) -> bool {
        self.fine_grain
    }

    /// Can kernel arguments be placed here?
    pub fn is_kernarg(&self) -> bool {
        self.is_system() && self.fine_grain
    }

    /// Replace the GPU nodes allocations are made resident on
    pub fn set_map_targets(&self, nodes: Vec<u32>) {
        *self.map_targets.write() = nodes;
    }

    /// GPU nodes allocations are made resident on
    pub fn map_targets(&self) -> Vec<u32> {
        self.map_targets.read().clone()
    }

    fn alloc_flags(&self) -> MemFlags {
        let mut flags = MemFlags::NO_SUBSTITUTE;
        if self.is_system() {
            flags |= MemFlags::HOST_ACCESS | MemFlags::NON_PAGED;
        } else {
            flags |= MemFlags::LOCAL;
            if self.props.heap == HeapType::FrameBufferPublic {
                flags |= MemFlags::HOST_ACCESS;
            }
        }
        if !self.fine_grain {
            flags |= MemFlags::COARSE_GRAIN;
        }
        flags
    }

    fn can_allocate(&self) -> bool {
        self.is_system() || self.is_local()
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    /// Allocate `size` bytes, resident on every map target
    ///
    /// A residency failure frees the allocation before reporting
    /// [`Error::OutOfResources`].
    pub fn allocate(&self, size: usize) -> Result<usize> {
        if !self.can_allocate() {
            return Err(Error::InvalidAllocation);
        }
        if size == 0 {
            return Err(Error::InvalidArgument);
        }
        if size > self.max_single_alloc_size {
            return Err(Error::InvalidAllocation);
        }

        let size = align_up(size, PAGE_SIZE);
        let addr = self
            .kfd
            .alloc_memory(self.node_id, size, self.alloc_flags())
            .map_err(|err| {
                log::warn!("region {:?}: allocation of {} bytes failed: {}", self.id, size, err);
                Error::OutOfResources
            })?;

        let targets = self.map_targets();
        if !targets.is_empty() {
            if let Err(err) = self.kfd.map_memory_to_gpu(addr, size, &targets) {
                log::warn!("region {:?}: residency of {:#x} failed: {}", self.id, addr, err);
                let freed = self.kfd.free_memory(addr, size);
                assert!(freed.is_ok(), "driver failed to free {:#x}: {:?}", addr, freed);
                return Err(Error::OutOfResources);
            }
        }
        Ok(addr)
    }

    /// Release an allocation made by [`MemoryRegion::allocate`]
    ///
    /// Driver failure here means the allocation bookkeeping is corrupt.
    pub fn free(&self, addr: usize, size: usize) {
        let size = align_up(size, PAGE_SIZE);
        if !self.map_targets.read().is_empty() {
            let unmapped = self.kfd.unmap_memory_from_gpu(addr);
            assert!(unmapped.is_ok(), "driver failed to unmap {:#x}: {:?}", addr, unmapped);
        }
        let freed = self.kfd.free_memory(addr, size);
        assert!(freed.is_ok(), "driver failed to free {:#x}: {:?}", addr, freed);
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Read one attribute
    pub fn info(&self, attribute: RegionAttribute) -> RegionInfo {
        match attribute {
            RegionAttribute::Segment => RegionInfo::Segment(self.segment()),
            RegionAttribute::GlobalFlags => RegionInfo::GlobalFlags(self.global_flags()),
            RegionAttribute::Size => {
                RegionInfo::Size(usize::try_from(self.props.size).unwrap_or(usize::MAX))
            },
            RegionAttribute::AllocMaxSize => RegionInfo::Size(if self.can_allocate() {
                self.max_single_alloc_size
            } else {
                0
            }),
            RegionAttribute::RuntimeAllocAllowed => RegionInfo::Bool(self.can_allocate()),
            RegionAttribute::RuntimeAllocGranule | RegionAttribute::RuntimeAllocAlignment => {
                RegionInfo::Size(if self.can_allocate() { PAGE_SIZE } else { 0 })
            },
            RegionAttribute::HostAccessible => RegionInfo::Bool(
                self.is_system() || (self.full_profile && self.can_allocate()),
            ),
            RegionAttribute::Base => RegionInfo::Address(self.base()),
        }
    }

    fn segment(&self) -> Segment {
        match self.props.heap {
            HeapType::GpuLds => Segment::Group,
            HeapType::GpuScratch => Segment::Private,
            _ => Segment::Global,
        }
    }

    fn global_flags(&self) -> GlobalFlags {
        if self.segment() != Segment::Global {
            return GlobalFlags::empty();
        }
        let mut flags = if self.fine_grain {
            GlobalFlags::FINE_GRAINED
        } else {
            GlobalFlags::COARSE_GRAINED
        };
        if self.is_kernarg() {
            flags |= GlobalFlags::KERNARG;
        }
        flags
    }

    // =========================================================================
    // Access
    // =========================================================================

    /// Grant `agent` access to `[ptr, ptr + size)` of this region
    ///
    /// The span must lie inside the region and the region must be one of the
    /// agent's regions. Coarse-grained memory is made resident on a GPU
    /// agent; everything else is already accessible.
    pub fn assign_agent(
        &self,
        ptr: usize,
        size: usize,
        agent: &dyn RegionOwner,
        access: AccessPermission,
    ) -> Result<()> {
        if ptr == 0 || size == 0 {
            return Err(Error::InvalidArgument);
        }
        let start = ptr as u64;
        let end = start.checked_add(size as u64).ok_or(Error::InvalidArgument)?;
        let base = self.props.virtual_base;
        if start < base || end > base.saturating_add(self.virtual_size) {
            return Err(Error::InvalidArgument);
        }
        if !agent.has_region(self.id) {
            return Err(Error::InvalidAgent);
        }

        if agent.is_gpu() && !self.fine_grain && self.can_allocate() {
            self.kfd
                .map_memory_to_gpu(ptr, size, &[agent.node_id()])
                .map_err(|_| Error::OutOfResources)?;
        }
        log::trace!(
            "region {:?}: {:#x}+{:#x} assigned to node {} ({:?})",
            self.id,
            ptr,
            size,
            agent.node_id(),
            access
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hcr_hal::SimKfd;

    struct Owner {
        node: u32,
        gpu: bool,
        regions: Vec<RegionId>,
    }

    impl RegionOwner for Owner {
        fn node_id(&self) -> u32 {
            self.node
        }

        fn is_gpu(&self) -> bool {
            self.gpu
        }

        fn has_region(&self, region: RegionId) -> bool {
            self.regions.contains(&region)
        }
    }

    fn system_props(size: u64) -> MemoryProperties {
        MemoryProperties {
            heap: HeapType::System,
            size,
            virtual_base: 0,
            width: 64,
            max_clock_mhz: 0,
        }
    }

    #[test]
    fn test_allocate_respects_max_size() {
        let kfd = Arc::new(SimKfd::new());
        let region = MemoryRegion::new(kfd.clone(), 0, system_props(4096), true, true);
        assert_eq!(region.max_single_alloc_size(), 4096);

        let addr = region.allocate(4096).unwrap();
        assert_eq!(region.allocate(8192), Err(Error::InvalidAllocation));
        assert_eq!(kfd.allocation_count(), 1);
        region.free(addr, 4096);
        assert_eq!(kfd.allocation_count(), 0);
    }

    #[test]
    fn test_residency_failure_frees() {
        let kfd = Arc::new(SimKfd::new());
        let region = MemoryRegion::new(kfd.clone(), 0, system_props(1 << 20), true, true);
        region.set_map_targets(vec![1]);
        kfd.fail_mappings(1);
        assert_eq!(region.allocate(4096), Err(Error::OutOfResources));
        assert_eq!(kfd.allocation_count(), 0);

        let addr = region.allocate(100).unwrap();
        assert_eq!(kfd.mapped_nodes(addr), Some(vec![1]));
        region.free(addr, 100);
        assert_eq!(kfd.mapped_nodes(addr), None);
    }

    #[test]
    fn test_driver_allocation_failure() {
        let kfd = Arc::new(SimKfd::new());
        let region = MemoryRegion::new(kfd.clone(), 0, system_props(1 << 20), true, true);
        kfd.fail_allocations(1);
        assert_eq!(region.allocate(4096), Err(Error::OutOfResources));
    }

    #[test]
    fn test_lds_is_not_allocatable() {
        let kfd = Arc::new(SimKfd::new());
        let lds = MemoryProperties {
            heap: HeapType::GpuLds,
            size: 64 << 10,
            virtual_base: 0x1_0000_0000,
            width: 0,
            max_clock_mhz: 0,
        };
        let region = MemoryRegion::new(kfd, 1, lds, false, false);
        assert_eq!(region.allocate(4096), Err(Error::InvalidAllocation));
        assert_eq!(region.info(RegionAttribute::Segment), RegionInfo::Segment(Segment::Group));
        assert_eq!(
            region.info(RegionAttribute::GlobalFlags),
            RegionInfo::GlobalFlags(GlobalFlags::empty())
        );
        assert_eq!(region.info(RegionAttribute::RuntimeAllocAllowed), RegionInfo::Bool(false));
        assert_eq!(region.info(RegionAttribute::Base), RegionInfo::Address(0x1_0000_0000));
    }

    #[test]
    fn test_info_flags() {
        let kfd: Arc<dyn Kfd> = Arc::new(SimKfd::new());
        let fine = MemoryRegion::new(kfd.clone(), 0, system_props(1 << 20), true, true);
        assert_eq!(
            fine.info(RegionAttribute::GlobalFlags),
            RegionInfo::GlobalFlags(GlobalFlags::FINE_GRAINED | GlobalFlags::KERNARG)
        );
        assert_eq!(fine.info(RegionAttribute::HostAccessible), RegionInfo::Bool(true));
        assert_eq!(fine.info(RegionAttribute::RuntimeAllocGranule), RegionInfo::Size(PAGE_SIZE));

        let frame_buffer = MemoryProperties {
            heap: HeapType::FrameBufferPublic,
            ..system_props(1 << 20)
        };
        let local = MemoryRegion::new(kfd, 1, frame_buffer, false, false);
        assert_eq!(
            local.info(RegionAttribute::GlobalFlags),
            RegionInfo::GlobalFlags(GlobalFlags::COARSE_GRAINED)
        );
        assert_eq!(local.info(RegionAttribute::HostAccessible), RegionInfo::Bool(false));
        assert!(local.virtual_size() > local.size());
    }

    #[test]
    fn test_assign_agent_validation() {
        let kfd = Arc::new(SimKfd::new());
        let frame_buffer = MemoryProperties {
            heap: HeapType::FrameBufferPublic,
            ..system_props(1 << 20)
        };
        let region = MemoryRegion::new(kfd.clone(), 1, frame_buffer, false, false);
        let addr = region.allocate(4096).unwrap();

        let stranger = Owner {
            node: 1,
            gpu: true,
            regions: Vec::new(),
        };
        assert_eq!(
            region.assign_agent(addr, 4096, &stranger, AccessPermission::ReadWrite),
            Err(Error::InvalidAgent)
        );

        let owner = Owner {
            node: 1,
            gpu: true,
            regions: vec![region.id()],
        };
        assert_eq!(
            region.assign_agent(0, 4096, &owner, AccessPermission::ReadWrite),
            Err(Error::InvalidArgument)
        );
        assert_eq!(
            region.assign_agent(usize::MAX - 10, 4096, &owner, AccessPermission::ReadOnly),
            Err(Error::InvalidArgument)
        );
        region
            .assign_agent(addr, 4096, &owner, AccessPermission::ReadWrite)
            .unwrap();
        assert_eq!(kfd.mapped_nodes(addr), Some(vec![1]));
    }
}
