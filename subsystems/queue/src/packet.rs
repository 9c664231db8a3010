//! # AQL Packets
//!
//! Every packet is 64 bytes. The first 16 bits are the header; the packet
//! type in the header is what the consumer polls, so producers write the
//! body first and the header word last.
//!
//! ```text
//! Header (16 bits)
//! ┌─────────────┬───────┬────────┬────────┬──────────┐
//! │ 15      13  │ 12 11 │ 10   9 │   8    │ 7      0 │
//! │  reserved   │ rel   │  acq   │barrier │   type   │
//! └─────────────┴───────┴────────┴────────┴──────────┘
//! ```

use core::sync::atomic::{AtomicU32, Ordering};

use static_assertions::const_assert_eq;

/// Size of one packet slot
pub const PACKET_SIZE: usize = 64;

/// Number of 32-bit words in a packet
pub const PACKET_WORDS: usize = PACKET_SIZE / 4;

// =============================================================================
// HEADER
// =============================================================================

/// Packet type field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// Vendor-specific packet
    Vendor        = 0,
    /// Slot not yet written or already consumed
    Invalid       = 1,
    /// Kernel dispatch
    KernelDispatch = 2,
    /// Barrier waiting for all dependencies
    BarrierAnd    = 3,
    /// Agent dispatch
    AgentDispatch = 4,
    /// Barrier waiting for any dependency
    BarrierOr     = 5,
}

impl PacketType {
    /// Decode a raw type field
    pub const fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(PacketType::Vendor),
            1 => Some(PacketType::Invalid),
            2 => Some(PacketType::KernelDispatch),
            3 => Some(PacketType::BarrierAnd),
            4 => Some(PacketType::AgentDispatch),
            5 => Some(PacketType::BarrierOr),
            _ => None,
        }
    }
}

/// Memory fence scope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FenceScope {
    /// No fence
    None   = 0,
    /// Agent scope
    Agent  = 1,
    /// System scope
    System = 2,
}

const TYPE_MASK: u16 = 0xFF;
const BARRIER_BIT: u16 = 1 << 8;
const ACQUIRE_SHIFT: u16 = 9;
const RELEASE_SHIFT: u16 = 11;
const SCOPE_MASK: u16 = 0x3;

/// Packed packet header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct PacketHeader(pub u16);

impl PacketHeader {
    /// Header of an unwritten slot
    pub const INVALID: Self = Self(PacketType::Invalid as u16);

    /// Header of the given type with no barrier and no fences
    pub const fn new(kind: PacketType) -> Self {
        Self(kind as u16)
    }

    /// Set the barrier bit
    pub const fn with_barrier(self, barrier: bool) -> Self {
        if barrier {
            Self(self.0 | BARRIER_BIT)
        } else {
            Self(self.0 & !BARRIER_BIT)
        }
    }

    /// Set the acquire fence scope
    pub const fn with_acquire(self, scope: FenceScope) -> Self {
        Self((self.0 & !(SCOPE_MASK << ACQUIRE_SHIFT)) | ((scope as u16) << ACQUIRE_SHIFT))
    }

    /// Set the release fence scope
    pub const fn with_release(self, scope: FenceScope) -> Self {
        Self((self.0 & !(SCOPE_MASK << RELEASE_SHIFT)) | ((scope as u16) << RELEASE_SHIFT))
    }

    /// Packet type, `None` for unknown codes
    pub const fn packet_type(self) -> Option<PacketType> {
        PacketType::from_raw((self.0 & TYPE_MASK) as u8)
    }

    /// Is the barrier bit set?
    pub const fn barrier(self) -> bool {
        self.0 & BARRIER_BIT != 0
    }

    /// Raw bits
    pub const fn raw(self) -> u16 {
        self.0
    }
}

// =============================================================================
// PACKET LAYOUTS
// =============================================================================

/// Kernel dispatch packet
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C, align(64))]
pub struct KernelDispatchPacket {
    pub header: u16,
    /// Number of grid dimensions in bits 0..2
    pub setup: u16,
    pub workgroup_size_x: u16,
    pub workgroup_size_y: u16,
    pub workgroup_size_z: u16,
    pub reserved0: u16,
    pub grid_size_x: u32,
    pub grid_size_y: u32,
    pub grid_size_z: u32,
    /// Scratch bytes per work-item
    pub private_segment_size: u32,
    /// Group (LDS) bytes per work-group
    pub group_segment_size: u32,
    /// Address of the kernel code descriptor
    pub kernel_object: u64,
    pub kernarg_address: u64,
    pub reserved2: u64,
    /// Raw signal handle, zero for none
    pub completion_signal: u64,
}

/// Agent dispatch packet
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C, align(64))]
pub struct AgentDispatchPacket {
    pub header: u16,
    /// Application-defined function code
    pub kind: u16,
    pub reserved0: u32,
    pub return_address: u64,
    pub arg: [u64; 4],
    pub reserved2: u64,
    /// Raw signal handle, zero for none
    pub completion_signal: u64,
}

/// Barrier-AND and barrier-OR packet
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C, align(64))]
pub struct BarrierPacket {
    pub header: u16,
    pub reserved0: u16,
    pub reserved1: u32,
    /// Raw dependency signal handles, zero entries are ignored
    pub dep_signal: [u64; 5],
    pub reserved2: u64,
    /// Raw signal handle, zero for none
    pub completion_signal: u64,
}

const_assert_eq!(core::mem::size_of::<KernelDispatchPacket>(), PACKET_SIZE);
const_assert_eq!(core::mem::size_of::<AgentDispatchPacket>(), PACKET_SIZE);
const_assert_eq!(core::mem::size_of::<BarrierPacket>(), PACKET_SIZE);
const_assert_eq!(core::mem::offset_of!(KernelDispatchPacket, private_segment_size), 24);
const_assert_eq!(core::mem::offset_of!(KernelDispatchPacket, kernel_object), 32);
const_assert_eq!(core::mem::offset_of!(KernelDispatchPacket, completion_signal), 56);
const_assert_eq!(core::mem::offset_of!(AgentDispatchPacket, completion_signal), 56);
const_assert_eq!(core::mem::offset_of!(BarrierPacket, completion_signal), 56);

impl KernelDispatchPacket {
    /// Number of grid dimensions encoded in `setup`
    pub const fn dimensions(&self) -> u16 {
        self.setup & 0x3
    }
}

// =============================================================================
// GENERIC SLOT
// =============================================================================

/// One ring slot viewed as any packet layout
///
/// Every layout consists of plain integers, so any bit pattern is a valid
/// value of every variant.
#[derive(Clone, Copy)]
#[repr(C, align(64))]
pub union AqlPacket {
    /// Raw words
    pub words: [u32; PACKET_WORDS],
    /// Kernel dispatch view
    pub kernel_dispatch: KernelDispatchPacket,
    /// Agent dispatch view
    pub agent_dispatch: AgentDispatchPacket,
    /// Barrier view
    pub barrier: BarrierPacket,
}

const_assert_eq!(core::mem::size_of::<AqlPacket>(), PACKET_SIZE);

impl AqlPacket {
    /// A slot holding an invalid header and zeroed body
    pub const fn invalid() -> Self {
        let mut words = [0u32; PACKET_WORDS];
        words[0] = PacketHeader::INVALID.0 as u32;
        Self { words }
    }

    /// Raw words
    #[inline]
    pub fn words(&self) -> [u32; PACKET_WORDS] {
        // SAFETY: all variants are plain integers of the same size
        unsafe { self.words }
    }

    /// Header of the slot
    #[inline]
    pub fn header(&self) -> PacketHeader {
        PacketHeader(self.words()[0] as u16)
    }

    /// Kernel dispatch view
    #[inline]
    pub fn as_kernel_dispatch(&self) -> KernelDispatchPacket {
        // SAFETY: all variants are plain integers of the same size
        unsafe { self.kernel_dispatch }
    }

    /// Agent dispatch view
    #[inline]
    pub fn as_agent_dispatch(&self) -> AgentDispatchPacket {
        // SAFETY: all variants are plain integers of the same size
        unsafe { self.agent_dispatch }
    }

    /// Barrier view
    #[inline]
    pub fn as_barrier(&self) -> BarrierPacket {
        // SAFETY: all variants are plain integers of the same size
        unsafe { self.barrier }
    }

    /// Completion signal handle, valid for every layout
    #[inline]
    pub fn completion_signal(&self) -> u64 {
        self.as_barrier().completion_signal
    }
}

impl From<KernelDispatchPacket> for AqlPacket {
    fn from(kernel_dispatch: KernelDispatchPacket) -> Self {
        Self { kernel_dispatch }
    }
}

impl From<AgentDispatchPacket> for AqlPacket {
    fn from(agent_dispatch: AgentDispatchPacket) -> Self {
        Self { agent_dispatch }
    }
}

impl From<BarrierPacket> for AqlPacket {
    fn from(barrier: BarrierPacket) -> Self {
        Self { barrier }
    }
}

impl core::fmt::Debug for AqlPacket {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AqlPacket")
            .field("header", &self.header())
            .field("completion_signal", &self.completion_signal())
            .finish()
    }
}

// =============================================================================
// SLOT ACCESS
// =============================================================================

/// Write `packet` into `slot`, body first, header word last with release
///
/// # Safety
///
/// `slot` must point to a live, 64-byte aligned packet slot that no other
/// producer writes concurrently.
pub unsafe fn store_packet(slot: *mut AqlPacket, packet: &AqlPacket) {
    let words = packet.words();
    let base = slot.cast::<u32>();
    for (i, word) in words.iter().enumerate().skip(1) {
        // SAFETY: i < PACKET_WORDS and slot is valid per the contract
        unsafe { core::ptr::write_volatile(base.add(i), *word) };
    }
    // SAFETY: the header word is 4-byte aligned and lives as long as the slot
    let header = unsafe { AtomicU32::from_ptr(base) };
    header.store(words[0], Ordering::Release);
}

/// Read the header word of `slot` with acquire ordering
///
/// # Safety
///
/// `slot` must point to a live, 64-byte aligned packet slot.
pub unsafe fn load_header(slot: *const AqlPacket) -> PacketHeader {
    // SAFETY: the header word is 4-byte aligned and lives as long as the slot
    let header = unsafe { AtomicU32::from_ptr(slot.cast::<u32>().cast_mut()) };
    PacketHeader(header.load(Ordering::Acquire) as u16)
}

/// Read a whole slot after its header has been observed
///
/// # Safety
///
/// `slot` must point to a live, 64-byte aligned packet slot.
pub unsafe fn load_packet(slot: *const AqlPacket) -> AqlPacket {
    let base = slot.cast::<u32>();
    let mut words = [0u32; PACKET_WORDS];
    // SAFETY: the header word is 4-byte aligned and lives as long as the slot
    words[0] = unsafe { AtomicU32::from_ptr(base.cast_mut()) }.load(Ordering::Acquire);
    for (i, word) in words.iter_mut().enumerate().skip(1) {
        // SAFETY: i < PACKET_WORDS and slot is valid per the contract
        *word = unsafe { core::ptr::read_volatile(base.add(i)) };
    }
    AqlPacket { words }
}

/// Hand a consumed slot back to producers
///
/// # Safety
///
/// `slot` must point to a live, 64-byte aligned packet slot owned by the
/// consumer.
pub unsafe fn retire_packet(slot: *mut AqlPacket) {
    // SAFETY: the header word is 4-byte aligned and lives as long as the slot
    let header = unsafe { AtomicU32::from_ptr(slot.cast::<u32>()) };
    header.store(u32::from(PacketHeader::INVALID.0), Ordering::Release);
}
