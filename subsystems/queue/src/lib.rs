//! # HCR Queue Subsystem
//!
//! User-mode packet queues in the AQL format.
//!
//! ## Components
//!
//! - **Queue**: the write/read index protocol every queue shares, with the
//!   reserve, write, publish sequence producers follow
//! - **HostQueue**: a ring in system memory consumed by software
//! - **AqlQueue**: a ring consumed by a GPU command processor, with the
//!   doorbell protocols of each hardware generation and in-place scratch
//!   growth on fault
//! - **ScratchPool**: per-device scratch aperture shared by the queues
//! - **SoftCommandProcessor**: consumer standing in for the GPU front end
//!
//! ```text
//!  producers ──reserve──► write_dispatch_id
//!            ──write───► ring slot (header last)
//!            ──publish─► doorbell ───► consumer ──► read_dispatch_id
//!                                         │
//!                                         └─ fault ─► inactive signal
//! ```

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod amd_queue;
pub mod aql_queue;
pub mod cp;
pub mod host_queue;
pub mod packet;
pub mod queue;
pub mod ring;
pub mod scratch;

// Re-exports
pub use amd_queue::{AmdQueue, HsaQueue, QueueFeatures, QueueProperties, QueueType};
pub use aql_queue::{fault_status, AqlQueue, AqlQueueParams, SCRATCH_RETRY};
pub use cp::{CpStatus, CpThread, SignalResolver, SoftCommandProcessor};
pub use host_queue::HostQueue;
pub use packet::{
    AgentDispatchPacket, AqlPacket, BarrierPacket, FenceScope, KernelDispatchPacket, PacketHeader,
    PacketType,
};
pub use queue::{advance_doorbell, ErrorCallback, Queue};
pub use scratch::{ScratchInfo, ScratchPool, ScratchPoolConfig};
