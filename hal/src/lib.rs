//! # HCR Kernel-Driver Thunk
//!
//! The runtime never talks to the kernel driver directly. Every privileged
//! operation (memory allocation and pinning, queue creation, OS events,
//! clock counters) goes through the [`Kfd`] trait defined here.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                    hcr-memory / hcr-signal / hcr-queue        │
//! └───────────────────────────────┬───────────────────────────────┘
//!                                 │ dyn Kfd
//!                 ┌───────────────┴───────────────┐
//!                 │                               │
//!        ┌────────▼────────┐            ┌─────────▼────────┐
//!        │  Kernel thunk   │            │     SimKfd       │
//!        │  (ioctl-based)  │            │  (in-process)    │
//!        └─────────────────┘            └──────────────────┘
//! ```
//!
//! [`SimKfd`] backs memory with host allocations and events with a
//! condition variable. It is what the test suites run against.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod kfd;
pub mod sim;
pub mod types;

// Re-exports
pub use kfd::{Kfd, KfdResult};
pub use sim::SimKfd;
pub use types::{
    ClockCounters, DoorbellType, EventHandle, GfxVersion, HeapType, MemFlags, MemoryProperties,
    NodeKind, NodeProperties, QueueDescriptor, QueueResource,
};
