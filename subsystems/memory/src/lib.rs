//! # HCR Memory Subsystem
//!
//! GPU-visible memory management for the compute runtime.
//!
//! ## Components
//!
//! - **SmallHeap**: first-fit allocator with eager coalescing, used to carve
//!   scratch blocks out of a reserved aperture
//! - **MemoryDatabase**: deduplicates and reference-counts the page ranges
//!   pinned with the kernel driver on behalf of the application
//! - **MemoryRegion**: one heap class of one agent (system, frame buffer,
//!   LDS, scratch) with allocation, info query and access assignment
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         hcr-memory                           │
//! │  ┌──────────────┐  ┌──────────────────┐  ┌────────────────┐  │
//! │  │  SmallHeap   │  │  MemoryDatabase  │  │  MemoryRegion  │  │
//! │  └──────────────┘  └────────┬─────────┘  └───────┬────────┘  │
//! └─────────────────────────────┼────────────────────┼───────────┘
//!                               └────── dyn Kfd ─────┘
//! ```

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod database;
pub mod region;
pub mod small_heap;

pub use database::{DatabaseSnapshot, MemoryDatabase};
pub use region::{
    AccessPermission, GlobalFlags, MemoryRegion, RegionAttribute, RegionId, RegionInfo,
    RegionOwner, Segment,
};
pub use small_heap::SmallHeap;
