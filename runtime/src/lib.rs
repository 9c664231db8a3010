//! # HCR Runtime
//!
//! The process-wide layer tying the subsystems together.
//!
//! ## Components
//!
//! - **Agent**: a compute node owning memory regions and consuming queues
//! - **CpuAgent** / **GpuAgent**: the host and GPU nodes the driver reports
//! - **Runtime**: signal, queue and allocation registries behind a
//!   refcounted global
//! - **AsyncEvents**: one background thread running handlers when signals
//!   reach a condition
//!
//! ```text
//!                        ┌──────────────────┐
//!                        │     Runtime      │
//!                        └────────┬─────────┘
//!        ┌───────────────┬────────┴───────┬────────────────┐
//!   ┌────▼─────┐   ┌─────▼─────┐   ┌──────▼──────┐   ┌─────▼──────┐
//!   │ CpuAgent │   │ GpuAgent  │   │ SignalTable │   │ AsyncEvents│
//!   └────┬─────┘   └─────┬─────┘   └─────────────┘   └────────────┘
//!    HostQueue       AqlQueue + SoftCommandProcessor
//! ```

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod agent;
pub mod async_events;
pub mod cpu_agent;
pub mod gpu_agent;
pub mod runtime;

// Re-exports
pub use agent::{Agent, AgentId, AgentKind, QueueLimits};
pub use async_events::{AsyncEvents, AsyncHandler, AsyncHandlerId};
pub use cpu_agent::CpuAgent;
pub use gpu_agent::GpuAgent;
pub use runtime::{QueueHandle, QueueTag, Runtime};
