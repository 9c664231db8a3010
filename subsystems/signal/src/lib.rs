//! # HCR Signal Subsystem
//!
//! Signals are the completion primitive shared by the host, the command
//! processor and agent-dispatch consumers: a hardware-visible value slot
//! plus the bookkeeping needed to wait on it and tear it down safely.
//!
//! ## Variants
//!
//! - [`DefaultSignal`]: every operation is a plain atomic on the value slot;
//!   waits busy-poll until the condition holds or the deadline passes
//! - [`InterruptSignal`]: every mutation also sets an OS event; waits spin
//!   for a short window, then sleep in the driver
//!
//! Queues also expose their doorbell as a signal, see `hcr-queue`.
//!
//! ## Lifetime
//!
//! Destruction is two-phase: [`Signal::destroy`] marks the signal invalid,
//! wakes sleepers, then blocks until every waiter has left and every retain
//! has been released. Waits observing the invalid flag return zero.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod amd_signal;
pub mod default_signal;
pub mod interrupt_signal;
pub mod signal;
pub mod table;
pub mod wait_any;

cfg_if::cfg_if! {
    if #[cfg(feature = "small_machine_model")] {
        /// Value carried by a signal
        pub type SignalValue = i32;
        /// Atomic cell holding a [`SignalValue`]
        pub type AtomicSignalValue = core::sync::atomic::AtomicI32;
    } else {
        /// Value carried by a signal
        pub type SignalValue = i64;
        /// Atomic cell holding a [`SignalValue`]
        pub type AtomicSignalValue = core::sync::atomic::AtomicI64;
    }
}

// Re-exports
pub use amd_signal::{AmdSignal, SignalKind};
pub use default_signal::DefaultSignal;
pub use interrupt_signal::InterruptSignal;
pub use signal::{Condition, RmwOp, Signal, SignalCore, WaitState};
pub use table::{SignalHandle, SignalTable, SignalTag};
pub use wait_any::{wait_any, WaitEntry};
