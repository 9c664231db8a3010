//! # HCR Core
//!
//! Foundational types shared by every crate of the compute runtime.
//!
//! The runtime is split the same way the driver stack is: this crate holds
//! the pieces that have no dependency on the kernel driver or on any
//! hardware-visible layout.
//!
//! ## Components
//!
//! - **Error**: the status taxonomy reported to callers
//! - **Atomic**: lock-free helpers for fields shared with other agents
//! - **Sync**: `KernelMutex` (blocking) and `SpinMutex` (busy)
//! - **Time**: monotonic system timestamps and timeout conversion
//! - **Handle**: generation-checked slot arena backing opaque public handles
//! - **Config**: configuration providers and the runtime flags built from them
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         hcr-core                            │
//! │  ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌──────────┐  │
//! │  │   Error   │  │  Atomic   │  │  Handle   │  │  Config  │  │
//! │  └───────────┘  └───────────┘  └───────────┘  └──────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::new_without_default)]

// =============================================================================
// MODULE EXPORTS
// =============================================================================

pub mod atomic;
pub mod config;
pub mod error;
pub mod handle;
pub mod sync;
pub mod time;

// Re-exports for convenience
pub use config::{ConfigProvider, ConfigValue, EnvConfig, MemoryConfig, RuntimeFlags};
pub use error::{DriverError, Error, Result};
pub use handle::{Handle, HandleTable};
pub use sync::{KernelMutex, SpinMutex};

/// Size of a system page as seen by the kernel driver
pub const PAGE_SIZE: usize = 4096;

/// Round `value` up to a multiple of `align` (power of two)
#[inline]
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Round `value` down to a multiple of `align` (power of two)
#[inline]
pub const fn align_down(value: usize, align: usize) -> usize {
    value & !(align - 1)
}

/// Check that `value` is a non-zero power of two
#[inline]
pub const fn is_power_of_two(value: u64) -> bool {
    value != 0 && (value & (value - 1)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alignment_helpers() {
        assert_eq!(align_up(1, PAGE_SIZE), PAGE_SIZE);
        assert_eq!(align_up(PAGE_SIZE, PAGE_SIZE), PAGE_SIZE);
        assert_eq!(align_down(PAGE_SIZE + 7, PAGE_SIZE), PAGE_SIZE);
        assert!(is_power_of_two(64));
        assert!(!is_power_of_two(0));
        assert!(!is_power_of_two(48));
    }
}
