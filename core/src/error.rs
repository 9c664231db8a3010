//! # HCR Error Handling
//!
//! Status codes reported by the runtime.
//!
//! Error handling follows the same split the runtime's callers see:
//! - Resource exhaustion is returned to the immediate caller
//! - Dispatch faults reach the queue's error callback as an [`Error`]
//! - Misuse of destroyed handles is caught by debug assertions only
//! - Driver invariant violations are fatal assertions

use core::fmt;

// =============================================================================
// RESULT TYPE
// =============================================================================

/// HCR Result type alias
pub type Result<T> = core::result::Result<T, Error>;

// =============================================================================
// ERROR ENUM
// =============================================================================

/// Runtime status codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Error {
    // =========================================================================
    // Generic Errors
    // =========================================================================
    /// Invalid argument provided
    InvalidArgument,
    /// Runtime has not been acquired
    NotInitialized,
    /// Runtime reference count would overflow
    RefcountOverflow,
    /// Operation not supported by this agent or queue
    NotSupported,

    // =========================================================================
    // Object Errors
    // =========================================================================
    /// Agent handle does not name a live agent, or agent cannot do this
    InvalidAgent,
    /// Region handle does not name a live region
    InvalidRegion,
    /// Signal handle does not name a live signal
    InvalidSignal,
    /// Queue handle does not name a live queue
    InvalidQueue,

    // =========================================================================
    // Resource Errors
    // =========================================================================
    /// Queue could not be created with the requested parameters
    InvalidQueueCreation,
    /// Allocation request cannot be served by this region
    InvalidAllocation,
    /// Kernel or hardware resources are exhausted
    OutOfResources,

    // =========================================================================
    // Dispatch Faults
    // =========================================================================
    /// Dispatch dimensions are malformed
    IncompatibleArguments,
    /// Kernel code object is invalid or null
    InvalidCodeObject,
    /// Packet header or type is malformed
    InvalidPacketFormat,

    // =========================================================================
    // Driver Errors
    // =========================================================================
    /// Kernel driver call failed
    Driver(DriverError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // Generic
            Self::InvalidArgument => write!(f, "invalid argument"),
            Self::NotInitialized => write!(f, "runtime not initialized"),
            Self::RefcountOverflow => write!(f, "runtime reference count overflow"),
            Self::NotSupported => write!(f, "operation not supported"),

            // Objects
            Self::InvalidAgent => write!(f, "invalid agent"),
            Self::InvalidRegion => write!(f, "invalid memory region"),
            Self::InvalidSignal => write!(f, "invalid signal"),
            Self::InvalidQueue => write!(f, "invalid queue"),

            // Resources
            Self::InvalidQueueCreation => write!(f, "invalid queue creation parameters"),
            Self::InvalidAllocation => write!(f, "invalid allocation"),
            Self::OutOfResources => write!(f, "out of resources"),

            // Dispatch
            Self::IncompatibleArguments => write!(f, "incompatible dispatch arguments"),
            Self::InvalidCodeObject => write!(f, "invalid code object"),
            Self::InvalidPacketFormat => write!(f, "invalid packet format"),

            Self::Driver(e) => write!(f, "kernel driver error: {}", e),
        }
    }
}

impl std::error::Error for Error {}

// =============================================================================
// SUB-ERROR TYPES
// =============================================================================

/// Kernel driver (thunk) failure codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverError {
    /// Generic failure
    Failure,
    /// Parameter rejected by the driver
    InvalidParameter,
    /// Handle (queue id, event, allocation) not known to the driver
    InvalidHandle,
    /// Driver could not allocate or pin memory
    OutOfMemory,
    /// Event wait expired
    WaitTimeout,
    /// Request not supported by this node
    NotSupported,
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failure => write!(f, "failure"),
            Self::InvalidParameter => write!(f, "invalid parameter"),
            Self::InvalidHandle => write!(f, "invalid handle"),
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::WaitTimeout => write!(f, "wait timeout"),
            Self::NotSupported => write!(f, "not supported"),
        }
    }
}

// =============================================================================
// ERROR CONVERSION
// =============================================================================

impl From<DriverError> for Error {
    fn from(e: DriverError) -> Self {
        match e {
            DriverError::OutOfMemory => Error::OutOfResources,
            DriverError::InvalidParameter => Error::InvalidArgument,
            DriverError::NotSupported => Error::NotSupported,
            other => Error::Driver(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_error_mapping() {
        assert_eq!(Error::from(DriverError::OutOfMemory), Error::OutOfResources);
        assert_eq!(Error::from(DriverError::InvalidParameter), Error::InvalidArgument);
        assert_eq!(
            Error::from(DriverError::InvalidHandle),
            Error::Driver(DriverError::InvalidHandle)
        );
    }

    #[test]
    fn test_display() {
        let msg = std::format!("{}", Error::Driver(DriverError::WaitTimeout));
        assert_eq!(msg, "kernel driver error: wait timeout");
    }
}
