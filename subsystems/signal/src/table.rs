//! # Signal Handles
//!
//! Public signal handles are generation-checked indices into a
//! [`HandleTable`]. A stale or forged handle resolves to nothing instead of
//! to a dangling object.

use std::sync::Arc;
use std::vec::Vec;

use hcr_core::{Error, Handle, HandleTable, Result};

use crate::signal::Signal;

/// Marker for signal handles
#[derive(Debug)]
pub enum SignalTag {}

/// Opaque public signal handle
pub type SignalHandle = Handle<SignalTag>;

/// Registry of live signals
#[derive(Debug)]
pub struct SignalTable {
    signals: HandleTable<SignalTag, Arc<dyn Signal>>,
}

impl SignalTable {
    /// Create an empty table
    pub const fn new() -> Self {
        Self {
            signals: HandleTable::new(),
        }
    }

    /// Publish a signal, returning its handle
    pub fn insert(&self, signal: Arc<dyn Signal>) -> SignalHandle {
        self.signals.insert(signal)
    }

    /// Resolve a handle
    pub fn get(&self, handle: SignalHandle) -> Option<Arc<dyn Signal>> {
        self.signals.get(handle)
    }

    /// Unpublish and destroy a signal
    ///
    /// The handle stops resolving before the signal is torn down, so no new
    /// waiter can find it. Blocks until current waiters and retains drain.
    pub fn destroy(&self, handle: SignalHandle) -> Result<()> {
        let signal = self.signals.remove(handle).ok_or(Error::InvalidSignal)?;
        signal.destroy();
        Ok(())
    }

    /// Destroy every signal
    pub fn destroy_all(&self) {
        for (_, signal) in self.signals.drain() {
            signal.destroy();
        }
    }

    /// Every live signal
    pub fn signals(&self) -> Vec<Arc<dyn Signal>> {
        self.signals.values()
    }

    /// Number of live signals
    pub fn len(&self) -> usize {
        self.signals.len()
    }

    /// Is the table empty?
    pub fn is_empty(&self) -> bool {
        self.signals.is_empty()
    }
}

impl Default for SignalTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DefaultSignal;

    #[test]
    fn test_destroy_invalidates_handle() {
        let table = SignalTable::new();
        let signal: Arc<dyn Signal> = Arc::new(DefaultSignal::new(3));
        let handle = table.insert(signal.clone());
        assert_eq!(table.get(handle).map(|s| s.load_relaxed()), Some(3));

        table.destroy(handle).unwrap();
        assert!(signal.is_invalid());
        assert!(table.get(handle).is_none());
        assert_eq!(table.destroy(handle), Err(Error::InvalidSignal));
    }

    #[test]
    fn test_forged_handle() {
        let table = SignalTable::new();
        assert!(table.get(SignalHandle::from_raw(0xDEAD_BEEF)).is_none());
        assert!(table.get(SignalHandle::null()).is_none());
    }

    #[test]
    fn test_destroy_all() {
        let table = SignalTable::new();
        for value in 0..4 {
            table.insert(Arc::new(DefaultSignal::new(value)));
        }
        assert_eq!(table.len(), 4);
        table.destroy_all();
        assert!(table.is_empty());
    }
}
