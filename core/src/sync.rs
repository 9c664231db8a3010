//! # Synchronization Primitives
//!
//! Two lock flavours are used by the runtime:
//!
//! - [`KernelMutex`]: blocks in the OS when contended. Used where the
//!   critical section may issue driver calls (registration database,
//!   scratch pool, registries).
//! - [`SpinMutex`]: busy-waits. Used for short critical sections that never
//!   leave user mode.

use std::sync::{Mutex, MutexGuard};

/// Busy-waiting mutex for short, driver-free critical sections
pub type SpinMutex<T> = spin::Mutex<T>;

/// Guard returned by [`SpinMutex::lock`]
pub type SpinMutexGuard<'a, T> = spin::MutexGuard<'a, T>;

// =============================================================================
// KERNEL MUTEX
// =============================================================================

/// OS-blocking mutex
///
/// A panic while the lock is held does not poison it: the data protected by
/// these locks is bookkeeping whose invariants are re-asserted on the next
/// access, so later callers take the lock as if nothing happened.
#[derive(Debug, Default)]
pub struct KernelMutex<T> {
    inner: Mutex<T>,
}

impl<T> KernelMutex<T> {
    /// Create a new mutex
    pub const fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    /// Acquire the mutex, blocking the calling thread while contended
    pub fn lock(&self) -> MutexGuard<'_, T> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Try to acquire without blocking
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        match self.inner.try_lock() {
            Ok(guard) => Some(guard),
            Err(std::sync::TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
            Err(std::sync::TryLockError::WouldBlock) => None,
        }
    }

    /// Borrow the value through exclusive access, without locking
    pub fn get_mut(&mut self) -> &mut T {
        match self.inner.get_mut() {
            Ok(value) => value,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Consume the mutex, returning the protected value
    pub fn into_inner(self) -> T {
        match self.inner.into_inner() {
            Ok(value) => value,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_kernel_mutex_survives_panic() {
        let lock = Arc::new(KernelMutex::new(0u32));
        let clone = Arc::clone(&lock);
        let result = thread::spawn(move || {
            let _guard = clone.lock();
            panic!("holder died");
        })
        .join();
        assert!(result.is_err());
        *lock.lock() += 1;
        assert_eq!(*lock.lock(), 1);
    }

    #[test]
    fn test_try_lock_contended() {
        let lock = KernelMutex::new(());
        let guard = lock.lock();
        assert!(lock.try_lock().is_none());
        drop(guard);
        assert!(lock.try_lock().is_some());
    }
}
