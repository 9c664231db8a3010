//! # Atomic Helpers
//!
//! Typed wrappers over the native atomics used for every field that another
//! thread, the kernel driver or the command processor reads concurrently.
//!
//! Every shared field must be lock-free at its native width: a field that
//! silently fell back to a lock could never be observed correctly by the
//! hardware. The assertions below reject targets where that is not true.

use core::sync::atomic::{AtomicI32, AtomicI64, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use static_assertions::{assert_eq_size, const_assert};

// Shared fields are read by devices that know nothing about Rust locks
const_assert!(cfg!(target_has_atomic = "32"));
const_assert!(cfg!(target_has_atomic = "64"));
const_assert!(cfg!(target_has_atomic = "ptr"));

assert_eq_size!(AtomicU32, u32);
assert_eq_size!(AtomicU64, u64);
assert_eq_size!(AtomicI64, i64);

// =============================================================================
// MEMORY ORDER
// =============================================================================

/// Memory order requested by an ordered runtime operation
///
/// Signal and queue operations come in `Relaxed`, `Acquire`, `Release` and
/// `AcqRel` flavours. Not every flavour is legal for every access kind, so the
/// conversions below clamp to the nearest legal [`Ordering`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryOrder {
    /// No ordering constraint
    Relaxed,
    /// Later accesses stay after this one
    Acquire,
    /// Earlier accesses stay before this one
    Release,
    /// Both acquire and release
    AcqRel,
}

impl MemoryOrder {
    /// Ordering for a read-modify-write
    #[inline]
    pub const fn rmw(self) -> Ordering {
        match self {
            MemoryOrder::Relaxed => Ordering::Relaxed,
            MemoryOrder::Acquire => Ordering::Acquire,
            MemoryOrder::Release => Ordering::Release,
            MemoryOrder::AcqRel => Ordering::AcqRel,
        }
    }

    /// Ordering for a plain load
    #[inline]
    pub const fn load(self) -> Ordering {
        match self {
            MemoryOrder::Relaxed | MemoryOrder::Release => Ordering::Relaxed,
            MemoryOrder::Acquire | MemoryOrder::AcqRel => Ordering::Acquire,
        }
    }

    /// Ordering for a plain store
    #[inline]
    pub const fn store(self) -> Ordering {
        match self {
            MemoryOrder::Relaxed | MemoryOrder::Acquire => Ordering::Relaxed,
            MemoryOrder::Release | MemoryOrder::AcqRel => Ordering::Release,
        }
    }

    /// Failure ordering for a compare-and-swap
    #[inline]
    pub const fn failure(self) -> Ordering {
        self.load()
    }
}

// =============================================================================
// SHARED ATOMIC
// =============================================================================

/// A lock-free atomic cell usable as a shared synchronization field
pub trait SharedAtomic: Sync {
    /// Native value type
    type Value: Copy + PartialEq + PartialOrd;

    /// Load with the requested order
    fn load_with(&self, order: MemoryOrder) -> Self::Value;

    /// Store with the requested order
    fn store_with(&self, value: Self::Value, order: MemoryOrder);

    /// Swap in `value`, returning the prior value
    fn exchange_with(&self, value: Self::Value, order: MemoryOrder) -> Self::Value;

    /// Store `value` if the cell holds `expected`; always returns the prior value
    fn cas_with(&self, expected: Self::Value, value: Self::Value, order: MemoryOrder)
        -> Self::Value;

    /// Add, returning the prior value (wrapping)
    fn add_with(&self, value: Self::Value, order: MemoryOrder) -> Self::Value;

    /// Subtract, returning the prior value (wrapping)
    fn sub_with(&self, value: Self::Value, order: MemoryOrder) -> Self::Value;

    /// Bitwise AND, returning the prior value
    fn and_with(&self, value: Self::Value, order: MemoryOrder) -> Self::Value;

    /// Bitwise OR, returning the prior value
    fn or_with(&self, value: Self::Value, order: MemoryOrder) -> Self::Value;

    /// Bitwise XOR, returning the prior value
    fn xor_with(&self, value: Self::Value, order: MemoryOrder) -> Self::Value;
}

macro_rules! impl_shared_atomic {
    ($($atomic:ty => $value:ty),* $(,)?) => {
        $(
            impl SharedAtomic for $atomic {
                type Value = $value;

                #[inline]
                fn load_with(&self, order: MemoryOrder) -> $value {
                    self.load(order.load())
                }

                #[inline]
                fn store_with(&self, value: $value, order: MemoryOrder) {
                    self.store(value, order.store())
                }

                #[inline]
                fn exchange_with(&self, value: $value, order: MemoryOrder) -> $value {
                    self.swap(value, order.rmw())
                }

                #[inline]
                fn cas_with(&self, expected: $value, value: $value, order: MemoryOrder) -> $value {
                    match self.compare_exchange(expected, value, order.rmw(), order.failure()) {
                        Ok(prior) | Err(prior) => prior,
                    }
                }

                #[inline]
                fn add_with(&self, value: $value, order: MemoryOrder) -> $value {
                    self.fetch_add(value, order.rmw())
                }

                #[inline]
                fn sub_with(&self, value: $value, order: MemoryOrder) -> $value {
                    self.fetch_sub(value, order.rmw())
                }

                #[inline]
                fn and_with(&self, value: $value, order: MemoryOrder) -> $value {
                    self.fetch_and(value, order.rmw())
                }

                #[inline]
                fn or_with(&self, value: $value, order: MemoryOrder) -> $value {
                    self.fetch_or(value, order.rmw())
                }

                #[inline]
                fn xor_with(&self, value: $value, order: MemoryOrder) -> $value {
                    self.fetch_xor(value, order.rmw())
                }
            }
        )*
    };
}

impl_shared_atomic! {
    AtomicU32 => u32,
    AtomicU64 => u64,
    AtomicI32 => i32,
    AtomicI64 => i64,
    AtomicUsize => usize,
}

// =============================================================================
// HELPERS
// =============================================================================

/// Increment a counter, returning the prior value
#[inline]
pub fn increment(counter: &AtomicU32) -> u32 {
    counter.fetch_add(1, Ordering::AcqRel)
}

/// Decrement a counter, returning the prior value
///
/// Decrementing a zero counter is a bookkeeping bug.
#[inline]
pub fn decrement(counter: &AtomicU32) -> u32 {
    let prior = counter.fetch_sub(1, Ordering::AcqRel);
    debug_assert!(prior != 0, "atomic counter underflow");
    prior
}

/// Raise `cell` to `value` unless it already holds something larger
///
/// Uses a compare-and-swap loop so that concurrent callers can never move the
/// cell backwards. Returns `true` if this call advanced the cell.
pub fn advance_monotonic<A>(cell: &A, value: A::Value, order: MemoryOrder) -> bool
where
    A: SharedAtomic,
{
    let mut current = cell.load_with(MemoryOrder::Relaxed);
    loop {
        if current >= value {
            return false;
        }
        let prior = cell.cas_with(current, value, order);
        if prior == current {
            return true;
        }
        current = prior;
    }
}
