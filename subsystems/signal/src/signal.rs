//! # Signal Trait
//!
//! The operations every signal variant provides, and the state they share.

use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use hcr_core::atomic::{self, MemoryOrder, SharedAtomic};
use hcr_hal::{EventHandle, Kfd};

use crate::amd_signal::{AmdSignal, SignalKind};
use crate::SignalValue;

// =============================================================================
// CONDITIONS
// =============================================================================

/// Wait condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Condition {
    /// Value equals the compare value
    Eq  = 0,
    /// Value differs from the compare value
    Ne  = 1,
    /// Value is below the compare value
    Lt  = 2,
    /// Value is at least the compare value
    Gte = 3,
}

impl Condition {
    /// Decode a raw condition code
    pub const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Condition::Eq),
            1 => Some(Condition::Ne),
            2 => Some(Condition::Lt),
            3 => Some(Condition::Gte),
            _ => None,
        }
    }

    /// Does `value` satisfy the condition against `compare`?
    #[inline]
    pub const fn is_satisfied(self, value: SignalValue, compare: SignalValue) -> bool {
        match self {
            Condition::Eq => value == compare,
            Condition::Ne => value != compare,
            Condition::Lt => value < compare,
            Condition::Gte => value >= compare,
        }
    }
}

/// Caller's expectation of how long a wait will take
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WaitState {
    /// Long wait: sleeping in the driver is worthwhile
    Blocked,
    /// Short wait: keep spinning
    Active,
}

/// Read-modify-write operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RmwOp {
    /// Bitwise and
    And,
    /// Bitwise or
    Or,
    /// Bitwise xor
    Xor,
    /// Wrapping add
    Add,
    /// Wrapping subtract
    Sub,
    /// Replace
    Exchange,
}

// =============================================================================
// SHARED STATE
// =============================================================================

/// State common to every signal variant
#[derive(Debug)]
pub struct SignalCore {
    amd: AmdSignal,
    invalid: AtomicBool,
    waiting: AtomicU32,
    retained: AtomicU32,
}

impl SignalCore {
    /// Core for a signal of `kind` starting at `value`
    pub fn new(kind: SignalKind, value: SignalValue) -> Self {
        Self {
            amd: AmdSignal::new(kind, value),
            invalid: AtomicBool::new(false),
            waiting: AtomicU32::new(0),
            retained: AtomicU32::new(0),
        }
    }

    /// Hardware-visible record
    pub fn amd(&self) -> &AmdSignal {
        &self.amd
    }

    /// Load the value slot
    #[inline]
    pub fn load(&self, order: MemoryOrder) -> SignalValue {
        self.amd.value.load_with(order)
    }

    /// Store the value slot
    #[inline]
    pub fn store(&self, value: SignalValue, order: MemoryOrder) {
        self.amd.value.store_with(value, order);
    }

    /// Apply `op` to the value slot, returning the prior value
    #[inline]
    pub fn apply(&self, op: RmwOp, value: SignalValue, order: MemoryOrder) -> SignalValue {
        let slot = &self.amd.value;
        match op {
            RmwOp::And => slot.and_with(value, order),
            RmwOp::Or => slot.or_with(value, order),
            RmwOp::Xor => slot.xor_with(value, order),
            RmwOp::Add => slot.add_with(value, order),
            RmwOp::Sub => slot.sub_with(value, order),
            RmwOp::Exchange => slot.exchange_with(value, order),
        }
    }

    /// Compare-and-swap the value slot, returning the prior value
    #[inline]
    pub fn cas(&self, expected: SignalValue, value: SignalValue, order: MemoryOrder) -> SignalValue {
        self.amd.value.cas_with(expected, value, order)
    }

    /// Has the signal been destroyed?
    #[inline]
    pub fn is_invalid(&self) -> bool {
        self.invalid.load(Ordering::Acquire)
    }

    /// Mark destroyed; later waits return immediately
    pub fn invalidate(&self) {
        self.invalid.store(true, Ordering::Release);
        self.amd.kind.store(SignalKind::Invalid as i64, Ordering::Release);
    }

    /// Register a waiter, returning how many were already waiting
    pub fn enter_wait(&self) -> u32 {
        atomic::increment(&self.waiting)
    }

    /// Unregister a waiter
    pub fn leave_wait(&self) {
        atomic::decrement(&self.waiting);
    }

    /// Number of threads inside a wait
    pub fn waiting(&self) -> u32 {
        self.waiting.load(Ordering::Acquire)
    }

    /// Number of outstanding retains
    pub fn retained(&self) -> u32 {
        self.retained.load(Ordering::Acquire)
    }

    fn retain(&self) {
        atomic::increment(&self.retained);
    }

    fn release(&self) {
        atomic::decrement(&self.retained);
    }
}

/// Waiter registration released on scope exit
pub(crate) struct WaitGuard<'a>(&'a SignalCore);

impl<'a> WaitGuard<'a> {
    /// Enter, returning the guard and the number of earlier waiters
    pub(crate) fn enter(core: &'a SignalCore) -> (Self, u32) {
        let prior = core.enter_wait();
        (Self(core), prior)
    }
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.0.leave_wait();
    }
}

// =============================================================================
// SIGNAL TRAIT
// =============================================================================

macro_rules! ordered_rmw {
    ($($op:ident),* $(,)?) => {
        paste::paste! {
            $(
                #[doc = concat!("`", stringify!($op), "` with relaxed ordering, returning the prior value")]
                #[inline]
                fn [<$op _relaxed>](&self, value: SignalValue) -> SignalValue {
                    self.rmw(RmwOp::[<$op:camel>], value, MemoryOrder::Relaxed)
                }

                #[doc = concat!("`", stringify!($op), "` with acquire ordering, returning the prior value")]
                #[inline]
                fn [<$op _acquire>](&self, value: SignalValue) -> SignalValue {
                    self.rmw(RmwOp::[<$op:camel>], value, MemoryOrder::Acquire)
                }

                #[doc = concat!("`", stringify!($op), "` with release ordering, returning the prior value")]
                #[inline]
                fn [<$op _release>](&self, value: SignalValue) -> SignalValue {
                    self.rmw(RmwOp::[<$op:camel>], value, MemoryOrder::Release)
                }

                #[doc = concat!("`", stringify!($op), "` with acquire-release ordering, returning the prior value")]
                #[inline]
                fn [<$op _acq_rel>](&self, value: SignalValue) -> SignalValue {
                    self.rmw(RmwOp::[<$op:camel>], value, MemoryOrder::AcqRel)
                }
            )*
        }
    };
}

/// A completion signal
///
/// Operations on a destroyed signal are a programming error. They are not
/// checked outside debug builds.
pub trait Signal: Send + Sync + fmt::Debug {
    /// Shared state
    fn core(&self) -> &SignalCore;

    /// Load the value
    fn load(&self, order: MemoryOrder) -> SignalValue;

    /// Store the value
    fn store(&self, value: SignalValue, order: MemoryOrder);

    /// Apply a read-modify-write, returning the prior value
    fn rmw(&self, op: RmwOp, value: SignalValue, order: MemoryOrder) -> SignalValue;

    /// Compare-and-swap, returning the prior value
    fn cas(&self, expected: SignalValue, value: SignalValue, order: MemoryOrder) -> SignalValue;

    /// Wait until `condition` holds against `compare` or `timeout` ticks pass
    ///
    /// Returns the last observed value, which the caller must re-check to
    /// tell a satisfied wait from a timeout. Returns zero if the signal is
    /// destroyed during the wait.
    fn wait(
        &self,
        condition: Condition,
        compare: SignalValue,
        timeout: u64,
        hint: WaitState,
        order: MemoryOrder,
    ) -> SignalValue;

    /// OS event a sleeping waiter blocks on, if any
    fn event(&self) -> Option<EventHandle> {
        None
    }

    /// Driver owning [`Signal::event`]
    fn driver(&self) -> Option<&dyn Kfd> {
        None
    }

    /// Wake threads sleeping on the signal
    fn wake(&self) {}

    /// Kind of the signal
    fn kind(&self) -> SignalKind {
        self.core().amd().kind()
    }

    /// Hardware-visible record
    fn amd_signal(&self) -> &AmdSignal {
        self.core().amd()
    }

    /// Has the signal been destroyed?
    fn is_invalid(&self) -> bool {
        self.core().is_invalid()
    }

    /// Keep the signal alive across a destroy
    fn retain(&self) {
        self.core().retain();
    }

    /// Drop a retain taken with [`Signal::retain`]
    fn release(&self) {
        self.core().release();
    }

    /// Mark the signal invalid and wait until nobody uses it
    ///
    /// Blocks until every waiter has observed the invalid flag and every
    /// retain has been released.
    fn destroy(&self) {
        self.core().invalidate();
        self.wake();
        let mut spins = 0u32;
        while self.core().waiting() != 0 || self.core().retained() != 0 {
            spins = spins.wrapping_add(1);
            if spins % 64 == 0 {
                // Waiters sleeping in the driver need another nudge
                self.wake();
                std::thread::yield_now();
            } else {
                core::hint::spin_loop();
            }
        }
    }

    // =========================================================================
    // Named orderings
    // =========================================================================

    /// Load with relaxed ordering
    #[inline]
    fn load_relaxed(&self) -> SignalValue {
        self.load(MemoryOrder::Relaxed)
    }

    /// Load with acquire ordering
    #[inline]
    fn load_acquire(&self) -> SignalValue {
        self.load(MemoryOrder::Acquire)
    }

    /// Store with relaxed ordering
    #[inline]
    fn store_relaxed(&self, value: SignalValue) {
        self.store(value, MemoryOrder::Relaxed);
    }

    /// Store with release ordering
    #[inline]
    fn store_release(&self, value: SignalValue) {
        self.store(value, MemoryOrder::Release);
    }

    /// Wait, loading with relaxed ordering
    #[inline]
    fn wait_relaxed(
        &self,
        condition: Condition,
        compare: SignalValue,
        timeout: u64,
        hint: WaitState,
    ) -> SignalValue {
        self.wait(condition, compare, timeout, hint, MemoryOrder::Relaxed)
    }

    /// Wait, loading with acquire ordering
    #[inline]
    fn wait_acquire(
        &self,
        condition: Condition,
        compare: SignalValue,
        timeout: u64,
        hint: WaitState,
    ) -> SignalValue {
        self.wait(condition, compare, timeout, hint, MemoryOrder::Acquire)
    }

    ordered_rmw!(and, or, xor, add, sub, exchange);

    /// Compare-and-swap with relaxed ordering
    #[inline]
    fn cas_relaxed(&self, expected: SignalValue, value: SignalValue) -> SignalValue {
        self.cas(expected, value, MemoryOrder::Relaxed)
    }

    /// Compare-and-swap with acquire ordering
    #[inline]
    fn cas_acquire(&self, expected: SignalValue, value: SignalValue) -> SignalValue {
        self.cas(expected, value, MemoryOrder::Acquire)
    }

    /// Compare-and-swap with release ordering
    #[inline]
    fn cas_release(&self, expected: SignalValue, value: SignalValue) -> SignalValue {
        self.cas(expected, value, MemoryOrder::Release)
    }

    /// Compare-and-swap with acquire-release ordering
    #[inline]
    fn cas_acq_rel(&self, expected: SignalValue, value: SignalValue) -> SignalValue {
        self.cas(expected, value, MemoryOrder::AcqRel)
    }
}
