//! # Busy-Poll Signal
//!
//! Every operation is a direct atomic on the value slot. Waiting never
//! enters the kernel: the waiter spins, re-reading the value and checking
//! its deadline every few iterations.

use hcr_core::atomic::MemoryOrder;
use hcr_core::time::Deadline;

use crate::amd_signal::SignalKind;
use crate::signal::{Condition, RmwOp, Signal, SignalCore, WaitGuard, WaitState};
use crate::SignalValue;

/// Spins between deadline checks
const DEADLINE_CHECK_INTERVAL: u32 = 16;

/// Signal whose waiters busy-poll
#[derive(Debug)]
pub struct DefaultSignal {
    core: SignalCore,
}

impl DefaultSignal {
    /// Create a signal holding `initial`
    pub fn new(initial: SignalValue) -> Self {
        Self {
            core: SignalCore::new(SignalKind::User, initial),
        }
    }
}

impl Signal for DefaultSignal {
    fn core(&self) -> &SignalCore {
        &self.core
    }

    #[inline]
    fn load(&self, order: MemoryOrder) -> SignalValue {
        debug_assert!(!self.core.is_invalid(), "load from destroyed signal");
        self.core.load(order)
    }

    #[inline]
    fn store(&self, value: SignalValue, order: MemoryOrder) {
        debug_assert!(!self.core.is_invalid(), "store to destroyed signal");
        self.core.store(value, order);
    }

    #[inline]
    fn rmw(&self, op: RmwOp, value: SignalValue, order: MemoryOrder) -> SignalValue {
        debug_assert!(!self.core.is_invalid(), "update of destroyed signal");
        self.core.apply(op, value, order)
    }

    #[inline]
    fn cas(&self, expected: SignalValue, value: SignalValue, order: MemoryOrder) -> SignalValue {
        debug_assert!(!self.core.is_invalid(), "update of destroyed signal");
        self.core.cas(expected, value, order)
    }

    fn wait(
        &self,
        condition: Condition,
        compare: SignalValue,
        timeout: u64,
        _hint: WaitState,
        order: MemoryOrder,
    ) -> SignalValue {
        let (_guard, _) = WaitGuard::enter(&self.core);
        let deadline = Deadline::after_ticks(timeout);
        let mut spins = 0u32;

        loop {
            if self.core.is_invalid() {
                return 0;
            }
            let value = self.core.load(order);
            if condition.is_satisfied(value, compare) {
                return value;
            }
            spins = spins.wrapping_add(1);
            if spins % DEADLINE_CHECK_INTERVAL == 0 && deadline.expired() {
                return value;
            }
            core::hint::spin_loop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hcr_core::time::TIMESTAMP_FREQUENCY;
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    const MS: u64 = TIMESTAMP_FREQUENCY / 1000;

    #[test]
    fn test_named_variants() {
        let signal = DefaultSignal::new(1);
        assert_eq!(signal.add_relaxed(2), 1);
        assert_eq!(signal.sub_acq_rel(1), 3);
        assert_eq!(signal.or_release(4), 2);
        assert_eq!(signal.and_acquire(4), 6);
        assert_eq!(signal.xor_relaxed(1), 4);
        assert_eq!(signal.exchange_release(0), 5);
        assert_eq!(signal.cas_acq_rel(0, 7), 0);
        signal.store_release(11);
        assert_eq!(signal.load_acquire(), 11);
        assert_eq!(signal.kind(), SignalKind::User);
    }

    #[test]
    fn test_wait_times_out() {
        let signal = DefaultSignal::new(1);
        let start = Instant::now();
        let value = signal.wait_acquire(Condition::Eq, 0, 20 * MS, WaitState::Active);
        assert_eq!(value, 1);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(20));
        assert!(elapsed < Duration::from_secs(5));
        assert_eq!(signal.core().waiting(), 0);
    }

    #[test]
    fn test_wait_returns_on_store() {
        let signal = Arc::new(DefaultSignal::new(1));
        let producer = Arc::clone(&signal);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(5));
            producer.store_release(0);
        });
        let value = signal.wait_acquire(Condition::Eq, 0, u64::MAX, WaitState::Active);
        assert_eq!(value, 0);
        handle.join().unwrap();
    }

    #[test]
    fn test_destroy_releases_waiter() {
        let signal = Arc::new(DefaultSignal::new(1));
        let waiter = Arc::clone(&signal);
        let handle = thread::spawn(move || {
            waiter.wait_relaxed(Condition::Eq, 0, u64::MAX, WaitState::Blocked)
        });
        while signal.core().waiting() == 0 {
            thread::yield_now();
        }
        signal.destroy();
        assert_eq!(handle.join().unwrap(), 0);
        assert!(signal.is_invalid());
    }

    #[test]
    fn test_destroy_waits_for_release() {
        let signal = Arc::new(DefaultSignal::new(0));
        signal.retain();
        let holder = Arc::clone(&signal);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            holder.release();
        });
        let start = Instant::now();
        signal.destroy();
        assert!(start.elapsed() >= Duration::from_millis(5));
        assert_eq!(signal.core().retained(), 0);
        handle.join().unwrap();
    }
}
