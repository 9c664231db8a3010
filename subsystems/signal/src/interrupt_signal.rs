//! # Interrupt Signal
//!
//! A signal backed by an OS event. Every mutation sets the event after the
//! atomic update, so a waiter asleep in the driver wakes up and re-reads
//! the value.
//!
//! Waiting spins for a short window first, then sleeps in the driver with
//! the remaining budget.
//!
//! Known limitation: only the first concurrent waiter sleeps. A thread that
//! enters a wait while another is already waiting busy-polls for its whole
//! wait. The event is auto-reset and one set wakes one sleeper.

use std::sync::Arc;
use std::time::Duration;

use hcr_core::atomic::MemoryOrder;
use hcr_core::time::Deadline;
use hcr_core::{DriverError, Error, Result};
use hcr_hal::{EventHandle, Kfd};

use crate::amd_signal::SignalKind;
use crate::signal::{Condition, RmwOp, Signal, SignalCore, WaitGuard, WaitState};
use crate::SignalValue;

/// Default busy-spin window before sleeping
pub const DEFAULT_SPIN_WINDOW: Duration = Duration::from_millis(5);

/// Signal whose waiters may sleep on an OS event
#[derive(Debug)]
pub struct InterruptSignal {
    core: SignalCore,
    kfd: Arc<dyn Kfd>,
    event: EventHandle,
    owns_event: bool,
    spin_window: Duration,
}

impl InterruptSignal {
    /// Create a signal holding `initial` with its own event
    pub fn new(kfd: Arc<dyn Kfd>, initial: SignalValue, spin_window: Duration) -> Result<Self> {
        let event = kfd.create_event(false, false).map_err(|err| {
            log::warn!("interrupt signal: event creation failed: {}", err);
            Error::OutOfResources
        })?;
        let mut signal = Self::with_event(kfd, initial, event, spin_window);
        signal.owns_event = true;
        Ok(signal)
    }

    /// Create a signal holding `initial` that sets an existing event
    ///
    /// The event stays owned by the caller.
    pub fn with_event(
        kfd: Arc<dyn Kfd>,
        initial: SignalValue,
        event: EventHandle,
        spin_window: Duration,
    ) -> Self {
        let core = SignalCore::new(SignalKind::User, initial);
        core.amd()
            .event_id
            .store(event.0, core::sync::atomic::Ordering::Relaxed);
        Self {
            core,
            kfd,
            event,
            owns_event: false,
            spin_window,
        }
    }

    /// Busy-spin window before a waiter sleeps
    pub fn spin_window(&self) -> Duration {
        self.spin_window
    }

    #[inline]
    fn notify(&self) {
        if let Err(err) = self.kfd.set_event(self.event) {
            debug_assert!(self.core.is_invalid(), "set_event failed: {}", err);
        }
    }
}

impl Drop for InterruptSignal {
    fn drop(&mut self) {
        if self.owns_event {
            if let Err(err) = self.kfd.destroy_event(self.event) {
                log::error!("interrupt signal: destroying event {:?} failed: {}", self.event, err);
            }
        }
    }
}

impl Signal for InterruptSignal {
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
        self.notify();
    }

    #[inline]
    fn rmw(&self, op: RmwOp, value: SignalValue, order: MemoryOrder) -> SignalValue {
        debug_assert!(!self.core.is_invalid(), "update of destroyed signal");
        let prior = self.core.apply(op, value, order);
        self.notify();
        prior
    }

    #[inline]
    fn cas(&self, expected: SignalValue, value: SignalValue, order: MemoryOrder) -> SignalValue {
        debug_assert!(!self.core.is_invalid(), "update of destroyed signal");
        let prior = self.core.cas(expected, value, order);
        if prior == expected {
            self.notify();
        }
        prior
    }

    fn wait(
        &self,
        condition: Condition,
        compare: SignalValue,
        timeout: u64,
        hint: WaitState,
        order: MemoryOrder,
    ) -> SignalValue {
        let (_guard, earlier) = WaitGuard::enter(&self.core);
        // Only the first waiter may sleep
        let mut hint = if earlier != 0 { WaitState::Active } else { hint };
        let deadline = Deadline::after_ticks(timeout);

        loop {
            if self.core.is_invalid() {
                return 0;
            }
            let value = self.core.load(order);
            if condition.is_satisfied(value, compare) {
                return value;
            }
            if deadline.expired() {
                return value;
            }
            if hint == WaitState::Active || deadline.elapsed() < self.spin_window {
                core::hint::spin_loop();
                continue;
            }

            let budget = deadline.remaining_ms().max(1);
            match self.kfd.wait_on_event(self.event, budget) {
                Ok(()) | Err(DriverError::WaitTimeout) => {},
                Err(err) => {
                    log::warn!("interrupt signal: event wait failed, polling: {}", err);
                    hint = WaitState::Active;
                },
            }
        }
    }

    fn event(&self) -> Option<EventHandle> {
        Some(self.event)
    }

    fn driver(&self) -> Option<&dyn Kfd> {
        Some(&*self.kfd)
    }

    fn wake(&self) {
        if let Err(err) = self.kfd.set_event(self.event) {
            log::warn!("interrupt signal: waking event {:?} failed: {}", self.event, err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hcr_core::time::TIMESTAMP_FREQUENCY;
    use hcr_hal::SimKfd;
    use std::thread;
    use std::time::Instant;

    const MS: u64 = TIMESTAMP_FREQUENCY / 1000;

    fn signal(kfd: &Arc<SimKfd>, initial: SignalValue) -> Arc<InterruptSignal> {
        Arc::new(InterruptSignal::new(kfd.clone(), initial, Duration::from_millis(1)).unwrap())
    }

    #[test]
    fn test_mutations_set_event() {
        let kfd = Arc::new(SimKfd::new());
        let signal = signal(&kfd, 0);
        signal.store_relaxed(1);
        signal.add_acq_rel(1);
        assert_eq!(signal.cas_relaxed(5, 6), 2);
        assert_eq!(kfd.set_event_calls(), 2);
        assert_eq!(signal.cas_relaxed(2, 6), 2);
        assert_eq!(kfd.set_event_calls(), 3);
        assert!(signal.event().is_some());
    }

    #[test]
    fn test_sleeping_waiter_wakes_on_store() {
        let kfd = Arc::new(SimKfd::new());
        let signal = signal(&kfd, 1);
        let producer = Arc::clone(&signal);
        let handle = thread::spawn(move || {
            // Well past the spin window, so the waiter is asleep
            thread::sleep(Duration::from_millis(30));
            producer.store_release(0);
        });
        let start = Instant::now();
        let value = signal.wait_acquire(Condition::Eq, 0, 5_000 * MS, WaitState::Blocked);
        assert_eq!(value, 0);
        assert!(start.elapsed() < Duration::from_secs(5));
        handle.join().unwrap();
    }

    #[test]
    fn test_sleeping_wait_times_out() {
        let kfd = Arc::new(SimKfd::new());
        let signal = signal(&kfd, 3);
        let start = Instant::now();
        let value = signal.wait_relaxed(Condition::Lt, 0, 25 * MS, WaitState::Blocked);
        assert_eq!(value, 3);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(25));
        assert!(elapsed < Duration::from_secs(5));
    }

    #[test]
    fn test_destroy_wakes_sleeper() {
        let kfd = Arc::new(SimKfd::new());
        let signal = signal(&kfd, 1);
        let waiter = Arc::clone(&signal);
        let handle = thread::spawn(move || {
            waiter.wait_acquire(Condition::Eq, 0, u64::MAX, WaitState::Blocked)
        });
        while signal.core().waiting() == 0 {
            thread::yield_now();
        }
        thread::sleep(Duration::from_millis(10));
        signal.destroy();
        assert_eq!(handle.join().unwrap(), 0);
    }

    #[test]
    fn test_second_waiter_polls() {
        let kfd = Arc::new(SimKfd::new());
        let signal = signal(&kfd, 1);
        let mut handles = Vec::new();
        for _ in 0..2 {
            let waiter = Arc::clone(&signal);
            handles.push(thread::spawn(move || {
                waiter.wait_acquire(Condition::Eq, 0, 5_000 * MS, WaitState::Blocked)
            }));
        }
        while signal.core().waiting() < 2 {
            thread::yield_now();
        }
        thread::sleep(Duration::from_millis(10));
        signal.store_release(0);
        for handle in handles {
            assert_eq!(handle.join().unwrap(), 0);
        }
    }

    #[test]
    fn test_event_released_on_drop() {
        let kfd = Arc::new(SimKfd::new());
        let signal = signal(&kfd, 0);
        assert_eq!(kfd.event_count(), 1);
        drop(signal);
        assert_eq!(kfd.event_count(), 0);
    }

    #[test]
    fn test_destroy_sets_event() {
        let kfd = Arc::new(SimKfd::new());
        let signal = signal(&kfd, 1);
        signal.destroy();
        assert!(signal.is_invalid());
        assert_eq!(kfd.set_event_calls(), 1);
    }

    #[test]
    fn test_destroy_survives_stale_event() {
        let kfd = Arc::new(SimKfd::new());
        let event = kfd.create_event(false, false).unwrap();
        let signal = InterruptSignal::with_event(kfd.clone(), 1, event, Duration::ZERO);
        kfd.destroy_event(event).unwrap();
        signal.destroy();
        assert!(signal.is_invalid());
        assert_eq!(kfd.set_event_calls(), 0);
    }
}
