//! # Multi-Signal Wait
//!
//! Waits until any of a set of (signal, condition, value) entries is
//! satisfied.

use std::time::Duration;
use std::vec::Vec;

use hcr_core::atomic::MemoryOrder;
use hcr_core::time::Deadline;
use hcr_core::DriverError;
use hcr_hal::{EventHandle, Kfd};

use crate::signal::{Condition, Signal, WaitState};
use crate::SignalValue;

/// One entry of a [`wait_any`] set
#[derive(Debug, Clone, Copy)]
pub struct WaitEntry<'a> {
    /// Signal to observe
    pub signal: &'a dyn Signal,
    /// Condition to test
    pub condition: Condition,
    /// Compare value
    pub value: SignalValue,
}

impl<'a> WaitEntry<'a> {
    /// Build an entry
    pub fn new(signal: &'a dyn Signal, condition: Condition, value: SignalValue) -> Self {
        Self {
            signal,
            condition,
            value,
        }
    }
}

/// Keeps every entry retained and counted as waited on
struct Registration<'e, 'a> {
    entries: &'e [WaitEntry<'a>],
}

impl<'e, 'a> Registration<'e, 'a> {
    fn enter(entries: &'e [WaitEntry<'a>]) -> Self {
        for entry in entries {
            entry.signal.retain();
            entry.signal.core().enter_wait();
        }
        Self { entries }
    }
}

impl Drop for Registration<'_, '_> {
    fn drop(&mut self) {
        for entry in self.entries {
            entry.signal.core().leave_wait();
            entry.signal.release();
        }
    }
}

/// Wait until any entry is satisfied or `timeout` ticks pass
///
/// Returns the index of the first satisfied entry with the value observed,
/// or `None` on timeout or if any signal of the set is destroyed. Sleeping
/// in the driver is only possible when every signal has an event; the
/// events are deduplicated before the wait.
pub fn wait_any(
    entries: &[WaitEntry<'_>],
    timeout: u64,
    hint: WaitState,
    spin_window: Duration,
) -> Option<(usize, SignalValue)> {
    if entries.is_empty() {
        return None;
    }
    let _registration = Registration::enter(entries);

    let mut hint = hint;
    let mut events: Vec<EventHandle> = Vec::with_capacity(entries.len());
    let mut driver: Option<&dyn Kfd> = None;
    for entry in entries {
        match entry.signal.event() {
            Some(event) => events.push(event),
            None => hint = WaitState::Active,
        }
        if driver.is_none() {
            driver = entry.signal.driver();
        }
    }
    events.sort_unstable();
    events.dedup();
    let driver = match driver {
        Some(driver) => driver,
        None => return spin_only(entries, timeout),
    };

    let deadline = Deadline::after_ticks(timeout);
    loop {
        if let Some(hit) = scan(entries) {
            return hit;
        }
        if deadline.expired() {
            return None;
        }
        if hint == WaitState::Active || deadline.elapsed() < spin_window {
            core::hint::spin_loop();
            continue;
        }

        let budget = deadline.remaining_ms().max(1);
        match driver.wait_on_multiple_events(&events, false, budget) {
            Ok(()) | Err(DriverError::WaitTimeout) => {},
            Err(err) => {
                log::warn!("wait_any: event wait failed, polling: {}", err);
                hint = WaitState::Active;
            },
        }
    }
}

/// Busy-poll variant used when no signal of the set can sleep
fn spin_only(entries: &[WaitEntry<'_>], timeout: u64) -> Option<(usize, SignalValue)> {
    let deadline = Deadline::after_ticks(timeout);
    loop {
        if let Some(hit) = scan(entries) {
            return hit;
        }
        if deadline.expired() {
            return None;
        }
        core::hint::spin_loop();
    }
}

/// One pass over the set
///
/// `Some(None)` means a signal was destroyed.
fn scan(entries: &[WaitEntry<'_>]) -> Option<Option<(usize, SignalValue)>> {
    for (index, entry) in entries.iter().enumerate() {
        if entry.signal.is_invalid() {
            return Some(None);
        }
        let value = entry.signal.core().load(MemoryOrder::Acquire);
        if entry.condition.is_satisfied(value, entry.value) {
            return Some(Some((index, value)));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DefaultSignal, InterruptSignal};
    use hcr_core::time::TIMESTAMP_FREQUENCY;
    use hcr_hal::SimKfd;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    const MS: u64 = TIMESTAMP_FREQUENCY / 1000;

    #[test]
    fn test_first_satisfied_index() {
        let a = DefaultSignal::new(1);
        let b = DefaultSignal::new(0);
        let entries = [
            WaitEntry::new(&a, Condition::Eq, 0),
            WaitEntry::new(&b, Condition::Eq, 0),
        ];
        assert_eq!(
            wait_any(&entries, 0, WaitState::Active, Duration::ZERO),
            Some((1, 0))
        );
        assert_eq!(a.core().waiting(), 0);
        assert_eq!(b.core().retained(), 0);
    }

    #[test]
    fn test_timeout_returns_none() {
        let a = DefaultSignal::new(1);
        let start = Instant::now();
        let entries = [WaitEntry::new(&a, Condition::Gte, 2)];
        assert_eq!(
            wait_any(&entries, 10 * MS, WaitState::Active, Duration::ZERO),
            None
        );
        assert!(start.elapsed() >= Duration::from_millis(10));
    }

    #[test]
    fn test_sleeps_on_shared_events() {
        let kfd = Arc::new(SimKfd::new());
        let a = Arc::new(
            InterruptSignal::new(kfd.clone(), 1, Duration::from_millis(1)).unwrap(),
        );
        let event = a.event().unwrap();
        // Second signal shares the first one's event
        let b = Arc::new(InterruptSignal::with_event(
            kfd.clone(),
            1,
            event,
            Duration::from_millis(1),
        ));
        let producer = Arc::clone(&b);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            producer.store_release(0);
        });

        let entries = [
            WaitEntry::new(&*a, Condition::Eq, 0),
            WaitEntry::new(&*b, Condition::Eq, 0),
        ];
        let hit = wait_any(
            &entries,
            5_000 * MS,
            WaitState::Blocked,
            Duration::from_millis(1),
        );
        assert_eq!(hit, Some((1, 0)));
        handle.join().unwrap();
    }

    #[test]
    fn test_invalid_signal_ends_wait() {
        let a = DefaultSignal::new(1);
        a.core().invalidate();
        let entries = [WaitEntry::new(&a, Condition::Eq, 0)];
        assert_eq!(
            wait_any(&entries, u64::MAX, WaitState::Blocked, Duration::ZERO),
            None
        );
    }
}
