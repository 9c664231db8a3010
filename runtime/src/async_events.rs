//! # Async Signal Handlers
//!
//! One background thread waits on every registered (signal, condition,
//! value) tuple at once and runs the matching handler when a condition is
//! met. The runtime drives AQL queue fault handling this way.
//!
//! A handler returns `None` to unregister itself, or the condition and
//! value to wait for next. Registration and removal never block on the
//! thread: they queue a change and ring an internal wake signal.

use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use std::vec::Vec;

use hcr_core::time::TIMEOUT_INFINITE;
use hcr_core::{Error, KernelMutex, Result};
use hcr_signal::{wait_any, Condition, Signal, SignalValue, WaitEntry, WaitState};

/// Handler run with the value that satisfied its condition
pub type AsyncHandler = Box<dyn FnMut(SignalValue) -> Option<(Condition, SignalValue)> + Send>;

/// Identifies a registration for [`AsyncEvents::unregister`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AsyncHandlerId(pub u64);

struct Registration {
    id: AsyncHandlerId,
    signal: Arc<dyn Signal>,
    condition: Condition,
    value: SignalValue,
    handler: AsyncHandler,
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("id", &self.id)
            .field("condition", &self.condition)
            .field("value", &self.value)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
struct Changes {
    added: Vec<Registration>,
    removed: Vec<AsyncHandlerId>,
}

#[derive(Debug)]
struct Shared {
    changes: KernelMutex<Changes>,
    /// Non-zero while the thread has changes to pick up
    wake: Arc<dyn Signal>,
    stop: AtomicBool,
    spin_window: Duration,
}

impl Shared {
    fn ring(&self) {
        self.wake.store_release(1);
    }
}

/// Background handler thread
#[derive(Debug)]
pub struct AsyncEvents {
    shared: Arc<Shared>,
    next_id: AtomicU64,
    thread: KernelMutex<Option<JoinHandle<()>>>,
}

impl AsyncEvents {
    /// Start the thread
    ///
    /// `wake` must start at zero. When it can sleep in the driver, so can
    /// the thread, provided every registered signal can too.
    pub fn start(wake: Arc<dyn Signal>, spin_window: Duration) -> Result<Self> {
        let shared = Arc::new(Shared {
            changes: KernelMutex::new(Changes::default()),
            wake,
            stop: AtomicBool::new(false),
            spin_window,
        });
        let worker = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("hcr-async-events".into())
            .spawn(move || run(&worker))
            .map_err(|err| {
                log::error!("async events: thread creation failed: {}", err);
                Error::OutOfResources
            })?;
        Ok(Self {
            shared,
            next_id: AtomicU64::new(1),
            thread: KernelMutex::new(Some(handle)),
        })
    }

    /// Run `handler` once `signal` satisfies `condition` against `value`
    pub fn register(
        &self,
        signal: Arc<dyn Signal>,
        condition: Condition,
        value: SignalValue,
        handler: AsyncHandler,
    ) -> Result<AsyncHandlerId> {
        if self.shared.stop.load(Ordering::Acquire) {
            return Err(Error::NotInitialized);
        }
        let id = AsyncHandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.shared.changes.lock().added.push(Registration {
            id,
            signal,
            condition,
            value,
            handler,
        });
        self.shared.ring();
        Ok(id)
    }

    /// Drop a registration
    ///
    /// Returns before the thread has processed the removal; a handler
    /// already running may still complete.
    pub fn unregister(&self, id: AsyncHandlerId) {
        self.shared.changes.lock().removed.push(id);
        self.shared.ring();
    }

    /// Stop and join the thread
    pub fn shutdown(&self) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.ring();
        if let Some(handle) = self.thread.lock().take() {
            if handle.join().is_err() {
                log::error!("async events: handler thread panicked");
            }
        }
    }
}

impl Drop for AsyncEvents {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(shared: &Shared) {
    let mut active: Vec<Registration> = Vec::new();
    loop {
        if shared.stop.load(Ordering::Acquire) {
            break;
        }
        {
            let mut changes = shared.changes.lock();
            shared.wake.store_relaxed(0);
            active.append(&mut changes.added);
            let removed = core::mem::take(&mut changes.removed);
            active.retain(|r| !removed.contains(&r.id));
        }
        active.retain(|r| {
            let live = !r.signal.is_invalid();
            if !live {
                log::debug!("async events: dropping handler {:?} on destroyed signal", r.id);
            }
            live
        });

        let hit = {
            let mut entries = Vec::with_capacity(active.len() + 1);
            entries.push(WaitEntry::new(&*shared.wake, Condition::Ne, 0));
            entries.extend(
                active
                    .iter()
                    .map(|r| WaitEntry::new(&*r.signal, r.condition, r.value)),
            );
            wait_any(&entries, TIMEOUT_INFINITE, WaitState::Blocked, shared.spin_window)
        };

        match hit {
            // Wake signal, or a signal destroyed under the wait
            None | Some((0, _)) => continue,
            Some((index, value)) => {
                let registration = &mut active[index - 1];
                match (registration.handler)(value) {
                    Some((condition, value)) => {
                        registration.condition = condition;
                        registration.value = value;
                    },
                    None => {
                        log::trace!("async events: handler {:?} done", registration.id);
                        active.swap_remove(index - 1);
                    },
                }
            },
        }
    }
    log::debug!("async events: exiting with {} handlers", active.len());
}

#[cfg(test)]
mod tests {
    use super::*;
    use hcr_hal::SimKfd;
    use hcr_signal::{DefaultSignal, InterruptSignal};
    use std::sync::mpsc;

    fn handler(
        f: impl FnMut(SignalValue) -> Option<(Condition, SignalValue)> + Send + 'static,
    ) -> AsyncHandler {
        Box::new(f)
    }

    fn events() -> AsyncEvents {
        AsyncEvents::start(Arc::new(DefaultSignal::new(0)), Duration::ZERO).unwrap()
    }

    #[test]
    fn test_handler_runs_once() {
        let events = events();
        let signal: Arc<dyn Signal> = Arc::new(DefaultSignal::new(1));
        let (tx, rx) = mpsc::channel();
        events
            .register(
                signal.clone(),
                Condition::Eq,
                0,
                handler(move |value| {
                    tx.send(value).unwrap();
                    None
                }),
            )
            .unwrap();
        signal.store_release(0);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 0);
        signal.store_release(1);
        signal.store_release(0);
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    }

    #[test]
    fn test_handler_rearms() {
        let events = events();
        let signal: Arc<dyn Signal> = Arc::new(DefaultSignal::new(0));
        let (tx, rx) = mpsc::channel();
        events
            .register(
                signal.clone(),
                Condition::Ne,
                0,
                handler(move |value| {
                    tx.send(value).unwrap();
                    Some((Condition::Gte, value + 10))
                }),
            )
            .unwrap();
        signal.store_release(3);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 3);
        signal.store_release(12);
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        signal.store_release(13);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 13);
    }

    #[test]
    fn test_unregister_is_not_blocking() {
        let events = events();
        let signal: Arc<dyn Signal> = Arc::new(DefaultSignal::new(1));
        let (tx, rx) = mpsc::channel::<SignalValue>();
        let id = events
            .register(
                signal.clone(),
                Condition::Eq,
                0,
                handler(move |value| {
                    tx.send(value).ok();
                    None
                }),
            )
            .unwrap();
        events.unregister(id);
        // Let the thread pick up the removal
        let marker: Arc<dyn Signal> = Arc::new(DefaultSignal::new(1));
        let (done_tx, done_rx) = mpsc::channel();
        events
            .register(
                marker.clone(),
                Condition::Eq,
                0,
                handler(move |_| {
                    done_tx.send(()).unwrap();
                    None
                }),
            )
            .unwrap();
        marker.store_release(0);
        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        signal.store_release(0);
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    }

    #[test]
    fn test_destroyed_signal_is_dropped() {
        let kfd = Arc::new(SimKfd::new());
        let wake: Arc<dyn Signal> =
            Arc::new(InterruptSignal::new(kfd.clone(), 0, Duration::ZERO).unwrap());
        let events = AsyncEvents::start(wake, Duration::ZERO).unwrap();
        let signal: Arc<dyn Signal> =
            Arc::new(InterruptSignal::new(kfd.clone(), 1, Duration::ZERO).unwrap());
        events
            .register(signal.clone(), Condition::Eq, 0, handler(|_| None))
            .unwrap();
        // Returns once the thread has left its wait on the signal
        signal.destroy();
        assert!(signal.is_invalid());
    }

    #[test]
    fn test_register_after_shutdown() {
        let events = events();
        events.shutdown();
        let signal: Arc<dyn Signal> = Arc::new(DefaultSignal::new(0));
        assert_eq!(
            events
                .register(signal, Condition::Eq, 0, handler(|_| None))
                .err(),
            Some(Error::NotInitialized)
        );
    }
}
