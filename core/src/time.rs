//! # Timestamps
//!
//! Monotonic system timestamps. Wait timeouts are expressed in timestamp
//! ticks, as they are at the public API, and converted here into wall-clock
//! budgets measured against a monotonic clock.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// System timestamp frequency in ticks per second
pub const TIMESTAMP_FREQUENCY: u64 = 1_000_000_000;

/// Timeout value meaning "wait forever"
pub const TIMEOUT_INFINITE: u64 = u64::MAX;

static EPOCH: OnceLock<Instant> = OnceLock::new();

fn epoch() -> Instant {
    *EPOCH.get_or_init(Instant::now)
}

/// Current system timestamp in ticks
pub fn now() -> u64 {
    let elapsed = Instant::now().saturating_duration_since(epoch());
    u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX)
}

/// Convert a tick count at [`TIMESTAMP_FREQUENCY`] into a duration
pub fn ticks_to_duration(ticks: u64) -> Duration {
    let secs = ticks / TIMESTAMP_FREQUENCY;
    let nanos = (ticks % TIMESTAMP_FREQUENCY) * (1_000_000_000 / TIMESTAMP_FREQUENCY);
    Duration::new(secs, nanos as u32)
}

// =============================================================================
// DEADLINE
// =============================================================================

/// Absolute deadline computed once at the start of a wait
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    start: Instant,
    budget: Option<Duration>,
}

impl Deadline {
    /// Deadline `ticks` from now; [`TIMEOUT_INFINITE`] never expires
    pub fn after_ticks(ticks: u64) -> Self {
        let budget = if ticks == TIMEOUT_INFINITE {
            None
        } else {
            Some(ticks_to_duration(ticks))
        };
        Self {
            start: Instant::now(),
            budget,
        }
    }

    /// Time spent since the deadline was armed
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Has the deadline passed?
    pub fn expired(&self) -> bool {
        match self.budget {
            Some(budget) => self.elapsed() >= budget,
            None => false,
        }
    }

    /// Remaining budget, `None` when waiting forever
    pub fn remaining(&self) -> Option<Duration> {
        self.budget.map(|budget| budget.saturating_sub(self.elapsed()))
    }

    /// Remaining budget in whole milliseconds for a kernel wait
    ///
    /// Infinite waits, and budgets too large for the driver's 32-bit
    /// millisecond argument, map to `u32::MAX`.
    pub fn remaining_ms(&self) -> u32 {
        match self.remaining() {
            None => u32::MAX,
            Some(left) => u32::try_from(left.as_millis()).unwrap_or(u32::MAX),
        }
    }
}
