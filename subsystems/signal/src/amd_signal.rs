//! # Hardware Signal Layout
//!
//! The 64-byte signal record the command processor reads and writes. Field
//! offsets are fixed by the hardware.

use core::mem::{offset_of, size_of};
use core::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};

use static_assertions::const_assert_eq;

use crate::AtomicSignalValue;

/// Signal kind stored in [`AmdSignal::kind`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i64)]
pub enum SignalKind {
    /// Destroyed or never initialized
    Invalid        = 0,
    /// Plain value signal
    User           = 1,
    /// Value slot holds a native doorbell address
    Doorbell       = -1,
    /// Value slot holds a 32-bit legacy doorbell address
    LegacyDoorbell = -2,
}

impl SignalKind {
    /// Decode a raw kind, mapping unknown values to `Invalid`
    pub const fn from_raw(raw: i64) -> Self {
        match raw {
            1 => SignalKind::User,
            -1 => SignalKind::Doorbell,
            -2 => SignalKind::LegacyDoorbell,
            _ => SignalKind::Invalid,
        }
    }
}

/// Hardware-visible signal record
#[derive(Debug)]
#[repr(C, align(64))]
pub struct AmdSignal {
    /// [`SignalKind`] as its raw value
    pub kind: AtomicI64,
    /// Signal value, or the doorbell address for doorbell kinds
    pub value: AtomicSignalValue,
    #[cfg(feature = "small_machine_model")]
    _value_high: u32,
    /// Mailbox the command processor writes to raise the event
    pub event_mailbox_ptr: AtomicU64,
    /// Event id written to the mailbox
    pub event_id: AtomicU32,
    _reserved1: u32,
    /// Dispatch start timestamp
    pub start_ts: AtomicU64,
    /// Dispatch end timestamp
    pub end_ts: AtomicU64,
    /// Queue the signal belongs to, for doorbell kinds
    pub queue_ptr: AtomicU64,
    _reserved3: [u32; 2],
}

const_assert_eq!(size_of::<AmdSignal>(), 64);
const_assert_eq!(offset_of!(AmdSignal, value), 8);
const_assert_eq!(offset_of!(AmdSignal, event_mailbox_ptr), 16);
const_assert_eq!(offset_of!(AmdSignal, event_id), 24);
const_assert_eq!(offset_of!(AmdSignal, start_ts), 32);
const_assert_eq!(offset_of!(AmdSignal, end_ts), 40);
const_assert_eq!(offset_of!(AmdSignal, queue_ptr), 48);

impl AmdSignal {
    /// A record of `kind` holding `value`
    pub fn new(kind: SignalKind, value: crate::SignalValue) -> Self {
        Self {
            kind: AtomicI64::new(kind as i64),
            value: AtomicSignalValue::new(value),
            #[cfg(feature = "small_machine_model")]
            _value_high: 0,
            event_mailbox_ptr: AtomicU64::new(0),
            event_id: AtomicU32::new(0),
            _reserved1: 0,
            start_ts: AtomicU64::new(0),
            end_ts: AtomicU64::new(0),
            queue_ptr: AtomicU64::new(0),
            _reserved3: [0; 2],
        }
    }

    /// Current kind
    pub fn kind(&self) -> SignalKind {
        SignalKind::from_raw(self.kind.load(Ordering::Acquire))
    }

    /// Record dispatch timestamps
    pub fn set_timestamps(&self, start: u64, end: u64) {
        self.start_ts.store(start, Ordering::Relaxed);
        self.end_ts.store(end, Ordering::Release);
    }

    /// Dispatch timestamps as `(start, end)`
    pub fn timestamps(&self) -> (u64, u64) {
        let end = self.end_ts.load(Ordering::Acquire);
        (self.start_ts.load(Ordering::Relaxed), end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_is_cache_line() {
        assert_eq!(core::mem::align_of::<AmdSignal>(), 64);
        let signal = AmdSignal::new(SignalKind::User, 5);
        assert_eq!(&signal as *const AmdSignal as usize % 64, 0);
        assert_eq!(signal.kind(), SignalKind::User);
    }

    #[test]
    fn test_kind_round_trip() {
        for kind in [
            SignalKind::Invalid,
            SignalKind::User,
            SignalKind::Doorbell,
            SignalKind::LegacyDoorbell,
        ] {
            assert_eq!(SignalKind::from_raw(kind as i64), kind);
        }
        assert_eq!(SignalKind::from_raw(7), SignalKind::Invalid);
    }
}
