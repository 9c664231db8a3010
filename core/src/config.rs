//! # Configuration
//!
//! Configuration providers and the runtime flags derived from them.
//!
//! The runtime reads its tunables once, at acquire time, through a
//! [`ConfigProvider`]. Production code uses [`EnvConfig`], which reads the
//! process environment; tests use [`MemoryConfig`].
//!
//! | Key                              | Type | Default |
//! |----------------------------------|------|---------|
//! | `HSA_ENABLE_INTERRUPT`           | bool | true    |
//! | `HSA_MAX_QUEUES`                 | uint | 8       |
//! | `HSA_SCRATCH_MEM`                | uint | 2048    |
//! | `HSA_NO_SCRATCH_RECLAIM`         | bool | false   |
//! | `HSA_ENABLE_QUEUE_FAULT_MESSAGE` | bool | true    |
//! | `HSA_WAIT_SPIN_US`               | uint | 5000    |

use std::collections::BTreeMap;
use std::string::String;
use std::time::Duration;

// =============================================================================
// CONFIG VALUE
// =============================================================================

/// A configuration value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigValue {
    /// Boolean
    Bool(bool),
    /// Unsigned integer
    Uint(u64),
    /// String, as read from the environment
    String(String),
}

impl ConfigValue {
    /// Get as bool
    ///
    /// Strings are accepted in the forms environment variables use
    /// (`1`/`0`, `true`/`false`, `yes`/`no`).
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ConfigValue::Bool(b) => Some(*b),
            ConfigValue::Uint(u) => Some(*u != 0),
            ConfigValue::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Some(true),
                "0" | "false" | "no" | "off" => Some(false),
                _ => None,
            },
        }
    }

    /// Get as uint
    ///
    /// Strings may be decimal or `0x`-prefixed hexadecimal.
    pub fn as_uint(&self) -> Option<u64> {
        match self {
            ConfigValue::Uint(u) => Some(*u),
            ConfigValue::String(s) => {
                let s = s.trim();
                match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
                    Some(hex) => u64::from_str_radix(hex, 16).ok(),
                    None => s.parse().ok(),
                }
            },
            ConfigValue::Bool(_) => None,
        }
    }
}

// =============================================================================
// PROVIDERS
// =============================================================================

/// Configuration provider trait
pub trait ConfigProvider: Send + Sync {
    /// Get a configuration value
    fn get(&self, key: &str) -> Option<ConfigValue>;

    /// Get bool with default
    fn get_bool(&self, key: &str, default: bool) -> bool {
        self.get(key).and_then(|v| v.as_bool()).unwrap_or(default)
    }

    /// Get uint with default
    fn get_uint(&self, key: &str, default: u64) -> u64 {
        self.get(key).and_then(|v| v.as_uint()).unwrap_or(default)
    }
}

/// Simple in-memory config provider
#[derive(Debug, Clone, Default)]
pub struct MemoryConfig {
    values: BTreeMap<String, ConfigValue>,
}

impl MemoryConfig {
    /// Create empty config
    pub fn new() -> Self {
        Self {
            values: BTreeMap::new(),
        }
    }

    /// Set a value
    pub fn set(&mut self, key: impl Into<String>, value: ConfigValue) -> &mut Self {
        self.values.insert(key.into(), value);
        self
    }

    /// Set bool
    pub fn set_bool(&mut self, key: impl Into<String>, value: bool) -> &mut Self {
        self.set(key, ConfigValue::Bool(value))
    }

    /// Set uint
    pub fn set_uint(&mut self, key: impl Into<String>, value: u64) -> &mut Self {
        self.set(key, ConfigValue::Uint(value))
    }
}

impl ConfigProvider for MemoryConfig {
    fn get(&self, key: &str) -> Option<ConfigValue> {
        self.values.get(key).cloned()
    }
}

/// Provider reading the process environment
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvConfig;

impl ConfigProvider for EnvConfig {
    fn get(&self, key: &str) -> Option<ConfigValue> {
        std::env::var(key).ok().map(ConfigValue::String)
    }
}

// =============================================================================
// RUNTIME FLAGS
// =============================================================================

/// Interrupt-backed signals for host waiters
pub const KEY_ENABLE_INTERRUPT: &str = "HSA_ENABLE_INTERRUPT";
/// Per-GPU queue limit
pub const KEY_MAX_QUEUES: &str = "HSA_MAX_QUEUES";
/// Default per-work-item scratch bytes
pub const KEY_SCRATCH_MEM: &str = "HSA_SCRATCH_MEM";
/// Disable scratch occupancy reduction
pub const KEY_NO_SCRATCH_RECLAIM: &str = "HSA_NO_SCRATCH_RECLAIM";
/// Log terminal queue faults
pub const KEY_ENABLE_QUEUE_FAULT_MESSAGE: &str = "HSA_ENABLE_QUEUE_FAULT_MESSAGE";
/// Interrupt signal busy-spin window in microseconds
pub const KEY_WAIT_SPIN_US: &str = "HSA_WAIT_SPIN_US";

/// Tunables read once when the runtime is acquired
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeFlags {
    /// Create interrupt signals for host-consumed signals
    pub enable_interrupt: bool,
    /// Maximum queues per GPU agent
    pub max_queues: u32,
    /// Default scratch bytes per work-item
    pub scratch_mem_size: u32,
    /// Fail scratch acquisition instead of reducing occupancy
    pub no_scratch_reclaim: bool,
    /// Log terminal queue faults at error level
    pub enable_queue_fault_message: bool,
    /// Busy-spin window before an interrupt signal sleeps
    pub wait_spin_window: Duration,
}

impl Default for RuntimeFlags {
    fn default() -> Self {
        Self {
            enable_interrupt: true,
            max_queues: 8,
            scratch_mem_size: 2048,
            no_scratch_reclaim: false,
            enable_queue_fault_message: true,
            wait_spin_window: Duration::from_micros(5000),
        }
    }
}

impl RuntimeFlags {
    /// Read flags from a provider, falling back to defaults
    pub fn from_provider(provider: &dyn ConfigProvider) -> Self {
        let defaults = Self::default();
        let max_queues = provider.get_uint(KEY_MAX_QUEUES, u64::from(defaults.max_queues));
        let scratch = provider.get_uint(KEY_SCRATCH_MEM, u64::from(defaults.scratch_mem_size));
        let spin_us = provider.get_uint(
            KEY_WAIT_SPIN_US,
            defaults.wait_spin_window.as_micros() as u64,
        );
        Self {
            enable_interrupt: provider.get_bool(KEY_ENABLE_INTERRUPT, defaults.enable_interrupt),
            max_queues: u32::try_from(max_queues).unwrap_or(u32::MAX).max(1),
            scratch_mem_size: u32::try_from(scratch).unwrap_or(u32::MAX),
            no_scratch_reclaim: provider
                .get_bool(KEY_NO_SCRATCH_RECLAIM, defaults.no_scratch_reclaim),
            enable_queue_fault_message: provider.get_bool(
                KEY_ENABLE_QUEUE_FAULT_MESSAGE,
                defaults.enable_queue_fault_message,
            ),
            wait_spin_window: Duration::from_micros(spin_us),
        }
    }

    /// Read flags from the process environment
    pub fn from_env() -> Self {
        Self::from_provider(&EnvConfig)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_parsing() {
        assert_eq!(ConfigValue::String("1".into()).as_bool(), Some(true));
        assert_eq!(ConfigValue::String("False".into()).as_bool(), Some(false));
        assert_eq!(ConfigValue::String("maybe".into()).as_bool(), None);
        assert_eq!(ConfigValue::String("0x100".into()).as_uint(), Some(256));
        assert_eq!(ConfigValue::String(" 42 ".into()).as_uint(), Some(42));
        assert_eq!(ConfigValue::String("-3".into()).as_uint(), None);
        assert_eq!(ConfigValue::Bool(true).as_uint(), None);
    }

    #[test]
    fn test_flags_defaults() {
        let flags = RuntimeFlags::from_provider(&MemoryConfig::new());
        assert_eq!(flags, RuntimeFlags::default());
    }

    #[test]
    fn test_flags_overrides() {
        let mut config = MemoryConfig::new();
        config
            .set_bool(KEY_ENABLE_INTERRUPT, false)
            .set_uint(KEY_MAX_QUEUES, 0)
            .set(KEY_SCRATCH_MEM, ConfigValue::String("0x400".into()))
            .set_uint(KEY_WAIT_SPIN_US, 10);
        let flags = RuntimeFlags::from_provider(&config);
        assert!(!flags.enable_interrupt);
        assert_eq!(flags.max_queues, 1);
        assert_eq!(flags.scratch_mem_size, 0x400);
        assert_eq!(flags.wait_spin_window, Duration::from_micros(10));
    }

    #[test]
    fn test_unparsable_values_fall_back() {
        let mut config = MemoryConfig::new();
        config
            .set(KEY_MAX_QUEUES, ConfigValue::String("-4".into()))
            .set(KEY_ENABLE_INTERRUPT, ConfigValue::String("sometimes".into()))
            .set(KEY_WAIT_SPIN_US, ConfigValue::Bool(true));
        assert_eq!(RuntimeFlags::from_provider(&config), RuntimeFlags::default());
    }
}
