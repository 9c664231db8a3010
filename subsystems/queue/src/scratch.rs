//! # Scratch Pool
//!
//! Per-GPU pool of scratch aperture carved into per-queue blocks with a
//! [`SmallHeap`]. The pool has its own lock so scratch growth never
//! serializes against other agent operations.
//!
//! ## Placement
//!
//! Small requests are served first-fit from the bottom of the pool. A
//! request is "large" when it exceeds a quarter of the small budget (one
//! eighth of the pool), or when it would push small usage past that budget;
//! large blocks come from the top of the pool and are tracked separately.
//!
//! ## Exhaustion
//!
//! When no block fits:
//! - with reclaim disabled, acquisition fails
//! - if large blocks are outstanding, the request is flagged for retry; the
//!   caller registers a notifier signal that is OR-ed when scratch is freed
//! - otherwise the request is halved (fewer waves in flight) until it fits
//!   or drops below one wave per compute unit

use std::sync::Arc;
use std::vec::Vec;

use hcr_core::{align_up, Error, KernelMutex, Result};
use hcr_hal::Kfd;
use hcr_memory::SmallHeap;
use hcr_signal::{Signal, SignalValue};

/// Allocation granule inside the pool
pub const SCRATCH_GRANULE: usize = 0x1000;

/// Per-work-item scratch alignment
pub const SCRATCH_PER_THREAD_ALIGN: usize = 16;

/// Scratch state of one queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScratchInfo {
    /// Base of the queue's block, zero when none is held
    pub queue_base: usize,
    /// Block size in bytes
    pub size: usize,
    /// Bytes per work-item
    pub size_per_thread: usize,
    /// Offset of the block from the pool base
    pub queue_process_offset: usize,
    /// Block came from the large area
    pub large: bool,
    /// Acquisition failed while large blocks were outstanding
    pub retry: bool,
}

impl ScratchInfo {
    /// Does the queue hold a block?
    pub fn is_held(&self) -> bool {
        self.queue_base != 0
    }
}

/// Sizing of a [`ScratchPool`]
#[derive(Debug, Clone, Copy)]
pub struct ScratchPoolConfig {
    /// GPU node owning the aperture
    pub node: u32,
    /// Aperture bytes to reserve
    pub pool_bytes: usize,
    /// Default bytes per work-item for new queues
    pub default_per_thread: usize,
    /// Work-items that can hold scratch at full occupancy
    pub lanes: usize,
    /// Work-items of one wave on every compute unit
    pub min_lanes: usize,
    /// Fail instead of reducing occupancy
    pub no_reclaim: bool,
    /// The hardware supports a separate large area
    pub large_allowed: bool,
}

#[derive(Debug)]
struct PoolState {
    heap: SmallHeap,
    large_used: usize,
}

/// Scratch aperture shared by the queues of one GPU
#[derive(Debug)]
pub struct ScratchPool {
    kfd: Arc<dyn Kfd>,
    config: ScratchPoolConfig,
    base: usize,
    state: KernelMutex<PoolState>,
    notifiers: KernelMutex<Vec<(Arc<dyn Signal>, SignalValue)>>,
}

impl ScratchPool {
    /// Reserve the aperture and build the pool
    pub fn new(kfd: Arc<dyn Kfd>, config: ScratchPoolConfig) -> Result<Self> {
        if config.pool_bytes == 0 {
            return Err(Error::InvalidArgument);
        }
        let pool_bytes = align_up(config.pool_bytes, SCRATCH_GRANULE);
        let base = kfd.reserve_scratch(config.node, pool_bytes).map_err(|err| {
            log::warn!("scratch: reserving {} bytes on node {} failed: {}", pool_bytes, config.node, err);
            Error::OutOfResources
        })?;
        log::debug!("scratch: pool of {} bytes at {:#x} on node {}", pool_bytes, base, config.node);
        Ok(Self {
            kfd,
            config: ScratchPoolConfig {
                pool_bytes,
                ..config
            },
            base,
            state: KernelMutex::new(PoolState {
                heap: SmallHeap::new(base, pool_bytes),
                large_used: 0,
            }),
            notifiers: KernelMutex::new(Vec::new()),
        })
    }

    /// Pool base
    pub fn base(&self) -> usize {
        self.base
    }

    /// Pool size in bytes
    pub fn size(&self) -> usize {
        self.config.pool_bytes
    }

    /// Unallocated bytes
    pub fn remaining(&self) -> usize {
        self.state.lock().heap.remaining()
    }

    /// Bytes held by large blocks
    pub fn large_used(&self) -> usize {
        self.state.lock().large_used
    }

    /// Block size for `per_thread` bytes per work-item at full occupancy
    pub fn queue_bytes(&self, per_thread: usize) -> usize {
        per_thread * self.config.lanes
    }

    /// Fill `info` with a block
    ///
    /// A zero `info.size` requests the defaults. On failure `queue_base`
    /// stays zero; `retry` tells the caller to wait for a release.
    pub fn acquire(&self, info: &mut ScratchInfo) {
        self.acquire_inner(info, None);
    }

    /// [`ScratchPool::acquire`], registering a notifier if it must retry
    ///
    /// The notifier is added under the pool lock, so a release racing with
    /// the failed attempt cannot be missed.
    pub fn acquire_or_notify(
        &self,
        info: &mut ScratchInfo,
        signal: Arc<dyn Signal>,
        value: SignalValue,
    ) {
        self.acquire_inner(info, Some((signal, value)));
    }

    fn acquire_inner(&self, info: &mut ScratchInfo, notifier: Option<(Arc<dyn Signal>, SignalValue)>) {
        if info.size == 0 {
            info.size_per_thread = self.config.default_per_thread;
            info.size = self.queue_bytes(info.size_per_thread);
        }
        info.retry = false;
        info.queue_base = 0;
        if info.size == 0 {
            return;
        }

        let mut state = self.state.lock();
        let bytes = align_up(info.size, SCRATCH_GRANULE);
        let small_limit = self.config.pool_bytes >> 3;
        let single_limit = small_limit >> 2;
        let used = state.heap.allocated_bytes();
        let large = self.config.large_allowed
            && (bytes > single_limit || used + bytes > small_limit);

        let block = if large {
            state.heap.alloc_high(bytes)
        } else {
            state.heap.alloc(bytes)
        };
        if let Some(base) = block {
            if large {
                state.large_used += bytes;
            }
            self.assign(info, base, bytes, large);
            return;
        }

        if self.config.no_reclaim {
            log::warn!("scratch: {} bytes unavailable, reclaim disabled", bytes);
            return;
        }
        if state.large_used != 0 {
            log::debug!("scratch: {} bytes unavailable, waiting for large release", bytes);
            info.retry = true;
            if let Some(notifier) = notifier {
                self.notifiers.lock().push(notifier);
            }
            return;
        }

        // Trade occupancy for footprint
        let floor = (info.size_per_thread * self.config.min_lanes).max(SCRATCH_GRANULE);
        let mut reduced = bytes / 2;
        while reduced >= floor {
            let candidate = align_up(reduced, SCRATCH_GRANULE);
            if let Some(base) = state.heap.alloc(candidate) {
                log::debug!("scratch: reduced occupancy, {} of {} bytes", candidate, bytes);
                self.assign(info, base, candidate, false);
                return;
            }
            reduced /= 2;
        }
        log::warn!("scratch: pool exhausted, {} bytes requested", bytes);
    }

    fn assign(&self, info: &mut ScratchInfo, base: usize, bytes: usize, large: bool) {
        info.queue_base = base;
        info.size = bytes;
        info.large = large;
        info.queue_process_offset = base - self.base;
    }

    /// Return the block held by `info` and fire pending notifiers
    pub fn release(&self, info: &mut ScratchInfo) {
        if !info.is_held() {
            return;
        }
        {
            let mut state = self.state.lock();
            let freed = state.heap.free(info.queue_base);
            assert!(freed, "scratch block {:#x} not allocated", info.queue_base);
            if info.large {
                state.large_used -= info.size;
            }
        }
        info.queue_base = 0;
        info.queue_process_offset = 0;
        info.large = false;

        let notifiers = core::mem::take(&mut *self.notifiers.lock());
        for (signal, value) in notifiers {
            signal.or_release(value);
        }
    }

    /// OR `value` into `signal` at the next release
    ///
    /// Notifiers fire once.
    pub fn add_notifier(&self, signal: Arc<dyn Signal>, value: SignalValue) {
        self.notifiers.lock().push((signal, value));
    }

    /// Drop pending notifiers targeting `signal`
    pub fn remove_notifier(&self, signal: &Arc<dyn Signal>) {
        let target = Arc::as_ptr(signal).cast::<()>();
        self.notifiers
            .lock()
            .retain(|(s, _)| Arc::as_ptr(s).cast::<()>() != target);
    }

    /// Number of pending notifiers
    pub fn notifier_count(&self) -> usize {
        self.notifiers.lock().len()
    }
}

impl Drop for ScratchPool {
    fn drop(&mut self) {
        if let Err(err) = self.kfd.release_scratch(self.base, self.config.pool_bytes) {
            log::error!("scratch: releasing aperture {:#x} failed: {}", self.base, err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hcr_hal::SimKfd;
    use hcr_signal::DefaultSignal;

    const LANES: usize = 4 * 40 * 64;

    fn pool(pool_bytes: usize, no_reclaim: bool) -> (Arc<SimKfd>, ScratchPool) {
        let kfd = Arc::new(SimKfd::new());
        let pool = ScratchPool::new(
            kfd.clone(),
            ScratchPoolConfig {
                node: 1,
                pool_bytes,
                default_per_thread: 16,
                lanes: LANES,
                min_lanes: 4 * 64,
                no_reclaim,
                large_allowed: true,
            },
        )
        .unwrap();
        (kfd, pool)
    }

    #[test]
    fn test_default_acquire_and_release() {
        let (kfd, pool) = pool(LANES * 16 * 64, false);
        assert_eq!(kfd.scratch_reservations(), 1);
        let mut info = ScratchInfo::default();
        pool.acquire(&mut info);
        assert!(info.is_held());
        assert_eq!(info.size_per_thread, 16);
        assert_eq!(info.size, LANES * 16);
        assert!(!info.large);
        assert_eq!(info.queue_process_offset, 0);

        pool.release(&mut info);
        assert!(!info.is_held());
        assert_eq!(pool.remaining(), pool.size());
        drop(pool);
        assert_eq!(kfd.scratch_reservations(), 0);
    }

    #[test]
    fn test_large_request_comes_from_top() {
        let (_kfd, pool) = pool(0x100_0000, false);
        let mut info = ScratchInfo {
            size: 0x40_0000,
            size_per_thread: 64,
            ..Default::default()
        };
        pool.acquire(&mut info);
        assert!(info.large);
        assert_eq!(info.queue_base + info.size, pool.base() + pool.size());
        assert_eq!(pool.large_used(), 0x40_0000);
        pool.release(&mut info);
        assert_eq!(pool.large_used(), 0);
    }

    #[test]
    fn test_retry_while_large_outstanding() {
        let (_kfd, pool) = pool(0x100_0000, false);
        let mut big = ScratchInfo {
            size: 0xC0_0000,
            size_per_thread: 64,
            ..Default::default()
        };
        pool.acquire(&mut big);
        assert!(big.large);

        let mut other = ScratchInfo {
            size: 0x80_0000,
            size_per_thread: 64,
            ..Default::default()
        };
        pool.acquire(&mut other);
        assert!(!other.is_held());
        assert!(other.retry);

        let notifier: Arc<dyn Signal> = Arc::new(DefaultSignal::new(1));
        pool.add_notifier(notifier.clone(), 1 << 30);
        pool.release(&mut big);
        assert_eq!(notifier.load_relaxed(), 1 | 1 << 30);
        assert_eq!(pool.notifier_count(), 0);

        pool.acquire(&mut other);
        assert!(other.is_held());
    }

    #[test]
    fn test_acquire_or_notify_registers_on_retry() {
        let (_kfd, pool) = pool(0x100_0000, false);
        let mut big = ScratchInfo {
            size: 0xC0_0000,
            size_per_thread: 64,
            ..Default::default()
        };
        pool.acquire(&mut big);
        let notifier: Arc<dyn Signal> = Arc::new(DefaultSignal::new(0));
        let mut small = ScratchInfo {
            size: 0x80_0000,
            size_per_thread: 64,
            ..Default::default()
        };
        pool.acquire_or_notify(&mut small, notifier.clone(), 2);
        assert!(small.retry);
        assert_eq!(pool.notifier_count(), 1);
        pool.release(&mut big);
        assert_eq!(notifier.load_relaxed(), 2);
    }

    #[test]
    fn test_no_reclaim_fails() {
        let (_kfd, pool) = pool(0x10_0000, true);
        let mut info = ScratchInfo {
            size: 0x20_0000,
            size_per_thread: 64,
            ..Default::default()
        };
        pool.acquire(&mut info);
        assert!(!info.is_held());
        assert!(!info.retry);
    }

    #[test]
    fn test_reduced_occupancy() {
        let (_kfd, pool) = pool(0x10_0000, false);
        let mut info = ScratchInfo {
            size: 0x18_0000,
            size_per_thread: 16,
            ..Default::default()
        };
        pool.acquire(&mut info);
        assert!(info.is_held());
        assert_eq!(info.size, 0xC_0000);
    }

    #[test]
    fn test_remove_notifier() {
        let (_kfd, pool) = pool(0x10_0000, false);
        let a: Arc<dyn Signal> = Arc::new(DefaultSignal::new(0));
        let b: Arc<dyn Signal> = Arc::new(DefaultSignal::new(0));
        pool.add_notifier(a.clone(), 1);
        pool.add_notifier(b.clone(), 1);
        pool.remove_notifier(&a);
        assert_eq!(pool.notifier_count(), 1);
    }
}
