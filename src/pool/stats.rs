//! Pool statistics

use core::sync::atomic::{AtomicU64, Ordering};

/// Snapshot of a pool's cumulative counters.
///
/// Produced by [`MemoryPool::stats`](super::MemoryPool::stats). Counters
/// only ever grow; `clear()` does not reset them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Slots handed out by `allocate()`
    pub allocations: u64,
    /// Slots returned by `deallocate()`
    pub deallocations: u64,
    /// Blocks mapped from the page provider
    pub blocks_mapped: u64,
    /// Empty blocks retained as the cached spare
    pub blocks_cached: u64,
    /// Blocks whose pages went back to the provider (`clear()` included)
    pub blocks_released: u64,
}

impl PoolStats {
    /// Number of currently live objects.
    pub fn live(&self) -> u64 {
        self.allocations - self.deallocations
    }
}

/// Lock-free counter set backing [`PoolStats`].
///
/// Relaxed ordering everywhere: the counters are monotonic and only read as
/// a snapshot, never used for synchronization.
#[derive(Debug, Default)]
pub(super) struct AtomicPoolStats {
    allocations: AtomicU64,
    deallocations: AtomicU64,
    blocks_mapped: AtomicU64,
    blocks_cached: AtomicU64,
    blocks_released: AtomicU64,
}

impl AtomicPoolStats {
    pub(super) const fn new() -> Self {
        Self {
            allocations: AtomicU64::new(0),
            deallocations: AtomicU64::new(0),
            blocks_mapped: AtomicU64::new(0),
            blocks_cached: AtomicU64::new(0),
            blocks_released: AtomicU64::new(0),
        }
    }

    #[inline]
    pub(super) fn record_allocation(&self) {
        self.allocations.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(super) fn record_deallocation(&self) {
        self.deallocations.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(super) fn record_block_mapped(&self) {
        self.blocks_mapped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(super) fn record_block_cached(&self) {
        self.blocks_cached.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(super) fn record_block_released(&self) {
        self.blocks_released.fetch_add(1, Ordering::Relaxed);
    }

    pub(super) fn snapshot(&self) -> PoolStats {
        PoolStats {
            allocations: self.allocations.load(Ordering::Relaxed),
            deallocations: self.deallocations.load(Ordering::Relaxed),
            blocks_mapped: self.blocks_mapped.load(Ordering::Relaxed),
            blocks_cached: self.blocks_cached.load(Ordering::Relaxed),
            blocks_released: self.blocks_released.load(Ordering::Relaxed),
        }
    }
}
