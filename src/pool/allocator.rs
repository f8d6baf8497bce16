//! Main pool implementation
//!
//! # Safety
//!
//! This module implements a thread-safe fixed-size-object pool:
//! - Backing memory comes straight from a [`PageProvider`] in
//!   allocation-granularity units, never from the global allocator
//! - Blocks are granularity-aligned, so `deallocate` recovers the owning
//!   block from the pointer address alone (no pool handle, no per-object
//!   header)
//! - One lock per pool serializes all list and header mutation; the only
//!   work outside the lock is the page-provider call for fresh pages
//!
//! ## Invariants
//!
//! - The shared state is heap-pinned behind `Box`; blocks store its address
//!   and outlive none of it
//! - A block sits in the partial list iff it is believed to have a free slot;
//!   full blocks are evicted lazily during allocation scans
//! - Every block sits in the all-blocks list from linkage until its pages are
//!   released or cached
//! - At most one cached spare block per pool
//! - Pointers recovered by address masking never outlive the owning pool;
//!   enforcing that is the caller's side of the `unsafe` contract

use core::cell::Cell;
use core::ptr::{self, NonNull};

use crate::lock::{RawLock, SpinLock};
use crate::platform::{self, OsPages, PageProvider};
use crate::utils::is_aligned;

use super::block::Block;
use super::stats::{AtomicPoolStats, PoolStats};

/// Shared, address-stable part of a pool.
///
/// Blocks carry a raw pointer back to this struct, which is why it lives
/// behind `Box` while the [`MemoryPool`] handle itself stays movable.
pub(super) struct PoolShared<T, L, P> {
    lock: L,
    provider: P,
    /// Sentinel node for both intrusive lists
    head: Block<T, L, P>,
    /// At most one fully-empty spare block, kept to damp alloc/free churn
    cache: Cell<*mut Block<T, L, P>>,
    stats: AtomicPoolStats,
}

impl<T, L, P> PoolShared<T, L, P> {
    #[inline(always)]
    fn sentinel(&self) -> *mut Block<T, L, P> {
        &self.head as *const Block<T, L, P> as *mut Block<T, L, P>
    }
}

/// Thread-safe memory pool for objects of type `T`.
///
/// The pool hands out uninitialized, `align_of::<T>()`-aligned slots of
/// `max(size_of::<T>(), 8)` bytes in O(1), backed by OS pages obtained in
/// allocation-granularity units. It neither constructs nor drops payloads;
/// it touches slot bytes only while a slot is free (to thread the local
/// free list).
///
/// Blocks are aligned on a power of two equal to their size, which removes
/// the need for a per-object header: [`MemoryPool::deallocate`] is a static
/// function that recovers all bookkeeping from the pointer address, so
/// objects may be freed from any thread without a pool reference in hand.
///
/// [`MemoryPool::clear`] wipes every allocation in one call without visiting
/// individual objects; the destructor does the same.
///
/// `Lock` selects the synchronization strategy: [`SpinLock`] (default) for
/// shared pools, [`NullLock`](crate::lock::NullLock) to strip synchronization
/// from a single-threaded pool. `Provider` selects the backing-page source
/// and defaults to the OS.
pub struct MemoryPool<T, L: RawLock = SpinLock, P: PageProvider = OsPages> {
    shared: Box<PoolShared<T, L, P>>,
}

impl<T, L: RawLock, P: PageProvider + Default> MemoryPool<T, L, P> {
    /// Creates an empty pool with a default-constructed page provider.
    ///
    /// No pages are mapped until the first allocation.
    pub fn new() -> Self {
        Self::with_provider(P::default())
    }
}

impl<T, L: RawLock, P: PageProvider + Default> Default for MemoryPool<T, L, P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, L: RawLock, P: PageProvider> MemoryPool<T, L, P> {
    /// Creates an empty pool drawing backing pages from `provider`.
    pub fn with_provider(provider: P) -> Self {
        const {
            assert!(core::mem::size_of::<T>() < 2000, "pool is intended for small objects only");
            assert!(
                core::mem::align_of::<T>() <= 512,
                "payload alignment exceeds what one block can carry"
            );
        }

        let shared = Box::new(PoolShared {
            lock: L::default(),
            provider,
            head: Block::sentinel(),
            cache: Cell::new(ptr::null_mut()),
            stats: AtomicPoolStats::new(),
        });
        // The sentinel can only point at itself once it has its final
        // heap address.
        shared.head.self_link(shared.sentinel());

        Self { shared }
    }

    /// Number of objects a single block holds on this platform.
    pub fn block_capacity() -> usize {
        Block::<T, L, P>::capacity_for(platform::allocation_granularity())
    }

    /// Allocates one uninitialized slot for a `T`.
    ///
    /// Returns `None` only if the page provider itself fails; local block
    /// exhaustion transparently maps a new block.
    ///
    /// The slot must eventually be returned with [`MemoryPool::deallocate`]
    /// (from any thread) or reclaimed wholesale by [`MemoryPool::clear`] or
    /// the pool's destructor.
    pub fn allocate(&self) -> Option<NonNull<T>> {
        let shared = &*self.shared;
        shared.lock.lock();

        // SAFETY: lock held; list pointers are valid by the module
        // invariants. The partial-list head is the sentinel when the list is
        // empty, and the sentinel's zeroed header reports "full".
        let slot = unsafe {
            let head = shared.head.next();
            if let Some(slot) = (*head).allocate() {
                shared.lock.unlock();
                Some(slot)
            } else if let Some(slot) = Self::allocate_from_partial_list(shared) {
                shared.lock.unlock();
                Some(slot)
            } else {
                let slot = Self::allocate_from_new_block(shared);
                shared.lock.unlock();
                slot
            }
        };

        if slot.is_some() {
            shared.stats.record_allocation();
        }
        slot
    }

    /// Scans the partial list for a block with a free slot, evicting blocks
    /// discovered to be full.
    ///
    /// # Safety
    ///
    /// Pool lock held.
    unsafe fn allocate_from_partial_list(shared: &PoolShared<T, L, P>) -> Option<NonNull<T>> {
        let sentinel = shared.sentinel();

        // The head just failed the fast path: it is full, evict it first.
        let mut bl = shared.head.next();
        if bl != sentinel {
            // SAFETY: bl is a live linked block; lock held.
            unsafe { (*bl).unlink_partial() };
            bl = shared.head.next();
        }

        while bl != sentinel {
            // SAFETY: bl is a live linked block; lock held.
            unsafe {
                if let Some(slot) = (*bl).allocate() {
                    return Some(slot);
                }
                let next = (*bl).next();
                (*bl).unlink_partial();
                bl = next;
            }
        }
        None
    }

    /// Maps a new block (or revives the cached spare) and allocates from it.
    ///
    /// The provider call runs with the lock released so a potentially slow
    /// syscall never blocks deallocations; relinking afterwards is safe
    /// regardless of what other threads did in the interim. The cached spare
    /// is claimed while the lock is still held.
    ///
    /// # Safety
    ///
    /// Pool lock held on entry; held again on return.
    unsafe fn allocate_from_new_block(shared: &PoolShared<T, L, P>) -> Option<NonNull<T>> {
        let mut region = shared.cache.replace(ptr::null_mut()).cast::<u8>();
        shared.lock.unlock();

        let granularity = platform::allocation_granularity();
        if region.is_null() {
            match shared.provider.allocate(granularity / platform::page_size()) {
                Some(pages) => {
                    debug_assert!(is_aligned(pages.as_ptr() as usize, granularity));
                    shared.stats.record_block_mapped();
                    region = pages.as_ptr();
                }
                None => {
                    shared.lock.lock();
                    return None;
                }
            }
        }

        let capacity = Block::<T, L, P>::capacity_for(granularity);
        // SAFETY: region is a granularity-sized, granularity-aligned
        // mapping owned by us; shared is heap-pinned for the pool's lifetime.
        let block = unsafe {
            Block::initialize(NonNull::new_unchecked(region), shared as *const _, capacity)
        };

        shared.lock.lock();
        // SAFETY: lock reacquired; block is fresh and unlinked, the sentinel
        // and its neighbors are live.
        unsafe {
            let sentinel = shared.sentinel();
            (*block).link_partial(sentinel, shared.head.next());
            (*block).link_all(sentinel, shared.head.next_all());
            (*block).allocate()
        }
    }

    /// Returns `ptr`'s slot to the pool that allocated it.
    ///
    /// This is a static function: the owning block is recovered by masking
    /// the address down to the allocation granularity, and the pool through
    /// the block's parent pointer. That is what makes frees legal from any
    /// thread, with no pool reference at the call site.
    ///
    /// # Safety
    ///
    /// - `ptr` must come from `allocate()` on a pool of exactly this type
    ///   (`T`, `Lock` and `Provider` all matching) that is still alive and
    ///   has not run [`MemoryPool::clear`] since
    /// - `ptr` must be live: not already deallocated
    /// - The payload must be finished with; the slot may be reused or its
    ///   pages unmapped at any point after this call
    ///
    /// None of this is validated, by design; violations are undefined
    /// behavior, not recoverable errors.
    pub unsafe fn deallocate(ptr: NonNull<T>) {
        let mask = platform::allocation_granularity() - 1;
        let block = ((ptr.as_ptr() as usize) & !mask) as *mut Block<T, L, P>;

        // SAFETY: caller contract puts ptr inside a live block of this pool
        // type; parent is immutable after placement so the pre-lock read is
        // race-free. Block::deallocate acquires the pool lock and leaves it
        // held.
        unsafe {
            let shared = &*(*block).parent();
            let empty = Block::deallocate(block, ptr, &shared.lock);
            shared.stats.record_deallocation();

            // Membership is read under the lock: an unlinked block means it
            // was evicted while full and now offers capacity again.
            if empty || !(*block).is_linked() {
                Self::deallocate_slow(shared, block);
                return;
            }
            shared.lock.unlock();
        }
    }

    /// Handles the uncommon deallocation outcomes: the block became empty,
    /// or it had been evicted from the partial list while full.
    ///
    /// # Safety
    ///
    /// Pool lock held (released before returning); `block` is a live block
    /// of `shared`.
    unsafe fn deallocate_slow(shared: &PoolShared<T, L, P>, block: *mut Block<T, L, P>) {
        // SAFETY: lock held throughout the list surgery below.
        unsafe {
            if (*block).is_empty() {
                // A capacity-1 block can empty while still evicted, so the
                // partial unlink is conditional.
                if (*block).is_linked() {
                    (*block).unlink_partial();
                }
                (*block).unlink_all();

                if shared.cache.get().is_null() {
                    shared.cache.set(block);
                    shared.stats.record_block_cached();
                    shared.lock.unlock();
                    return;
                }

                shared.lock.unlock();
                Self::release_block(shared, block);
                return;
            }

            if !(*block).is_linked() {
                let sentinel = shared.sentinel();
                (*block).link_partial(sentinel, shared.head.next());
            }
            shared.lock.unlock();
        }
    }

    /// Returns a block's pages to the provider, best effort.
    ///
    /// A failed release leaks the pages but corrupts nothing; there is no
    /// recovery path, so it is logged and ignored.
    ///
    /// # Safety
    ///
    /// `block` must be unlinked from both lists, not cached, and without
    /// live objects; no references to it may survive this call.
    unsafe fn release_block(shared: &PoolShared<T, L, P>, block: *mut Block<T, L, P>) {
        let pages = platform::allocation_granularity() / platform::page_size();
        // SAFETY: block is the base of a provider mapping of `pages` pages,
        // and the caller guarantees it is unreachable.
        let result = unsafe {
            shared.provider.free(NonNull::new_unchecked(block.cast::<u8>()), pages)
        };
        if let Err(err) = result {
            tracing::warn!(%err, "failed to return pages to the provider");
        }
        shared.stats.record_block_released();
    }

    /// Releases every block, the cached spare included, and resets the pool
    /// to empty.
    ///
    /// This is a hard reset: it does not visit, let alone drop, still-live
    /// payloads. The pool is immediately usable again afterwards. Calling it
    /// twice in a row is a no-op the second time.
    ///
    /// # Safety
    ///
    /// Every pointer previously returned by `allocate()` and every
    /// [`PoolBox`](super::PoolBox) from this pool becomes dangling; the
    /// caller must ensure none of them is used again.
    pub unsafe fn clear(&self) {
        let shared = &*self.shared;
        shared.lock.lock();

        // SAFETY: lock held; the all-blocks list reaches every block
        // regardless of partial-list state. Links die with the blocks, so
        // only next_all is read before each release.
        unsafe {
            let sentinel = shared.sentinel();
            let mut bl = shared.head.next_all();
            while bl != sentinel {
                let next = (*bl).next_all();
                Self::release_block(shared, bl);
                bl = next;
            }

            shared.head.self_link(sentinel);

            let cached = shared.cache.replace(ptr::null_mut());
            if !cached.is_null() {
                Self::release_block(shared, cached);
            }
        }

        shared.lock.unlock();
    }

    /// Snapshot of the pool's cumulative counters.
    ///
    /// Counters survive [`MemoryPool::clear`]; page releases performed by it
    /// are included.
    pub fn stats(&self) -> PoolStats {
        self.shared.stats.snapshot()
    }
}

impl<T, L: RawLock, P: PageProvider> Drop for MemoryPool<T, L, P> {
    fn drop(&mut self) {
        // SAFETY: dropping the pool is the caller's statement that no
        // outstanding pointer will be used again; `clear` requires no more.
        unsafe { self.clear() };
    }
}

// SAFETY: MemoryPool is Send when its lock and provider are.
// - The pool owns its blocks and shared state outright; nothing is
//   thread-local
// - Raw block pointers are plain addresses, meaningful from any thread
// - Payloads are never stored by value, so T places no constraint on moving
//   the (possibly non-empty) pool itself
unsafe impl<T, L: RawLock + Send, P: PageProvider + Send> Send for MemoryPool<T, L, P> {}

// SAFETY: MemoryPool is Sync when its lock and provider are.
// - Every access to list links, block headers and the cache slot happens
//   with the pool lock held; L: Sync + RawLock guarantees real mutual
//   exclusion (NullLock is !Sync and is excluded here)
// - Block parent pointers are immutable after placement (read-read races
//   only)
// - The provider is only called concurrently if P: Sync says it can be
// - Stats counters are atomics
unsafe impl<T, L: RawLock + Sync, P: PageProvider + Sync> Sync for MemoryPool<T, L, P> {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::NullLock;

    #[test]
    fn allocate_writes_and_frees() {
        let pool: MemoryPool<u64> = MemoryPool::new();
        let ptr = pool.allocate().expect("allocation failed");

        // SAFETY: fresh slot, exclusively ours until deallocate.
        unsafe {
            ptr.as_ptr().write(0xDEAD_BEEF);
            assert_eq!(ptr.as_ptr().read(), 0xDEAD_BEEF);
            MemoryPool::<u64>::deallocate(ptr);
        }
    }

    #[test]
    fn freed_slot_is_reused_lifo() {
        let pool: MemoryPool<u64> = MemoryPool::new();
        let first = pool.allocate().unwrap();
        // SAFETY: first is live and unused.
        unsafe { MemoryPool::<u64>::deallocate(first) };
        let second = pool.allocate().unwrap();
        assert_eq!(first, second);
        // SAFETY: second is live and unused.
        unsafe { MemoryPool::<u64>::deallocate(second) };
    }

    #[test]
    fn null_lock_pool_works_single_threaded() {
        let pool: MemoryPool<[u8; 24], NullLock> = MemoryPool::new();
        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        assert_ne!(a, b);
        // SAFETY: both slots live and unused.
        unsafe {
            MemoryPool::<[u8; 24], NullLock>::deallocate(a);
            MemoryPool::<[u8; 24], NullLock>::deallocate(b);
        }
    }

    #[test]
    fn stats_track_traffic() {
        let pool: MemoryPool<u64> = MemoryPool::new();
        let ptrs: Vec<_> = (0..10).map(|_| pool.allocate().unwrap()).collect();
        for ptr in ptrs {
            // SAFETY: each ptr is live and unused.
            unsafe { MemoryPool::<u64>::deallocate(ptr) };
        }

        let stats = pool.stats();
        assert_eq!(stats.allocations, 10);
        assert_eq!(stats.deallocations, 10);
        assert_eq!(stats.blocks_mapped, 1);
        // The emptied block went to the cache, not back to the OS
        assert_eq!(stats.blocks_cached, 1);
        assert_eq!(stats.blocks_released, 0);
    }

    #[test]
    fn clear_is_idempotent_and_reusable() {
        let pool: MemoryPool<u64> = MemoryPool::new();
        for _ in 0..4 {
            pool.allocate().unwrap();
        }

        // SAFETY: the leaked pointers above are never touched again.
        unsafe {
            pool.clear();
            pool.clear();
        }

        let ptr = pool.allocate().expect("pool must be usable after clear");
        // SAFETY: fresh slot.
        unsafe { MemoryPool::<u64>::deallocate(ptr) };
    }
}
