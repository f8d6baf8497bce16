//! Fixed-slot block: one allocation-granularity unit of backing pages
//!
//! A block is a power-of-two-sized, power-of-two-aligned region carved into
//! equal slots. The header lives at offset 0, which is why offset 0 can
//! double as the "block is full" sentinel in `first_free`.
//!
//! # Safety
//!
//! Everything here is raw-pointer surgery guarded by the owning pool's lock:
//!
//! - All header and list mutation happens with the pool lock held; the `Cell`
//!   fields are never touched concurrently.
//! - `parent` is written once during placement and read-only afterwards, so
//!   reading it before taking the lock is race-free.
//! - Slot memory holds a `u64` free-list link only while the slot is not
//!   live; live slots belong exclusively to the caller.
//! - Blocks are aligned to the allocation granularity, so masking any
//!   interior address with `!(granularity - 1)` recovers the header.

use core::cell::Cell;
use core::marker::PhantomData;
use core::mem;
use core::ptr::{self, NonNull};

use crate::lock::RawLock;
use crate::utils::{align_up, const_max};

use super::allocator::PoolShared;

/// Per-block bookkeeping, 16-bit offsets from the block base.
///
/// Offsets cap the block size at 65536 bytes; `capacity_for` keeps
/// `tail_end` itself representable.
#[repr(C)]
pub(super) struct BlockHeader {
    /// Offset of the next never-used slot, 0 once the bump region is spent
    tail: Cell<u16>,
    /// Offset of the next free slot, 0 when the block is full
    first_free: Cell<u16>,
    /// Number of live objects in this block
    live: Cell<u16>,
    /// One past the last valid slot offset
    tail_end: Cell<u16>,
}

/// A slab of `capacity` fixed-size slots plus intrusive list linkage.
///
/// Member of two circular doubly-linked lists threaded through per-pool
/// sentinel nodes: the partial list (blocks believed to have capacity) and
/// the all-blocks list (every block, for bulk teardown).
#[repr(C)]
pub(super) struct Block<T, L, P> {
    header: BlockHeader,
    /// Partial list linkage; null when evicted from the partial list
    prev: Cell<*mut Block<T, L, P>>,
    next: Cell<*mut Block<T, L, P>>,
    /// All-blocks list linkage
    prev_all: Cell<*mut Block<T, L, P>>,
    next_all: Cell<*mut Block<T, L, P>>,
    /// Owning pool's heap-pinned shared state; immutable after placement
    parent: *const PoolShared<T, L, P>,
    _marker: PhantomData<T>,
}

impl<T, L, P> Block<T, L, P> {
    /// Slot alignment: at least `u64` so free slots can hold their link.
    pub(super) const SLOT_ALIGN: usize =
        const_max(mem::align_of::<T>(), mem::align_of::<u64>());

    /// Slot size: at least a `u64`, rounded so every slot stays aligned.
    pub(super) const SLOT_SIZE: usize =
        align_up(const_max(mem::size_of::<T>(), mem::size_of::<u64>()), Self::SLOT_ALIGN);

    /// Offset of the first slot, past the header.
    pub(super) const FIRST_SLOT: usize = align_up(mem::size_of::<Self>(), Self::SLOT_ALIGN);

    /// Number of slots a block carved out of `region` bytes can hold.
    ///
    /// Clamped so that `tail_end` fits a `u16`: a 64 KiB region whose slot
    /// size divides it exactly would otherwise wrap `tail_end` to 0 and brick
    /// the block after one allocation.
    pub(super) fn capacity_for(region: usize) -> usize {
        let usable = region.min(1 << 16);
        debug_assert!(usable > Self::FIRST_SLOT);
        let mut capacity = (usable - Self::FIRST_SLOT) / Self::SLOT_SIZE;
        if Self::FIRST_SLOT + capacity * Self::SLOT_SIZE > u16::MAX as usize {
            capacity -= 1;
        }
        debug_assert!(capacity > 0);
        capacity
    }

    /// Header-only block used as the lists' sentinel node.
    ///
    /// The zeroed header reads as "full" (`first_free == 0`), so the
    /// allocation fast path can try the list head unconditionally; link
    /// pointers must be pointed back at the node via [`Self::self_link`]
    /// once it has its final address.
    pub(super) const fn sentinel() -> Self {
        Self {
            header: BlockHeader {
                tail: Cell::new(0),
                first_free: Cell::new(0),
                live: Cell::new(0),
                tail_end: Cell::new(0),
            },
            prev: Cell::new(ptr::null_mut()),
            next: Cell::new(ptr::null_mut()),
            prev_all: Cell::new(ptr::null_mut()),
            next_all: Cell::new(ptr::null_mut()),
            parent: ptr::null(),
            _marker: PhantomData,
        }
    }

    /// Placement-constructs a block over `region`, owned by `parent`.
    ///
    /// # Safety
    ///
    /// `region` must point to at least `FIRST_SLOT + capacity * SLOT_SIZE`
    /// writable bytes, aligned to the allocation granularity, exclusively
    /// owned by the caller.
    pub(super) unsafe fn initialize(
        region: NonNull<u8>,
        parent: *const PoolShared<T, L, P>,
        capacity: usize,
    ) -> *mut Self {
        let first = Self::FIRST_SLOT;
        let block = region.as_ptr().cast::<Self>();
        // SAFETY: region is big enough for the header and exclusively ours.
        unsafe {
            block.write(Self {
                header: BlockHeader {
                    tail: Cell::new(first as u16),
                    first_free: Cell::new(first as u16),
                    live: Cell::new(0),
                    tail_end: Cell::new((first + capacity * Self::SLOT_SIZE) as u16),
                },
                prev: Cell::new(ptr::null_mut()),
                next: Cell::new(ptr::null_mut()),
                prev_all: Cell::new(ptr::null_mut()),
                next_all: Cell::new(ptr::null_mut()),
                parent,
                _marker: PhantomData,
            });
        }
        block
    }

    #[inline(always)]
    fn as_ptr(&self) -> *mut Self {
        self as *const Self as *mut Self
    }

    #[inline(always)]
    pub(super) fn parent(&self) -> *const PoolShared<T, L, P> {
        self.parent
    }

    #[inline(always)]
    pub(super) fn next(&self) -> *mut Self {
        self.next.get()
    }

    #[inline(always)]
    pub(super) fn next_all(&self) -> *mut Self {
        self.next_all.get()
    }

    /// Whether the block currently sits in the partial list.
    #[inline(always)]
    pub(super) fn is_linked(&self) -> bool {
        !self.prev.get().is_null()
    }

    #[inline(always)]
    pub(super) fn is_empty(&self) -> bool {
        self.header.live.get() == 0
    }

    /// Claims one slot, or `None` if the block is full.
    ///
    /// Never-used slots are claimed by bumping `tail`; the bump value is
    /// threaded through the slot so the unconditional `first_free = *slot`
    /// below covers both the bump and the free-list-reuse case.
    ///
    /// # Safety
    ///
    /// The pool lock must be held. `self` must be the pool sentinel (which
    /// reports full) or a live block.
    pub(super) unsafe fn allocate(&self) -> Option<NonNull<T>> {
        let first = self.header.first_free.get() as usize;
        if first == 0 {
            return None;
        }

        // SAFETY: 0 < first < tail_end <= block size, so the slot is inside
        // our region; slots are SLOT_ALIGN (>= 8) aligned for the u64 link.
        let slot = unsafe { self.as_ptr().cast::<u8>().add(first) }.cast::<u64>();

        if first == self.header.tail.get() as usize {
            let bumped = first + Self::SLOT_SIZE;
            let next_tail = if bumped < self.header.tail_end.get() as usize { bumped } else { 0 };
            self.header.tail.set(next_tail as u16);
            // SAFETY: slot is not live; threading the link here is what the
            // read below consumes.
            unsafe { slot.write(next_tail as u64) };
        }

        // SAFETY: slot holds a link: either the bump value written above or
        // one stored by an earlier deallocation.
        self.header.first_free.set(unsafe { slot.read() } as u16);
        self.header.live.set(self.header.live.get() + 1);

        // SAFETY: slot is derived from a non-null block pointer.
        Some(unsafe { NonNull::new_unchecked(slot.cast::<T>()) })
    }

    /// Returns `ptr`'s slot to this block's local free list.
    ///
    /// Acquires the pool lock itself (and leaves it held): the offset
    /// computation needs no shared state, and deallocation may race with any
    /// other pool operation from any thread. Returns whether the block is now
    /// empty.
    ///
    /// # Safety
    ///
    /// `block` must be the live block `ptr` was allocated from, `ptr` must be
    /// live (no double free), and `lock` must be the owning pool's lock.
    pub(super) unsafe fn deallocate(block: *const Self, ptr: NonNull<T>, lock: &L) -> bool
    where
        L: RawLock,
    {
        let diff = ptr.as_ptr() as usize - block as usize;

        lock.lock();

        // SAFETY: lock held; ptr's slot stops being live right here, so the
        // link write cannot clobber caller data.
        unsafe {
            let this = &*block;
            ptr.as_ptr().cast::<u64>().write(this.header.first_free.get() as u64);
            this.header.first_free.set(diff as u16);
            this.header.live.set(this.header.live.get() - 1);
            this.header.live.get() == 0
        }
    }

    /// Splices this block between `left` and `right` in the partial list.
    ///
    /// # Safety
    ///
    /// Pool lock held; `left` and `right` are adjacent live nodes (possibly
    /// both the sentinel); `self` is not currently linked.
    pub(super) unsafe fn link_partial(&self, left: *mut Self, right: *mut Self) {
        let this = self.as_ptr();
        self.prev.set(left);
        self.next.set(right);
        // SAFETY: neighbors are live nodes of the same pool.
        unsafe {
            (*left).next.set(this);
            (*right).prev.set(this);
        }
    }

    /// Removes this block from the partial list and nulls its linkage.
    ///
    /// # Safety
    ///
    /// Pool lock held; `self` is currently linked.
    pub(super) unsafe fn unlink_partial(&self) {
        // SAFETY: linked nodes always have live neighbors.
        unsafe {
            (*self.prev.get()).next.set(self.next.get());
            (*self.next.get()).prev.set(self.prev.get());
        }
        self.prev.set(ptr::null_mut());
        self.next.set(ptr::null_mut());
    }

    /// Splices this block between `left` and `right` in the all-blocks list.
    ///
    /// # Safety
    ///
    /// As [`Self::link_partial`], for the all-blocks list.
    pub(super) unsafe fn link_all(&self, left: *mut Self, right: *mut Self) {
        let this = self.as_ptr();
        self.prev_all.set(left);
        self.next_all.set(right);
        // SAFETY: neighbors are live nodes of the same pool.
        unsafe {
            (*left).next_all.set(this);
            (*right).prev_all.set(this);
        }
    }

    /// Removes this block from the all-blocks list.
    ///
    /// # Safety
    ///
    /// As [`Self::unlink_partial`], for the all-blocks list.
    pub(super) unsafe fn unlink_all(&self) {
        // SAFETY: linked nodes always have live neighbors.
        unsafe {
            (*self.prev_all.get()).next_all.set(self.next_all.get());
            (*self.next_all.get()).prev_all.set(self.prev_all.get());
        }
        self.prev_all.set(ptr::null_mut());
        self.next_all.set(ptr::null_mut());
    }

    /// Points all four list links of a sentinel at itself (empty lists).
    pub(super) fn self_link(&self, this: *mut Self) {
        self.prev.set(this);
        self.next.set(this);
        self.prev_all.set(this);
        self.next_all.set(this);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::SpinLock;
    use crate::platform::{self, OsPages};

    type TestBlock = Block<u64, SpinLock, OsPages>;

    #[test]
    fn slot_geometry() {
        assert_eq!(TestBlock::SLOT_ALIGN, 8);
        assert_eq!(TestBlock::SLOT_SIZE, 8);
        assert!(TestBlock::FIRST_SLOT >= mem::size_of::<TestBlock>());
        assert_eq!(TestBlock::FIRST_SLOT % TestBlock::SLOT_ALIGN, 0);

        // Over-aligned payloads push the first slot out and pad the slots
        #[repr(align(32))]
        struct Wide([u8; 40]);
        type WideBlock = Block<Wide, SpinLock, OsPages>;
        assert_eq!(WideBlock::SLOT_ALIGN, 32);
        assert_eq!(WideBlock::SLOT_SIZE, 64);
        assert_eq!(WideBlock::FIRST_SLOT % 32, 0);
    }

    #[test]
    fn capacity_leaves_tail_end_representable() {
        // 64 KiB region with 8-byte slots would put tail_end at exactly
        // 65536 without the clamp
        let capacity = TestBlock::capacity_for(1 << 16);
        assert!(TestBlock::FIRST_SLOT + capacity * TestBlock::SLOT_SIZE <= u16::MAX as usize);

        let capacity = TestBlock::capacity_for(4096);
        assert_eq!(capacity, (4096 - TestBlock::FIRST_SLOT) / 8);
    }

    #[test]
    fn bump_then_reuse() {
        let granularity = platform::allocation_granularity();
        let pages = granularity / platform::page_size();
        let region = platform::allocate_pages(pages).expect("mapping failed");
        let capacity = TestBlock::capacity_for(granularity);

        // SAFETY: fresh exclusive region of granularity bytes; single thread,
        // so the uncontended lock discipline below is trivially respected.
        unsafe {
            let block = TestBlock::initialize(region, ptr::null(), capacity);
            let lock = SpinLock::new();

            // Drain the bump region completely
            let mut slots = Vec::with_capacity(capacity);
            for i in 0..capacity {
                let slot = (*block).allocate().expect("block should have capacity");
                slot.as_ptr().write(i as u64);
                slots.push(slot);
            }
            assert!((*block).allocate().is_none(), "block must now be full");

            // Payloads are intact after all the link threading
            for (i, slot) in slots.iter().enumerate() {
                assert_eq!(slot.as_ptr().read(), i as u64);
            }

            // Free two slots and watch them come back LIFO
            let a = slots[3];
            let b = slots[7];
            assert!(!TestBlock::deallocate(block, a, &lock));
            lock.unlock();
            assert!(!TestBlock::deallocate(block, b, &lock));
            lock.unlock();

            assert_eq!((*block).allocate().expect("slot freed"), b);
            assert_eq!((*block).allocate().expect("slot freed"), a);
            assert!((*block).allocate().is_none());

            platform::free_pages(region, pages).expect("unmap failed");
        }
    }

    #[test]
    fn emptying_reports_once() {
        let granularity = platform::allocation_granularity();
        let pages = granularity / platform::page_size();
        let region = platform::allocate_pages(pages).expect("mapping failed");

        // SAFETY: as above.
        unsafe {
            let block = TestBlock::initialize(region, ptr::null(), 4);
            let lock = SpinLock::new();

            let a = (*block).allocate().unwrap();
            let b = (*block).allocate().unwrap();
            assert!(!(*block).is_empty());

            assert!(!TestBlock::deallocate(block, a, &lock));
            lock.unlock();
            assert!(TestBlock::deallocate(block, b, &lock));
            lock.unlock();
            assert!((*block).is_empty());

            platform::free_pages(region, pages).expect("unmap failed");
        }
    }
}
