//! OS virtual-memory abstraction backing the pool
//!
//! The pool never goes through the global allocator. Backing memory is
//! obtained straight from the OS in units of whole pages: `mmap` on Unix,
//! `VirtualAlloc` on Windows.
//!
//! # Invariants
//!
//! - [`allocation_granularity`] is a power of two and at least
//!   [`page_size`]. On Windows it is the 64 KiB allocation granularity, on
//!   Unix it equals the page size.
//! - An allocation of `allocation_granularity()` bytes is aligned to its own
//!   size. Block recovery in the pool masks object addresses with
//!   `!(granularity - 1)`, so this alignment is load-bearing, not cosmetic.
//! - Freshly mapped pages are committed, zeroed, readable and writable.

use std::io;
use std::ptr::NonNull;

use once_cell::sync::Lazy;

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod unix;
        use unix as imp;
    } else if #[cfg(windows)] {
        mod windows;
        use windows as imp;
    } else {
        compile_error!("pagepool requires a virtual-memory OS (unix or windows)");
    }
}

static PAGE_SIZE: Lazy<usize> = Lazy::new(imp::page_size);
static ALLOCATION_GRANULARITY: Lazy<usize> = Lazy::new(imp::allocation_granularity);

/// Returns the OS page size in bytes.
#[inline]
pub fn page_size() -> usize {
    *PAGE_SIZE
}

/// Returns the OS allocation granularity in bytes.
///
/// Usually equal to the page size, except on Windows where reservations are
/// aligned to a coarser 64 KiB boundary.
#[inline]
pub fn allocation_granularity() -> usize {
    *ALLOCATION_GRANULARITY
}

/// Allocates `pages` committed, zeroed, read/write pages.
///
/// Returns `None` when the OS refuses the mapping; the failure is logged and
/// otherwise propagates verbatim, there is no retry policy here.
pub fn allocate_pages(pages: usize) -> Option<NonNull<u8>> {
    let len = pages * page_size();
    match imp::map_pages(len) {
        Ok(ptr) => Some(ptr),
        Err(err) => {
            tracing::error!(bytes = len, %err, "page allocation failed");
            None
        }
    }
}

/// Returns `pages` pages starting at `ptr` to the OS.
///
/// # Safety
///
/// `ptr` must be the start of a mapping previously returned by
/// [`allocate_pages`] with the same `pages` count, not yet freed, and no
/// longer referenced.
pub unsafe fn free_pages(ptr: NonNull<u8>, pages: usize) -> io::Result<()> {
    // SAFETY: forwarded caller contract.
    unsafe { imp::unmap_pages(ptr, pages * page_size()) }
}

/// Source of backing pages for a pool.
///
/// The default is [`OsPages`]. Tests substitute instrumented providers to
/// observe page traffic.
///
/// # Safety
///
/// Implementations must hand out committed, zeroed, read/write memory of
/// exactly `pages * page_size()` bytes and, for requests of
/// `allocation_granularity()` bytes total, aligned to
/// [`allocation_granularity`]. The pool recovers block headers by masking
/// object addresses; a misaligned region breaks that recovery and with it
/// memory safety.
pub unsafe trait PageProvider {
    /// Allocates `pages` pages, or `None` if the system is out of memory.
    fn allocate(&self, pages: usize) -> Option<NonNull<u8>>;

    /// Frees `pages` pages starting at `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must come from `allocate(pages)` on this provider and must not
    /// be referenced afterwards.
    unsafe fn free(&self, ptr: NonNull<u8>, pages: usize) -> io::Result<()>;
}

/// Default [`PageProvider`] delegating to the OS.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsPages;

// SAFETY: delegates to mmap/VirtualAlloc, which return zeroed committed
// pages; granularity-sized requests are granularity-aligned (page-aligned on
// Unix where granularity == page size, 64 KiB-aligned reservations on
// Windows).
unsafe impl PageProvider for OsPages {
    fn allocate(&self, pages: usize) -> Option<NonNull<u8>> {
        allocate_pages(pages)
    }

    unsafe fn free(&self, ptr: NonNull<u8>, pages: usize) -> io::Result<()> {
        // SAFETY: forwarded caller contract.
        unsafe { free_pages(ptr, pages) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geometry_is_sane() {
        assert!(page_size().is_power_of_two());
        assert!(allocation_granularity().is_power_of_two());
        assert!(allocation_granularity() >= page_size());
    }

    #[test]
    fn map_unmap_roundtrip() {
        let pages = allocation_granularity() / page_size();
        let ptr = allocate_pages(pages).expect("mapping failed");
        assert_eq!(ptr.as_ptr() as usize % allocation_granularity(), 0);

        // Fresh pages are zeroed and writable
        // SAFETY: ptr spans pages * page_size() bytes, exclusively ours.
        unsafe {
            let bytes = std::slice::from_raw_parts_mut(ptr.as_ptr(), pages * page_size());
            assert!(bytes.iter().all(|&b| b == 0));
            bytes[0] = 0xA5;
            bytes[bytes.len() - 1] = 0x5A;
        }

        // SAFETY: same mapping, same length, last use.
        unsafe { free_pages(ptr, pages) }.expect("unmap failed");
    }

    #[test]
    fn provider_matches_free_functions() {
        let provider = OsPages;
        let ptr = provider.allocate(1).expect("mapping failed");
        // SAFETY: just allocated, unused afterwards.
        unsafe { provider.free(ptr, 1) }.expect("unmap failed");
    }
}
