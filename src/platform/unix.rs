//! Unix page mapping via `mmap`/`munmap`

use std::io;
use std::ptr::{self, NonNull};

pub(super) fn page_size() -> usize {
    // SAFETY: sysconf(_SC_PAGESIZE) has no preconditions.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

// mmap hands out page-aligned mappings, so the granularity for
// address-masking purposes is simply the page size.
pub(super) fn allocation_granularity() -> usize {
    page_size()
}

pub(super) fn map_pages(len: usize) -> io::Result<NonNull<u8>> {
    // SAFETY: anonymous private mapping with no address hint; the kernel
    // picks the placement and the fd/offset pair is ignored for
    // MAP_ANONYMOUS.
    let ptr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };

    if ptr == libc::MAP_FAILED {
        Err(io::Error::last_os_error())
    } else {
        // MAP_FAILED is the only error sentinel; a successful mmap never
        // returns null, but keep the explicit check rather than assuming.
        NonNull::new(ptr.cast::<u8>()).ok_or_else(|| io::Error::other("mmap returned null"))
    }
}

/// # Safety
///
/// `ptr`/`len` must describe a live mapping created by [`map_pages`].
pub(super) unsafe fn unmap_pages(ptr: NonNull<u8>, len: usize) -> io::Result<()> {
    // SAFETY: caller passes a mapping owned by us.
    let rc = unsafe { libc::munmap(ptr.as_ptr().cast::<libc::c_void>(), len) };
    if rc == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}
