//! Windows page mapping via `VirtualAlloc`/`VirtualFree`

use std::io;
use std::mem;
use std::ptr::{self, NonNull};

use winapi::um::memoryapi::{VirtualAlloc, VirtualFree};
use winapi::um::sysinfoapi::{GetSystemInfo, SYSTEM_INFO};
use winapi::um::winnt::{MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE};

fn system_info() -> SYSTEM_INFO {
    // SAFETY: GetSystemInfo fills the out-parameter and cannot fail.
    unsafe {
        let mut info: SYSTEM_INFO = mem::zeroed();
        GetSystemInfo(&mut info);
        info
    }
}

pub(super) fn page_size() -> usize {
    system_info().dwPageSize as usize
}

// Reservations are aligned to dwAllocationGranularity (64 KiB on every
// supported Windows), which is what makes address-masking recovery valid.
pub(super) fn allocation_granularity() -> usize {
    system_info().dwAllocationGranularity as usize
}

pub(super) fn map_pages(len: usize) -> io::Result<NonNull<u8>> {
    // SAFETY: null base address lets the kernel pick a granularity-aligned
    // reservation; COMMIT|RESERVE yields zeroed read/write pages.
    let ptr = unsafe {
        VirtualAlloc(ptr::null_mut(), len, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE)
    };

    NonNull::new(ptr.cast::<u8>()).ok_or_else(io::Error::last_os_error)
}

/// # Safety
///
/// `ptr` must be the base of a live reservation created by [`map_pages`].
pub(super) unsafe fn unmap_pages(ptr: NonNull<u8>, _len: usize) -> io::Result<()> {
    // MEM_RELEASE requires size 0 and releases the whole reservation.
    // SAFETY: caller passes a reservation owned by us.
    let rc = unsafe { VirtualFree(ptr.as_ptr().cast(), 0, MEM_RELEASE) };
    if rc == 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}
