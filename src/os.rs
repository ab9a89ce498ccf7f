//! OS memory reservation: one `mmap`/`VirtualAlloc` call per segment.
//!
//! The pool does not manage virtual memory policy beyond this single
//! reservation per segment; there is no page cache, no large page support,
//! and no abandon/reclaim machinery.

#[cfg(not(windows))]
use libc::{mmap, munmap, MAP_ANONYMOUS, MAP_FAILED, MAP_PRIVATE, PROT_READ, PROT_WRITE};
#[cfg(windows)]
use winapi::{
    shared::minwindef::LPVOID,
    um::memoryapi::{VirtualAlloc, VirtualFree},
    um::sysinfoapi::GetSystemInfo,
    um::sysinfoapi::SYSTEM_INFO,
    um::winnt::{MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE},
};

use log::warn;
use std::sync::OnceLock;

use crate::error::PoolError;

fn page_size_cell() -> &'static usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    PAGE_SIZE.get_or_init(|| {
        #[cfg(not(windows))]
        {
            let n = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
            if n > 0 {
                n as usize
            } else {
                4096
            }
        }
        #[cfg(windows)]
        {
            unsafe {
                let mut si: SYSTEM_INFO = std::mem::zeroed();
                GetSystemInfo(&mut si);
                si.dwPageSize.max(4096) as usize
            }
        }
    })
}

/// The OS's native page size, used to round segment reservations up to a
/// size the OS will actually grant.
pub fn os_page_size() -> usize {
    *page_size_cell()
}

fn good_alloc_size(size: usize) -> usize {
    crate::types::align_up(size, os_page_size())
}

/// Reserve and commit `size` bytes (rounded up to a whole number of OS
/// pages) from the operating system. Returns `OutOfMemory` on failure,
/// logging the underlying OS error at `warn` level.
pub fn reserve(size: usize) -> Result<*mut u8, PoolError> {
    if size == 0 {
        return Err(PoolError::InvalidSize);
    }
    let rounded = good_alloc_size(size);

    #[cfg(not(windows))]
    {
        let p = unsafe {
            mmap(
                core::ptr::null_mut(),
                rounded,
                PROT_READ | PROT_WRITE,
                MAP_PRIVATE | MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if p == MAP_FAILED {
            warn!("mmap failed for {rounded} bytes: {}", errno::errno());
            return Err(PoolError::OutOfMemory);
        }
        Ok(p as *mut u8)
    }

    #[cfg(windows)]
    {
        let p = unsafe {
            VirtualAlloc(
                core::ptr::null_mut(),
                rounded,
                MEM_RESERVE | MEM_COMMIT,
                PAGE_READWRITE,
            )
        };
        if p.is_null() {
            warn!("VirtualAlloc failed for {rounded} bytes");
            return Err(PoolError::OutOfMemory);
        }
        Ok(p as *mut u8)
    }
}

/// Release a region previously returned by [`reserve`]. `size` must be the
/// same `size` passed to `reserve` (the rounded, committed length).
///
/// # Safety
/// `ptr` must be a live reservation from [`reserve`] that has not already
/// been released; no other reference to the region may be in use.
pub unsafe fn release(ptr: *mut u8, size: usize) {
    if ptr.is_null() || size == 0 {
        return;
    }
    let rounded = good_alloc_size(size);

    #[cfg(not(windows))]
    {
        let rc = unsafe { munmap(ptr as *mut _, rounded) };
        if rc != 0 {
            warn!("munmap failed for {rounded} bytes at {ptr:p}: {}", errno::errno());
        }
    }

    #[cfg(windows)]
    {
        let _ = rounded;
        let rc = unsafe { VirtualFree(ptr as LPVOID, 0, MEM_RELEASE) };
        if rc == 0 {
            warn!("VirtualFree failed for region at {ptr:p}");
        }
    }
}
