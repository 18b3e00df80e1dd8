//! The page-granular address-space provider: the one collaborator the allocator
//! treats as an external module even though, unlike the TLS and lock primitives,
//! there is no general-purpose crate to reach for. Adapted from the teacher's
//! `os.rs`, trimmed to just the reserve/release operations the core calls
//! (`allocate_page_block`/`deallocate_page_block` in spec.md §6); `disable_pages`,
//! `enable_pages`, and `reset_pages` are "not required for the core" per the same
//! section and are not implemented.

#[cfg(not(windows))]
use libc::{mmap, munmap, MAP_ANONYMOUS, MAP_PRIVATE, PROT_READ, PROT_WRITE};
#[cfg(windows)]
use winapi::{
    shared::minwindef::LPVOID,
    um::memoryapi::{VirtualAlloc, VirtualFree},
    um::sysinfoapi::{GetSystemInfo, SYSTEM_INFO},
    um::winnt::{MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE},
};

use std::ptr::NonNull;
use std::sync::OnceLock;

static PAGE_SIZE: OnceLock<usize> = OnceLock::new();

/// The OS page size, queried once and cached. Mirrors the teacher's `os_init()`
/// querying `sysconf(_SC_PAGESIZE)` / `GetSystemInfo` on first use.
pub fn page_size() -> usize {
    *PAGE_SIZE.get_or_init(|| {
        #[cfg(not(windows))]
        {
            let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
            if sz > 0 {
                sz as usize
            } else {
                4096
            }
        }
        #[cfg(windows)]
        {
            unsafe {
                let mut si: SYSTEM_INFO = std::mem::zeroed();
                GetSystemInfo(&mut si);
                if si.dwPageSize > 0 {
                    si.dwPageSize as usize
                } else {
                    4096
                }
            }
        }
    })
}

/// Reserve and commit `num_pages` pages of fresh, zeroed, read-write address space.
/// Returns `None` on provider exhaustion (not fatal by itself — callers decide
/// whether the failure is recoverable, per spec.md §4.3's retry-halving loop).
pub fn allocate_page_block(num_pages: usize) -> Option<NonNull<u8>> {
    if num_pages == 0 {
        return None;
    }
    let size = num_pages * page_size();

    #[cfg(not(windows))]
    {
        let p = unsafe {
            mmap(
                std::ptr::null_mut(),
                size,
                PROT_READ | PROT_WRITE,
                MAP_PRIVATE | MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if p == libc::MAP_FAILED {
            log::warn!(
                "threadheap: mmap failed for {} pages ({} bytes): errno {}",
                num_pages,
                size,
                errno::errno()
            );
            return None;
        }
        NonNull::new(p as *mut u8)
    }

    #[cfg(windows)]
    {
        let p = unsafe {
            VirtualAlloc(
                std::ptr::null_mut(),
                size,
                MEM_RESERVE | MEM_COMMIT,
                PAGE_READWRITE,
            )
        };
        if p.is_null() {
            log::warn!(
                "threadheap: VirtualAlloc failed for {} pages ({} bytes)",
                num_pages,
                size
            );
            return None;
        }
        NonNull::new(p as *mut u8)
    }
}

/// Release a region previously returned by [`allocate_page_block`].
///
/// # Safety
/// `ptr` must be a value previously returned by `allocate_page_block`, and
/// `num_pages` must be the same value passed to that call.
pub unsafe fn deallocate_page_block(ptr: NonNull<u8>, num_pages: usize) {
    let size = num_pages * page_size();
    #[cfg(not(windows))]
    {
        if munmap(ptr.as_ptr() as *mut _, size) != 0 {
            log::warn!(
                "threadheap: munmap failed for addr {:p}, size {}: errno {}",
                ptr.as_ptr(),
                size,
                errno::errno()
            );
        }
    }
    #[cfg(windows)]
    {
        let _ = size;
        if VirtualFree(ptr.as_ptr() as LPVOID, 0, MEM_RELEASE) == 0 {
            log::warn!("threadheap: VirtualFree failed for addr {:p}", ptr.as_ptr());
        }
    }
}
