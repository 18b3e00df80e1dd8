//! The fallback heap: used for any request exceeding `MAX_SIZE`, and, before
//! initialization completes, as the bootstrap allocator. Defaults to the platform
//! `malloc`/`free`/`realloc` via `libc`, matching the reference's default.
//!
//! [`set_fallback_heap`] lets an embedder swap in a different allocator. If the
//! caller doesn't also supply a `memsize` and guarantee page alignment, calls are
//! routed through a self-describing 2-pointer-prefix wrapper (ThreadHeap.cpp lines
//! 47-112) so `memsize`/`deallocate` still work without the caller's cooperation —
//! at the cost of one page of headroom per fallback allocation.

use std::ptr::NonNull;
use std::sync::Mutex;

use crate::error::fatal;

pub type AllocateFn = unsafe extern "C" fn(usize) -> *mut u8;
pub type DeallocateFn = unsafe extern "C" fn(*mut u8);
pub type ReallocateFn = unsafe extern "C" fn(*mut u8, usize) -> *mut u8;
pub type MemsizeFn = unsafe extern "C" fn(*mut u8) -> usize;

unsafe extern "C" fn libc_allocate(size: usize) -> *mut u8 {
    libc::malloc(size) as *mut u8
}
unsafe extern "C" fn libc_deallocate(ptr: *mut u8) {
    libc::free(ptr as *mut libc::c_void);
}
unsafe extern "C" fn libc_reallocate(ptr: *mut u8, size: usize) -> *mut u8 {
    libc::realloc(ptr as *mut libc::c_void, size) as *mut u8
}

struct Vtable {
    allocate: AllocateFn,
    deallocate: DeallocateFn,
    reallocate: Option<ReallocateFn>,
    memsize: Option<MemsizeFn>,
    /// If true, `allocate`/`reallocate` are guaranteed to return page-aligned
    /// memory for sizes >= the page size, and `memsize` is supplied — so no
    /// wrapping is needed.
    self_describing: bool,
}

/// Inner user-supplied functions, kept so the wrapper can delegate to them.
struct Wrapped {
    allocate: AllocateFn,
    deallocate: DeallocateFn,
}

struct FallbackHeap {
    vtable: Vtable,
    wrapped: Wrapped,
}

static FALLBACK: Mutex<Option<FallbackHeap>> = Mutex::new(None);

fn default_state() -> FallbackHeap {
    FallbackHeap {
        vtable: Vtable {
            allocate: wrapper_allocate,
            deallocate: wrapper_deallocate,
            reallocate: None,
            memsize: Some(wrapper_memsize),
            self_describing: false,
        },
        wrapped: Wrapped {
            allocate: libc_allocate,
            deallocate: libc_deallocate,
        },
    }
}

fn with_state<R>(f: impl FnOnce(&FallbackHeap) -> R) -> R {
    let mut guard = FALLBACK.lock().unwrap();
    if guard.is_none() {
        *guard = Some(default_state());
    }
    f(guard.as_ref().unwrap())
}

/// NOT thread-safe with concurrent allocations — callers must only call this
/// during setup, before any other thread has started allocating (spec.md §4.6).
pub fn set_fallback_heap(
    allocate: AllocateFn,
    deallocate: DeallocateFn,
    reallocate: Option<ReallocateFn>,
    memsize: Option<MemsizeFn>,
    page_aligned: bool,
) {
    let mut guard = FALLBACK.lock().unwrap();
    let self_describing = memsize.is_some() && page_aligned;
    *guard = Some(if self_describing {
        FallbackHeap {
            vtable: Vtable {
                allocate,
                deallocate,
                reallocate,
                memsize,
                self_describing: true,
            },
            wrapped: Wrapped { allocate, deallocate },
        }
    } else {
        FallbackHeap {
            vtable: Vtable {
                allocate: wrapper_allocate,
                deallocate: wrapper_deallocate,
                reallocate: None,
                memsize: Some(wrapper_memsize),
                self_describing: false,
            },
            wrapped: Wrapped { allocate, deallocate },
        }
    });
}

fn page_size() -> usize {
    crate::addr_space::page_size()
}

/// Allocate `size` bytes with a 2-machine-word prefix recording the wrapped
/// allocator's own base pointer and the requested size, so `deallocate`/`memsize`
/// can recover them without the wrapped allocator's help. Rounds the return
/// address up to a page boundary.
unsafe extern "C" fn wrapper_allocate(size: usize) -> *mut u8 {
    let wrapped = with_state(|s| s.wrapped.allocate);
    let page = page_size();
    let extra = page + 2 * std::mem::size_of::<usize>() - 1;
    let base = wrapped(size + extra);
    if base.is_null() {
        return std::ptr::null_mut();
    }
    let addr = base as usize;
    let aligned = (addr + extra) & !(page - 1);
    let slots = aligned as *mut usize;
    *slots.offset(-1) = base as usize;
    *slots.offset(-2) = size;
    aligned as *mut u8
}

unsafe extern "C" fn wrapper_deallocate(ptr: *mut u8) {
    if ptr.is_null() {
        return;
    }
    let slots = ptr as *mut usize;
    let base = *slots.offset(-1) as *mut u8;
    let dealloc = with_state(|s| s.wrapped.deallocate);
    dealloc(base);
}

unsafe extern "C" fn wrapper_memsize(ptr: *mut u8) -> usize {
    let slots = ptr as *mut usize;
    *slots.offset(-2)
}

pub fn fallback_allocate(size: usize) -> Option<NonNull<u8>> {
    let f = with_state(|s| s.vtable.allocate);
    NonNull::new(unsafe { f(size) })
}

pub fn fallback_deallocate(ptr: NonNull<u8>) {
    let f = with_state(|s| s.vtable.deallocate);
    unsafe { f(ptr.as_ptr()) };
}

/// The reference stores a fallback `reallocate` function pointer but never calls
/// it from the top-level `reallocate` (which always does allocate+copy+free
/// instead, see `lib.rs`) — it exists purely so the vtable set by
/// `set_fallback_heap` is complete. Kept for the same reason here.
pub fn fallback_reallocate(ptr: *mut u8, size: usize) -> *mut u8 {
    let f = with_state(|s| s.vtable.reallocate);
    match f {
        Some(realloc_fn) => unsafe { realloc_fn(ptr, size) },
        None => unsafe { libc_reallocate(ptr, size) },
    }
}

pub fn fallback_memsize(ptr: NonNull<u8>) -> usize {
    let f = with_state(|s| s.vtable.memsize);
    match f {
        Some(memsize_fn) => unsafe { memsize_fn(ptr.as_ptr()) },
        None => fatal("threadheap: memsize called but no fallback memsize is available"),
    }
}

#[cfg(test)]
pub fn reset_to_default_for_tests() {
    let mut guard = FALLBACK.lock().unwrap();
    *guard = Some(default_state());
}
