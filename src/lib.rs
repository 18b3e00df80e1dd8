//! `threadheap`: a multi-tier thread-caching general-purpose heap allocator.
//!
//! Five cooperating tiers, leaves first: the [`megablock`] manager reserves
//! page-aligned address space and carves it into [`block`]s; each block is
//! dedicated to one size class; the per-size-class [`bin`] holds free nodes and
//! free bunches behind independent locks; each thread's [`thread_cache`] drains
//! and refills from its bin without taking a lock in the common case; and the
//! [`fallback`] heap handles anything larger than the largest size class.
//!
//! Usage order, matching the reference: call [`set_fallback_heap`] first if a
//! non-default fallback is wanted (it is not thread-safe with concurrent
//! allocations), then [`initialize`] (optional — every entry point lazily
//! initializes on first use), then `allocate`/`deallocate`/`reallocate` from as
//! many threads as needed, then [`deinitialize`] to return everything to the
//! address-space provider. There is no portable stable-Rust equivalent of a
//! process-detach hook without a third-party crate this crate does not
//! otherwise need; call `deinitialize()` yourself before exit if you want a
//! leak checker to see a clean teardown.

pub mod addr_space;
pub mod bin;
pub mod block;
pub mod error;
pub mod fallback;
pub mod megablock;
pub mod node;
pub mod size_class;
mod thread_cache;

use std::alloc::{GlobalAlloc, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock};

use bin::Bin;
use megablock::GlobalMegablockManager;
use size_class::{SizeClasses, CACHE_LINE_SIZE, MAX_SIZE, NUM_SIZES, SIZE_UNIT};
use thread_cache::{ThreadCacheCell, Tiers};

static BINS: [Bin; NUM_SIZES] = [const { Bin::new() }; NUM_SIZES];
static MEGABLOCKS: GlobalMegablockManager = GlobalMegablockManager::new();
static SIZE_CLASSES: OnceLock<SizeClasses> = OnceLock::new();
static GENERAL_LOCK: Mutex<()> = Mutex::new(());
static INITIALIZED: AtomicBool = AtomicBool::new(false);

thread_local! {
    static THREAD_CACHE: ThreadCacheCell = const { ThreadCacheCell::new() };
}

pub(crate) fn bins() -> &'static [Bin] {
    &BINS
}

pub(crate) fn megablocks() -> &'static GlobalMegablockManager {
    &MEGABLOCKS
}

/// Used only by [`ThreadCacheCell`]'s `Drop` impl: a thread tearing down must
/// never trigger a fresh `initialize()` just to drain a cache that, if it holds
/// anything, implies the allocator is already initialized.
pub(crate) fn size_classes_if_initialized() -> Option<&'static SizeClasses> {
    SIZE_CLASSES.get()
}

fn ensure_initialized() {
    if !INITIALIZED.load(Ordering::Acquire) {
        initialize();
    }
}

fn classes() -> &'static SizeClasses {
    ensure_initialized();
    SIZE_CLASSES
        .get()
        .expect("initialize() always populates SIZE_CLASSES before returning")
}

fn tiers() -> Tiers<'static> {
    Tiers {
        classes: classes(),
        bins: &BINS,
        megablocks: &MEGABLOCKS,
    }
}

/// Validate the size-class table, build the lookup/bunch tables, and mark the
/// allocator ready. Idempotent under `general_lock`; safe to call from multiple
/// threads, and safe to omit entirely (every entry point calls it lazily).
#[no_mangle]
pub extern "C" fn initialize() {
    let _guard = GENERAL_LOCK.lock().unwrap();
    if INITIALIZED.load(Ordering::Acquire) {
        return;
    }
    SIZE_CLASSES.get_or_init(SizeClasses::build);
    INITIALIZED.store(true, Ordering::Release);
    log::debug!(
        "threadheap: initialized ({} size classes, unit {}, max {})",
        NUM_SIZES,
        SIZE_UNIT,
        MAX_SIZE
    );
}

/// Release every megablock back to the address-space provider and reset every
/// bin, returning the allocator to a state indistinguishable from first launch.
/// NOT thread-safe with concurrent allocate/deallocate calls, nor with threads
/// that still hold a live per-thread cache — matching the reference's
/// documented contract (spec.md §6).
#[no_mangle]
pub extern "C" fn deinitialize() {
    let _guard = GENERAL_LOCK.lock().unwrap();
    if !INITIALIZED.load(Ordering::Acquire) {
        return;
    }
    MEGABLOCKS.teardown();
    for bin in BINS.iter() {
        bin.reset();
    }
    INITIALIZED.store(false, Ordering::Release);
    log::debug!("threadheap: deinitialized");
}

unsafe fn allocate_inner(size: usize) -> *mut u8 {
    if size > MAX_SIZE {
        let page_size = addr_space::page_size();
        let rounded = ((size + page_size - 1) / page_size) * page_size;
        return match fallback::fallback_allocate(rounded) {
            Some(p) => p.as_ptr(),
            None => std::ptr::null_mut(),
        };
    }
    let si = classes().class_of(size);
    let t = tiers();
    THREAD_CACHE.with(|cell| cell.with(|cache| cache.allocate(si, &t).as_ptr() as *mut u8))
}

unsafe fn deallocate_inner(ptr: *mut u8) {
    if ptr.is_null() {
        return;
    }
    if (ptr as usize) % addr_space::page_size() == 0 {
        fallback::fallback_deallocate(NonNull::new_unchecked(ptr));
        return;
    }
    let header = block::header_of(ptr);
    let si = (*header.as_ptr()).size_index as usize;
    let node = NonNull::new_unchecked(ptr as *mut node::Node);
    let t = tiers();
    THREAD_CACHE.with(|cell| cell.with(|cache| cache.deallocate(si, node, &t)));
}

unsafe fn memsize_inner(ptr: *mut u8) -> usize {
    if (ptr as usize) % addr_space::page_size() == 0 {
        return fallback::fallback_memsize(NonNull::new_unchecked(ptr));
    }
    let header = block::header_of(ptr);
    let si = (*header.as_ptr()).size_index as usize;
    SizeClasses::size_of_class(si)
}

unsafe fn reallocate_inner(ptr: *mut u8, new_size: usize) -> *mut u8 {
    if ptr.is_null() {
        return allocate_inner(new_size);
    }
    if new_size == 0 {
        deallocate_inner(ptr);
        return std::ptr::null_mut();
    }
    let old_size = memsize_inner(ptr);
    let new_ptr = allocate_inner(new_size);
    if new_ptr.is_null() {
        return std::ptr::null_mut();
    }
    std::ptr::copy_nonoverlapping(ptr, new_ptr, old_size.min(new_size));
    deallocate_inner(ptr);
    new_ptr
}

/// Allocate `size` bytes. Requests above `MAX_SIZE` are rounded up to a whole
/// number of pages and routed to the fallback heap; everything else is served
/// from the small-object path (spec.md §4.6).
///
/// # Safety
/// None beyond the usual C ABI contract: `size` must not overflow when rounded
/// up, and the caller owns the returned pointer until it passes it back to
/// [`deallocate`] or [`reallocate`].
#[no_mangle]
pub unsafe extern "C" fn allocate(size: usize) -> *mut u8 {
    allocate_inner(size)
}

/// Round `size` up to a `CACHE_LINE_SIZE` multiple, then [`allocate`]. Relies on
/// the initialization-time guarantee that every size class at or above one
/// cache line is itself a cache-line multiple (spec.md §4.1).
///
/// # Safety
/// Same contract as [`allocate`].
#[no_mangle]
pub unsafe extern "C" fn allocate_cacheline_aligned(size: usize) -> *mut u8 {
    let rounded = (size + CACHE_LINE_SIZE - 1) & !(CACHE_LINE_SIZE - 1);
    allocate_inner(rounded)
}

/// Free a pointer previously returned by [`allocate`]/[`reallocate`]/
/// [`allocate_cacheline_aligned`]. `ptr == null` is a no-op.
///
/// # Safety
/// `ptr` must be null or a value this crate previously returned, and must not
/// have been freed already.
#[no_mangle]
pub unsafe extern "C" fn deallocate(ptr: *mut u8) {
    deallocate_inner(ptr)
}

/// Resize an allocation: `ptr == null` behaves as [`allocate`]; `new_size == 0`
/// behaves as [`deallocate`] and returns null; otherwise a fresh block is
/// allocated, `min(old, new)` bytes are copied, and the old pointer is freed.
///
/// # Safety
/// Same contract as [`allocate`]/[`deallocate`] applied to `ptr`.
#[no_mangle]
pub unsafe extern "C" fn reallocate(ptr: *mut u8, new_size: usize) -> *mut u8 {
    reallocate_inner(ptr, new_size)
}

/// The usable size of a previously-returned pointer: `>= ` the size originally
/// requested for it.
///
/// # Safety
/// `ptr` must be a value this crate previously returned and not yet freed.
#[no_mangle]
pub unsafe extern "C" fn memsize(ptr: *mut u8) -> usize {
    memsize_inner(ptr)
}

/// Swap the fallback heap's vtable. Not thread-safe with concurrent allocations
/// — call this during setup only, before any other thread has allocated
/// anything (spec.md §4.6).
///
/// # Safety
/// `allocate`/`deallocate`/`reallocate`/`memsize` must be valid C function
/// pointers implementing a consistent allocator; if `page_aligned` is false or
/// `memsize` is `None`, calls are routed through a 2-pointer wrapper instead of
/// calling them to serve `memsize` directly.
#[no_mangle]
pub unsafe extern "C" fn set_fallback_heap(
    allocate: fallback::AllocateFn,
    deallocate: fallback::DeallocateFn,
    reallocate: Option<fallback::ReallocateFn>,
    memsize: Option<fallback::MemsizeFn>,
    page_aligned: bool,
) {
    fallback::set_fallback_heap(allocate, deallocate, reallocate, memsize, page_aligned);
}

/// Idiomatic `#[global_allocator]` entry point, additive to the `extern "C"`
/// API above (spec.md §4.6 / SPEC_FULL.md §4.6): routes through the exact same
/// `allocate`/`deallocate`/`reallocate` functions, translating `Layout` to/from
/// `(size, align)`. The small path only guarantees `SIZE_UNIT` alignment, so a
/// `Layout` asking for more than that but no more than a cache line is served
/// via [`allocate_cacheline_aligned`]; anything beyond a cache line up to the
/// OS page size is routed to the fallback heap, whose wrapper rounds the
/// returned address up to a page boundary (see `fallback::wrapper_allocate`).
/// A `Layout` asking for alignment stricter than the page size cannot be
/// honestly satisfied through that wrapper, so `alloc` returns null for it
/// rather than silently handing back an under-aligned pointer.
pub struct ThreadHeapAlloc;

unsafe impl GlobalAlloc for ThreadHeapAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() <= SIZE_UNIT {
            allocate_inner(layout.size())
        } else if layout.align() <= CACHE_LINE_SIZE {
            let rounded = (layout.size() + CACHE_LINE_SIZE - 1) & !(CACHE_LINE_SIZE - 1);
            allocate_inner(rounded)
        } else if layout.align() <= addr_space::page_size() {
            match fallback::fallback_allocate(layout.size().max(layout.align())) {
                Some(p) => p.as_ptr(),
                None => std::ptr::null_mut(),
            }
        } else {
            std::ptr::null_mut()
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if layout.align() <= CACHE_LINE_SIZE {
            deallocate_inner(ptr)
        } else {
            fallback::fallback_deallocate(NonNull::new_unchecked(ptr));
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() <= SIZE_UNIT {
            reallocate_inner(ptr, new_size)
        } else if layout.align() <= CACHE_LINE_SIZE {
            let rounded = (new_size + CACHE_LINE_SIZE - 1) & !(CACHE_LINE_SIZE - 1);
            reallocate_inner(ptr, rounded)
        } else {
            let new_ptr = self.alloc(Layout::from_size_align_unchecked(new_size, layout.align()));
            if !new_ptr.is_null() {
                std::ptr::copy_nonoverlapping(ptr, new_ptr, layout.size().min(new_size));
                fallback::fallback_deallocate(NonNull::new_unchecked(ptr));
            }
            new_ptr
        }
    }
}

#[cfg(test)]
mod stress {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex as StdMutex;
    use std::thread;

    // The allocator is process-global singleton state; `cargo test`'s default
    // parallel harness would otherwise let one test's `deinitialize()` race
    // another test's in-flight `allocate`. Every test below takes this lock
    // first, so test bodies never interleave (the threads spawned *within* a
    // test still run concurrently with each other, which is what each scenario
    // actually means to exercise).
    static TEST_LOCK: StdMutex<()> = StdMutex::new(());

    #[test]
    fn scenario_1_small_allocation_properties() {
        let _g = TEST_LOCK.lock().unwrap();
        deinitialize();
        let p = unsafe { allocate(24) };
        assert!(!p.is_null());
        assert_eq!(unsafe { memsize(p) }, 24);
        assert_ne!(p as usize % size_class::BLOCK_SIZE, 0);
        let header = unsafe { block::header_of(p) };
        assert_eq!(usize::from(unsafe { (*header.as_ptr()).size_index }), classes().class_of(24));
        unsafe { deallocate(p) };
    }

    #[test]
    fn scenario_2_oversize_goes_through_fallback() {
        let _g = TEST_LOCK.lock().unwrap();
        fallback::reset_to_default_for_tests();
        let p = unsafe { allocate(6145) };
        assert!(!p.is_null());
        assert_eq!(p as usize % addr_space::page_size(), 0);
        assert!(unsafe { memsize(p) } >= 6145);
        unsafe { deallocate(p) };
    }

    #[test]
    fn scenario_3_two_threads_fifo_drain_distinct_pointers() {
        let _g = TEST_LOCK.lock().unwrap();
        const N: usize = 20_000;
        let handles: Vec<_> = (0..2)
            .map(|_| {
                thread::spawn(|| {
                    let mut ptrs = Vec::with_capacity(N);
                    for _ in 0..N {
                        let p = unsafe { allocate(64) };
                        assert!(!p.is_null());
                        ptrs.push(p);
                    }
                    for p in ptrs {
                        unsafe { deallocate(p) };
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn scenario_3b_concurrent_allocations_are_pairwise_distinct() {
        let _g = TEST_LOCK.lock().unwrap();
        let seen: std::sync::Arc<StdMutex<HashSet<usize>>> =
            std::sync::Arc::new(StdMutex::new(HashSet::new()));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let seen = seen.clone();
                thread::spawn(move || {
                    let mut ptrs = Vec::new();
                    for _ in 0..2_000 {
                        let p = unsafe { allocate(48) };
                        ptrs.push(p as usize);
                    }
                    seen.lock().unwrap().extend(ptrs.iter().copied());
                    for &p in &ptrs {
                        unsafe { deallocate(p as *mut u8) };
                    }
                    ptrs.len()
                })
            })
            .collect();
        let mut total = 0;
        for h in handles {
            total += h.join().unwrap();
        }
        assert_eq!(seen.lock().unwrap().len(), total);
    }

    #[test]
    fn scenario_4_many_threads_random_churn_with_tls_flush() {
        let _g = TEST_LOCK.lock().unwrap();
        let handles: Vec<_> = (0..8)
            .map(|t| {
                thread::spawn(move || {
                    let mut live = Vec::new();
                    for i in 0..5_000usize {
                        let size = size_class::SizeClasses::sizes()[(t + i) % size_class::NUM_SIZES];
                        let p = unsafe { allocate(size) };
                        assert!(!p.is_null());
                        live.push(p);
                        if i % 3 == 0 {
                            if let Some(old) = live.pop() {
                                unsafe { deallocate(old) };
                            }
                        }
                    }
                    for p in live {
                        unsafe { deallocate(p) };
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        // every thread above has now exited, draining its cache via
        // `ThreadCacheCell`'s `Drop` impl; the bins should hold only whole,
        // consistent bunches/nodes and nothing should have crashed getting here.
    }

    #[test]
    fn scenario_5_custom_fallback_round_trips_through_wrapper() {
        let _g = TEST_LOCK.lock().unwrap();
        unsafe extern "C" fn alloc(size: usize) -> *mut u8 {
            libc::malloc(size) as *mut u8
        }
        unsafe extern "C" fn dealloc(ptr: *mut u8) {
            libc::free(ptr as *mut libc::c_void);
        }
        unsafe extern "C" fn realloc_fn(ptr: *mut u8, size: usize) -> *mut u8 {
            libc::realloc(ptr as *mut libc::c_void, size) as *mut u8
        }

        unsafe { set_fallback_heap(alloc, dealloc, Some(realloc_fn), None, false) };
        let p = unsafe { allocate(10_000_000) };
        assert!(!p.is_null());
        assert_eq!(p as usize % addr_space::page_size(), 0);
        assert!(unsafe { memsize(p) } >= 10_000_000);
        unsafe { deallocate(p) };
        fallback::reset_to_default_for_tests();
    }

    #[test]
    fn scenario_6_deinitialize_then_reinitialize_serves_fresh_memory() {
        let _g = TEST_LOCK.lock().unwrap();
        // Makes `initialize`/`deinitialize`'s log::debug! calls visible under
        // `RUST_LOG=debug`; harmless if a previous test already installed a logger.
        let _ = env_logger::try_init();
        deinitialize();
        initialize();
        assert_eq!(MEGABLOCKS.with_manager(|m| m.num_megablocks()), 0);
        let p = unsafe { allocate(16) };
        assert!(!p.is_null());
        assert!(MEGABLOCKS.with_manager(|m| m.num_megablocks()) >= 1);
        unsafe { deallocate(p) };
    }

    #[test]
    fn reallocate_preserves_contents_and_grows() {
        let _g = TEST_LOCK.lock().unwrap();
        let p = unsafe { allocate(32) } as *mut u8;
        unsafe {
            std::ptr::write_bytes(p, 0x42, 32);
        }
        let grown = unsafe { reallocate(p, 128) };
        assert!(!grown.is_null());
        let bytes = unsafe { std::slice::from_raw_parts(grown, 32) };
        assert!(bytes.iter().all(|&b| b == 0x42));
        unsafe { deallocate(grown) };
    }

    #[test]
    fn reallocate_to_zero_frees_and_returns_null() {
        let _g = TEST_LOCK.lock().unwrap();
        let p = unsafe { allocate(32) };
        let r = unsafe { reallocate(p, 0) };
        assert!(r.is_null());
    }

    #[test]
    fn global_alloc_shim_respects_requested_alignment() {
        let _g = TEST_LOCK.lock().unwrap();
        let layout = Layout::from_size_align(40, 32).unwrap();
        let alloc = ThreadHeapAlloc;
        let p = unsafe { alloc.alloc(layout) };
        assert!(!p.is_null());
        assert_eq!(p as usize % 32, 0);
        unsafe { alloc.dealloc(p, layout) };
    }

    #[test]
    fn global_alloc_shim_routes_large_alignment_through_fallback() {
        let _g = TEST_LOCK.lock().unwrap();
        fallback::reset_to_default_for_tests();
        let page = addr_space::page_size();
        let layout = Layout::from_size_align(256, page).unwrap();
        let alloc = ThreadHeapAlloc;
        let p = unsafe { alloc.alloc(layout) };
        assert!(!p.is_null());
        assert_eq!(p as usize % layout.align(), 0);
        unsafe { alloc.dealloc(p, layout) };
    }

    #[test]
    fn global_alloc_shim_rejects_alignment_above_page_size() {
        let _g = TEST_LOCK.lock().unwrap();
        let page = addr_space::page_size();
        let layout = Layout::from_size_align(256, page * 2).unwrap();
        let alloc = ThreadHeapAlloc;
        let p = unsafe { alloc.alloc(layout) };
        assert!(p.is_null());
    }
}
