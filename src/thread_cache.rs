//! The per-thread cache: one unsynchronized free-list per size class per thread.
//! This is the fast path — no lock is ever taken unless the cache itself is empty
//! or has overflowed a bunch boundary.
//!
//! Modeled after the reference's `PerThread` (`ThreadHeap.cpp`), but housed in a
//! `thread_local!` cell whose `Drop` impl performs the drain the reference runs
//! from its TLS-destruction callback (see `other_examples`' `rstcmalloc` for the
//! idiomatic `thread_local!` shape this follows).

use std::cell::UnsafeCell;
use std::ptr::NonNull;

use crate::bin::Bin;
use crate::megablock::GlobalMegablockManager;
use crate::node::{Bunch, Node, NodeList};
use crate::size_class::{SizeClasses, NUM_SIZES};

/// One size class's worth of per-thread state, padded to a cache line so adjacent
/// size classes in the same thread's cache don't false-share.
#[repr(align(64))]
struct PerThreadBin {
    list: NodeList,
    markers: [*mut Node; 2],
}

impl PerThreadBin {
    const fn new() -> Self {
        PerThreadBin {
            list: NodeList::new(),
            markers: [std::ptr::null_mut(); 2],
        }
    }
}

/// Global handles the cache needs to reach the next tier down. Borrowed for the
/// duration of each call; never stored past it, so the cache itself holds nothing
/// that outlives the allocator's static state.
pub struct Tiers<'a> {
    pub classes: &'a SizeClasses,
    pub bins: &'a [Bin],
    pub megablocks: &'a GlobalMegablockManager,
}

pub struct PerThreadCache {
    bins: Vec<PerThreadBin>,
}

impl PerThreadCache {
    fn new() -> Self {
        let mut bins = Vec::with_capacity(NUM_SIZES);
        for _ in 0..NUM_SIZES {
            bins.push(PerThreadBin::new());
        }
        PerThreadCache { bins }
    }

    /// Pop a node for size class `si`, falling through to the shared bin's bunch
    /// tier (under its `free_bunch_lock`) when this thread's own list is empty.
    pub fn allocate(&mut self, si: usize, tiers: &Tiers) -> NonNull<Node> {
        let tb = &mut self.bins[si];
        if let Some(n) = tb.list.pop() {
            return n;
        }

        let bunch = tiers.bins[si].allocate_bunch(si, tiers.classes, tiers.megablocks);
        let bunch_count = tiers.classes.bunch_count(si);
        let head = unsafe { Node::from_bunch(bunch) };
        let tail = unsafe { head.as_ref().next };
        tb.list.head = tail;
        tb.list.count = bunch_count - 1;
        head
    }

    /// Push a node back. The marker index is derived from this thread's count
    /// *before* the push, matching the reference's `GENERIC_DEALLOCATE` (which
    /// computes it ahead of `num_nodes++`); a detach only fires once that
    /// pre-push index has already saturated to 2 — one push later than a count
    /// comparison taken after the push would suggest.
    pub fn deallocate(&mut self, si: usize, node: NonNull<Node>, tiers: &Tiers) {
        let tb = &mut self.bins[si];
        let idx = tiers.classes.marker_index(si, tb.list.count);
        if idx < 2 {
            tb.markers[idx] = node.as_ptr();
        }
        tb.list.push(node);
        if idx != 2 {
            return;
        }

        let bunch_count = tiers.classes.bunch_count(si);
        tb.list.count -= bunch_count;
        let bunch_ptr = tb.markers[0];
        tb.markers[0] = tb.markers[1];
        tb.markers[1] = node.as_ptr();

        let bunch = unsafe { Bunch::from_node(NonNull::new_unchecked(bunch_ptr)) };
        tiers.bins[si].deallocate_bunch(bunch);
    }

    /// Drain every size class back to the shared bins: whole bunches first (while
    /// at least `bunch_count` nodes remain), then any remainder one node at a time.
    /// Runs once, from `Drop`, on thread exit.
    fn drain(&mut self, tiers: &Tiers) {
        for si in 0..NUM_SIZES {
            let bunch_count = tiers.classes.bunch_count(si);
            loop {
                let tb = &mut self.bins[si];
                if tb.list.count < bunch_count {
                    break;
                }
                tb.list.count -= bunch_count;
                let bunch_ptr = tb.markers[0];
                tb.markers[0] = tb.markers[1];
                let bunch = unsafe { Bunch::from_node(NonNull::new_unchecked(bunch_ptr)) };
                tiers.bins[si].deallocate_bunch(bunch);
            }

            let tb = &mut self.bins[si];
            while let Some(n) = tb.list.pop() {
                tiers.bins[si].deallocate_node(n, si, tiers.classes);
            }
        }
    }
}

/// Owns the cache for exactly one thread. `Drop` drains it back to the shared
/// bins, which only happens once the allocator's statics (bins, megablock
/// manager, size classes) are guaranteed to still be alive, since this cell is
/// torn down by the same thread that's using it while the process as a whole is
/// still running.
pub struct ThreadCacheCell {
    cache: UnsafeCell<Option<PerThreadCache>>,
}

impl ThreadCacheCell {
    pub const fn new() -> Self {
        ThreadCacheCell {
            cache: UnsafeCell::new(None),
        }
    }

    /// Run `f` against this thread's cache, constructing it on first use.
    pub fn with<R>(&self, f: impl FnOnce(&mut PerThreadCache) -> R) -> R {
        let cache = unsafe { &mut *self.cache.get() };
        let cache = cache.get_or_insert_with(PerThreadCache::new);
        f(cache)
    }

    /// Drain and drop this thread's cache, if it was ever constructed. Safe to
    /// call more than once; a second call is a no-op.
    pub fn drain_and_clear(&self, tiers: &Tiers) {
        let cache = unsafe { &mut *self.cache.get() };
        if let Some(mut c) = cache.take() {
            c.drain(tiers);
        }
    }
}

impl Drop for ThreadCacheCell {
    /// The thread-exit destructor hook (spec.md §4.5 "Teardown"): if this thread
    /// ever touched the allocator, drain its cache back to the shared bins before
    /// the cell itself goes away. If the allocator was never initialized on this
    /// thread (`classes` absent) there is nothing to drain.
    fn drop(&mut self) {
        if let Some(classes) = crate::size_classes_if_initialized() {
            let tiers = Tiers {
                classes,
                bins: crate::bins(),
                megablocks: crate::megablocks(),
            };
            self.drain_and_clear(&tiers);
        }
    }
}
