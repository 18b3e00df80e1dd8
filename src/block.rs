//! A [`Block`] is a `BLOCK_SIZE`-aligned, `BLOCK_SIZE`-sized region dedicated to one
//! size class. Its header lives at the aligned base; everything past the header is
//! carved into nodes of that class's size.
//!
//! The one hot-path fact the rest of the allocator needs from a block is: *given an
//! interior pointer, recover the header, and from it the size-class index.* That
//! recovery (`header_of`) and the carving discipline are the only unsafe pointer
//! arithmetic in this module; everything above it is expressed in terms of safe
//! `NonNull` handles.

use std::ptr::NonNull;
use std::sync::Mutex;

use crate::node::{Bunch, Node, NodeList};
use crate::size_class::BLOCK_SIZE;

/// Per-block header. The stable fields every hot-path read depends on are
/// `size_index` and `megablock`. The remaining fields back an experimental
/// high-address return path (spec open question (i)): they are fully wired up
/// (lock, free lists, markers, counters) but `update_threshold_*`/`flush_high_path`
/// are deliberately empty, so in the current build this tier never receives a push
/// and never serves a pop. The field layout is kept so a future implementation can
/// activate the path without an ABI change.
pub struct BlockHeader {
    pub size_index: u8,
    /// Opaque handle into the owning megablock's block array; used only to recover
    /// the owning megablock for block-table bookkeeping, never on the node hot path.
    pub megablock_id: usize,

    // --- high-address return path (inert, see module docs) ---
    high_lock: Mutex<()>,
    high_nodes: NodeList,
    high_markers: [*mut Node; 2],
    high_bunches: *mut Bunch,
    high_num_bunches: usize,
}

impl BlockHeader {
    fn new(size_index: u8, megablock_id: usize) -> Self {
        BlockHeader {
            size_index,
            megablock_id,
            high_lock: Mutex::new(()),
            high_nodes: NodeList::new(),
            high_markers: [std::ptr::null_mut(); 2],
            high_bunches: std::ptr::null_mut(),
            high_num_bunches: 0,
        }
    }
}

/// No-ops by design (spec open question (i)): the high-address path is scaffolded
/// but never activated in this build.
#[inline]
pub fn update_threshold_for_bunches(_si: usize, _bunches: usize) {}
#[inline]
pub fn update_threshold_for_block(_si: usize, _block: NonNull<BlockHeader>, _add: bool) {}
#[inline]
pub fn flush_high_path(_block: NonNull<BlockHeader>) {
    // Touch the fields so they're not flagged dead by a future refactor that starts
    // reading them; this function intentionally does no work otherwise.
    let _guard = unsafe { (*_block.as_ptr()).high_lock.lock() };
}

/// Given any interior address of a block, recover its header.
///
/// # Safety
/// `ptr` must point somewhere inside a block previously carved by this crate.
#[inline]
pub unsafe fn header_of(ptr: *mut u8) -> NonNull<BlockHeader> {
    let addr = ptr as usize & !(BLOCK_SIZE - 1);
    NonNull::new_unchecked(addr as *mut BlockHeader)
}

/// Initialize the header at `base` (which must be `BLOCK_SIZE`-aligned and backed by
/// at least `BLOCK_SIZE` bytes of writable memory) and carve the remainder into
/// nodes of `size`, pushing each onto `sink`.
///
/// Carving discipline (spec.md §4.2): start past the header, round the offset up to
/// the largest divisor in {8, 16, 64} that also divides `size` (so 64-byte-multiple
/// classes get 64-byte-aligned nodes), and skip any offset that lands exactly on a
/// page boundary so every node stays page-interior.
///
/// # Safety
/// `base` must be the sole owner of a fresh `BLOCK_SIZE`-aligned region; this
/// function writes the header into it and must not be called twice on the same
/// region without an intervening reset.
pub unsafe fn init_and_carve(
    base: NonNull<u8>,
    size_index: u8,
    size: usize,
    megablock_id: usize,
    page_size: usize,
    mut sink: impl FnMut(NonNull<Node>),
) {
    let header_ptr = base.as_ptr() as *mut BlockHeader;
    header_ptr.write(BlockHeader::new(size_index, megablock_id));

    let mut offset = std::mem::size_of::<BlockHeader>();
    for divisor in [8usize, 16, 64] {
        if size % divisor == 0 {
            offset = round_up(offset, divisor);
        }
    }

    let end = BLOCK_SIZE - size;
    while offset <= end {
        if offset % page_size != 0 {
            let node_ptr = base.as_ptr().add(offset) as *mut Node;
            sink(NonNull::new_unchecked(node_ptr));
        }
        offset += size;
    }
}

#[inline]
fn round_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::size_class::SizeClasses;

    #[test]
    fn header_recovery_masks_to_block_base() {
        let layout = std::alloc::Layout::from_size_align(BLOCK_SIZE * 2, BLOCK_SIZE).unwrap();
        let raw = unsafe { std::alloc::alloc(layout) };
        assert!(!raw.is_null());
        let base = (raw as usize + BLOCK_SIZE - 1) & !(BLOCK_SIZE - 1);
        let base = NonNull::new(base as *mut u8).unwrap();

        unsafe {
            init_and_carve(base, 3, 64, 0, 4096, |_| {});
        }
        let interior = unsafe { base.as_ptr().add(12345) };
        let header = unsafe { header_of(interior) };
        assert_eq!(header.as_ptr() as usize, base.as_ptr() as usize);
        assert_eq!(unsafe { (*header.as_ptr()).size_index }, 3);

        unsafe { std::alloc::dealloc(raw, layout) };
    }

    #[test]
    fn carving_produces_aligned_nonoverlapping_nodes() {
        let classes = SizeClasses::build();
        let si = classes.class_of(96);
        let size = SizeClasses::size_of_class(si);

        let layout = std::alloc::Layout::from_size_align(BLOCK_SIZE * 2, BLOCK_SIZE).unwrap();
        let raw = unsafe { std::alloc::alloc(layout) };
        let base = (raw as usize + BLOCK_SIZE - 1) & !(BLOCK_SIZE - 1);
        let base = NonNull::new(base as *mut u8).unwrap();

        let mut addrs = Vec::new();
        unsafe {
            init_and_carve(base, si as u8, size, 0, 4096, |n| addrs.push(n.as_ptr() as usize));
        }

        assert!(!addrs.is_empty());
        for w in addrs.windows(2) {
            assert!(w[1] >= w[0] + size);
        }
        if size % 64 == 0 {
            for &a in &addrs {
                assert_eq!(a % 64, 0);
            }
        }
        for &a in &addrs {
            assert_ne!(a % 4096, 0, "node must not start exactly on a page boundary");
        }

        unsafe { std::alloc::dealloc(raw, layout) };
    }
}
