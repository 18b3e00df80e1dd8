//! The megablock manager: reserves large page-aligned regions from the
//! address-space provider and carves them into `BLOCK_SIZE` blocks on demand.
//!
//! The reference keeps the megablock list as a hand-rolled doubly-linked,
//! address-sorted list of raw pointers (spec.md §3, "Megablock list invariant").
//! Here it is realized as a single `Mutex`-guarded, address-sorted `Vec<MegaBlock>`
//! owned by one `MegablockManager` value (see DESIGN.md and SPEC_FULL.md §4.3):
//! same ordering invariant, same single-lock serialization, but the arena is
//! memory-safe to manage at this level — only the carved block memory inside it is
//! raw, and that unsafety is isolated to `block::init_and_carve`/`block::header_of`.

use std::ptr::NonNull;
use std::sync::Mutex;

use crate::addr_space;
use crate::bin::Bin;
use crate::block;
use crate::error::fatal;
use crate::size_class::{SizeClasses, BLOCK_SIZE};

const MIN_BLOCKS_PER_MEGABLOCK: usize = 32;
const STEP_BLOCKS_PER_MEGABLOCK: usize = 32;
const MAX_BLOCKS_PER_MEGABLOCK: usize = 512;

/// One reservation from the address-space provider, carved into `num_blocks`
/// `BLOCK_SIZE`-aligned blocks. `-1` in `block_size_index` marks an unclaimed block.
pub struct MegaBlock {
    actual_start: NonNull<u8>,
    actual_pages: usize,
    aligned_start: usize,
    num_blocks: usize,
    block_size_index: Vec<i8>,
    unused_blocks: usize,
}

impl MegaBlock {
    fn block_addr(&self, bi: usize) -> usize {
        self.aligned_start + bi * BLOCK_SIZE
    }
}

/// Owns every megablock ever reserved. Blocks are never returned to this manager
/// during steady state (spec open question (iii), a known limitation, not a bug) —
/// only `deinitialize()` gives memory back to the OS, by releasing whole
/// megablocks.
pub struct MegablockManager {
    // Sorted ascending by `aligned_start`, matching the reference's address-sorted
    // linked list (spec.md §3 "Megablock list invariant" and §8 property 7).
    megablocks: Vec<MegaBlock>,
}

impl MegablockManager {
    pub const fn new() -> Self {
        MegablockManager {
            megablocks: Vec::new(),
        }
    }

    pub fn num_megablocks(&self) -> usize {
        self.megablocks.len()
    }

    /// Strictly-increasing `aligned_start` addresses, for invariant checking.
    #[cfg(test)]
    pub fn is_sorted(&self) -> bool {
        self.megablocks
            .windows(2)
            .all(|w| w[0].aligned_start < w[1].aligned_start)
    }

    /// Reserve a new megablock, sized by the growth triple
    /// `(MIN, STEP, MAX)` (spec.md §4.3). On provider exhaustion, retry with a
    /// halved block count down toward `MIN`; if `MIN` itself fails, this is fatal.
    ///
    /// Reproduces the reference's quirk faithfully (spec open question (ii)): if a
    /// retry at a reduced size succeeds, that reduced size is kept permanently for
    /// this megablock — there is no second attempt at the original target size.
    fn add_megablock(&mut self) {
        let mut num_blocks =
            MIN_BLOCKS_PER_MEGABLOCK + self.megablocks.len() * STEP_BLOCKS_PER_MEGABLOCK;
        if num_blocks > MAX_BLOCKS_PER_MEGABLOCK {
            num_blocks = MAX_BLOCKS_PER_MEGABLOCK;
        }

        let page_size = addr_space::page_size();
        let pages_per_block = BLOCK_SIZE / page_size;

        let mut pages = pages_per_block * num_blocks + (pages_per_block - 1);
        let mut reservation = addr_space::allocate_page_block(pages);

        while reservation.is_none() && num_blocks != MIN_BLOCKS_PER_MEGABLOCK {
            log::warn!(
                "threadheap: unable to reserve megablock with {} blocks ({} pages), retrying smaller",
                num_blocks,
                pages
            );
            num_blocks = (MIN_BLOCKS_PER_MEGABLOCK + num_blocks) / 2;
            pages = pages_per_block * num_blocks;
            reservation = addr_space::allocate_page_block(pages);
        }

        let actual_start = match reservation {
            Some(p) => p,
            None => fatal("threadheap: unable to reserve a megablock of any acceptable size"),
        };
        let actual_pages = pages;

        let addr = actual_start.as_ptr() as usize;
        let alignment = addr & (BLOCK_SIZE - 1);
        let aligned_start = if alignment == 0 {
            addr
        } else {
            addr + (BLOCK_SIZE - alignment)
        };

        log::debug!(
            "threadheap: reserved megablock with {} blocks at {:#x} (aligned {:#x})",
            num_blocks,
            addr,
            aligned_start
        );

        self.megablocks.push(MegaBlock {
            actual_start,
            actual_pages,
            aligned_start,
            num_blocks,
            block_size_index: vec![-1i8; num_blocks],
            unused_blocks: num_blocks,
        });
        self.megablocks
            .sort_by_key(|mb| mb.aligned_start);
    }

    /// Claim one unused block for size class `si`, carving it and pushing all of
    /// its nodes onto `bin`'s node list. Grows the megablock list if every existing
    /// megablock is full.
    pub fn allocate_block(&mut self, si: usize, classes: &SizeClasses, bin: &Bin) {
        let mb_index = match self.megablocks.iter().position(|mb| mb.unused_blocks > 0) {
            Some(i) => i,
            None => {
                self.add_megablock();
                self.megablocks
                    .iter()
                    .position(|mb| mb.unused_blocks > 0)
                    .expect("freshly reserved megablock must have unused blocks")
            }
        };

        let mb = &mut self.megablocks[mb_index];
        let bi = mb
            .block_size_index
            .iter()
            .position(|&x| x == -1)
            .expect("unused_blocks > 0 implies an unclaimed slot exists");
        mb.block_size_index[bi] = si as i8;
        mb.unused_blocks -= 1;
        let megablock_id = mb_index;
        let block_addr = mb.block_addr(bi);

        let size = SizeClasses::size_of_class(si);
        let page_size = addr_space::page_size();
        let base = unsafe { NonNull::new_unchecked(block_addr as *mut u8) };

        let mut nodes = Vec::new();
        unsafe {
            block::init_and_carve(base, si as u8, size, megablock_id, page_size, |n| {
                nodes.push(n)
            });
        }
        for node in nodes {
            bin.deallocate_node(node, si, classes);
        }
    }

    /// Release every reservation back to the address-space provider. Called only
    /// from `deinitialize()`.
    pub fn teardown(&mut self) {
        let page_size = addr_space::page_size();
        for mb in self.megablocks.drain(..) {
            let pages_per_block = BLOCK_SIZE / page_size;
            let _ = pages_per_block;
            unsafe {
                addr_space::deallocate_page_block(mb.actual_start, mb.actual_pages);
            }
        }
    }
}

unsafe impl Send for MegablockManager {}

pub struct GlobalMegablockManager {
    inner: Mutex<MegablockManager>,
}

impl GlobalMegablockManager {
    pub const fn new() -> Self {
        GlobalMegablockManager {
            inner: Mutex::new(MegablockManager::new()),
        }
    }

    pub fn allocate_block(&self, si: usize, classes: &SizeClasses, bin: &Bin) {
        let mut guard = self.inner.lock().unwrap();
        guard.allocate_block(si, classes, bin);
    }

    pub fn teardown(&self) {
        let mut guard = self.inner.lock().unwrap();
        guard.teardown();
    }

    #[cfg(test)]
    pub fn with_manager<R>(&self, f: impl FnOnce(&MegablockManager) -> R) -> R {
        let guard = self.inner.lock().unwrap();
        f(&guard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bin::Bin;
    use crate::size_class::SizeClasses;

    #[test]
    fn allocate_block_grows_and_stays_sorted() {
        let classes = SizeClasses::build();
        let manager = GlobalMegablockManager::new();
        let bin = Bin::new();

        for si in 0..3 {
            manager.allocate_block(si, &classes, &bin);
        }

        manager.with_manager(|m| {
            assert!(m.num_megablocks() >= 1);
            assert!(m.is_sorted());
        });
    }
}
