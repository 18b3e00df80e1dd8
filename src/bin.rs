//! The per-size-class shared bin: a free-node list and a free-bunch list, each
//! independently locked so node traffic and bunch traffic never contend with each
//! other (spec.md §5). This is the `GENERIC_ALLOCATE`/`GENERIC_DEALLOCATE` macro
//! idea from the reference, made concrete as two methods.

use std::ptr::NonNull;
use std::sync::Mutex;

use crate::megablock::GlobalMegablockManager;
use crate::node::{Bunch, Node, NodeList};
use crate::size_class::SizeClasses;

struct NodeTier {
    list: NodeList,
    markers: [*mut Node; 2],
}

impl NodeTier {
    const fn new() -> Self {
        NodeTier {
            list: NodeList::new(),
            markers: [std::ptr::null_mut(); 2],
        }
    }
}

struct BunchTier {
    head: *mut Bunch,
    count: usize,
}

impl BunchTier {
    const fn new() -> Self {
        BunchTier {
            head: std::ptr::null_mut(),
            count: 0,
        }
    }
}

/// Deliberately two separate `Mutex`es rather than one guarding a combined struct:
/// the reference pads them onto separate cache lines (`char padding1[48]` /
/// `padding2[56]`) specifically so node and bunch traffic don't false-share, and
/// splitting the lock in two is the natural Rust way to let them also not
/// contend.
pub struct Bin {
    free_node: Mutex<NodeTier>,
    free_bunch: Mutex<BunchTier>,
}

// `NodeTier`/`BunchTier` hold raw free-list pointers, so neither is `Send` by
// default. Both are only ever touched through `Bin`'s own `Mutex`es, which is
// exactly the invariant `Sync` is meant to assert, so we assert it directly at
// the `Bin` level rather than threading `unsafe impl` through the two private
// tier types.
unsafe impl Send for Bin {}
unsafe impl Sync for Bin {}

impl Bin {
    pub const fn new() -> Self {
        Bin {
            free_node: Mutex::new(NodeTier::new()),
            free_bunch: Mutex::new(BunchTier::new()),
        }
    }

    /// Pop a node, splitting a bunch into nodes if the node list is empty, and
    /// growing the megablock/block backing store if both tiers are empty.
    pub fn allocate_node(&self, si: usize, classes: &SizeClasses, megablocks: &GlobalMegablockManager) -> NonNull<Node> {
        loop {
            {
                let mut node_tier = self.free_node.lock().unwrap();
                if let Some(n) = node_tier.list.pop() {
                    return n;
                }
            }
            {
                let mut bunch_tier = self.free_bunch.lock().unwrap();
                if let Some(bunch) = NonNull::new(bunch_tier.head) {
                    bunch_tier.head = unsafe { bunch.as_ref().next_bunch };
                    bunch_tier.count -= 1;
                    drop(bunch_tier);

                    let bunch_count = classes.bunch_count(si);
                    let head_node = unsafe { Node::from_bunch(bunch) };
                    let tail = unsafe { head_node.as_ref().next };

                    let mut node_tier = self.free_node.lock().unwrap();
                    node_tier.list.head = tail;
                    node_tier.list.count = bunch_count - 1;
                    return head_node;
                }
            }
            megablocks.allocate_block(si, classes, self);
            // Loop again: the freshly carved block just pushed nodes onto this bin.
        }
    }

    /// Push a node back. The marker index is derived from the count *before*
    /// this push (matching `GENERIC_DEALLOCATE`, which computes it ahead of
    /// `num_nodes++`); a detach only fires once that pre-push index has already
    /// saturated to 2, i.e. one push later than a naive post-push count check
    /// would trigger. Detach: pull the bunch at `markers[0]`, rotate the
    /// markers, hand the bunch to the free-bunch tier. Also the call the
    /// megablock manager uses to seed a bin with every node carved from a fresh
    /// block (spec.md §5: block carving "pushes nodes via `deallocate_node`
    /// under `free_node_lock`").
    pub fn deallocate_node(&self, node: NonNull<Node>, si: usize, classes: &SizeClasses) {
        let mut node_tier = self.free_node.lock().unwrap();
        let idx = self.push_node_locked(&mut node_tier, node, si, classes);
        if idx != 2 {
            return;
        }
        let bunch_count = classes.bunch_count(si);
        node_tier.list.count -= bunch_count;
        let bunch_ptr = node_tier.markers[0];
        node_tier.markers[0] = node_tier.markers[1];
        node_tier.markers[1] = node.as_ptr();
        drop(node_tier);

        let bunch = unsafe { Bunch::from_node(NonNull::new_unchecked(bunch_ptr)) };
        let mut bunch_tier = self.free_bunch.lock().unwrap();
        unsafe {
            (*bunch.as_ptr()).next_bunch = bunch_tier.head;
        }
        bunch_tier.head = bunch.as_ptr();
        bunch_tier.count += 1;
    }

    pub fn allocate_bunch(&self, si: usize, classes: &SizeClasses, megablocks: &GlobalMegablockManager) -> NonNull<Bunch> {
        loop {
            {
                let mut bunch_tier = self.free_bunch.lock().unwrap();
                if let Some(bunch) = NonNull::new(bunch_tier.head) {
                    bunch_tier.head = unsafe { bunch.as_ref().next_bunch };
                    bunch_tier.count -= 1;
                    return bunch;
                }
            }
            megablocks.allocate_block(si, classes, self);
        }
    }

    pub fn deallocate_bunch(&self, bunch: NonNull<Bunch>) {
        let mut bunch_tier = self.free_bunch.lock().unwrap();
        unsafe {
            (*bunch.as_ptr()).next_bunch = bunch_tier.head;
        }
        bunch_tier.head = bunch.as_ptr();
        bunch_tier.count += 1;
    }

    /// Returns the marker index computed from the pre-push count, so callers can
    /// decide whether this push also triggers a bunch detach without recomputing it
    /// against the now-stale post-push count.
    fn push_node_locked(&self, tier: &mut NodeTier, node: NonNull<Node>, si: usize, classes: &SizeClasses) -> usize {
        let idx = classes.marker_index(si, tier.list.count);
        if idx < 2 {
            tier.markers[idx] = node.as_ptr();
        }
        tier.list.push(node);
        idx
    }

    /// Clear both free-lists back to empty. Called only from `deinitialize()`,
    /// after every megablock backing this bin's nodes has already been released
    /// to the provider — once that's done, the bin must not hand out nodes that
    /// point into unmapped memory.
    pub fn reset(&self) {
        *self.free_node.lock().unwrap() = NodeTier::new();
        *self.free_bunch.lock().unwrap() = BunchTier::new();
    }

    #[cfg(test)]
    pub fn node_count(&self) -> usize {
        self.free_node.lock().unwrap().list.count
    }

    #[cfg(test)]
    pub fn bunch_count_current(&self) -> usize {
        self.free_bunch.lock().unwrap().count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::megablock::GlobalMegablockManager;
    use crate::size_class::SizeClasses;

    #[test]
    fn allocate_then_deallocate_round_trips() {
        let classes = SizeClasses::build();
        let bin = Bin::new();
        let manager = GlobalMegablockManager::new();
        let si = classes.class_of(64);

        let node = bin.allocate_node(si, &classes, &manager);
        bin.deallocate_node(node, si, &classes);
        assert!(bin.node_count() >= 1);
    }

    #[test]
    fn deallocate_overflow_forms_a_bunch() {
        let classes = SizeClasses::build();
        let bin = Bin::new();
        let manager = GlobalMegablockManager::new();
        let si = classes.class_of(64);
        let bunch_count = classes.bunch_count(si);

        let mut nodes = Vec::new();
        for _ in 0..(2 * bunch_count + 1) {
            nodes.push(bin.allocate_node(si, &classes, &manager));
        }
        for n in nodes {
            bin.deallocate_node(n, si, &classes);
        }
        assert!(bin.bunch_count_current() >= 1);
    }
}
