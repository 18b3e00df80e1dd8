//! The two free-list element shapes: [`Node`] (a single free allocation unit) and
//! [`Bunch`] (a node whose second machine word doubles as a `next_bunch` pointer).
//!
//! While a node is free, its storage is owned by whichever free-list it sits on;
//! the moment it is handed back to a caller, the allocator never touches that
//! memory again until the caller deallocates it. These two invariants are what let
//! us treat raw bytes as these structs without any initialization: the struct is
//! only ever read right after being unlinked from a list, and only ever written
//! right before being linked onto one.

use std::ptr::NonNull;

/// The smallest allocable unit for a given size class. Only its first machine word
/// is meaningful while free; the rest is unspecified (it will usually be leftover
/// user data from the allocation's previous life).
#[repr(C)]
pub struct Node {
    pub next: *mut Node,
}

/// A node currently at the head of a chain of `bunch_count` free nodes, viewed as a
/// bunch. `next` (inherited via the matching field layout) chains the nodes *within*
/// the bunch; `next_bunch` chains bunches to each other. Because `Bunch`'s first
/// field has the same offset and type as `Node::next`, a `*mut Node` that happens to
/// be a bunch head can be reinterpreted as `*mut Bunch` and back with a plain cast.
#[repr(C)]
pub struct Bunch {
    pub next: *mut Node,
    pub next_bunch: *mut Bunch,
}

impl Bunch {
    #[inline]
    pub unsafe fn from_node(node: NonNull<Node>) -> NonNull<Bunch> {
        node.cast()
    }
}

impl Node {
    #[inline]
    pub unsafe fn from_bunch(bunch: NonNull<Bunch>) -> NonNull<Node> {
        bunch.cast()
    }
}

/// A plain singly-linked free-list of [`Node`]s with an explicit count, shared by
/// the per-thread cache and the bin's node tier (the only difference between the two
/// is synchronization, which lives one level up).
pub struct NodeList {
    pub head: *mut Node,
    pub count: usize,
}

impl NodeList {
    pub const fn new() -> Self {
        NodeList {
            head: std::ptr::null_mut(),
            count: 0,
        }
    }

    #[inline]
    pub fn pop(&mut self) -> Option<NonNull<Node>> {
        let head = NonNull::new(self.head)?;
        unsafe {
            self.head = head.as_ref().next;
        }
        self.count -= 1;
        Some(head)
    }

    #[inline]
    pub fn push(&mut self, node: NonNull<Node>) {
        unsafe {
            (*node.as_ptr()).next = self.head;
        }
        self.head = node.as_ptr();
        self.count += 1;
    }
}

impl Default for NodeList {
    fn default() -> Self {
        NodeList::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_pop_is_lifo() {
        let mut a = Node { next: std::ptr::null_mut() };
        let mut b = Node { next: std::ptr::null_mut() };
        let mut list = NodeList::new();
        list.push(NonNull::new(&mut a as *mut Node).unwrap());
        list.push(NonNull::new(&mut b as *mut Node).unwrap());
        assert_eq!(list.count, 2);
        let popped = list.pop().unwrap();
        assert_eq!(popped.as_ptr(), &mut b as *mut Node);
        assert_eq!(list.count, 1);
        let popped = list.pop().unwrap();
        assert_eq!(popped.as_ptr(), &mut a as *mut Node);
        assert_eq!(list.count, 0);
        assert!(list.pop().is_none());
    }

    #[test]
    fn bunch_node_cast_preserves_address() {
        let mut bunch = Bunch {
            next: std::ptr::null_mut(),
            next_bunch: std::ptr::null_mut(),
        };
        let ptr = NonNull::new(&mut bunch as *mut Bunch).unwrap();
        let as_node = unsafe { Node::from_bunch(ptr) };
        assert_eq!(as_node.as_ptr() as usize, ptr.as_ptr() as usize);
    }
}
