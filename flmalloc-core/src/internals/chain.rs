//! Bucket Chains and the Node store behind them.
//!
//! Sheets are wrapped in Nodes and referenced by index handles, never by raw pointer links. The Nodes themselves live
//! in slot segments carved out of the Arena's metadata Regions; when a segment fills up, the Arena maps another one,
//! twice as large. Slots are handed out append-only and never individually recycled; a Node unlinked from its chain
//! simply leaks its slot, bounded by the number of expansions ever performed.

use core::mem;
use core::ptr::{self, NonNull};

use crate::internals::sheet::Sheet;

/// Handle to a Node in the store.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct NodeIndex(u32);

/// A Sheet and its link to the next Node of the chain.
pub(crate) struct Node {
    pub(crate) sheet: Sheet,
    pub(crate) next: Option<NodeIndex>,
}

const MAX_SEGMENTS: usize = 16;

#[derive(Clone, Copy)]
struct Segment {
    base: *mut u8,
    mapped: usize,
    slots: u32,
}

/// Append-only slot storage for Nodes, over one or more mapped metadata segments.
pub(crate) struct NodeStore {
    segments: [Segment; MAX_SEGMENTS],
    number_segments: usize,
    len: u32,
    capacity: u32,
}

impl NodeStore {
    /// Creates a store over its first metadata segment.
    ///
    /// #   Safety
    ///
    /// -   Assumes `[base, base + mapped)` is mapped, writable, and exclusively owned by the store.
    pub(crate) unsafe fn new(base: NonNull<u8>, mapped: usize) -> NodeStore {
        let empty = Segment { base: ptr::null_mut(), mapped: 0, slots: 0 };

        let mut store = NodeStore {
            segments: [empty; MAX_SEGMENTS],
            number_segments: 0,
            len: 0,
            capacity: 0,
        };

        store.push_segment(base, mapped);

        store
    }

    /// Returns whether every slot is in use.
    pub(crate) fn is_full(&self) -> bool { self.len == self.capacity }

    /// Returns the size of the next metadata segment to map, doubling the last, or None if the segment table is
    /// exhausted.
    pub(crate) fn next_segment_len(&self) -> Option<usize> {
        if self.number_segments == MAX_SEGMENTS {
            return None;
        }

        Some(self.segments[self.number_segments - 1].mapped * 2)
    }

    /// Registers another metadata segment.
    ///
    /// #   Safety
    ///
    /// -   Assumes `[base, base + mapped)` is mapped, writable, and exclusively owned by the store.
    pub(crate) unsafe fn push_segment(&mut self, base: NonNull<u8>, mapped: usize) {
        assert!(self.number_segments < MAX_SEGMENTS, "Metadata segment table exhausted");

        let slots = (mapped / slot_size()) as u32;
        assert!(slots > 0, "Metadata segment too small for a single Node: {} bytes", mapped);

        self.segments[self.number_segments] = Segment { base: base.as_ptr(), mapped, slots };
        self.number_segments += 1;
        self.capacity += slots;
    }

    /// Moves `node` into a fresh slot; None if every slot is in use.
    pub(crate) fn allocate(&mut self, node: Node) -> Option<NodeIndex> {
        if self.is_full() {
            return None;
        }

        let index = NodeIndex(self.len);
        self.len += 1;

        //  Safety:
        //  -   The slot is within a mapped segment, suitably aligned, and was never handed out before.
        unsafe { ptr::write(self.slot(index), node) };

        Some(index)
    }

    /// Returns the Node behind `index`.
    pub(crate) fn get(&self, index: NodeIndex) -> &Node {
        //  Safety:
        //  -   The slot was initialized by `allocate`; slots are never reclaimed.
        unsafe { &*self.slot(index) }
    }

    /// Returns the Node behind `index`, mutably.
    pub(crate) fn get_mut(&mut self, index: NodeIndex) -> &mut Node {
        //  Safety:
        //  -   The slot was initialized by `allocate`; slots are never reclaimed.
        unsafe { &mut *self.slot(index) }
    }

    /// Returns the number of metadata segments.
    pub(crate) fn number_segments(&self) -> usize { self.number_segments }

    /// Returns the base and mapped length of segment `i`, for teardown.
    pub(crate) fn segment(&self, i: usize) -> (NonNull<u8>, usize) {
        assert!(i < self.number_segments);

        let segment = self.segments[i];

        //  Safety:
        //  -   Registered segments have non-null bases.
        (unsafe { NonNull::new_unchecked(segment.base) }, segment.mapped)
    }

    fn slot(&self, index: NodeIndex) -> *mut Node {
        let mut remaining = index.0;

        for segment in self.segments[..self.number_segments].iter() {
            if remaining < segment.slots {
                //  Safety:
                //  -   In bounds of the segment, as per the check.
                return unsafe { segment.base.add(remaining as usize * slot_size()) } as *mut Node;
            }

            remaining -= segment.slots;
        }

        panic!("Node index out of bounds: {:?}", index);
    }
}

fn slot_size() -> usize { mem::size_of::<Node>() }

/// An ordered sequence of Nodes; appended to, never reordered.
pub(crate) struct Chain {
    head: Option<NodeIndex>,
    tail: Option<NodeIndex>,
}

impl Chain {
    /// Creates an empty chain.
    pub(crate) const fn new() -> Chain { Chain { head: None, tail: None } }

    /// Returns the first Node of the chain.
    pub(crate) fn head(&self) -> Option<NodeIndex> { self.head }

    /// Returns the last Node of the chain.
    pub(crate) fn tail(&self) -> Option<NodeIndex> { self.tail }

    /// Returns whether the chain has no Node.
    pub(crate) fn is_empty(&self) -> bool { self.head.is_none() }

    /// Appends `index` at the tail.
    pub(crate) fn push_back(&mut self, store: &mut NodeStore, index: NodeIndex) {
        store.get_mut(index).next = None;

        match self.tail {
            Some(tail) => store.get_mut(tail).next = Some(index),
            None => self.head = Some(index),
        }

        self.tail = Some(index);
    }

    /// Unlinks `index`, whose predecessor is `previous` (None when `index` is the head).
    ///
    /// The Node's slot is not reclaimed; only the links change.
    pub(crate) fn unlink(&mut self, store: &mut NodeStore, previous: Option<NodeIndex>, index: NodeIndex) {
        let next = store.get(index).next;

        match previous {
            Some(previous) => {
                debug_assert_eq!(Some(index), store.get(previous).next);
                store.get_mut(previous).next = next;
            },
            None => {
                debug_assert_eq!(Some(index), self.head);
                self.head = next;
            },
        }

        if self.tail == Some(index) {
            self.tail = previous;
        }

        store.get_mut(index).next = None;
    }
}
