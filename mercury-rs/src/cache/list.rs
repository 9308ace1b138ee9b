//! Provides the eviction order of all cache entries.
//!
//! The list is a doubly linked chain which is stored in an arena of nodes and uses plain indices
//! instead of pointers. Slot 0 and 1 are sentinels marking the head (most recently promoted) and
//! the tail (least recently promoted) and are never handed out. Freed slots are recycled.
//!
//! Each entry records the slot it occupies, so that it can be moved or unlinked in constant time.
//! The list is owned by the cache worker and is therefore not synchronized at all.
use crate::cache::entry::{CacheEntry, NOT_LINKED};
use std::sync::Arc;

const HEAD: usize = 0;
const TAIL: usize = 1;

struct Node {
    entry: Option<Arc<CacheEntry>>,
    prev: usize,
    next: usize,
}

/// Keeps all tracked entries ordered by their last promotion.
pub struct EvictionList {
    nodes: Vec<Node>,
    free: Vec<usize>,
    len: usize,
}

impl Default for EvictionList {
    fn default() -> Self {
        EvictionList::new()
    }
}

impl EvictionList {
    /// Creates an empty list which only consists of its sentinels.
    pub fn new() -> Self {
        EvictionList {
            nodes: vec![
                Node {
                    entry: None,
                    prev: HEAD,
                    next: TAIL,
                },
                Node {
                    entry: None,
                    prev: HEAD,
                    next: TAIL,
                },
            ],
            free: Vec::new(),
            len: 0,
        }
    }

    /// Returns the number of linked entries.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Determines if no entry is linked.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Determines if the given entry is linked into this list.
    pub fn contains(&self, entry: &Arc<CacheEntry>) -> bool {
        self.slot_of(entry).is_some()
    }

    fn slot_of(&self, entry: &Arc<CacheEntry>) -> Option<usize> {
        if !entry.is_linked() {
            return None;
        }

        let slot = entry.slot();
        if slot <= TAIL {
            return None;
        }

        match self.nodes.get(slot).and_then(|node| node.entry.as_ref()) {
            Some(linked) if Arc::ptr_eq(linked, entry) => Some(slot),
            _ => None,
        }
    }

    /// Moves the given entry to the head of the list, linking it if necessary.
    pub fn push_to_front(&mut self, entry: &Arc<CacheEntry>) {
        let slot = match self.slot_of(entry) {
            Some(slot) => {
                self.unlink(slot);
                slot
            }
            None => {
                let slot = self.allocate(entry.clone());
                entry.set_slot(slot);
                self.len += 1;
                slot
            }
        };

        let first = self.nodes[HEAD].next;
        self.nodes[slot].prev = HEAD;
        self.nodes[slot].next = first;
        self.nodes[first].prev = slot;
        self.nodes[HEAD].next = slot;
    }

    /// Unlinks the given entry. Returns **false** if it wasn't linked.
    pub fn remove(&mut self, entry: &Arc<CacheEntry>) -> bool {
        match self.slot_of(entry) {
            Some(slot) => {
                self.unlink(slot);
                self.nodes[slot].entry = None;
                self.free.push(slot);
                entry.set_slot(NOT_LINKED);
                self.len -= 1;
                true
            }
            None => false,
        }
    }

    /// Returns the least recently promoted entry.
    pub fn back(&self) -> Option<&Arc<CacheEntry>> {
        self.nodes[self.nodes[TAIL].prev].entry.as_ref()
    }

    /// Iterates from the most recently promoted entry to the least recently promoted one.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<CacheEntry>> + '_ {
        let mut current = self.nodes[HEAD].next;
        std::iter::from_fn(move || {
            let node = &self.nodes[current];
            let entry = node.entry.as_ref()?;
            current = node.next;
            Some(entry)
        })
    }

    fn allocate(&mut self, entry: Arc<CacheEntry>) -> usize {
        let node = Node {
            entry: Some(entry),
            prev: HEAD,
            next: TAIL,
        };

        if let Some(slot) = self.free.pop() {
            self.nodes[slot] = node;
            slot
        } else {
            self.nodes.push(node);
            self.nodes.len() - 1
        }
    }

    fn unlink(&mut self, slot: usize) {
        let prev = self.nodes[slot].prev;
        let next = self.nodes[slot].next;
        self.nodes[prev].next = next;
        self.nodes[next].prev = prev;
    }
}
