//! Slot allocator: the free pool (§4.1).
//!
//! An intrusive doubly-linked list over a flat node array gives O(1)
//! acquire/return/reclaim without scanning, per the design notes (§9). The
//! list is FIFO: `acquire` removes the head (oldest-freed), `return` appends
//! at the tail. This yields LRU-for-reuse — a just-released slot survives
//! longest before being chosen for a new load.

use crate::key::SlotIndex;

const NIL: usize = usize::MAX;

struct Node {
  prev: usize,
  next: usize,
  /// `true` while this slot's node is linked into the free list.
  linked: bool,
}

/// FIFO pool of currently-unpinned slots, plus O(1) membership/removal.
pub(crate) struct FreePool {
  nodes: Box<[Node]>,
  head: usize,
  tail: usize,
}

impl FreePool {
  /// Creates a pool over `cache_slots` slots, all initially free (inserted
  /// in slot-index order).
  pub(crate) fn new(cache_slots: usize) -> Self {
    let mut nodes: Vec<Node> = Vec::with_capacity(cache_slots);

    for i in 0..cache_slots {
      nodes.push(Node {
        prev: i.checked_sub(1).unwrap_or(NIL),
        next: if i.strict_add(1) < cache_slots { i.strict_add(1) } else { NIL },
        linked: true,
      });
    }

    Self {
      nodes: nodes.into_boxed_slice(),
      head: if cache_slots == 0 { NIL } else { 0 },
      tail: if cache_slots == 0 { NIL } else { cache_slots.strict_sub(1) },
    }
  }

  /// Removes and returns the oldest free slot, or `None` if the pool is empty.
  pub(crate) fn acquire(&mut self) -> Option<SlotIndex> {
    if self.head == NIL {
      return None;
    }

    let slot: usize = self.head;
    self.unlink(slot);
    Some(SlotIndex::new(slot))
  }

  /// Appends `slot` to the tail of the free list.
  pub(crate) fn release(&mut self, slot: SlotIndex) {
    let index: usize = slot.get();
    debug_assert!(!self.nodes[index].linked, "slot released twice");

    self.nodes[index].prev = self.tail;
    self.nodes[index].next = NIL;
    self.nodes[index].linked = true;

    if self.tail == NIL {
      self.head = index;
    } else {
      self.nodes[self.tail].next = index;
    }

    self.tail = index;
  }

  /// Removes `slot` from the free list if present, returning whether it was
  /// found. Used to re-pin a `READY_FREE` slot (a HIT) without reloading.
  pub(crate) fn reclaim(&mut self, slot: SlotIndex) -> bool {
    let index: usize = slot.get();

    if !self.nodes[index].linked {
      return false;
    }

    self.unlink(index);
    true
  }

  fn unlink(&mut self, index: usize) {
    let prev: usize = self.nodes[index].prev;
    let next: usize = self.nodes[index].next;

    if prev == NIL {
      self.head = next;
    } else {
      self.nodes[prev].next = next;
    }

    if next == NIL {
      self.tail = prev;
    } else {
      self.nodes[next].prev = prev;
    }

    self.nodes[index].linked = false;
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn new_pool_yields_slots_in_index_order() {
    let mut pool: FreePool = FreePool::new(4);

    assert_eq!(pool.acquire().map(SlotIndex::get), Some(0));
    assert_eq!(pool.acquire().map(SlotIndex::get), Some(1));
    assert_eq!(pool.acquire().map(SlotIndex::get), Some(2));
    assert_eq!(pool.acquire().map(SlotIndex::get), Some(3));
    assert!(pool.acquire().is_none());
  }

  #[test]
  fn fifo_release_then_acquire_order() {
    let mut pool: FreePool = FreePool::new(3);
    while pool.acquire().is_some() {}

    pool.release(SlotIndex::new(2));
    pool.release(SlotIndex::new(0));
    pool.release(SlotIndex::new(1));

    assert_eq!(pool.acquire().map(SlotIndex::get), Some(2));
    assert_eq!(pool.acquire().map(SlotIndex::get), Some(0));
    assert_eq!(pool.acquire().map(SlotIndex::get), Some(1));
  }

  #[test]
  fn reclaim_removes_from_middle() {
    let mut pool: FreePool = FreePool::new(3);
    while pool.acquire().is_some() {}

    pool.release(SlotIndex::new(0));
    pool.release(SlotIndex::new(1));
    pool.release(SlotIndex::new(2));

    assert!(pool.reclaim(SlotIndex::new(1)));
    assert!(!pool.reclaim(SlotIndex::new(1)), "double reclaim must fail");

    assert_eq!(pool.acquire().map(SlotIndex::get), Some(0));
    assert_eq!(pool.acquire().map(SlotIndex::get), Some(2));
    assert!(pool.acquire().is_none());
  }

  #[test]
  fn reclaim_missing_slot_returns_false() {
    let mut pool: FreePool = FreePool::new(4);
    let slot: SlotIndex = pool.acquire().unwrap();
    assert!(!pool.reclaim(slot), "pinned slot is not in the free list");
  }
}
