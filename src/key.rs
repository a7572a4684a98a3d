//! Grouped-key and remap-index types.
//!
//! Caller-facing keys (§4.3) are raw row indices in `[0, node_count)`.
//! Internally, the cache only ever stores and pins *grouped* keys — the
//! multiple of `group_size` that a raw key rounds down to. `GroupKey` keeps
//! that distinction visible in the type system instead of passing bare
//! `usize`s between the table and the load engine.

use core::fmt::Debug;
use core::fmt::Formatter;
use core::fmt::Result;

/// A grouped key: an index into the key table, always a multiple of
/// `group_size` in raw-key terms.
#[derive(Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
#[repr(transparent)]
pub(crate) struct GroupKey(usize);

impl GroupKey {
  #[inline]
  pub(crate) const fn new(index: usize) -> Self {
    Self(index)
  }

  #[inline]
  pub(crate) const fn get(self) -> usize {
    self.0
  }
}

impl Debug for GroupKey {
  fn fmt(&self, f: &mut Formatter<'_>) -> Result {
    Debug::fmt(&self.0, f)
  }
}

/// A physical slot index into the cache buffer.
#[derive(Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
#[repr(transparent)]
pub(crate) struct SlotIndex(usize);

impl SlotIndex {
  #[inline]
  pub(crate) const fn new(index: usize) -> Self {
    Self(index)
  }

  #[inline]
  pub(crate) const fn get(self) -> usize {
    self.0
  }
}

impl Debug for SlotIndex {
  fn fmt(&self, f: &mut Formatter<'_>) -> Result {
    Debug::fmt(&self.0, f)
  }
}
