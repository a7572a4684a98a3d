//! Key table (§4.2) and per-batch classification.
//!
//! The table splits into two parts, matching the concurrency model in §5:
//!
//! - `state`: one [`AtomicU8`] per grouped key, encoding the `{Cold, Loading,
//!   Ready}` state machine (§4.7, collapsed — `READY_PINNED`/`READY_FREE` and
//!   `EVICTED`/`COLD` are the same `state` value; the distinction is carried
//!   by the pin count and free-pool membership instead). This is published
//!   *without* the update mutex by the completion path and read with
//!   acquire/spin-wait semantics by callers blocked on an in-flight key.
//! - `inner`: everything mutated only under the single update mutex —
//!   per-key slot assignment and pin count, the slot→key back-index, and the
//!   free pool.

use core::sync::atomic::AtomicU8;
use core::sync::atomic::Ordering;

use parking_lot::Mutex;
use parking_lot::MutexGuard;

use crate::config::CacheLayout;
use crate::error::Error;
use crate::freelist::FreePool;
use crate::key::GroupKey;
use crate::key::SlotIndex;

const SLOT_NONE: u32 = u32::MAX;
const KEY_NONE: i64 = -1;

#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum State {
  Cold = 0,
  Loading = 1,
  Ready = 2,
}

impl State {
  #[inline]
  fn from_u8(value: u8) -> Self {
    match value {
      0 => State::Cold,
      1 => State::Loading,
      _ => State::Ready,
    }
  }
}

#[derive(Clone, Copy)]
struct Entry {
  slot: u32,
  pin: u32,
}

impl Entry {
  const EMPTY: Self = Self { slot: SLOT_NONE, pin: 0 };
}

struct Inner {
  entries: Box<[Entry]>,
  back_index: Box<[i64]>,
  free: FreePool,
}

/// The outcome of classifying one caller key under the update mutex.
pub(crate) enum Classify {
  /// Slot already valid; no I/O needed.
  Hit { remap: i64 },
  /// Slot assigned and loading elsewhere (this batch or another thread);
  /// caller must wait for `group` to become `Ready`.
  InFlight { group: GroupKey, remap: i64 },
  /// A fresh slot was assigned; the caller must submit a read for `group`.
  Miss { group: GroupKey, slot: SlotIndex, remap: i64 },
}

/// The key table plus its free pool, guarded by one process-wide mutex.
pub(crate) struct KeyTable {
  state: Box<[AtomicU8]>,
  inner: Mutex<Inner>,
}

impl KeyTable {
  pub(crate) fn new(layout: &CacheLayout) -> Self {
    let state: Box<[AtomicU8]> = (0..layout.table_len).map(|_| AtomicU8::new(State::Cold as u8)).collect();

    let entries: Box<[Entry]> = vec![Entry::EMPTY; layout.table_len].into_boxed_slice();
    let back_index: Box<[i64]> = vec![KEY_NONE; layout.cache_slots].into_boxed_slice();
    let free: FreePool = FreePool::new(layout.cache_slots);

    Self {
      state,
      inner: Mutex::new(Inner { entries, back_index, free }),
    }
  }

  #[inline]
  fn read_state(&self, group: GroupKey) -> State {
    State::from_u8(self.state[group.get()].load(Ordering::Acquire))
  }

  /// Classifies and pins an entire batch of raw keys under one critical
  /// section (§2 step 1–2). On any failure partway through, every pin
  /// increment and slot acquisition made earlier in this call is rolled
  /// back before returning the error, so a failed batch never leaks a pin
  /// or a slot — see the pin-leak discussion in `DESIGN.md`.
  pub(crate) fn classify_batch(&self, raw_keys: &[i64], layout: &CacheLayout) -> Result<Vec<Classify>, Error> {
    let mut guard: MutexGuard<'_, Inner> = self.inner.lock();
    let mut out: Vec<Classify> = Vec::with_capacity(raw_keys.len());
    let mut touched: Vec<(GroupKey, bool)> = Vec::with_capacity(raw_keys.len());

    for &raw_key in raw_keys {
      match self.classify_one(&mut guard, raw_key, layout) {
        Ok((classification, group, fresh_miss)) => {
          touched.push((group, fresh_miss));
          out.push(classification);
        }
        Err(error) => {
          self.rollback(&mut guard, &touched);
          return Err(error);
        }
      }
    }

    Ok(out)
  }

  fn classify_one(
    &self,
    guard: &mut Inner,
    raw_key: i64,
    layout: &CacheLayout,
  ) -> Result<(Classify, GroupKey, bool), Error> {
    if raw_key < 0 || raw_key >= layout.node_count {
      return Err(Error::KeyOutOfRange {
        key: raw_key,
        node_count: layout.node_count,
      });
    }

    let (group_index, in_group_offset) = layout.group_of(raw_key);
    let group: GroupKey = GroupKey::new(group_index);

    match self.read_state(group) {
      State::Ready => {
        let entry: &mut Entry = &mut guard.entries[group.get()];
        let was_unpinned: bool = entry.pin == 0;
        entry.pin = entry.pin.strict_add(1);

        if was_unpinned {
          let reclaimed: bool = guard.free.reclaim(SlotIndex::new(entry.slot as usize));
          debug_assert!(reclaimed, "ready entry's slot must be in the free pool when unpinned");
        }

        let remap: i64 = layout.remap_index(entry.slot as usize, in_group_offset);
        Ok((Classify::Hit { remap }, group, false))
      }
      State::Loading => {
        let entry: &mut Entry = &mut guard.entries[group.get()];
        entry.pin = entry.pin.strict_add(1);
        let remap: i64 = layout.remap_index(entry.slot as usize, in_group_offset);
        Ok((Classify::InFlight { group, remap }, group, false))
      }
      State::Cold => {
        let slot: SlotIndex = guard.free.acquire().ok_or(Error::Exhausted {
          cache_slots: layout.cache_slots,
        })?;

        let previous_owner: i64 = guard.back_index[slot.get()];

        if previous_owner != KEY_NONE {
          // This slot's prior key is evicted: its data is about to be
          // overwritten (§4.1 `acquire`). `EVICTED` collapses to `Cold`.
          self.state[previous_owner as usize].store(State::Cold as u8, Ordering::Release);
          guard.entries[previous_owner as usize] = Entry::EMPTY;
        }

        guard.back_index[slot.get()] = group.get() as i64;
        guard.entries[group.get()] = Entry { slot: slot.get() as u32, pin: 1 };

        // Published last: readers must not observe `Loading` before the
        // slot assignment above is visible to them.
        self.state[group.get()].store(State::Loading as u8, Ordering::Release);

        let remap: i64 = layout.remap_index(slot.get(), in_group_offset);
        Ok((Classify::Miss { group, slot, remap }, group, true))
      }
    }
  }

  fn rollback(&self, guard: &mut Inner, touched: &[(GroupKey, bool)]) {
    for &(group, fresh_miss) in touched.iter().rev() {
      let entry: &mut Entry = &mut guard.entries[group.get()];
      debug_assert!(entry.pin > 0);
      entry.pin = entry.pin.strict_sub(1);

      if fresh_miss {
        // This pin was the slot's very first: undo the acquisition
        // entirely, no read was ever submitted for it.
        let slot: SlotIndex = SlotIndex::new(entry.slot as usize);
        guard.back_index[slot.get()] = KEY_NONE;
        *entry = Entry::EMPTY;
        self.state[group.get()].store(State::Cold as u8, Ordering::Release);
        guard.free.release(slot);
      } else if entry.pin == 0 {
        guard.free.release(SlotIndex::new(entry.slot as usize));
      }
    }
  }

  /// Marks `group` `Ready`, publishing the completed read (or, per the
  /// documented completion-error behavior, a failed one — see `DESIGN.md`)
  /// to any thread spin-waiting on it.
  pub(crate) fn mark_ready(&self, group: GroupKey) {
    self.state[group.get()].store(State::Ready as u8, Ordering::Release);
  }

  /// Spin-yields until `group` is no longer `Loading`.
  pub(crate) fn wait_ready(&self, group: GroupKey) {
    while self.read_state(group) == State::Loading {
      std::hint::spin_loop();
      std::thread::yield_now();
    }
  }

  /// Decrements pin counts for a batch of raw keys (`release`, §4.6).
  /// Slots reaching zero pins rejoin the free pool without being
  /// invalidated.
  pub(crate) fn release_batch(&self, raw_keys: &[i64], layout: &CacheLayout) {
    let mut guard: MutexGuard<'_, Inner> = self.inner.lock();

    for &raw_key in raw_keys {
      let (group_index, _) = layout.group_of(raw_key);
      let group: GroupKey = GroupKey::new(group_index);
      let entry: &mut Entry = &mut guard.entries[group.get()];

      // Over-release is a programmer error (§7 kind 6); saturating avoids
      // wrapping a `u32` into a bogus huge pin count instead of panicking
      // on a caller bug.
      entry.pin = entry.pin.saturating_sub(1);

      if entry.pin == 0 && entry.slot != SLOT_NONE {
        guard.free.release(SlotIndex::new(entry.slot as usize));
      }
    }
  }
}
