//! Device staging pipeline (§4.5): pinned host staging buffer, device
//! buffer, and the per-batch stream used to order H2D copies against
//! storage completions.
//!
//! The accelerator runtime itself is out of scope (§1) — this module is
//! written against an opaque stream + memcpy interface rather than any
//! concrete vendor API. [`HostCopyStream`] performs the copy synchronously
//! on the host, which is sufficient to exercise every sequencing invariant
//! this section specifies: validity is published before the copy is
//! enqueued, and the batch synchronizes the stream before returning.

use crate::array::AlignedBuffer;
use crate::error::Error;

/// An opaque per-batch stream: create, enqueue copies on it, synchronize,
/// destroy. Mirrors the shape of a CUDA/HIP stream without committing to
/// either.
pub(crate) trait Stream {
  /// Enqueues an async copy of `len` bytes from host offset `src_offset` to
  /// device offset `dst_offset`.
  fn enqueue_copy(&mut self, src: &AlignedBuffer, src_offset: usize, dst_offset: usize, len: usize);

  /// Blocks until every copy enqueued on this stream has completed.
  fn synchronize(&mut self);
}

/// Host-side reference implementation of [`Stream`]: copies happen
/// immediately rather than asynchronously. Correctness here is about
/// ordering (§4.5), not about transport, so a synchronous copy satisfies
/// every invariant the device variant documents.
pub(crate) struct HostCopyStream<'a> {
  device: &'a AlignedBuffer,
}

impl<'a> HostCopyStream<'a> {
  pub(crate) fn new(device: &'a AlignedBuffer) -> Self {
    Self { device }
  }
}

impl Stream for HostCopyStream<'_> {
  fn enqueue_copy(&mut self, src: &AlignedBuffer, src_offset: usize, dst_offset: usize, len: usize) {
    let source: &[u8] = &src.as_slice()[src_offset..src_offset.strict_add(len)];

    // SAFETY: `dst_offset` addresses a slot the table allocator has
    // exclusively assigned to this load; no other live reference overlaps
    // it (invariant 5).
    let dest: &mut [u8] = unsafe { self.device.slice_mut(dst_offset, len) };
    dest.copy_from_slice(source);
  }

  fn synchronize(&mut self) {
    // The reference copy above is already synchronous; nothing to wait for.
  }
}

/// Assigns deterministic host-staging indices for a batch's misses (§4.5).
///
/// `(t_id, t_total)` partitions the staging area so concurrent callers do
/// not contend for staging slots: each partition owns a disjoint
/// contiguous range of `stage_size / t_total` groups, and the `n`-th miss
/// observed in this batch takes the `n`-th slot within this caller's range.
pub(crate) struct StagingAllocator {
  base: usize,
  partition_len: usize,
  next: usize,
}

impl StagingAllocator {
  pub(crate) fn new(stage_size: usize, t_id: usize, t_total: usize) -> Self {
    let partition_len: usize = stage_size.checked_div(t_total.max(1)).unwrap_or(0);
    let base: usize = partition_len.strict_mul(t_id);
    Self { base, partition_len, next: 0 }
  }

  /// Assigns the next staging slot for this batch's sequence of misses.
  ///
  /// # Errors
  ///
  /// Returns [`Error::StagingExhausted`] if this partition has no room
  /// left, matching the host-index-out-of-range failure in §4.5.
  pub(crate) fn assign(&mut self, stage_size: usize, t_id: usize, t_total: usize) -> Result<usize, Error> {
    if self.next >= self.partition_len {
      return Err(Error::StagingExhausted { stage_size, t_id, t_total });
    }

    let index: usize = self.base.strict_add(self.next);
    self.next = self.next.strict_add(1);

    if index >= stage_size {
      return Err(Error::StagingExhausted { stage_size, t_id, t_total });
    }

    Ok(index)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn partitions_are_disjoint() {
    let mut a: StagingAllocator = StagingAllocator::new(8, 0, 2);
    let mut b: StagingAllocator = StagingAllocator::new(8, 1, 2);

    assert_eq!(a.assign(8, 0, 2).unwrap(), 0);
    assert_eq!(a.assign(8, 0, 2).unwrap(), 1);
    assert_eq!(b.assign(8, 1, 2).unwrap(), 4);
    assert_eq!(b.assign(8, 1, 2).unwrap(), 5);
  }

  #[test]
  fn exhaustion_within_partition() {
    let mut a: StagingAllocator = StagingAllocator::new(4, 0, 2);
    assert!(a.assign(4, 0, 2).is_ok());
    let err: Error = a.assign(4, 0, 2).unwrap_err();
    assert!(matches!(err, Error::StagingExhausted { .. }));
  }

  #[test]
  fn single_partition_covers_whole_area() {
    let mut a: StagingAllocator = StagingAllocator::new(4, 0, 1);
    assert_eq!(a.assign(4, 0, 1).unwrap(), 0);
    assert_eq!(a.assign(4, 0, 1).unwrap(), 1);
    assert_eq!(a.assign(4, 0, 1).unwrap(), 2);
    assert_eq!(a.assign(4, 0, 1).unwrap(), 3);
    assert!(a.assign(4, 0, 1).is_err());
  }
}
