//! Construction parameters and derived layout.
//!
//! Mirrors the split the rest of this crate uses elsewhere between a small
//! user-supplied configuration and a larger set of values derived from it
//! once and reused for the cache's lifetime.

use core::fmt::Debug;
use core::fmt::Formatter;
use core::fmt::Result as FmtResult;
use std::path::Path;
use std::path::PathBuf;

use crate::error::Error;
use crate::error::Result;

/// Minimum alignment, in bytes, for direct-I/O reads against the backing file.
///
/// This is the classical 512-byte sector alignment used by `O_DIRECT` on
/// Linux. It governs the minimum block size and file offset granularity for
/// reads issued by the load engine.
pub const STORAGE_ALIGNMENT: usize = 512;

/// Alignment, in bytes, for host and device buffers.
///
/// Matches the common page size; buffers are allocated at this alignment so
/// that direct I/O can target them without an intermediate bounce buffer.
pub const BUFFER_ALIGNMENT: usize = 4096;

/// The element type stored in each row. Fixed at 32-bit float per the format
/// this cache serves.
pub const ELEMENT_BYTES: usize = size_of::<f32>();

/// Which cache variant to construct.
///
/// `Gds` is reserved for a future GPUDirect Storage backend and is accepted
/// at the configuration boundary but rejected with
/// [`Error::GdsUnimplemented`] at construction. `None` denotes a cache that
/// intentionally never opened a backing file; every operation on it returns
/// [`Error::NotInitialized`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheKind {
  /// Rows are cached in a plain host buffer and exposed directly.
  Cpu,
  /// Rows are staged in pinned host memory, then copied to a device buffer.
  Gpu,
  /// Reserved: GPUDirect Storage. Not implemented.
  Gds,
  /// The cache failed to open or was never configured; a guarded no-op.
  None,
}

/// Construction parameters for a [`FeatureCache`](crate::FeatureCache).
///
/// See the crate-level documentation for the relationship between these
/// fields and the derived [`CacheLayout`].
#[derive(Debug, Clone)]
pub struct CacheConfig {
  /// Path to the read-only, packed row file.
  pub filename: PathBuf,
  /// Number of rows (keys) in the backing file.
  pub node_count: i64,
  /// Number of `f32` elements per row.
  pub row_dim: usize,
  /// Cache capacity, in groups.
  pub buffer_size: usize,
  /// Which variant to build.
  pub kind: CacheKind,
  /// Accelerator device ordinal; only meaningful for [`CacheKind::Gpu`].
  pub device_id: i32,
  /// Pinned host staging capacity, in groups; only meaningful for [`CacheKind::Gpu`].
  pub stage_size: usize,
}

impl CacheConfig {
  /// Creates a host-variant (`cpu`) configuration.
  pub fn cpu(filename: impl AsRef<Path>, node_count: i64, row_dim: usize, buffer_size: usize) -> Self {
    Self {
      filename: filename.as_ref().to_path_buf(),
      node_count,
      row_dim,
      buffer_size,
      kind: CacheKind::Cpu,
      device_id: 0,
      stage_size: 0,
    }
  }

  /// Creates a device-variant (`gpu`) configuration.
  pub fn gpu(
    filename: impl AsRef<Path>,
    node_count: i64,
    row_dim: usize,
    buffer_size: usize,
    device_id: i32,
    stage_size: usize,
  ) -> Self {
    Self {
      filename: filename.as_ref().to_path_buf(),
      node_count,
      row_dim,
      buffer_size,
      kind: CacheKind::Gpu,
      device_id,
      stage_size,
    }
  }
}

/// Derived sizing quantities computed once from a [`CacheConfig`].
///
/// Values here are used throughout the cache; recomputing them per call
/// would be both wasteful and a source of drift if the arithmetic diverged
/// between call sites.
#[derive(Clone, Copy)]
pub struct CacheLayout {
  /// Bytes per row (`row_dim * sizeof(f32)`).
  pub row_bytes: usize,
  /// Bytes actually read per group (`max(row_bytes, STORAGE_ALIGNMENT)`, rounded
  /// up to a multiple of `STORAGE_ALIGNMENT`).
  pub read_bytes: usize,
  /// Byte distance between two consecutive slots in the buffer.
  ///
  /// Equal to `read_bytes`, not `group_size * row_bytes`: when `row_bytes`
  /// does not evenly divide `STORAGE_ALIGNMENT`, a direct-I/O read for one
  /// group is longer than the group's `group_size` rows actually occupy.
  /// Reserving the full `read_bytes` per slot keeps every read inside its
  /// own slot's region instead of overwriting the next slot's live data —
  /// the reference implementation this crate is modeled on packs slots at
  /// `group_size * row_bytes` and accepts that overrun; this crate does not.
  pub slot_stride: usize,
  /// Number of consecutive keys collapsed into one aligned read group.
  pub group_size: usize,
  /// Size of the key space, as configured (`config.node_count`).
  ///
  /// Kept separately from `table_len * group_size`: when `node_count` is
  /// not a multiple of `group_size`, that product overshoots `node_count`,
  /// and range checks against it would wrongly accept keys in
  /// `[node_count, table_len * group_size)`.
  pub node_count: i64,
  /// Number of grouped key-table entries (`ceil(node_count / group_size)`).
  pub table_len: usize,
  /// Number of physical slots in the cache buffer.
  pub cache_slots: usize,
  /// Total byte size of the primary (host or device) buffer.
  pub buffer_bytes: usize,
  /// Total byte size of the pinned host staging buffer (device variant only).
  pub staging_bytes: usize,
}

impl CacheLayout {
  /// Validates `config` and derives layout constants from it.
  ///
  /// # Errors
  ///
  /// Returns [`Error::InvalidConfig`] if `row_dim`, `buffer_size`, or (for
  /// the device variant) `stage_size` is zero, or if `node_count` is
  /// negative.
  pub fn derive(config: &CacheConfig) -> Result<Self> {
    if config.row_dim == 0 {
      return Err(Error::InvalidConfig {
        reason: "row_dim must be nonzero",
      });
    }

    if config.node_count < 0 {
      return Err(Error::InvalidConfig {
        reason: "node_count must be nonnegative",
      });
    }

    if config.buffer_size == 0 {
      return Err(Error::InvalidConfig {
        reason: "buffer_size must be nonzero",
      });
    }

    if matches!(config.kind, CacheKind::Gpu) && config.stage_size == 0 {
      return Err(Error::InvalidConfig {
        reason: "stage_size must be nonzero for the gpu variant",
      });
    }

    let row_bytes: usize = config.row_dim.strict_mul(ELEMENT_BYTES);
    let read_bytes: usize = row_bytes.max(STORAGE_ALIGNMENT).next_multiple_of(STORAGE_ALIGNMENT);

    // Grouping constant: invariant 7. `alignment_bytes / row_bytes`, floored,
    // never less than one row per group.
    let group_size: usize = (STORAGE_ALIGNMENT / row_bytes).max(1);

    let node_count: usize = config.node_count as usize;
    let table_len: usize = node_count.div_ceil(group_size.max(1));
    let cache_slots: usize = config.buffer_size;

    let slot_stride: usize = read_bytes;

    let buffer_bytes: usize = cache_slots.strict_mul(slot_stride).next_multiple_of(BUFFER_ALIGNMENT);

    let staging_bytes: usize = if matches!(config.kind, CacheKind::Gpu) {
      config.stage_size.strict_mul(slot_stride).next_multiple_of(BUFFER_ALIGNMENT)
    } else {
      0
    };

    Ok(Self {
      row_bytes,
      read_bytes,
      slot_stride,
      group_size,
      node_count: config.node_count,
      table_len,
      cache_slots,
      buffer_bytes,
      staging_bytes,
    })
  }

  /// Splits a caller key into its grouped key and in-group offset (§4.3).
  #[inline]
  pub const fn group_of(&self, raw_key: i64) -> (usize, usize) {
    let raw: usize = raw_key as usize;
    let group_size: usize = self.group_size;
    let group_index: usize = raw / group_size;
    let in_group_offset: usize = raw % group_size;
    (group_index, in_group_offset)
  }

  /// Computes the remap index for a slot and in-group offset (§4.3).
  #[inline]
  pub const fn remap_index(&self, slot: usize, in_group_offset: usize) -> i64 {
    (slot.strict_mul(self.group_size).strict_add(in_group_offset)) as i64
  }

  /// Byte offset into the backing file for the group containing `raw_key`.
  #[inline]
  pub const fn file_offset(&self, group_index: usize) -> u64 {
    (group_index.strict_mul(self.group_size).strict_mul(self.row_bytes)) as u64
  }

  /// Byte range in the cache buffer reserved for `slot`'s direct-I/O target.
  /// Exactly `read_bytes` long, so a read never spills into the next slot.
  #[inline]
  pub(crate) const fn slot_region(&self, slot: usize) -> (usize, usize) {
    (slot.strict_mul(self.slot_stride), self.read_bytes)
  }

  /// Byte offset of one row within the buffer, given its remap index
  /// (`slot * group_size + in_group_offset`, §4.3). Recovers `slot` and
  /// `in_group_offset` from the remap index and addresses the row inside
  /// that slot's `slot_stride`-sized region.
  #[inline]
  pub(crate) const fn row_byte_offset(&self, remap_index: i64) -> usize {
    let remap: usize = remap_index as usize;
    let slot: usize = remap / self.group_size;
    let in_group_offset: usize = remap % self.group_size;
    slot.strict_mul(self.slot_stride).strict_add(in_group_offset.strict_mul(self.row_bytes))
  }
}

impl Debug for CacheLayout {
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    f.debug_struct("CacheLayout")
      .field("row_bytes", &self.row_bytes)
      .field("read_bytes", &self.read_bytes)
      .field("slot_stride", &self.slot_stride)
      .field("group_size", &self.group_size)
      .field("node_count", &self.node_count)
      .field("table_len", &self.table_len)
      .field("cache_slots", &self.cache_slots)
      .field("buffer_bytes", &self.buffer_bytes)
      .field("staging_bytes", &self.staging_bytes)
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn group_size_evenly_divides_alignment() {
    let config: CacheConfig = CacheConfig::cpu("unused", 16, 32, 4);
    let layout: CacheLayout = CacheLayout::derive(&config).unwrap();
    assert_eq!(layout.row_bytes, 128);
    assert_eq!(layout.group_size, 4);
    assert_eq!(layout.read_bytes, 512);
    assert_eq!(layout.slot_stride, 512);
  }

  #[test]
  fn group_size_one_when_row_exceeds_alignment() {
    let config: CacheConfig = CacheConfig::cpu("unused", 16, 256, 4);
    let layout: CacheLayout = CacheLayout::derive(&config).unwrap();
    assert_eq!(layout.row_bytes, 1024);
    assert_eq!(layout.group_size, 1);
    assert_eq!(layout.read_bytes, 1024);
  }

  #[test]
  fn non_dividing_row_bytes_keeps_slots_disjoint() {
    // row_dim=50 -> row_bytes=200; 512/200 floors to group_size=2, but
    // group_size*row_bytes=400 < read_bytes=512. slot_stride must reserve
    // the full read_bytes per slot so back-to-back reads cannot overlap.
    let config: CacheConfig = CacheConfig::cpu("unused", 16, 50, 4);
    let layout: CacheLayout = CacheLayout::derive(&config).unwrap();
    assert_eq!(layout.group_size, 2);
    assert_eq!(layout.read_bytes, 512);
    assert_eq!(layout.slot_stride, 512);

    let (offset_0, len_0) = layout.slot_region(0);
    let (offset_1, _) = layout.slot_region(1);
    assert_eq!(offset_0.strict_add(len_0), offset_1, "slot 0's read must not reach into slot 1");
  }

  #[test]
  fn remap_round_trips_through_row_byte_offset() {
    let config: CacheConfig = CacheConfig::cpu("unused", 16, 32, 4);
    let layout: CacheLayout = CacheLayout::derive(&config).unwrap();

    let remap: i64 = layout.remap_index(2, 1);
    let expected: usize = 2usize.strict_mul(layout.slot_stride).strict_add(layout.row_bytes);
    assert_eq!(layout.row_byte_offset(remap), expected);
  }

  #[test]
  fn zero_row_dim_is_rejected() {
    let config: CacheConfig = CacheConfig::cpu("unused", 16, 0, 4);
    assert!(matches!(CacheLayout::derive(&config), Err(Error::InvalidConfig { .. })));
  }

  #[test]
  fn gpu_variant_requires_stage_size() {
    let config: CacheConfig = CacheConfig::gpu("unused", 16, 32, 4, 0, 0);
    assert!(matches!(CacheLayout::derive(&config), Err(Error::InvalidConfig { .. })));
  }
}
