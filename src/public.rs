//! Lifecycle and public operations (§4.6, §4.7): [`FeatureCache::open`],
//! [`FeatureCache::async_load`], [`FeatureCache::release`],
//! [`FeatureCache::get_tensor`], and the guarded `none` variant.

use std::fs::File;

use crate::array::AlignedBuffer;
use crate::config::BUFFER_ALIGNMENT;
use crate::config::CacheConfig;
use crate::config::CacheKind;
use crate::config::CacheLayout;
use crate::config::ELEMENT_BYTES;
use crate::device::HostCopyStream;
use crate::device::StagingAllocator;
use crate::device::Stream;
use crate::error::Error;
use crate::error::Result;
use crate::io::engine;
use crate::io::engine::IoEngine;
use crate::io::platform;
use crate::key::GroupKey;
use crate::table::Classify;
use crate::table::KeyTable;

/// A non-owning view over the cache's primary buffer (`get_tensor`, §4.6).
///
/// Addresses rows by the `remap` indices [`FeatureCache::async_load`]
/// returns rather than a flat `remap * row_dim` array: a slot's storage
/// region is `slot_stride` bytes wide (see [`CacheLayout`]), which can
/// exceed `group_size * row_bytes` when `row_bytes` does not evenly divide
/// the storage alignment, so a naive flat index would sometimes land on the
/// wrong row.
pub struct TensorView<'a> {
  buffer: &'a AlignedBuffer,
  layout: CacheLayout,
}

impl<'a> TensorView<'a> {
  const fn new(buffer: &'a AlignedBuffer, layout: CacheLayout) -> Self {
    Self { buffer, layout }
  }

  /// Returns the `row_dim`-element row addressed by `remap_index`.
  #[must_use]
  pub fn row(&self, remap_index: i64) -> &[f32] {
    let offset: usize = self.layout.row_byte_offset(remap_index);
    let bytes: &[u8] = &self.buffer.as_slice()[offset..offset.strict_add(self.layout.row_bytes)];

    // SAFETY: `bytes` is `row_bytes` long (`row_dim * ELEMENT_BYTES`) and the
    // buffer is allocated at `BUFFER_ALIGNMENT`, a multiple of `f32`'s
    // alignment; `slot_stride` and `row_bytes` are themselves multiples of
    // `ELEMENT_BYTES`, so `offset` is always `f32`-aligned.
    unsafe { core::slice::from_raw_parts(bytes.as_ptr().cast::<f32>(), self.layout.row_bytes / ELEMENT_BYTES) }
  }

  /// Raw byte view of the whole buffer, for a binding surface that wants to
  /// hand the entire region to an external runtime directly.
  #[must_use]
  pub fn as_bytes(&self) -> &[u8] {
    self.buffer.as_slice()
  }

  /// The layout this view was constructed against.
  #[must_use]
  pub const fn layout(&self) -> &CacheLayout {
    &self.layout
  }
}

struct Shared {
  layout: CacheLayout,
  table: KeyTable,
  file: File,
}

enum Backing {
  /// Never successfully opened; every operation returns [`Error::NotInitialized`].
  None,
  Cpu { shared: Shared, host: AlignedBuffer },
  Gpu { shared: Shared, staging: AlignedBuffer, device: AlignedBuffer },
}

/// A fixed-size feature-vector offload cache (§1–§4).
///
/// Serves fixed-width rows pulled on demand from a read-only, packed row
/// file, indexed by a dense integer key space, through a bounded in-memory
/// (or device) buffer reused under pin-based LRU semantics.
///
/// See the crate-level documentation for an overview; [`async_load`] and
/// [`release`] are the two operations callers use in a request/response
/// pair, and [`get_tensor`] exposes the buffer the remap indices address.
///
/// [`async_load`]: FeatureCache::async_load
/// [`release`]: FeatureCache::release
/// [`get_tensor`]: FeatureCache::get_tensor
pub struct FeatureCache {
  backing: Backing,
}

impl FeatureCache {
  /// Opens a cache for `config`.
  ///
  /// # Errors
  ///
  /// Returns [`Error::InvalidConfig`] if the configuration fails
  /// validation, [`Error::GdsUnimplemented`] if `config.kind` is
  /// [`CacheKind::Gds`], [`Error::Open`]/[`Error::FileSize`] if the backing
  /// file cannot be opened or is too short, or [`Error::Alignment`] if a
  /// buffer cannot be allocated at the required alignment.
  pub fn open(config: CacheConfig) -> Result<Self> {
    match config.kind {
      CacheKind::Gds => return Err(Error::GdsUnimplemented),
      CacheKind::None => return Ok(Self { backing: Backing::None }),
      CacheKind::Cpu | CacheKind::Gpu => {}
    }

    let layout: CacheLayout = CacheLayout::derive(&config)?;

    let file: File = platform::open_direct(&config.filename)?;
    let expected: u64 = (layout.row_bytes as u64).strict_mul(config.node_count as u64);
    let actual: u64 = file
      .metadata()
      .map_err(|source| Error::Open {
        path: config.filename.clone(),
        source,
      })?
      .len();

    if actual < expected {
      return Err(Error::FileSize {
        path: config.filename.clone(),
        expected,
        actual,
      });
    }

    let table: KeyTable = KeyTable::new(&layout);
    let shared: Shared = Shared { layout, table, file };

    let backing: Backing = match config.kind {
      CacheKind::Cpu => {
        let host: AlignedBuffer = AlignedBuffer::new(layout.buffer_bytes).ok_or(Error::Alignment {
          context: "host",
          align: BUFFER_ALIGNMENT,
        })?;

        tracing::info!(
          kind = "cpu",
          row_bytes = layout.row_bytes,
          group_size = layout.group_size,
          cache_slots = layout.cache_slots,
          buffer_bytes = layout.buffer_bytes,
          "feature cache opened"
        );

        Backing::Cpu { shared, host }
      }
      CacheKind::Gpu => {
        let staging: AlignedBuffer = AlignedBuffer::new(layout.staging_bytes).ok_or(Error::Alignment {
          context: "staging",
          align: BUFFER_ALIGNMENT,
        })?;

        let device: AlignedBuffer = AlignedBuffer::new(layout.buffer_bytes).ok_or(Error::Alignment {
          context: "device",
          align: BUFFER_ALIGNMENT,
        })?;

        tracing::info!(
          kind = "gpu",
          device_id = config.device_id,
          row_bytes = layout.row_bytes,
          group_size = layout.group_size,
          cache_slots = layout.cache_slots,
          buffer_bytes = layout.buffer_bytes,
          staging_bytes = layout.staging_bytes,
          "feature cache opened"
        );

        Backing::Gpu { shared, staging, device }
      }
      CacheKind::Gds | CacheKind::None => unreachable!("handled above"),
    };

    Ok(Self { backing })
  }

  /// Creates a guarded cache that was never opened.
  ///
  /// Every operation on the returned cache returns [`Error::NotInitialized`].
  /// Mirrors the original implementation's null-object startup path: an
  /// embedding that tolerates a failed cache open substitutes this instead
  /// of propagating the failure.
  #[must_use]
  pub const fn none() -> Self {
    Self { backing: Backing::None }
  }

  fn shared(&self) -> Result<&Shared> {
    match &self.backing {
      Backing::None => Err(Error::NotInitialized),
      Backing::Cpu { shared, .. } | Backing::Gpu { shared, .. } => Ok(shared),
    }
  }

  /// Loads `keys` into the cache, pinning each and returning the remap
  /// index for each, in input order (§4.6).
  ///
  /// `t_id`/`t_total` partition the pinned host staging area for the
  /// device variant (§4.5); they are ignored by the host variant.
  ///
  /// # Errors
  ///
  /// See §7: [`Error::NotInitialized`], [`Error::KeyOutOfRange`],
  /// [`Error::Exhausted`], [`Error::StagingExhausted`],
  /// [`Error::IoSetup`], or [`Error::Submit`].
  pub fn async_load(&self, keys: &[i64], t_id: usize, t_total: usize) -> Result<Vec<i64>> {
    match &self.backing {
      Backing::None => Err(Error::NotInitialized),
      Backing::Cpu { shared, host } => load_cpu(shared, host, keys),
      Backing::Gpu { shared, staging, device } => load_gpu(shared, staging, device, keys, t_id, t_total),
    }
  }

  /// Decrements pin counts for `keys`, one per occurrence (§4.6).
  ///
  /// # Errors
  ///
  /// Returns [`Error::NotInitialized`] if the cache was never opened.
  pub fn release(&self, keys: &[i64]) -> Result<()> {
    let shared: &Shared = self.shared()?;
    shared.table.release_batch(keys, &shared.layout);
    Ok(())
  }

  /// Returns a non-owning view over the primary buffer: the host buffer for
  /// the `cpu` variant, the device buffer for the `gpu` variant (§4.6).
  ///
  /// # Errors
  ///
  /// Returns [`Error::NotInitialized`] if the cache was never opened.
  pub fn get_tensor(&self) -> Result<TensorView<'_>> {
    match &self.backing {
      Backing::None => Err(Error::NotInitialized),
      Backing::Cpu { shared, host } => Ok(TensorView::new(host, shared.layout)),
      Backing::Gpu { shared, device, .. } => Ok(TensorView::new(device, shared.layout)),
    }
  }
}

/// Classifies `keys`, splitting the result into the remap indices to
/// return, the misses that need a read submitted (in submission order, for
/// the device variant's staging sequence numbering), and the in-flight
/// groups this batch must wait on after its own misses are drained.
fn classify(shared: &Shared, keys: &[i64]) -> Result<(Vec<i64>, Vec<(GroupKey, usize)>, Vec<GroupKey>)> {
  let classifications: Vec<Classify> = shared.table.classify_batch(keys, &shared.layout)?;

  let mut remap: Vec<i64> = Vec::with_capacity(classifications.len());
  let mut misses: Vec<(GroupKey, usize)> = Vec::new();
  let mut inflight: Vec<GroupKey> = Vec::new();

  for classification in classifications {
    match classification {
      Classify::Hit { remap: r } => remap.push(r),
      Classify::InFlight { group, remap: r } => {
        remap.push(r);
        inflight.push(group);
      }
      Classify::Miss { group, slot, remap: r } => {
        remap.push(r);
        misses.push((group, slot.get()));
      }
    }
  }

  Ok((remap, misses, inflight))
}

/// Marks a completion's key `Ready`, regardless of whether the read itself
/// succeeded. Per §7 kind 5, a failed read is logged and still surfaces its
/// (faulty) bytes to the caller rather than leaving the key `Loading`
/// forever — the latter would deadlock any other thread already
/// spin-waiting on this key as `IN-FLIGHT` (§5). Submission failures and
/// I/O-context setup failures get the same treatment for the same reason;
/// see `DESIGN.md` for why this crate extends the completion-error
/// handling to those cases instead of attempting a cross-thread-safe
/// rollback after publication.
fn apply_completion(table: &KeyTable, group: GroupKey, result: &Result<()>) {
  if let Err(error) = result {
    tracing::error!(key = group.get(), error = %error, "direct read did not complete successfully; slot marked valid anyway");
  }

  table.mark_ready(group);
}

fn load_cpu(shared: &Shared, host: &AlignedBuffer, keys: &[i64]) -> Result<Vec<i64>> {
  let (remap, misses, inflight) = classify(shared, keys)?;

  if !misses.is_empty() {
    let depth: usize = engine::QUEUE_DEPTH.min(misses.len()).max(1);

    let mut io: Box<dyn IoEngine> = match engine::new_engine(depth) {
      Ok(io) => io,
      Err(error) => {
        for &(group, _) in &misses {
          let failure: Result<()> = Err(Error::IoSetup {
            source: std::io::Error::other(error.to_string()),
          });
          apply_completion(&shared.table, group, &failure);
        }
        return Err(error);
      }
    };

    let mut submit_failed: Option<i64> = None;

    for &(group, slot) in &misses {
      let (offset, len) = shared.layout.slot_region(slot);
      let file_offset: u64 = shared.layout.file_offset(group.get());

      // SAFETY: `classify` just assigned `slot` to this load exclusively;
      // no other reference to this region exists until its completion is
      // reaped below (invariant 5).
      let buf: &mut [u8] = unsafe { host.slice_mut(offset, len) };

      // SAFETY: `buf` stays valid and exclusively written until reaped.
      let submitted: Result<()> = unsafe { io.submit(&shared.file, group, file_offset, buf) };

      match submitted {
        Ok(()) => {
          if let Some((completed, result)) = io.try_reap() {
            apply_completion(&shared.table, completed, &result);
          }
        }
        Err(error) => {
          let failure: Result<()> = Err(error);
          apply_completion(&shared.table, group, &failure);
          submit_failed = Some(group.get() as i64);
          break;
        }
      }
    }

    for (group, result) in io.drain() {
      apply_completion(&shared.table, group, &result);
    }

    if let Some(key) = submit_failed {
      return Err(Error::Submit {
        key,
        source: std::io::Error::other("read submission failed for a batch member"),
      });
    }
  }

  for group in inflight {
    shared.table.wait_ready(group);
  }

  Ok(remap)
}

#[allow(clippy::too_many_lines)]
#[allow(clippy::too_many_arguments)]
fn load_gpu(
  shared: &Shared,
  staging: &AlignedBuffer,
  device: &AlignedBuffer,
  keys: &[i64],
  t_id: usize,
  t_total: usize,
) -> Result<Vec<i64>> {
  let (remap, misses, inflight) = classify(shared, keys)?;

  if !misses.is_empty() {
    let stage_groups: usize = shared.layout.staging_bytes.checked_div(shared.layout.slot_stride).unwrap_or(0);
    let mut stager: StagingAllocator = StagingAllocator::new(stage_groups, t_id, t_total);
    let depth: usize = engine::QUEUE_DEPTH.min(misses.len()).max(1);

    let mut io: Box<dyn IoEngine> = match engine::new_engine(depth) {
      Ok(io) => io,
      Err(error) => {
        for &(group, _) in &misses {
          let failure: Result<()> = Err(Error::IoSetup {
            source: std::io::Error::other(error.to_string()),
          });
          apply_completion(&shared.table, group, &failure);
        }
        return Err(error);
      }
    };

    // `device_slot` is the final cache slot for a miss; `staging_slot` is
    // the scratch staging slot its read lands in before the H2D copy.
    let mut pending: Vec<(GroupKey, usize, usize)> = Vec::with_capacity(misses.len());
    let mut abort: Option<Error> = None;

    for &(group, device_slot) in &misses {
      let staging_slot: usize = match stager.assign(stage_groups, t_id, t_total) {
        Ok(slot) => slot,
        Err(error) => {
          let failure: Result<()> = Err(Error::StagingExhausted {
            stage_size: stage_groups,
            t_id,
            t_total,
          });
          apply_completion(&shared.table, group, &failure);
          abort = Some(error);
          break;
        }
      };

      let (offset, len) = shared.layout.slot_region(staging_slot);
      let file_offset: u64 = shared.layout.file_offset(group.get());

      // SAFETY: staging slots are assigned once per miss per batch by
      // `stager` and are not shared with any other in-flight read.
      let buf: &mut [u8] = unsafe { staging.slice_mut(offset, len) };

      let submitted: Result<()> = unsafe { io.submit(&shared.file, group, file_offset, buf) };

      match submitted {
        Ok(()) => {
          pending.push((group, device_slot, staging_slot));

          if let Some((completed_group, result)) = io.try_reap() {
            complete_gpu(&shared.table, &shared.layout, staging, device, &pending, completed_group, &result);
          }
        }
        Err(error) => {
          let failure: Result<()> = Err(error);
          apply_completion(&shared.table, group, &failure);
          abort = Some(Error::Submit {
            key: group.get() as i64,
            source: std::io::Error::other("read submission failed"),
          });
          break;
        }
      }
    }

    for (group, result) in io.drain() {
      complete_gpu(&shared.table, &shared.layout, staging, device, &pending, group, &result);
    }

    if let Some(error) = abort {
      return Err(error);
    }
  }

  for group in inflight {
    shared.table.wait_ready(group);
  }

  Ok(remap)
}

/// Applies one completion during the device variant's submit/drain loop:
/// marks the key `Ready` and enqueues its H2D copy, matching §4.5's
/// ordering requirement that validity is published before the copy is
/// enqueued.
#[allow(clippy::too_many_arguments)]
fn complete_gpu(
  table: &KeyTable,
  layout: &CacheLayout,
  staging: &AlignedBuffer,
  device: &AlignedBuffer,
  pending: &[(GroupKey, usize, usize)],
  group: GroupKey,
  result: &Result<()>,
) {
  let Some(&(_, device_slot, staging_slot)) = pending.iter().find(|(g, ..)| *g == group) else {
    return;
  };

  apply_completion(table, group, result);

  let (dst_offset, dst_len) = layout.slot_region(device_slot);
  let (src_offset, _) = layout.slot_region(staging_slot);

  let mut stream: HostCopyStream<'_> = HostCopyStream::new(device);
  stream.enqueue_copy(staging, src_offset, dst_offset, dst_len);
}
