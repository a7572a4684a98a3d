//! Black-box integration tests against the public [`FeatureCache`] API,
//! driven through a real temporary backing file (§8 concrete scenarios).

use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Barrier;
use std::thread;

use fvcache::CacheConfig;
use fvcache::CacheKind;
use fvcache::FeatureCache;
use tempfile::NamedTempFile;

/// Writes a packed row file where row `k` is `row_dim` copies of `k as f32`,
/// so fidelity can be checked by reading the tensor back.
fn packed_file(node_count: i64, row_dim: usize) -> NamedTempFile {
  let file: NamedTempFile = NamedTempFile::new().expect("create temp file");
  write_rows(file.path(), node_count, row_dim);
  file
}

fn write_rows(path: &Path, node_count: i64, row_dim: usize) {
  let mut handle: File = File::create(path).expect("open temp file for writing");

  for key in 0..node_count {
    let row: Vec<f32> = vec![key as f32; row_dim];
    let bytes: &[u8] = bytemuck_cast(&row);
    handle.write_all(bytes).expect("write row");
  }

  handle.flush().expect("flush temp file");
}

/// Minimal `f32` slice -> byte slice cast, avoiding a `bytemuck` dependency
/// for this one call site.
fn bytemuck_cast(row: &[f32]) -> &[u8] {
  // SAFETY: `f32` has no padding or invalid bit patterns; the resulting
  // slice is never mutated through this alias.
  unsafe { core::slice::from_raw_parts(row.as_ptr().cast::<u8>(), core::mem::size_of_val(row)) }
}

#[test]
fn cold_hit_reuse() {
  // row_dim=128 -> row_bytes=512 -> group_size=1 (scenario 1).
  let file: NamedTempFile = packed_file(8, 128);
  let cache: FeatureCache = FeatureCache::open(CacheConfig::cpu(file.path(), 8, 128, 4)).unwrap();

  let first: Vec<i64> = cache.async_load(&[2], 0, 1).unwrap();
  cache.release(&[2]).unwrap();
  let second: Vec<i64> = cache.async_load(&[2], 0, 1).unwrap();

  assert_eq!(first, second, "reclaim must return the same slot without reloading");

  let tensor = cache.get_tensor().unwrap();
  assert_eq!(tensor.row(second[0]), vec![2.0f32; 128].as_slice());

  cache.release(&[2]).unwrap();
}

#[test]
fn eviction_reloads_after_slot_reuse() {
  let file: NamedTempFile = packed_file(8, 128);
  let cache: FeatureCache = FeatureCache::open(CacheConfig::cpu(file.path(), 8, 128, 2)).unwrap();

  cache.async_load(&[0], 0, 1).unwrap();
  cache.release(&[0]).unwrap();
  cache.async_load(&[1], 0, 1).unwrap();
  cache.release(&[1]).unwrap();
  cache.async_load(&[2], 0, 1).unwrap();
  cache.release(&[2]).unwrap();

  // key 0's slot was reused for key 2 (FIFO free pool with two slots);
  // reloading it must read fresh data rather than reclaim stale contents.
  let remap_0b: Vec<i64> = cache.async_load(&[0], 0, 1).unwrap();

  let tensor = cache.get_tensor().unwrap();
  assert_eq!(tensor.row(remap_0b[0]), vec![0.0f32; 128].as_slice());

  cache.release(&[0]).unwrap();
}

#[test]
fn grouping_collapses_adjacent_keys_into_one_read() {
  // row_dim=32 -> row_bytes=128 -> group_size=4 (scenario 4).
  let file: NamedTempFile = packed_file(16, 32);
  let cache: FeatureCache = FeatureCache::open(CacheConfig::cpu(file.path(), 16, 32, 4)).unwrap();

  let remap: Vec<i64> = cache.async_load(&[9, 10], 0, 1).unwrap();

  // Both keys fall in group 2 (keys 8..=11); the remap must differ only by
  // their in-group offset, 1 and 2.
  assert_eq!(remap[0] + 1, remap[1]);
  assert_eq!(remap[0] % 4, 1);
  assert_eq!(remap[1] % 4, 2);

  let tensor = cache.get_tensor().unwrap();
  assert_eq!(tensor.row(remap[0]), vec![9.0f32; 32].as_slice());
  assert_eq!(tensor.row(remap[1]), vec![10.0f32; 32].as_slice());

  cache.release(&[9, 10]).unwrap();
}

#[test]
fn exhaustion_leaves_prior_pins_intact() {
  let file: NamedTempFile = packed_file(8, 128);
  let cache: FeatureCache = FeatureCache::open(CacheConfig::cpu(file.path(), 8, 128, 1)).unwrap();

  let remap_0: Vec<i64> = cache.async_load(&[0], 0, 1).unwrap();
  let result = cache.async_load(&[1], 0, 1);
  assert!(result.is_err(), "a single-slot cache must reject a second distinct key while key 0 is pinned");

  // key 0 must still be valid and addressable; the failed batch for key 1
  // must not have corrupted or unpinned it.
  let tensor = cache.get_tensor().unwrap();
  assert_eq!(tensor.row(remap_0[0]), vec![0.0f32; 128].as_slice());

  cache.release(&[0]).unwrap();

  // Once released, the same cache can serve the key that previously failed.
  cache.async_load(&[1], 0, 1).unwrap();
  cache.release(&[1]).unwrap();
}

#[test]
fn out_of_range_key_is_rejected() {
  let file: NamedTempFile = packed_file(4, 128);
  let cache: FeatureCache = FeatureCache::open(CacheConfig::cpu(file.path(), 4, 128, 2)).unwrap();

  assert!(cache.async_load(&[4], 0, 1).is_err());
  assert!(cache.async_load(&[-1], 0, 1).is_err());
}

#[test]
fn pin_balance_after_matching_release() {
  let file: NamedTempFile = packed_file(8, 128);
  let cache: FeatureCache = FeatureCache::open(CacheConfig::cpu(file.path(), 8, 128, 4)).unwrap();

  for _ in 0..3 {
    let keys: [i64; 3] = [0, 1, 2];
    cache.async_load(&keys, 0, 1).unwrap();
    cache.release(&keys).unwrap();
  }

  // Every slot must be free again: a cache's worth of distinct keys can
  // still be loaded without hitting `Exhausted`.
  cache.async_load(&[3, 4, 5, 6], 0, 1).unwrap();
  cache.release(&[3, 4, 5, 6]).unwrap();
}

#[test]
fn in_flight_dedup_across_threads() {
  let file: NamedTempFile = packed_file(8, 128);
  let path: PathBuf = file.path().to_path_buf();
  let cache: Arc<FeatureCache> = Arc::new(FeatureCache::open(CacheConfig::cpu(&path, 8, 128, 4)).unwrap());

  let barrier: Arc<Barrier> = Arc::new(Barrier::new(2));

  let cache_a: Arc<FeatureCache> = Arc::clone(&cache);
  let barrier_a: Arc<Barrier> = Arc::clone(&barrier);
  let handle_a = thread::spawn(move || {
    barrier_a.wait();
    cache_a.async_load(&[5], 0, 1).unwrap()
  });

  let cache_b: Arc<FeatureCache> = Arc::clone(&cache);
  let barrier_b: Arc<Barrier> = Arc::clone(&barrier);
  let handle_b = thread::spawn(move || {
    barrier_b.wait();
    cache_b.async_load(&[5], 0, 1).unwrap()
  });

  let remap_a: Vec<i64> = handle_a.join().unwrap();
  let remap_b: Vec<i64> = handle_b.join().unwrap();

  assert_eq!(remap_a, remap_b, "concurrent loads of the same key must dedup to one slot");

  let tensor = cache.get_tensor().unwrap();
  assert_eq!(tensor.row(remap_a[0]), vec![5.0f32; 128].as_slice());

  cache.release(&[5]).unwrap();
  cache.release(&[5]).unwrap();
}

#[test]
fn device_round_trip() {
  let file: NamedTempFile = packed_file(8, 128);
  let cache: FeatureCache = FeatureCache::open(CacheConfig::gpu(file.path(), 8, 128, 4, 0, 4)).unwrap();

  let remap: Vec<i64> = cache.async_load(&[3, 6], 0, 1).unwrap();
  let tensor = cache.get_tensor().unwrap();

  assert_eq!(tensor.row(remap[0]), vec![3.0f32; 128].as_slice());
  assert_eq!(tensor.row(remap[1]), vec![6.0f32; 128].as_slice());

  cache.release(&[3, 6]).unwrap();
}

#[test]
fn gds_variant_is_rejected_as_unimplemented() {
  let file: NamedTempFile = packed_file(4, 128);
  let config: CacheConfig = CacheConfig {
    kind: CacheKind::Gds,
    ..CacheConfig::cpu(file.path(), 4, 128, 2)
  };

  assert!(matches!(FeatureCache::open(config), Err(fvcache::Error::GdsUnimplemented)));
}

#[test]
fn none_variant_guards_every_operation() {
  let cache: FeatureCache = FeatureCache::none();

  assert!(matches!(cache.async_load(&[0], 0, 1), Err(fvcache::Error::NotInitialized)));
  assert!(matches!(cache.release(&[0]), Err(fvcache::Error::NotInitialized)));
  assert!(matches!(cache.get_tensor(), Err(fvcache::Error::NotInitialized)));
}
