//! A fixed-size feature-vector offload cache.
//!
//! `fvcache` serves fixed-width rows pulled on demand from a large,
//! read-only packed row file on block storage, indexed by a dense integer
//! key space. It is built for a graph/ML sampler that repeatedly asks for
//! batches of rows belonging to nodes: the full row table is too large for
//! RAM (or device memory), so a bounded cache is kept in front of it,
//! backed by direct, aligned storage reads.
//!
//! # Overview
//!
//! Callers pin a batch of keys with [`FeatureCache::async_load`], which
//! returns one remap index per key addressing the row inside the cache's
//! buffer, read through [`FeatureCache::get_tensor`]. When done with a
//! batch, callers drop the pin with [`FeatureCache::release`]. A pinned key
//! can never be evicted; an unpinned one sits in a free pool available for
//! reuse, oldest first, and can be reclaimed back out of that pool if
//! re-requested before it is actually overwritten.
//!
//! ```no_run
//! use fvcache::{CacheConfig, FeatureCache};
//!
//! # fn main() -> Result<(), fvcache::Error> {
//! let cache = FeatureCache::open(CacheConfig::cpu("rows.bin", 1_000_000, 128, 4096))?;
//!
//! let remap = cache.async_load(&[7, 8, 9], 0, 1)?;
//! let tensor = cache.get_tensor()?;
//! for &index in &remap {
//!   let _row: &[f32] = tensor.row(index);
//! }
//! cache.release(&[7, 8, 9])?;
//! # Ok(())
//! # }
//! ```
//!
//! # Configuration
//!
//! A cache is configured with [`CacheConfig`]: a backing file, the key
//! space size (`node_count`), row width (`row_dim`), and cache capacity in
//! groups (`buffer_size`). [`CacheConfig::cpu`] builds a host-resident
//! cache; [`CacheConfig::gpu`] additionally stages reads through a pinned
//! host buffer before copying to a device buffer (see [`CacheKind`]).
//! [`CacheLayout::derive`] validates the configuration and computes every
//! derived sizing constant once, up front.
//!
//! # Grouping
//!
//! Consecutive keys are collapsed into aligned read groups so one
//! direct-I/O request can fill several logical rows: `group_size =
//! max(1, floor(alignment_bytes / row_bytes))`. The key table stores one
//! entry per group; remap indices recover the individual row within a
//! group.
//!
//! # Concurrency
//!
//! [`FeatureCache`] is `Sync`: multiple threads may call `async_load` and
//! `release` concurrently. A single mutex guards slot/pin bookkeeping and
//! the free pool; a load's in-flight state is published to other threads
//! without that mutex, as a single atomic per key, so a thread that finds
//! a key already loading can spin-wait for it without contending on the
//! lock held by the thread performing the read.
//!
//! # Direct I/O
//!
//! Reads against the backing file go through `O_DIRECT` on Linux and are
//! submitted through whichever load engine this platform and feature set
//! provide — `io_uring` where available, a synchronous `pread` fallback
//! otherwise.

mod array;
mod config;
mod device;
mod error;
mod freelist;
mod io;
mod key;
mod public;
mod table;

pub use self::config::CacheConfig;
pub use self::config::CacheKind;
pub use self::config::CacheLayout;
pub use self::error::Error;
pub use self::error::Result;
pub use self::public::FeatureCache;
pub use self::public::TensorView;
