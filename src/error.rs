//! Crate error type.

use std::io;

/// Errors produced by [`FeatureCache`](crate::FeatureCache) construction and operation.
///
/// Each variant corresponds to one of the error kinds in the cache's failure
/// model: setup errors are fatal at construction, batch errors abort the
/// batch that triggered them and leave the cache consistent for the next
/// caller (aside from the known pin-leak weakness documented on
/// [`Error::Exhausted`]).
#[derive(Debug, thiserror::Error)]
pub enum Error {
  /// A configuration value was out of range or internally inconsistent.
  #[error("invalid configuration: {reason}")]
  InvalidConfig {
    /// Human-readable description of the violated constraint.
    reason: &'static str,
  },

  /// The backing file could not be opened with direct-I/O semantics.
  #[error("failed to open backing file {path:?}: {source}")]
  Open {
    /// Path that failed to open.
    path: std::path::PathBuf,
    /// Underlying OS error.
    #[source]
    source: io::Error,
  },

  /// The backing file's length is inconsistent with `node_count * row_bytes`.
  #[error("backing file {path:?} is {actual} bytes, expected at least {expected} bytes")]
  FileSize {
    /// Path that was checked.
    path: std::path::PathBuf,
    /// Size required by the configuration.
    expected: u64,
    /// Size actually observed.
    actual: u64,
  },

  /// A buffer could not be allocated at the required alignment.
  #[error("failed to allocate {context} buffer with alignment {align}")]
  Alignment {
    /// Which buffer failed to allocate.
    context: &'static str,
    /// Alignment that was required.
    align: usize,
  },

  /// The `gds` variant was requested; it is reserved and not implemented.
  #[error("the `gds` cache variant is reserved and not implemented")]
  GdsUnimplemented,

  /// Operations were attempted on a cache that failed to initialize (`none` variant).
  #[error("cache is not initialized")]
  NotInitialized,

  /// A requested key falls outside `[0, node_count)`.
  #[error("key {key} is out of range for node_count {node_count}")]
  KeyOutOfRange {
    /// The offending key.
    key: i64,
    /// The configured key-space size.
    node_count: i64,
  },

  /// The free pool had no slots left to satisfy a miss.
  #[error("free pool exhausted: all {cache_slots} slots are pinned")]
  Exhausted {
    /// Total number of slots in the cache.
    cache_slots: usize,
  },

  /// The pinned host staging area had no room left for a miss (device variant).
  #[error("staging area exhausted: {stage_size} groups, t_id={t_id} t_total={t_total}")]
  StagingExhausted {
    /// Total staging capacity in groups.
    stage_size: usize,
    /// Caller partition id.
    t_id: usize,
    /// Caller partition count.
    t_total: usize,
  },

  /// Failed to set up a per-batch I/O context (submission/completion ring or queue).
  #[error("failed to set up I/O context: {source}")]
  IoSetup {
    /// Underlying OS error.
    #[source]
    source: io::Error,
  },

  /// A read was rejected by the kernel at submission time.
  #[error("failed to submit read for key {key}: {source}")]
  Submit {
    /// The key whose read failed to submit.
    key: i64,
    /// Underlying OS error.
    #[source]
    source: io::Error,
  },

  /// A submitted read completed with a negative status.
  ///
  /// Per the cache's documented behavior this is logged and the slot is
  /// still marked valid (see the crate-level documentation's note on
  /// completion-error handling); this variant exists so the completion path
  /// can report the condition to callers that want to observe it, but it is
  /// never returned from `async_load` itself.
  #[error("read completed with error for key {key}: status {status}")]
  ReadFailed {
    /// The key whose read failed.
    key: i64,
    /// The raw negative status reported by the completion.
    status: i64,
  },
}

/// Convenience alias for results returned by this crate.
pub type Result<T> = std::result::Result<T, Error>;
