//! Direct-I/O load engine (§4.4): per-batch submission/completion.
//!
//! Two implementations share one trait: an `io_uring`-backed engine on
//! Linux (the "modern completion-queue facility" the design notes prefer),
//! and a synchronous `pread` fallback everywhere else. Both honor the same
//! submit/reap/drain protocol so `cache.rs` does not need to know which one
//! is active.

use std::fs::File;
use std::io;

use crate::error::Error;
use crate::key::GroupKey;

/// Per-batch submission queue depth. Matches the reference implementation's
/// fixed `libaio` context size; batches with fewer misses use a smaller
/// depth.
pub(crate) const QUEUE_DEPTH: usize = 80;

/// Number of completions reaped per blocking drain call.
pub(crate) const EVENT_BUFFER_SIZE: usize = 4;

/// One outstanding read, keyed by its grouped key for the completion path.
pub(crate) type Completion = (GroupKey, Result<(), Error>);

/// A per-batch asynchronous I/O context (§4.4, §9).
pub(crate) trait IoEngine {
  /// Submits a read of `buf.len()` bytes at `file_offset` into `buf`,
  /// tagged with `group` for the completion path.
  ///
  /// # Safety
  ///
  /// `buf` must remain valid and exclusively written until its matching
  /// completion is reaped (by `try_reap` or `drain`).
  unsafe fn submit(&mut self, file: &File, group: GroupKey, file_offset: u64, buf: &mut [u8]) -> Result<(), Error>;

  /// Non-blockingly reaps at most one completion, if one is ready.
  fn try_reap(&mut self) -> Option<Completion>;

  /// Blocks until every submitted read has completed, returning all
  /// remaining completions.
  fn drain(&mut self) -> Vec<Completion>;
}

/// Builds the I/O engine appropriate for this platform and feature set.
pub(crate) fn new_engine(depth: usize) -> Result<Box<dyn IoEngine>, Error> {
  #[cfg(all(target_os = "linux", feature = "io-uring"))]
  {
    Ok(Box::new(uring::UringEngine::new(depth)?))
  }

  #[cfg(not(all(target_os = "linux", feature = "io-uring")))]
  {
    let _ = depth;
    Ok(Box::new(fallback::PreadEngine::new()))
  }
}

#[cfg(all(target_os = "linux", feature = "io-uring"))]
mod uring {
  use std::fs::File;
  use std::io;
  use std::os::fd::AsRawFd;

  use io_uring::IoUring;
  use io_uring::cqueue;
  use io_uring::opcode;
  use io_uring::types;

  use super::Completion;
  use super::IoEngine;
  use crate::error::Error;
  use crate::key::GroupKey;

  pub(super) struct UringEngine {
    ring: IoUring,
    submitted: usize,
    finished: usize,
  }

  impl UringEngine {
    pub(super) fn new(depth: usize) -> Result<Self, Error> {
      let ring: IoUring = IoUring::new(depth.max(1) as u32).map_err(|source| Error::IoSetup { source })?;

      Ok(Self { ring, submitted: 0, finished: 0 })
    }

    /// Recovers the completion's `GroupKey` from its `user_data` tag (§4.4:
    /// "attach the key as the completion payload") rather than from
    /// submission order: io_uring gives no ordering guarantee between
    /// completions for concurrently in-flight reads.
    fn consume(&mut self, cqe: cqueue::Entry) -> Option<Completion> {
      self.finished += 1;

      let group: GroupKey = GroupKey::new(cqe.user_data() as usize);

      let result: i32 = cqe.result();
      if result < 0 {
        let status: i64 = i64::from(result);
        tracing::error!(key = group.get(), status, "direct read completed with negative status");
        Some((group, Err(Error::ReadFailed { key: group.get() as i64, status })))
      } else {
        Some((group, Ok(())))
      }
    }
  }

  impl IoEngine for UringEngine {
    unsafe fn submit(&mut self, file: &File, group: GroupKey, file_offset: u64, buf: &mut [u8]) -> Result<(), Error> {
      let read_e = opcode::Read::new(types::Fd(file.as_raw_fd()), buf.as_mut_ptr(), buf.len() as u32)
        .offset(file_offset)
        .build()
        .user_data(group.get() as u64);

      // SAFETY: `buf` is valid and exclusively held until its completion is
      // reaped, per this function's own safety contract.
      let push_result = unsafe { self.ring.submission().push(&read_e) };

      push_result.map_err(|_| Error::Submit {
        key: group.get() as i64,
        source: io::Error::other("submission queue full"),
      })?;

      self.submitted += 1;

      self
        .ring
        .submit()
        .map_err(|source| Error::Submit { key: group.get() as i64, source })?;

      Ok(())
    }

    fn try_reap(&mut self) -> Option<Completion> {
      let cqe: cqueue::Entry = self.ring.completion().next()?;
      self.consume(cqe)
    }

    fn drain(&mut self) -> Vec<Completion> {
      let mut out: Vec<Completion> = Vec::with_capacity(self.submitted.saturating_sub(self.finished));

      while self.finished < self.submitted {
        if self.ring.submit_and_wait(1).is_err() {
          break;
        }

        let mut reaped_any: bool = false;

        while out.len() < self.submitted {
          let Some(cqe) = self.ring.completion().next() else {
            break;
          };

          if let Some(completion) = self.consume(cqe) {
            out.push(completion);
            reaped_any = true;
          }

          if out.len() % super::EVENT_BUFFER_SIZE == 0 {
            break;
          }
        }

        if !reaped_any {
          break;
        }
      }

      out
    }
  }
}

mod fallback {
  use std::collections::VecDeque;
  use std::fs::File;
  #[cfg(unix)]
  use std::os::unix::fs::FileExt;

  use super::Completion;
  use super::IoEngine;
  use crate::error::Error;
  use crate::key::GroupKey;

  /// Synchronous `pread` engine: every submit performs its read immediately
  /// (there is no real asynchrony without a kernel completion-queue
  /// facility), and completions are simply drained from a queue. Matches
  /// the API shape of [`super::uring::UringEngine`] so callers cannot tell
  /// the two apart beyond timing.
  pub(super) struct PreadEngine {
    ready: VecDeque<Completion>,
  }

  impl PreadEngine {
    pub(super) fn new() -> Self {
      Self { ready: VecDeque::new() }
    }
  }

  impl IoEngine for PreadEngine {
    unsafe fn submit(&mut self, file: &File, group: GroupKey, file_offset: u64, buf: &mut [u8]) -> Result<(), Error> {
      let result: Result<(), Error> = file
        .read_exact_at(buf, file_offset)
        .map_err(|source| Error::Submit { key: group.get() as i64, source });

      self.ready.push_back((group, result));
      Ok(())
    }

    fn try_reap(&mut self) -> Option<Completion> {
      self.ready.pop_front()
    }

    fn drain(&mut self) -> Vec<Completion> {
      self.ready.drain(..).collect()
    }
  }
}
