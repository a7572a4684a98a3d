//! Opening the backing file with direct-I/O semantics.

use std::fs::File;
use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use crate::error::Error;

/// Opens `path` read-only with direct I/O where the platform supports it.
///
/// On Linux this passes `O_DIRECT`, matching the original implementation's
/// use of `libaio` (which requires it). Platforms without `O_DIRECT` fall
/// back to a normal buffered open — reads still work, they are simply not
/// guaranteed to bypass the page cache; correctness does not depend on the
/// bypass, only the alignment contract on the read side does, which the
/// load engine upholds independent of this flag.
pub(crate) fn open_direct(path: &Path) -> Result<File, Error> {
  let mut options: OpenOptions = OpenOptions::new();
  options.read(true);

  #[cfg(target_os = "linux")]
  {
    options.custom_flags(libc::O_DIRECT);
  }

  options.open(path).map_err(|source| Error::Open {
    path: path.to_path_buf(),
    source,
  })
}
