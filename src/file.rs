//! Whole-file read into an owned buffer, opened close-on-exec.

use anyhow::{bail, Context, Result};
use nix::fcntl::{open, OFlag};
use nix::sys::stat::{fstat, Mode};
use nix::unistd::{close, read};
use std::path::Path;

/// Reads the entirety of `path` into memory. The file descriptor is opened
/// close-on-exec, matching this crate's general fd-hygiene discipline
/// (component B); a one-shot read has no business surviving into a spawned
/// child. Any short or zero read before the expected size is reached is
/// treated as a failure rather than returning a truncated buffer.
pub fn read_file<P: AsRef<Path>>(path: P) -> Result<Vec<u8>> {
    let fd = open(path.as_ref(), OFlag::O_RDONLY | OFlag::O_CLOEXEC, Mode::empty())
        .with_context(|| format!("open {}", path.as_ref().display()))?;

    let result = (|| -> Result<Vec<u8>> {
        let stat = fstat(fd).context("fstat")?;
        let size = usize::try_from(stat.st_size).context("negative file size")?;
        let mut buf = vec![0u8; size];
        let mut total = 0;
        while total < size {
            match read(fd, &mut buf[total..]) {
                Ok(0) => bail!("short read: got {total} of {size} bytes"),
                Ok(n) => total += n,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(e).context("read"),
            }
        }
        Ok(buf)
    })();

    let _ = close(fd);
    result
}
