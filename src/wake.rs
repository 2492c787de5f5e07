//! The asynchronous wake-up handle a `Queue` uses to signal its owning event
//! loop thread. Two implementations are provided: `SelfPipeWake` for loops
//! with no native async primitive, and `NotifyWake` for loops already built
//! on tokio. Both are edge-coalescing: multiple notifications before the
//! loop drains collapse into a single wake.

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::unistd::{close, pipe2, read, write};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

/// Capability interface for waking an event-loop thread from any thread.
pub trait WakeHandle: Send + Sync {
    /// Signal the loop. May be called from any thread, any number of times;
    /// implementations coalesce concurrent signals.
    fn notify(&self) -> Result<()>;
}

/// A close-on-exec, non-blocking self-pipe. Writing a byte to the write end
/// makes the read end readable; the owning loop drains it before re-checking
/// for new activations.
pub struct SelfPipeWake {
    read_fd: RawFd,
    write_fd: RawFd,
    pending: AtomicBool,
}

impl SelfPipeWake {
    pub fn new() -> Result<Self> {
        let (read_fd, write_fd) = pipe2(OFlag::O_CLOEXEC).context("pipe2")?;
        let flags = fcntl(write_fd, FcntlArg::F_GETFL).context("fcntl F_GETFL")?;
        fcntl(
            write_fd,
            FcntlArg::F_SETFL(OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK),
        )
        .context("fcntl F_SETFL O_NONBLOCK")?;
        Ok(Self {
            read_fd,
            write_fd,
            pending: AtomicBool::new(false),
        })
    }

    /// The fd a loop should register for readability.
    pub fn read_fd(&self) -> RawFd {
        self.read_fd
    }

    /// Drain all buffered wake bytes. Call this before re-checking for new
    /// queue activity, matching the original self-pipe `on_read` handler.
    pub fn drain(&self) -> Result<()> {
        let mut buf = [0u8; 256];
        loop {
            match read(self.read_fd, &mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(Errno::EAGAIN) => break,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e).context("read self-pipe"),
            }
        }
        self.pending.store(false, Ordering::SeqCst);
        Ok(())
    }
}

impl WakeHandle for SelfPipeWake {
    fn notify(&self) -> Result<()> {
        if self.pending.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        loop {
            match write(self.write_fd, &[0u8]) {
                Ok(_) => return Ok(()),
                Err(Errno::EINTR) => continue,
                Err(Errno::EAGAIN) => return Ok(()),
                Err(e) => return Err(e).context("write self-pipe"),
            }
        }
    }
}

impl Drop for SelfPipeWake {
    fn drop(&mut self) {
        let _ = close(self.read_fd);
        let _ = close(self.write_fd);
    }
}

/// A `tokio::sync::Notify`-backed wake handle, for loops already driven by a
/// tokio runtime. `Notify::notify_one` is itself edge-coalescing.
pub struct NotifyWake {
    notify: Notify,
}

impl NotifyWake {
    pub fn new() -> Self {
        Self {
            notify: Notify::new(),
        }
    }

    /// Waits for the next wake signal.
    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}

impl Default for NotifyWake {
    fn default() -> Self {
        Self::new()
    }
}

impl WakeHandle for NotifyWake {
    fn notify(&self) -> Result<()> {
        self.notify.notify_one();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn self_pipe_signals_readable() {
        let wake = SelfPipeWake::new().unwrap();
        wake.notify().unwrap();

        let mut pfd = [nix::poll::PollFd::new(
            wake.read_fd(),
            nix::poll::PollFlags::POLLIN,
        )];
        let n = nix::poll::poll(&mut pfd, 100).unwrap();
        assert_eq!(n, 1);

        wake.drain().unwrap();
        let mut pfd = [nix::poll::PollFd::new(
            wake.read_fd(),
            nix::poll::PollFlags::POLLIN,
        )];
        let n = nix::poll::poll(&mut pfd, 10).unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn self_pipe_coalesces() {
        let wake = SelfPipeWake::new().unwrap();
        for _ in 0..10 {
            wake.notify().unwrap();
        }
        wake.drain().unwrap();
    }

    #[tokio::test]
    async fn notify_wake_roundtrip() {
        let wake = std::sync::Arc::new(NotifyWake::new());
        let w2 = wake.clone();
        let handle = tokio::spawn(async move {
            w2.notified().await;
        });
        thread::sleep(Duration::from_millis(10));
        wake.notify().unwrap();
        handle.await.unwrap();
    }
}
