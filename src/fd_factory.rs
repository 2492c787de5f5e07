//! Descriptor creation with close-on-exec guaranteed on return.
//!
//! Prefers the atomic kernel variant (`pipe2`, `socket(..|SOCK_CLOEXEC)`,
//! `accept4`) and falls back to gate + base syscall + `fcntl(F_SETFD)` on
//! paths where no atomic variant is used.

use crate::cloexec::CloexecGate;
use anyhow::{Context, Result};
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::sys::socket::{
    accept4, socket, AddressFamily, SockFlag, SockProtocol, SockType,
};
use nix::unistd::{close, pipe2};
use std::os::unix::io::RawFd;

#[cfg(test)]
use mockall::automock;

/// The one syscall in the gated fallback path the spec calls out as the
/// failure point worth injecting deterministically: "on failure of the
/// flag-setting step the descriptor is closed and the error is surfaced".
/// Mirrors the `InitImpl`/`MockInitImpl` seam shape used elsewhere in this
/// lineage for syscalls that are otherwise impractical to fail on demand.
#[cfg_attr(test, automock)]
trait FlagSetter {
    fn set_cloexec(&self, fd: RawFd) -> nix::Result<()>;
}

struct RealFlagSetter;

impl FlagSetter for RealFlagSetter {
    fn set_cloexec(&self, fd: RawFd) -> nix::Result<()> {
        fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)).map(|_| ())
    }
}

/// Creates a pipe with both ends close-on-exec, via the atomic `pipe2` syscall.
pub fn pipe_cloexec() -> Result<(RawFd, RawFd)> {
    pipe2(nix::fcntl::OFlag::O_CLOEXEC).context("pipe2")
}

/// Creates a pipe the same way `pipe_cloexec` does, but through the gated
/// fallback path (base `pipe()` + `fcntl(F_SETFD)` under `CloexecGate`),
/// mirroring the non-atomic branch of the original implementation. Kept and
/// tested directly rather than as unreachable portability code.
pub fn pipe_cloexec_gated() -> Result<(RawFd, RawFd)> {
    let _gate = CloexecGate::lock()?;
    let (r, w) = nix::unistd::pipe().context("pipe")?;
    if let Err(e) = set_cloexec(r) {
        let _ = close(r);
        let _ = close(w);
        return Err(e).context("set close-on-exec on read end");
    }
    if let Err(e) = set_cloexec(w) {
        let _ = close(r);
        let _ = close(w);
        return Err(e).context("set close-on-exec on write end");
    }
    Ok((r, w))
}

/// Creates a socket with close-on-exec set, via `socket(..|SOCK_CLOEXEC)`.
pub fn socket_cloexec(
    domain: AddressFamily,
    ty: SockType,
    protocol: SockProtocol,
) -> Result<RawFd> {
    socket(domain, ty, SockFlag::SOCK_CLOEXEC, protocol).context("socket")
}

/// Gated fallback equivalent of `socket_cloexec`.
pub fn socket_cloexec_gated(
    domain: AddressFamily,
    ty: SockType,
    protocol: SockProtocol,
) -> Result<RawFd> {
    let _gate = CloexecGate::lock()?;
    let fd = socket(domain, ty, SockFlag::empty(), protocol).context("socket")?;
    if let Err(e) = set_cloexec(fd) {
        let _ = close(fd);
        return Err(e).context("set close-on-exec on socket");
    }
    Ok(fd)
}

/// Accepts a connection with close-on-exec set, via the atomic `accept4`
/// syscall. The listener is expected to be non-blocking; `accept4` may still
/// block briefly under contention the same way the gated fallback does.
pub fn accept_cloexec(listener: RawFd) -> Result<RawFd> {
    accept4(listener, SockFlag::SOCK_CLOEXEC).context("accept4")
}

/// Gated fallback equivalent of `accept_cloexec`, using plain `accept()`.
pub fn accept_cloexec_gated(listener: RawFd) -> Result<RawFd> {
    let _gate = CloexecGate::lock()?;
    let fd = nix::sys::socket::accept(listener).context("accept")?;
    if let Err(e) = set_cloexec_with(&RealFlagSetter, fd) {
        let _ = close(fd);
        return Err(e).context("set close-on-exec on accepted socket");
    }
    Ok(fd)
}

fn set_cloexec(fd: RawFd) -> Result<()> {
    set_cloexec_with(&RealFlagSetter, fd)
}

fn set_cloexec_with(setter: &dyn FlagSetter, fd: RawFd) -> Result<()> {
    setter.set_cloexec(fd).context("fcntl F_SETFD")?;
    Ok(())
}

fn is_cloexec(fd: RawFd) -> bool {
    match fcntl(fd, FcntlArg::F_GETFD) {
        Ok(flags) => FdFlag::from_bits_truncate(flags).contains(FdFlag::FD_CLOEXEC),
        Err(_) => false,
    }
}
