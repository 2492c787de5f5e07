//! Portable-enough spawn helper: fork+exec with an error-reporting pipe (the
//! only path this crate implements, since `posix_spawnp` behaves correctly
//! everywhere except the platform this guards against), fd hygiene via the
//! `CloexecGate`, privilege drop, signal handler install, and CPU count.

use crate::cloexec::CloexecGate;
use anyhow::{bail, Context, Result};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::signal::{sigaction, SigAction, SigHandler, SigSet, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{
    close, dup2, execvp, fork, initgroups, pipe2, read, setgid, setuid, write, ForkResult, Pid,
    User,
};
use std::ffi::CString;
use std::os::unix::io::RawFd;

/// A `(source_fd, target_fd)` pair applied in the child before exec: the
/// source is duplicated onto the target, then closed.
#[derive(Debug, Clone, Copy)]
pub struct RawFdMapping {
    pub source_fd: RawFd,
    pub target_fd: RawFd,
}

/// Spawns `cmd` with `argv`, applying `fd_map` in the child. If
/// `gate_already_held` is false, acquires the `CloexecGate` for the
/// fork/spawn window. On exec failure, returns the child's errno rather than
/// a live pid; the zombie is reaped before returning.
pub fn spawn(
    cmd: &str,
    argv: &[String],
    fd_map: &[RawFdMapping],
    gate_already_held: bool,
) -> Result<Pid> {
    let (read_fd, write_fd) = pipe2(OFlag::O_CLOEXEC).context("create error-reporting pipe")?;

    let _gate = if gate_already_held {
        None
    } else {
        Some(CloexecGate::lock()?)
    };

    // Safety: the child only calls async-signal-safe functions (dup2, close,
    // execvp, write, _exit) between fork and exec/exit.
    match unsafe { fork() }.context("fork")? {
        ForkResult::Child => {
            let _ = close(read_fd);
            child_exec(cmd, argv, fd_map, write_fd);
            // child_exec never returns normally.
            std::process::exit(127);
        }
        ForkResult::Parent { child } => {
            drop(_gate);
            let _ = close(write_fd);

            let mut buf = [0u8; 4];
            let mut total = 0;
            loop {
                match read(read_fd, &mut buf[total..]) {
                    Ok(0) => break,
                    Ok(n) => {
                        total += n;
                        if total == buf.len() {
                            break;
                        }
                    }
                    Err(Errno::EINTR) => continue,
                    Err(e) => {
                        let _ = close(read_fd);
                        return Err(e).context("read error-reporting pipe");
                    }
                }
            }
            let _ = close(read_fd);

            if total > 0 {
                let errno = i32::from_ne_bytes(buf);
                let _ = waitpid(child, None);
                bail!("exec failed: {}", Errno::from_i32(errno));
            }

            Ok(child)
        }
    }
}

/// Runs in the child after fork. Applies fd mappings, augments the
/// environment with `H2O_ROOT` if absent, execs, and on failure writes its
/// errno to `error_pipe` before exiting.
///
/// Not strictly async-signal-safe (env/CString allocate); same tradeoff
/// `std::process::Command::pre_exec` callers accept in practice.
fn child_exec(cmd: &str, argv: &[String], fd_map: &[RawFdMapping], error_pipe: RawFd) {
    for mapping in fd_map {
        if mapping.target_fd != -1 && mapping.source_fd != mapping.target_fd {
            if dup2(mapping.source_fd, mapping.target_fd).is_err() {
                report_and_exit(error_pipe, Errno::last() as i32);
            }
        }
        let _ = close(mapping.source_fd);
    }

    augment_root_env();

    let cmd_c = match CString::new(cmd) {
        Ok(c) => c,
        Err(_) => report_and_exit(error_pipe, libc::EINVAL),
    };
    let argv_c: Vec<CString> = argv
        .iter()
        .map(|a| CString::new(a.as_str()).unwrap_or_else(|_| CString::new("").unwrap()))
        .collect();

    // execvp only returns on failure.
    let _ = execvp(&cmd_c, &argv_c);
    report_and_exit(error_pipe, Errno::last() as i32);
}

fn report_and_exit(error_pipe: RawFd, errno: i32) -> ! {
    let bytes = errno.to_ne_bytes();
    let _ = write(error_pipe, &bytes);
    std::process::exit(127);
}

/// If `H2O_ROOT` (this crate's equivalent of the original's installation-root
/// variable) is not already present in the environment, sets it to the
/// current executable's directory. A no-op when already present.
fn augment_root_env() {
    if std::env::var_os("H2O_ROOT").is_some() {
        return;
    }
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            std::env::set_var("H2O_ROOT", dir);
        }
    }
}

/// Spawns `cmd`, captures its stdout until EOF, and waits for exit. Returns
/// the captured bytes and the raw wait status code.
pub fn run_command(cmd: &str, argv: &[String]) -> Result<(Vec<u8>, i32)> {
    let (resp_read, resp_write) = pipe2(OFlag::empty()).context("create response pipe")?;
    nix::fcntl::fcntl(
        resp_read,
        nix::fcntl::FcntlArg::F_SETFD(nix::fcntl::FdFlag::FD_CLOEXEC),
    )
    .context("set close-on-exec on response pipe read end")?;

    let _gate = CloexecGate::lock()?;
    let pid = spawn(
        cmd,
        argv,
        &[RawFdMapping {
            source_fd: resp_write,
            target_fd: 1,
        }],
        true,
    );
    let _ = close(resp_write);
    drop(_gate);
    let pid = pid?;

    let mut out = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        match read(resp_read, &mut chunk) {
            Ok(0) => break,
            Ok(n) => out.extend_from_slice(&chunk[..n]),
            Err(Errno::EINTR) => continue,
            Err(e) => {
                let _ = close(resp_read);
                return Err(e).context("read child output");
            }
        }
    }
    let _ = close(resp_read);

    let status = match waitpid(pid, None).context("waitpid")? {
        WaitStatus::Exited(_, code) => code,
        WaitStatus::Signaled(_, signal, _) => -(signal as i32),
        other => bail!("unexpected wait status: {:?}", other),
    };

    Ok((out, status))
}

/// Drops privileges to `user`: resolves the user record, then sets group,
/// then supplementary groups, then uid, in that order. Every branch returns
/// a proper success/failure indicator (the original's non-POSIX branch did
/// not; this is the one implemented branch here and it always does).
/// Privilege drops are one-way: a failure partway through is reported, not
/// rolled back.
pub fn setuidgid(user: &str) -> Result<()> {
    let record = User::from_name(user)
        .context("look up user")?
        .with_context(|| format!("no such user: {user}"))?;

    setgid(record.gid).context("setgid")?;

    let user_c = CString::new(user).context("user name contains NUL")?;
    initgroups(&user_c, record.gid).context("initgroups")?;

    setuid(record.uid).context("setuid")?;

    Ok(())
}

/// Installs `handler` for `signal` with an empty signal mask and no special
/// flags (synchronous delivery, matching `sigaction`'s plain-vanilla use).
pub fn set_signal_handler(signal: Signal, handler: SigHandler) -> Result<()> {
    let action = SigAction::new(handler, nix::sys::signal::SaFlags::empty(), SigSet::empty());
    unsafe { sigaction(signal, &action) }.context("sigaction")?;
    Ok(())
}

/// Number of available processors, falling back to 1 if undetectable.
pub fn num_cpus() -> usize {
    num_cpus::get()
}
