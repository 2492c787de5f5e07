//! Parses the `$SERVER_STARTER_PORT` environment variable into the set of
//! file descriptors a supervising server-starter process pre-bound and
//! handed down to this one.

use std::fmt;
use std::os::unix::io::RawFd;

/// Failure parsing `SERVER_STARTER_PORT`. The variable was present but
/// malformed, or present but empty.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MalformedServerStarterPort;

impl fmt::Display for MalformedServerStarterPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "malformed SERVER_STARTER_PORT")
    }
}

impl std::error::Error for MalformedServerStarterPort {}

/// Reads `SERVER_STARTER_PORT` from `name=fd` entries separated by `;`.
/// Returns `Ok(vec![])` when the variable is unset. An empty value, or any
/// entry missing `=` or with a non-numeric fd, is an error.
pub fn server_starter_fds(value: Option<&str>) -> Result<Vec<RawFd>, MalformedServerStarterPort> {
    let value = match value {
        None => return Ok(Vec::new()),
        Some(v) => v,
    };
    if value.is_empty() {
        return Err(MalformedServerStarterPort);
    }

    let mut fds = Vec::new();
    for entry in value.split(';') {
        let (_addr, fd) = entry
            .split_once('=')
            .ok_or(MalformedServerStarterPort)?;
        let fd: RawFd = fd.parse().map_err(|_| MalformedServerStarterPort)?;
        fds.push(fd);
    }
    Ok(fds)
}

/// Convenience wrapper reading directly from the process environment.
pub fn server_starter_fds_from_env() -> Result<Vec<RawFd>, MalformedServerStarterPort> {
    server_starter_fds(std::env::var("SERVER_STARTER_PORT").ok().as_deref())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_returns_empty() {
        assert_eq!(server_starter_fds(None).unwrap(), Vec::<RawFd>::new());
    }

    #[test]
    fn empty_is_error() {
        assert!(server_starter_fds(Some("")).is_err());
    }

    #[test]
    fn single_entry() {
        assert_eq!(server_starter_fds(Some("a=3")).unwrap(), vec![3]);
    }

    #[test]
    fn multiple_entries() {
        assert_eq!(server_starter_fds(Some("a=3;b=4")).unwrap(), vec![3, 4]);
    }

    #[test]
    fn missing_equals_is_error() {
        assert!(server_starter_fds(Some("a")).is_err());
    }

    #[test]
    fn non_numeric_fd_is_error() {
        assert!(server_starter_fds(Some("a=x")).is_err());
    }
}
