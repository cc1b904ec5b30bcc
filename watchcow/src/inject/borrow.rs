//! Cross-process fd borrowing via pidfd syscalls.
//!
//! A duplicated fd refers to the same open file description as the target
//! process's own descriptor, so writes through it are indistinguishable to
//! the peer from writes by the target itself. The borrower only hands out
//! descriptors; it never writes.

use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Mutex;

use tracing::debug;

use crate::error::BorrowError;

/// Borrows live fds from foreign processes, memoizing by `(pid, fd)`.
///
/// Cached descriptors are owned by the cache and closed when it drops;
/// `borrow_once` transfers ownership to the caller instead.
#[derive(Debug, Default)]
pub struct FdBorrower {
    cache: Mutex<HashMap<(i32, i32), OwnedFd>>,
}

impl FdBorrower {
    pub fn new() -> Self {
        Self::default()
    }

    /// Verify the kernel supports pidfd_open/pidfd_getfd. Called once at
    /// startup; absence is fatal because nothing can be injected without it.
    pub fn probe_support() -> Result<(), BorrowError> {
        // pidfd_getfd on an invalid pidfd fails with EBADF when the syscall
        // exists and ENOSYS when it does not.
        let ret = unsafe { libc::syscall(libc::SYS_pidfd_getfd, -1, 0, 0) };
        if ret >= 0 {
            return Ok(());
        }
        match io::Error::last_os_error().raw_os_error() {
            Some(libc::ENOSYS) => Err(BorrowError::Unsupported),
            _ => Ok(()),
        }
    }

    /// Borrow a duplicate of `fd` in `pid`, memoized. The returned
    /// descriptor stays owned by the cache; callers must not close it.
    pub fn borrow(&self, pid: i32, fd: i32) -> Result<RawFd, BorrowError> {
        let mut cache = self.cache.lock().unwrap();

        if let Some(cached) = cache.get(&(pid, fd)) {
            if is_valid_fd(cached.as_raw_fd()) {
                return Ok(cached.as_raw_fd());
            }
            debug!(pid, fd, "cached fd went stale, evicting");
            cache.remove(&(pid, fd));
        }

        let duplicated = duplicate(pid, fd)?;
        let raw = duplicated.as_raw_fd();
        cache.insert((pid, fd), duplicated);
        Ok(raw)
    }

    /// Borrow a duplicate without caching. The caller owns the close.
    pub fn borrow_once(&self, pid: i32, fd: i32) -> Result<OwnedFd, BorrowError> {
        duplicate(pid, fd)
    }
}

/// Duplicate `fd` out of `pid` with pidfd_open + pidfd_getfd.
fn duplicate(pid: i32, fd: i32) -> Result<OwnedFd, BorrowError> {
    let pidfd = unsafe { libc::syscall(libc::SYS_pidfd_open, pid, 0) };
    if pidfd < 0 {
        let err = io::Error::last_os_error();
        return Err(match err.raw_os_error() {
            Some(libc::ESRCH) => BorrowError::ProcessGone(pid),
            Some(libc::ENOSYS) => BorrowError::Unsupported,
            Some(libc::EPERM) | Some(libc::EACCES) => BorrowError::Denied { pid, source: err },
            _ => BorrowError::Denied { pid, source: err },
        });
    }
    // Safety: pidfd_open just returned this fd and nothing else owns it.
    let pidfd = unsafe { OwnedFd::from_raw_fd(pidfd as RawFd) };

    let duplicated = unsafe { libc::syscall(libc::SYS_pidfd_getfd, pidfd.as_raw_fd(), fd, 0) };
    if duplicated < 0 {
        let err = io::Error::last_os_error();
        return Err(match err.raw_os_error() {
            Some(libc::EBADF) => BorrowError::FdGone { pid, fd },
            Some(libc::ESRCH) => BorrowError::ProcessGone(pid),
            Some(libc::ENOSYS) => BorrowError::Unsupported,
            _ => BorrowError::Denied { pid, source: err },
        });
    }
    // Safety: as above.
    Ok(unsafe { OwnedFd::from_raw_fd(duplicated as RawFd) })
}

/// Cheap liveness check on a descriptor.
fn is_valid_fd(fd: RawFd) -> bool {
    (unsafe { libc::fcntl(fd, libc::F_GETFD) }) != -1
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_is_valid_fd() {
        let (left, _right) = UnixStream::pair().unwrap();
        assert!(is_valid_fd(left.as_raw_fd()));
        assert!(!is_valid_fd(-1));
        let raw = left.as_raw_fd();
        drop(left);
        assert!(!is_valid_fd(raw));
    }

    #[test]
    fn test_duplicate_from_missing_process() {
        // Nothing can legitimately have this pid.
        let err = duplicate(i32::MAX - 1, 3).unwrap_err();
        assert!(matches!(
            err,
            BorrowError::ProcessGone(_) | BorrowError::Denied { .. } | BorrowError::Unsupported
        ));
    }
}
