//! Injection machinery: borrowing the broker's socket fds and writing
//! rewritten responses and notifications through them.

pub mod borrow;
pub mod notifier;
pub mod peer;
pub mod rewriter;

use std::io;
use std::os::fd::RawFd;

use crate::error::InjectError;

/// Write a whole message with a single write(2). The hub reads messages as
/// atomic units, so a partial write fails the attempt instead of being
/// resumed.
pub(crate) fn send_data(fd: RawFd, data: &[u8]) -> Result<(), InjectError> {
    let written = unsafe { libc::write(fd, data.as_ptr() as *const libc::c_void, data.len()) };
    if written < 0 {
        return Err(InjectError::Io(io::Error::last_os_error()));
    }
    let written = written as usize;
    if written != data.len() {
        return Err(InjectError::PartialWrite {
            written,
            len: data.len(),
        });
    }
    Ok(())
}
