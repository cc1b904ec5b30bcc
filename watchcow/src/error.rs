//! Typed error kinds for the capture and injection pipeline.
//!
//! Everything below the orchestrator returns these and never aborts the
//! process after startup; the orchestrator logs and continues.

use std::io;

use thiserror::Error;

/// Errors from parsing or emitting the wire dialects.
///
/// All of these are non-fatal: the payload is dropped and capture continues.
#[derive(Debug, Error)]
pub enum CodecError {
    /// No JSON object found in the payload.
    #[error("no JSON object found in payload")]
    NotJson,

    /// The payload failed app-list re-verification in userspace.
    #[error("payload failed app-list re-verification")]
    NotAppList,

    /// A declared payload length is inconsistent with the buffer.
    #[error("declared payload length inconsistent with buffer: {0}")]
    BadLength(String),

    /// A frame header could not be parsed.
    #[error("malformed frame: {0}")]
    BadFrame(String),

    /// JSON (de)serialization failure.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors from Unix-socket peer resolution.
///
/// Every netlink failure collapses into `PeerNotFound`; the caller either
/// retries with the next candidate fd or gives up for this notification.
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("peer inode not found for inode {0}")]
    PeerNotFound(u64),
}

/// Errors from cross-process fd duplication.
#[derive(Debug, Error)]
pub enum BorrowError {
    /// The target process no longer exists.
    #[error("process {0} is gone")]
    ProcessGone(i32),

    /// The target descriptor closed before we could duplicate it.
    #[error("fd {fd} of process {pid} is gone")]
    FdGone { pid: i32, fd: i32 },

    /// Insufficient capability to duplicate fds from the target.
    #[error("fd duplication denied for pid {pid}: {source}")]
    Denied {
        pid: i32,
        #[source]
        source: io::Error,
    },

    /// The kernel lacks pidfd_open/pidfd_getfd. Fatal at startup.
    #[error("kernel lacks pidfd_open/pidfd_getfd support")]
    Unsupported,
}

/// Errors from writing a rewritten response or a notification.
#[derive(Debug, Error)]
pub enum InjectError {
    /// The single write() did not cover the whole message. The attempt
    /// fails; there is no automatic retry.
    #[error("partial write: {written}/{len} bytes")]
    PartialWrite { written: usize, len: usize },

    /// No usable socket fd could be found on the target process.
    #[error("no usable socket fd found for pid {0}")]
    NoSocket(i32),

    #[error("write failed: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Borrow(#[from] BorrowError),

    #[error(transparent)]
    Codec(#[from] CodecError),
}
