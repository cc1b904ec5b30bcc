//! In-flight app-list response rewriting.
//!
//! The kernel probe has already scrambled the broker's own send, so the
//! rewrite is authoritative: the hub only ever sees a correctly-correlated
//! app list if this write succeeds.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::codec::applist;
use crate::error::InjectError;
use crate::inject::borrow::FdBorrower;
use crate::inject::send_data;
use crate::record::AppRecord;

/// Rewrites captured app-list responses and sends them through a borrowed
/// duplicate of the broker's socket fd.
#[derive(Debug)]
pub struct AppStoreRewriter {
    borrower: Arc<FdBorrower>,
    proc_root: PathBuf,
    /// Highest fd tried by the fallback scan when the captured fd has
    /// already closed.
    fallback_fd_max: u32,
}

impl AppStoreRewriter {
    pub fn new(borrower: Arc<FdBorrower>, proc_root: PathBuf, fallback_fd_max: u32) -> Self {
        Self {
            borrower,
            proc_root,
            fallback_fd_max,
        }
    }

    /// Merge `records` into the captured payload and write the result back
    /// through the broker's socket. Returns the correlation id on success.
    pub fn inject(
        &self,
        pid: i32,
        fd: i32,
        payload: &[u8],
        records: &[AppRecord],
    ) -> Result<String, InjectError> {
        let rewrite = applist::merge_records(payload, records)?;

        match self.borrower.borrow(pid, fd) {
            Ok(borrowed) => {
                send_data(borrowed, &rewrite.bytes)?;
                Ok(rewrite.reqid)
            }
            Err(primary) => {
                // The captured fd may have closed between the syscall and
                // now; scan low-numbered fds for any Unix socket and retry
                // once on each candidate.
                debug!(pid, fd, error = %primary, "borrow by number failed, scanning");
                self.inject_via_scan(pid, &rewrite.bytes)?;
                Ok(rewrite.reqid)
            }
        }
    }

    fn inject_via_scan(&self, pid: i32, message: &[u8]) -> Result<(), InjectError> {
        for fd in 3..=self.fallback_fd_max {
            if !self.looks_like_unix_socket(pid, fd) {
                continue;
            }
            let Ok(borrowed) = self.borrower.borrow(pid, fd as i32) else {
                continue;
            };
            match send_data(borrowed, message) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(pid, fd, error = %e, "fallback write failed");
                    continue;
                }
            }
        }
        Err(InjectError::NoSocket(pid))
    }

    fn looks_like_unix_socket(&self, pid: i32, fd: u32) -> bool {
        let link = self
            .proc_root
            .join(pid.to_string())
            .join("fd")
            .join(fd.to_string());
        match fs::read_link(link) {
            Ok(target) => {
                let target = target.to_string_lossy();
                target.starts_with("socket:[") || target.contains("trim_sac.socket")
            }
            Err(_) => false,
        }
    }
}
