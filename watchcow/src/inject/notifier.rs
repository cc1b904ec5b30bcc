//! Out-of-band notification injection.
//!
//! On a container state transition, builds the hub's binary-framed
//! notification and broadcasts it through every hub-adjacent socket of the
//! broker. Each write goes through a fresh uncached fd borrow that is
//! closed immediately after.

use std::fs;
use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};

use crate::codec::notify;
use crate::error::InjectError;
use crate::inject::borrow::FdBorrower;
use crate::inject::peer::{is_hub_process, SockPeerFinder};
use crate::inject::send_data;
use crate::record::ContainerState;
use crate::util::{self, UnixSocketRow};

/// Sends container state notifications through the broker's sockets.
#[derive(Debug)]
pub struct Notifier {
    borrower: Arc<FdBorrower>,
    peers: SockPeerFinder,
    proc_root: PathBuf,
}

impl Notifier {
    pub fn new(borrower: Arc<FdBorrower>, peers: SockPeerFinder, proc_root: PathBuf) -> Self {
        Self {
            borrower,
            peers,
            proc_root,
        }
    }

    /// Broadcast one state transition. Succeeds when at least one
    /// hub-adjacent socket accepted the whole message; the count of
    /// successful writes is returned.
    pub fn notify(
        &self,
        pid: i32,
        app_name: &str,
        state: ContainerState,
    ) -> Result<usize, InjectError> {
        let message = notify::encode(app_name, state, Utc::now().timestamp() as u32)?;

        let fds = self.candidate_fds(pid)?;
        if fds.is_empty() {
            return Err(InjectError::NoSocket(pid));
        }
        debug!(pid, candidates = fds.len(), "notification fd candidates");

        let mut sent = 0;
        for fd in fds {
            match self.send_one(pid, fd, &message) {
                Ok(()) => sent += 1,
                Err(e) => warn!(pid, fd, error = %e, "notification write failed"),
            }
        }

        if sent == 0 {
            return Err(InjectError::NoSocket(pid));
        }
        Ok(sent)
    }

    /// The broker fds worth broadcasting through: anonymous Unix sockets,
    /// connected or connecting, whose peer is the hub.
    fn candidate_fds(&self, pid: i32) -> Result<Vec<u32>, InjectError> {
        let fds = util::socket_fds_of(&self.proc_root, pid)?;
        let net_unix = fs::read_to_string(
            self.proc_root.join(pid.to_string()).join("net").join("unix"),
        )?;
        let rows = util::parse_net_unix(&net_unix);

        Ok(select_candidates(&fds, &rows, |inode| {
            self.peers.peer_process(inode)
        }))
    }

    fn send_one(&self, pid: i32, fd: u32, message: &[u8]) -> Result<(), InjectError> {
        let borrowed = self.borrower.borrow_once(pid, fd as i32)?;
        send_data(borrowed.as_raw_fd(), message)
        // borrowed drops here, closing the duplicate
    }
}

/// The selection rule, split out from the procfs plumbing: keep the fds
/// whose socket row is connected (state 01) or connecting (state 03) and
/// whose resolved peer process is the hub.
pub fn select_candidates(
    fds: &[(u32, u64)],
    rows: &[UnixSocketRow],
    resolve_peer: impl Fn(u64) -> Option<(i32, String)>,
) -> Vec<u32> {
    let mut selected = Vec::new();

    for &(fd, inode) in fds {
        let Some(row) = rows.iter().find(|r| r.inode == inode) else {
            continue;
        };
        if !row.is_connected() {
            continue;
        }
        let Some((peer_pid, peer_name)) = resolve_peer(inode) else {
            continue;
        };
        if is_hub_process(&peer_name) {
            debug!(fd, inode, peer_pid, peer = %peer_name, "hub-adjacent socket");
            selected.push(fd);
        }
    }

    selected
}
