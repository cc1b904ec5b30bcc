//! Unix-socket peer resolution via netlink SOCK_DIAG.
//!
//! Given the inode of one end of an AF_UNIX socket, asks the kernel for the
//! inode of the other end, then maps that peer inode back to a process by
//! scanning procfs fd links. The hub-adjacency predicate built on top of
//! this is what decides which of the broker's sockets notifications go
//! through.

use std::path::{Path, PathBuf};

use netlink_sys::{protocols::NETLINK_SOCK_DIAG, Socket, SocketAddr};
use tracing::debug;

use crate::error::PeerError;
use crate::util;

const NLMSG_HDRLEN: usize = 16;
const NLMSG_DONE: u16 = 3;
const NLMSG_ERROR: u16 = 2;
const NLM_F_REQUEST: u16 = 0x0001;
const NLM_F_DUMP: u16 = 0x0300;

const SOCK_DIAG_BY_FAMILY: u16 = 20;
const AF_UNIX: u8 = 1;
/// unix_diag_req.udiag_show flag requesting the peer attribute.
const UDIAG_SHOW_PEER: u32 = 0x0000_0004;
/// rtattr type of the peer-inode attribute.
const UNIX_DIAG_PEER: u16 = 3;
/// unix_diag_msg: family, type, state, pad, ino, cookie[8].
const UNIX_DIAG_MSG_LEN: usize = 16;

const RECV_BUF_LEN: usize = 8192;

/// Resolves socket peers and their owning processes.
#[derive(Debug, Clone)]
pub struct SockPeerFinder {
    proc_root: PathBuf,
}

impl SockPeerFinder {
    pub fn new(proc_root: &Path) -> Self {
        Self {
            proc_root: proc_root.to_path_buf(),
        }
    }

    /// Resolve the peer inode of a connected AF_UNIX socket.
    pub fn peer_inode(&self, inode: u64) -> Result<u64, PeerError> {
        let target = u32::try_from(inode).map_err(|_| PeerError::PeerNotFound(inode))?;
        query_peer_inode(target)
            .map(u64::from)
            .ok_or(PeerError::PeerNotFound(inode))
    }

    /// Find the `(pid, name)` of the process owning a socket inode.
    pub fn process_of_inode(&self, inode: u64) -> Option<(i32, String)> {
        util::find_process_by_inode(&self.proc_root, inode)
    }

    /// Resolve the peer process of a socket inode in one step.
    pub fn peer_process(&self, inode: u64) -> Option<(i32, String)> {
        let peer = self.peer_inode(inode).ok()?;
        if peer == 0 {
            return None;
        }
        self.process_of_inode(peer)
    }
}

/// A socket is hub-adjacent when its peer belongs to the notification hub:
/// the peer process name contains `trim` but not `trim_sac`.
pub fn is_hub_process(name: &str) -> bool {
    name.contains("trim") && !name.contains("trim_sac")
}

/// Dump all AF_UNIX sockets over SOCK_DIAG and pull the peer attribute of
/// the one whose inode matches. Any failure collapses to `None`.
fn query_peer_inode(inode: u32) -> Option<u32> {
    let mut socket = Socket::new(NETLINK_SOCK_DIAG).ok()?;
    socket.bind_auto().ok()?;
    socket.connect(&SocketAddr::new(0, 0)).ok()?;

    socket.send(&build_request(), 0).ok()?;

    let mut buf = vec![0u8; RECV_BUF_LEN];
    loop {
        let len = socket.recv(&mut &mut buf[..], 0).ok()?;
        match scan_dump(&buf[..len], inode) {
            DumpScan::Found(peer) => {
                debug!(inode, peer, "resolved socket peer");
                return Some(peer);
            }
            DumpScan::Done => return None,
            DumpScan::Continue => {}
        }
    }
}

/// nlmsghdr + unix_diag_req requesting a peer-info dump of every AF_UNIX
/// socket.
fn build_request() -> [u8; 40] {
    let mut req = [0u8; 40];

    // nlmsghdr
    req[0..4].copy_from_slice(&40u32.to_ne_bytes()); // nlmsg_len
    req[4..6].copy_from_slice(&SOCK_DIAG_BY_FAMILY.to_ne_bytes()); // nlmsg_type
    req[6..8].copy_from_slice(&(NLM_F_REQUEST | NLM_F_DUMP).to_ne_bytes()); // nlmsg_flags
    req[8..12].copy_from_slice(&1u32.to_ne_bytes()); // nlmsg_seq
    req[12..16].copy_from_slice(&0u32.to_ne_bytes()); // nlmsg_pid

    // unix_diag_req
    req[16] = AF_UNIX; // sdiag_family
    req[17] = 0; // sdiag_protocol
    // req[18..20]: pad
    req[20..24].copy_from_slice(&u32::MAX.to_ne_bytes()); // udiag_states: all
    req[24..28].copy_from_slice(&0u32.to_ne_bytes()); // udiag_ino: dump
    req[28..32].copy_from_slice(&UDIAG_SHOW_PEER.to_ne_bytes()); // udiag_show
    // req[32..40]: cookie, zeroed

    req
}

#[derive(Debug, PartialEq, Eq)]
enum DumpScan {
    /// The matching socket was found and carried a peer attribute.
    Found(u32),
    /// The dump ended (NLMSG_DONE or NLMSG_ERROR) without a match.
    Done,
    /// This datagram is exhausted; keep receiving.
    Continue,
}

fn align4(len: usize) -> usize {
    (len + 3) & !3
}

fn read_u16(buf: &[u8], at: usize) -> Option<u16> {
    Some(u16::from_ne_bytes([*buf.get(at)?, *buf.get(at + 1)?]))
}

fn read_u32(buf: &[u8], at: usize) -> Option<u32> {
    Some(u32::from_ne_bytes([
        *buf.get(at)?,
        *buf.get(at + 1)?,
        *buf.get(at + 2)?,
        *buf.get(at + 3)?,
    ]))
}

/// Walk the netlink messages in one received datagram.
fn scan_dump(buf: &[u8], target_inode: u32) -> DumpScan {
    let mut offset = 0;

    while offset + NLMSG_HDRLEN <= buf.len() {
        let Some(msg_len) = read_u32(buf, offset).map(|l| l as usize) else {
            break;
        };
        let Some(msg_type) = read_u16(buf, offset + 4) else {
            break;
        };
        if msg_len < NLMSG_HDRLEN || offset + msg_len > buf.len() {
            break;
        }

        match msg_type {
            NLMSG_DONE | NLMSG_ERROR => return DumpScan::Done,
            SOCK_DIAG_BY_FAMILY => {
                let diag = offset + NLMSG_HDRLEN;
                if let Some(ino) = read_u32(buf, diag + 4) {
                    if ino == target_inode {
                        let attrs = &buf[diag + UNIX_DIAG_MSG_LEN..offset + msg_len];
                        if let Some(peer) = find_peer_attr(attrs) {
                            return DumpScan::Found(peer);
                        }
                        // Matching socket without a peer attribute: it has
                        // no connected peer. The dump cannot match twice.
                        return DumpScan::Done;
                    }
                }
            }
            _ => {}
        }

        offset += align4(msg_len);
    }

    DumpScan::Continue
}

/// Iterate rtattrs and return the UNIX_DIAG_PEER payload.
fn find_peer_attr(attrs: &[u8]) -> Option<u32> {
    let mut offset = 0;

    while offset + 4 <= attrs.len() {
        let attr_len = read_u16(attrs, offset)? as usize;
        let attr_type = read_u16(attrs, offset + 2)?;
        if attr_len < 4 || offset + attr_len > attrs.len() {
            return None;
        }

        if attr_type == UNIX_DIAG_PEER && attr_len >= 8 {
            return read_u32(attrs, offset + 4);
        }

        offset += align4(attr_len);
    }

    None
}
