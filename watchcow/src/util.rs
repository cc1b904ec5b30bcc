//! /proc parsing helpers shared across the injection path.

use std::fs;
use std::io;
use std::path::Path;

/// Extract the binary name from raw `/proc/<pid>/cmdline` content: the
/// basename of the first null-delimited token.
pub fn process_name_of_cmdline(cmdline: &[u8]) -> Option<String> {
    let first = cmdline.split(|&b| b == 0).next()?;
    if first.is_empty() {
        return None;
    }
    let token = String::from_utf8_lossy(first);
    let name = token.rsplit('/').next().unwrap_or(&token);
    Some(name.to_string())
}

/// Scan a procfs root for the first process whose cmdline contains every
/// marker substring.
pub fn find_process_by_cmdline(proc_root: &Path, markers: &[&str]) -> Option<i32> {
    let entries = fs::read_dir(proc_root).ok()?;

    for entry in entries.flatten() {
        let name = entry.file_name();
        let Ok(pid) = name.to_string_lossy().parse::<i32>() else {
            continue;
        };

        let Ok(cmdline) = fs::read(proc_root.join(pid.to_string()).join("cmdline")) else {
            continue;
        };
        let cmdline = String::from_utf8_lossy(&cmdline).replace('\0', " ");

        if markers.iter().all(|m| cmdline.contains(m)) {
            return Some(pid);
        }
    }

    None
}

/// Parse the inode out of a `socket:[12345]` readlink target.
pub fn socket_inode(link_target: &str) -> Option<u64> {
    let inner = link_target
        .strip_prefix("socket:[")?
        .strip_suffix(']')?;
    inner.parse().ok()
}

/// List the anonymous Unix-socket fds of a process as `(fd, inode)` pairs.
/// Filesystem-path sockets do not appear here: their links are plain paths,
/// not `socket:[inode]` targets with entries in /proc/net/unix.
pub fn socket_fds_of(proc_root: &Path, pid: i32) -> io::Result<Vec<(u32, u64)>> {
    let fd_dir = proc_root.join(pid.to_string()).join("fd");
    let mut fds = Vec::new();

    for entry in fs::read_dir(fd_dir)?.flatten() {
        let Ok(fd) = entry.file_name().to_string_lossy().parse::<u32>() else {
            continue;
        };
        // stdin/stdout/stderr are never the broker's hub channel
        if fd < 3 {
            continue;
        }
        let Ok(target) = fs::read_link(entry.path()) else {
            continue;
        };
        if let Some(inode) = socket_inode(&target.to_string_lossy()) {
            fds.push((fd, inode));
        }
    }

    Ok(fds)
}

/// One row of /proc/net/unix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnixSocketRow {
    pub inode: u64,
    /// Two-hex-digit socket state: 01 = SS_CONNECTED, 03 = SS_CONNECTING,
    /// 0A = SS_LISTENING, ...
    pub state: String,
    pub path: Option<String>,
}

impl UnixSocketRow {
    /// Connected or in the middle of connecting.
    pub fn is_connected(&self) -> bool {
        self.state == "01" || self.state == "03"
    }
}

/// Parse /proc/net/unix content.
/// Format: Num RefCount Protocol Flags Type St Inode Path
pub fn parse_net_unix(content: &str) -> Vec<UnixSocketRow> {
    let mut rows = Vec::new();

    for line in content.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 7 {
            continue;
        }
        let Ok(inode) = fields[6].parse::<u64>() else {
            continue;
        };
        rows.push(UnixSocketRow {
            inode,
            state: fields[5].to_string(),
            path: fields.get(7).map(|s| s.to_string()),
        });
    }

    rows
}

/// Find the process owning a socket inode by scanning every fd link under
/// the given procfs root. Returns `(pid, process name)`.
pub fn find_process_by_inode(proc_root: &Path, inode: u64) -> Option<(i32, String)> {
    let target = format!("socket:[{}]", inode);
    let entries = fs::read_dir(proc_root).ok()?;

    for entry in entries.flatten() {
        let name = entry.file_name();
        let Ok(pid) = name.to_string_lossy().parse::<i32>() else {
            continue;
        };

        let fd_dir = proc_root.join(pid.to_string()).join("fd");
        let Ok(fd_entries) = fs::read_dir(fd_dir) else {
            continue;
        };

        for fd_entry in fd_entries.flatten() {
            let Ok(link) = fs::read_link(fd_entry.path()) else {
                continue;
            };
            if link.to_string_lossy() == target {
                let name = fs::read(proc_root.join(pid.to_string()).join("cmdline"))
                    .ok()
                    .and_then(|raw| process_name_of_cmdline(&raw))
                    .unwrap_or_default();
                return Some((pid, name));
            }
        }
    }

    None
}

/// Format a payload as a 16-bytes-per-line hex dump with an ASCII gutter.
pub fn hex_dump(data: &[u8]) -> String {
    let mut out = String::new();

    for (offset, chunk) in data.chunks(16).enumerate() {
        let hex: Vec<String> = chunk.iter().map(|b| format!("{:02x}", b)).collect();
        let ascii: String = chunk
            .iter()
            .map(|&b| if (32..=126).contains(&b) { b as char } else { '.' })
            .collect();
        out.push_str(&format!(
            "  {:04x} | {:<48} | {}\n",
            offset * 16,
            hex.join(" "),
            ascii
        ));
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_name_of_cmdline() {
        assert_eq!(
            process_name_of_cmdline(b"/usr/trim/bin/trim_sac\0--flag\0"),
            Some("trim_sac".to_string())
        );
        assert_eq!(
            process_name_of_cmdline(b"nginx\0"),
            Some("nginx".to_string())
        );
        assert_eq!(process_name_of_cmdline(b""), None);
    }

    #[test]
    fn test_socket_inode() {
        assert_eq!(socket_inode("socket:[12345]"), Some(12345));
        assert_eq!(socket_inode("/var/run/trim_sac.socket"), None);
        assert_eq!(socket_inode("pipe:[999]"), None);
        assert_eq!(socket_inode("socket:[abc]"), None);
    }

    #[test]
    fn test_parse_net_unix() {
        let content = "\
Num       RefCount Protocol Flags    Type St Inode Path
0000000000000000: 00000002 00000000 00010000 0001 01 34567 /run/systemd/journal/stdout
0000000000000000: 00000002 00000000 00000000 0001 01 40001
0000000000000000: 00000002 00000000 00010000 0001 0A 40002 /var/run/trim_sac.socket
bogus line
";
        let rows = parse_net_unix(content);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].inode, 34567);
        assert_eq!(
            rows[0].path.as_deref(),
            Some("/run/systemd/journal/stdout")
        );
        assert!(rows[0].is_connected());
        assert_eq!(rows[1].inode, 40001);
        assert_eq!(rows[1].path, None);
        assert_eq!(rows[2].state, "0A");
        assert!(!rows[2].is_connected());
    }

    #[test]
    fn test_hex_dump() {
        let dump = hex_dump(b"{\"data\":1}");
        assert!(dump.contains("0000"));
        assert!(dump.contains("7b 22 64 61 74 61 22 3a 31 7d"));
        assert!(dump.contains("{\"data\":1}"));
    }
}
