//! TOML-based runtime configuration.
//!
//! Every field has a serde default, so the daemon runs without a config file
//! and nothing is ever persisted back to disk.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

const DEFAULT_TARGET_COMM: &str = "trim_sac";
const DEFAULT_EBPF_OBJECT: &str = "/usr/lib/watchcow/watchcow_ebpf.o";
const DEFAULT_PROC_ROOT: &str = "/proc";
const DEFAULT_HOST_PROC_ROOT: &str = "/host/proc";
const DEFAULT_DEDUP_SUPPRESS_SECS: u64 = 5;
const DEFAULT_DEDUP_EVICT_SECS: u64 = 60;
const DEFAULT_DOCKER_BACKOFF_SECS: u64 = 5;
const DEFAULT_MIN_PAYLOAD_LEN: usize = 20;
const DEFAULT_FALLBACK_FD_MAX: u32 = 12;

/// Substrings a process cmdline must contain to be recognized as the shell
/// broker when no capture event has revealed its pid yet.
pub const SAC_CMDLINE_MARKERS: &[&str] = &["/usr/trim/bin/", "trim_sac"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Process comm the capture probe filters on.
    #[serde(default = "default_target_comm")]
    pub target_comm: String,

    /// Path to the compiled eBPF object (`cargo xtask build-ebpf` output).
    #[serde(default = "default_ebpf_object")]
    pub ebpf_object: PathBuf,

    /// procfs mount used for fd and cmdline inspection.
    #[serde(default = "default_proc_root")]
    pub proc_root: PathBuf,

    /// Host procfs bind-mount, preferred when present (containerized runs).
    #[serde(default = "default_host_proc_root")]
    pub host_proc_root: PathBuf,

    /// A request id seen again within this window is suppressed.
    #[serde(default = "default_dedup_suppress_secs")]
    pub dedup_suppress_secs: u64,

    /// Dedup entries older than this are evicted after a successful rewrite.
    #[serde(default = "default_dedup_evict_secs")]
    pub dedup_evict_secs: u64,

    /// Reconnect backoff for the Docker event stream.
    #[serde(default = "default_docker_backoff_secs")]
    pub docker_backoff_secs: u64,

    /// Captured writes at or below this size are ignored (keepalive noise).
    #[serde(default = "default_min_payload_len")]
    pub min_payload_len: usize,

    /// Highest fd number tried when the captured fd has already closed.
    #[serde(default = "default_fallback_fd_max")]
    pub fallback_fd_max: u32,

    /// Verbose payload logging (hex dumps, frame classification).
    #[serde(default)]
    pub debug: bool,
}

fn default_target_comm() -> String {
    DEFAULT_TARGET_COMM.to_string()
}

fn default_ebpf_object() -> PathBuf {
    PathBuf::from(DEFAULT_EBPF_OBJECT)
}

fn default_proc_root() -> PathBuf {
    PathBuf::from(DEFAULT_PROC_ROOT)
}

fn default_host_proc_root() -> PathBuf {
    PathBuf::from(DEFAULT_HOST_PROC_ROOT)
}

fn default_dedup_suppress_secs() -> u64 {
    DEFAULT_DEDUP_SUPPRESS_SECS
}

fn default_dedup_evict_secs() -> u64 {
    DEFAULT_DEDUP_EVICT_SECS
}

fn default_docker_backoff_secs() -> u64 {
    DEFAULT_DOCKER_BACKOFF_SECS
}

fn default_min_payload_len() -> usize {
    DEFAULT_MIN_PAYLOAD_LEN
}

fn default_fallback_fd_max() -> u32 {
    DEFAULT_FALLBACK_FD_MAX
}

impl Default for Config {
    fn default() -> Self {
        // A Config with every field defaulted; the empty document is valid.
        toml::from_str("").expect("empty config must deserialize")
    }
}

impl Config {
    /// Load from a TOML file, falling back to defaults if the file is
    /// missing or malformed.
    pub fn load_or_default(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => config,
                Err(e) => {
                    warn!("failed to parse {}: {}; using defaults", path.display(), e);
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    /// The procfs root to use for cross-process inspection: the host
    /// bind-mount when it exists, the local one otherwise.
    pub fn preferred_proc_root(&self) -> &Path {
        if self.host_proc_root.exists() {
            &self.host_proc_root
        } else {
            &self.proc_root
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.target_comm, "trim_sac");
        assert_eq!(config.dedup_suppress_secs, 5);
        assert_eq!(config.dedup_evict_secs, 60);
        assert_eq!(config.docker_backoff_secs, 5);
        assert_eq!(config.min_payload_len, 20);
        assert!(!config.debug);
    }

    #[test]
    fn test_partial_toml() {
        let config: Config = toml::from_str("dedup_suppress_secs = 2\ndebug = true").unwrap();
        assert_eq!(config.dedup_suppress_secs, 2);
        assert!(config.debug);
        assert_eq!(config.dedup_evict_secs, 60);
    }

    #[test]
    fn test_load_missing_file_falls_back() {
        let config = Config::load_or_default(Path::new("/nonexistent/watchcow.toml"));
        assert_eq!(config.target_comm, "trim_sac");
    }
}
