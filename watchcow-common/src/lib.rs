//! Shared types for the watchcow eBPF program and userspace.
//!
//! These types are used to communicate between the capture probe running in
//! the kernel and the userspace daemon. All types use `#[repr(C)]` for ABI
//! compatibility; the layout must match on both sides because the probe
//! writes the struct directly into the ring buffer and userspace decodes it
//! field by field.

#![no_std]

/// Maximum length for process names (comm field in kernel).
/// This matches the kernel's TASK_COMM_LEN.
pub const COMM_LEN: usize = 16;

/// Maximum number of payload bytes captured from a single write().
/// Larger writes are truncated; `data_len` always holds the captured length.
pub const MAX_CAPTURE_LEN: usize = 4096;

/// Fixed-size tag identifying the socket the write went to.
/// Sized like sockaddr_un.sun_path so a filesystem path would fit.
pub const SOCKET_TAG_LEN: usize = 108;

/// The payload textually matched the app-list response shape.
pub const FLAG_APPSTORE: u32 = 0x01;
/// The payload textually matched the out-of-band notify shape.
pub const FLAG_NOTIFY: u32 = 0x02;

/// The process name the probe filters on.
pub const TARGET_COMM: &[u8; 8] = b"trim_sac";

/// A single captured `write(2)` from the target process.
///
/// Produced by the `sys_enter_write` tracepoint probe, consumed once by the
/// userspace ring-buffer reader, then dropped.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct WriteEvent {
    /// Emitting process ID (tgid).
    pub pid: u32,
    /// Emitting thread ID.
    pub tid: u32,
    /// File descriptor the process wrote to.
    pub fd: u32,
    /// Number of payload bytes actually captured (<= MAX_CAPTURE_LEN).
    pub data_len: u32,
    /// Timestamp in nanoseconds since boot (bpf_ktime_get_ns).
    pub timestamp_ns: u64,
    /// FLAG_* bits set by the in-kernel textual probes.
    pub flags: u32,
    /// Emitter comm, null-padded.
    pub socket_tag: [u8; SOCKET_TAG_LEN],
    /// Raw write payload, valid up to `data_len`.
    pub data: [u8; MAX_CAPTURE_LEN],
}

impl WriteEvent {
    /// Create a zeroed event.
    pub const fn zeroed() -> Self {
        Self {
            pid: 0,
            tid: 0,
            fd: 0,
            data_len: 0,
            timestamp_ns: 0,
            flags: 0,
            socket_tag: [0; SOCKET_TAG_LEN],
            data: [0; MAX_CAPTURE_LEN],
        }
    }

    /// Get the captured payload as a byte slice.
    pub fn payload(&self) -> &[u8] {
        let len = (self.data_len as usize).min(MAX_CAPTURE_LEN);
        &self.data[..len]
    }

    /// Get the socket tag as a byte slice (up to null terminator).
    pub fn tag_bytes(&self) -> &[u8] {
        let end = self
            .socket_tag
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(SOCKET_TAG_LEN);
        &self.socket_tag[..end]
    }
}

impl Default for WriteEvent {
    fn default() -> Self {
        Self::zeroed()
    }
}

// Safety: repr(C) with only primitive fields and fixed-size arrays, so the
// type is safe to reinterpret from the raw ring-buffer bytes in userspace.
#[cfg(feature = "user")]
unsafe impl aya::Pod for WriteEvent {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_event_layout() {
        // Userspace decodes by fixed offset; pin the layout down.
        assert_eq!(core::mem::align_of::<WriteEvent>(), 8);
        // 4x u32 + u64 + u32 + tag + data, no tail padding.
        assert_eq!(core::mem::size_of::<WriteEvent>(), 4232);
        assert_eq!(28 + SOCKET_TAG_LEN + MAX_CAPTURE_LEN, 4232);
    }

    #[test]
    fn test_payload_clamped() {
        let mut event = WriteEvent::zeroed();
        event.data_len = (MAX_CAPTURE_LEN as u32) + 100;
        assert_eq!(event.payload().len(), MAX_CAPTURE_LEN);
    }

    #[test]
    fn test_tag_bytes() {
        let mut event = WriteEvent::zeroed();
        event.socket_tag[..8].copy_from_slice(b"trim_sac");
        assert_eq!(event.tag_bytes(), b"trim_sac");
    }
}
