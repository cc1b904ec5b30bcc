//! Decoding of raw ring-buffer records into typed capture events.
//!
//! The probe writes a `WriteEvent` (watchcow-common) straight into the ring
//! buffer; this module reads it back field by field in the fixed
//! little-endian layout and tags the event kind exactly once, at decode
//! time.

use watchcow_common::{FLAG_APPSTORE, FLAG_NOTIFY, MAX_CAPTURE_LEN, SOCKET_TAG_LEN};

/// Fixed fields plus the socket tag; the payload follows.
pub const EVENT_HEADER_LEN: usize = 28 + SOCKET_TAG_LEN;

/// What the kernel-side textual probes saw in the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Payload matched the app-list response shape.
    AppStore,
    /// Payload matched the out-of-band notify shape (informational).
    Notify,
    /// Anything else the broker wrote.
    Other,
}

/// A decoded capture event. Consumed once, then dropped.
#[derive(Debug, Clone)]
pub struct CaptureEvent {
    pub pid: u32,
    pub tid: u32,
    pub fd: u32,
    pub timestamp_ns: u64,
    pub flags: u32,
    pub kind: EventKind,
    pub payload: Vec<u8>,
}

fn read_u32(raw: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]])
}

fn read_u64(raw: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&raw[at..at + 8]);
    u64::from_le_bytes(bytes)
}

/// Decode one raw ring-buffer record. Returns `None` for records too short
/// to carry the fixed header (malformed or from a mismatched probe build).
pub fn decode(raw: &[u8]) -> Option<CaptureEvent> {
    if raw.len() < EVENT_HEADER_LEN {
        return None;
    }

    let data_len = read_u32(raw, 12) as usize;
    let flags = read_u32(raw, 24);

    let available = raw.len() - EVENT_HEADER_LEN;
    let payload_len = data_len.min(MAX_CAPTURE_LEN).min(available);

    let kind = if flags & FLAG_APPSTORE != 0 {
        EventKind::AppStore
    } else if flags & FLAG_NOTIFY != 0 {
        EventKind::Notify
    } else {
        EventKind::Other
    };

    Some(CaptureEvent {
        pid: read_u32(raw, 0),
        tid: read_u32(raw, 4),
        fd: read_u32(raw, 8),
        timestamp_ns: read_u64(raw, 16),
        flags,
        kind,
        payload: raw[EVENT_HEADER_LEN..EVENT_HEADER_LEN + payload_len].to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_event(pid: u32, fd: u32, flags: u32, payload: &[u8]) -> Vec<u8> {
        let mut raw = vec![0u8; EVENT_HEADER_LEN + MAX_CAPTURE_LEN];
        raw[0..4].copy_from_slice(&pid.to_le_bytes());
        raw[4..8].copy_from_slice(&77u32.to_le_bytes());
        raw[8..12].copy_from_slice(&fd.to_le_bytes());
        raw[12..16].copy_from_slice(&(payload.len() as u32).to_le_bytes());
        raw[16..24].copy_from_slice(&123_456_789u64.to_le_bytes());
        raw[24..28].copy_from_slice(&flags.to_le_bytes());
        raw[28..36].copy_from_slice(b"trim_sac");
        raw[EVENT_HEADER_LEN..EVENT_HEADER_LEN + payload.len()].copy_from_slice(payload);
        raw
    }

    #[test]
    fn test_decode_fields() {
        let raw = raw_event(4321, 9, 0, b"hello");
        let event = decode(&raw).unwrap();
        assert_eq!(event.pid, 4321);
        assert_eq!(event.tid, 77);
        assert_eq!(event.fd, 9);
        assert_eq!(event.timestamp_ns, 123_456_789);
        assert_eq!(event.payload, b"hello");
        assert_eq!(event.kind, EventKind::Other);
    }

    #[test]
    fn test_decode_kind_tagging() {
        let raw = raw_event(1, 3, FLAG_APPSTORE, b"x");
        assert_eq!(decode(&raw).unwrap().kind, EventKind::AppStore);

        let raw = raw_event(1, 3, FLAG_NOTIFY, b"x");
        assert_eq!(decode(&raw).unwrap().kind, EventKind::Notify);

        // Appstore wins when both probes fired.
        let raw = raw_event(1, 3, FLAG_APPSTORE | FLAG_NOTIFY, b"x");
        assert_eq!(decode(&raw).unwrap().kind, EventKind::AppStore);
    }

    #[test]
    fn test_decode_short_record() {
        assert!(decode(&[0u8; 10]).is_none());
        assert!(decode(&[]).is_none());
    }

    #[test]
    fn test_decode_clamps_length() {
        // data_len claims more than the record carries.
        let mut raw = raw_event(1, 3, 0, b"abc");
        raw.truncate(EVENT_HEADER_LEN + 3);
        raw[12..16].copy_from_slice(&10_000u32.to_le_bytes());
        let event = decode(&raw).unwrap();
        assert_eq!(event.payload, b"abc");
    }
}
