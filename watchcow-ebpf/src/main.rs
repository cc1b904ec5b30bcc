//! eBPF capture probe for watchcow.
//!
//! This crate compiles to BPF bytecode and runs in the Linux kernel. It
//! attaches to the `syscalls/sys_enter_write` tracepoint and filters to the
//! shell broker process (comm `trim_sac`). Each qualifying write is copied
//! (up to 4 KiB) into a ring buffer together with pid/tid/fd/timestamp and a
//! flags word set by bounded textual probes over the payload prefix.
//!
//! When the payload looks like an app-list response the probe additionally
//! scrambles four bytes of the in-flight `reqid` value in the caller's own
//! buffer, so the notification hub discards the broker's original send and
//! the userspace rewrite becomes the authoritative response.

#![no_std]
#![no_main]

use aya_ebpf::{
    helpers::{
        bpf_get_current_comm, bpf_get_current_pid_tgid, bpf_ktime_get_ns,
        bpf_probe_read_user_buf, bpf_probe_write_user,
    },
    macros::{map, tracepoint},
    maps::RingBuf,
    programs::TracePointContext,
};
use watchcow_common::{
    WriteEvent, COMM_LEN, FLAG_APPSTORE, FLAG_NOTIFY, MAX_CAPTURE_LEN, SOCKET_TAG_LEN, TARGET_COMM,
};

// bpf_probe_write_user is a GPL-gated helper.
#[link_section = "license"]
#[no_mangle]
static LICENSE: [u8; 4] = *b"GPL\0";

/// Ring buffer for delivering capture events to userspace.
/// 1 MiB; events are dropped, not queued, when it fills up.
#[map]
static EVENTS: RingBuf = RingBuf::with_byte_size(1 << 20, 0);

/// Textual probe for the app-list response shape.
const LIST_PATTERN: &[u8] = b"\"data\":{\"list\":[";
/// Textual probe for the request correlation id.
const REQID_PATTERN: &[u8] = b"\"reqid\":\"";
/// Textual probe for the out-of-band notify shape.
const NOTIFY_PATTERN: &[u8] = b"\"notify\":[";

/// Bytes written over the tail of the in-flight reqid value.
const INVALID_SUFFIX: [u8; 4] = *b"XXXX";
/// Offset of the overwritten span inside the reqid value.
const REQID_SCRAMBLE_OFFSET: usize = 24;

// sys_enter_write tracepoint field offsets (fd, buf, count).
const ARG_FD: usize = 16;
const ARG_BUF: usize = 24;
const ARG_COUNT: usize = 32;

#[tracepoint(category = "syscalls", name = "sys_enter_write")]
pub fn watch_write(ctx: TracePointContext) -> u32 {
    match unsafe { try_watch_write(&ctx) } {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

unsafe fn try_watch_write(ctx: &TracePointContext) -> Result<(), i64> {
    let comm = bpf_get_current_comm().map_err(|e| e as i64)?;
    // The broker's comm is exactly "trim_sac"; match its full 8 bytes.
    let mut i = 0;
    while i < TARGET_COMM.len() {
        if comm[i] != TARGET_COMM[i] {
            return Ok(());
        }
        i += 1;
    }

    let fd: u64 = ctx.read_at(ARG_FD)?;
    // Skip stdio and implausibly large fd numbers.
    if !(3..=1024).contains(&fd) {
        return Ok(());
    }

    let buf: u64 = ctx.read_at(ARG_BUF)?;
    let count: u64 = ctx.read_at(ARG_COUNT)?;

    let pid_tgid = bpf_get_current_pid_tgid();

    let Some(mut entry) = EVENTS.reserve::<WriteEvent>(0) else {
        // Buffer full: the event is dropped, delivery is lossy.
        return Ok(());
    };
    let event: *mut WriteEvent = entry.as_mut_ptr();

    (*event).pid = (pid_tgid >> 32) as u32;
    (*event).tid = pid_tgid as u32;
    (*event).fd = fd as u32;
    (*event).timestamp_ns = bpf_ktime_get_ns();
    (*event).flags = 0;
    (*event).data_len = 0;

    let mut t = 0;
    while t < SOCKET_TAG_LEN {
        (*event).socket_tag[t] = if t < COMM_LEN { comm[t] } else { 0 };
        t += 1;
    }

    let mut read_len = 0usize;
    if count > 0 && count < 0x7FFF_FFFF {
        read_len = count as usize;
        if read_len > MAX_CAPTURE_LEN {
            read_len = MAX_CAPTURE_LEN;
        }
    }

    if read_len > 0
        && bpf_probe_read_user_buf(buf as *const u8, &mut (*event).data[..read_len]).is_ok()
    {
        (*event).data_len = read_len as u32;
    }

    let data_len = (*event).data_len as usize;

    // App-list probe: scan only the payload prefix to stay verifier-friendly.
    if data_len > 100 {
        let limit = bounded(data_len - LIST_PATTERN.len(), 200);
        let mut i = 0;
        while i < limit {
            if matches_at(&(*event).data, i, LIST_PATTERN) {
                (*event).flags |= FLAG_APPSTORE;

                // Invalidate the in-flight response: overwrite four bytes
                // deep inside the reqid value in the caller's buffer.
                let scan = bounded(data_len - 40, 150);
                let mut k = 0;
                while k < scan {
                    if matches_at(&(*event).data, k, REQID_PATTERN) {
                        let target =
                            buf + (k + REQID_PATTERN.len() + REQID_SCRAMBLE_OFFSET) as u64;
                        let _ = bpf_probe_write_user(target as *mut [u8; 4], &INVALID_SUFFIX);
                        break;
                    }
                    k += 1;
                }
                break;
            }
            i += 1;
        }
    }

    // Notify probe. The flag is informational; userspace never re-emits
    // captured notifications.
    if data_len > 50 {
        let limit = bounded(data_len - NOTIFY_PATTERN.len(), 200);
        let mut i = 0;
        while i < limit {
            if matches_at(&(*event).data, i, NOTIFY_PATTERN) {
                (*event).flags |= FLAG_NOTIFY;
                break;
            }
            i += 1;
        }
    }

    entry.submit(0);
    Ok(())
}

#[inline(always)]
fn bounded(len: usize, cap: usize) -> usize {
    if len < cap {
        len
    } else {
        cap
    }
}

#[inline(always)]
fn matches_at(data: &[u8; MAX_CAPTURE_LEN], at: usize, pattern: &[u8]) -> bool {
    let mut j = 0;
    while j < pattern.len() {
        if data[at + j] != pattern[j] {
            return false;
        }
        j += 1;
    }
    true
}

/// Panic handler required for no_std.
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    loop {}
}
