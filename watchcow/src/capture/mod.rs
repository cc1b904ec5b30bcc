//! eBPF program lifecycle and ring-buffer streaming.
//!
//! Owns the loaded program objects and the attachment for the
//! `syscalls/sys_enter_write` tracepoint. The ring buffer is handed to a
//! single reader task; everything detaches in reverse acquisition order
//! when the owner drops.

pub mod event;

use std::path::Path;

use anyhow::{Context, Result};
use aya::maps::{MapData, RingBuf};
use aya::programs::TracePoint;
use aya::Ebpf;
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::sync::watch;
use tracing::{info, warn};

pub use event::{CaptureEvent, EventKind};

const PROGRAM_NAME: &str = "watch_write";
const RING_MAP_NAME: &str = "EVENTS";
const TRACEPOINT_CATEGORY: &str = "syscalls";
const TRACEPOINT_NAME: &str = "sys_enter_write";

/// Owner of the eBPF objects and their attachment.
pub struct CaptureBus {
    bpf: Ebpf,
}

impl CaptureBus {
    /// Load the compiled probe object and attach the tracepoint.
    /// Attach-time failures are fatal to startup.
    pub fn load(object: &Path) -> Result<Self> {
        raise_memlock_limit();

        let mut bpf = Ebpf::load_file(object).with_context(|| {
            format!(
                "failed to load eBPF object {} (run `cargo xtask build-ebpf`?)",
                object.display()
            )
        })?;

        let program: &mut TracePoint = bpf
            .program_mut(PROGRAM_NAME)
            .context("capture program missing from object")?
            .try_into()
            .context("capture program has unexpected type")?;
        program.load().context("failed to load capture program")?;
        program
            .attach(TRACEPOINT_CATEGORY, TRACEPOINT_NAME)
            .context("failed to attach sys_enter_write tracepoint")?;

        info!(
            object = %object.display(),
            tracepoint = TRACEPOINT_NAME,
            "capture probe attached"
        );

        Ok(Self { bpf })
    }

    /// Take the event ring buffer out of the loaded object. Called once.
    pub fn ring(&mut self) -> Result<RingBuf<MapData>> {
        let map = self
            .bpf
            .take_map(RING_MAP_NAME)
            .context("EVENTS ring buffer missing from object")?;
        RingBuf::try_from(map).context("EVENTS map is not a ring buffer")
    }
}

/// eBPF map creation charges against RLIMIT_MEMLOCK on pre-cgroup-memory
/// kernels; lift it before loading.
fn raise_memlock_limit() {
    let limit = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &limit) };
    if ret != 0 {
        warn!("failed to raise RLIMIT_MEMLOCK; eBPF load may fail");
    }
}

/// Consume the ring buffer until cancellation or reader failure, handing
/// each decoded event to `handler` on this task. Delivery is lossy by
/// design: the kernel drops events when the buffer is full.
pub async fn stream(
    ring: RingBuf<MapData>,
    mut cancel: watch::Receiver<bool>,
    mut handler: impl FnMut(CaptureEvent),
) -> Result<()> {
    let mut poll = AsyncFd::with_interest(ring, Interest::READABLE)
        .context("failed to register ring buffer with the reactor")?;

    loop {
        tokio::select! {
            _ = cancel.changed() => {
                info!("capture stream stopping");
                return Ok(());
            }
            guard = poll.readable_mut() => {
                let mut guard = match guard {
                    Ok(guard) => guard,
                    Err(e) => {
                        // Ring closure surfaces as a reader error; treat it
                        // as a clean stop.
                        warn!(error = %e, "ring buffer reader closed");
                        return Ok(());
                    }
                };

                let ring = guard.get_inner_mut();
                while let Some(item) = ring.next() {
                    match event::decode(&item) {
                        Some(event) => handler(event),
                        None => warn!("dropping malformed ring buffer record"),
                    }
                }
                guard.clear_ready();
            }
        }
    }
}
