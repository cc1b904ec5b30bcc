//! Cross-component wiring and shared-state ownership.
//!
//! The orchestrator is the only component that mutates the record set and
//! the dedup table. Capture events are demultiplexed here on the
//! ring-buffer task; Docker lifecycle messages arrive over a channel and
//! are applied (and their notifications sent) on the consumer task.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::capture::{CaptureEvent, EventKind};
use crate::codec::{applist, ws};
use crate::config::{Config, SAC_CMDLINE_MARKERS};
use crate::inject::borrow::FdBorrower;
use crate::inject::notifier::Notifier;
use crate::inject::peer::SockPeerFinder;
use crate::inject::rewriter::AppStoreRewriter;
use crate::record::{AppRecord, ContainerState};
use crate::state::{AppSet, RequestDedup, Stats};
use crate::util;

/// Lifecycle messages from the Docker watcher.
#[derive(Debug)]
pub enum AppEvent {
    /// A qualifying container is up. `announce` distinguishes live starts
    /// (notified) from the initial seeding scan (silent).
    Started {
        container_id: String,
        record: AppRecord,
        announce: bool,
    },
    /// A tracked container stopped, died, or was destroyed.
    Stopped { container_id: String },
}

pub struct Orchestrator {
    config: Config,
    apps: RwLock<AppSet>,
    dedup: RequestDedup,
    stats: RwLock<Stats>,
    /// Most recent broker pid seen on a capture event; 0 = never seen.
    sac_pid: AtomicI32,
    rewriter: AppStoreRewriter,
    notifier: Notifier,
}

impl Orchestrator {
    pub fn new(config: Config) -> Self {
        let borrower = Arc::new(FdBorrower::new());
        let proc_root = config.proc_root.clone();
        let peers = SockPeerFinder::new(config.preferred_proc_root());

        let rewriter = AppStoreRewriter::new(
            Arc::clone(&borrower),
            proc_root.clone(),
            config.fallback_fd_max,
        );
        let notifier = Notifier::new(borrower, peers, proc_root);

        Self {
            dedup: RequestDedup::new(config.dedup_suppress_secs, config.dedup_evict_secs),
            config,
            apps: RwLock::new(AppSet::new()),
            stats: RwLock::new(Stats::default()),
            sac_pid: AtomicI32::new(0),
            rewriter,
            notifier,
        }
    }

    /// Handle one capture event, synchronously on the ring-buffer task.
    pub fn handle_capture(&self, event: &CaptureEvent) {
        self.stats.write().unwrap().events_received += 1;
        self.sac_pid.store(event.pid as i32, Ordering::Relaxed);

        // Keepalive and ping/pong noise.
        if event.payload.len() <= self.config.min_payload_len {
            return;
        }

        if self.config.debug && event.payload.len() > 100 {
            self.dump_payload(event);
        }

        match event.kind {
            EventKind::AppStore => self.rewrite_app_list(event),
            EventKind::Notify => {
                debug!(pid = event.pid, fd = event.fd, "captured broker notify");
            }
            EventKind::Other => {}
        }
    }

    fn rewrite_app_list(&self, event: &CaptureEvent) {
        // The kernel probe only saw a bounded prefix; re-verify before
        // trusting the flag.
        if !applist::is_app_list(&event.payload) {
            debug!(pid = event.pid, "app-list flag failed re-verification");
            return;
        }

        let reqid = applist::split_prefix(&event.payload)
            .ok()
            .and_then(|(_, json)| applist::extract_reqid(json).ok())
            .unwrap_or_else(|| format!("ts_{}", event.timestamp_ns));

        if !self.dedup.should_process(&reqid) {
            debug!(reqid = %reqid, "duplicate app-list capture suppressed");
            return;
        }

        let snapshot = self.apps.read().unwrap().snapshot();

        match self.rewriter.inject(
            event.pid as i32,
            event.fd as i32,
            &event.payload,
            &snapshot,
        ) {
            Ok(reqid) => {
                self.dedup.mark_processed(&reqid);
                let mut stats = self.stats.write().unwrap();
                stats.events_processed += 1;
                stats.responses_injected += 1;
                info!(
                    reqid = %reqid,
                    records = snapshot.len(),
                    "injected container records into app list"
                );
            }
            Err(e) => warn!(pid = event.pid, fd = event.fd, error = %e, "rewrite failed"),
        }
    }

    /// Consume Docker lifecycle messages until the channel closes or the
    /// root context cancels.
    pub async fn run_app_events(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<AppEvent>,
        mut cancel: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = cancel.changed() => break,
                message = rx.recv() => {
                    let Some(event) = message else { break };
                    self.apply_app_event(event);
                }
            }
        }
        info!("app-event loop stopping");
    }

    fn apply_app_event(&self, event: AppEvent) {
        match event {
            AppEvent::Started {
                container_id,
                record,
                announce,
            } => {
                let app_name = record.app_name.clone();
                let total = {
                    let mut apps = self.apps.write().unwrap();
                    apps.insert(container_id.clone(), record);
                    apps.len()
                };
                info!(container = %container_id, app = %app_name, total, "record registered");
                if announce {
                    self.notify_state(&app_name, ContainerState::Running);
                }
            }
            AppEvent::Stopped { container_id } => {
                let removed = self.apps.write().unwrap().remove(&container_id);
                match removed {
                    Some(record) => {
                        info!(container = %container_id, app = %record.app_name, "record removed");
                        self.notify_state(&record.app_name, ContainerState::Stopped);
                    }
                    None => debug!(container = %container_id, "stop for untracked container"),
                }
            }
        }
    }

    fn notify_state(&self, app_name: &str, state: ContainerState) {
        let Some(pid) = self.broker_pid() else {
            warn!(app = app_name, "shell broker not found, dropping notification");
            return;
        };

        match self.notifier.notify(pid, app_name, state) {
            Ok(sockets) => {
                info!(app = app_name, state = state.as_str(), sockets, "notification sent");
            }
            Err(e) => {
                warn!(app = app_name, state = state.as_str(), error = %e, "notification failed");
            }
        }
    }

    /// The broker pid: the most recent capture's emitter, or a /proc
    /// cmdline scan when nothing has been captured yet. The scan result is
    /// cached.
    fn broker_pid(&self) -> Option<i32> {
        let cached = self.sac_pid.load(Ordering::Relaxed);
        if cached > 0 {
            return Some(cached);
        }

        let found = util::find_process_by_cmdline(&self.config.proc_root, SAC_CMDLINE_MARKERS)?;
        info!(pid = found, "discovered shell broker via /proc scan");
        self.sac_pid.store(found, Ordering::Relaxed);
        Some(found)
    }

    /// Snapshot of the statistics counters.
    pub fn stats(&self) -> Stats {
        *self.stats.read().unwrap()
    }

    /// Current record count, for logging.
    pub fn record_count(&self) -> usize {
        self.apps.read().unwrap().len()
    }

    fn dump_payload(&self, event: &CaptureEvent) {
        let label = if event.kind == EventKind::AppStore {
            "app-list"
        } else if event.payload.windows(6).any(|w| w == b"notify") {
            "notify"
        } else {
            "unknown"
        };

        let frames = ws::parse_frames(&event.payload);
        debug!(
            pid = event.pid,
            fd = event.fd,
            len = event.payload.len(),
            kind = label,
            frames = frames.len(),
            "captured payload"
        );
        for frame in &frames {
            debug!(
                opcode = frame.opcode_name(),
                fin = frame.fin,
                len = frame.payload.len(),
                "frame"
            );
        }
        debug!("\n{}", util::hex_dump(&event.payload));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn record(app_name: &str) -> AppRecord {
        let labels: HashMap<String, String> = [
            ("watchcow.enable", "true"),
            ("watchcow.appName", app_name),
            ("watchcow.title", app_name),
            ("watchcow.port", "80"),
            ("watchcow.fnDomain", "nas.local"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        crate::record::derive_record("cid", &labels, None).unwrap()
    }

    fn orchestrator() -> Orchestrator {
        Orchestrator::new(Config::default())
    }

    #[test]
    fn test_started_inserts_record() {
        let orch = orchestrator();
        orch.apply_app_event(AppEvent::Started {
            container_id: "c1".into(),
            record: record("nginx"),
            announce: false,
        });
        assert_eq!(orch.record_count(), 1);
    }

    #[test]
    fn test_stopped_removes_record() {
        let orch = orchestrator();
        orch.apply_app_event(AppEvent::Started {
            container_id: "c1".into(),
            record: record("nginx"),
            announce: false,
        });
        // Notification fails silently (no broker in the test environment);
        // the set mutation must still happen.
        orch.apply_app_event(AppEvent::Stopped {
            container_id: "c1".into(),
        });
        assert_eq!(orch.record_count(), 0);
    }

    #[test]
    fn test_stopped_for_untracked_container() {
        let orch = orchestrator();
        orch.apply_app_event(AppEvent::Stopped {
            container_id: "ghost".into(),
        });
        assert_eq!(orch.record_count(), 0);
    }

    #[test]
    fn test_capture_event_counted() {
        let orch = orchestrator();
        let event = CaptureEvent {
            pid: 1234,
            tid: 1234,
            fd: 7,
            timestamp_ns: 1,
            flags: 0,
            kind: EventKind::Other,
            payload: b"tiny".to_vec(),
        };
        orch.handle_capture(&event);
        let stats = orch.stats();
        assert_eq!(stats.events_received, 1);
        assert_eq!(stats.events_processed, 0);
        assert_eq!(stats.responses_injected, 0);
    }

    #[test]
    fn test_appstore_flag_without_shape_is_dropped() {
        // FLAG_APPSTORE set but the payload fails re-verification: no
        // stats beyond the receive counter (S5).
        let orch = orchestrator();
        let event = CaptureEvent {
            pid: 1234,
            tid: 1234,
            fd: 7,
            timestamp_ns: 1,
            flags: watchcow_common::FLAG_APPSTORE,
            kind: EventKind::AppStore,
            payload: br#"{"data":{"result":"succ","reqid":"abc","data":{}}}"#.to_vec(),
        };
        orch.handle_capture(&event);
        let stats = orch.stats();
        assert_eq!(stats.events_received, 1);
        assert_eq!(stats.events_processed, 0);
        assert_eq!(stats.responses_injected, 0);
    }
}
