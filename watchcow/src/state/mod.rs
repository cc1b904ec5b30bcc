//! Daemon state: the container record set, the request dedup table, and the
//! statistics counters. All of it is owned by the orchestrator; other
//! components only ever see snapshots.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

use crate::record::AppRecord;

/// The live mapping from container id to application record.
///
/// Insertion order is preserved: a rewrite appends the snapshot in exactly
/// this order. Re-inserting an existing container id (container restart)
/// replaces the record in place, keeping its position.
#[derive(Debug, Default)]
pub struct AppSet {
    entries: Vec<(String, AppRecord)>,
}

impl AppSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the record for a container.
    pub fn insert(&mut self, container_id: String, record: AppRecord) {
        match self.entries.iter_mut().find(|(id, _)| *id == container_id) {
            Some((_, existing)) => *existing = record,
            None => self.entries.push((container_id, record)),
        }
    }

    /// Remove a container's record, returning it if present.
    pub fn remove(&mut self, container_id: &str) -> Option<AppRecord> {
        let index = self
            .entries
            .iter()
            .position(|(id, _)| id == container_id)?;
        Some(self.entries.remove(index).1)
    }

    /// Clone the current records in insertion order. The clone is taken
    /// under a single lock acquisition by the caller, so a rewrite never
    /// observes a torn set.
    pub fn snapshot(&self) -> Vec<AppRecord> {
        self.entries.iter().map(|(_, r)| r.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Request-correlation-id dedup table.
///
/// An id seen within the suppress window is skipped; entries older than the
/// evict window are dropped whenever a rewrite succeeds.
#[derive(Debug)]
pub struct RequestDedup {
    seen: Mutex<HashMap<String, DateTime<Utc>>>,
    suppress: Duration,
    evict: Duration,
}

impl RequestDedup {
    pub fn new(suppress_secs: u64, evict_secs: u64) -> Self {
        Self {
            seen: Mutex::new(HashMap::new()),
            suppress: Duration::seconds(suppress_secs as i64),
            evict: Duration::seconds(evict_secs as i64),
        }
    }

    /// Whether a rewrite for this id should go ahead.
    pub fn should_process(&self, reqid: &str) -> bool {
        self.should_process_at(reqid, Utc::now())
    }

    /// Record a successful rewrite for this id and evict stale entries.
    pub fn mark_processed(&self, reqid: &str) {
        self.mark_processed_at(reqid, Utc::now());
    }

    pub fn len(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn should_process_at(&self, reqid: &str, now: DateTime<Utc>) -> bool {
        let seen = self.seen.lock().unwrap();
        match seen.get(reqid) {
            Some(last) => now - *last >= self.suppress,
            None => true,
        }
    }

    fn mark_processed_at(&self, reqid: &str, now: DateTime<Utc>) {
        let mut seen = self.seen.lock().unwrap();
        seen.insert(reqid.to_string(), now);

        let cutoff = now - self.evict;
        seen.retain(|_, last| *last >= cutoff);
    }
}

/// Counters published by the orchestrator.
#[derive(Debug, Default, Clone, Copy)]
pub struct Stats {
    /// Capture events delivered from the kernel.
    pub events_received: u64,
    /// App-list events that made it through verification and dedup.
    pub events_processed: u64,
    /// Rewritten responses actually written to the borrowed fd.
    pub responses_injected: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;

    fn record(app_name: &str) -> AppRecord {
        let labels: StdHashMap<String, String> = [
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

    #[test]
    fn test_app_set_insertion_order() {
        let mut set = AppSet::new();
        set.insert("c1".into(), record("first"));
        set.insert("c2".into(), record("second"));
        set.insert("c3".into(), record("third"));

        let names: Vec<_> = set.snapshot().into_iter().map(|r| r.app_name).collect();
        assert_eq!(names, ["first", "second", "third"]);
    }

    #[test]
    fn test_app_set_replace_keeps_position() {
        let mut set = AppSet::new();
        set.insert("c1".into(), record("first"));
        set.insert("c2".into(), record("second"));
        set.insert("c1".into(), record("restarted"));

        let names: Vec<_> = set.snapshot().into_iter().map(|r| r.app_name).collect();
        assert_eq!(names, ["restarted", "second"]);
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_app_set_remove() {
        let mut set = AppSet::new();
        set.insert("c1".into(), record("first"));
        set.insert("c2".into(), record("second"));

        let removed = set.remove("c1").unwrap();
        assert_eq!(removed.app_name, "first");
        assert_eq!(set.len(), 1);
        assert!(set.remove("c1").is_none());
    }

    #[test]
    fn test_snapshot_is_detached() {
        let mut set = AppSet::new();
        set.insert("c1".into(), record("first"));
        let snapshot = set.snapshot();
        set.remove("c1");
        // The snapshot taken before the removal is unaffected.
        assert_eq!(snapshot.len(), 1);
        assert!(set.is_empty());
    }

    #[test]
    fn test_dedup_window() {
        let dedup = RequestDedup::new(5, 60);
        let t0 = Utc::now();

        assert!(dedup.should_process_at("r1", t0));
        dedup.mark_processed_at("r1", t0);

        // Seen again inside the suppress window: skipped.
        assert!(!dedup.should_process_at("r1", t0 + Duration::milliseconds(500)));
        assert!(!dedup.should_process_at("r1", t0 + Duration::seconds(4)));

        // Past the window: allowed again.
        assert!(dedup.should_process_at("r1", t0 + Duration::seconds(5)));
        assert!(dedup.should_process_at("r1", t0 + Duration::seconds(10)));

        // Other ids are unaffected.
        assert!(dedup.should_process_at("r2", t0));
    }

    #[test]
    fn test_dedup_eviction() {
        let dedup = RequestDedup::new(5, 60);
        let t0 = Utc::now();

        dedup.mark_processed_at("old", t0);
        dedup.mark_processed_at("fresh", t0 + Duration::seconds(59));
        assert_eq!(dedup.len(), 2);

        // A success 61s in evicts the entry older than the evict window.
        dedup.mark_processed_at("new", t0 + Duration::seconds(61));
        assert_eq!(dedup.len(), 2);
        assert!(dedup.should_process_at("old", t0 + Duration::seconds(61)));
        assert!(!dedup.should_process_at("fresh", t0 + Duration::seconds(61)));
    }
}
