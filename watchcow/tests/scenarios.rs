//! End-to-end scenarios over the public API: captured payloads in, rewritten
//! bytes and notification selections out. Nothing here needs a kernel
//! probe, a Docker daemon, or privileges.

use std::collections::HashMap;

use watchcow::codec::{applist, notify};
use watchcow::inject::notifier::select_candidates;
use watchcow::record::{derive_record, AppRecord, ContainerState};
use watchcow::state::{AppSet, RequestDedup};
use watchcow::util::parse_net_unix;

fn nginx_labels() -> HashMap<String, String> {
    [
        ("watchcow.enable", "true"),
        ("watchcow.appName", "nginx"),
        ("watchcow.title", "Nginx"),
        ("watchcow.port", "8080"),
        ("watchcow.fnDomain", "nas.local"),
    ]
    .iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

fn nginx_record() -> AppRecord {
    derive_record("1f2e3d4c5b6a", &nginx_labels(), None).unwrap()
}

/// S1: a framed empty-list response plus one record yields the same prefix
/// with a patched length field and a single-element list.
#[test]
fn rewrites_framed_empty_list() {
    let json = br#"{"data":{"result":"succ","reqid":"abcdefghij","data":{"list":[]}}}"#;
    let mut payload = vec![0u8; 12];
    payload[10] = 0x2a; // stale length: 0x002a
    payload[11] = 0x00;
    payload.extend_from_slice(json);

    let mut set = AppSet::new();
    set.insert("1f2e3d4c5b6a".into(), nginx_record());

    let rewrite = applist::merge_records(&payload, &set.snapshot()).unwrap();

    // Prefix preserved except for the patched length.
    assert_eq!(&rewrite.bytes[..10], &payload[..10]);
    let json_len = rewrite.bytes.len() - 12;
    assert_eq!(
        u16::from_le_bytes([rewrite.bytes[10], rewrite.bytes[11]]) as usize,
        json_len
    );

    let value: serde_json::Value = serde_json::from_slice(&rewrite.bytes[12..]).unwrap();
    assert_eq!(value["data"]["reqid"], "abcdefghij");
    assert_eq!(value["data"]["result"], "succ");

    let list = value["data"]["data"]["list"].as_array().unwrap();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0]["appName"], "nginx");
    assert_eq!(list[0]["title"], "Nginx");
    assert_eq!(list[0]["fullUrl"], "http://nas.local:8080/");
    assert_eq!(rewrite.reqid, "abcdefghij");
}

/// S2: identical captures inside the suppress window produce exactly one
/// processed rewrite.
#[test]
fn duplicate_captures_suppressed() {
    let dedup = RequestDedup::new(5, 60);

    assert!(dedup.should_process("abcdefghij"));
    dedup.mark_processed("abcdefghij");

    // The second capture of the same response, 500 ms later in spirit.
    assert!(!dedup.should_process("abcdefghij"));

    // A different response is unaffected.
    assert!(dedup.should_process("zzzzzzzzzz"));
}

/// S3: a container with watchcow.enable="false" never becomes a record.
#[test]
fn disabled_container_is_ignored() {
    let mut labels = nginx_labels();
    labels.insert("watchcow.enable".into(), "false".into());

    assert!(derive_record("1f2e3d4c5b6a", &labels, None).is_none());

    let set = AppSet::new();
    assert!(set.snapshot().is_empty());
}

/// S4 (set half): removing a previously-inserted container shrinks the set
/// by one and yields the record whose name the stopped notification uses.
#[test]
fn removal_returns_last_known_record() {
    let mut set = AppSet::new();
    set.insert("1f2e3d4c5b6a".into(), nginx_record());
    let mut other = nginx_labels();
    other.insert("watchcow.appName".into(), "redis".into());
    set.insert("aa11bb22cc33".into(), derive_record("aa11bb22cc33", &other, None).unwrap());
    assert_eq!(set.len(), 2);

    let removed = set.remove("1f2e3d4c5b6a").unwrap();
    assert_eq!(set.len(), 1);
    assert_eq!(removed.app_name, "nginx");

    // The message broadcast to every surviving hub socket.
    let message = notify::encode(&removed.app_name, ContainerState::Stopped, 1_700_000_000).unwrap();
    assert_eq!(
        u32::from_le_bytes(message[0..4].try_into().unwrap()) as usize,
        message.len()
    );
    assert!(message.ends_with(b"\0trim.sac\0"));
}

/// S5: a capture flagged app-list whose payload lacks the list shape fails
/// re-verification and is dropped.
#[test]
fn flag_without_shape_fails_reverification() {
    let payload = br#"{"data":{"result":"succ","reqid":"abcdefghij","data":{}}}"#;
    assert!(!applist::is_app_list(payload));
    assert!(matches!(
        applist::merge_records(payload, &[]),
        Err(watchcow::error::CodecError::NotAppList)
    ));
}

/// S6: when peer resolution fails for every candidate, nothing is selected
/// and no panic escapes.
#[test]
fn unresolvable_peers_select_no_sockets() {
    let net_unix = "\
Num       RefCount Protocol Flags    Type St Inode Path
0000000000000000: 00000002 00000000 00000000 0001 01 5001
0000000000000000: 00000002 00000000 00000000 0001 03 5002
";
    let rows = parse_net_unix(net_unix);
    let fds = [(7u32, 5001u64), (9, 5002)];

    let selected = select_candidates(&fds, &rows, |_| None);
    assert!(selected.is_empty());
}

/// Property 6: the selection rule keeps exactly the connected/connecting
/// anonymous sockets whose peer name contains `trim` but not `trim_sac`.
#[test]
fn hub_adjacency_selection() {
    let net_unix = "\
Num       RefCount Protocol Flags    Type St Inode Path
0000000000000000: 00000002 00000000 00000000 0001 01 6001
0000000000000000: 00000002 00000000 00000000 0001 01 6002
0000000000000000: 00000002 00000000 00000000 0001 0A 6003
0000000000000000: 00000002 00000000 00000000 0001 03 6004
";
    let rows = parse_net_unix(net_unix);
    let fds = [(4u32, 6001u64), (5, 6002), (6, 6003), (7, 6004)];

    let selected = select_candidates(&fds, &rows, |inode| match inode {
        6001 => Some((10, "trim".to_string())),
        6002 => Some((11, "trim_sac".to_string())),
        6003 => Some((10, "trim".to_string())),
        6004 => Some((12, "trim_main".to_string())),
        _ => None,
    });

    // 6001: connected, hub peer. 6002: broker itself. 6003: listening.
    // 6004: connecting, hub peer.
    assert_eq!(selected, vec![4, 7]);
}

/// Property 7 shape: a snapshot taken before concurrent mutations never
/// contains records that were not in the set at snapshot time.
#[test]
fn snapshot_is_coherent_under_mutation() {
    let mut set = AppSet::new();
    set.insert("c1".into(), nginx_record());

    let snapshot = set.snapshot();

    let mut late = nginx_labels();
    late.insert("watchcow.appName".into(), "late".into());
    set.insert("c2".into(), derive_record("c2", &late, None).unwrap());
    set.remove("c1");

    let names: Vec<_> = snapshot.into_iter().map(|r| r.app_name).collect();
    assert_eq!(names, ["nginx"]);
}

/// Rewrites nest: a payload that already contains injected records keeps
/// them as originals on the next pass.
#[test]
fn second_rewrite_preserves_injected_records() {
    let json = br#"{"data":{"result":"succ","reqid":"r2","data":{"list":[{"appName":"files"}]}}}"#;
    let first = applist::merge_records(json, &[nginx_record()]).unwrap();

    let second = applist::merge_records(&first.bytes, &[nginx_record()]).unwrap();
    let value: serde_json::Value = serde_json::from_slice(&second.bytes).unwrap();
    let list = value["data"]["data"]["list"].as_array().unwrap();

    assert_eq!(list.len(), 3);
    assert_eq!(list[0]["appName"], "files");
    assert_eq!(list[1]["appName"], "nginx");
    assert_eq!(list[2]["appName"], "nginx");
}
