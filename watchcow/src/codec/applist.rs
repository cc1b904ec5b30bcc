//! App-list response recognition and rewriting.
//!
//! The payload the broker writes is a short binary prefix followed by JSON
//! of the shape `{"data":{"result":…,"reqid":…,"data":{"list":[…]}}}`.
//! Rewriting appends container records to the list without touching the
//! original entries, and patches the u16 payload length the prefix carries
//! at bytes 10-11 when it is long enough to have one.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CodecError;
use crate::record::AppRecord;

/// Textual probe for the app-list response shape. The kernel probe matches
/// the same bytes; userspace re-verifies because the kernel only sees a
/// bounded prefix of a possibly truncated capture.
pub const LIST_PROBE: &[u8] = b"\"data\":{\"list\":[";
/// Textual probe for the request correlation id.
pub const REQID_PROBE: &[u8] = b"\"reqid\":\"";

/// The list probe must start within this many bytes of the payload.
const LIST_PROBE_WINDOW: usize = 200;
/// The reqid probe must start within this many bytes of the payload.
const REQID_PROBE_WINDOW: usize = 150;

/// Byte offset of the little-endian u16 JSON length inside the prefix.
const PREFIX_LEN_OFFSET: usize = 10;
/// Prefixes shorter than this carry no length field.
const PREFIX_LEN_MIN: usize = 12;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Envelope {
    data: Body,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Body {
    result: String,
    reqid: String,
    data: Inner,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Inner {
    // Entries stay opaque JSON so the originals survive verbatim.
    list: Vec<Value>,
}

fn probe_within(payload: &[u8], needle: &[u8], window: usize) -> bool {
    if payload.len() < needle.len() {
        return false;
    }
    let last_start = (payload.len() - needle.len()).min(window);
    (0..=last_start).any(|i| &payload[i..i + needle.len()] == needle)
}

/// Classify a captured write as an app-list response.
pub fn is_app_list(payload: &[u8]) -> bool {
    probe_within(payload, LIST_PROBE, LIST_PROBE_WINDOW)
        && probe_within(payload, REQID_PROBE, REQID_PROBE_WINDOW)
}

/// Split the payload at the first `{` into `(prefix, json)`.
/// The prefix may be empty.
pub fn split_prefix(payload: &[u8]) -> Result<(&[u8], &[u8]), CodecError> {
    let start = payload
        .iter()
        .position(|&b| b == b'{')
        .ok_or(CodecError::NotJson)?;
    Ok(payload.split_at(start))
}

/// Extract the request correlation id from the JSON part of a payload.
pub fn extract_reqid(json: &[u8]) -> Result<String, CodecError> {
    let envelope: Envelope = serde_json::from_slice(json)?;
    Ok(envelope.data.reqid)
}

/// A rewritten response ready to be sent.
#[derive(Debug, Clone)]
pub struct Rewrite {
    /// `prefix || new JSON`, prefix length field already patched.
    pub bytes: Vec<u8>,
    /// The correlation id copied from the captured payload.
    pub reqid: String,
}

/// Build the rewritten response: `result` and `reqid` copied verbatim,
/// `list` = original entries followed by the record snapshot in its own
/// order.
pub fn merge_records(payload: &[u8], records: &[AppRecord]) -> Result<Rewrite, CodecError> {
    if !is_app_list(payload) {
        return Err(CodecError::NotAppList);
    }

    let (prefix, json) = split_prefix(payload)?;
    let envelope: Envelope = serde_json::from_slice(json)?;

    let mut list = envelope.data.data.list;
    for record in records {
        list.push(serde_json::to_value(record)?);
    }

    let reqid = envelope.data.reqid.clone();
    let rewritten = Envelope {
        data: Body {
            result: envelope.data.result,
            reqid: envelope.data.reqid,
            data: Inner { list },
        },
    };
    let new_json = serde_json::to_vec(&rewritten)?;

    let mut bytes = Vec::with_capacity(prefix.len() + new_json.len());
    bytes.extend_from_slice(prefix);
    if prefix.len() >= PREFIX_LEN_MIN {
        let len = u16::try_from(new_json.len()).map_err(|_| {
            CodecError::BadLength(format!("rewritten JSON is {} bytes", new_json.len()))
        })?;
        bytes[PREFIX_LEN_OFFSET..PREFIX_LEN_OFFSET + 2].copy_from_slice(&len.to_le_bytes());
    }
    bytes.extend_from_slice(&new_json);

    Ok(Rewrite { bytes, reqid })
}
