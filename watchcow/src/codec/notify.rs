//! The hub's binary-framed notification message.
//!
//! Layout: a 37-byte little-endian header, a JSON body, and a trailing
//! `\0trim.sac\0` marker. The hub discards anything that deviates from this
//! layout, so field order and the constant markers are exact.

use serde::Serialize;

use crate::error::CodecError;
use crate::record::ContainerState;

/// Fixed header size in bytes.
pub const HEADER_LEN: usize = 37;
/// Trailing sender marker.
pub const TRAILER: &[u8; 10] = b"\0trim.sac\0";

/// Constant marker repeated at offsets 4 and 8.
const MARKER: u32 = 0x0000_0200;
const NOTIFY_ID: u32 = 1;
const NOTIFY_CATEGORY: u32 = 1000;
const NOTIFY_LEVEL: u32 = 0;
/// Eight ASCII spaces in the title slot.
const TITLE_SLOT: &[u8; 8] = b"        ";

const SENDER: &str = "trim.sac";
const EVENT_ID: &str = "entryChange";

#[derive(Serialize)]
struct NotifyBody<'a> {
    from: &'static str,
    #[serde(rename = "eventId")]
    event_id: &'static str,
    data: NotifyData<'a>,
}

#[derive(Serialize)]
struct NotifyData<'a> {
    apps: [AppStateChange<'a>; 1],
}

#[derive(Serialize)]
struct AppStateChange<'a> {
    #[serde(rename = "appName")]
    app_name: &'a str,
    state: &'static str,
}

/// Encode a complete notification message for one app state transition.
pub fn encode(
    app_name: &str,
    state: ContainerState,
    unix_seconds: u32,
) -> Result<Vec<u8>, CodecError> {
    let body = serde_json::to_vec(&NotifyBody {
        from: SENDER,
        event_id: EVENT_ID,
        data: NotifyData {
            apps: [AppStateChange {
                app_name,
                state: state.as_str(),
            }],
        },
    })?;

    let total_len = HEADER_LEN + body.len() + TRAILER.len();

    let mut buf = Vec::with_capacity(total_len);
    buf.extend_from_slice(&(total_len as u32).to_le_bytes());
    buf.extend_from_slice(&MARKER.to_le_bytes());
    buf.extend_from_slice(&MARKER.to_le_bytes());
    buf.extend_from_slice(&unix_seconds.to_le_bytes());
    buf.extend_from_slice(&NOTIFY_ID.to_le_bytes());
    buf.extend_from_slice(&NOTIFY_CATEGORY.to_le_bytes());
    buf.extend_from_slice(&NOTIFY_LEVEL.to_le_bytes());
    buf.extend_from_slice(TITLE_SLOT);
    buf.push(0);
    buf.extend_from_slice(&body);
    buf.extend_from_slice(TRAILER);

    Ok(buf)
}
