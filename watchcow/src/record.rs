//! Container-derived application records and their label surface.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

const LABEL_ENABLE: &str = "watchcow.enable";
const LABEL_APP_NAME: &str = "watchcow.appName";
const LABEL_TITLE: &str = "watchcow.title";
const LABEL_PORT: &str = "watchcow.port";
const LABEL_FN_DOMAIN: &str = "watchcow.fnDomain";
const LABEL_APP_ID: &str = "watchcow.appID";
const LABEL_ENTRY_NAME: &str = "watchcow.entryName";
const LABEL_DESC: &str = "watchcow.desc";
const LABEL_ICON: &str = "watchcow.icon";
const LABEL_CATEGORY: &str = "watchcow.category";
const LABEL_PROTOCOL: &str = "watchcow.protocol";
const LABEL_HOST: &str = "watchcow.host";
const LABEL_PATH: &str = "watchcow.path";
const LABEL_MICRO_APP: &str = "watchcow.microApp";
const LABEL_NATIVE_APP: &str = "watchcow.nativeApp";
const LABEL_IS_DISPLAY: &str = "watchcow.isDisplay";

const DEFAULT_CATEGORY: &str = "Docker";
const DEFAULT_PROTOCOL: &str = "http";
const DEFAULT_PATH: &str = "/";
const DEFAULT_ICON: &str = "https://www.docker.com/wp-content/uploads/2022/03/Moby-logo.png";

/// Container lifecycle states the hub understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Starting,
    Running,
    Stopped,
}

impl ContainerState {
    pub fn as_str(self) -> &'static str {
        match self {
            ContainerState::Starting => "starting",
            ContainerState::Running => "running",
            ContainerState::Stopped => "stopped",
        }
    }
}

/// A synthesized application entry, injected verbatim into app-list
/// responses.
///
/// Serialization matches the shell broker's own entry shape field for
/// field; `protocol`, `host`, `path` and `port` are bookkeeping used to
/// compute `full_url` and never appear on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppRecord {
    #[serde(rename = "appName")]
    pub app_name: String,
    #[serde(rename = "appID")]
    pub app_id: String,
    #[serde(rename = "entryName")]
    pub entry_name: String,
    pub title: String,
    pub desc: String,
    pub icon: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub uri: String,
    #[serde(rename = "microApp")]
    pub micro_app: bool,
    #[serde(rename = "nativeApp")]
    pub native_app: bool,
    #[serde(rename = "fullUrl")]
    pub full_url: String,
    pub status: String,
    #[serde(rename = "fileTypes")]
    pub file_types: Vec<String>,
    #[serde(rename = "isDisplay")]
    pub is_display: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub category: String,

    #[serde(skip)]
    pub protocol: String,
    #[serde(skip)]
    pub host: String,
    #[serde(skip)]
    pub path: String,
    #[serde(skip)]
    pub port: String,
}

/// Truthy label values: true / 1 / yes, case-insensitive.
fn label_truthy(value: &str) -> bool {
    value.eq_ignore_ascii_case("true")
        || value == "1"
        || value.eq_ignore_ascii_case("yes")
}

fn label<'a>(labels: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    labels.get(key).map(String::as_str).filter(|v| !v.is_empty())
}

/// Derive an [`AppRecord`] from a container's labels.
///
/// Returns `None` when the container does not opt in
/// (`watchcow.enable != "true"`) or a required label is missing.
/// `fallback_port` is the container's first published port, used when
/// `watchcow.port` is absent.
pub fn derive_record(
    container_id: &str,
    labels: &HashMap<String, String>,
    fallback_port: Option<u16>,
) -> Option<AppRecord> {
    if labels.get(LABEL_ENABLE).map(String::as_str) != Some("true") {
        debug!(container = container_id, "container not enabled, skipping");
        return None;
    }

    let Some(app_name) = label(labels, LABEL_APP_NAME) else {
        warn!(container = container_id, "missing {} label", LABEL_APP_NAME);
        return None;
    };
    let Some(title) = label(labels, LABEL_TITLE) else {
        warn!(container = container_id, "missing {} label", LABEL_TITLE);
        return None;
    };
    let Some(fn_domain) = label(labels, LABEL_FN_DOMAIN) else {
        warn!(container = container_id, "missing {} label", LABEL_FN_DOMAIN);
        return None;
    };
    let port = match label(labels, LABEL_PORT) {
        Some(p) => p.to_string(),
        None => match fallback_port {
            Some(p) => p.to_string(),
            None => {
                warn!(
                    container = container_id,
                    "missing {} label and no published port", LABEL_PORT
                );
                return None;
            }
        },
    };

    let protocol = label(labels, LABEL_PROTOCOL).unwrap_or(DEFAULT_PROTOCOL);
    let host = label(labels, LABEL_HOST).unwrap_or("");
    let path = label(labels, LABEL_PATH).unwrap_or(DEFAULT_PATH);

    // The URL host slot prefers an explicit host label; otherwise the
    // host-OS domain the entry is served under.
    let url_host = if host.is_empty() { fn_domain } else { host };
    let full_url = format!("{}://{}:{}{}", protocol, url_host, port, path);

    Some(AppRecord {
        app_name: app_name.to_string(),
        app_id: label(labels, LABEL_APP_ID)
            .unwrap_or(container_id)
            .to_string(),
        entry_name: label(labels, LABEL_ENTRY_NAME)
            .unwrap_or(app_name)
            .to_string(),
        title: title.to_string(),
        desc: label(labels, LABEL_DESC).unwrap_or("").to_string(),
        icon: label(labels, LABEL_ICON).unwrap_or(DEFAULT_ICON).to_string(),
        kind: "app".to_string(),
        uri: full_url.clone(),
        micro_app: label(labels, LABEL_MICRO_APP).is_some_and(label_truthy),
        native_app: label(labels, LABEL_NATIVE_APP).is_some_and(label_truthy),
        full_url,
        status: ContainerState::Running.as_str().to_string(),
        file_types: Vec::new(),
        is_display: label(labels, LABEL_IS_DISPLAY).map_or(true, label_truthy),
        category: label(labels, LABEL_CATEGORY)
            .unwrap_or(DEFAULT_CATEGORY)
            .to_string(),
        protocol: protocol.to_string(),
        host: host.to_string(),
        path: path.to_string(),
        port,
    })
}
