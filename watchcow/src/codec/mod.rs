//! The two wire dialects the daemon speaks: the broker's app-list response
//! payloads and the hub's binary-framed notification messages, plus the
//! WebSocket-like framing used on the app-list path.

pub mod applist;
pub mod notify;
pub mod ws;
