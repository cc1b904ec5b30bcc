//! WatchCow - Docker containers as first-class fnOS applications.
//!
//! A side-car daemon that intercepts the desktop shell broker's app-list
//! responses in flight (via an eBPF write probe), rewrites them to include
//! running containers, and injects state-change notifications through the
//! broker's own sockets.
//!
//! This library provides the capture, codec, injection and orchestration
//! machinery; the binary in main.rs wires it together.

pub mod capture;
pub mod codec;
pub mod config;
pub mod docker;
pub mod error;
pub mod inject;
pub mod orchestrator;
pub mod record;
pub mod state;
pub mod util;

pub use config::Config;
pub use orchestrator::{AppEvent, Orchestrator};
