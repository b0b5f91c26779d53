//! sluice orchestrator library
//!
//! This library provides the core functionality for the sluice streaming
//! chat orchestrator: the HTTP/WebSocket gateway, the per-chat streaming
//! coordinator, the session catalog, and the bus consumer lifecycle.

pub mod bus;
pub mod catalog;
pub mod cli;
pub mod config;
pub mod fanout;
pub mod logging;
pub mod models;
pub mod registry;
pub mod server;
pub mod state;
pub mod stream;
pub mod thinking;
pub mod transcript;
pub mod upstream;

/// Current time as Unix milliseconds.
pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
