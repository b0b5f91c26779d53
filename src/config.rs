//! Orchestrator configuration
//!
//! Runtime configuration loaded from the environment with validated
//! defaults. Every timeout gate used by the streaming coordinator lives
//! here so tests can compress the clock.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default per-user session cap (sliding window size).
pub const DEFAULT_SESSION_CAP: usize = 10;

/// Default per-session prompt cap.
pub const DEFAULT_PROMPT_CAP: usize = 15;

/// Queue names consumed from the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Token / status stream during active generation
    pub chat: String,
    /// Upstream-published latest-N session list
    pub session_index: String,
    /// Full transcript for a specific session on demand
    pub session_history: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            chat: "chat".to_string(),
            session_index: "session_index".to_string(),
            session_history: "session_history".to_string(),
        }
    }
}

/// Timeout gates for the streaming coordinator and the upstream client.
///
/// All values are milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Idle before the first bus message when upstream already reported the
    /// reply complete.
    pub first_message_complete_ms: u64,
    /// Idle before the first bus message when upstream has not reported
    /// completion.
    pub first_message_pending_ms: u64,
    /// Quiescence after the first message when upstream reported complete.
    pub quiescence_complete_ms: u64,
    /// Quiescence after the first message otherwise.
    pub quiescence_pending_ms: u64,
    /// Drain window after an upstream HTTP error before closing the stream.
    pub error_drain_ms: u64,
    /// Global safety cap on a single chat stream.
    pub global_ms: u64,
    /// Upstream metadata calls (session index, delete, counters).
    pub upstream_metadata_ms: u64,
    /// Upstream session history fetch.
    pub upstream_history_ms: u64,
    /// Upstream chat submission.
    pub upstream_chat_ms: u64,
    /// Upstream stop call.
    pub upstream_stop_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            first_message_complete_ms: 300,
            first_message_pending_ms: 1_000,
            quiescence_complete_ms: 1_500,
            quiescence_pending_ms: 5_000,
            error_drain_ms: 2_000,
            global_ms: 60_000,
            upstream_metadata_ms: 10_000,
            upstream_history_ms: 15_000,
            upstream_chat_ms: 30_000,
            upstream_stop_ms: 100_000,
        }
    }
}

impl TimeoutConfig {
    pub fn first_message_complete(&self) -> Duration {
        Duration::from_millis(self.first_message_complete_ms)
    }
    pub fn first_message_pending(&self) -> Duration {
        Duration::from_millis(self.first_message_pending_ms)
    }
    pub fn quiescence_complete(&self) -> Duration {
        Duration::from_millis(self.quiescence_complete_ms)
    }
    pub fn quiescence_pending(&self) -> Duration {
        Duration::from_millis(self.quiescence_pending_ms)
    }
    pub fn error_drain(&self) -> Duration {
        Duration::from_millis(self.error_drain_ms)
    }
    pub fn global(&self) -> Duration {
        Duration::from_millis(self.global_ms)
    }
}

/// Top-level orchestrator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Address the HTTP/WebSocket server binds to.
    pub bind: SocketAddr,
    /// Base URL of the upstream inference service.
    pub upstream_url: String,
    /// Per-user session cap (sliding window size).
    pub session_cap: usize,
    /// Per-session prompt cap.
    pub prompt_cap: usize,
    /// Bus queue names.
    #[serde(default)]
    pub queues: QueueConfig,
    /// Timeout table.
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from((Ipv4Addr::LOCALHOST, 8090)),
            upstream_url: "http://127.0.0.1:9000".to_string(),
            session_cap: DEFAULT_SESSION_CAP,
            prompt_cap: DEFAULT_PROMPT_CAP,
            queues: QueueConfig::default(),
            timeouts: TimeoutConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Build configuration from the environment, falling back to defaults.
    ///
    /// Recognized variables: `SLUICE_BIND`, `SLUICE_UPSTREAM_URL`,
    /// `SLUICE_SESSION_CAP`, `SLUICE_PROMPT_CAP`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(bind) = std::env::var("SLUICE_BIND") {
            if let Ok(addr) = bind.parse() {
                config.bind = addr;
            }
        }
        if let Ok(url) = std::env::var("SLUICE_UPSTREAM_URL") {
            if !url.trim().is_empty() {
                config.upstream_url = url.trim_end_matches('/').to_string();
            }
        }
        if let Ok(cap) = std::env::var("SLUICE_SESSION_CAP") {
            if let Ok(n) = cap.parse::<usize>() {
                if n > 0 {
                    config.session_cap = n;
                }
            }
        }
        if let Ok(cap) = std::env::var("SLUICE_PROMPT_CAP") {
            if let Ok(n) = cap.parse::<usize>() {
                if n > 0 {
                    config.prompt_cap = n;
                }
            }
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = OrchestratorConfig::default();
        assert_eq!(cfg.session_cap, 10);
        assert_eq!(cfg.prompt_cap, 15);
        assert_eq!(cfg.queues.chat, "chat");
        assert_eq!(cfg.timeouts.first_message_complete_ms, 300);
        assert_eq!(cfg.timeouts.quiescence_pending_ms, 5_000);
        assert_eq!(cfg.timeouts.upstream_stop_ms, 100_000);
    }

    #[test]
    fn test_timeout_accessors_match_ms_fields() {
        let t = TimeoutConfig::default();
        assert_eq!(t.global(), Duration::from_millis(t.global_ms));
        assert_eq!(t.error_drain(), Duration::from_millis(t.error_drain_ms));
    }
}
