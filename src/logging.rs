//! Logging subsystem
//!
//! Structured logging via tracing with support for JSON (production) and
//! plaintext (development) output formats.
//!
//! # Log Targets
//!
//! Use these consistent target names across the codebase:
//! - `server` - HTTP server and push channel
//! - `stream` - per-chat streaming coordinator
//! - `bus` - bus connection and consumers
//! - `upstream` - upstream HTTP client
//! - `catalog` - session catalog
//!
//! # Environment Variables
//!
//! - `SLUICE_LOG` - Primary log level/filter (takes precedence)
//! - `RUST_LOG` - Fallback log level/filter

use std::io;
use std::sync::OnceLock;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Guard to track if logging has been initialized
static INIT_GUARD: OnceLock<()> = OnceLock::new();

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// JSON format for production (structured logs)
    Json,
    /// Human-readable plaintext for development
    #[default]
    Plaintext,
}

/// Configuration for the logging subsystem
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Output format (JSON or plaintext)
    pub format: LogFormat,
    /// Default log level when no env filter is set
    pub default_level: Level,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Plaintext,
            default_level: Level::INFO,
        }
    }
}

impl LogConfig {
    /// Development configuration (plaintext, debug level)
    pub fn development() -> Self {
        Self {
            format: LogFormat::Plaintext,
            default_level: Level::DEBUG,
        }
    }

    /// Production configuration (JSON, info level)
    pub fn production() -> Self {
        Self {
            format: LogFormat::Json,
            default_level: Level::INFO,
        }
    }
}

/// Errors from logging initialization
#[derive(Debug, thiserror::Error)]
pub enum LogInitError {
    #[error("logging already initialized")]
    AlreadyInitialized,
    #[error("failed to set global subscriber: {0}")]
    SetGlobal(String),
}

/// Build the env filter from `SLUICE_LOG`, then `RUST_LOG`, then the default
/// level.
fn build_env_filter(default_level: Level) -> EnvFilter {
    if let Ok(filter) = std::env::var("SLUICE_LOG") {
        if !filter.trim().is_empty() {
            if let Ok(parsed) = EnvFilter::try_new(&filter) {
                return parsed;
            }
        }
    }
    if let Ok(filter) = std::env::var("RUST_LOG") {
        if !filter.trim().is_empty() {
            if let Ok(parsed) = EnvFilter::try_new(&filter) {
                return parsed;
            }
        }
    }
    EnvFilter::new(default_level.to_string().to_lowercase())
}

/// Initialize the global logging subscriber.
///
/// Safe to call once per process; subsequent calls return
/// `LogInitError::AlreadyInitialized`.
pub fn init_logging(config: LogConfig) -> Result<(), LogInitError> {
    if INIT_GUARD.set(()).is_err() {
        return Err(LogInitError::AlreadyInitialized);
    }

    let filter = build_env_filter(config.default_level);

    match config.format {
        LogFormat::Json => {
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(io::stdout)
                .with_target(true)
                .with_filter(filter);
            tracing_subscriber::registry()
                .with(layer)
                .try_init()
                .map_err(|e| LogInitError::SetGlobal(e.to_string()))?;
        }
        LogFormat::Plaintext => {
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(io::stdout)
                .with_target(true)
                .with_filter(filter);
            tracing_subscriber::registry()
                .with(layer)
                .try_init()
                .map_err(|e| LogInitError::SetGlobal(e.to_string()))?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_plaintext_info() {
        let cfg = LogConfig::default();
        assert_eq!(cfg.format, LogFormat::Plaintext);
        assert_eq!(cfg.default_level, Level::INFO);
    }

    #[test]
    fn test_production_config_is_json() {
        let cfg = LogConfig::production();
        assert_eq!(cfg.format, LogFormat::Json);
        assert_eq!(cfg.default_level, Level::INFO);
    }

    #[test]
    fn test_development_config_is_debug() {
        let cfg = LogConfig::development();
        assert_eq!(cfg.default_level, Level::DEBUG);
    }
}
