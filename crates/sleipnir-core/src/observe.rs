//! Structured logging setup via the `tracing` ecosystem.
//!
//! The engine itself only emits `tracing` events (sync transitions, MAC
//! failures, queue overflow, PTT changes); this module is the one place an
//! embedding application configures where those events go.
//!
//! ## Example
//!
//! ```rust,no_run
//! use sleipnir_core::observe::{init_logging, LogConfig, LogFormat, LogLevel};
//!
//! let config = LogConfig {
//!     level: LogLevel::Debug,
//!     format: LogFormat::Compact,
//!     ..Default::default()
//! };
//! init_logging(&config).unwrap();
//!
//! tracing::info!(superframes = 25, "engine up");
//! ```

use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

use crate::types::{Result, SleipnirError};

/// Log level threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        };
        f.write_str(name)
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable, multi-line.
    Pretty,
    /// One line per event.
    #[default]
    Compact,
    /// Machine-readable JSON.
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default level threshold.
    pub level: LogLevel,
    /// Output format.
    pub format: LogFormat,
    /// Optional module filter, e.g. `"sleipnir_core=debug"`. Overrides
    /// `level` when set; the `RUST_LOG` environment variable overrides
    /// both.
    pub filter: Option<String>,
    /// Include thread names (useful with the pipeline tasks).
    pub thread_names: bool,
}

/// Install the global tracing subscriber.
///
/// Fails if a subscriber is already installed; embedding applications that
/// bring their own subscriber simply skip this call.
pub fn init_logging(config: &LogConfig) -> Result<()> {
    let directives = config
        .filter
        .clone()
        .unwrap_or_else(|| config.level.to_string());
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(directives));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(config.thread_names);

    let installed = match config.format {
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    installed.map_err(|e| SleipnirError::InvalidConfig(format!("logging setup: {e}")))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_round_trip_through_serde() {
        let level: LogLevel = serde_json::from_str("\"debug\"").unwrap();
        assert_eq!(level, LogLevel::Debug);
        assert_eq!(serde_json::to_string(&LogFormat::Json).unwrap(), "\"json\"");
    }

    #[test]
    fn test_default_config() {
        let config = LogConfig::default();
        assert_eq!(config.level, LogLevel::Info);
        assert_eq!(config.format, LogFormat::Compact);
        assert!(config.filter.is_none());
    }

    #[test]
    fn test_init_logging_is_idempotent_per_process() {
        // First call may or may not win the global slot (other tests race
        // for it); a second call must fail cleanly rather than panic.
        let config = LogConfig::default();
        let _ = init_logging(&config);
        assert!(init_logging(&config).is_err());
    }
}
