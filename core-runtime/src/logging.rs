//! # Logging & Tracing Infrastructure
//!
//! Structured logging with the `tracing` crate: JSON and pretty-print output
//! formats, module-level filtering via `EnvFilter` syntax, and sane defaults
//! per build profile.
//!
//! ## Usage
//!
//! ```ignore
//! use core_runtime::logging::{init_logging, LogFormat, LoggingConfig};
//!
//! let config = LoggingConfig::default()
//!     .with_format(LogFormat::Pretty)
//!     .with_filter("core_files=debug");
//! init_logging(config).expect("Failed to initialize logging");
//!
//! tracing::info!("File manager started");
//! ```

use tracing::Level;
use tracing_subscriber::{filter::EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::error::{Error, Result};

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable pretty format with colors
    Pretty,
    /// Structured JSON format for machine parsing
    Json,
    /// Compact format for production
    Compact,
}

impl Default for LogFormat {
    fn default() -> Self {
        #[cfg(debug_assertions)]
        return Self::Pretty;

        #[cfg(not(debug_assertions))]
        return Self::Json;
    }
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Output format
    pub format: LogFormat,
    /// Minimum log level when no custom filter is given
    pub level: Level,
    /// Custom filter string (e.g., "core_files=debug,bridge_traits=trace")
    pub filter: Option<String>,
    /// Display target module in logs
    pub display_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            level: Level::INFO,
            filter: None,
            display_target: true,
        }
    }
}

impl LoggingConfig {
    /// Set log format
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Set minimum log level
    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    /// Set a custom `EnvFilter` directive string
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    /// Toggle target-module display
    pub fn with_display_target(mut self, display: bool) -> Self {
        self.display_target = display;
        self
    }
}

/// Initialize the global tracing subscriber.
///
/// Fails if a global subscriber is already installed or the filter string is
/// invalid. Call once at startup; tests use per-test subscribers instead.
pub fn init_logging(config: LoggingConfig) -> Result<()> {
    let filter = match &config.filter {
        Some(directives) => EnvFilter::try_new(directives)
            .map_err(|e| Error::Config(format!("Invalid log filter: {}", e)))?,
        None => EnvFilter::new(config.level.to_string()),
    };

    let registry = tracing_subscriber::registry().with(filter);

    let init_result = match config.format {
        LogFormat::Pretty => registry
            .with(fmt::layer().pretty().with_target(config.display_target))
            .try_init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_target(config.display_target))
            .try_init(),
        LogFormat::Compact => registry
            .with(fmt::layer().compact().with_target(config.display_target))
            .try_init(),
    };

    init_result.map_err(|e| Error::Internal(format!("Failed to install subscriber: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LoggingConfig::default();
        assert_eq!(config.level, Level::INFO);
        assert!(config.filter.is_none());
        assert!(config.display_target);
    }

    #[test]
    fn test_builder_chain() {
        let config = LoggingConfig::default()
            .with_format(LogFormat::Compact)
            .with_level(Level::DEBUG)
            .with_filter("core_files=trace")
            .with_display_target(false);

        assert_eq!(config.format, LogFormat::Compact);
        assert_eq!(config.level, Level::DEBUG);
        assert_eq!(config.filter.as_deref(), Some("core_files=trace"));
        assert!(!config.display_target);
    }

    #[test]
    fn test_invalid_filter_is_rejected() {
        let config = LoggingConfig::default().with_filter("core_files=notalevel");
        assert!(init_logging(config).is_err());
    }
}
