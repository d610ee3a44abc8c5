//! Logging setup helpers.
//!
//! The crate emits structured events through `tracing`: registration
//! traces, scope-analyzer advisories, and recovered cleanup panics. This
//! module (behind the `logging` feature) wires up a `tracing-subscriber`
//! so applications that do not bring their own subscriber still see them.
//!
//! # Example
//!
//! ```rust,ignore
//! use lifescope::logging;
//!
//! // JSON output for production log aggregation.
//! logging::init_json();
//!
//! // Or configure explicitly.
//! logging::builder()
//!     .with_level(tracing::Level::DEBUG)
//!     .crate_only()
//!     .pretty()
//!     .init();
//! ```

use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Output format for the installed subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// JSON structured output (production default).
    #[default]
    Json,
    /// Human-readable multi-line output.
    Pretty,
    /// Single-line output.
    Compact,
}

/// Builder for the subscriber configuration.
#[derive(Debug, Clone)]
pub struct LoggingBuilder {
    level: Level,
    format: LogFormat,
    target: Option<&'static str>,
}

impl Default for LoggingBuilder {
    fn default() -> Self {
        Self {
            level: Level::DEBUG,
            format: LogFormat::Json,
            target: None,
        }
    }
}

impl LoggingBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Minimum level to record.
    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    /// Only record events from a specific target.
    pub fn with_target_filter(mut self, target: &'static str) -> Self {
        self.target = Some(target);
        self
    }

    /// Only record this crate's events.
    pub fn crate_only(self) -> Self {
        self.with_target_filter("lifescope")
    }

    pub fn json(mut self) -> Self {
        self.format = LogFormat::Json;
        self
    }

    pub fn pretty(mut self) -> Self {
        self.format = LogFormat::Pretty;
        self
    }

    pub fn compact(mut self) -> Self {
        self.format = LogFormat::Compact;
        self
    }

    /// Installs the global subscriber.
    pub fn init(self) {
        let filter = match self.target {
            Some(target) => EnvFilter::new(format!("{}={}", target, self.level)),
            None => EnvFilter::new(self.level.to_string()),
        };

        match self.format {
            LogFormat::Json => tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_target(true))
                .init(),
            LogFormat::Pretty => tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().pretty().with_target(true))
                .init(),
            LogFormat::Compact => tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().compact().with_target(true))
                .init(),
        }
    }
}

/// Creates a new logging builder.
pub fn builder() -> LoggingBuilder {
    LoggingBuilder::new()
}

/// Installs a JSON subscriber at DEBUG level.
pub fn init_json() {
    builder().json().init();
}

/// Installs a pretty subscriber at DEBUG level.
pub fn init_pretty() {
    builder().pretty().init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let builder = LoggingBuilder::default();
        assert_eq!(builder.level, Level::DEBUG);
        assert_eq!(builder.format, LogFormat::Json);
        assert!(builder.target.is_none());
    }

    #[test]
    fn test_builder_chain() {
        let builder = LoggingBuilder::new()
            .with_level(Level::TRACE)
            .pretty()
            .crate_only();
        assert_eq!(builder.level, Level::TRACE);
        assert_eq!(builder.format, LogFormat::Pretty);
        assert_eq!(builder.target, Some("lifescope"));
    }
}
