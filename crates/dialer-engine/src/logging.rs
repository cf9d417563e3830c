//! Tracing subscriber setup for processes embedding the dialer engine.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, EnvFilter};

use crate::error::{DialerError, Result};

/// Configuration for the logging system
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Install the subscriber when the dialer server is built; embedders that set up
    /// their own subscriber turn this off
    pub enabled: bool,
    /// Default level directive; `RUST_LOG` directives are applied on top
    pub level: String,
    /// Whether to include file and line information
    pub file_info: bool,
    /// Whether to log span open/close events
    pub log_spans: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            level: "info".to_string(),
            file_info: false,
            log_spans: false,
        }
    }
}

impl LoggingConfig {
    pub fn new(level: Level) -> Self {
        Self {
            level: level.to_string().to_lowercase(),
            ..Default::default()
        }
    }

    /// Enable file and line information in logs
    pub fn with_file_info(mut self) -> Self {
        self.file_info = true;
        self
    }

    /// Enable span logging
    pub fn with_spans(mut self) -> Self {
        self.log_spans = true;
        self
    }

    pub fn validate(&self) -> Result<()> {
        parse_log_level(&self.level).map(|_| ())
    }
}

/// Parse a log level from a string
pub fn parse_log_level(level: &str) -> Result<Level> {
    Level::from_str(level)
        .map_err(|_| DialerError::configuration(format!("Invalid log level: {}", level)))
}

/// Install the global tracing subscriber.
///
/// Returns `Ok(false)` when a subscriber was already installed (common in tests).
pub fn init_logging(config: &LoggingConfig) -> Result<bool> {
    let level = parse_log_level(&config.level)?;
    let filter = EnvFilter::from_default_env().add_directive(level.into());

    let span_events = if config.log_spans {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let installed = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_span_events(span_events)
        .with_file(config.file_info)
        .with_line_number(config.file_info)
        .try_init()
        .is_ok();

    if installed {
        tracing::info!("Starting rvoip-dialer-engine v{}", env!("CARGO_PKG_VERSION"));
    }
    Ok(installed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert_eq!(parse_log_level("debug").unwrap(), Level::DEBUG);
        assert!(parse_log_level("chatty").is_err());
    }

    #[test]
    fn test_second_init_reports_existing_subscriber() {
        let config = LoggingConfig::new(Level::DEBUG);
        init_logging(&config).unwrap();
        assert!(!init_logging(&config).unwrap());
    }

    #[test]
    fn test_bad_level_fails_validation() {
        let config = LoggingConfig {
            level: "loud".to_string(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(DialerError::Configuration(_))));
    }

    #[test]
    fn test_new_lowercases_level() {
        assert_eq!(LoggingConfig::new(Level::WARN).level, "warn");
    }
}
