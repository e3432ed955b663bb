//! Tracing setup

use crate::config::LoggingConfig;
use crate::{ResourceError, Result};

/// Map a configured level name to a tracing level; unknown names mean info
pub fn parse_log_level(level: &str) -> tracing::Level {
    match level.to_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "info" => tracing::Level::INFO,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    }
}

/// Install the global fmt subscriber at the configured level
///
/// Fails if a global subscriber is already installed; callers that may run
/// more than once can ignore that error.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(parse_log_level(&config.log_level))
        .try_init()
        .map_err(|e| {
            ResourceError::configuration_error("logging.log_level".to_string(), e.to_string())
        })
}
