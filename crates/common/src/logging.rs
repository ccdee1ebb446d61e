//! Logging initialisation for micro binaries.
//!
//! Libraries in this workspace only emit `tracing` events; installing a
//! subscriber is left to the binary that owns the process.

use serde::{Deserialize, Serialize};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Output format of the process-wide subscriber.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human readable, one line per event.
    #[default]
    Text,
    /// One JSON object per event.
    Json,
}

/// Failure to install the global subscriber.
#[derive(Debug, thiserror::Error)]
#[error("failed to install tracing subscriber: {0}")]
pub struct LoggingError(String);

/// Initialize tracing with sensible defaults.
///
/// Uses the RUST_LOG environment variable to control log levels.
/// Default level is INFO.
pub fn init() {
    let _ = init_with_level("info", LogFormat::Text);
}

/// Initialize tracing with JSON formatting (useful for structured logging).
pub fn init_json() {
    let _ = init_with_level("info", LogFormat::Json);
}

/// Initialize tracing with an explicit fallback level and format.
///
/// `RUST_LOG` still wins over `level` when it is set. Returns an error when a
/// global subscriber has already been installed.
pub fn init_with_level(level: &str, format: LogFormat) -> Result<(), LoggingError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let result = match format {
        LogFormat::Text => tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .try_init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .try_init(),
    };

    result.map_err(|e| LoggingError(e.to_string()))
}
