//! # Logging Setup
//!
//! The library itself only emits `tracing` events. Binaries call
//! [`init_tracing`] once at startup to install a subscriber; `RUST_LOG`, when
//! set, takes precedence over the level passed in.

use thiserror::Error;
use tracing_subscriber::EnvFilter;

/// Failure to install the global subscriber.
#[derive(Debug, Error)]
pub enum LoggerError {
    /// The level string is not a valid filter directive.
    #[error("invalid log level '{level}': {message}")]
    InvalidLevel {
        /// The rejected directive.
        level: String,
        /// Parser message.
        message: String,
    },

    /// A global subscriber was already installed.
    #[error("tracing subscriber already initialised: {0}")]
    AlreadyInitialised(String),
}

/// Builds the filter: `RUST_LOG` if present, otherwise `level`.
pub fn build_filter(level: &str) -> Result<EnvFilter, LoggerError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(level).map_err(|err| LoggerError::InvalidLevel {
        level: level.to_string(),
        message: err.to_string(),
    })
}

/// Installs a `fmt` subscriber, human-readable or JSON.
pub fn init_tracing(level: &str, json: bool) -> Result<(), LoggerError> {
    let filter = build_filter(level)?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_names(true);

    let result = if json {
        builder.json().flatten_event(true).try_init()
    } else {
        builder.compact().try_init()
    };
    result.map_err(|err| LoggerError::AlreadyInitialised(err.to_string()))
}
