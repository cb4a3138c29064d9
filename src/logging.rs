//! Tracing subscriber setup.
//!
//! The library only emits `tracing` events; installing a subscriber is left to the
//! embedding binary, which calls [`init`] once at startup.

use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use crate::{Error, ErrorContext, Result};

/// Install a global fmt subscriber writing to stderr.
///
/// `RUST_LOG` wins when it is set and parses; otherwise `level` is used. Calling this
/// twice in one process fails with [`Error::Configuration`].
pub fn init(level: &str) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => {
            parse_level(level)?;
            EnvFilter::try_new(level).map_err(|e| {
                logging_error(format!("invalid log level '{}': {}", level, e))
            })?
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| logging_error(format!("failed to set subscriber: {}", e)))
}

/// Validate a level name (`error`, `warn`, `info`, `debug`, `trace`, `off`).
pub fn parse_level(level: &str) -> Result<LevelFilter> {
    if level.trim().is_empty() {
        return Err(logging_error("log level must not be empty"));
    }
    level
        .trim()
        .parse::<LevelFilter>()
        .map_err(|_| logging_error(format!("unrecognised log level '{}'", level)))
}

fn logging_error(msg: impl Into<String>) -> Error {
    Error::configuration_with_context(
        msg,
        ErrorContext::new().with_field_path("log_level").with_source("logging"),
    )
}
