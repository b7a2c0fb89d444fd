//! Custom error types for the oscilloscope adapter.
//!
//! This module defines `AdapterError`, the single error type returned by the helper
//! supervisor, the command channel, the bus state machine and the instrument command set.
//! It is built with `thiserror` so every variant carries a human-readable message that a
//! front end can display as-is.
//!
//! ## Error Hierarchy
//!
//! - **`Launch`**: the helper executable is missing or could not be spawned. Fatal for the
//!   session and never retried automatically.
//! - **`NotRunning`**: an operation needing a live helper was called without one.
//! - **`Io`**: writing to the helper failed (broken pipe, dead process). The session has
//!   already been restarted when the caller sees this error; the failed command was not
//!   retried.
//! - **`Timeout`** / **`EmptyResponse`**: a response read did not complete, or completed
//!   with nothing but whitespace.
//! - **`InvalidAddress`** / **`InvalidValue`**: pure input validation. No I/O is performed
//!   and the helper is never restarted because of them.
//! - **`UnexpectedResponse`**: a query was answered with text that does not parse as the
//!   expected value.
//! - **`Connect`**: bus addressing went through but the instrument did not identify itself.
//! - **`State`**: a bus or mode transition was requested from a state that cannot reach it.
//! - **`Config`** / **`ConfigValidation`**: settings could not be loaded or are inconsistent.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the adapter error type.
pub type AdapterResult<T> = std::result::Result<T, AdapterError>;

/// Every failure the adapter layer can report.
#[derive(Error, Debug)]
pub enum AdapterError {
    /// The helper executable could not be spawned.
    #[error("Failed to launch helper '{path}': {source}")]
    Launch {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// An I/O call was made while the session is stopped.
    #[error("Helper process is not running")]
    NotRunning,

    /// Writing to the helper failed or blocked. The helper was restarted.
    #[error("Failed to send '{command}' to helper (helper restarted): {source}")]
    Io {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// Nothing complete arrived before the deadline.
    #[error("No complete response from instrument within {0:?}")]
    Timeout(Duration),

    /// Output arrived but was only whitespace.
    #[error("Instrument sent an empty response")]
    EmptyResponse,

    /// Bus address outside 1..=31.
    #[error("{0} is not a valid bus address (expected 1-31)")]
    InvalidAddress(u8),

    /// Parameter rejected before any line was written.
    #[error("'{value}' is not a valid value for {parameter}")]
    InvalidValue { parameter: &'static str, value: String },

    /// The instrument answered something that does not parse.
    #[error("Unexpected response to '{query}': '{response}'")]
    UnexpectedResponse { query: String, response: String },

    /// The addressed instrument failed the identification check.
    #[error("No instrument answered at bus address {0}")]
    Connect(u8),

    /// The requested bus transition is not possible from the current state.
    #[error("Invalid state: {0}")]
    State(String),

    /// Settings could not be loaded or merged.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// Settings loaded but hold an unusable value.
    #[error("Configuration validation error: {0}")]
    ConfigValidation(String),
}

impl AdapterError {
    /// Whether this error means the helper is gone and must be relaunched.
    ///
    /// Only write failures qualify. Validation errors never restart the helper.
    pub fn triggers_restart(&self) -> bool {
        matches!(self, AdapterError::Io { .. })
    }

    /// Whether the error only says the instrument did not answer in a usable way.
    pub fn is_no_answer(&self) -> bool {
        matches!(self, AdapterError::Timeout(_) | AdapterError::EmptyResponse)
    }
}
