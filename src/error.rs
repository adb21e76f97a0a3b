//! CLI-level errors

use thiserror::Error;

/// Errors raised by the command-line front end itself
#[derive(Debug, Error)]
pub enum CliError {
    /// `--tool` names no compiled-in backend
    #[error("Unknown flashing tool '{0}' (available: {1})")]
    UnknownTool(String, String),

    /// The backend was left out at build time
    #[cfg_attr(
        all(feature = "arduino", feature = "serial", feature = "dummy"),
        allow(dead_code)
    )]
    #[error("{0} support is not compiled in")]
    FeatureDisabled(&'static str),

    /// The backend cannot perform the requested operation
    #[error("The {tool} backend does not support {operation}")]
    Unsupported {
        /// Backend name
        tool: String,
        /// Operation that was requested
        operation: &'static str,
    },

    /// The controller refused to start the session
    #[error("Session not started: {0}")]
    Rejected(String),

    /// Board selection not found in the database
    #[error("Unknown board: {0}")]
    UnknownBoard(String),
}
