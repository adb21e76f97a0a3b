//! Error types for mcuprog-core
//!
//! Only errors that stop a session from starting (or stop the process from
//! talking to a collaborator at all) live here. Per-attempt programming
//! failures never become an `Error`: they are folded into the terminal
//! [`ProgrammingResult`](crate::stats::ProgrammingResult) by the retry loop.

use std::time::Duration;
use thiserror::Error;

use crate::board::BoardDbError;

/// Configuration problems detected before a session may start
#[derive(Debug, Error)]
pub enum ConfigError {
    /// No board selected
    #[error("No target board selected")]
    MissingBoard,

    /// Board name not present in the board database
    #[error("Unknown board: {0}")]
    UnknownBoard(String),

    /// No firmware selected
    #[error("No firmware file selected")]
    MissingFirmware,

    /// Firmware path does not point at an existing file
    #[error("Firmware file not found: {0}")]
    FirmwareNotFound(String),

    /// A field that must be strictly positive was zero or negative
    #[error("{field} must be greater than zero (got {value})")]
    NotPositive {
        /// Configuration field name
        field: &'static str,
        /// Rejected value, formatted
        value: String,
    },

    /// A field that must not be negative was negative
    #[error("{field} must not be negative (got {value})")]
    Negative {
        /// Configuration field name
        field: &'static str,
        /// Rejected value, formatted
        value: String,
    },

    /// Unknown execution mode string
    #[error("Unknown execution mode: '{0}' (expected 'continuous' or 'single-batch')")]
    UnknownMode(String),

    /// The external flashing tool did not answer its reachability check
    #[error("Flashing tool not available: {0}")]
    ToolUnavailable(String),

    /// Board preparation (core installation) failed
    #[error("Failed to prepare board {board}: {reason}")]
    PreparationFailed {
        /// Board the preparation was attempted for
        board: String,
        /// Tool diagnostic
        reason: String,
    },

    /// Settings file could not be parsed
    #[error("Invalid settings file: {0}")]
    Parse(#[from] toml::de::Error),

    /// Settings file could not be read
    #[error("Cannot read settings file: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure of a single external tool invocation
///
/// Every variant is recoverable from the orchestrator's point of view: the
/// retry loop turns it into a failed attempt and carries on.
#[derive(Debug, Error)]
pub enum ToolError {
    /// The invocation exceeded its time budget
    #[error("Upload timed out after {} seconds", .0.as_secs())]
    Timeout(Duration),

    /// The tool process could not be started
    #[error("Failed to launch flashing tool: {0}")]
    Spawn(#[from] std::io::Error),

    /// Firmware file extension not understood by the tool
    #[error("Unsupported file type: {0}")]
    UnsupportedFirmware(String),

    /// The tool is not installed or does not answer
    #[error("Flashing tool unavailable: {0}")]
    Unavailable(String),

    /// Anything else reported by the tool backend
    #[error("{0}")]
    Other(String),
}

/// Failure of the serial enumerator
#[derive(Debug, Error)]
#[error("Port enumeration failed: {0}")]
pub struct EnumerationError(pub String);

/// Top-level error type for mcuprog-core
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid or incomplete configuration
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Board database could not be loaded
    #[error(transparent)]
    Board(#[from] BoardDbError),

    /// Enumerator failure outside a running session
    #[error(transparent)]
    Enumeration(#[from] EnumerationError),

    /// Tool failure outside a running session
    #[error(transparent)]
    Tool(#[from] ToolError),

    /// The session controller task has gone away
    #[error("Session controller is no longer running")]
    SessionClosed,
}

/// Result type for mcuprog-core operations
pub type Result<T> = std::result::Result<T, Error>;
