//! Error types for arduino-cli operations

use std::path::PathBuf;
use std::time::Duration;

use mcuprog_core::ToolError;
use thiserror::Error;

/// arduino-cli specific errors
#[derive(Debug, Error)]
pub enum ArduinoError {
    /// The executable is not installed or not on `PATH`
    #[error("{0} not found")]
    NotFound(String),

    /// The process could not be started
    #[error("Failed to run {program}: {source}")]
    Spawn {
        /// Executable that failed to start
        program: String,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// The process did not finish in time
    #[error("{command} timed out after {} seconds", .timeout.as_secs())]
    Timeout {
        /// Sub-command that timed out
        command: String,
        /// Budget that was exceeded
        timeout: Duration,
    },

    /// The process exited with a failure status
    #[error("{command} failed: {output}")]
    CommandFailed {
        /// Sub-command that failed
        command: String,
        /// stderr, or stdout when stderr was empty
        output: String,
    },

    /// Firmware extension is neither a sketch nor a binary image
    #[error("Unsupported file type: {0}")]
    UnsupportedFirmware(String),

    /// Compilation succeeded but produced no uploadable image
    #[error("Compilation succeeded but no binary was found in {}", .0.display())]
    NoBinary(PathBuf),

    /// A `--format json` listing could not be decoded
    #[error("Unexpected arduino-cli output: {0}")]
    Json(#[from] serde_json::Error),

    /// Output directory could not be prepared
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for arduino-cli operations
pub type Result<T> = std::result::Result<T, ArduinoError>;

impl From<ArduinoError> for ToolError {
    fn from(e: ArduinoError) -> Self {
        match e {
            ArduinoError::NotFound(program) => ToolError::Unavailable(format!("{} not found", program)),
            ArduinoError::Spawn { source, .. } => ToolError::Spawn(source),
            ArduinoError::Timeout { timeout, .. } => ToolError::Timeout(timeout),
            ArduinoError::UnsupportedFirmware(ext) => ToolError::UnsupportedFirmware(ext),
            other => ToolError::Other(other.to_string()),
        }
    }
}
