//! Error types for serial enumeration

use mcuprog_core::EnumerationError;
use thiserror::Error;

/// Serial enumeration errors
#[derive(Debug, Error)]
pub enum SerialError {
    /// The platform port listing failed
    #[error("Serial port error: {0}")]
    Serialport(#[from] serialport::Error),
}

/// Result type for serial enumeration
pub type Result<T> = std::result::Result<T, SerialError>;

impl From<SerialError> for EnumerationError {
    fn from(e: SerialError) -> Self {
        EnumerationError(e.to_string())
    }
}
