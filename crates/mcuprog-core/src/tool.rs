//! Device flashing tool abstraction
//!
//! The orchestrator never programs a device itself. It hands a
//! [`FlashRequest`] to a [`FlashTool`] implementation (the `arduino-cli`
//! backend, the dummy backend, or a test double) and gets back a
//! [`ToolReport`]. Implementations must bound every invocation by
//! [`FlashRequest::timeout`] and report expiry as [`ToolError::Timeout`].

use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use crate::board::Board;
use crate::error::ToolError;

/// One invocation of the flashing tool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashRequest {
    /// Firmware image or sketch
    pub firmware: PathBuf,
    /// Fully-qualified board name
    pub fqbn: String,
    /// Target serial port
    pub port: String,
    /// Read back and verify after writing
    pub verify: bool,
    /// Ask for verbose diagnostics
    pub verbose: bool,
    /// Upper bound for the invocation
    pub timeout: Duration,
}

/// Outcome of an invocation that ran to completion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolReport {
    /// Whether the device was programmed
    pub success: bool,
    /// Human-readable summary, including diagnostics on failure
    pub message: String,
}

impl ToolReport {
    /// Successful report
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    /// Failed report
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

/// External device flashing tool
pub trait FlashTool: Send + Sync + 'static {
    /// Short backend name for logs
    fn name(&self) -> &str;

    /// Confirm the tool is reachable, returning its version string
    fn check(&self) -> impl Future<Output = Result<String, ToolError>> + Send;

    /// Refresh the tool's package index
    fn update_index(&self) -> impl Future<Output = Result<(), ToolError>> + Send {
        async { Ok(()) }
    }

    /// Make sure everything needed to program `board` is installed
    fn prepare(&self, board: &Board) -> impl Future<Output = Result<String, ToolError>> + Send {
        let _ = board;
        async { Ok("Nothing to prepare".to_string()) }
    }

    /// Program one device
    fn program(
        &self,
        request: &FlashRequest,
    ) -> impl Future<Output = Result<ToolReport, ToolError>> + Send;
}
