//! Programming jobs

use std::fmt;
use std::path::{Path, PathBuf};

use crate::board::Board;
use crate::topology::{Port, DIRECT_GROUP};

/// Session-unique job identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One admitted unit of work: program `firmware` onto the device at `port`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgrammingJob {
    /// Identifier assigned at admission
    pub id: JobId,
    /// Target port id
    pub port: String,
    /// Hub group the port was admitted under
    pub hub_group: String,
    /// Board to program
    pub board: Board,
    /// Firmware image or sketch
    pub firmware: PathBuf,
    /// 0-based index of the current attempt
    pub attempt: u32,
    /// Upper bound on attempts (`max_retries + 1`)
    pub max_attempts: u32,
}

impl ProgrammingJob {
    /// Create a job for an admitted port
    pub fn new(id: JobId, port: &Port, board: Board, firmware: &Path, max_attempts: u32) -> Self {
        Self {
            id,
            port: port.id.clone(),
            hub_group: port.hub_group.clone(),
            board,
            firmware: firmware.to_path_buf(),
            attempt: 0,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Whether the port is outside any hub group
    pub fn is_direct(&self) -> bool {
        self.hub_group == DIRECT_GROUP
    }

    /// Firmware file name for display
    pub fn firmware_name(&self) -> String {
        self.firmware
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.firmware.display().to_string())
    }
}
