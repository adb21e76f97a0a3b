//! mcuprog-dummy - Simulated flashing tool and port enumerator
//!
//! Lets a full programming session run without hardware or arduino-cli:
//! [`DummyTool`] pretends to program devices, [`DummyEnumerator`] serves a
//! port list that can be changed at runtime to simulate plugging and
//! unplugging boards.

#![warn(missing_docs)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use mcuprog_core::{
    Board, EnumerationError, FlashRequest, FlashTool, PortEnumerator, RawPort, ToolError,
    ToolReport,
};

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Behaviour of the dummy tool
#[derive(Debug, Clone)]
pub struct DummyConfig {
    /// Simulated time one programming call takes
    pub program_time: Duration,
    /// Every n-th call (1-based, counted per port) fails; `None` never fails
    pub fail_every: Option<u32>,
    /// Ports on which every call fails
    pub fail_ports: Vec<String>,
    /// Version string reported by `check`
    pub version: String,
}

impl Default for DummyConfig {
    fn default() -> Self {
        Self {
            program_time: Duration::from_millis(1500),
            fail_every: None,
            fail_ports: Vec::new(),
            version: format!("dummy {}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// One simulated programming call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DummyRecord {
    /// Target port
    pub port: String,
    /// Board the call was made for
    pub fqbn: String,
    /// Firmware file name
    pub firmware: String,
    /// Outcome
    pub success: bool,
}

#[derive(Debug, Default)]
struct ToolState {
    history: Vec<DummyRecord>,
    calls_per_port: HashMap<String, u32>,
    running: usize,
    max_running: usize,
}

/// Flashing tool that only pretends
#[derive(Debug, Default)]
pub struct DummyTool {
    config: DummyConfig,
    state: Mutex<ToolState>,
}

impl DummyTool {
    /// Create a dummy tool with the given behaviour
    pub fn new(config: DummyConfig) -> Self {
        Self {
            config,
            state: Mutex::new(ToolState::default()),
        }
    }

    /// Create a dummy tool that always succeeds
    pub fn new_default() -> Self {
        Self::new(DummyConfig::default())
    }

    /// Behaviour in use
    pub fn config(&self) -> &DummyConfig {
        &self.config
    }

    /// Every call made so far, in completion order
    pub fn history(&self) -> Vec<DummyRecord> {
        lock(&self.state).history.clone()
    }

    /// Highest number of calls that were running at once
    pub fn max_concurrent(&self) -> usize {
        lock(&self.state).max_running
    }

    fn should_fail(&self, port: &str, call: u32) -> bool {
        if self.config.fail_ports.iter().any(|p| p == port) {
            return true;
        }
        self.config.fail_every.is_some_and(|n| n > 0 && call % n == 0)
    }
}

fn supported(path: &Path) -> Result<(), ToolError> {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "ino" | "pde" | "hex" | "bin" | "elf" => Ok(()),
        other => Err(ToolError::UnsupportedFirmware(format!(".{}", other))),
    }
}

impl FlashTool for DummyTool {
    fn name(&self) -> &str {
        "dummy"
    }

    async fn check(&self) -> Result<String, ToolError> {
        Ok(self.config.version.clone())
    }

    async fn prepare(&self, board: &Board) -> Result<String, ToolError> {
        log::debug!("dummy: pretending to install core {}", board.core);
        Ok(format!("Core {} ready", board.core))
    }

    async fn program(&self, request: &FlashRequest) -> Result<ToolReport, ToolError> {
        supported(&request.firmware)?;

        let call = {
            let mut st = lock(&self.state);
            st.running += 1;
            st.max_running = st.max_running.max(st.running);
            let n = st.calls_per_port.entry(request.port.clone()).or_insert(0);
            *n += 1;
            *n
        };

        let timed_out = self.config.program_time > request.timeout;
        tokio::time::sleep(self.config.program_time.min(request.timeout)).await;

        let success = !timed_out && !self.should_fail(&request.port, call);
        {
            let mut st = lock(&self.state);
            st.running -= 1;
            st.history.push(DummyRecord {
                port: request.port.clone(),
                fqbn: request.fqbn.clone(),
                firmware: request
                    .firmware
                    .file_name()
                    .map(|f| f.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                success,
            });
        }

        if timed_out {
            return Err(ToolError::Timeout(request.timeout));
        }
        if success {
            log::debug!("dummy: programmed {} ({})", request.port, request.fqbn);
            Ok(ToolReport::ok("Programming completed successfully"))
        } else {
            Ok(ToolReport::failed(
                "Programming failed: simulated stk500_recv(): programmer is not responding",
            ))
        }
    }
}

/// Port enumerator serving a mutable, in-memory port list
#[derive(Debug, Default)]
pub struct DummyEnumerator {
    ports: Mutex<Vec<RawPort>>,
}

/// Hardware id of a simulated USB serial adapter at `location`
///
/// An empty location gives a port without USB data, which resolves as
/// `direct`.
pub fn simulated_hwid(location: &str) -> String {
    if location.is_empty() {
        "n/a".into()
    } else {
        format!("USB VID:PID=2341:0043 SER=DUMMY LOCATION={}:1.0", location)
    }
}

impl DummyEnumerator {
    /// Serve the given ports
    pub fn new(ports: Vec<RawPort>) -> Self {
        Self {
            ports: Mutex::new(ports),
        }
    }

    /// A small bench: three boards on one hub and one on a root port
    pub fn bench() -> Self {
        Self::new(vec![
            RawPort::new("/dev/ttyDUMMY0", simulated_hwid("1-1.1")),
            RawPort::new("/dev/ttyDUMMY1", simulated_hwid("1-1.2")),
            RawPort::new("/dev/ttyDUMMY2", simulated_hwid("1-1.3")),
            RawPort::new("/dev/ttyDUMMY3", simulated_hwid("1-2")),
        ])
    }

    /// Parse `port[@location],...`
    ///
    /// `"/dev/ttyA@1-1.2,/dev/ttyB"` gives a hub-attached and a direct port.
    pub fn from_spec(spec: &str) -> Result<Self, EnumerationError> {
        let mut ports = Vec::new();
        for item in spec.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let (id, location) = item.split_once('@').unwrap_or((item, ""));
            if id.is_empty() {
                return Err(EnumerationError(format!("Empty port name in '{}'", item)));
            }
            ports.push(RawPort::new(id, simulated_hwid(location)));
        }
        Ok(Self::new(ports))
    }

    /// Replace the whole port list
    pub fn set(&self, ports: Vec<RawPort>) {
        *lock(&self.ports) = ports;
    }

    /// Add a port, replacing one with the same id
    pub fn plug(&self, port: RawPort) {
        let mut ports = lock(&self.ports);
        ports.retain(|p| p.id != port.id);
        ports.push(port);
    }

    /// Remove a port; returns whether it was present
    pub fn unplug(&self, id: &str) -> bool {
        let mut ports = lock(&self.ports);
        let before = ports.len();
        ports.retain(|p| p.id != id);
        ports.len() != before
    }

    /// Current port list
    pub fn ports(&self) -> Vec<RawPort> {
        lock(&self.ports).clone()
    }
}

impl PortEnumerator for DummyEnumerator {
    fn scan(&self) -> Result<Vec<RawPort>, EnumerationError> {
        Ok(self.ports())
    }
}
