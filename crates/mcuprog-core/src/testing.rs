//! Test doubles for the collaborator traits

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use crate::error::{EnumerationError, ToolError};
use crate::tool::{FlashRequest, FlashTool, ToolReport};
use crate::topology::{PortEnumerator, RawPort};

/// One scripted tool outcome
pub enum Step {
    Report(ToolReport),
    Error(ToolError),
    Panic,
}

impl Step {
    pub fn ok() -> Self {
        Step::Report(ToolReport::ok("Programming completed successfully"))
    }

    pub fn fail(msg: &str) -> Self {
        Step::Report(ToolReport::failed(msg))
    }
}

#[derive(Default)]
struct ToolState {
    global: VecDeque<Step>,
    per_port: HashMap<String, VecDeque<Step>>,
    calls: Vec<String>,
    running: HashMap<String, usize>,
    max_per_port: usize,
    running_total: usize,
    max_total: usize,
}

/// Flashing tool that replays scripted outcomes
///
/// Per-port scripts take precedence over the global script; once both are
/// exhausted every call succeeds. Each call takes `latency` of (virtual)
/// time and the double records the highest concurrency it observed.
pub struct ScriptedTool {
    state: Mutex<ToolState>,
    latency: Duration,
    reachable: bool,
}

impl ScriptedTool {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            state: Mutex::new(ToolState {
                global: steps.into(),
                ..Default::default()
            }),
            latency: Duration::ZERO,
            reachable: true,
        }
    }

    pub fn always_ok() -> Self {
        Self::new(Vec::new())
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn unreachable(mut self) -> Self {
        self.reachable = false;
        self
    }

    pub fn script_port(self, port: &str, steps: Vec<Step>) -> Self {
        self.state
            .lock()
            .unwrap()
            .per_port
            .insert(port.to_string(), steps.into());
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn calls_for(&self, port: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|p| *p == port)
            .count()
    }

    pub fn max_concurrent_per_port(&self) -> usize {
        self.state.lock().unwrap().max_per_port
    }

    pub fn max_concurrent(&self) -> usize {
        self.state.lock().unwrap().max_total
    }
}

impl FlashTool for ScriptedTool {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn check(&self) -> Result<String, ToolError> {
        if self.reachable {
            Ok("scripted 1.0".into())
        } else {
            Err(ToolError::Unavailable("scripted tool offline".into()))
        }
    }

    async fn program(&self, request: &FlashRequest) -> Result<ToolReport, ToolError> {
        let step = {
            let mut st = self.state.lock().unwrap();
            st.calls.push(request.port.clone());
            let running = st.running.entry(request.port.clone()).or_insert(0);
            *running += 1;
            let now = *running;
            st.max_per_port = st.max_per_port.max(now);
            st.running_total += 1;
            st.max_total = st.max_total.max(st.running_total);

            let from_port = st
                .per_port
                .get_mut(&request.port)
                .and_then(VecDeque::pop_front);
            from_port.or_else(|| st.global.pop_front())
        };

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        {
            let mut st = self.state.lock().unwrap();
            if let Some(running) = st.running.get_mut(&request.port) {
                *running -= 1;
            }
            st.running_total -= 1;
        }

        match step {
            None => Ok(ToolReport::ok("Programming completed successfully")),
            Some(Step::Report(report)) => Ok(report),
            Some(Step::Error(e)) => Err(e),
            Some(Step::Panic) => panic!("scripted tool panic on {}", request.port),
        }
    }
}

/// Enumerator whose snapshot is set by the test
#[derive(Default)]
pub struct ScriptedEnumerator {
    ports: Mutex<Vec<RawPort>>,
    fail_next: Mutex<usize>,
}

impl ScriptedEnumerator {
    pub fn new(ports: Vec<RawPort>) -> Self {
        Self {
            ports: Mutex::new(ports),
            fail_next: Mutex::new(0),
        }
    }

    pub fn set(&self, ports: Vec<RawPort>) {
        *self.ports.lock().unwrap() = ports;
    }

    pub fn fail_scans(&self, count: usize) {
        *self.fail_next.lock().unwrap() = count;
    }
}

impl PortEnumerator for ScriptedEnumerator {
    fn scan(&self) -> Result<Vec<RawPort>, EnumerationError> {
        let mut fail = self.fail_next.lock().unwrap();
        if *fail > 0 {
            *fail -= 1;
            return Err(EnumerationError("scripted enumeration glitch".into()));
        }
        Ok(self.ports.lock().unwrap().clone())
    }
}

/// Raw port at USB `location` (`bus-a.b` style), direct when `location` is empty
pub fn raw(id: &str, location: &str) -> RawPort {
    if location.is_empty() {
        RawPort::new(id, "")
    } else {
        RawPort::new(id, format!("USB VID:PID=2341:0043 LOCATION={}:1.0", location))
    }
}
