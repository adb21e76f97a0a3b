//! Session events and commands
//!
//! The presentation layer is a pure sink of [`SessionEvent`]s and a pure
//! source of [`SessionCommand`]s. It never gets a reference into session
//! state; statistics reach it as [`SessionStats`] snapshots.

use std::fmt;

use tokio::sync::mpsc;

use crate::config::{ExecutionMode, SessionConfig};
use crate::stats::{ProgrammingResult, SessionStats};

/// Session controller state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No session; waiting for a start command
    Idle,
    /// Discovery and dispatch are active
    Running,
    /// No new admissions; waiting for in-flight jobs
    Stopping,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => write!(f, "idle"),
            SessionState::Running => write!(f, "running"),
            SessionState::Stopping => write!(f, "stopping"),
        }
    }
}

/// Events emitted towards the presentation layer, in order
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A port appeared in a scan
    PortConnected(String),
    /// A port vanished from a scan
    PortDisconnected(String),
    /// A worker started programming a port
    JobStarted(String),
    /// An attempt failed and the job will try again
    JobRetried {
        /// Port being programmed
        port: String,
        /// 0-based index of the attempt about to run
        attempt: u32,
        /// Message of the failed attempt
        reason: String,
    },
    /// A job reached its terminal result
    JobCompleted(ProgrammingResult),
    /// Statistics snapshot
    StatsSnapshot(SessionStats),
    /// The controller changed state
    SessionStateChanged(SessionState),
    /// A start command was refused; the session stays idle
    StartRejected(String),
    /// Hub limits were tightened after nested hubs were seen
    LimitsTightened {
        /// Deepest hub level observed
        depth: u32,
        /// Per-hub capacity now in force
        hub_capacity: usize,
        /// Worker pool size now in force
        pool_size: usize,
    },
}

/// Commands accepted by the session controller
#[derive(Debug, Clone)]
pub enum SessionCommand {
    /// Start a session with this configuration
    Start(Box<SessionConfig>),
    /// Stop the running session
    Stop,
    /// Switch execution mode; applies to the running session immediately
    SetMode(ExecutionMode),
    /// Stop any session and end the controller task
    Shutdown,
}

/// Cloneable event sender that tolerates a departed receiver
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<SessionEvent>>,
}

impl EventSink {
    /// Create a sink and the receiving end of its stream
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// A sink that drops everything
    pub fn discard() -> Self {
        Self { tx: None }
    }

    /// Emit an event; a closed stream is not an error
    pub fn emit(&self, event: SessionEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}
