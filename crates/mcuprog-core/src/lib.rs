//! mcuprog-core - Concurrent programming orchestrator for serial-attached
//! microcontrollers
//!
//! This crate watches the host's serial ports and programs every newly
//! attached board with one firmware image, running several flashing-tool
//! invocations at once while keeping the load on each USB hub bounded.
//!
//! The flashing tool and the port enumerator are collaborators behind the
//! [`tool::FlashTool`] and [`topology::PortEnumerator`] traits; backends
//! live in their own crates.
//!
//! # Architecture
//!
//! ```text
//!  PortEnumerator --scan--> HubTopologyResolver --Port{hub_group, depth}-->
//!      SessionController (single task, owns SessionLedger)
//!          |-- AdmissionController::try_admit  (per-hub slots)
//!          |-- JobDispatcher::submit ---------> worker tasks
//!          |                                      run_with_retry -> FlashTool
//!          |<-- completion queue <----------------+
//!          `-- ResultAggregator::apply  (release slot, update stats)
//!                  |
//!                  v
//!            SessionEvent stream --> presentation
//! ```
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use mcuprog_core::{spawn_session, BoardDatabase, SessionConfig};
//!
//! async fn run<E, T>(enumerator: E, tool: T, config: SessionConfig)
//! where
//!     E: mcuprog_core::PortEnumerator + 'static,
//!     T: mcuprog_core::FlashTool,
//! {
//!     let (handle, mut events, _task) =
//!         spawn_session(enumerator, Arc::new(tool), BoardDatabase::builtin());
//!     handle.start(config).unwrap();
//!     while let Some(event) = events.recv().await {
//!         println!("{:?}", event);
//!     }
//! }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod admission;
pub mod aggregator;
pub mod board;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod job;
pub mod retry;
pub mod session;
pub mod stats;
pub mod tool;
pub mod topology;

#[cfg(test)]
mod testing;

pub use board::{Board, BoardDatabase};
pub use config::{ExecutionMode, SessionConfig};
pub use error::{ConfigError, EnumerationError, Error, Result, ToolError};
pub use events::{SessionCommand, SessionEvent, SessionState};
pub use session::{spawn_session, SessionController, SessionHandle};
pub use stats::{format_runtime, ProgrammingResult, SessionStats};
pub use tool::{FlashRequest, FlashTool, ToolReport};
pub use topology::{Port, PortEnumerator, RawPort};
