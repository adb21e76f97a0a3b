//! CLI command implementations
//!
//! `run` drives a live session through the core's event stream; the rest
//! are one-shot queries against the board database, the port scanner or
//! the flashing tool.

mod list;
pub mod run;
pub mod tool;

pub use list::{list_boards, list_ports, list_tools};
