//! CLI argument parsing

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "mcuprog")]
#[command(
    author,
    version,
    about = "Production programmer for serial-attached microcontrollers",
    long_about = None
)]
pub struct Cli {
    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Path to a board database file or directory (contains .ron files)
    /// Defaults to looking in ./boards/ and /usr/share/mcuprog/boards/
    #[arg(long, global = true)]
    pub boards: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Flashing tool and port source selection
#[derive(clap::Args, Debug, Clone)]
pub struct BackendArgs {
    /// Flashing tool backend [available: arduino-cli, dummy]
    #[arg(short, long, default_value = "arduino-cli")]
    pub tool: String,

    /// Path to the arduino-cli executable
    #[arg(long)]
    pub arduino_cli: Option<PathBuf>,

    /// Only consider USB serial ports
    #[arg(long)]
    pub usb_only: bool,

    /// Simulated ports for the dummy backend: port[@usb-location],...
    #[arg(long)]
    pub dummy_ports: Option<String>,

    /// Dummy backend: every n-th call on a port fails
    #[arg(long)]
    pub dummy_fail_every: Option<u32>,

    /// Dummy backend: seconds one programming call takes
    #[arg(long)]
    pub dummy_time: Option<f64>,
}

/// Session settings; each flag overrides the settings file
#[derive(clap::Args, Debug, Clone, Default)]
pub struct SessionArgs {
    /// Settings file (TOML)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Board name or FQBN
    #[arg(short, long)]
    pub board: Option<String>,

    /// Firmware image (.hex, .bin, .elf) or sketch (.ino, .pde)
    #[arg(short, long)]
    pub firmware: Option<PathBuf>,

    /// Only program this port
    #[arg(short, long)]
    pub port: Option<String>,

    /// Per-attempt timeout in seconds
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Retries after a failed attempt
    #[arg(long)]
    pub retries: Option<u32>,

    /// Skip verification after programming
    #[arg(long)]
    pub no_verify: bool,

    /// Ask the flashing tool for verbose output
    #[arg(long)]
    pub tool_verbose: bool,

    /// Parallel programming jobs
    #[arg(short, long)]
    pub jobs: Option<usize>,

    /// Seconds between port scans
    #[arg(long)]
    pub scan_interval: Option<f64>,

    /// Concurrent jobs per USB hub
    #[arg(long)]
    pub per_hub: Option<usize>,

    /// Seconds to wait before programming a hub-attached port
    #[arg(long)]
    pub hub_delay: Option<f64>,

    /// Execution mode: continuous or single-batch
    #[arg(short, long)]
    pub mode: Option<String>,

    /// Seconds to wait for running jobs after a stop
    #[arg(long)]
    pub stop_grace: Option<f64>,

    /// Do not install missing board cores
    #[arg(long)]
    pub no_install_cores: bool,

    /// Update the core index before starting
    #[arg(long)]
    pub update_index: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Watch serial ports and program every board that appears
    Run {
        #[command(flatten)]
        session: SessionArgs,

        #[command(flatten)]
        backend: BackendArgs,
    },

    /// List known boards
    ListBoards {
        /// Filter by name, vendor or FQBN (substring, case-insensitive)
        filter: Option<String>,
    },

    /// Scan serial ports and show their USB hub grouping
    ListPorts {
        #[command(flatten)]
        backend: BackendArgs,
    },

    /// List flashing tool backends
    ListTools,

    /// Ask the flashing tool which boards are attached
    Detect {
        /// Only report this port
        #[arg(short, long)]
        port: Option<String>,

        #[command(flatten)]
        backend: BackendArgs,
    },

    /// Compile a sketch to uploadable images without programming
    Compile {
        /// Sketch to compile (.ino, .pde)
        sketch: PathBuf,

        /// Board name or FQBN
        #[arg(short, long)]
        board: String,

        /// Output directory [default: <sketch dir>/<name>_compiled]
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Compilation timeout in seconds
        #[arg(long, default_value = "300")]
        timeout: u64,

        /// Show compiler output
        #[arg(long)]
        tool_verbose: bool,

        #[command(flatten)]
        backend: BackendArgs,
    },

    /// Check that the flashing tool is installed and reachable
    Check {
        #[command(flatten)]
        backend: BackendArgs,
    },
}
