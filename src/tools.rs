//! Flashing tool registration and dispatch
//!
//! Backends are feature-gated; this module lists the compiled-in ones and
//! builds the tool and port enumerator a command asks for.

use mcuprog_core::{Board, FlashRequest, FlashTool, PortEnumerator, ToolError, ToolReport};

use crate::cli::BackendArgs;
use crate::error::CliError;

#[cfg(not(any(feature = "arduino", feature = "dummy")))]
compile_error!("enable at least one flashing tool backend: `arduino` or `dummy`");

/// Information about a flashing tool backend
pub struct ToolInfo {
    /// Primary name (used for matching)
    pub name: &'static str,
    /// Alternative names
    pub aliases: &'static [&'static str],
    /// Short description
    pub description: &'static str,
}

impl ToolInfo {
    fn matches(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
            || self.aliases.iter().any(|a| a.eq_ignore_ascii_case(name))
    }
}

/// All backends enabled at compile time
#[allow(unused_mut, clippy::vec_init_then_push)]
pub fn available_tools() -> Vec<ToolInfo> {
    let mut tools = Vec::new();

    #[cfg(feature = "arduino")]
    tools.push(ToolInfo {
        name: "arduino-cli",
        aliases: &["arduino"],
        description: "arduino-cli compile/upload (--arduino-cli <path> to override)",
    });

    #[cfg(feature = "dummy")]
    tools.push(ToolInfo {
        name: "dummy",
        aliases: &["sim"],
        description: "Simulated programmer and ports for dry runs (--dummy-ports)",
    });

    tools
}

/// Comma-separated backend names
pub fn tool_names_short() -> String {
    available_tools()
        .iter()
        .map(|t| t.name)
        .collect::<Vec<_>>()
        .join(", ")
}

fn lookup(name: &str) -> Result<&'static str, CliError> {
    available_tools()
        .into_iter()
        .find(|t| t.matches(name))
        .map(|t| t.name)
        .ok_or_else(|| CliError::UnknownTool(name.to_string(), tool_names_short()))
}

/// A constructed flashing tool backend
pub enum Tool {
    /// arduino-cli
    #[cfg(feature = "arduino")]
    Arduino(mcuprog_arduino::ArduinoCli),
    /// Simulation
    #[cfg(feature = "dummy")]
    Dummy(mcuprog_dummy::DummyTool),
}

impl FlashTool for Tool {
    fn name(&self) -> &str {
        match self {
            #[cfg(feature = "arduino")]
            Tool::Arduino(t) => t.name(),
            #[cfg(feature = "dummy")]
            Tool::Dummy(t) => t.name(),
        }
    }

    async fn check(&self) -> Result<String, ToolError> {
        match self {
            #[cfg(feature = "arduino")]
            Tool::Arduino(t) => t.check().await,
            #[cfg(feature = "dummy")]
            Tool::Dummy(t) => t.check().await,
        }
    }

    async fn update_index(&self) -> Result<(), ToolError> {
        match self {
            #[cfg(feature = "arduino")]
            Tool::Arduino(t) => t.update_index().await,
            #[cfg(feature = "dummy")]
            Tool::Dummy(t) => t.update_index().await,
        }
    }

    async fn prepare(&self, board: &Board) -> Result<String, ToolError> {
        match self {
            #[cfg(feature = "arduino")]
            Tool::Arduino(t) => t.prepare(board).await,
            #[cfg(feature = "dummy")]
            Tool::Dummy(t) => t.prepare(board).await,
        }
    }

    async fn program(&self, request: &FlashRequest) -> Result<ToolReport, ToolError> {
        match self {
            #[cfg(feature = "arduino")]
            Tool::Arduino(t) => FlashTool::program(t, request).await,
            #[cfg(feature = "dummy")]
            Tool::Dummy(t) => t.program(request).await,
        }
    }
}

/// Build the backend named by `--tool`
pub fn open_tool(args: &BackendArgs) -> Result<Tool, CliError> {
    let name = lookup(&args.tool)?;
    log::debug!("Using flashing tool backend {}", name);

    match name {
        #[cfg(feature = "arduino")]
        "arduino-cli" => {
            let cli = match &args.arduino_cli {
                Some(path) => mcuprog_arduino::ArduinoCli::with_program(path),
                None => mcuprog_arduino::ArduinoCli::new(),
            };
            Ok(Tool::Arduino(cli))
        }
        #[cfg(feature = "dummy")]
        "dummy" => {
            let mut config = mcuprog_dummy::DummyConfig {
                fail_every: args.dummy_fail_every,
                ..Default::default()
            };
            if let Some(secs) = args.dummy_time {
                config.program_time =
                    std::time::Duration::try_from_secs_f64(secs).unwrap_or_default();
            }
            Ok(Tool::Dummy(mcuprog_dummy::DummyTool::new(config)))
        }
        _ => Err(CliError::UnknownTool(args.tool.clone(), tool_names_short())),
    }
}

/// Build the port source matching the backend
///
/// The dummy backend, or any explicit `--dummy-ports`, gets simulated
/// ports; everything else scans the host's serial ports.
pub fn open_enumerator(args: &BackendArgs) -> Result<Box<dyn PortEnumerator>, CliError> {
    let simulated = args.dummy_ports.is_some() || lookup(&args.tool)? == "dummy";

    if simulated {
        #[cfg(feature = "dummy")]
        {
            let enumerator = match &args.dummy_ports {
                Some(spec) => mcuprog_dummy::DummyEnumerator::from_spec(spec)
                    .map_err(|e| CliError::Rejected(e.to_string()))?,
                None => mcuprog_dummy::DummyEnumerator::bench(),
            };
            return Ok(Box::new(enumerator));
        }
        #[cfg(not(feature = "dummy"))]
        return Err(CliError::FeatureDisabled("Simulated port"));
    }

    #[cfg(feature = "serial")]
    {
        Ok(Box::new(
            mcuprog_serial::SerialEnumerator::new().usb_only(args.usb_only),
        ))
    }
    #[cfg(not(feature = "serial"))]
    {
        Err(CliError::FeatureDisabled("Serial port"))
    }
}
