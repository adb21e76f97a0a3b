//! mcuprog-arduino - arduino-cli flashing tool backend
//!
//! Drives the `arduino-cli` executable as a child process. Sketches
//! (`.ino`, `.pde`) are compiled and uploaded in one `compile --upload`
//! call; pre-built images (`.hex`, `.bin`, `.elf`) go through
//! `upload --input-file`.
//!
//! # Example
//!
//! ```no_run
//! use mcuprog_arduino::ArduinoCli;
//!
//! # async fn demo() -> mcuprog_arduino::Result<()> {
//! let cli = ArduinoCli::new();
//! println!("{}", cli.version().await?);
//! for board in cli.board_list().await? {
//!     println!("{} {}", board.port, board.name);
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod command;
pub mod error;
pub mod firmware;
pub mod listing;

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use mcuprog_core::{Board, FlashRequest, FlashTool, ToolError, ToolReport};

pub use error::{ArduinoError, Result};
pub use firmware::FirmwareKind;
pub use listing::DetectedBoard;

use command::{describe, run, CommandOutput};

/// Default executable name
pub const DEFAULT_PROGRAM: &str = "arduino-cli";

/// Time budgets for the housekeeping sub-commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// `version`
    pub version: Duration,
    /// `board list`
    pub board_list: Duration,
    /// `core list`
    pub core_list: Duration,
    /// `core install`
    pub core_install: Duration,
    /// `core update-index`
    pub update_index: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            version: Duration::from_secs(10),
            board_list: Duration::from_secs(15),
            core_list: Duration::from_secs(30),
            core_install: Duration::from_secs(300),
            update_index: Duration::from_secs(60),
        }
    }
}

/// Output of a compile-only run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileOutput {
    /// Directory holding the build artifacts
    pub output_dir: PathBuf,
    /// Uploadable images, `.bin` first
    pub images: Vec<PathBuf>,
}

/// arduino-cli backend
#[derive(Debug, Clone)]
pub struct ArduinoCli {
    program: PathBuf,
    timeouts: Timeouts,
}

impl Default for ArduinoCli {
    fn default() -> Self {
        Self::new()
    }
}

impl ArduinoCli {
    /// Use `arduino-cli` from `PATH`
    pub fn new() -> Self {
        Self::with_program(DEFAULT_PROGRAM)
    }

    /// Use a specific executable
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            timeouts: Timeouts::default(),
        }
    }

    /// Override the housekeeping time budgets
    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Path of the executable in use
    pub fn program(&self) -> &Path {
        &self.program
    }

    async fn call(&self, args: Vec<OsString>, timeout: Duration) -> Result<CommandOutput> {
        run(&self.program, &args, timeout).await
    }

    async fn call_checked(&self, args: Vec<OsString>, timeout: Duration) -> Result<CommandOutput> {
        let command = describe(&args);
        let out = self.call(args, timeout).await?;
        if out.success {
            Ok(out)
        } else {
            Err(ArduinoError::CommandFailed {
                command,
                output: out.diagnostics().to_string(),
            })
        }
    }

    /// `arduino-cli version`
    pub async fn version(&self) -> Result<String> {
        let out = self
            .call_checked(vec!["version".into()], self.timeouts.version)
            .await?;
        Ok(out.stdout.trim().to_string())
    }

    fn json_args(args: &[&str]) -> Vec<OsString> {
        args.iter()
            .chain(&["--format", "json"])
            .map(|a| OsString::from(*a))
            .collect()
    }

    /// Ids of the installed cores
    pub async fn installed_cores(&self) -> Result<Vec<String>> {
        let out = self
            .call_checked(Self::json_args(&["core", "list"]), self.timeouts.core_list)
            .await?;
        listing::parse_core_list(&out.stdout)
    }

    /// Install `core` unless it is already present
    pub async fn ensure_core(&self, core: &str) -> Result<String> {
        if self.installed_cores().await?.iter().any(|c| c == core) {
            log::debug!("Core {} already installed", core);
            return Ok("Core already installed".into());
        }

        log::info!("Installing core: {}", core);
        self.call_checked(
            vec!["core".into(), "install".into(), core.into()],
            self.timeouts.core_install,
        )
        .await?;
        Ok(format!("Installed core {}", core))
    }

    /// `arduino-cli core update-index`
    pub async fn update_core_index(&self) -> Result<()> {
        self.call_checked(
            vec!["core".into(), "update-index".into()],
            self.timeouts.update_index,
        )
        .await?;
        Ok(())
    }

    /// Boards currently attached, as arduino-cli sees them
    pub async fn board_list(&self) -> Result<Vec<DetectedBoard>> {
        let out = self
            .call_checked(Self::json_args(&["board", "list"]), self.timeouts.board_list)
            .await?;
        listing::parse_board_list(&out.stdout)
    }

    /// The board attached to `port`, if arduino-cli identifies one
    pub async fn detect_board(&self, port: &str) -> Result<Option<DetectedBoard>> {
        Ok(self
            .board_list()
            .await?
            .into_iter()
            .find(|b| b.port == port))
    }

    /// Compile a sketch without uploading
    ///
    /// Artifacts land in `output_dir`, or `<sketch dir>/<name>_compiled`.
    pub async fn compile(
        &self,
        sketch: &Path,
        fqbn: &str,
        output_dir: Option<&Path>,
        verbose: bool,
        timeout: Duration,
    ) -> Result<CompileOutput> {
        if FirmwareKind::detect(sketch)? != FirmwareKind::Sketch {
            return Err(ArduinoError::UnsupportedFirmware(format!(
                "{} is not a sketch",
                sketch.display()
            )));
        }

        let output_dir = output_dir
            .map(Path::to_path_buf)
            .unwrap_or_else(|| firmware::default_output_dir(sketch));
        std::fs::create_dir_all(&output_dir)?;

        self.call_checked(
            firmware::compile_args(sketch, fqbn, &output_dir, verbose),
            timeout,
        )
        .await?;

        let images = firmware::find_images(&output_dir)?;
        if images.is_empty() {
            return Err(ArduinoError::NoBinary(output_dir));
        }
        Ok(CompileOutput { output_dir, images })
    }

    /// Program one device
    ///
    /// A non-zero exit is a failed report, not an error; errors are reserved
    /// for timeouts, launch failures and unsupported firmware.
    pub async fn upload(&self, request: &FlashRequest) -> Result<ToolReport> {
        let kind = FirmwareKind::detect(&request.firmware)?;
        let out = self
            .call(firmware::program_args(kind, request), request.timeout)
            .await?;

        if out.success {
            if request.verbose {
                log::debug!("{}: {}", request.port, out.stdout.trim());
            }
            Ok(ToolReport::ok("Programming completed successfully"))
        } else {
            Ok(ToolReport::failed(format!(
                "Programming failed: {}",
                out.diagnostics()
            )))
        }
    }
}

impl FlashTool for ArduinoCli {
    fn name(&self) -> &str {
        DEFAULT_PROGRAM
    }

    async fn check(&self) -> std::result::Result<String, ToolError> {
        Ok(self.version().await?)
    }

    async fn update_index(&self) -> std::result::Result<(), ToolError> {
        Ok(self.update_core_index().await?)
    }

    async fn prepare(&self, board: &Board) -> std::result::Result<String, ToolError> {
        Ok(self.ensure_core(&board.core).await?)
    }

    async fn program(&self, request: &FlashRequest) -> std::result::Result<ToolReport, ToolError> {
        Ok(self.upload(request).await?)
    }
}
