//! Commands that talk to the flashing tool directly

use std::error::Error;
use std::path::Path;
use std::time::Duration;

use mcuprog_core::{BoardDatabase, FlashTool};

use crate::cli::BackendArgs;
use crate::error::CliError;
use crate::tools::{self, Tool};

/// Check the backend is reachable and show what it has installed
pub async fn check(backend: &BackendArgs) -> Result<(), Box<dyn Error>> {
    let tool = tools::open_tool(backend)?;
    let version = tool.check().await?;
    println!("{}: {}", tool.name(), version);

    #[cfg(feature = "arduino")]
    if let Tool::Arduino(cli) = &tool {
        let cores = cli.installed_cores().await?;
        if cores.is_empty() {
            println!("No cores installed");
        } else {
            println!("Installed cores:");
            for core in cores {
                println!("  {}", core);
            }
        }
    }
    Ok(())
}

#[cfg(feature = "arduino")]
fn arduino<'a>(
    tool: &'a Tool,
    operation: &'static str,
) -> Result<&'a mcuprog_arduino::ArduinoCli, CliError> {
    match tool {
        Tool::Arduino(cli) => Ok(cli),
        #[allow(unreachable_patterns)]
        other => Err(CliError::Unsupported {
            tool: other.name().to_string(),
            operation,
        }),
    }
}

/// Show the boards the tool can identify
#[cfg(feature = "arduino")]
pub async fn detect(
    backend: &BackendArgs,
    port: Option<&str>,
    db: &BoardDatabase,
) -> Result<(), Box<dyn Error>> {
    let tool = tools::open_tool(backend)?;
    let cli = arduino(&tool, "board detection")?;

    let detected: Vec<_> = match port {
        Some(port) => cli.detect_board(port).await?.into_iter().collect(),
        None => cli.board_list().await?,
    };

    if detected.is_empty() {
        println!("No boards detected");
        return Ok(());
    }

    println!("{:<20} {:<10} {:<28} {}", "Port", "Protocol", "Board", "FQBN");
    println!("{}", "-".repeat(78));
    for board in &detected {
        let name = board
            .fqbn
            .as_deref()
            .and_then(|fqbn| db.find_by_fqbn(fqbn))
            .map(|b| b.name.as_str())
            .unwrap_or(board.name.as_str());
        println!(
            "{:<20} {:<10} {:<28} {}",
            board.port,
            board.protocol,
            name,
            board.fqbn.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

#[cfg(not(feature = "arduino"))]
pub async fn detect(
    _backend: &BackendArgs,
    _port: Option<&str>,
    _db: &BoardDatabase,
) -> Result<(), Box<dyn Error>> {
    Err(CliError::FeatureDisabled("arduino-cli").into())
}

/// Compile a sketch for a board without programming anything
#[cfg(feature = "arduino")]
pub async fn compile(
    backend: &BackendArgs,
    db: &BoardDatabase,
    sketch: &Path,
    board: &str,
    output: Option<&Path>,
    timeout: Duration,
    verbose: bool,
) -> Result<(), Box<dyn Error>> {
    let board = db
        .resolve(board)
        .ok_or_else(|| CliError::UnknownBoard(board.to_string()))?;
    let tool = tools::open_tool(backend)?;
    let cli = arduino(&tool, "compilation")?;

    log::info!("Compiling {} for {} ({})", sketch.display(), board.name, board.fqbn);
    let out = cli.compile(sketch, &board.fqbn, output, verbose, timeout).await?;

    println!("Build output in {}", out.output_dir.display());
    for image in &out.images {
        println!("  {}", image.display());
    }
    Ok(())
}

#[cfg(not(feature = "arduino"))]
pub async fn compile(
    _backend: &BackendArgs,
    _db: &BoardDatabase,
    _sketch: &Path,
    _board: &str,
    _output: Option<&Path>,
    _timeout: Duration,
    _verbose: bool,
) -> Result<(), Box<dyn Error>> {
    Err(CliError::FeatureDisabled("arduino-cli").into())
}
