//! mcuprog - Concurrent production programmer for microcontroller boards
//!
//! Watches the host's serial ports and programs every board that shows up
//! with one firmware, several at a time.
//!
//! # Architecture
//!
//! The work is split across the workspace crates:
//! - **mcuprog-core** owns the session: discovery, hub-aware admission,
//!   the worker pool, retries and statistics
//! - **mcuprog-arduino** drives `arduino-cli` as the flashing tool
//! - **mcuprog-serial** lists the host's serial ports
//! - **mcuprog-dummy** simulates both for dry runs
//!
//! This binary only wires a backend to the core and renders its events.

mod cli;
mod commands;
mod error;
mod tools;

use clap::Parser;
use cli::{Cli, Commands};
use mcuprog_core::BoardDatabase;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    // Set log level based on verbosity
    match cli.verbose {
        0 => {} // default (info)
        1 => log::set_max_level(log::LevelFilter::Debug),
        _ => log::set_max_level(log::LevelFilter::Trace),
    }

    let db = match load_board_database(cli.boards.as_deref()) {
        Ok(db) => db,
        Err(e) => {
            eprintln!("Failed to load board database: {}", e);
            std::process::exit(1);
        }
    };

    log::debug!("Loaded {} board definitions", db.len());

    match cli.command {
        Commands::Run { session, backend } => commands::run::run(&session, &backend, db).await,
        Commands::ListBoards { filter } => {
            commands::list_boards(&db, filter.as_deref());
            Ok(())
        }
        Commands::ListPorts { backend } => commands::list_ports(&backend),
        Commands::ListTools => {
            commands::list_tools();
            Ok(())
        }
        Commands::Detect { port, backend } => {
            commands::tool::detect(&backend, port.as_deref(), &db).await
        }
        Commands::Compile {
            sketch,
            board,
            output,
            timeout,
            tool_verbose,
            backend,
        } => {
            commands::tool::compile(
                &backend,
                &db,
                &sketch,
                &board,
                output.as_deref(),
                Duration::from_secs(timeout),
                tool_verbose,
            )
            .await
        }
        Commands::Check { backend } => commands::tool::check(&backend).await,
    }
}

/// Built-in boards, extended by `.ron` definitions
///
/// An explicit `--boards` path must exist; otherwise the default locations
/// are tried and silently skipped when absent.
fn load_board_database(path: Option<&Path>) -> Result<BoardDatabase, Box<dyn std::error::Error>> {
    let mut db = BoardDatabase::builtin();

    if let Some(path) = path {
        let count = if path.is_dir() {
            db.load_dir(path)?
        } else if path.is_file() {
            db.load_file(path)?
        } else {
            return Err(format!("Board database path not found: {}", path.display()).into());
        };
        log::debug!("Loaded {} boards from {}", count, path.display());
    } else {
        let default_paths = [
            PathBuf::from("boards"),
            PathBuf::from("/usr/share/mcuprog/boards"),
            PathBuf::from("/usr/local/share/mcuprog/boards"),
        ];

        for dir in &default_paths {
            if dir.is_dir() {
                match db.load_dir(dir) {
                    Ok(count) => log::debug!("Loaded {} boards from {}", count, dir.display()),
                    Err(e) => log::warn!("Failed to load boards from {}: {}", dir.display(), e),
                }
            }
        }
    }

    Ok(db)
}
