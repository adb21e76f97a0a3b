//! The `run` command: a live programming session

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use mcuprog_core::{
    format_runtime, spawn_session, BoardDatabase, ConfigError, ProgrammingResult, SessionConfig,
    SessionEvent, SessionState, SessionStats,
};

use crate::cli::{BackendArgs, SessionArgs};
use crate::error::CliError;
use crate::tools;

/// Merge the settings file (if any) with command-line overrides
pub fn build_config(args: &SessionArgs) -> Result<SessionConfig, ConfigError> {
    let mut config = match &args.config {
        Some(path) => SessionConfig::from_toml_file(path)?,
        None => SessionConfig::default(),
    };

    if let Some(board) = &args.board {
        config.board = Some(board.clone());
    }
    if let Some(firmware) = &args.firmware {
        config.firmware = Some(firmware.clone());
    }
    if let Some(port) = &args.port {
        config.target_port = Some(port.clone());
    }
    if let Some(timeout) = args.timeout {
        config.programming_timeout_seconds = timeout;
    }
    if let Some(retries) = args.retries {
        config.max_retries = retries;
    }
    if args.no_verify {
        config.verify_after_program = false;
    }
    if args.tool_verbose {
        config.verbose_output = true;
    }
    if let Some(jobs) = args.jobs {
        config.max_parallel_jobs = jobs;
    }
    if let Some(secs) = args.scan_interval {
        config.port_scan_interval_seconds = secs;
    }
    if let Some(n) = args.per_hub {
        config.max_devices_per_hub = n;
    }
    if let Some(secs) = args.hub_delay {
        config.hub_programming_delay_seconds = secs;
    }
    if let Some(mode) = &args.mode {
        config.execution_mode = mode.parse()?;
    }
    if let Some(secs) = args.stop_grace {
        config.stop_grace_seconds = secs;
    }
    if args.no_install_cores {
        config.auto_install_cores = false;
    }
    if args.update_index {
        config.update_index_on_start = true;
    }

    Ok(config)
}

fn status_line(stats: &SessionStats, running: usize) -> String {
    let rate = stats
        .success_rate()
        .map(|r| format!("{:.1}%", r))
        .unwrap_or_else(|| "-".into());
    format!(
        "programmed {} | ok {} | failed {} | rate {} | running {}",
        stats.total_attempted, stats.successful, stats.failed, rate, running
    )
}

fn result_line(result: &ProgrammingResult) -> String {
    let mark = if result.success { "OK  " } else { "FAIL" };
    format!(
        "{} {} ({:.1}s, {} attempt{}): {}",
        mark,
        result.port,
        result.duration_seconds,
        result.attempts,
        if result.attempts == 1 { "" } else { "s" },
        result.message
    )
}

fn print_summary(stats: &SessionStats) {
    let runtime = stats.runtime();

    println!();
    println!("Session summary");
    println!("{}", "-".repeat(40));
    println!("  Programmed:   {}", stats.total_attempted);
    println!("  Successful:   {}", stats.successful);
    println!("  Failed:       {}", stats.failed);
    if let Some(rate) = stats.success_rate() {
        println!("  Success rate: {:.1}%", rate);
    }
    println!("  Runtime:      {}", format_runtime(runtime));
    println!(
        "  Throughput:   {:.1} devices/min",
        stats.throughput_per_minute(runtime)
    );

    let failures: Vec<_> = stats.results.iter().filter(|r| !r.success).collect();
    if !failures.is_empty() {
        println!();
        println!("Failed ports:");
        for r in failures {
            println!("  {}: {}", r.port, r.message);
        }
    }
}

/// Run a programming session until Ctrl-C
///
/// The first Ctrl-C asks the session to stop and waits for running jobs;
/// a second one exits immediately.
pub async fn run(
    args: &SessionArgs,
    backend: &BackendArgs,
    boards: BoardDatabase,
) -> Result<(), Box<dyn Error>> {
    let config = build_config(args)?;
    let tool = Arc::new(tools::open_tool(backend)?);
    let enumerator = tools::open_enumerator(backend)?;

    let (handle, mut events, task) = spawn_session(enumerator, tool, boards);
    handle.start(config)?;

    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed_precise}] {msg}")?,
    );
    pb.enable_steady_tick(Duration::from_millis(120));
    pb.set_message("Starting session...");

    let mut started = false;
    let mut rejected = None;
    let mut interrupts = 0u32;
    let mut signals = true;
    let mut running = 0usize;
    let mut stats = SessionStats::new();

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    SessionEvent::SessionStateChanged(SessionState::Running) => {
                        started = true;
                        pb.set_message("Waiting for boards...");
                    }
                    SessionEvent::SessionStateChanged(SessionState::Stopping) => {
                        pb.set_message(format!("Stopping, waiting for {} running job(s)...", running));
                    }
                    SessionEvent::SessionStateChanged(SessionState::Idle) => {
                        if started {
                            break;
                        }
                    }
                    SessionEvent::StartRejected(reason) => {
                        if !started {
                            rejected = Some(reason);
                            break;
                        }
                    }
                    SessionEvent::JobStarted(_) => running += 1,
                    SessionEvent::JobRetried { port, attempt, reason } => {
                        pb.println(format!("RTRY {} (attempt {}): {}", port, attempt + 1, reason));
                    }
                    SessionEvent::JobCompleted(result) => {
                        running = running.saturating_sub(1);
                        pb.println(result_line(&result));
                    }
                    SessionEvent::LimitsTightened { depth, hub_capacity, pool_size } => {
                        pb.println(format!(
                            "Nested hubs (depth {}): {} job(s) per hub, {} worker(s)",
                            depth, hub_capacity, pool_size
                        ));
                    }
                    SessionEvent::StatsSnapshot(snapshot) => {
                        pb.set_message(status_line(&snapshot, running));
                        stats = snapshot;
                    }
                    SessionEvent::PortConnected(_) | SessionEvent::PortDisconnected(_) => {}
                }
            }
            signal = tokio::signal::ctrl_c(), if signals => {
                if let Err(e) = signal {
                    log::warn!("Cannot listen for Ctrl-C: {}", e);
                    signals = false;
                    continue;
                }
                interrupts += 1;
                if interrupts == 1 {
                    pb.println("Stopping... press Ctrl-C again to exit immediately");
                    handle.stop()?;
                } else {
                    pb.abandon();
                    std::process::exit(130);
                }
            }
        }
    }

    pb.finish_and_clear();
    // the controller may already be gone
    let _ = handle.shutdown();
    task.await?;

    if let Some(reason) = rejected {
        return Err(CliError::Rejected(reason).into());
    }
    print_summary(&stats);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcuprog_core::ExecutionMode;
    use std::path::PathBuf;

    #[test]
    fn test_overrides_apply_on_defaults() {
        let args = SessionArgs {
            board: Some("Arduino Uno".into()),
            firmware: Some(PathBuf::from("blink.hex")),
            jobs: Some(8),
            mode: Some("single-batch".into()),
            no_verify: true,
            ..Default::default()
        };
        let config = build_config(&args).unwrap();
        assert_eq!(config.board.as_deref(), Some("Arduino Uno"));
        assert_eq!(config.max_parallel_jobs, 8);
        assert_eq!(config.execution_mode, ExecutionMode::SingleBatch);
        assert!(!config.verify_after_program);
        assert_eq!(config.max_retries, 3);
    }

    #[test]
    fn test_flags_override_settings_file() {
        let path = std::env::temp_dir().join(format!("mcuprog-run-{}.toml", std::process::id()));
        std::fs::write(&path, "board = \"Arduino Nano\"\nmax_retries = 1\nmax_parallel_jobs = 2\n")
            .unwrap();

        let args = SessionArgs {
            config: Some(path.clone()),
            jobs: Some(6),
            ..Default::default()
        };
        let config = build_config(&args).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.board.as_deref(), Some("Arduino Nano"));
        assert_eq!(config.max_retries, 1);
        assert_eq!(config.max_parallel_jobs, 6);
    }

    #[test]
    fn test_bad_mode_is_rejected() {
        let args = SessionArgs {
            mode: Some("forever".into()),
            ..Default::default()
        };
        assert!(matches!(build_config(&args), Err(ConfigError::UnknownMode(_))));
    }

    #[test]
    fn test_result_line() {
        let result = ProgrammingResult {
            port: "/dev/ttyACM0".into(),
            success: false,
            message: "Programming failed: timeout".into(),
            duration_seconds: 12.34,
            board: "Arduino Uno".into(),
            fqbn: "arduino:avr:uno".into(),
            firmware: "blink.hex".into(),
            attempts: 4,
            completed_at: std::time::SystemTime::now(),
        };
        assert_eq!(
            result_line(&result),
            "FAIL /dev/ttyACM0 (12.3s, 4 attempts): Programming failed: timeout"
        );
    }
}
