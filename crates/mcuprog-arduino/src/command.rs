//! Child process plumbing
//!
//! Every arduino-cli call goes through [`run`]: stdin is closed, output is
//! captured, and the child is killed when the time budget runs out (the
//! future owning it is dropped and `kill_on_drop` does the rest).

use std::ffi::OsString;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

use crate::error::{ArduinoError, Result};

/// Captured result of a finished process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit status was zero
    pub success: bool,
    /// Captured stdout, lossily decoded
    pub stdout: String,
    /// Captured stderr, lossily decoded
    pub stderr: String,
}

impl CommandOutput {
    /// The most useful diagnostic text: stderr, or stdout when stderr is empty
    pub fn diagnostics(&self) -> &str {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim()
        } else {
            stderr
        }
    }
}

/// Human-readable rendering of an argument list for logs and errors
pub fn describe(args: &[OsString]) -> String {
    args.iter()
        .take_while(|a| !a.to_string_lossy().starts_with('-'))
        .map(|a| a.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Run `program args...` and wait at most `timeout`
pub async fn run(program: &Path, args: &[OsString], timeout: Duration) -> Result<CommandOutput> {
    let name = program.display().to_string();
    log::debug!("Running {} {:?}", name, args);

    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                ArduinoError::NotFound(name.clone())
            } else {
                ArduinoError::Spawn {
                    program: name.clone(),
                    source,
                }
            }
        })?;

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(result) => result.map_err(|source| ArduinoError::Spawn {
            program: name.clone(),
            source,
        })?,
        Err(_) => {
            log::warn!("{} {} timed out", name, describe(args));
            return Err(ArduinoError::Timeout {
                command: describe(args),
                timeout,
            });
        }
    };

    let out = CommandOutput {
        success: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    };
    log::trace!("{} {} -> {:?}", name, describe(args), output.status);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<OsString> {
        list.iter().map(OsString::from).collect()
    }

    #[test]
    fn test_describe_stops_at_first_flag() {
        assert_eq!(
            describe(&args(&["core", "install", "arduino:avr", "--verbose"])),
            "core install arduino:avr"
        );
        assert_eq!(describe(&args(&["upload", "--fqbn", "x"])), "upload");
    }

    #[test]
    fn test_diagnostics_prefers_stderr() {
        let out = CommandOutput {
            success: false,
            stdout: "Sketch uses 924 bytes".into(),
            stderr: "avrdude: ser_open(): can't open device\n".into(),
        };
        assert_eq!(out.diagnostics(), "avrdude: ser_open(): can't open device");

        let out = CommandOutput {
            stderr: "  \n".into(),
            ..out
        };
        assert_eq!(out.diagnostics(), "Sketch uses 924 bytes");
    }

    #[tokio::test]
    async fn test_missing_program_is_not_found() {
        let err = run(
            Path::new("/nonexistent/arduino-cli-missing"),
            &args(&["version"]),
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ArduinoError::NotFound(_)));
    }
}
