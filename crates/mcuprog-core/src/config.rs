//! Session configuration
//!
//! [`SessionConfig`] is the single typed configuration document a session is
//! started with. Every field has a documented default; the whole struct is
//! validated once by [`SessionConfig::validate`] and invalid values are
//! rejected, never coerced.
//!
//! Settings files are TOML:
//!
//! ```toml
//! board = "ESP32 Dev Module"
//! firmware = "build/app.bin"
//! max_parallel_jobs = 6
//! max_devices_per_hub = 2
//! execution_mode = "single-batch"
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// How ports become eligible for programming again
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionMode {
    /// A port is re-programmed every time it is (re)connected
    #[default]
    #[serde(alias = "Continuous")]
    Continuous,
    /// Each port is programmed at most once per session
    #[serde(alias = "singleBatch", alias = "single", alias = "Single")]
    SingleBatch,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionMode::Continuous => write!(f, "continuous"),
            ExecutionMode::SingleBatch => write!(f, "single-batch"),
        }
    }
}

impl FromStr for ExecutionMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "continuous" => Ok(ExecutionMode::Continuous),
            "single-batch" | "singlebatch" | "single_batch" | "single" => {
                Ok(ExecutionMode::SingleBatch)
            }
            _ => Err(ConfigError::UnknownMode(s.to_string())),
        }
    }
}

/// Configuration a session is started with
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Board selection: a board database name or a raw FQBN. Required.
    pub board: Option<String>,
    /// Firmware image or sketch to program. Required, must exist.
    pub firmware: Option<PathBuf>,
    /// Only program this port, treated as a direct connection. Default: none.
    pub target_port: Option<String>,
    /// Time budget of one flashing tool invocation. Default: 60.
    pub programming_timeout_seconds: u64,
    /// Additional attempts after a failed one. Default: 3.
    pub max_retries: u32,
    /// Ask the tool to read back and verify. Default: true.
    pub verify_after_program: bool,
    /// Ask the tool for verbose diagnostics. Default: false.
    pub verbose_output: bool,
    /// Worker pool size. Default: 4.
    pub max_parallel_jobs: usize,
    /// Delay between discovery ticks. Default: 2.0.
    pub port_scan_interval_seconds: f64,
    /// Concurrent jobs allowed per hub group. Default: 2.
    pub max_devices_per_hub: usize,
    /// Pre-delay before the first attempt on a hub-attached port. Default: 0.5.
    pub hub_programming_delay_seconds: f64,
    /// Port re-eligibility policy. Default: continuous.
    pub execution_mode: ExecutionMode,
    /// How long a stop waits for in-flight jobs before abandoning them. Default: 30.
    pub stop_grace_seconds: f64,
    /// Install the board core before the first job if missing. Default: true.
    pub auto_install_cores: bool,
    /// Refresh the tool's core index when a session starts. Default: false.
    pub update_index_on_start: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            board: None,
            firmware: None,
            target_port: None,
            programming_timeout_seconds: 60,
            max_retries: 3,
            verify_after_program: true,
            verbose_output: false,
            max_parallel_jobs: 4,
            port_scan_interval_seconds: 2.0,
            max_devices_per_hub: 2,
            hub_programming_delay_seconds: 0.5,
            execution_mode: ExecutionMode::Continuous,
            stop_grace_seconds: 30.0,
            auto_install_cores: true,
            update_index_on_start: false,
        }
    }
}

fn positive_secs(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::NotPositive {
            field,
            value: value.to_string(),
        })
    }
}

fn non_negative_secs(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(ConfigError::Negative {
            field,
            value: value.to_string(),
        })
    }
}

impl SessionConfig {
    /// Parse a TOML settings document; missing keys take their defaults
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    /// Load a TOML settings file
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Check every field, returning the first problem found
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.board.as_deref() {
            Some(b) if !b.trim().is_empty() => {}
            _ => return Err(ConfigError::MissingBoard),
        }
        match &self.firmware {
            None => return Err(ConfigError::MissingFirmware),
            Some(path) if !path.is_file() => {
                return Err(ConfigError::FirmwareNotFound(path.display().to_string()))
            }
            Some(_) => {}
        }
        self.validate_options()
    }

    /// Check the numeric tuning fields only
    pub fn validate_options(&self) -> Result<(), ConfigError> {
        if self.programming_timeout_seconds == 0 {
            return Err(ConfigError::NotPositive {
                field: "programming_timeout_seconds",
                value: "0".into(),
            });
        }
        if self.max_parallel_jobs == 0 {
            return Err(ConfigError::NotPositive {
                field: "max_parallel_jobs",
                value: "0".into(),
            });
        }
        if self.max_devices_per_hub == 0 {
            return Err(ConfigError::NotPositive {
                field: "max_devices_per_hub",
                value: "0".into(),
            });
        }
        positive_secs("port_scan_interval_seconds", self.port_scan_interval_seconds)?;
        non_negative_secs(
            "hub_programming_delay_seconds",
            self.hub_programming_delay_seconds,
        )?;
        non_negative_secs("stop_grace_seconds", self.stop_grace_seconds)?;
        Ok(())
    }

    /// Total attempts per job (`max_retries + 1`)
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Time budget of one tool invocation
    pub fn programming_timeout(&self) -> Duration {
        Duration::from_secs(self.programming_timeout_seconds)
    }

    /// Delay between discovery ticks
    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs_f64(self.port_scan_interval_seconds)
    }

    /// Pre-delay for hub-attached ports
    pub fn hub_delay(&self) -> Duration {
        Duration::from_secs_f64(self.hub_programming_delay_seconds)
    }

    /// Grace period for in-flight jobs after a stop
    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs_f64(self.stop_grace_seconds)
    }
}
