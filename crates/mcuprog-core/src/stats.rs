//! Programming results and session statistics

use std::time::{Duration, SystemTime};

/// Terminal outcome of one programming job
#[derive(Debug, Clone, PartialEq)]
pub struct ProgrammingResult {
    /// Port the job ran against
    pub port: String,
    /// Whether the device ended up programmed
    pub success: bool,
    /// Message of the final attempt
    pub message: String,
    /// Wall-clock time from job start to terminal outcome, retries included
    pub duration_seconds: f64,
    /// Board display name
    pub board: String,
    /// Fully-qualified board name
    pub fqbn: String,
    /// Firmware file name
    pub firmware: String,
    /// Number of tool invocations made
    pub attempts: u32,
    /// When the terminal outcome was reached
    pub completed_at: SystemTime,
}

/// Aggregate counters for a session
///
/// `total_attempted == successful + failed == results.len()` after every
/// [`record`](Self::record).
#[derive(Debug, Clone, PartialEq)]
pub struct SessionStats {
    /// Jobs that reached a terminal result
    pub total_attempted: u64,
    /// Jobs that succeeded
    pub successful: u64,
    /// Jobs that failed after all retries
    pub failed: u64,
    /// Session start time
    pub started_at: SystemTime,
    /// Terminal results in aggregation order
    pub results: Vec<ProgrammingResult>,
}

impl Default for SessionStats {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStats {
    /// Fresh statistics starting now
    pub fn new() -> Self {
        Self {
            total_attempted: 0,
            successful: 0,
            failed: 0,
            started_at: SystemTime::now(),
            results: Vec::new(),
        }
    }

    /// Account for one terminal result
    pub fn record(&mut self, result: ProgrammingResult) {
        self.total_attempted += 1;
        if result.success {
            self.successful += 1;
        } else {
            self.failed += 1;
        }
        self.results.push(result);
    }

    /// Whether the counters agree with each other
    pub fn is_consistent(&self) -> bool {
        self.total_attempted == self.successful + self.failed
            && self.total_attempted == self.results.len() as u64
    }

    /// Percentage of successful jobs, `None` before the first result
    pub fn success_rate(&self) -> Option<f64> {
        if self.total_attempted == 0 {
            return None;
        }
        Some(self.successful as f64 * 100.0 / self.total_attempted as f64)
    }

    /// Time since the session started
    pub fn runtime(&self) -> Duration {
        SystemTime::now()
            .duration_since(self.started_at)
            .unwrap_or_default()
    }

    /// Devices per minute over `runtime`
    pub fn throughput_per_minute(&self, runtime: Duration) -> f64 {
        let secs = runtime.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.total_attempted as f64 * 60.0 / secs
    }

    /// Results of one port, oldest first
    pub fn results_for<'a>(&'a self, port: &'a str) -> impl Iterator<Item = &'a ProgrammingResult> {
        self.results.iter().filter(move |r| r.port == port)
    }
}

/// Format a duration as `HH:MM:SS`
pub fn format_runtime(runtime: Duration) -> String {
    let total = runtime.as_secs();
    format!(
        "{:02}:{:02}:{:02}",
        total / 3600,
        (total % 3600) / 60,
        total % 60
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(port: &str, success: bool) -> ProgrammingResult {
        ProgrammingResult {
            port: port.into(),
            success,
            message: String::new(),
            duration_seconds: 1.0,
            board: "Arduino Uno".into(),
            fqbn: "arduino:avr:uno".into(),
            firmware: "blink.hex".into(),
            attempts: 1,
            completed_at: SystemTime::now(),
        }
    }

    #[test]
    fn test_record_keeps_counters_consistent() {
        let mut stats = SessionStats::new();
        assert!(stats.is_consistent());
        assert_eq!(stats.success_rate(), None);

        stats.record(result("A", true));
        stats.record(result("B", false));
        stats.record(result("A", true));
        stats.record(result("C", true));

        assert!(stats.is_consistent());
        assert_eq!(stats.total_attempted, 4);
        assert_eq!(stats.successful, 3);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.success_rate(), Some(75.0));
        assert_eq!(stats.results_for("A").count(), 2);
    }

    #[test]
    fn test_throughput() {
        let mut stats = SessionStats::new();
        for _ in 0..6 {
            stats.record(result("A", true));
        }
        assert_eq!(stats.throughput_per_minute(Duration::from_secs(120)), 3.0);
        assert_eq!(stats.throughput_per_minute(Duration::ZERO), 0.0);
    }

    #[test]
    fn test_format_runtime() {
        assert_eq!(format_runtime(Duration::from_secs(0)), "00:00:00");
        assert_eq!(format_runtime(Duration::from_secs(3723)), "01:02:03");
    }
}
