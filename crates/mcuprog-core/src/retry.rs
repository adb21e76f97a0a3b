//! Retry orchestration for a single programming job
//!
//! [`run_with_retry`] calls the flashing tool up to `max_attempts` times.
//! Hub-attached ports wait a pre-delay before the first attempt so the
//! device can finish USB re-enumeration. Failed attempts are followed by a
//! flat back-off: 2s on a hub, 1s direct.
//!
//! Attempt failures never escape this module. A tool error is just a failed
//! attempt whose message is the error text; the last attempt's message
//! becomes the terminal result's message.

use std::time::{Duration, SystemTime};

use tokio::time::Instant;

use crate::config::SessionConfig;
use crate::events::{EventSink, SessionEvent};
use crate::job::ProgrammingJob;
use crate::stats::ProgrammingResult;
use crate::tool::{FlashRequest, FlashTool};

/// Back-off between attempts on hub-attached ports
pub const HUB_RETRY_BACKOFF: Duration = Duration::from_secs(2);
/// Back-off between attempts on direct ports
pub const DIRECT_RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// Timing and tool options applied to every job of a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Pre-delay before attempt 0 on hub-attached ports
    pub hub_delay: Duration,
    /// Back-off between attempts on hub-attached ports
    pub hub_backoff: Duration,
    /// Back-off between attempts on direct ports
    pub direct_backoff: Duration,
    /// Upper bound for one tool invocation
    pub timeout: Duration,
    /// Ask the tool to verify
    pub verify: bool,
    /// Ask the tool for verbose output
    pub verbose: bool,
}

impl RetryPolicy {
    /// Derive the policy from a session configuration
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            hub_delay: config.hub_delay(),
            hub_backoff: HUB_RETRY_BACKOFF,
            direct_backoff: DIRECT_RETRY_BACKOFF,
            timeout: config.programming_timeout(),
            verify: config.verify_after_program,
            verbose: config.verbose_output,
        }
    }

    fn backoff(&self, job: &ProgrammingJob) -> Duration {
        if job.is_direct() {
            self.direct_backoff
        } else {
            self.hub_backoff
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&SessionConfig::default())
    }
}

/// Program one device, retrying failed attempts
pub async fn run_with_retry<T: FlashTool>(
    tool: &T,
    job: &mut ProgrammingJob,
    policy: &RetryPolicy,
    events: &EventSink,
) -> ProgrammingResult {
    let started = Instant::now();
    let request = FlashRequest {
        firmware: job.firmware.clone(),
        fqbn: job.board.fqbn.clone(),
        port: job.port.clone(),
        verify: policy.verify,
        verbose: policy.verbose,
        timeout: policy.timeout,
    };

    if !job.is_direct() && !policy.hub_delay.is_zero() {
        log::debug!(
            "Waiting {:?} before programming {} (Hub: {})",
            policy.hub_delay,
            job.port,
            job.hub_group
        );
        tokio::time::sleep(policy.hub_delay).await;
    }

    let mut message = String::new();
    let mut success = false;
    let mut attempts = 0;

    for attempt in 0..job.max_attempts {
        job.attempt = attempt;

        if attempt > 0 {
            log::warn!(
                "Retry {}/{} for {} (Hub: {})",
                attempt,
                job.max_attempts - 1,
                job.port,
                job.hub_group
            );
            events.emit(SessionEvent::JobRetried {
                port: job.port.clone(),
                attempt,
                reason: message.clone(),
            });
            tokio::time::sleep(policy.backoff(job)).await;
        }

        attempts += 1;
        match tool.program(&request).await {
            Ok(report) => {
                success = report.success;
                message = report.message;
            }
            Err(e) => {
                success = false;
                message = e.to_string();
            }
        }

        if success {
            break;
        }
        if attempt + 1 < job.max_attempts {
            log::warn!(
                "{} failed (attempt {}): {}",
                job.port,
                attempt + 1,
                message
            );
        }
    }

    ProgrammingResult {
        port: job.port.clone(),
        success,
        message,
        duration_seconds: started.elapsed().as_secs_f64(),
        board: job.board.name.clone(),
        fqbn: job.board.fqbn.clone(),
        firmware: job.firmware_name(),
        attempts,
        completed_at: SystemTime::now(),
    }
}
