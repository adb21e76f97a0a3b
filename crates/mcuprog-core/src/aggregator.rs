//! Result aggregation
//!
//! Terminal results flow through [`ResultAggregator::apply`], the single
//! writer of [`SessionStats`]. Releasing the port's hub slot happens inside
//! the same call, so a freed slot is visible to the very next admission
//! check.

use crate::admission::AdmissionController;
use crate::events::{EventSink, SessionEvent};
use crate::stats::{ProgrammingResult, SessionStats};

/// The mutable state shared by admission and aggregation
///
/// Owned by the session controller task; every mutation happens through a
/// `&mut` borrow taken on that task.
#[derive(Debug, Clone, Default)]
pub struct SessionLedger {
    /// Hub-capacity admission state
    pub admission: AdmissionController,
    /// Session counters and results
    pub stats: SessionStats,
}

impl SessionLedger {
    /// Fresh ledger for a new session
    pub fn new(hub_capacity: usize) -> Self {
        Self {
            admission: AdmissionController::new(hub_capacity),
            stats: SessionStats::new(),
        }
    }
}

/// Applies terminal results to the ledger
#[derive(Debug, Clone)]
pub struct ResultAggregator {
    events: EventSink,
}

impl ResultAggregator {
    /// Create an aggregator emitting into `events`
    pub fn new(events: EventSink) -> Self {
        Self { events }
    }

    /// Record one terminal result
    ///
    /// Frees the port's hub slot, updates the counters, writes exactly one
    /// log line and emits the completion plus a statistics snapshot.
    pub fn apply(&self, ledger: &mut SessionLedger, result: ProgrammingResult) {
        ledger.admission.release(&result.port);

        if result.success {
            log::info!(
                "{} programmed successfully ({:.2}s) [{}]",
                result.port,
                result.duration_seconds,
                result.fqbn
            );
        } else {
            log::error!(
                "{} failed: {} ({:.2}s)",
                result.port,
                result.message,
                result.duration_seconds
            );
        }

        ledger.stats.record(result.clone());
        debug_assert!(ledger.stats.is_consistent());

        self.events.emit(SessionEvent::JobCompleted(result));
        self.events
            .emit(SessionEvent::StatsSnapshot(ledger.stats.clone()));
    }
}
