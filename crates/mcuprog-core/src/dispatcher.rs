//! Job dispatch onto a bounded worker pool
//!
//! The dispatcher is owned by the session controller task. It keeps the
//! pending-jobs map (one handle per port, at most), starts jobs on worker
//! tasks while fewer than `pool_size` are running and queues the rest.
//! Workers never touch the map: they report through the completion queue,
//! which the controller drains with [`JobDispatcher::poll_completions`] or
//! awaits with [`JobDispatcher::recv_completion`].
//!
//! Jobs are never killed. Stopping only closes the dispatcher to new
//! submissions, and abandoning a handle only forgets it; the worker runs to
//! its natural end and its late completion is discarded. Until that
//! completion arrives the port stays busy and refuses new submissions, so a
//! device that reconnects quickly is never programmed by two workers.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::events::{EventSink, SessionEvent};
use crate::job::{JobId, ProgrammingJob};
use crate::retry::{run_with_retry, RetryPolicy};
use crate::stats::ProgrammingResult;
use crate::tool::FlashTool;

/// Why a submission was refused
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmitError {
    /// The dispatcher no longer accepts work
    #[error("dispatcher is closed")]
    Closed,
    /// The port already has a pending job
    #[error("port {0} already has a pending job")]
    AlreadyPending(String),
    /// An abandoned job is still running on the port
    #[error("port {0} is still being programmed by an abandoned job")]
    StillRunning(String),
}

/// Message sent by a worker when its job is done
#[derive(Debug)]
pub struct Completion {
    /// Job that finished
    pub job_id: JobId,
    /// Terminal result
    pub result: ProgrammingResult,
}

/// Bookkeeping for a submitted, not yet completed job
#[derive(Debug, Clone)]
pub struct PendingHandle {
    /// Job identifier
    pub job_id: JobId,
    /// Hub group the job was admitted under
    pub hub_group: String,
    /// Submission time
    pub submitted_at: Instant,
    /// Whether a worker has picked the job up
    pub started: bool,
}

/// Bounded worker pool with per-port deduplication
pub struct JobDispatcher<T> {
    tool: Arc<T>,
    policy: Arc<RetryPolicy>,
    events: EventSink,
    pool_size: usize,
    /// Worker tasks alive, abandoned ones included
    running: usize,
    queue: VecDeque<ProgrammingJob>,
    pending: HashMap<String, PendingHandle>,
    /// Ports whose abandoned job has not reported back yet
    abandoned: HashMap<String, JobId>,
    completion_tx: mpsc::UnboundedSender<Completion>,
    completion_rx: mpsc::UnboundedReceiver<Completion>,
    accepting: bool,
    next_id: u64,
}

impl<T: FlashTool> JobDispatcher<T> {
    /// Create a dispatcher with `pool_size` workers
    pub fn new(tool: Arc<T>, policy: RetryPolicy, pool_size: usize, events: EventSink) -> Self {
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        Self {
            tool,
            policy: Arc::new(policy),
            events,
            pool_size: pool_size.max(1),
            running: 0,
            queue: VecDeque::new(),
            pending: HashMap::new(),
            abandoned: HashMap::new(),
            completion_tx,
            completion_rx,
            accepting: true,
            next_id: 1,
        }
    }

    /// Allocate the identifier for the next job
    pub fn next_job_id(&mut self) -> JobId {
        let id = JobId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Submit an admitted job
    ///
    /// The job starts immediately when a worker is free, otherwise it waits
    /// in FIFO order.
    pub fn submit(&mut self, job: ProgrammingJob) -> Result<JobId, SubmitError> {
        if !self.accepting {
            return Err(SubmitError::Closed);
        }
        if self.pending.contains_key(&job.port) {
            return Err(SubmitError::AlreadyPending(job.port));
        }
        if self.abandoned.contains_key(&job.port) {
            return Err(SubmitError::StillRunning(job.port));
        }

        let id = job.id;
        self.pending.insert(
            job.port.clone(),
            PendingHandle {
                job_id: id,
                hub_group: job.hub_group.clone(),
                submitted_at: Instant::now(),
                started: false,
            },
        );

        if self.running < self.pool_size {
            self.start(job);
        } else {
            log::debug!(
                "All {} workers busy, queueing {} ({} queued)",
                self.pool_size,
                job.port,
                self.queue.len() + 1
            );
            self.queue.push_back(job);
        }
        Ok(id)
    }

    fn start(&mut self, job: ProgrammingJob) {
        if let Some(handle) = self.pending.get_mut(&job.port) {
            handle.started = true;
        }
        self.running += 1;

        let tool = Arc::clone(&self.tool);
        let policy = Arc::clone(&self.policy);
        let events = self.events.clone();
        let tx = self.completion_tx.clone();

        tokio::spawn(async move {
            let job_id = job.id;
            let snapshot = job.clone();
            let started = Instant::now();
            events.emit(SessionEvent::JobStarted(job.port.clone()));

            // run on an inner task so a panicking tool still yields a result
            let worker = tokio::spawn({
                let events = events.clone();
                let mut job = job;
                async move { run_with_retry(tool.as_ref(), &mut job, &policy, &events).await }
            });

            let result = match worker.await {
                Ok(result) => result,
                Err(e) => {
                    log::error!("Worker for {} crashed: {}", snapshot.port, e);
                    ProgrammingResult {
                        port: snapshot.port.clone(),
                        success: false,
                        message: format!("Programming worker crashed: {}", e),
                        duration_seconds: started.elapsed().as_secs_f64(),
                        board: snapshot.board.name.clone(),
                        fqbn: snapshot.board.fqbn.clone(),
                        firmware: snapshot.firmware_name(),
                        attempts: snapshot.attempt + 1,
                        completed_at: SystemTime::now(),
                    }
                }
            };

            // receiver gone means the session was torn down
            let _ = tx.send(Completion { job_id, result });
        });
    }

    fn fill_pool(&mut self) {
        while self.running < self.pool_size {
            let Some(job) = self.queue.pop_front() else {
                break;
            };
            self.start(job);
        }
    }

    /// Account for a worker completion
    ///
    /// Returns the result if it belongs to a job that is still pending, or
    /// `None` for a job whose handle was abandoned. The latter frees the port
    /// for new submissions.
    pub fn accept(&mut self, completion: Completion) -> Option<ProgrammingResult> {
        self.running = self.running.saturating_sub(1);

        let port = completion.result.port.clone();
        if self.abandoned.get(&port) == Some(&completion.job_id) {
            self.abandoned.remove(&port);
        }
        let current = self
            .pending
            .get(&port)
            .is_some_and(|h| h.job_id == completion.job_id);

        let outcome = if current {
            self.pending.remove(&port);
            Some(completion.result)
        } else {
            log::debug!(
                "Discarding result of abandoned job {} on {}",
                completion.job_id,
                port
            );
            None
        };

        self.fill_pool();
        outcome
    }

    /// Drain every completion that is already available
    pub fn poll_completions(&mut self) -> Vec<(String, ProgrammingResult)> {
        let mut done = Vec::new();
        while let Ok(completion) = self.completion_rx.try_recv() {
            if let Some(result) = self.accept(completion) {
                done.push((result.port.clone(), result));
            }
        }
        done
    }

    /// Wait for the next completion
    ///
    /// Pending forever while no worker is alive; use it inside `select!`.
    pub async fn recv_completion(&mut self) -> Completion {
        match self.completion_rx.recv().await {
            Some(c) => c,
            // we hold a sender, so the channel cannot close under us
            None => std::future::pending().await,
        }
    }

    /// Forget the job of a port without waiting for it
    ///
    /// A queued job is dropped; a running one keeps going, keeps the port
    /// busy and its completion is discarded. Returns whether the port had a
    /// pending job.
    pub fn abandon(&mut self, port: &str) -> bool {
        let Some(handle) = self.pending.remove(port) else {
            return false;
        };
        if handle.started {
            self.abandoned.insert(port.to_string(), handle.job_id);
        } else {
            self.queue.retain(|j| j.port != port);
        }
        log::debug!(
            "Abandoned job {} on {} (Hub: {})",
            handle.job_id,
            port,
            handle.hub_group
        );
        true
    }

    /// Refuse every later submission
    pub fn close(&mut self) {
        self.accepting = false;
    }

    /// Whether submissions are still accepted
    pub fn is_accepting(&self) -> bool {
        self.accepting
    }

    /// Whether the port has a pending job
    pub fn is_pending(&self, port: &str) -> bool {
        self.pending.contains_key(port)
    }

    /// Whether the port has a pending job or an abandoned one still running
    pub fn is_busy(&self, port: &str) -> bool {
        self.pending.contains_key(port) || self.abandoned.contains_key(port)
    }

    /// Abandoned jobs that have not reported back yet
    pub fn abandoned_count(&self) -> usize {
        self.abandoned.len()
    }

    /// Number of pending handles
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Pending handles by port
    pub fn pending(&self) -> impl Iterator<Item = (&str, &PendingHandle)> {
        self.pending.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Worker tasks still alive, abandoned ones included
    pub fn running(&self) -> usize {
        self.running
    }

    /// Jobs waiting for a worker
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Pre-flash delay currently applied to hub-attached ports
    pub fn hub_delay(&self) -> Duration {
        self.policy.hub_delay
    }

    /// Raise the hub pre-flash delay for jobs started from now on
    ///
    /// Never lowers it; jobs already running keep the policy they started
    /// with.
    pub fn raise_hub_delay(&mut self, at_least: Duration) {
        if self.policy.hub_delay >= at_least {
            return;
        }
        let mut policy = RetryPolicy::clone(&self.policy);
        policy.hub_delay = at_least;
        self.policy = Arc::new(policy);
    }

    /// Current worker pool size
    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Resize the worker pool
    ///
    /// Shrinking never interrupts running jobs; it only delays starting
    /// queued ones until the running count drops below the new size.
    pub fn set_pool_size(&mut self, size: usize) {
        self.pool_size = size.max(1);
        self.fill_pool();
    }
}
