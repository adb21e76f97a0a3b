//! Session controller
//!
//! The controller is a single task that owns every piece of mutable session
//! state: the [`SessionLedger`] (hub admission + statistics), the
//! [`JobDispatcher`]'s pending map and the per-port bookkeeping. The
//! presentation layer talks to it only through [`SessionHandle`] commands
//! and the event stream.
//!
//! ```text
//!   Idle --Start(ok)--> Running --Stop--> Stopping --no pending / grace--> Idle
//!     ^  \--Start(err)--> StartRejected, stays Idle
//! ```
//!
//! Each discovery tick while `Running`:
//!
//! 1. resolve the hub topology (a failed scan skips the tick),
//! 2. drain finished jobs into the aggregator (which frees their slots),
//! 3. diff against known ports; vanished ports release their hub slot and
//!    abandon their pending job,
//! 4. tighten hub limits the first time a hub at depth >= 2 shows up,
//! 5. admit and dispatch eligible ports in port-id order.
//!
//! Draining first means a job that finished before its device was unplugged
//! still counts. Completions that arrive between ticks are aggregated
//! immediately. A port whose abandoned job is still running stays
//! ineligible until that job reports back.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::aggregator::{ResultAggregator, SessionLedger};
use crate::board::{Board, BoardDatabase};
use crate::config::{ExecutionMode, SessionConfig};
use crate::dispatcher::{Completion, JobDispatcher};
use crate::error::{ConfigError, Error, Result};
use crate::events::{EventSink, SessionCommand, SessionEvent, SessionState};
use crate::job::ProgrammingJob;
use crate::retry::RetryPolicy;
use crate::stats::{format_runtime, ProgrammingResult, SessionStats};
use crate::tool::FlashTool;
use crate::topology::{HubTopologyResolver, Port, PortEnumerator, DIRECT_GROUP};

/// Hub depth from which limits are tightened
pub const NESTED_HUB_DEPTH: u32 = 2;
/// Worker pool ceiling once nested hubs were seen
pub const NESTED_HUB_POOL_LIMIT: usize = 2;
/// Minimum hub pre-flash delay once nested hubs were seen
pub const NESTED_HUB_DELAY: Duration = Duration::from_secs(2);

/// Presentation-side handle to a running controller
#[derive(Debug, Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<SessionCommand>,
    stop: Arc<AtomicBool>,
}

impl SessionHandle {
    fn send(&self, cmd: SessionCommand) -> Result<()> {
        self.commands.send(cmd).map_err(|_| Error::SessionClosed)
    }

    /// Request a session start
    pub fn start(&self, config: SessionConfig) -> Result<()> {
        self.send(SessionCommand::Start(Box::new(config)))
    }

    /// Request a stop; in-flight jobs still finish
    pub fn stop(&self) -> Result<()> {
        self.stop.store(true, Ordering::SeqCst);
        self.send(SessionCommand::Stop)
    }

    /// Switch execution mode
    pub fn set_mode(&self, mode: ExecutionMode) -> Result<()> {
        self.send(SessionCommand::SetMode(mode))
    }

    /// Stop any session and end the controller task
    pub fn shutdown(&self) -> Result<()> {
        self.stop.store(true, Ordering::SeqCst);
        self.send(SessionCommand::Shutdown)
    }

    /// The stop flag shared with the controller
    ///
    /// Setting it halts admissions at the next check even before the `Stop`
    /// command is processed; usable from signal handlers.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }
}

/// Spawn a controller task and return its handle and event stream
pub fn spawn_session<E, T>(
    enumerator: E,
    tool: Arc<T>,
    boards: BoardDatabase,
) -> (
    SessionHandle,
    mpsc::UnboundedReceiver<SessionEvent>,
    JoinHandle<()>,
)
where
    E: PortEnumerator + 'static,
    T: FlashTool,
{
    let (events, event_rx) = EventSink::channel();
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let controller = SessionController::new(enumerator, tool, boards, events);
    let handle = SessionHandle {
        commands: cmd_tx,
        stop: controller.stop_flag(),
    };
    let task = tokio::spawn(controller.run(cmd_rx));
    (handle, event_rx, task)
}

/// Per-port bookkeeping while a port stays connected
#[derive(Debug, Clone)]
struct KnownPort {
    port: Port,
    /// Dispatched during the current connection
    served: bool,
    /// Already told the user the port waits for hub capacity
    delay_logged: bool,
}

/// State of one running session
pub struct Session<T> {
    config: SessionConfig,
    board: Board,
    firmware: PathBuf,
    mode: ExecutionMode,
    ledger: SessionLedger,
    dispatcher: JobDispatcher<T>,
    aggregator: ResultAggregator,
    events: EventSink,
    known: BTreeMap<String, KnownPort>,
    /// Ports with at least one result this session
    programmed: HashSet<String>,
}

impl<T: FlashTool> Session<T> {
    /// Set up a session for an already validated configuration
    pub fn new(config: SessionConfig, board: Board, tool: Arc<T>, events: EventSink) -> Self {
        let policy = RetryPolicy::from_config(&config);
        let dispatcher =
            JobDispatcher::new(tool, policy, config.max_parallel_jobs, events.clone());
        Self {
            firmware: config.firmware.clone().unwrap_or_default(),
            mode: config.execution_mode,
            ledger: SessionLedger::new(config.max_devices_per_hub),
            dispatcher,
            aggregator: ResultAggregator::new(events.clone()),
            events,
            known: BTreeMap::new(),
            programmed: HashSet::new(),
            board,
            config,
        }
    }

    /// Current execution mode
    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Switch execution mode for the rest of the session
    pub fn set_mode(&mut self, mode: ExecutionMode) {
        if mode != self.mode {
            log::info!("Execution mode changed: {} -> {}", self.mode, mode);
            self.mode = mode;
        }
    }

    /// Statistics so far
    pub fn stats(&self) -> &SessionStats {
        &self.ledger.stats
    }

    /// Admission and statistics state
    pub fn ledger(&self) -> &SessionLedger {
        &self.ledger
    }

    /// The job dispatcher
    pub fn dispatcher(&self) -> &JobDispatcher<T> {
        &self.dispatcher
    }

    fn eligible(&self, known: &KnownPort) -> bool {
        let id = &known.port.id;
        if known.served || self.dispatcher.is_busy(id) {
            return false;
        }
        !(self.mode == ExecutionMode::SingleBatch && self.programmed.contains(id))
    }

    /// Run one discovery tick against a resolved snapshot
    pub fn tick(&mut self, ports: Vec<Port>, stop: &AtomicBool) {
        let max_depth = ports.iter().map(|p| p.hub_depth).max().unwrap_or(0);
        let ports = self.apply_target_filter(ports);

        // 2. results that landed before a device vanished still count
        for (_, result) in self.dispatcher.poll_completions() {
            self.record(result);
        }

        // 3. diff against what we knew
        let current: HashSet<&str> = ports.iter().map(|p| p.id.as_str()).collect();
        let vanished: Vec<String> = self
            .known
            .keys()
            .filter(|id| !current.contains(id.as_str()))
            .cloned()
            .collect();
        for id in vanished {
            self.forget_port(&id);
        }

        for port in ports {
            match self.known.get_mut(&port.id) {
                Some(entry) => entry.port = port,
                None => {
                    log::debug!(
                        "Port connected: {} (Hub: {}, depth {})",
                        port.id,
                        port.hub_group,
                        port.hub_depth
                    );
                    self.events
                        .emit(SessionEvent::PortConnected(port.id.clone()));
                    self.known.insert(
                        port.id.clone(),
                        KnownPort {
                            port,
                            served: false,
                            delay_logged: false,
                        },
                    );
                }
            }
        }

        // 4. nested hubs
        if max_depth >= NESTED_HUB_DEPTH {
            self.tighten_limits(max_depth);
        }

        // 5. admit + dispatch
        self.admit_eligible(stop);

        self.events
            .emit(SessionEvent::StatsSnapshot(self.ledger.stats.clone()));
    }

    fn apply_target_filter(&self, ports: Vec<Port>) -> Vec<Port> {
        let Some(target) = self.config.target_port.as_deref() else {
            return ports;
        };
        ports
            .into_iter()
            .filter(|p| p.id == target)
            .map(|p| Port {
                hub_group: DIRECT_GROUP.to_string(),
                hub_depth: 0,
                ..p
            })
            .collect()
    }

    fn forget_port(&mut self, id: &str) {
        self.known.remove(id);
        let abandoned = self.dispatcher.abandon(id);
        self.ledger.admission.release(id);
        if abandoned {
            log::warn!("Device disconnected while programming: {}", id);
        } else {
            log::debug!("Port disconnected: {}", id);
        }
        self.events
            .emit(SessionEvent::PortDisconnected(id.to_string()));
    }

    fn tighten_limits(&mut self, depth: u32) {
        if !self.ledger.admission.tighten_for_nested_hubs() {
            return;
        }
        let pool = self.dispatcher.pool_size().min(NESTED_HUB_POOL_LIMIT);
        self.dispatcher.set_pool_size(pool);
        self.dispatcher.raise_hub_delay(NESTED_HUB_DELAY);
        log::warn!("Nested USB hubs detected (level {})", depth);
        log::info!(
            "Reducing parallel operations for stability: {} per hub, {} workers, {:.1}s hub delay",
            self.ledger.admission.capacity(),
            pool,
            self.dispatcher.hub_delay().as_secs_f64()
        );
        self.events.emit(SessionEvent::LimitsTightened {
            depth,
            hub_capacity: self.ledger.admission.capacity(),
            pool_size: pool,
        });
    }

    fn admit_eligible(&mut self, stop: &AtomicBool) {
        let candidates: Vec<String> = self
            .known
            .values()
            .filter(|k| self.eligible(k))
            .map(|k| k.port.id.clone())
            .collect();

        for id in candidates {
            if stop.load(Ordering::SeqCst) {
                log::debug!("Stop requested, not admitting further ports");
                break;
            }
            let Some(entry) = self.known.get(&id) else {
                continue;
            };
            let port = entry.port.clone();

            if !self.ledger.admission.try_admit(&port) {
                if let Some(entry) = self.known.get_mut(&id) {
                    if !entry.delay_logged {
                        log::warn!(
                            "Delaying {} - USB hub {} at capacity",
                            port.id,
                            port.hub_group
                        );
                        entry.delay_logged = true;
                    }
                }
                continue;
            }

            let job_id = self.dispatcher.next_job_id();
            let job = ProgrammingJob::new(
                job_id,
                &port,
                self.board.clone(),
                &self.firmware,
                self.config.max_attempts(),
            );

            match self.dispatcher.submit(job) {
                Ok(_) => {
                    log::info!("New device detected: {} (Hub: {})", port.id, port.hub_group);
                    if let Some(entry) = self.known.get_mut(&id) {
                        entry.served = true;
                    }
                }
                Err(e) => {
                    // keep the slot invariant: no slot without a pending job
                    self.ledger.admission.release(&port.id);
                    log::debug!("Not dispatching {}: {}", port.id, e);
                }
            }
        }
    }

    fn record(&mut self, result: ProgrammingResult) {
        self.programmed.insert(result.port.clone());
        self.aggregator.apply(&mut self.ledger, result);
    }

    /// Handle a completion delivered between ticks
    pub fn on_completion(&mut self, completion: Completion) {
        if let Some(result) = self.dispatcher.accept(completion) {
            self.record(result);
        }
    }

    /// Check the slot invariant: occupied slots == pending jobs
    pub fn slots_match_pending(&self) -> bool {
        self.ledger.admission.total_active() == self.dispatcher.pending_count()
    }
}

enum Next {
    Idle,
    Shutdown,
}

/// Top-level state machine driving sessions
pub struct SessionController<E, T> {
    resolver: HubTopologyResolver<E>,
    tool: Arc<T>,
    boards: BoardDatabase,
    events: EventSink,
    state: SessionState,
    stop: Arc<AtomicBool>,
    pending_mode: Option<ExecutionMode>,
}

impl<E: PortEnumerator, T: FlashTool> SessionController<E, T> {
    /// Create an idle controller
    pub fn new(enumerator: E, tool: Arc<T>, boards: BoardDatabase, events: EventSink) -> Self {
        Self {
            resolver: HubTopologyResolver::new(enumerator),
            tool,
            boards,
            events,
            state: SessionState::Idle,
            stop: Arc::new(AtomicBool::new(false)),
            pending_mode: None,
        }
    }

    /// The stop flag checked by the poll loop
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        self.state
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            log::debug!("Session state: {} -> {}", self.state, state);
            self.state = state;
            self.events.emit(SessionEvent::SessionStateChanged(state));
        }
    }

    /// Process commands until shutdown or until every handle is dropped
    pub async fn run(mut self, mut commands: mpsc::UnboundedReceiver<SessionCommand>) {
        while let Some(cmd) = commands.recv().await {
            match cmd {
                SessionCommand::Start(config) => match self.prepare(*config).await {
                    Ok(session) => {
                        if let Next::Shutdown = self.run_session(session, &mut commands).await {
                            break;
                        }
                    }
                    Err(e) => {
                        log::error!("Cannot start session: {}", e);
                        self.events.emit(SessionEvent::StartRejected(e.to_string()));
                    }
                },
                SessionCommand::Stop => log::debug!("Stop ignored: no session running"),
                SessionCommand::SetMode(mode) => {
                    log::info!("Execution mode {} will apply to the next session", mode);
                    self.pending_mode = Some(mode);
                }
                SessionCommand::Shutdown => break,
            }
        }
        log::debug!("Session controller finished");
    }

    /// Validate the configuration and bring the tool up
    async fn prepare(&mut self, mut config: SessionConfig) -> std::result::Result<Session<T>, ConfigError> {
        if let Some(mode) = self.pending_mode.take() {
            config.execution_mode = mode;
        }
        config.validate()?;

        let selection = config.board.clone().unwrap_or_default();
        let board = self
            .boards
            .resolve(&selection)
            .ok_or(ConfigError::UnknownBoard(selection))?;

        let version = self
            .tool
            .check()
            .await
            .map_err(|e| ConfigError::ToolUnavailable(e.to_string()))?;
        log::info!("{} detected: {}", self.tool.name(), version);

        if config.update_index_on_start {
            log::info!("Updating core index...");
            match self.tool.update_index().await {
                Ok(()) => log::info!("Core index updated"),
                Err(e) => log::warn!("Core index update failed: {}", e),
            }
        }

        if config.auto_install_cores {
            log::info!("Ensuring core {} is installed...", board.core);
            let msg = self
                .tool
                .prepare(&board)
                .await
                .map_err(|e| ConfigError::PreparationFailed {
                    board: board.name.clone(),
                    reason: e.to_string(),
                })?;
            log::info!("Core ready: {}", msg);
        }

        Ok(Session::new(
            config,
            board,
            Arc::clone(&self.tool),
            self.events.clone(),
        ))
    }

    fn poll_once(&mut self, session: &mut Session<T>) {
        match self.resolver.resolve() {
            Ok(ports) => session.tick(ports, &self.stop),
            Err(e) => log::warn!("{}; skipping this scan", e),
        }
    }

    async fn run_session(
        &mut self,
        mut session: Session<T>,
        commands: &mut mpsc::UnboundedReceiver<SessionCommand>,
    ) -> Next {
        self.stop.store(false, Ordering::SeqCst);
        self.set_state(SessionState::Running);

        log::info!("Programming session started");
        log::info!("Board: {} ({})", session.board.name, session.board.fqbn);
        log::info!("File: {}", session.firmware.display());
        if let Some(port) = &session.config.target_port {
            log::info!("Port: {}", port);
        }
        log::info!("Max parallel jobs: {}", session.config.max_parallel_jobs);
        log::info!("Mode: {}", session.mode);
        self.events
            .emit(SessionEvent::StatsSnapshot(session.stats().clone()));

        let mut next = Next::Idle;
        let mut ticker = tokio::time::interval(session.config.scan_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if self.stop.load(Ordering::SeqCst) {
                break;
            }
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(SessionCommand::Stop) => {
                        self.stop.store(true, Ordering::SeqCst);
                    }
                    Some(SessionCommand::SetMode(mode)) => session.set_mode(mode),
                    Some(SessionCommand::Start(_)) => {
                        log::warn!("Session already running; start ignored");
                        self.events.emit(SessionEvent::StartRejected(
                            "a session is already running".into(),
                        ));
                    }
                    Some(SessionCommand::Shutdown) | None => {
                        self.stop.store(true, Ordering::SeqCst);
                        next = Next::Shutdown;
                    }
                },
                completion = session.dispatcher.recv_completion() => {
                    session.on_completion(completion);
                }
                _ = ticker.tick() => {
                    if !self.stop.load(Ordering::SeqCst) {
                        self.poll_once(&mut session);
                    }
                }
            }
        }

        if let Next::Shutdown = self.drain(&mut session, commands).await {
            next = Next::Shutdown;
        }

        let stats = session.stats().clone();
        log::info!(
            "Programming session stopped: {} programmed, {} ok, {} failed, runtime {}",
            stats.total_attempted,
            stats.successful,
            stats.failed,
            format_runtime(stats.runtime())
        );
        self.events.emit(SessionEvent::StatsSnapshot(stats));
        self.set_state(SessionState::Idle);
        next
    }

    /// Stopping: no admissions, wait for pending jobs up to the grace period
    async fn drain(
        &mut self,
        session: &mut Session<T>,
        commands: &mut mpsc::UnboundedReceiver<SessionCommand>,
    ) -> Next {
        self.set_state(SessionState::Stopping);
        session.dispatcher.close();

        let mut next = Next::Idle;
        let mut commands_open = true;
        let deadline = Instant::now() + session.config.stop_grace();

        if session.dispatcher.pending_count() > 0 {
            log::info!(
                "Waiting for {} in-flight job(s) to finish",
                session.dispatcher.pending_count()
            );
        }

        while session.dispatcher.pending_count() > 0 {
            tokio::select! {
                completion = session.dispatcher.recv_completion() => {
                    session.on_completion(completion);
                }
                _ = tokio::time::sleep_until(deadline) => {
                    log::warn!(
                        "Abandoning {} job(s) still running after the stop grace period",
                        session.dispatcher.pending_count()
                    );
                    break;
                }
                cmd = commands.recv(), if commands_open => match cmd {
                    Some(SessionCommand::Stop) => {
                        log::warn!(
                            "Second stop: abandoning {} running job(s)",
                            session.dispatcher.pending_count()
                        );
                        break;
                    }
                    Some(SessionCommand::SetMode(mode)) => session.set_mode(mode),
                    Some(SessionCommand::Start(_)) => {
                        self.events.emit(SessionEvent::StartRejected(
                            "the previous session is still stopping".into(),
                        ));
                    }
                    Some(SessionCommand::Shutdown) => next = Next::Shutdown,
                    None => {
                        commands_open = false;
                        next = Next::Shutdown;
                    }
                },
            }
        }

        // results that raced with the deadline still count
        for (_, result) in session.dispatcher.poll_completions() {
            session.record(result);
        }
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{raw, ScriptedEnumerator, ScriptedTool, Step};
    use crate::topology::resolve_ports;

    fn config() -> SessionConfig {
        SessionConfig {
            board: Some("Arduino Uno".into()),
            firmware: Some(PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("Cargo.toml")),
            max_retries: 0,
            ..Default::default()
        }
    }

    fn board() -> Board {
        Board::new("Arduino", "Arduino Uno", "arduino:avr:uno")
    }

    fn session(cfg: SessionConfig, tool: Arc<ScriptedTool>) -> Session<ScriptedTool> {
        Session::new(cfg, board(), tool, EventSink::discard())
    }

    async fn finish_one(s: &mut Session<ScriptedTool>) {
        let c = s.dispatcher.recv_completion().await;
        s.on_completion(c);
    }

    fn no_stop() -> AtomicBool {
        AtomicBool::new(false)
    }

    #[tokio::test(start_paused = true)]
    async fn test_hub_capacity_one_admits_one_per_tick() {
        let tool = Arc::new(ScriptedTool::always_ok().with_latency(Duration::from_secs(5)));
        let mut s = session(
            SessionConfig {
                max_devices_per_hub: 1,
                ..config()
            },
            tool.clone(),
        );
        let ports = resolve_ports(&[raw("A", "1-2.1"), raw("B", "1-2.2")]);
        assert_eq!(ports[0].hub_group, "1-2");

        s.tick(ports.clone(), &no_stop());
        assert_eq!(s.dispatcher().pending_count(), 1);
        assert!(s.dispatcher().is_pending("A"));
        assert!(s.slots_match_pending());

        // still busy: B keeps waiting
        s.tick(ports.clone(), &no_stop());
        assert!(!s.dispatcher().is_pending("B"));

        finish_one(&mut s).await;
        assert_eq!(s.ledger().admission.active_count("1-2"), 0);

        s.tick(ports, &no_stop());
        assert!(s.dispatcher().is_pending("B"));
        assert!(s.slots_match_pending());
        finish_one(&mut s).await;

        assert_eq!(s.stats().total_attempted, 2);
        assert_eq!(tool.max_concurrent(), 1);
        assert_eq!(tool.max_concurrent_per_port(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_batch_never_redispatches() {
        let tool = Arc::new(ScriptedTool::always_ok());
        let mut s = session(
            SessionConfig {
                execution_mode: ExecutionMode::SingleBatch,
                ..config()
            },
            tool.clone(),
        );
        let present = resolve_ports(&[raw("A", "")]);

        s.tick(present.clone(), &no_stop());
        finish_one(&mut s).await;
        s.tick(Vec::new(), &no_stop());
        s.tick(present.clone(), &no_stop());
        s.tick(present, &no_stop());

        assert!(!s.dispatcher().is_pending("A"));
        assert_eq!(tool.calls_for("A"), 1);
        assert_eq!(s.stats().results.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_continuous_redispatches_after_reconnect() {
        let tool = Arc::new(ScriptedTool::always_ok());
        let mut s = session(config(), tool.clone());
        let present = resolve_ports(&[raw("A", "")]);

        s.tick(present.clone(), &no_stop());
        finish_one(&mut s).await;

        // staying connected does not re-program
        s.tick(present.clone(), &no_stop());
        assert!(!s.dispatcher().is_pending("A"));

        s.tick(Vec::new(), &no_stop());
        s.tick(present, &no_stop());
        assert!(s.dispatcher().is_pending("A"));
        finish_one(&mut s).await;

        assert_eq!(tool.calls_for("A"), 2);
        assert_eq!(s.stats().results_for("A").count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_switch_to_single_batch_mid_session() {
        let tool = Arc::new(ScriptedTool::always_ok());
        let mut s = session(config(), tool.clone());
        let present = resolve_ports(&[raw("A", "")]);

        s.tick(present.clone(), &no_stop());
        finish_one(&mut s).await;
        s.set_mode(ExecutionMode::SingleBatch);

        s.tick(Vec::new(), &no_stop());
        s.tick(present, &no_stop());
        assert!(!s.dispatcher().is_pending("A"));
        assert_eq!(tool.calls_for("A"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_nested_hub_tightens_limits() {
        let tool = Arc::new(ScriptedTool::always_ok().with_latency(Duration::from_secs(10)));
        let mut s = session(
            SessionConfig {
                max_devices_per_hub: 3,
                max_parallel_jobs: 8,
                ..config()
            },
            tool.clone(),
        );

        // first tick: one hub level, three ports admitted under capacity 3
        let shallow = resolve_ports(&[raw("A", "1-1.1"), raw("B", "1-1.2"), raw("C", "1-1.3")]);
        s.tick(shallow.clone(), &no_stop());
        assert_eq!(s.dispatcher().pending_count(), 3);

        // a device two hubs deep shows up
        let mut deep = shallow;
        deep.extend(resolve_ports(&[raw("D", "1-1.4.1"), raw("E", "1-1.4.2")]));
        assert_eq!(deep[3].hub_depth, 2);
        s.tick(deep.clone(), &no_stop());

        assert!(s.ledger().admission.is_tightened());
        assert_eq!(s.ledger().admission.capacity(), 1);
        assert_eq!(s.dispatcher().pool_size(), 2);
        assert_eq!(s.dispatcher().hub_delay(), NESTED_HUB_DELAY);
        // already admitted jobs keep running
        assert_eq!(s.dispatcher().running(), 3);
        // hub 1-1.4 gets exactly one slot
        assert_eq!(s.ledger().admission.active_count("1-1.4"), 1);

        while s.dispatcher().pending_count() > 0 {
            finish_one(&mut s).await;
            s.tick(deep.clone(), &no_stop());
            for (group, g) in s.ledger().admission.groups() {
                assert!(g.active_count() <= 1 || group == "1-1");
            }
        }
        assert_eq!(s.stats().total_attempted, 5);
        assert!(tool.max_concurrent() <= 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_releases_slot_and_discards_late_result() {
        let tool = Arc::new(ScriptedTool::always_ok().with_latency(Duration::from_secs(5)));
        let mut s = session(
            SessionConfig {
                max_devices_per_hub: 1,
                ..config()
            },
            tool.clone(),
        );
        let both = resolve_ports(&[raw("A", "1-2.1"), raw("B", "1-2.2")]);
        s.tick(both, &no_stop());
        assert!(s.dispatcher().is_pending("A"));
        tokio::time::sleep(Duration::from_secs(1)).await;

        // A unplugged mid-flight: its slot goes to B on the same tick
        let only_b = resolve_ports(&[raw("B", "1-2.2")]);
        s.tick(only_b.clone(), &no_stop());
        assert!(!s.dispatcher().is_pending("A"));
        assert!(s.dispatcher().is_pending("B"));
        assert!(s.slots_match_pending());

        // A's late completion arrives first and is dropped
        finish_one(&mut s).await;
        assert_eq!(s.stats().total_attempted, 0);
        finish_one(&mut s).await;
        assert_eq!(s.stats().total_attempted, 1);
        assert_eq!(s.stats().results[0].port, "B");
        assert!(s.stats().is_consistent());
    }

    #[tokio::test(start_paused = true)]
    async fn test_quick_reconnect_waits_for_abandoned_job() {
        let tool = Arc::new(ScriptedTool::always_ok().with_latency(Duration::from_secs(10)));
        let mut s = session(config(), tool.clone());
        let present = resolve_ports(&[raw("A", "")]);

        s.tick(present.clone(), &no_stop());
        tokio::time::sleep(Duration::from_secs(2)).await;
        s.tick(Vec::new(), &no_stop());
        assert_eq!(s.dispatcher().abandoned_count(), 1);
        tokio::time::sleep(Duration::from_secs(2)).await;

        // back before the first job finished: not dispatched again yet
        s.tick(present.clone(), &no_stop());
        assert!(!s.dispatcher().is_pending("A"));
        assert!(s.dispatcher().is_busy("A"));
        assert!(s.slots_match_pending());
        assert_eq!(tool.calls_for("A"), 1);

        // the late result is dropped, then the next tick programs it again
        finish_one(&mut s).await;
        assert_eq!(s.stats().total_attempted, 0);
        s.tick(present, &no_stop());
        assert!(s.dispatcher().is_pending("A"));
        assert!(s.slots_match_pending());
        finish_one(&mut s).await;

        assert_eq!(tool.calls_for("A"), 2);
        assert_eq!(tool.max_concurrent_per_port(), 1);
        assert_eq!(s.stats().total_attempted, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_result_finished_before_unplug_is_recorded() {
        let tool = Arc::new(ScriptedTool::always_ok().with_latency(Duration::from_secs(1)));
        let mut s = session(config(), tool.clone());

        s.tick(resolve_ports(&[raw("A", "")]), &no_stop());
        tokio::time::sleep(Duration::from_secs(2)).await;

        // the job is done but its completion was not drained yet
        s.tick(Vec::new(), &no_stop());
        assert_eq!(s.stats().total_attempted, 1);
        assert_eq!(s.stats().successful, 1);
        assert_eq!(s.dispatcher().abandoned_count(), 0);
        assert!(s.stats().is_consistent());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_flag_blocks_admission() {
        let tool = Arc::new(ScriptedTool::always_ok());
        let mut s = session(config(), tool.clone());
        let stop = AtomicBool::new(true);

        s.tick(resolve_ports(&[raw("A", "")]), &stop);
        assert_eq!(s.dispatcher().pending_count(), 0);
        assert!(tool.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_target_port_filters_and_forces_direct() {
        let tool = Arc::new(ScriptedTool::always_ok().with_latency(Duration::from_secs(1)));
        let mut s = session(
            SessionConfig {
                target_port: Some("B".into()),
                ..config()
            },
            tool,
        );
        s.tick(resolve_ports(&[raw("A", "1-2.1"), raw("B", "1-2.2")]), &no_stop());

        assert!(!s.dispatcher().is_pending("A"));
        assert!(s.dispatcher().is_pending("B"));
        assert_eq!(s.ledger().admission.active_count(DIRECT_GROUP), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_double_dispatch_under_churn() {
        let tool = Arc::new(ScriptedTool::always_ok().with_latency(Duration::from_millis(2500)));
        let mut s = session(
            SessionConfig {
                max_devices_per_hub: 2,
                max_parallel_jobs: 3,
                ..config()
            },
            tool.clone(),
        );
        let all = [
            raw("A", "1-1.1"),
            raw("B", "1-1.2"),
            raw("C", "1-1.3"),
            raw("D", ""),
            raw("E", "2-3.1"),
        ];

        for step in 0..40usize {
            // rotate one port out on odd steps
            let snapshot: Vec<_> = all
                .iter()
                .enumerate()
                .filter(|(i, _)| step % 2 == 0 || *i != step % all.len())
                .map(|(_, r)| r.clone())
                .collect();
            s.tick(resolve_ports(&snapshot), &no_stop());

            assert!(s.slots_match_pending());
            for (group, g) in s.ledger().admission.groups() {
                if let Some(cap) = s.ledger().admission.group_capacity(group) {
                    assert!(g.active_count() <= cap);
                }
            }
            assert!(s.stats().is_consistent());
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        assert!(s.stats().total_attempted > 0);
        assert_eq!(tool.max_concurrent_per_port(), 1);
    }

    // ------------------------------------------------------------------
    // Full controller
    // ------------------------------------------------------------------

    async fn wait_for_state(
        rx: &mut mpsc::UnboundedReceiver<SessionEvent>,
        state: SessionState,
        seen: &mut Vec<SessionEvent>,
    ) {
        while let Some(ev) = rx.recv().await {
            let done = ev == SessionEvent::SessionStateChanged(state);
            seen.push(ev);
            if done {
                return;
            }
        }
        panic!("event stream ended before {:?}", state);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_rejected_without_board() {
        let enumerator = ScriptedEnumerator::new(vec![raw("A", "")]);
        let tool = Arc::new(ScriptedTool::always_ok());
        let (handle, mut rx, task) = spawn_session(enumerator, tool, BoardDatabase::builtin());

        handle
            .start(SessionConfig {
                board: None,
                ..config()
            })
            .unwrap();
        match rx.recv().await {
            Some(SessionEvent::StartRejected(reason)) => assert!(reason.contains("board")),
            other => panic!("unexpected {:?}", other),
        }

        handle.shutdown().unwrap();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_rejected_when_tool_unreachable() {
        let enumerator = ScriptedEnumerator::new(vec![raw("A", "")]);
        let tool = Arc::new(ScriptedTool::always_ok().unreachable());
        let (handle, mut rx, task) =
            spawn_session(enumerator, tool.clone(), BoardDatabase::builtin());

        handle.start(config()).unwrap();
        assert!(matches!(rx.recv().await, Some(SessionEvent::StartRejected(_))));
        assert!(tool.calls().is_empty());

        handle.shutdown().unwrap();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_scenario_events() {
        let enumerator = ScriptedEnumerator::new(vec![raw("/dev/ttyUSB0", "")]);
        let tool = Arc::new(ScriptedTool::new(vec![
            Step::fail("avrdude: stk500_recv(): programmer is not responding"),
            Step::fail("avrdude: stk500_recv(): programmer is not responding"),
            Step::ok(),
        ]));
        let (handle, mut rx, task) =
            spawn_session(enumerator, tool.clone(), BoardDatabase::builtin());

        handle
            .start(SessionConfig {
                max_retries: 2,
                ..config()
            })
            .unwrap();

        let mut seen = Vec::new();
        while let Some(ev) = rx.recv().await {
            let done = matches!(ev, SessionEvent::JobCompleted(_));
            seen.push(ev);
            if done {
                break;
            }
        }
        handle.stop().unwrap();
        wait_for_state(&mut rx, SessionState::Idle, &mut seen).await;

        let retried = seen
            .iter()
            .filter(|e| matches!(e, SessionEvent::JobRetried { .. }))
            .count();
        let completed: Vec<_> = seen
            .iter()
            .filter_map(|e| match e {
                SessionEvent::JobCompleted(r) => Some(r),
                _ => None,
            })
            .collect();
        assert_eq!(tool.calls_for("/dev/ttyUSB0"), 3);
        assert_eq!(retried, 2);
        assert_eq!(completed.len(), 1);
        assert!(completed[0].success);

        handle.shutdown().unwrap();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_lets_in_flight_jobs_finish() {
        let enumerator = Arc::new(ScriptedEnumerator::new(vec![raw("A", ""), raw("B", "")]));
        let tool = Arc::new(ScriptedTool::always_ok().with_latency(Duration::from_secs(20)));
        let (handle, mut rx, task) =
            spawn_session(Arc::clone(&enumerator), tool.clone(), BoardDatabase::builtin());

        handle.start(config()).unwrap();
        let mut seen = Vec::new();
        wait_for_state(&mut rx, SessionState::Running, &mut seen).await;
        // let the first tick dispatch both ports
        tokio::time::sleep(Duration::from_secs(1)).await;
        handle.stop().unwrap();

        // a port plugged in after the stop must not be programmed
        enumerator.set(vec![raw("A", ""), raw("B", ""), raw("C", "")]);
        wait_for_state(&mut rx, SessionState::Idle, &mut seen).await;

        let results: Vec<_> = seen
            .iter()
            .filter_map(|e| match e {
                SessionEvent::JobCompleted(r) => Some(r.port.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(results.len(), 2);
        assert!(seen.contains(&SessionEvent::SessionStateChanged(SessionState::Stopping)));
        assert_eq!(tool.calls_for("C"), 0);

        let last_stats = seen
            .iter()
            .rev()
            .find_map(|e| match e {
                SessionEvent::StatsSnapshot(s) => Some(s.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(last_stats.total_attempted, 2);
        assert!(last_stats.is_consistent());

        handle.shutdown().unwrap();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_grace_abandons_stuck_jobs() {
        let enumerator = ScriptedEnumerator::new(vec![raw("A", "")]);
        let tool = Arc::new(ScriptedTool::always_ok().with_latency(Duration::from_secs(600)));
        let (handle, mut rx, task) =
            spawn_session(enumerator, tool.clone(), BoardDatabase::builtin());

        handle
            .start(SessionConfig {
                stop_grace_seconds: 5.0,
                ..config()
            })
            .unwrap();
        let mut seen = Vec::new();
        wait_for_state(&mut rx, SessionState::Running, &mut seen).await;
        tokio::time::sleep(Duration::from_secs(1)).await;

        let stopped_at = Instant::now();
        handle.stop().unwrap();
        wait_for_state(&mut rx, SessionState::Idle, &mut seen).await;

        assert!(stopped_at.elapsed() < Duration::from_secs(10));
        assert!(!seen.iter().any(|e| matches!(e, SessionEvent::JobCompleted(_))));

        handle.shutdown().unwrap();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_enumeration_glitch_skips_tick() {
        let enumerator = Arc::new(ScriptedEnumerator::new(vec![raw("A", "")]));
        enumerator.fail_scans(2);
        let tool = Arc::new(ScriptedTool::always_ok());
        let (handle, mut rx, task) =
            spawn_session(Arc::clone(&enumerator), tool.clone(), BoardDatabase::builtin());

        handle.start(config()).unwrap();
        let mut seen = Vec::new();
        while let Some(ev) = rx.recv().await {
            let done = matches!(ev, SessionEvent::JobCompleted(_));
            seen.push(ev);
            if done {
                break;
            }
        }
        assert_eq!(tool.calls_for("A"), 1);

        handle.shutdown().unwrap();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_restart_resets_stats() {
        let enumerator = ScriptedEnumerator::new(vec![raw("A", "")]);
        let tool = Arc::new(ScriptedTool::always_ok());
        let (handle, mut rx, task) =
            spawn_session(enumerator, tool.clone(), BoardDatabase::builtin());

        for _ in 0..2 {
            handle.start(config()).unwrap();
            let mut seen = Vec::new();
            while let Some(ev) = rx.recv().await {
                let done = matches!(ev, SessionEvent::JobCompleted(_));
                seen.push(ev);
                if done {
                    break;
                }
            }
            handle.stop().unwrap();
            wait_for_state(&mut rx, SessionState::Idle, &mut seen).await;

            let last = seen
                .iter()
                .rev()
                .find_map(|e| match e {
                    SessionEvent::StatsSnapshot(s) => Some(s.total_attempted),
                    _ => None,
                })
                .unwrap();
            assert_eq!(last, 1);
        }
        assert_eq!(tool.calls_for("A"), 2);

        handle.shutdown().unwrap();
        task.await.unwrap();
    }
}
