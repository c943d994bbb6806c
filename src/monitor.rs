//! The monitoring loop.
//!
//! A [`Session`] owns one strike engine and one worker thread. The worker
//! runs a cycle, then waits the configured interval *after* the cycle's
//! effects before running the next, so cycles never overlap even when a
//! provider is slow. The strike engine's mutex doubles as the cycle gate:
//! whoever holds it is the single writer of the session's strike state,
//! and a manual check that cannot take it is rejected as busy.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, TryLockError};
use std::thread::{self, JoinHandle};

use log::{debug, error, info, warn};
use serde::Serialize;

use crate::alerts::{FailureNotice, Notifier};
use crate::config::{MonitorSettings, constants};
use crate::cost::CostLedger;
use crate::error::{CommandError, SentinelError};
use crate::history::{EntryContext, HistoryStore, SessionLog};
use crate::printer::PrintController;
use crate::prompt::PromptBuilder;
use crate::providers::{Verdict, VisionProvider};
use crate::snapshot::{SnapshotArchive, SnapshotRef, SnapshotSource};
use crate::strike::{StrikeEngine, StrikeOutcome, StrikeState};

/// Live state of a monitoring session, pushed to the UI after every cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MonitorState {
    pub active: bool,
    pub cycle_count: u64,
    pub consecutive_failures: u32,
    /// Set once the emergency stop has fired for this session.
    pub failure_detected: bool,
    pub failure_reason: Option<String>,
    /// The cancel command was accepted by the printer.
    pub emergency_stop_sent: bool,
    pub layer: Option<u32>,
    pub total_layers: Option<u32>,
    pub progress: f32,
    pub last_snapshot_reference: Option<SnapshotRef>,
    pub last_verdict: Option<Verdict>,
    /// Most recent errors, oldest first.
    pub errors: VecDeque<String>,
}

impl MonitorState {
    fn push_error(&mut self, message: String) {
        self.errors.push_back(message);
        while self.errors.len() > constants::MAX_STATE_ERRORS {
            self.errors.pop_front();
        }
    }
}

/// Where the print currently is, as reported by the host.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PrintPosition {
    pub layer: Option<u32>,
    pub total_layers: Option<u32>,
    pub progress: f32,
}

/// Message emitted on the UI channel.
#[derive(Debug, Clone, Serialize)]
pub struct StateUpdate {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub state: MonitorState,
}

impl StateUpdate {
    pub fn new(state: MonitorState) -> Self {
        Self {
            kind: "state_update",
            state,
        }
    }
}

/// Live UI push channel.
pub trait StateSink: Send + Sync {
    fn push(&self, update: &StateUpdate);
}

/// Forwards updates into an mpsc channel; a closed receiver is ignored.
pub struct ChannelSink(Sender<StateUpdate>);

impl ChannelSink {
    pub fn new(sender: Sender<StateUpdate>) -> Self {
        Self(sender)
    }
}

impl StateSink for ChannelSink {
    fn push(&self, update: &StateUpdate) {
        let _ = self.0.send(update.clone());
    }
}

/// Writes every update to the debug log as JSON.
pub struct LogSink;

impl StateSink for LogSink {
    fn push(&self, update: &StateUpdate) {
        match serde_json::to_string(update) {
            Ok(json) => debug!("{}", json),
            Err(e) => warn!("Could not serialize state update: {}", e),
        }
    }
}

/// Collaborators and stores shared by every session.
///
/// History, sessions and the cost ledger are the only state read from
/// outside the loop; their locks make each write visible as a whole.
pub struct Services {
    pub snapshots: Box<dyn SnapshotSource>,
    pub printer: Box<dyn PrintController>,
    pub notifier: Notifier,
    pub ui: Box<dyn StateSink>,
    pub archive: Option<Arc<SnapshotArchive>>,
    pub history: RwLock<HistoryStore>,
    pub sessions: Mutex<SessionLog>,
    pub ledger: RwLock<CostLedger>,
}

impl Services {
    /// Services with in-memory stores and no snapshot archive.
    pub fn new(
        snapshots: Box<dyn SnapshotSource>,
        printer: Box<dyn PrintController>,
        notifier: Notifier,
        ui: Box<dyn StateSink>,
    ) -> Self {
        Self {
            snapshots,
            printer,
            notifier,
            ui,
            archive: None,
            history: RwLock::new(HistoryStore::new(constants::DEFAULT_RETENTION)),
            sessions: Mutex::new(SessionLog::new()),
            ledger: RwLock::new(CostLedger::new()),
        }
    }

    pub fn with_archive(mut self, archive: Arc<SnapshotArchive>) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn with_history(mut self, history: HistoryStore) -> Self {
        self.history = RwLock::new(history);
        self
    }

    pub fn with_sessions(mut self, sessions: SessionLog) -> Self {
        self.sessions = Mutex::new(sessions);
        self
    }

    pub fn history(&self) -> RwLockReadGuard<'_, HistoryStore> {
        read(&self.history)
    }

    pub fn history_mut(&self) -> RwLockWriteGuard<'_, HistoryStore> {
        write(&self.history)
    }

    pub fn ledger(&self) -> RwLockReadGuard<'_, CostLedger> {
        read(&self.ledger)
    }

    pub fn ledger_mut(&self) -> RwLockWriteGuard<'_, CostLedger> {
        write(&self.ledger)
    }

    pub fn sessions(&self) -> MutexGuard<'_, SessionLog> {
        lock(&self.sessions)
    }
}

/// What a single cycle did.
#[derive(Debug)]
pub enum CycleOutcome {
    /// The known layer is below the configured minimum; nothing was called.
    Skipped { layer: u32, min_layer: u32 },
    /// The session was stopped before the cycle began.
    Inactive,
    /// Snapshot or provider failure. Recorded, strikes untouched.
    Errored(SentinelError),
    /// A verdict was produced and recorded.
    Judged {
        verdict: Verdict,
        entry_id: u64,
        strike: StrikeOutcome,
    },
}

impl CycleOutcome {
    /// True when this cycle fired the emergency stop.
    pub fn is_emergency_stop(&self) -> bool {
        matches!(
            self,
            CycleOutcome::Judged {
                strike: StrikeOutcome::EmergencyStop { .. },
                ..
            }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Scheduled,
    Manual,
}

/// State guarded by the cycle gate.
struct CycleGate {
    engine: StrikeEngine,
    /// Stored frame not (yet) owned by a history entry.
    orphan: Option<SnapshotRef>,
}

struct SessionCore {
    settings: MonitorSettings,
    snapshot_url: String,
    provider: Box<dyn VisionProvider>,
    prompts: PromptBuilder,
    services: Arc<Services>,
    gate: Mutex<CycleGate>,
    state: Mutex<MonitorState>,
    stop_requested: AtomicBool,
}

/// One monitoring session: created at print start, ended at print end.
pub struct Session {
    core: Arc<SessionCore>,
    stop_tx: Mutex<Option<Sender<()>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Create an idle session. Nothing runs until [`Session::start`].
    pub fn new(
        settings: MonitorSettings,
        snapshot_url: impl Into<String>,
        provider: Box<dyn VisionProvider>,
        services: Arc<Services>,
        position: PrintPosition,
    ) -> Self {
        let state = MonitorState {
            layer: position.layer,
            total_layers: position.total_layers,
            progress: position.progress,
            ..MonitorState::default()
        };
        let core = SessionCore {
            prompts: PromptBuilder::new(settings.stage_bands),
            gate: Mutex::new(CycleGate {
                engine: StrikeEngine::new(settings.strike_threshold),
                orphan: None,
            }),
            settings,
            snapshot_url: snapshot_url.into(),
            provider,
            services,
            state: Mutex::new(state),
            stop_requested: AtomicBool::new(false),
        };
        Self {
            core: Arc::new(core),
            stop_tx: Mutex::new(None),
            worker: Mutex::new(None),
        }
    }

    /// Enter monitoring and spawn the worker. The first cycle runs
    /// immediately, later ones after each interval.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyActive` if the session was already started.
    pub fn start(&self) -> Result<(), CommandError> {
        let mut worker = lock(&self.worker);
        if worker.is_some() {
            return Err(CommandError::AlreadyActive);
        }
        self.begin();

        let (stop_tx, stop_rx) = mpsc::channel();
        let core = Arc::clone(&self.core);
        *worker = Some(thread::spawn(move || run_worker(core, stop_rx)));
        *lock(&self.stop_tx) = Some(stop_tx);
        Ok(())
    }

    /// Enter monitoring without spawning the worker, for hosts that drive
    /// cycles from their own timer through [`Session::run_scheduled_cycle`].
    pub fn begin(&self) {
        self.core.stop_requested.store(false, Ordering::SeqCst);
        lock(&self.core.gate).engine.start();
        lock(&self.core.state).active = true;

        info!(
            "Monitor started: {}s interval, vision after layer {}, {} strikes, provider: {}/{}",
            self.core.settings.effective_interval().as_secs(),
            self.core.settings.min_layer,
            self.core.settings.strike_threshold,
            self.core.provider.kind(),
            self.core.provider.model(),
        );
    }

    /// Stop scheduling further cycles.
    ///
    /// A cycle already in flight is not interrupted; it completes and its
    /// result is recorded without counting a strike, after which the worker
    /// exits.
    pub fn stop(&self) -> MonitorState {
        self.core.stop_requested.store(true, Ordering::SeqCst);
        // Dropping the sender wakes the worker out of its interval wait.
        lock(&self.stop_tx).take();
        if lock(&self.worker).is_none() {
            lock(&self.core.gate).engine.end();
        }
        let state = {
            let mut state = lock(&self.core.state);
            state.active = false;
            state.clone()
        };
        self.core.publish();
        state
    }

    /// Run steps snapshot → prompt → provider → record once, outside the timer.
    ///
    /// # Errors
    ///
    /// Returns `Busy` if another check is in flight for this session.
    pub fn manual_check(&self) -> Result<CycleOutcome, CommandError> {
        let mut gate = match self.core.gate.try_lock() {
            Ok(gate) => gate,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return Err(CommandError::Busy),
        };
        Ok(self.core.run_cycle(&mut gate, Trigger::Manual))
    }

    /// Run one scheduled cycle on the caller's thread, waiting for any
    /// cycle in flight. The worker uses the same path.
    pub fn run_scheduled_cycle(&self) -> CycleOutcome {
        let mut gate = lock(&self.core.gate);
        self.core.run_cycle(&mut gate, Trigger::Scheduled)
    }

    pub fn state(&self) -> MonitorState {
        lock(&self.core.state).clone()
    }

    pub fn is_active(&self) -> bool {
        lock(&self.core.state).active
    }

    pub fn set_position(&self, position: PrintPosition) {
        let mut state = lock(&self.core.state);
        state.layer = position.layer;
        state.total_layers = position.total_layers;
        state.progress = position.progress;
    }

    /// Strike engine state; waits for a cycle in flight.
    pub fn strike_state(&self) -> StrikeState {
        lock(&self.core.gate).engine.state()
    }

    /// Wait for the worker thread to exit.
    pub fn join(&self) {
        if let Some(handle) = lock(&self.worker).take() {
            if handle.join().is_err() {
                error!("Monitor worker panicked");
            }
        }
    }

    /// True once the worker has exited (or was never started).
    pub fn is_finished(&self) -> bool {
        lock(&self.worker)
            .as_ref()
            .is_none_or(|handle| handle.is_finished())
    }
}

fn run_worker(core: Arc<SessionCore>, stop_rx: Receiver<()>) {
    loop {
        let outcome = {
            let mut gate = lock(&core.gate);
            if core.stop_requested.load(Ordering::SeqCst) || gate.engine.state() != StrikeState::Monitoring {
                break;
            }
            core.run_cycle(&mut gate, Trigger::Scheduled)
        };

        if outcome.is_emergency_stop() {
            break;
        }

        match stop_rx.recv_timeout(core.settings.effective_interval()) {
            Err(RecvTimeoutError::Timeout) => continue,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    lock(&core.gate).engine.end();
    let cycles = {
        let mut state = lock(&core.state);
        state.active = false;
        state.cycle_count
    };
    info!("Monitor stopped after {} cycles", cycles);
    core.publish();
}

impl SessionCore {
    fn run_cycle(&self, gate: &mut CycleGate, trigger: Trigger) -> CycleOutcome {
        let position = {
            let state = lock(&self.state);
            PrintPosition {
                layer: state.layer,
                total_layers: state.total_layers,
                progress: state.progress,
            }
        };

        if trigger == Trigger::Scheduled {
            if self.stop_requested.load(Ordering::SeqCst) || gate.engine.state() != StrikeState::Monitoring {
                return CycleOutcome::Inactive;
            }
            if let Some(layer) = position.layer.filter(|l| *l < self.settings.min_layer) {
                info!(
                    "Skipping vision check (layer {} < {})",
                    layer, self.settings.min_layer
                );
                self.publish();
                return CycleOutcome::Skipped {
                    layer,
                    min_layer: self.settings.min_layer,
                };
            }
        }

        let cycle = {
            let mut state = lock(&self.state);
            state.cycle_count += 1;
            state.cycle_count
        };

        let image = match self.services.snapshots.capture(&self.snapshot_url) {
            Ok(image) => image,
            Err(e) => return self.fail_cycle(format!("Cycle {}: snapshot failed: {}", cycle, e), e.into()),
        };

        let reference = self.archive_frame(gate, &image);
        info!(
            "Cycle {}: {} | {:.1}% | Layer {}/{}",
            cycle,
            reference.as_ref().map_or("unsaved", |r| r.as_str()),
            position.progress,
            position.layer.map_or_else(|| "?".to_string(), |l| l.to_string()),
            position.total_layers.map_or_else(|| "?".to_string(), |t| t.to_string()),
        );

        let prompt = self.prompts.build(
            self.settings.custom_prompt.as_deref(),
            position.layer,
            position.total_layers,
            position.progress,
        );

        let mut verdict = match self.provider.analyze(&image, &prompt) {
            Ok(verdict) => verdict,
            Err(e) => return self.fail_cycle(format!("Cycle {}: vision error: {}", cycle, e), e.into()),
        };
        verdict.raw_snapshot_reference = reference.clone();
        if !self.settings.cost_tracking {
            verdict.cost_usd = 0.0;
        }

        // A verdict that lands after a stop is recorded but never counts as a strike.
        let strike = if self.stop_requested.load(Ordering::SeqCst) {
            StrikeOutcome::Ignored
        } else {
            gate.engine.record(verdict.failed)
        };
        let consecutive_failures = gate.engine.consecutive_failures();

        let entry_id = self.services.history_mut().append(
            verdict.clone(),
            EntryContext {
                cycle,
                layer: position.layer,
                progress: position.progress,
            },
        );
        gate.orphan = None;
        self.services.ledger_mut().record(verdict.cost_usd);
        self.services
            .sessions()
            .record(verdict.failed, verdict.cost_usd, consecutive_failures);

        {
            let mut state = lock(&self.state);
            state.last_verdict = Some(verdict.clone());
            state.consecutive_failures = consecutive_failures;
        }

        match strike {
            StrikeOutcome::Strike { count, threshold } => warn!(
                "Cycle {}: STRIKE {}/{} - {} ({}ms)",
                cycle, count, threshold, verdict.reason, verdict.latency_ms
            ),
            StrikeOutcome::Reset { previous } => {
                if previous > 0 {
                    info!("Cycle {}: Vision OK, strike counter reset (was {})", cycle, previous);
                }
                info!(
                    "Cycle {}: Vision OK ({}ms) - {}",
                    cycle,
                    verdict.latency_ms,
                    verdict.reason.chars().take(80).collect::<String>()
                );
            }
            StrikeOutcome::EmergencyStop { count } => {
                self.emergency_stop(&verdict, &image, position, count, gate.engine.threshold());
            }
            StrikeOutcome::Ignored => info!(
                "Cycle {}: {} ({}ms) - {}",
                cycle,
                if verdict.failed { "Vision FAIL" } else { "Vision OK" },
                verdict.latency_ms,
                verdict.reason
            ),
        }

        self.publish();
        CycleOutcome::Judged {
            verdict,
            entry_id,
            strike,
        }
    }

    /// Store the frame, releasing the previous unrecorded one.
    fn archive_frame(&self, gate: &mut CycleGate, image: &[u8]) -> Option<SnapshotRef> {
        let archive = self.services.archive.as_ref()?;
        if let Some(orphan) = gate.orphan.take() {
            archive.remove(&orphan);
        }
        let reference = match archive.store(image) {
            Ok(reference) => reference,
            Err(e) => {
                warn!("Could not store snapshot: {:#}", e);
                return None;
            }
        };
        gate.orphan = Some(reference.clone());
        lock(&self.state).last_snapshot_reference = Some(reference.clone());
        Some(reference)
    }

    fn fail_cycle(&self, message: String, error: SentinelError) -> CycleOutcome {
        warn!("{}", message);
        lock(&self.state).push_error(message);
        self.publish();
        CycleOutcome::Errored(error)
    }

    fn emergency_stop(&self, verdict: &Verdict, image: &[u8], position: PrintPosition, count: u32, threshold: u32) {
        let reason = format!(
            "Vision: {} ({}/{} consecutive strikes)",
            verdict.reason, count, threshold
        );
        error!("FAILURE DETECTED: {}", reason);

        {
            let mut state = lock(&self.state);
            state.failure_detected = true;
            state.failure_reason = Some(reason.clone());
            state.active = false;
        }

        match self.services.printer.cancel_print() {
            Ok(()) => {
                error!("Emergency stop sent, print cancelled");
                lock(&self.state).emergency_stop_sent = true;
            }
            Err(e) => {
                error!("Failed to cancel print: {:#}", e);
                lock(&self.state).push_error(format!("Emergency stop failed: {}", e));
            }
        }

        let notice = FailureNotice {
            reason,
            confidence: verdict.confidence,
            snapshot_reference: verdict.raw_snapshot_reference.clone(),
            layer: position.layer,
            progress: position.progress,
        };
        let delivered = self.services.notifier.notify_failure(&notice, Some(image));
        debug!("Failure notice delivered to {} channel(s)", delivered);
    }

    fn publish(&self) {
        let state = lock(&self.state).clone();
        self.services.ui.push(&StateUpdate::new(state));
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
