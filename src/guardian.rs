//! Command and query surface over the monitor.
//!
//! [`Guardian`] is what a host talks to: it reacts to print lifecycle
//! events, accepts operator commands and answers history queries. It owns at
//! most one [`Session`] at a time.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use log::{info, warn};
use serde::Serialize;

use crate::alerts::Notifier;
use crate::config::{Config, ProviderConfig};
use crate::cost::CostSummary;
use crate::error::{CommandError, SentinelError};
use crate::history::{HistoryEntry, HistoryStore, SessionLog, SessionSummary, Statistics};
use crate::monitor::{CycleOutcome, LogSink, MonitorState, PrintPosition, Services, Session, StateSink, lock};
use crate::printer::PrintController;
use crate::providers::create_provider;
use crate::snapshot::{SnapshotArchive, SnapshotFetcher, SnapshotRef, SnapshotSource};

const HISTORY_FILE: &str = "verdict_history.json";
const SESSIONS_FILE: &str = "session_history.json";
const SNAPSHOT_DIR: &str = "snapshots";

/// Events the host reports about the running print.
#[derive(Debug, Clone, PartialEq)]
pub enum PrintEvent {
    Started { filename: Option<String> },
    Done,
    Failed,
    Cancelled,
    Progress(f32),
    Layer { layer: u32, total_layers: Option<u32> },
    /// Z height changed; the layer is estimated from the layer height.
    ZChanged(f32),
}

/// Everything the history view shows in one read.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryReport {
    pub history: Vec<HistoryEntry>,
    pub statistics: Statistics,
    pub cost: CostSummary,
    pub sessions: Vec<SessionSummary>,
}

pub struct Guardian {
    config: Config,
    services: Arc<Services>,
    session: Mutex<Option<Arc<Session>>>,
    position: Mutex<PrintPosition>,
}

impl Guardian {
    pub fn new(config: Config, services: Services) -> Self {
        Self {
            config,
            services: Arc::new(services),
            session: Mutex::new(None),
            position: Mutex::new(PrintPosition::default()),
        }
    }

    /// Build a guardian with HTTP snapshots, persisted history under
    /// `config.data_dir` and the transports enabled in the config.
    ///
    /// # Errors
    ///
    /// Returns an error if an HTTP client or the data directory cannot be set up.
    pub fn from_config(config: Config, printer: Box<dyn PrintController>) -> Result<Self> {
        Self::with_sink(config, printer, Box::new(LogSink))
    }

    /// Like [`Guardian::from_config`], pushing state updates to `ui`.
    pub fn with_sink(config: Config, printer: Box<dyn PrintController>, ui: Box<dyn StateSink>) -> Result<Self> {
        let snapshots: Box<dyn SnapshotSource> = Box::new(SnapshotFetcher::new()?);
        let notifier = Notifier::from_settings(&config.notifications)?;
        let archive = Arc::new(
            SnapshotArchive::open(config.data_dir.join(SNAPSHOT_DIR)).context("opening snapshot archive")?,
        );
        let history = HistoryStore::new(config.monitor.retention)
            .with_archive(Arc::clone(&archive))
            .with_file(config.data_dir.join(HISTORY_FILE));
        let sessions = SessionLog::new().with_file(config.data_dir.join(SESSIONS_FILE));

        let services = Services::new(snapshots, printer, notifier, ui)
            .with_archive(archive)
            .with_history(history)
            .with_sessions(sessions);
        Ok(Self::new(config, services))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    /// Start a monitoring session for the print `filename`.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` when the settings are incomplete, a
    /// `ProviderError` when the backend cannot be constructed, and
    /// `AlreadyActive` if a session is already monitoring.
    pub fn start_monitoring(&self, filename: Option<String>) -> Result<MonitorState, SentinelError> {
        self.config.validate()?;

        let mut current = lock(&self.session);
        if current.as_ref().is_some_and(|s| s.is_active()) {
            return Err(CommandError::AlreadyActive.into());
        }

        let provider = create_provider(&self.config.provider)?;
        // The previous worker may still be recording its last cycle.
        if let Some(previous) = current.take() {
            previous.join();
        }
        self.services.ledger_mut().reset_session();
        self.services.history_mut().set_retention(self.config.monitor.retention);
        self.services.sessions().start(filename.clone());

        let session = Arc::new(Session::new(
            self.config.monitor.clone(),
            self.config.snapshot_url.clone(),
            provider,
            Arc::clone(&self.services),
            *lock(&self.position),
        ));
        session.start()?;
        info!(
            "Monitoring started for {}",
            filename.as_deref().unwrap_or("unnamed print")
        );

        let state = session.state();
        *current = Some(session);
        Ok(state)
    }

    /// Stop the current session, if any, and close its summary.
    ///
    /// Blocks until a cycle in flight has been recorded.
    pub fn stop_monitoring(&self) -> MonitorState {
        self.end_session(false)
    }

    /// Run one check now, outside the timer.
    ///
    /// Without a monitoring session the verdict is still recorded, but no
    /// strike is counted.
    ///
    /// # Errors
    ///
    /// Returns `Busy` while another cycle is in flight, and a config or
    /// provider error if no idle session can be created.
    pub fn manual_check(&self) -> Result<CycleOutcome, SentinelError> {
        let session = {
            let mut current = lock(&self.session);
            match current.as_ref() {
                Some(session) => Arc::clone(session),
                None => {
                    self.config.validate()?;
                    let session = Arc::new(Session::new(
                        self.config.monitor.clone(),
                        self.config.snapshot_url.clone(),
                        create_provider(&self.config.provider)?,
                        Arc::clone(&self.services),
                        *lock(&self.position),
                    ));
                    *current = Some(Arc::clone(&session));
                    session
                }
            }
        };
        Ok(session.manual_check()?)
    }

    /// Probe a provider configuration without touching any session.
    ///
    /// Uses the guardian's own provider settings when `config` is `None`.
    pub fn test_provider(&self, config: Option<&ProviderConfig>) -> (bool, String) {
        let config = config.unwrap_or(&self.config.provider);
        if let Err(e) = config.validate() {
            return (false, e.to_string());
        }
        match create_provider(config) {
            Ok(provider) => provider.test_connection(),
            Err(e) => (false, e.to_string()),
        }
    }

    pub fn state(&self) -> MonitorState {
        lock(&self.session)
            .as_ref()
            .map(|s| s.state())
            .unwrap_or_default()
    }

    pub fn current_session(&self) -> Option<Arc<Session>> {
        lock(&self.session).clone()
    }

    pub fn clear_history(&self) {
        self.services.history_mut().clear();
        info!("Verdict history cleared");
    }

    pub fn mark_false_positive(&self, id: u64) -> bool {
        let marked = self.services.history_mut().mark_false_positive(id);
        if !marked {
            warn!("No history entry with id {}", id);
        }
        marked
    }

    /// Most recent `limit` entries with statistics, costs and past sessions.
    pub fn history(&self, limit: usize) -> HistoryReport {
        let (history, statistics) = {
            let store = self.services.history();
            (store.list(limit, 0), store.statistics())
        };
        HistoryReport {
            history,
            statistics,
            cost: self.services.ledger().summary(),
            sessions: self.services.sessions().list(limit),
        }
    }

    /// Stored frame for a history entry, for thumbnail serving.
    pub fn snapshot_path(&self, reference: &SnapshotRef) -> Option<PathBuf> {
        self.services.archive.as_ref()?.path(reference)
    }

    /// React to a print lifecycle event.
    ///
    /// # Errors
    ///
    /// Returns the start error when a print start cannot auto-start monitoring.
    pub fn handle_event(&self, event: PrintEvent) -> Result<(), SentinelError> {
        match event {
            PrintEvent::Started { filename } => {
                *lock(&self.position) = PrintPosition::default();
                if !self.config.auto_start {
                    return Ok(());
                }
                match self.start_monitoring(filename) {
                    Ok(_) => {}
                    Err(SentinelError::Command(CommandError::AlreadyActive)) => {
                        info!("Print started while already monitoring");
                    }
                    Err(e) => return Err(e),
                }
            }
            PrintEvent::Done | PrintEvent::Cancelled => {
                self.end_session(false);
            }
            PrintEvent::Failed => {
                self.end_session(true);
            }
            PrintEvent::Progress(progress) => self.update_position(|p| p.progress = progress.clamp(0.0, 100.0)),
            PrintEvent::Layer { layer, total_layers } => self.update_position(|p| {
                p.layer = Some(layer);
                if total_layers.is_some() {
                    p.total_layers = total_layers;
                }
            }),
            PrintEvent::ZChanged(z) => {
                if let Some(layer) = estimate_layer(z, self.config.monitor.layer_height) {
                    self.update_position(|p| p.layer = Some(layer));
                }
            }
        }
        Ok(())
    }

    fn update_position(&self, update: impl FnOnce(&mut PrintPosition)) {
        let position = {
            let mut position = lock(&self.position);
            update(&mut position);
            *position
        };
        if let Some(session) = lock(&self.session).as_ref() {
            session.set_position(position);
        }
    }

    fn end_session(&self, print_failed: bool) -> MonitorState {
        let Some(session) = lock(&self.session).clone() else {
            return MonitorState::default();
        };
        if session.is_active() {
            session.stop();
        }
        // Wait out a cycle in flight so its result lands in this session's summary.
        session.join();
        let state = session.state();
        let emergency = print_failed || state.emergency_stop_sent || state.failure_detected;
        if let Some(summary) = self.services.sessions().end(emergency) {
            info!(
                "Session {} ended: {} cycles, score {}",
                summary.id,
                summary.cycles,
                summary.print_score.map_or_else(|| "n/a".to_string(), |s| format!("{:.1}%", s)),
            );
        }
        state
    }
}

/// Estimate the 1-based layer number from the nozzle height.
pub fn estimate_layer(z: f32, layer_height: f32) -> Option<u32> {
    if !(z > 0.0) || !(layer_height > 0.0) {
        return None;
    }
    // Tolerance keeps exact multiples like 2.0 / 0.2 from flooring down a layer.
    Some((z / layer_height + 1e-3).floor().max(1.0) as u32)
}
