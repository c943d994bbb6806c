//! Bounded verdict history and per-print session summaries.
//!
//! Both stores keep everything in memory and, when given a file, rewrite it
//! as JSON after each mutation. Persistence failures are logged rather than
//! propagated: losing history must never interrupt monitoring.

use std::collections::VecDeque;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::constants;
use crate::providers::Verdict;
use crate::snapshot::SnapshotArchive;

/// Where in the print a verdict was taken.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EntryContext {
    pub cycle: u64,
    pub layer: Option<u32>,
    pub progress: f32,
}

/// One recorded verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Monotonic, never reused within a store.
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub context: EntryContext,
    pub verdict: Verdict,
    /// Operator-confirmed wrong FAIL. Does not rewrite strike history.
    #[serde(default)]
    pub false_positive: bool,
}

/// Aggregates recomputed from the entries on every read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Statistics {
    pub total: usize,
    pub ok: usize,
    pub fail: usize,
    pub false_positive: usize,
    /// `ok / total`, 0 when empty.
    pub print_score: f64,
    /// False positives as a percentage of fails.
    pub fp_rate: f64,
    pub avg_latency_ms: u64,
    pub total_cost: f64,
}

/// Append-only verdict ledger with FIFO eviction.
pub struct HistoryStore {
    entries: VecDeque<HistoryEntry>,
    next_id: u64,
    retention: usize,
    file: Option<PathBuf>,
    archive: Option<Arc<SnapshotArchive>>,
}

impl HistoryStore {
    /// In-memory store keeping at most `retention` entries.
    pub fn new(retention: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            next_id: 1,
            retention: retention.max(1),
            file: None,
            archive: None,
        }
    }

    /// Persist entries to `file`, loading whatever it already holds.
    ///
    /// An unreadable file is logged and replaced on the next write. Loaded
    /// entries over the retention cap are evicted, so attach the archive
    /// first for their snapshots to be released.
    pub fn with_file(mut self, file: impl Into<PathBuf>) -> Self {
        let file = file.into();
        if let Some(entries) = load_json::<Vec<HistoryEntry>>(&file) {
            self.next_id = entries.iter().map(|e| e.id).max().unwrap_or(0) + 1;
            self.entries = entries.into();
            debug!("Loaded {} history entries from {}", self.entries.len(), file.display());
        }
        self.file = Some(file);
        if self.evict() > 0 {
            self.save();
        }
        self
    }

    /// Release snapshot artifacts through `archive` when entries go away.
    pub fn with_archive(mut self, archive: Arc<SnapshotArchive>) -> Self {
        self.archive = Some(archive);
        if self.evict() > 0 {
            self.save();
        }
        self
    }

    pub fn retention(&self) -> usize {
        self.retention
    }

    pub fn set_retention(&mut self, retention: usize) {
        self.retention = retention.max(1);
        if self.evict() > 0 {
            self.save();
        }
    }

    /// Record a verdict and return its id. Evicts the oldest entries, with
    /// their snapshots, once the store exceeds its retention cap.
    pub fn append(&mut self, verdict: Verdict, context: EntryContext) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.push_back(HistoryEntry {
            id,
            timestamp: Utc::now(),
            context,
            verdict,
            false_positive: false,
        });
        self.evict();
        self.save();
        id
    }

    /// Flag an entry as a false positive. Returns false for unknown ids.
    pub fn mark_false_positive(&mut self, id: u64) -> bool {
        match self.entries.iter_mut().find(|e| e.id == id) {
            Some(entry) => {
                entry.false_positive = true;
                self.save();
                true
            }
            None => false,
        }
    }

    /// Entries most-recent-first, skipping `offset` and returning at most `limit`.
    pub fn list(&self, limit: usize, offset: usize) -> Vec<HistoryEntry> {
        self.entries
            .iter()
            .rev()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn get(&self, id: u64) -> Option<&HistoryEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn statistics(&self) -> Statistics {
        let total = self.entries.len();
        if total == 0 {
            return Statistics::default();
        }

        let fail = self.entries.iter().filter(|e| e.verdict.failed).count();
        let ok = total - fail;
        let false_positive = self.entries.iter().filter(|e| e.false_positive).count();
        let total_latency: u64 = self.entries.iter().map(|e| e.verdict.latency_ms).sum();
        let total_cost: f64 = self.entries.iter().map(|e| e.verdict.cost_usd).sum();

        Statistics {
            total,
            ok,
            fail,
            false_positive,
            print_score: ok as f64 / total as f64,
            fp_rate: false_positive as f64 / fail.max(1) as f64 * 100.0,
            avg_latency_ms: total_latency / total as u64,
            total_cost,
        }
    }

    /// Drop every entry and release their snapshot artifacts.
    pub fn clear(&mut self) {
        if let Some(archive) = &self.archive {
            for entry in &self.entries {
                if let Some(reference) = &entry.verdict.raw_snapshot_reference {
                    archive.remove(reference);
                }
            }
        }
        self.entries.clear();
        self.save();
    }

    fn evict(&mut self) -> usize {
        let mut evicted = 0;
        while self.entries.len() > self.retention {
            if let Some(old) = self.entries.pop_front() {
                if let (Some(archive), Some(reference)) =
                    (&self.archive, &old.verdict.raw_snapshot_reference)
                {
                    archive.remove(reference);
                }
                evicted += 1;
            }
        }
        if evicted > 0 {
            debug!("Evicted {} history entries (retention {})", evicted, self.retention);
        }
        evicted
    }

    fn save(&self) {
        if let Some(file) = &self.file {
            if let Err(e) = save_json(file, &self.entries) {
                warn!("Could not save verdict history: {:#}", e);
            }
        }
    }
}

/// Summary of one monitored print.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: u64,
    pub filename: Option<String>,
    pub started: DateTime<Utc>,
    pub ended: Option<DateTime<Utc>>,
    pub cycles: u64,
    pub ok_count: u64,
    pub fail_count: u64,
    pub max_consecutive_fails: u32,
    pub emergency_stop: bool,
    pub total_cost: f64,
    /// Percentage of OK verdicts, set when the session ends.
    pub print_score: Option<f64>,
}

/// Rolling log of per-print summaries.
pub struct SessionLog {
    sessions: VecDeque<SessionSummary>,
    current: Option<SessionSummary>,
    next_id: u64,
    file: Option<PathBuf>,
}

impl Default for SessionLog {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionLog {
    pub fn new() -> Self {
        Self {
            sessions: VecDeque::new(),
            current: None,
            next_id: 1,
            file: None,
        }
    }

    pub fn with_file(mut self, file: impl Into<PathBuf>) -> Self {
        let file = file.into();
        if let Some(sessions) = load_json::<Vec<SessionSummary>>(&file) {
            self.next_id = sessions.iter().map(|s| s.id).max().unwrap_or(0) + 1;
            self.sessions = sessions.into();
        }
        self.file = Some(file);
        self
    }

    /// Open a new summary, closing any one left open.
    pub fn start(&mut self, filename: Option<String>) {
        if self.current.is_some() {
            self.end(false);
        }
        let id = self.next_id;
        self.next_id += 1;
        self.current = Some(SessionSummary {
            id,
            filename,
            started: Utc::now(),
            ended: None,
            cycles: 0,
            ok_count: 0,
            fail_count: 0,
            max_consecutive_fails: 0,
            emergency_stop: false,
            total_cost: 0.0,
            print_score: None,
        });
    }

    pub fn record(&mut self, failed: bool, cost_usd: f64, consecutive_failures: u32) {
        let Some(current) = self.current.as_mut() else {
            return;
        };
        current.cycles += 1;
        current.total_cost += cost_usd;
        if failed {
            current.fail_count += 1;
        } else {
            current.ok_count += 1;
        }
        current.max_consecutive_fails = current.max_consecutive_fails.max(consecutive_failures);
    }

    /// Close the open summary and return it.
    pub fn end(&mut self, emergency_stop: bool) -> Option<SessionSummary> {
        let mut session = self.current.take()?;
        session.ended = Some(Utc::now());
        session.emergency_stop = emergency_stop;
        if session.cycles > 0 {
            let score = session.ok_count as f64 / session.cycles as f64 * 100.0;
            session.print_score = Some((score * 10.0).round() / 10.0);
        }

        self.sessions.push_back(session.clone());
        while self.sessions.len() > constants::MAX_SESSIONS {
            self.sessions.pop_front();
        }
        if let Some(file) = &self.file {
            if let Err(e) = save_json(file, &self.sessions) {
                warn!("Could not save session history: {:#}", e);
            }
        }
        Some(session)
    }

    pub fn current(&self) -> Option<&SessionSummary> {
        self.current.as_ref()
    }

    /// Closed sessions, most-recent-first.
    pub fn list(&self, limit: usize) -> Vec<SessionSummary> {
        self.sessions.iter().rev().take(limit).cloned().collect()
    }
}

fn load_json<T: DeserializeOwned>(file: &PathBuf) -> Option<T> {
    if !file.exists() {
        return None;
    }
    let loaded = fs::read_to_string(file)
        .with_context(|| format!("reading {}", file.display()))
        .and_then(|text| {
            serde_json::from_str(&text).with_context(|| format!("parsing {}", file.display()))
        });
    match loaded {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("Could not load history: {:#}", e);
            None
        }
    }
}

fn save_json<T: Serialize>(file: &PathBuf, value: &T) -> Result<()> {
    if let Some(parent) = file.parent() {
        fs::create_dir_all(parent)?;
    }
    let text = serde_json::to_string_pretty(value)?;
    let staging = file.with_extension("json.tmp");
    fs::write(&staging, text).with_context(|| format!("writing {}", staging.display()))?;
    fs::rename(&staging, file).with_context(|| format!("replacing {}", file.display()))?;
    Ok(())
}
