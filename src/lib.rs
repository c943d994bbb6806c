//! Print Sentinel - AI-vision failure monitoring for 3D printers.
//!
//! While a print runs, a monitoring session periodically grabs a webcam
//! frame, asks a vision model whether the print is failing, counts
//! consecutive FAIL verdicts and cancels the print once they reach a
//! threshold. Every verdict is kept in a bounded history with its cost.
//!
//! # Core Components
//!
//! * [`config`] - Environment-driven settings
//! * [`snapshot`] - Webcam capture and the on-disk snapshot archive
//! * [`prompt`] - Stage-aware prompt construction
//! * [`providers`] - Vision backends and verdict parsing
//! * [`cost`] - Per-call pricing and the session/lifetime cost ledger
//! * [`strike`] - Consecutive-failure counting and the stop decision
//! * [`history`] - Verdict history and per-print session summaries
//! * [`alerts`] - Failure notification transports
//! * [`printer`] - Moonraker telemetry and the cancel command
//! * [`monitor`] - The monitoring session and its cycle
//! * [`guardian`] - Commands, queries and print lifecycle events
//! * [`error`] - Error types
//!
//! # Quick Start
//!
//! ```no_run
//! use print_sentinel::{Config, Guardian, PrintEvent, PrinterService};
//!
//! let config = Config::from_env()?;
//! let printer = PrinterService::new("http://printer.local:7125".to_string())?;
//! let guardian = Guardian::from_config(config, Box::new(printer))?;
//! guardian.handle_event(PrintEvent::Started { filename: Some("benchy.gcode".into()) })?;
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod alerts;
pub mod config;
pub mod cost;
pub mod error;
pub mod guardian;
pub mod history;
pub mod monitor;
pub mod printer;
pub mod prompt;
pub mod providers;
pub mod snapshot;
pub mod strike;

// Re-export commonly used types for convenience
pub use alerts::{FailureNotice, NotificationChannel, Notifier};
pub use config::{Config, MonitorSettings, ProviderConfig};
pub use cost::{CostLedger, CostSummary};
pub use error::{CommandError, ConfigError, ProviderError, ProviderErrorKind, SentinelError, SnapshotError};
pub use guardian::{Guardian, HistoryReport, PrintEvent};
pub use history::{HistoryEntry, HistoryStore, Statistics};
pub use monitor::{CycleOutcome, MonitorState, Services, Session, StateSink, StateUpdate};
pub use printer::{PrintController, PrinterService};
pub use providers::{ProviderKind, Verdict, VisionProvider, create_provider};
pub use snapshot::{SnapshotArchive, SnapshotFetcher, SnapshotRef, SnapshotSource};
pub use strike::{StrikeEngine, StrikeOutcome, StrikeState};
