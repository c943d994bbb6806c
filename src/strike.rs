//! Strike counting and the emergency-stop decision.
//!
//! A single ambiguous frame never aborts a print: only a run of
//! consecutive FAIL verdicts reaching the threshold does.

use serde::Serialize;

/// Lifecycle of the strike engine within one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StrikeState {
    Idle,
    Monitoring,
    /// Terminal for the session: the emergency stop has fired.
    Stopped,
}

/// What a single verdict did to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrikeOutcome {
    /// The engine was not monitoring; nothing changed.
    Ignored,
    /// OK verdict. Carries the count that was cleared.
    Reset { previous: u32 },
    /// FAIL verdict below the threshold.
    Strike { count: u32, threshold: u32 },
    /// FAIL verdict that reached the threshold. Fires once per session.
    EmergencyStop { count: u32 },
}

#[derive(Debug, Clone)]
pub struct StrikeEngine {
    state: StrikeState,
    consecutive_failures: u32,
    threshold: u32,
}

impl StrikeEngine {
    pub fn new(threshold: u32) -> Self {
        Self {
            state: StrikeState::Idle,
            consecutive_failures: 0,
            threshold: threshold.max(1),
        }
    }

    /// Begin a session. Valid from any state; clears the strike count.
    pub fn start(&mut self) {
        self.state = StrikeState::Monitoring;
        self.consecutive_failures = 0;
    }

    /// End the session cleanly (operator stop or print ended).
    ///
    /// A stopped engine stays stopped until the next `start`.
    pub fn end(&mut self) {
        if self.state == StrikeState::Monitoring {
            self.state = StrikeState::Idle;
        }
    }

    /// Feed one verdict.
    pub fn record(&mut self, failed: bool) -> StrikeOutcome {
        if self.state != StrikeState::Monitoring {
            return StrikeOutcome::Ignored;
        }

        if !failed {
            let previous = self.consecutive_failures;
            self.consecutive_failures = 0;
            return StrikeOutcome::Reset { previous };
        }

        self.consecutive_failures += 1;
        if self.consecutive_failures >= self.threshold {
            self.state = StrikeState::Stopped;
            StrikeOutcome::EmergencyStop {
                count: self.consecutive_failures,
            }
        } else {
            StrikeOutcome::Strike {
                count: self.consecutive_failures,
                threshold: self.threshold,
            }
        }
    }

    pub fn state(&self) -> StrikeState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn is_stopped(&self) -> bool {
        self.state == StrikeState::Stopped
    }
}
