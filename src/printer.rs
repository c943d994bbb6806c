use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::blocking::Client;
use serde_json::Value;

use crate::guardian::PrintEvent;

/// The single imperative the monitor may issue to the printer.
pub trait PrintController: Send + Sync {
    /// Cancel the running print job. Called only on emergency stop.
    fn cancel_print(&self) -> Result<()>;
}

impl<T: PrintController + ?Sized> PrintController for Arc<T> {
    fn cancel_print(&self) -> Result<()> {
        (**self).cancel_print()
    }
}

/// Klipper print state as reported by Moonraker's `print_stats`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrintState {
    Standby,
    Printing,
    Paused,
    Complete,
    Cancelled,
    Error,
    Unknown,
}

impl PrintState {
    pub fn parse(state: &str) -> Self {
        match state {
            "standby" => PrintState::Standby,
            "printing" => PrintState::Printing,
            "paused" => PrintState::Paused,
            "complete" => PrintState::Complete,
            "cancelled" => PrintState::Cancelled,
            "error" => PrintState::Error,
            _ => PrintState::Unknown,
        }
    }

    fn is_active(&self) -> bool {
        matches!(self, PrintState::Printing | PrintState::Paused)
    }
}

/// Printer telemetry extracted from one status query.
#[derive(Debug, Clone, PartialEq)]
pub struct PrinterTelemetry {
    pub state: PrintState,
    pub filename: Option<String>,
    /// Percent, 0–100.
    pub progress: Option<f32>,
    pub layer: Option<u32>,
    pub total_layers: Option<u32>,
    pub z: Option<f32>,
}

impl PrinterTelemetry {
    /// Extract telemetry from a `printer/objects/query` response.
    pub fn from_status(status: &Value) -> Self {
        let objects = &status["result"]["status"];
        let stats = &objects["print_stats"];
        let as_u32 = |v: &Value| v.as_u64().and_then(|n| u32::try_from(n).ok());

        Self {
            state: PrintState::parse(stats["state"].as_str().unwrap_or("unknown")),
            filename: stats["filename"]
                .as_str()
                .filter(|f| !f.is_empty())
                .map(str::to_string),
            progress: objects["virtual_sdcard"]["progress"]
                .as_f64()
                .map(|p| (p * 100.0).clamp(0.0, 100.0) as f32),
            layer: as_u32(&stats["info"]["current_layer"]),
            total_layers: as_u32(&stats["info"]["total_layer"]),
            z: objects["gcode_move"]["gcode_position"][2]
                .as_f64()
                .map(|z| z as f32),
        }
    }
}

/// Printer control service for interacting with the Moonraker API.
pub struct PrinterService {
    pub api_url: String,
    client: Client,
}

impl PrinterService {
    /// Create a new PrinterService with the provided Moonraker API URL.
    ///
    /// # Arguments
    ///
    /// * `api_url` - Base URL for the Moonraker API (e.g., "http://printer.local:7125")
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be initialised.
    pub fn new(api_url: String) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("building printer HTTP client")?;
        Ok(Self { api_url, client })
    }

    /// Get the current printer status.
    ///
    /// Queries `print_stats`, `virtual_sdcard` and `gcode_move`, which
    /// together carry the state, progress, layer and Z height.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The HTTP request fails
    /// - The Moonraker API returns an error status
    /// - JSON parsing fails
    pub fn get_printer_status(&self) -> Result<Value> {
        let response = self
            .client
            .get(format!(
                "{}/printer/objects/query?print_stats&virtual_sdcard&gcode_move",
                self.api_url.trim_end_matches('/')
            ))
            .send()?;

        if !response.status().is_success() {
            return Err(anyhow::anyhow!(
                "Failed to get printer status: HTTP {}",
                response.status()
            ));
        }

        let status: Value = response.json()?;
        Ok(status)
    }

    pub fn telemetry(&self) -> Result<PrinterTelemetry> {
        Ok(PrinterTelemetry::from_status(&self.get_printer_status()?))
    }
}

impl PrintController for PrinterService {
    /// Cancel the current print job.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The HTTP request fails
    /// - The Moonraker API returns an error status
    /// - There is no active print job to cancel
    fn cancel_print(&self) -> Result<()> {
        let response = self
            .client
            .post(format!(
                "{}/printer/print/cancel",
                self.api_url.trim_end_matches('/')
            ))
            .send()?;

        if !response.status().is_success() {
            return Err(anyhow::anyhow!(
                "Failed to cancel print: HTTP {}",
                response.status()
            ));
        }

        Ok(())
    }
}

/// Turns successive print states into print-lifecycle events.
#[derive(Debug, Default)]
pub struct LifecycleTracker {
    last: Option<PrintState>,
}

impl LifecycleTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the latest telemetry; returns the lifecycle event it implies.
    pub fn observe(&mut self, telemetry: &PrinterTelemetry) -> Option<PrintEvent> {
        let previous = self.last.replace(telemetry.state);
        let was_active = previous.is_some_and(|p| p.is_active());

        match telemetry.state {
            PrintState::Printing if !was_active => Some(PrintEvent::Started {
                filename: telemetry.filename.clone(),
            }),
            PrintState::Complete if was_active => Some(PrintEvent::Done),
            PrintState::Error if was_active => Some(PrintEvent::Failed),
            PrintState::Cancelled | PrintState::Standby if was_active => Some(PrintEvent::Cancelled),
            _ => None,
        }
    }
}
