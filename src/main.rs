use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use std::{sync::Arc, thread, time::Duration};

use print_sentinel::config::{Config, constants};
use print_sentinel::guardian::{Guardian, PrintEvent};
use print_sentinel::printer::{LifecycleTracker, PrinterService, PrinterTelemetry};

/// Print Sentinel daemon.
///
/// Polls Moonraker for the print state and feeds print lifecycle events,
/// progress and layer updates into the guardian. A monitoring session
/// starts when a print starts (unless `AUTO_START=false`) and cancels the
/// print through Moonraker once enough consecutive FAIL verdicts arrive.
///
/// # Environment Variables
///
/// Required:
/// * `MOONRAKER_API_URL` - Moonraker API endpoint for telemetry and cancel
/// * `VISION_API_KEY` - Credential for every provider except Ollama
///
/// Optional (with defaults):
/// * `VISION_PROVIDER` - openai, azure_openai, anthropic, xai, gemini, ollama (default: "openai")
/// * `VISION_MODEL`, `VISION_ENDPOINT` - Provider defaults
/// * `SNAPSHOT_URL` - Webcam JPEG URL (default: "http://localhost:8080/?action=snapshot")
/// * `INTERVAL_SECONDS` - Seconds between cycles, at least 10 (default: "60")
/// * `FAIL_STRIKES` - Consecutive failures before cancelling (default: "3")
/// * `MIN_LAYER` - First layer checked (default: "2")
/// * `DATA_DIR` - History and snapshot storage (default: "./data")
///
/// # Usage
///
/// ```bash
/// export MOONRAKER_API_URL="http://printer.local:7125"
/// export SNAPSHOT_URL="http://printer.local/webcam/?action=snapshot"
/// export VISION_PROVIDER="anthropic"
/// export VISION_API_KEY="sk-ant-..."
/// ./print-sentinel
/// ```
fn main() -> Result<()> {
    // Initialize logger to output to stdout, using RUST_LOG env var or info level by default
    env_logger::Builder::from_default_env()
        .target(env_logger::Target::Stdout)
        .filter_level(
            std::env::var("RUST_LOG")
                .ok()
                .and_then(|level| level.parse().ok())
                .unwrap_or(log::LevelFilter::Info),
        )
        .init();

    let config = Config::from_env().context("Failed to load configuration")?;
    let moonraker_api_url = config
        .moonraker_api_url
        .clone()
        .context("MOONRAKER_API_URL must be set to run the daemon")?;

    info!("Print Sentinel starting...");
    info!("Using Moonraker API URL: {}", moonraker_api_url);
    info!(
        "Vision provider: {} ({})",
        config.provider.kind, config.provider.model
    );
    info!("Snapshot URL: {}", config.snapshot_url);

    if let Err(e) = config.validate() {
        warn!("{}. Sessions will not start until this is fixed.", e);
    }

    let printer = Arc::new(PrinterService::new(moonraker_api_url)?);
    let guardian = Guardian::from_config(config, Box::new(Arc::clone(&printer)))?;

    if guardian.config().validate().is_ok() {
        let (ok, message) = guardian.test_provider(None);
        if ok {
            info!("Provider check: {}", message);
        } else {
            warn!("Provider check failed: {}", message);
        }
    }

    info!("Print Sentinel initialized successfully. Polling printer state...");

    let mut tracker = LifecycleTracker::new();
    let mut last: Option<PrinterTelemetry> = None;

    loop {
        match printer.telemetry() {
            Ok(telemetry) => {
                forward_telemetry(&guardian, &mut tracker, last.as_ref(), &telemetry);
                last = Some(telemetry);
            }
            Err(e) => warn!("Failed to get printer status: {:#}", e),
        }
        thread::sleep(Duration::from_secs(constants::PRINTER_POLL_SECONDS));
    }
}

/// Turn one telemetry sample into guardian events.
fn forward_telemetry(
    guardian: &Guardian,
    tracker: &mut LifecycleTracker,
    last: Option<&PrinterTelemetry>,
    telemetry: &PrinterTelemetry,
) {
    if let Some(event) = tracker.observe(telemetry) {
        info!("Printer state changed to {:?}: {:?}", telemetry.state, event);
        dispatch(guardian, event);
    }

    if let Some(progress) = telemetry.progress {
        if last.and_then(|l| l.progress) != Some(progress) {
            dispatch(guardian, PrintEvent::Progress(progress));
        }
    }

    match telemetry.layer {
        Some(layer) => {
            if last.and_then(|l| l.layer) != Some(layer) {
                dispatch(
                    guardian,
                    PrintEvent::Layer {
                        layer,
                        total_layers: telemetry.total_layers,
                    },
                );
            }
        }
        // Slicers that do not emit layer info: fall back to Z height.
        None => {
            if let Some(z) = telemetry.z {
                if last.and_then(|l| l.z) != Some(z) {
                    dispatch(guardian, PrintEvent::ZChanged(z));
                }
            }
        }
    }
}

fn dispatch(guardian: &Guardian, event: PrintEvent) {
    debug!("Dispatching {:?}", event);
    if let Err(e) = guardian.handle_event(event) {
        error!("Failed to handle print event: {}", e);
    }
}
