mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use print_sentinel::config::{Config, MonitorSettings, ProviderConfig, StageBands, constants};
use print_sentinel::cost::{self, CostLedger, ESTIMATED_USAGE, Usage};
use print_sentinel::error::ConfigError;
use print_sentinel::guardian::{PrintEvent, estimate_layer};
use print_sentinel::history::{EntryContext, HistoryStore, SessionLog};
use print_sentinel::printer::{LifecycleTracker, PrintState, PrinterService, PrinterTelemetry, PrintController};
use print_sentinel::prompt::{PromptBuilder, Stage};
use print_sentinel::providers::{ProviderKind, Verdict, parse_verdict};
use print_sentinel::snapshot::{SnapshotArchive, SnapshotRef};
use print_sentinel::strike::{StrikeEngine, StrikeOutcome, StrikeState};
use serde_json::json;

fn verdict(failed: bool, cost_usd: f64) -> Verdict {
    Verdict {
        failed,
        reason: if failed { "spaghetti".into() } else { "ok".into() },
        confidence: None,
        provider: ProviderKind::OpenAi,
        model: "gpt-4o-mini".into(),
        latency_ms: 100,
        cost_usd,
        raw_snapshot_reference: None,
    }
}

fn config_from(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
    let map: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
    Config::from_lookup(|key| map.get(key).cloned())
}

#[test]
fn test_strike_engine_fires_once_at_threshold() {
    let mut engine = StrikeEngine::new(3);
    engine.start();
    assert_eq!(engine.state(), StrikeState::Monitoring);

    assert_eq!(engine.record(true), StrikeOutcome::Strike { count: 1, threshold: 3 });
    assert_eq!(engine.record(true), StrikeOutcome::Strike { count: 2, threshold: 3 });
    assert_eq!(engine.record(true), StrikeOutcome::EmergencyStop { count: 3 });
    assert!(engine.is_stopped());

    // Terminal until the next session.
    assert_eq!(engine.record(true), StrikeOutcome::Ignored);
    engine.end();
    assert_eq!(engine.state(), StrikeState::Stopped);
}

#[test]
fn test_strike_engine_ok_resets_counter() {
    let mut engine = StrikeEngine::new(3);
    engine.start();
    engine.record(true);
    engine.record(true);
    assert_eq!(engine.record(false), StrikeOutcome::Reset { previous: 2 });
    assert_eq!(engine.consecutive_failures(), 0);
    engine.record(true);
    engine.record(true);
    assert_eq!(engine.state(), StrikeState::Monitoring);
    assert_eq!(engine.consecutive_failures(), 2);
}

#[test]
fn test_strike_engine_ignores_verdicts_when_idle() {
    let mut engine = StrikeEngine::new(1);
    assert_eq!(engine.record(true), StrikeOutcome::Ignored);
    assert_eq!(engine.state(), StrikeState::Idle);

    engine.start();
    engine.end();
    assert_eq!(engine.state(), StrikeState::Idle);
    assert_eq!(engine.record(true), StrikeOutcome::Ignored);
}

#[test]
fn test_strike_engine_threshold_one_and_restart() {
    let mut engine = StrikeEngine::new(0);
    assert_eq!(engine.threshold(), 1);
    engine.start();
    assert_eq!(engine.record(true), StrikeOutcome::EmergencyStop { count: 1 });

    engine.start();
    assert_eq!(engine.state(), StrikeState::Monitoring);
    assert_eq!(engine.consecutive_failures(), 0);
}

#[test]
fn test_stage_classification() {
    let bands = StageBands::default();
    assert_eq!(Stage::classify(&bands, Some(3), 50.0), Stage::Early);
    assert_eq!(Stage::classify(&bands, Some(5), 2.0), Stage::Early);
    assert_eq!(Stage::classify(&bands, None, 4.0), Stage::Early);
    assert_eq!(Stage::classify(&bands, None, 40.0), Stage::Mid);
    assert_eq!(Stage::classify(&bands, Some(60), 80.0), Stage::Mid);
    assert_eq!(Stage::classify(&bands, Some(60), 85.0), Stage::Late);
}

#[test]
fn test_prompt_injects_stage_and_verdict_format() {
    let builder = PromptBuilder::new(StageBands::default());

    let early = builder.build(None, Some(3), Some(200), 2.0);
    assert!(early.contains("STAGE: Early print (layer 3/200, 2%)"));
    assert!(early.contains("VERDICT: FAIL | <brief reason>"));
    assert!(!early.contains("{stage}"));

    let mid = builder.build(None, Some(100), Some(200), 50.0);
    assert!(mid.contains("STAGE: Mid print"));

    let late = builder.build(None, None, None, 90.0);
    assert!(late.contains("STAGE: Late print (layer ?/?, 90%)"));
}

#[test]
fn test_prompt_mentions_debris_as_normal() {
    let prompt = PromptBuilder::default().build(None, Some(50), None, 40.0);
    assert!(prompt.contains("debris"));
    assert!(prompt.contains("NOT an active failure"));
}

#[test]
fn test_custom_prompt_is_used_verbatim() {
    let builder = PromptBuilder::default();
    let custom = "Is this print failing? VERDICT: OK or VERDICT: FAIL";
    assert_eq!(builder.build(Some(custom), Some(3), Some(10), 5.0), custom);
    // Blank overrides fall back to the built-in prompt.
    assert!(builder.build(Some("   "), Some(3), Some(10), 5.0).contains("STAGE:"));
}

#[test]
fn test_parse_verdict_ok_and_fail() {
    let ok = parse_verdict("VERDICT: OK").unwrap();
    assert!(!ok.failed);
    assert_eq!(ok.reason, "print looks normal");

    let fail = parse_verdict("Looking at the frame...\nverdict: fail | spaghetti at the nozzle\n").unwrap();
    assert!(fail.failed);
    assert_eq!(fail.reason, "spaghetti at the nozzle");
    assert_eq!(fail.confidence, None);

    let bare = parse_verdict("VERDICT: FAIL").unwrap();
    assert_eq!(bare.reason, "visual failure detected");
}

#[test]
fn test_parse_verdict_confidence_and_garbage() {
    let parsed = parse_verdict("VERDICT: FAIL - part detached\nConfidence: 90%").unwrap();
    assert_eq!(parsed.reason, "part detached");
    assert_eq!(parsed.confidence, Some(0.9));

    let parsed = parse_verdict("VERDICT: OK\nconfidence=0.75").unwrap();
    assert_eq!(parsed.confidence, Some(0.75));

    assert!(parse_verdict("The print looks great!").is_none());
    assert!(parse_verdict("VERDICT: maybe").is_none());
    assert!(parse_verdict("").is_none());
}

#[test]
fn test_parse_verdict_fail_outranks_echoed_format() {
    let parsed = parse_verdict("Answer VERDICT: OK or VERDICT: FAIL. VERDICT: FAIL | spaghetti at nozzle").unwrap();
    assert!(parsed.failed);
    assert_eq!(parsed.reason, "spaghetti at nozzle");

    let parsed = parse_verdict("VERDICT: FAIL | layer shift\nVERDICT: OK").unwrap();
    assert!(parsed.failed);
    assert_eq!(parsed.reason, "layer shift");

    let parsed = parse_verdict("verdict: ok\nverdict: ok | still fine").unwrap();
    assert!(!parsed.failed);
    assert_eq!(parsed.reason, "print looks normal");
}

#[test]
fn test_call_cost_uses_reported_usage_or_estimate() {
    let usage = Usage {
        input_tokens: 2_000_000,
        output_tokens: 1_000_000,
    };
    let cost = cost::call_cost(ProviderKind::OpenAi, "gpt-4o-mini-2024-07-18", Some(usage));
    assert!((cost - (0.30 + 0.60)).abs() < 1e-9);

    // Longest prefix wins over the shorter family name.
    let mini = cost::price_for(ProviderKind::OpenAi, "gpt-4o-mini");
    let full = cost::price_for(ProviderKind::OpenAi, "gpt-4o");
    assert!(mini.input_per_mtok < full.input_per_mtok);

    let estimated = cost::call_cost(ProviderKind::Anthropic, "claude-sonnet-4-20250514", None);
    assert!((estimated - cost::price_for(ProviderKind::Anthropic, "claude-sonnet-4").cost(ESTIMATED_USAGE)).abs() < 1e-12);
    assert!(estimated > 0.0);

    assert_eq!(cost::call_cost(ProviderKind::Ollama, "llava", Some(usage)), 0.0);
}

#[test]
fn test_cost_ledger_session_and_lifetime() {
    let mut ledger = CostLedger::new();
    ledger.record(0.01);
    ledger.record(0.02);
    ledger.record(-5.0);
    assert_eq!(ledger.session_calls(), 3);
    assert!((ledger.session_cost() - 0.03).abs() < 1e-12);

    ledger.reset_session();
    ledger.record(0.5);
    let summary = ledger.summary();
    assert_eq!(summary.session_calls, 1);
    assert!((summary.session_cost - 0.5).abs() < 1e-12);
    assert_eq!(summary.lifetime_calls, 4);
    assert!((summary.lifetime_cost - 0.53).abs() < 1e-12);
}

#[test]
fn test_history_retention_evicts_oldest() {
    let mut store = HistoryStore::new(3);
    let ids: Vec<u64> = (0..5).map(|i| store.append(verdict(i % 2 == 0, 0.01), EntryContext::default())).collect();

    assert_eq!(store.len(), 3);
    let listed = store.list(10, 0);
    assert_eq!(listed.iter().map(|e| e.id).collect::<Vec<_>>(), vec![ids[4], ids[3], ids[2]]);
    assert!(store.get(ids[0]).is_none());

    assert_eq!(store.list(1, 1)[0].id, ids[3]);
}

#[test]
fn test_history_false_positive_and_statistics() {
    let mut store = HistoryStore::new(10);
    store.append(verdict(false, 0.01), EntryContext::default());
    let fail_id = store.append(verdict(true, 0.02), EntryContext::default());
    store.append(verdict(false, 0.01), EntryContext::default());
    store.append(verdict(true, 0.02), EntryContext::default());

    assert!(store.mark_false_positive(fail_id));
    assert!(!store.mark_false_positive(999));
    assert!(store.get(fail_id).unwrap().false_positive);
    // Marking never rewrites the verdict itself.
    assert!(store.get(fail_id).unwrap().verdict.failed);

    let stats = store.statistics();
    assert_eq!(stats.total, 4);
    assert_eq!(stats.ok, 2);
    assert_eq!(stats.fail, 2);
    assert_eq!(stats.false_positive, 1);
    assert!((stats.print_score - 0.5).abs() < 1e-9);
    assert!((stats.fp_rate - 50.0).abs() < 1e-9);
    assert_eq!(stats.avg_latency_ms, 100);
    assert!((stats.total_cost - 0.06).abs() < 1e-9);

    store.clear();
    assert!(store.is_empty());
    assert_eq!(store.statistics().total, 0);
}

#[test]
fn test_history_persists_and_releases_snapshots() {
    let dir = tempfile::tempdir().unwrap();
    let archive = Arc::new(SnapshotArchive::open(dir.path().join("snapshots")).unwrap());
    let file = dir.path().join("verdict_history.json");

    let first_ref;
    {
        let mut store = HistoryStore::new(2).with_file(&file).with_archive(Arc::clone(&archive));
        let mut refs = Vec::new();
        for failed in [false, true, false] {
            let reference = archive.store(&common::jpeg()).unwrap();
            refs.push(reference.clone());
            let mut v = verdict(failed, 0.0);
            v.raw_snapshot_reference = Some(reference);
            store.append(v, EntryContext { cycle: 1, layer: Some(10), progress: 12.5 });
        }
        first_ref = refs[0].clone();
        assert!(archive.path(&refs[1]).is_some());
    }
    // Evicted entry took its snapshot with it.
    assert!(archive.path(&first_ref).is_none());

    let mut reloaded = HistoryStore::new(2).with_file(&file);
    assert_eq!(reloaded.len(), 2);
    let listed = reloaded.list(1, 0);
    let newest = &listed[0];
    assert_eq!(newest.context.layer, Some(10));
    // Ids continue after the loaded ones.
    let next = reloaded.append(verdict(false, 0.0), EntryContext::default());
    assert!(next > newest.id);
}

#[test]
fn test_history_reload_over_lowered_retention_releases_snapshots() {
    let dir = tempfile::tempdir().unwrap();
    let archive = Arc::new(SnapshotArchive::open(dir.path().join("snapshots")).unwrap());
    let file = dir.path().join("verdict_history.json");

    let mut refs = Vec::new();
    {
        let mut store = HistoryStore::new(5).with_archive(Arc::clone(&archive)).with_file(&file);
        for _ in 0..3 {
            let reference = archive.store(&common::jpeg()).unwrap();
            refs.push(reference.clone());
            let mut v = verdict(false, 0.0);
            v.raw_snapshot_reference = Some(reference);
            store.append(v, EntryContext::default());
        }
    }

    let reloaded = HistoryStore::new(1).with_archive(Arc::clone(&archive)).with_file(&file);
    assert_eq!(reloaded.len(), 1);
    assert!(archive.path(&refs[0]).is_none());
    assert!(archive.path(&refs[1]).is_none());
    assert!(archive.path(&refs[2]).is_some());

    // The trimmed history is what the file now holds.
    assert_eq!(HistoryStore::new(5).with_file(&file).len(), 1);
}

#[test]
fn test_snapshot_archive_rejects_path_traversal() {
    let dir = tempfile::tempdir().unwrap();
    let archive = SnapshotArchive::open(dir.path()).unwrap();
    let reference = archive.store(&common::jpeg()).unwrap();
    assert!(reference.as_str().starts_with("monitor_"));
    assert_eq!(archive.load(&reference).unwrap(), common::jpeg());

    assert!(archive.path(&SnapshotRef::new("../etc/passwd")).is_none());
    assert!(archive.path(&SnapshotRef::new("missing.jpg")).is_none());

    archive.remove(&reference);
    assert!(archive.path(&reference).is_none());
}

#[test]
fn test_session_log_summarizes_print() {
    let mut log = SessionLog::new();
    log.start(Some("benchy.gcode".into()));
    log.record(false, 0.01, 0);
    log.record(true, 0.01, 1);
    log.record(true, 0.01, 2);
    assert_eq!(log.current().unwrap().cycles, 3);

    let summary = log.end(true).unwrap();
    assert_eq!(summary.filename.as_deref(), Some("benchy.gcode"));
    assert_eq!(summary.fail_count, 2);
    assert_eq!(summary.max_consecutive_fails, 2);
    assert!(summary.emergency_stop);
    assert_eq!(summary.print_score, Some(33.3));
    assert!(log.end(false).is_none());
    assert_eq!(log.list(10).len(), 1);
}

#[test]
fn test_config_defaults_and_interval_clamp() {
    let config = config_from(&[("VISION_API_KEY", "sk-test"), ("INTERVAL_SECONDS", "3")]).unwrap();
    assert_eq!(config.provider.kind, ProviderKind::OpenAi);
    assert_eq!(config.provider.model, "gpt-4o-mini");
    assert_eq!(config.monitor.interval, Duration::from_secs(constants::MIN_INTERVAL_SECONDS));
    assert_eq!(config.monitor.strike_threshold, 3);
    assert_eq!(config.monitor.min_layer, 2);
    assert!(config.notifications.popup);
    assert!(config.validate().is_ok());
}

#[test]
fn test_config_rejects_bad_values() {
    assert!(matches!(
        config_from(&[("VISION_PROVIDER", "clippy")]),
        Err(ConfigError::InvalidValue { field, .. }) if field == "VISION_PROVIDER"
    ));
    assert!(config_from(&[("FAIL_STRIKES", "three")]).is_err());

    let config = config_from(&[("VISION_API_KEY", "k"), ("FAIL_STRIKES", "11")]).unwrap();
    assert!(matches!(config.validate(), Err(ConfigError::InvalidValue { field, .. }) if field == "FAIL_STRIKES"));
}

#[test]
fn test_config_requires_key_except_for_ollama() {
    let config = config_from(&[("VISION_PROVIDER", "anthropic")]).unwrap();
    assert_eq!(config.validate(), Err(ConfigError::missing("VISION_API_KEY")));

    let config = config_from(&[("VISION_PROVIDER", "ollama")]).unwrap();
    assert_eq!(config.provider.endpoint, "http://localhost:11434");
    assert!(config.validate().is_ok());

    let azure = ProviderConfig::for_kind(ProviderKind::AzureOpenAi, "key");
    assert_eq!(azure.validate(), Err(ConfigError::missing("VISION_ENDPOINT")));
    let azure = azure.with_endpoint("https://example.openai.azure.com");
    assert!(azure.validate().is_ok());
}

#[test]
fn test_monitor_settings_effective_interval() {
    let settings = MonitorSettings {
        interval: Duration::from_secs(1),
        ..MonitorSettings::default()
    };
    assert_eq!(settings.effective_interval(), Duration::from_secs(10));
    assert!(settings.validate().is_ok());
}

#[test]
fn test_estimate_layer_from_z() {
    assert_eq!(estimate_layer(0.2, 0.2), Some(1));
    assert_eq!(estimate_layer(2.0, 0.2), Some(10));
    assert_eq!(estimate_layer(0.0, 0.2), None);
    assert_eq!(estimate_layer(1.0, 0.0), None);
}

#[test]
fn test_printer_telemetry_from_status() {
    let status = json!({
        "result": { "status": {
            "print_stats": {
                "state": "printing",
                "filename": "benchy.gcode",
                "info": { "current_layer": 12, "total_layer": 240 }
            },
            "virtual_sdcard": { "progress": 0.25 },
            "gcode_move": { "gcode_position": [10.0, 20.0, 2.4, 100.0] }
        }}
    });
    let telemetry = PrinterTelemetry::from_status(&status);
    assert_eq!(telemetry.state, PrintState::Printing);
    assert_eq!(telemetry.filename.as_deref(), Some("benchy.gcode"));
    assert_eq!(telemetry.progress, Some(25.0));
    assert_eq!(telemetry.layer, Some(12));
    assert_eq!(telemetry.total_layers, Some(240));
    assert!((telemetry.z.unwrap() - 2.4).abs() < 1e-6);

    let empty = PrinterTelemetry::from_status(&json!({}));
    assert_eq!(empty.state, PrintState::Unknown);
    assert_eq!(empty.layer, None);
}

#[test]
fn test_lifecycle_tracker_emits_transitions() {
    let sample = |state| PrinterTelemetry {
        state,
        filename: Some("cube.gcode".into()),
        progress: None,
        layer: None,
        total_layers: None,
        z: None,
    };
    let mut tracker = LifecycleTracker::new();
    assert_eq!(tracker.observe(&sample(PrintState::Standby)), None);
    assert_eq!(
        tracker.observe(&sample(PrintState::Printing)),
        Some(PrintEvent::Started { filename: Some("cube.gcode".into()) })
    );
    assert_eq!(tracker.observe(&sample(PrintState::Printing)), None);
    assert_eq!(tracker.observe(&sample(PrintState::Paused)), None);
    assert_eq!(tracker.observe(&sample(PrintState::Complete)), Some(PrintEvent::Done));
    assert_eq!(tracker.observe(&sample(PrintState::Printing)), Some(PrintEvent::Started { filename: Some("cube.gcode".into()) }));
    assert_eq!(tracker.observe(&sample(PrintState::Error)), Some(PrintEvent::Failed));
}

#[test]
fn test_printer_service_cancel_and_status() {
    let server = common::MockServer::start(vec![
        common::Reply::json(200, json!({ "result": "ok" })),
        common::Reply::json(200, json!({ "result": { "status": { "print_stats": { "state": "complete" } } } })),
    ]);
    let printer = PrinterService::new(server.url.clone()).unwrap();
    assert_eq!(printer.api_url, server.url);

    printer.cancel_print().unwrap();
    assert_eq!(printer.telemetry().unwrap().state, PrintState::Complete);

    let requests = server.requests();
    assert_eq!(requests[0].method, "POST");
    assert_eq!(requests[0].path, "/printer/print/cancel");
    assert!(requests[1].path.starts_with("/printer/objects/query"));
}

#[test]
fn test_printer_service_unreachable() {
    let printer = PrinterService::new(common::unreachable_url()).unwrap();
    assert!(printer.cancel_print().is_err());
    assert!(printer.get_printer_status().is_err());
}
