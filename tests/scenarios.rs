//! End-to-end detection scenarios driven through the full pipeline:
//! hand-built frozen baselines, a frame stream, and assertions on the
//! alerts that reach a sink.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use cansentry::alerting::{AlertManager, AlertSink};
use cansentry::baseline::{persist, Baseline, IdBaseline};
use cansentry::config::{Config, SinkKind};
use cansentry::source::MemorySource;
use cansentry::types::{Alert, AlertType, CanFrame, Severity};
use cansentry::{Pipeline, Result};

/// Captures everything that passes severity routing.
struct RecordingSink {
    emitted: Arc<Mutex<Vec<Alert>>>,
}

impl AlertSink for RecordingSink {
    fn kind(&self) -> SinkKind {
        SinkKind::Json
    }

    fn emit(&mut self, alert: &Alert) -> Result<()> {
        self.emitted.lock().unwrap().push(alert.clone());
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

fn frame(ts: f64, id: u32, payload: &[u8]) -> CanFrame {
    CanFrame::new(ts, id, payload).unwrap()
}

/// A trained profile with the given IAT statistics and DLC whitelist;
/// byte and entropy rules stay inert unless configured further.
fn profile(iat_mean: f64, iat_sigma: f64, dlcs: &[u8]) -> IdBaseline {
    let mut p = IdBaseline::untrained();
    p.iat_mean = iat_mean;
    p.iat_sigma = iat_sigma;
    p.iat_samples = 1000;
    p.learned_dlcs = BTreeSet::from_iter(dlcs.iter().copied());
    p.frame_count = 1000;
    p.learned_period = iat_mean;
    p.trained = true;
    p
}

fn config() -> Config {
    let mut config = Config::default();
    // One sink takes every severity so the recorder sees it all.
    for sev in ["low", "medium", "high", "critical"] {
        config
            .alerts
            .routing
            .insert(sev.into(), vec![SinkKind::Json]);
    }
    config.stats_interval_sec = 3600;
    config
}

fn run_detection(
    config: Config,
    baseline: Baseline,
    frames: Vec<CanFrame>,
) -> Vec<Alert> {
    let emitted = Arc::new(Mutex::new(Vec::new()));
    let mut alerts = AlertManager::new(config.throttle.clone(), config.alerts.clone());
    alerts.add_sink(Box::new(RecordingSink {
        emitted: emitted.clone(),
    }));
    let mut pipeline = Pipeline::detect(config, baseline, alerts).unwrap();
    let mut source = MemorySource::new(frames);
    pipeline.run(&mut source).unwrap();
    let result = emitted.lock().unwrap().clone();
    result
}

#[test]
fn scenario_unknown_id() {
    let baseline = Baseline::from_iter([
        (0x100, profile(0.01, 0.001, &[8])),
        (0x200, profile(0.02, 0.001, &[8])),
    ]);
    let alerts = run_detection(
        config(),
        baseline,
        vec![frame(1.0, 0x999, &[0x00; 8])],
    );
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].alert_type, AlertType::UnknownIdDetected);
    assert_eq!(alerts[0].severity, Severity::Medium);
    assert_eq!(alerts[0].can_id, 0x999);
    assert_eq!(alerts[0].to_wire()["can_id"], "0x999");
}

#[test]
fn scenario_fast_replay() {
    let baseline = Baseline::from_iter([(0x316, profile(0.01, 0.001, &[4]))]);
    let payload = [0x05, 0x20, 0xEA, 0x0A];
    let alerts = run_detection(
        config(),
        baseline,
        vec![
            frame(100.000, 0x316, &payload),
            frame(100.002, 0x316, &payload),
        ],
    );
    // 0.002 < 0.01 x 0.3 = 0.003.
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].alert_type, AlertType::NonPeriodicFastReplay);
    assert_eq!(alerts[0].severity, Severity::Low);
    assert_eq!(alerts[0].timestamp, 100.002);
}

#[test]
fn scenario_dlc_whitelist() {
    let baseline = Baseline::from_iter([(0x316, profile(0.01, 0.001, &[8]))]);
    let alerts = run_detection(
        config(),
        baseline,
        vec![frame(0.3, 0x316, &[0x05, 0x20, 0xEA, 0x0A])],
    );
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].alert_type, AlertType::TamperDlcAnomaly);
    assert_eq!(alerts[0].severity, Severity::High);
}

#[test]
fn scenario_entropy_anomaly() {
    let mut p = profile(0.01, 0.001, &[8]);
    p.entropy_mean = 2.79;
    p.entropy_sigma = 0.18;
    p.entropy_samples = 500;
    let baseline = Baseline::from_iter([(0x316, p)]);
    // Four value-pairs: entropy exactly 2.0 bits.
    // |2.0 - 2.79| = 0.79 > 3.0 x 0.18 = 0.54.
    let alerts = run_detection(
        config(),
        baseline,
        vec![frame(1.0, 0x316, &[1, 1, 2, 2, 3, 3, 4, 4])],
    );
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].alert_type, AlertType::EntropyAnomaly);
    assert_eq!(alerts[0].severity, Severity::Medium);
}

#[test]
fn scenario_static_byte_mismatch() {
    use cansentry::baseline::ByteBehavior;
    let mut p = profile(0.01, 0.001, &[8]);
    p.byte_behavior[0] = ByteBehavior::Static { value: 0x00 };
    let baseline = Baseline::from_iter([(0x153, p)]);
    let alerts = run_detection(
        config(),
        baseline,
        vec![frame(1.0, 0x153, &[0xFF, 0, 0, 0, 0, 0, 0, 0])],
    );
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].alert_type, AlertType::StaticByteMismatch);
    assert_eq!(alerts[0].severity, Severity::High);
    assert_eq!(alerts[0].context["positions"], serde_json::json!([0]));
}

#[test]
fn scenario_missing_frame() {
    let baseline = Baseline::from_iter([(0x100, profile(0.01, 0.001, &[8]))]);
    let payload = [0u8; 8];
    let alerts = run_detection(
        config(),
        baseline,
        vec![frame(1.0, 0x100, &payload), frame(1.05, 0x100, &payload)],
    );
    // Both the max-factor rule (0.05 > 0.025) and the sigma rule
    // (0.05 > 0.0135) fire; the highest-severity sigma rule wins.
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].alert_type, AlertType::MissingFrameSigma);
    assert_eq!(alerts[0].severity, Severity::High);
}

#[test]
fn throttle_upper_bound_per_second() {
    // A flood of unknown-ID frames for one ID: emissions for the
    // (can_id, alert_type) pair never exceed the per-second cap.
    let mut config = config();
    config.throttle.cooldown_ms = 0;
    config.throttle.max_alerts_per_id_per_sec = 3;
    config.throttle.global_max_alerts_per_sec = 1000;

    let baseline = Baseline::from_iter([(0x100, profile(0.01, 0.001, &[8]))]);
    let frames: Vec<CanFrame> = (0..200)
        .map(|i| frame(5.0 + i as f64 * 0.01, 0x999, &[0x01]))
        .collect();
    let alerts = run_detection(config, baseline, frames);

    assert!(!alerts.is_empty());
    for window_start in 0..10 {
        let lo = 5.0 + window_start as f64;
        let count = alerts
            .iter()
            .filter(|a| {
                a.alert_type == AlertType::UnknownIdDetected
                    && a.timestamp >= lo
                    && a.timestamp < lo + 1.0
            })
            .count();
        assert!(count <= 3, "{count} alerts in second starting {lo}");
    }
}

#[test]
fn alert_stream_is_monotonic() {
    let baseline = Baseline::from_iter([(0x100, profile(0.01, 0.001, &[8]))]);
    let mut frames = Vec::new();
    for i in 0..50 {
        // Alternate unknown IDs and gapped known traffic.
        frames.push(frame(10.0 + i as f64, 0x999, &[0x01]));
        frames.push(frame(10.5 + i as f64, 0x100, &[0u8; 8]));
    }
    let alerts = run_detection(config(), baseline, frames);
    assert!(!alerts.is_empty());
    for pair in alerts.windows(2) {
        assert!(pair[0].timestamp <= pair[1].timestamp);
    }
}

#[test]
fn baseline_round_trip_through_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("baseline.json");

    let mut p = profile(0.01, 0.001, &[2, 8]);
    p.entropy_mean = 2.79;
    p.entropy_sigma = 0.18;
    p.entropy_samples = 500;
    let original = Baseline::from_iter([(0x316, p), (0x100, profile(0.02, 0.002, &[8]))]);

    persist::save(&original, &path).unwrap();
    let loaded = persist::load(&path).unwrap();
    assert_eq!(loaded, original);
}

#[test]
fn learn_then_detect_full_cycle() {
    // Learn a 100 Hz ID, then hit it with a gap and an unknown ID.
    let mut config = config();
    config.learning.initial_learning_window_sec = 5;
    config.learning.min_samples_for_stable_baseline = 50;

    let emitted = Arc::new(Mutex::new(Vec::new()));
    let mut alerts = AlertManager::new(config.throttle.clone(), config.alerts.clone());
    alerts.add_sink(Box::new(RecordingSink {
        emitted: emitted.clone(),
    }));
    let mut pipeline = Pipeline::learn(config, alerts).unwrap();

    let mut frames: Vec<CanFrame> = (0..520)
        .map(|i| frame(i as f64 * 0.01, 0x100, &[0xAB, 0xCD]))
        .collect();
    // Gap: the next 0x100 frame arrives 0.5s after the last.
    frames.push(frame(5.7, 0x100, &[0xAB, 0xCD]));
    frames.push(frame(5.8, 0x999, &[0xEE; 8]));

    let mut source = MemorySource::new(frames);
    pipeline.run(&mut source).unwrap();
    assert!(pipeline.baseline_ready());

    let alerts = emitted.lock().unwrap();
    // The 0.5s gap is ~50 missed 100 Hz frames: the missing-frame
    // estimate escalates past the sigma rule to critical.
    assert!(alerts.iter().any(|a| {
        a.alert_type == AlertType::ConsecutiveMissing
            && a.can_id == 0x100
            && a.severity == Severity::Critical
    }));
    assert!(alerts
        .iter()
        .any(|a| a.alert_type == AlertType::UnknownIdDetected && a.can_id == 0x999));
    // Nothing was emitted before the freeze at t=5.0.
    assert!(alerts.iter().all(|a| a.timestamp >= 5.0));
}
