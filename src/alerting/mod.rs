//! Alert management: cooldown, throttling, severity routing.
//!
//! Detectors hand every alert to the manager; policy lives here, not
//! in the detectors. Suppression order is cooldown, then the
//! per-ID-per-type bucket, then the global bucket. Buckets are
//! second-aligned on stream time, and only alerts that actually reach
//! a sink count against them.

pub mod sinks;

use std::collections::HashMap;

use tracing::warn;

use crate::config::{AlertOutputSettings, SinkKind, ThrottleSettings};
use crate::types::{Alert, AlertType};
pub use sinks::{AlertSink, ConsoleSink, JsonLogSink, TextLogSink};

/// Counters reported with the periodic stats record.
#[derive(Debug, Clone, Default)]
pub struct AlertStats {
    pub received: u64,
    pub emitted: u64,
    pub suppressed_cooldown: u64,
    pub throttled_per_id: u64,
    pub throttled_global: u64,
    pub sink_errors: u64,
    pub by_severity: [u64; 4],
}

impl AlertStats {
    pub fn dropped(&self) -> u64 {
        self.suppressed_cooldown + self.throttled_per_id + self.throttled_global
    }
}

/// Second-aligned counting bucket.
#[derive(Debug, Clone, Copy)]
struct Bucket {
    second: i64,
    count: u32,
}

pub struct AlertManager {
    throttle: ThrottleSettings,
    output: AlertOutputSettings,
    sinks: Vec<Box<dyn AlertSink>>,
    /// Last emission time per (can_id, alert_type), for cooldown.
    last_emitted: HashMap<(u32, AlertType), f64>,
    id_buckets: HashMap<(u32, AlertType), Bucket>,
    global_bucket: Bucket,
    stats: AlertStats,
}

impl AlertManager {
    pub fn new(throttle: ThrottleSettings, output: AlertOutputSettings) -> Self {
        Self {
            throttle,
            output,
            sinks: Vec::new(),
            last_emitted: HashMap::new(),
            id_buckets: HashMap::new(),
            global_bucket: Bucket {
                second: i64::MIN,
                count: 0,
            },
            stats: AlertStats::default(),
        }
    }

    /// Build the manager with the standard sinks per configuration.
    pub fn with_standard_sinks(
        throttle: ThrottleSettings,
        output: AlertOutputSettings,
    ) -> std::io::Result<Self> {
        let mut manager = Self::new(throttle.clone(), output.clone());
        std::fs::create_dir_all(&output.output_dir)?;
        if output.console_enabled {
            manager.add_sink(Box::new(ConsoleSink::new()));
        }
        if output.text_log_enabled {
            manager.add_sink(Box::new(TextLogSink::new(&output.output_dir)));
        }
        if output.json_log_enabled {
            manager.add_sink(Box::new(JsonLogSink::new(&output.output_dir)));
        }
        Ok(manager)
    }

    pub fn add_sink(&mut self, sink: Box<dyn AlertSink>) {
        self.sinks.push(sink);
    }

    /// Apply policy to one alert: suppress, throttle, or route.
    ///
    /// Returns true when the alert reached at least the routing stage
    /// (i.e. was not suppressed).
    pub fn process(&mut self, alert: Alert) -> bool {
        self.stats.received += 1;
        let key = (alert.can_id, alert.alert_type);
        let second = alert.timestamp.floor() as i64;

        // 1. Cooldown on (can_id, alert_type).
        if let Some(&last) = self.last_emitted.get(&key) {
            if (alert.timestamp - last) * 1000.0 < self.throttle.cooldown_ms as f64 {
                self.stats.suppressed_cooldown += 1;
                return false;
            }
        }

        // 2. Per-ID-per-type-per-second bucket.
        let id_count = match self.id_buckets.get(&key) {
            Some(bucket) if bucket.second == second => bucket.count,
            _ => 0,
        };
        if id_count >= self.throttle.max_alerts_per_id_per_sec {
            self.stats.throttled_per_id += 1;
            return false;
        }

        // 3. Global per-second bucket.
        let global_count = if self.global_bucket.second == second {
            self.global_bucket.count
        } else {
            0
        };
        if global_count >= self.throttle.global_max_alerts_per_sec {
            self.stats.throttled_global += 1;
            return false;
        }

        // Emission: charge the buckets, stamp the cooldown, route.
        self.id_buckets.insert(
            key,
            Bucket {
                second,
                count: id_count + 1,
            },
        );
        self.global_bucket = Bucket {
            second,
            count: global_count + 1,
        };
        self.last_emitted.insert(key, alert.timestamp);

        self.stats.emitted += 1;
        self.stats.by_severity[alert.severity as usize] += 1;

        let targets = self.output.sinks_for(alert.severity);
        for sink in &mut self.sinks {
            if !targets.contains(&sink.kind()) {
                continue;
            }
            if let Err(e) = sink.emit(&alert) {
                self.stats.sink_errors += 1;
                warn!(sink = ?sink.kind(), "sink failed: {e}");
            }
        }
        true
    }

    /// Flush every sink; failures are counted, not propagated.
    pub fn flush(&mut self) {
        for sink in &mut self.sinks {
            if let Err(e) = sink.flush() {
                self.stats.sink_errors += 1;
                warn!(sink = ?sink.kind(), "sink flush failed: {e}");
            }
        }
    }

    pub fn stats(&self) -> &AlertStats {
        &self.stats
    }

    /// Forget throttle state for IDs no longer tracked (invoked from
    /// the maintenance path so the maps stay bounded with the state
    /// table).
    pub fn forget_before(&mut self, cutoff: f64) {
        self.last_emitted.retain(|_, ts| *ts >= cutoff);
        let cutoff_sec = cutoff.floor() as i64;
        self.id_buckets.retain(|_, b| b.second >= cutoff_sec);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerting::sinks::test_support::RecordingSink;
    use crate::types::Severity;
    use serde_json::Map;

    fn alert(ts: f64, id: u32, alert_type: AlertType, severity: Severity) -> Alert {
        Alert::new(ts, id, alert_type, severity, "test".into(), Map::new())
    }

    fn manager_with_recording(kind: SinkKind) -> (AlertManager, std::sync::Arc<std::sync::Mutex<Vec<Alert>>>) {
        let mut mgr = AlertManager::new(
            ThrottleSettings {
                max_alerts_per_id_per_sec: 3,
                global_max_alerts_per_sec: 20,
                cooldown_ms: 250,
            },
            AlertOutputSettings::default(),
        );
        let (sink, emitted) = RecordingSink::new(kind);
        mgr.add_sink(Box::new(sink));
        (mgr, emitted)
    }

    #[test]
    fn test_cooldown_suppresses_duplicates() {
        let (mut mgr, emitted) = manager_with_recording(SinkKind::Json);
        assert!(mgr.process(alert(1.0, 0x100, AlertType::EntropyAnomaly, Severity::Low)));
        // 100ms later: inside the 250ms cooldown.
        assert!(!mgr.process(alert(1.1, 0x100, AlertType::EntropyAnomaly, Severity::Low)));
        // 300ms later: clear of it.
        assert!(mgr.process(alert(1.3, 0x100, AlertType::EntropyAnomaly, Severity::Low)));
        assert_eq!(emitted.lock().unwrap().len(), 2);
        assert_eq!(mgr.stats().suppressed_cooldown, 1);
    }

    #[test]
    fn test_cooldown_is_per_id_and_type() {
        let (mut mgr, _) = manager_with_recording(SinkKind::Json);
        assert!(mgr.process(alert(1.0, 0x100, AlertType::EntropyAnomaly, Severity::Low)));
        // Different ID, same type: no cooldown interaction.
        assert!(mgr.process(alert(1.05, 0x200, AlertType::EntropyAnomaly, Severity::Low)));
        // Same ID, different type: no interaction either.
        assert!(mgr.process(alert(1.10, 0x100, AlertType::SequenceReplay, Severity::Low)));
    }

    #[test]
    fn test_per_id_throttle_bound() {
        let (mut mgr, emitted) = manager_with_recording(SinkKind::Json);
        let mut passed = 0;
        // 10 alerts inside one second, 300ms apart would exceed the
        // cooldown, so use distinct fractions past it.
        for i in 0..10 {
            let ts = 5.0 + i as f64 * 0.099;
            let a = alert(ts, 0x100, AlertType::SequenceReplay, Severity::Low);
            if mgr.process(a) {
                passed += 1;
            }
        }
        // Never more than 3 per second regardless of cooldown gaps.
        let alerts = emitted.lock().unwrap();
        let in_sec5 = alerts.iter().filter(|a| a.timestamp < 6.0).count();
        assert!(in_sec5 <= 3, "emitted {in_sec5} alerts in one second");
        assert!(passed <= 6);
        assert!(mgr.stats().throttled_per_id > 0);
    }

    #[test]
    fn test_global_throttle() {
        let mut mgr = AlertManager::new(
            ThrottleSettings {
                max_alerts_per_id_per_sec: 10,
                global_max_alerts_per_sec: 5,
                cooldown_ms: 0,
            },
            AlertOutputSettings::default(),
        );
        let (sink, emitted) = RecordingSink::new(SinkKind::Json);
        mgr.add_sink(Box::new(sink));
        for i in 0..20u32 {
            // 20 different IDs in the same second.
            mgr.process(alert(7.01, 0x100 + i, AlertType::UnknownIdDetected, Severity::Low));
        }
        assert_eq!(emitted.lock().unwrap().len(), 5);
        assert_eq!(mgr.stats().throttled_global, 15);
    }

    #[test]
    fn test_bucket_resets_next_second() {
        let (mut mgr, emitted) = manager_with_recording(SinkKind::Json);
        for ts in [10.0, 10.3, 10.6] {
            assert!(mgr.process(alert(ts, 0x1, AlertType::SequenceReplay, Severity::Low)));
        }
        // Fourth in the same second: throttled.
        assert!(!mgr.process(alert(10.9, 0x1, AlertType::SequenceReplay, Severity::Low)));
        // New second: bucket is fresh.
        assert!(mgr.process(alert(11.2, 0x1, AlertType::SequenceReplay, Severity::Low)));
        assert_eq!(emitted.lock().unwrap().len(), 4);
    }

    #[test]
    fn test_severity_routing() {
        let mut mgr = AlertManager::new(ThrottleSettings::default(), AlertOutputSettings::default());
        let (json_sink, json_seen) = RecordingSink::new(SinkKind::Json);
        let (text_sink, text_seen) = RecordingSink::new(SinkKind::Text);
        let (console_sink, console_seen) = RecordingSink::new(SinkKind::Console);
        mgr.add_sink(Box::new(json_sink));
        mgr.add_sink(Box::new(text_sink));
        mgr.add_sink(Box::new(console_sink));

        mgr.process(alert(1.0, 0x1, AlertType::NonPeriodicFastReplay, Severity::Low));
        mgr.process(alert(2.0, 0x1, AlertType::EntropyAnomaly, Severity::Medium));
        mgr.process(alert(3.0, 0x1, AlertType::TamperDlcAnomaly, Severity::High));

        // low -> json only; medium -> json+text; high -> all.
        assert_eq!(json_seen.lock().unwrap().len(), 3);
        assert_eq!(text_seen.lock().unwrap().len(), 2);
        assert_eq!(console_seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_sink_failure_counted_not_propagated() {
        let mut mgr = AlertManager::new(ThrottleSettings::default(), AlertOutputSettings::default());
        let (mut sink, _) = RecordingSink::new(SinkKind::Json);
        sink.fail = true;
        mgr.add_sink(Box::new(sink));
        assert!(mgr.process(alert(1.0, 0x1, AlertType::EntropyAnomaly, Severity::Low)));
        assert_eq!(mgr.stats().sink_errors, 1);
        assert_eq!(mgr.stats().emitted, 1);
    }
}
