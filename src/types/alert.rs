//! Alert types
//!
//! Unified alert format emitted by all detectors. Alert types are a
//! closed enumeration so throttle buckets and test assertions can key
//! on them without string comparison.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Alert severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Severity {
    Low = 0,
    Medium = 1,
    High = 2,
    Critical = 3,
}

impl Default for Severity {
    fn default() -> Self {
        Severity::Medium
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Low => write!(f, "low"),
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

impl Severity {
    /// Returns an elevated severity level (one step higher)
    pub fn elevated(&self) -> Severity {
        match self {
            Severity::Low => Severity::Medium,
            Severity::Medium => Severity::High,
            Severity::High => Severity::Critical,
            Severity::Critical => Severity::Critical,
        }
    }
}

/// Closed set of alert types the detectors can emit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    // Drop detector
    IatMaxFactorViolation,
    MissingFrameSigma,
    ConsecutiveMissing,

    // Tamper detector
    TamperDlcAnomaly,
    EntropyAnomaly,
    StaticByteMismatch,
    ByteBehaviorAnomaly,

    // Replay detector
    NonPeriodicFastReplay,
    IdenticalPayloadRepetition,
    SequenceReplay,

    // General rules detector
    UnknownIdDetected,
}

impl AlertType {
    /// Wire name, also used for lexicographic tie-breaking
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::IatMaxFactorViolation => "iat_max_factor_violation",
            AlertType::MissingFrameSigma => "missing_frame_sigma",
            AlertType::ConsecutiveMissing => "consecutive_missing",
            AlertType::TamperDlcAnomaly => "tamper_dlc_anomaly",
            AlertType::EntropyAnomaly => "entropy_anomaly",
            AlertType::StaticByteMismatch => "static_byte_mismatch",
            AlertType::ByteBehaviorAnomaly => "byte_behavior_anomaly",
            AlertType::NonPeriodicFastReplay => "non_periodic_fast_replay",
            AlertType::IdenticalPayloadRepetition => "identical_payload_repetition",
            AlertType::SequenceReplay => "sequence_replay",
            AlertType::UnknownIdDetected => "unknown_id_detected",
        }
    }
}

impl std::fmt::Display for AlertType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An alert produced by a detector.
///
/// Created by a detector, filtered by the alert manager, then either
/// written to sinks or dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    /// Timestamp of the frame that triggered the alert.
    pub timestamp: f64,
    /// Arbitration ID the alert concerns.
    pub can_id: u32,
    /// What kind of deviation was observed.
    pub alert_type: AlertType,
    /// How bad it is.
    pub severity: Severity,
    /// Human-readable description.
    pub details: String,
    /// Detector-specific structured values.
    pub context: Map<String, Value>,
}

impl Alert {
    pub fn new(
        timestamp: f64,
        can_id: u32,
        alert_type: AlertType,
        severity: Severity,
        details: String,
        context: Map<String, Value>,
    ) -> Self {
        Self {
            timestamp,
            can_id,
            alert_type,
            severity,
            details,
            context,
        }
    }

    /// JSON wire representation: `can_id` rendered as `"0xNNN"`.
    pub fn to_wire(&self) -> Value {
        json!({
            "alert_type": self.alert_type.as_str(),
            "can_id": format!("{:#x}", self.can_id),
            "timestamp": self.timestamp,
            "severity": self.severity.to_string(),
            "details": self.details,
            "context": Value::Object(self.context.clone()),
        })
    }
}
