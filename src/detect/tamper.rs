//! Tamper detector: payload and DLC deviations.
//!
//! Rule order is fixed for determinism: DLC whitelist, entropy,
//! static bytes, then byte behavior. Byte and entropy rules are
//! suppressed for untrained IDs, which are known but never reached
//! the sample threshold during learning.

use serde_json::{json, Map};

use crate::baseline::{BaselineEngine, ByteBehavior, IdBaseline};
use crate::config::{EffectiveParams, LearningSettings};
use crate::error::Result;
use crate::state::PerIdState;
use crate::types::{Alert, AlertType, CanFrame, Severity};

use super::Detector;

/// Positions that must deviate before a byte-behavior alert escalates
/// to high.
const ESCALATION_POSITIONS: usize = 4;

pub struct TamperDetector {
    learning_cfg: LearningSettings,
    alerts_emitted: u64,
}

impl TamperDetector {
    pub fn new(learning_cfg: LearningSettings) -> Self {
        Self {
            learning_cfg,
            alerts_emitted: 0,
        }
    }

    pub fn alerts_emitted(&self) -> u64 {
        self.alerts_emitted
    }

    fn check_dlc(
        &self,
        frame: &CanFrame,
        profile: &IdBaseline,
    ) -> Option<Alert> {
        // Untrained and shadow-added entries have no whitelist to
        // enforce. The adaptive mode has no defined adaptation
        // algorithm and enforces the whitelist the same way.
        if profile.learned_dlcs.is_empty() || profile.learned_dlcs.contains(&frame.dlc) {
            return None;
        }
        let mut context = Map::new();
        context.insert("observed_dlc".into(), json!(frame.dlc));
        context.insert(
            "learned_dlcs".into(),
            json!(profile.learned_dlcs.iter().collect::<Vec<_>>()),
        );
        Some(Alert::new(
            frame.timestamp,
            frame.can_id,
            AlertType::TamperDlcAnomaly,
            Severity::High,
            format!(
                "DLC {} outside learned set {:?}",
                frame.dlc, profile.learned_dlcs
            ),
            context,
        ))
    }

    fn check_entropy(
        &self,
        frame: &CanFrame,
        profile: &IdBaseline,
        params: &EffectiveParams,
    ) -> Option<Alert> {
        let entropy_cfg = &params.tamper.entropy_params;
        if !entropy_cfg.enabled
            || !profile.trained
            || profile.entropy_samples < self.learning_cfg.min_entropy_samples
            || frame.dlc < params.tamper.payload_analysis_min_dlc
            || profile.entropy_sigma <= 0.0
        {
            return None;
        }
        let entropy = frame.payload_entropy();
        let deviation = (entropy - profile.entropy_mean).abs();
        let threshold = entropy_cfg.sigma_threshold * profile.entropy_sigma;
        if deviation <= threshold {
            return None;
        }
        let mut context = Map::new();
        context.insert("entropy".into(), json!(entropy));
        context.insert("learned_mean".into(), json!(profile.entropy_mean));
        context.insert("learned_sigma".into(), json!(profile.entropy_sigma));
        context.insert("deviation".into(), json!(deviation));
        context.insert("threshold".into(), json!(threshold));
        Some(Alert::new(
            frame.timestamp,
            frame.can_id,
            AlertType::EntropyAnomaly,
            Severity::Medium,
            format!(
                "payload entropy {entropy:.3} deviates {deviation:.3} from mean {:.3} (threshold {threshold:.3})",
                profile.entropy_mean
            ),
            context,
        ))
    }

    fn check_static_bytes(
        &self,
        frame: &CanFrame,
        profile: &IdBaseline,
        params: &EffectiveParams,
    ) -> Option<Alert> {
        let behavior_cfg = &params.tamper.byte_behavior_params;
        if !behavior_cfg.enabled || !profile.trained {
            return None;
        }
        let payload = frame.payload();
        let mut positions = Vec::new();
        let mut expected = Vec::new();
        let mut observed = Vec::new();
        for (pos, &byte) in payload.iter().enumerate() {
            if let Some(value) = profile.static_byte(pos) {
                if byte != value {
                    positions.push(pos);
                    expected.push(value);
                    observed.push(byte);
                }
            }
        }
        if (positions.len() as u32) < behavior_cfg.static_byte_mismatch_threshold {
            return None;
        }
        let mut context = Map::new();
        context.insert("positions".into(), json!(positions));
        context.insert("expected".into(), json!(expected));
        context.insert("observed".into(), json!(observed));
        Some(Alert::new(
            frame.timestamp,
            frame.can_id,
            AlertType::StaticByteMismatch,
            Severity::High,
            format!("static byte mismatch at positions {positions:?}"),
            context,
        ))
    }

    fn check_byte_behavior(
        &self,
        frame: &CanFrame,
        state: &PerIdState,
        profile: &IdBaseline,
        params: &EffectiveParams,
    ) -> Option<Alert> {
        let behavior_cfg = &params.tamper.byte_behavior_params;
        if !behavior_cfg.enabled || !profile.trained {
            return None;
        }
        let counter_cfg = &behavior_cfg.counter_byte_params;
        let payload = frame.payload();
        let mut anomalies = Vec::new();

        for (pos, &byte) in payload.iter().enumerate() {
            match profile.byte_behavior[pos] {
                ByteBehavior::Variable { min, max } => {
                    if byte < min || byte > max {
                        anomalies.push(json!({
                            "position": pos,
                            "kind": "out_of_range",
                            "observed": byte,
                            "min": min,
                            "max": max,
                        }));
                    }
                }
                ByteBehavior::Counter { step, modulus } => {
                    let Some(prev) = state.prev_byte(pos) else {
                        continue;
                    };
                    let modulus = modulus.max(2) as i32;
                    let increment =
                        (byte as i32 - prev as i32).rem_euclid(modulus);
                    let deviation = (increment - step as i32).abs() as u32;
                    if deviation > counter_cfg.allowed_counter_skips {
                        anomalies.push(json!({
                            "position": pos,
                            "kind": "counter_skip",
                            "observed_increment": increment,
                            "expected_step": step,
                        }));
                    }
                }
                ByteBehavior::Static { .. } | ByteBehavior::Rare => {}
            }
        }

        if anomalies.is_empty() {
            return None;
        }
        let severity = if anomalies.len() >= ESCALATION_POSITIONS {
            Severity::High
        } else {
            Severity::Medium
        };
        let count = anomalies.len();
        let mut context = Map::new();
        context.insert("anomalies".into(), json!(anomalies));
        context.insert("position_count".into(), json!(count));
        Some(Alert::new(
            frame.timestamp,
            frame.can_id,
            AlertType::ByteBehaviorAnomaly,
            severity,
            format!("{count} payload positions deviate from learned behavior"),
            context,
        ))
    }
}

impl Detector for TamperDetector {
    fn name(&self) -> &'static str {
        "tamper"
    }

    fn detect(
        &mut self,
        frame: &CanFrame,
        state: &PerIdState,
        baseline: &BaselineEngine,
        params: &EffectiveParams,
    ) -> Result<Vec<Alert>> {
        if !params.tamper.enabled {
            return Ok(Vec::new());
        }
        let Some(profile) = baseline.lookup(frame.can_id) else {
            return Ok(Vec::new());
        };

        let mut alerts = Vec::new();
        alerts.extend(self.check_dlc(frame, profile));
        alerts.extend(self.check_entropy(frame, profile, params));
        alerts.extend(self.check_static_bytes(frame, profile, params));
        alerts.extend(self.check_byte_behavior(frame, state, profile, params));
        self.alerts_emitted += alerts.len() as u64;
        Ok(alerts)
    }
}
