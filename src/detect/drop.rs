//! Drop detector: missing frames on periodic IDs.
//!
//! All rules key off the current inter-arrival time against the
//! learned IAT profile, so they only run with a frozen baseline whose
//! mean is meaningful. When several rules fire on one frame, only the
//! highest-severity alert is emitted (ties broken by lexicographic
//! alert type).

use serde_json::{json, Map};

use crate::baseline::BaselineEngine;
use crate::config::EffectiveParams;
use crate::error::Result;
use crate::state::PerIdState;
use crate::types::{Alert, AlertType, CanFrame, Severity};

use super::Detector;

#[derive(Default)]
pub struct DropDetector {
    alerts_emitted: u64,
}

impl DropDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts_emitted(&self) -> u64 {
        self.alerts_emitted
    }
}

impl Detector for DropDetector {
    fn name(&self) -> &'static str {
        "drop"
    }

    fn detect(
        &mut self,
        frame: &CanFrame,
        state: &PerIdState,
        baseline: &BaselineEngine,
        params: &EffectiveParams,
    ) -> Result<Vec<Alert>> {
        let cfg = &params.drop;
        if !cfg.enabled {
            return Ok(Vec::new());
        }
        let Some(profile) = baseline.lookup(frame.can_id) else {
            return Ok(Vec::new());
        };
        if profile.iat_mean <= 0.0 {
            return Ok(Vec::new());
        }
        // Heartbeat-exempt frames (and first frames) carry no IAT.
        let Some(iat) = state.last_iat else {
            return Ok(Vec::new());
        };

        let mut candidates: Vec<(AlertType, Severity, String, Map<String, serde_json::Value>)> =
            Vec::new();

        let max_allowed = profile.iat_mean * cfg.max_iat_factor;
        if iat > max_allowed {
            let mut context = Map::new();
            context.insert("current_iat".into(), json!(iat));
            context.insert("max_allowed_iat".into(), json!(max_allowed));
            context.insert("max_iat_factor".into(), json!(cfg.max_iat_factor));
            context.insert("learned_mean".into(), json!(profile.iat_mean));
            candidates.push((
                AlertType::IatMaxFactorViolation,
                Severity::Medium,
                format!(
                    "IAT {iat:.6}s exceeds {max_allowed:.6}s (mean {:.6}s x factor {})",
                    profile.iat_mean, cfg.max_iat_factor
                ),
                context,
            ));
        }

        let sigma_threshold = profile.iat_mean + cfg.missing_frame_sigma * profile.iat_sigma;
        if iat > sigma_threshold {
            let mut context = Map::new();
            context.insert("current_iat".into(), json!(iat));
            context.insert("threshold".into(), json!(sigma_threshold));
            context.insert("learned_mean".into(), json!(profile.iat_mean));
            context.insert("learned_sigma".into(), json!(profile.iat_sigma));
            context.insert("sigma".into(), json!(cfg.missing_frame_sigma));
            candidates.push((
                AlertType::MissingFrameSigma,
                Severity::High,
                format!(
                    "IAT {iat:.6}s beyond mean {:.6}s + {} sigma ({:.6}s)",
                    profile.iat_mean, cfg.missing_frame_sigma, sigma_threshold
                ),
                context,
            ));
        }

        let estimated_missing = ((iat / profile.iat_mean).floor() as i64 - 1).max(0) as u32;
        if estimated_missing > cfg.consecutive_missing_allowed {
            let severity = if estimated_missing > cfg.consecutive_missing_allowed * 2 {
                Severity::Critical
            } else {
                Severity::High
            };
            let mut context = Map::new();
            context.insert("estimated_missing_frames".into(), json!(estimated_missing));
            context.insert(
                "consecutive_allowed".into(),
                json!(cfg.consecutive_missing_allowed),
            );
            context.insert("current_iat".into(), json!(iat));
            candidates.push((
                AlertType::ConsecutiveMissing,
                severity,
                format!(
                    "an estimated {estimated_missing} frames missing (allowed {})",
                    cfg.consecutive_missing_allowed
                ),
                context,
            ));
        }

        // Highest severity wins; ties fall to the earliest-declared
        // rule, so a sigma violation outranks an equally-severe
        // missing-frame estimate.
        let best = candidates
            .into_iter()
            .reduce(|best, candidate| if candidate.1 > best.1 { candidate } else { best });

        Ok(match best {
            Some((alert_type, severity, details, context)) => {
                self.alerts_emitted += 1;
                vec![Alert::new(
                    frame.timestamp,
                    frame.can_id,
                    alert_type,
                    severity,
                    details,
                    context,
                )]
            }
            None => Vec::new(),
        })
    }
}
