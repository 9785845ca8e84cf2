//! Replay detector: unauthorized repetition of payloads or sequences.
//!
//! Fast-replay needs a learned IAT profile; the repetition and
//! sequence rules work purely from tracked state and may both fire on
//! the same frame.

use serde_json::{json, Map};

use crate::baseline::BaselineEngine;
use crate::config::EffectiveParams;
use crate::error::Result;
use crate::state::PerIdState;
use crate::types::{Alert, AlertType, CanFrame, Severity};

use super::Detector;

#[derive(Default)]
pub struct ReplayDetector {
    alerts_emitted: u64,
}

impl ReplayDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts_emitted(&self) -> u64 {
        self.alerts_emitted
    }

    fn check_fast_replay(
        &self,
        frame: &CanFrame,
        state: &PerIdState,
        baseline: &BaselineEngine,
        params: &EffectiveParams,
    ) -> Option<Alert> {
        let profile = baseline.lookup(frame.can_id)?;
        if profile.iat_mean <= 0.0 {
            return None;
        }
        let iat = state.last_iat?;
        let floor = (params.replay.absolute_min_iat_ms / 1000.0)
            .max(profile.iat_mean * params.replay.min_iat_factor_for_fast_replay);
        if iat >= floor {
            return None;
        }
        let mut context = Map::new();
        context.insert("current_iat".into(), json!(iat));
        context.insert("floor".into(), json!(floor));
        context.insert("learned_mean".into(), json!(profile.iat_mean));
        Some(Alert::new(
            frame.timestamp,
            frame.can_id,
            AlertType::NonPeriodicFastReplay,
            Severity::Low,
            format!("IAT {iat:.6}s below replay floor {floor:.6}s"),
            context,
        ))
    }

    fn check_identical_payload(
        &self,
        frame: &CanFrame,
        state: &PerIdState,
        params: &EffectiveParams,
    ) -> Option<Alert> {
        let cfg = &params.replay.identical_payload_params;
        if !cfg.enabled {
            return None;
        }
        let hash = frame.payload_hash();
        let window_sec = cfg.time_window_ms / 1000.0;
        // The current frame's hash is already in the history.
        let repetitions = state
            .hashes_within(frame.timestamp, window_sec)
            .filter(|h| *h == hash)
            .count() as u32;
        if repetitions < cfg.repetition_threshold {
            return None;
        }
        let mut context = Map::new();
        context.insert("repetitions".into(), json!(repetitions));
        context.insert("threshold".into(), json!(cfg.repetition_threshold));
        context.insert("window_ms".into(), json!(cfg.time_window_ms));
        Some(Alert::new(
            frame.timestamp,
            frame.can_id,
            AlertType::IdenticalPayloadRepetition,
            Severity::Medium,
            format!(
                "payload repeated {repetitions} times within {}ms",
                cfg.time_window_ms
            ),
            context,
        ))
    }

    fn check_sequence_replay(
        &self,
        frame: &CanFrame,
        state: &PerIdState,
        params: &EffectiveParams,
    ) -> Option<Alert> {
        let cfg = &params.replay.sequence_replay_params;
        if !cfg.enabled || state.sequence_buffer.len() < cfg.sequence_length {
            return None;
        }
        let prior = state.prev_window_seen?;
        let age = frame.timestamp - prior;
        if age < cfg.min_interval_between_sequences_sec || age > cfg.max_sequence_age_sec {
            return None;
        }
        let mut context = Map::new();
        context.insert("sequence_length".into(), json!(cfg.sequence_length));
        context.insert("prior_occurrence".into(), json!(prior));
        context.insert("age_sec".into(), json!(age));
        Some(Alert::new(
            frame.timestamp,
            frame.can_id,
            AlertType::SequenceReplay,
            Severity::Medium,
            format!(
                "sequence of {} frames previously seen {age:.3}s ago",
                cfg.sequence_length
            ),
            context,
        ))
    }
}

impl Detector for ReplayDetector {
    fn name(&self) -> &'static str {
        "replay"
    }

    fn detect(
        &mut self,
        frame: &CanFrame,
        state: &PerIdState,
        baseline: &BaselineEngine,
        params: &EffectiveParams,
    ) -> Result<Vec<Alert>> {
        if !params.replay.enabled {
            return Ok(Vec::new());
        }
        let mut alerts = Vec::new();
        alerts.extend(self.check_fast_replay(frame, state, baseline, params));
        alerts.extend(self.check_identical_payload(frame, state, params));
        alerts.extend(self.check_sequence_replay(frame, state, params));
        self.alerts_emitted += alerts.len() as u64;
        Ok(alerts)
    }
}
