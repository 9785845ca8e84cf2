//! General rules detector: frames whose ID the baseline has never
//! seen.
//!
//! In strict mode an unknown ID alerts immediately. In shadow mode
//! each unknown ID gets its own grace timer (capped at the configured
//! duration, and only granted while the global shadow window is
//! open); IDs that outlive their timer either alert or are handed to
//! the orchestrator for baseline admission as untrained entries.

use std::collections::HashMap;

use serde_json::{json, Map};
use tracing::{debug, info};

use crate::baseline::BaselineEngine;
use crate::config::{EffectiveParams, UnknownIdParams, UnknownIdLearningMode};
use crate::error::Result;
use crate::state::PerIdState;
use crate::types::{Alert, AlertType, CanFrame, Severity};

use super::Detector;

/// Shadow bookkeeping for one unknown ID.
#[derive(Debug, Clone, Copy)]
struct ShadowRecord {
    first_seen: f64,
    frames_observed: u64,
    resolved: bool,
}

pub struct GeneralRulesDetector {
    cfg: UnknownIdParams,
    /// Stream time at which the baseline froze; shadow timers only
    /// start inside the window that opens here.
    baseline_ready_at: Option<f64>,
    shadow: HashMap<u32, ShadowRecord>,
    pending_adds: Vec<u32>,
    alerts_emitted: u64,
}

impl GeneralRulesDetector {
    pub fn new(cfg: UnknownIdParams) -> Self {
        Self {
            cfg,
            baseline_ready_at: None,
            shadow: HashMap::new(),
            pending_adds: Vec::new(),
            alerts_emitted: 0,
        }
    }

    /// Called by the orchestrator when the baseline freezes.
    pub fn on_baseline_ready(&mut self, now: f64) {
        self.baseline_ready_at = Some(now);
    }

    /// Unknown IDs whose shadow expired with auto-add enabled.
    pub fn drain_pending_adds(&mut self) -> Vec<u32> {
        std::mem::take(&mut self.pending_adds)
    }

    /// Number of IDs currently inside their shadow window.
    pub fn shadowed_ids(&self) -> usize {
        self.shadow.values().filter(|r| !r.resolved).count()
    }

    fn unknown_id_alert(&mut self, frame: &CanFrame, shadowed_frames: Option<u64>) -> Alert {
        self.alerts_emitted += 1;
        let mut context = Map::new();
        if let Some(frames) = shadowed_frames {
            context.insert("frames_observed_in_shadow".into(), json!(frames));
        }
        Alert::new(
            frame.timestamp,
            frame.can_id,
            AlertType::UnknownIdDetected,
            Severity::Medium,
            format!("arbitration ID {:#x} is not in the baseline", frame.can_id),
            context,
        )
    }
}

impl Detector for GeneralRulesDetector {
    fn name(&self) -> &'static str {
        "general_rules"
    }

    fn detect(
        &mut self,
        frame: &CanFrame,
        _state: &PerIdState,
        baseline: &BaselineEngine,
        _params: &EffectiveParams,
    ) -> Result<Vec<Alert>> {
        if !self.cfg.enabled || baseline.contains(frame.can_id) {
            return Ok(Vec::new());
        }

        let now = frame.timestamp;
        if self.cfg.learning_mode == UnknownIdLearningMode::Strict {
            return Ok(vec![self.unknown_id_alert(frame, None)]);
        }

        // Shadow mode. An ID earns a grace timer only when first seen
        // inside the global shadow window.
        let window_open = self
            .baseline_ready_at
            .map(|t| now <= t + self.cfg.shadow_duration_sec)
            .unwrap_or(false);

        if !self.shadow.contains_key(&frame.can_id) {
            if !window_open {
                // First seen after the grace period closed: no timer.
                return Ok(vec![self.unknown_id_alert(frame, None)]);
            }
            debug!(
                can_id = format_args!("{:#x}", frame.can_id),
                "unknown ID entered shadow window"
            );
            self.shadow.insert(
                frame.can_id,
                ShadowRecord {
                    first_seen: now,
                    frames_observed: 0,
                    resolved: false,
                },
            );
        }

        let record = self.shadow.get_mut(&frame.can_id).expect("just inserted");
        record.frames_observed += 1;
        let (first_seen, frames, resolved) =
            (record.first_seen, record.frames_observed, record.resolved);

        if resolved {
            // Already alerted (or queued for admission) once; the
            // alert manager's cooldown owns further suppression.
            if self.cfg.auto_add_to_baseline {
                return Ok(Vec::new());
            }
            return Ok(vec![self.unknown_id_alert(frame, None)]);
        }

        if now < first_seen + self.cfg.shadow_duration_sec {
            // Still in grace: record, don't emit.
            return Ok(Vec::new());
        }

        if let Some(record) = self.shadow.get_mut(&frame.can_id) {
            record.resolved = true;
        }
        if self.cfg.auto_add_to_baseline {
            info!(
                can_id = format_args!("{:#x}", frame.can_id),
                frames, "shadow window closed, admitting ID as untrained"
            );
            self.pending_adds.push(frame.can_id);
            return Ok(Vec::new());
        }
        Ok(vec![self.unknown_id_alert(frame, Some(frames))])
    }
}
