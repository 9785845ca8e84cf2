//! Detection algorithms.
//!
//! Four detectors share one contract: `detect(frame, state, baseline)`
//! returns zero or more alerts and mutates neither the state manager
//! nor the baseline engine. The chain invokes them in a fixed order
//! (drop, tamper, replay, general rules) so alert emission is
//! deterministic, and converts any internal detector failure into
//! zero alerts plus an error counter.

pub mod drop;
pub mod general;
pub mod replay;
pub mod tamper;

use tracing::error;

use crate::baseline::BaselineEngine;
use crate::config::EffectiveParams;
use crate::error::Result;
use crate::state::PerIdState;
use crate::types::{Alert, CanFrame};

pub use self::drop::DropDetector;
pub use general::GeneralRulesDetector;
pub use replay::ReplayDetector;
pub use tamper::TamperDetector;

/// Common detector contract.
///
/// Implementations may keep private bookkeeping (counters, shadow
/// timers) but must not touch tracked state or the baseline.
pub trait Detector {
    fn name(&self) -> &'static str;

    fn detect(
        &mut self,
        frame: &CanFrame,
        state: &PerIdState,
        baseline: &BaselineEngine,
        params: &EffectiveParams,
    ) -> Result<Vec<Alert>>;
}

/// Per-detector internal failure counters, reported with the periodic
/// stats record.
#[derive(Debug, Clone, Copy, Default)]
pub struct DetectorErrors {
    pub drop: u64,
    pub tamper: u64,
    pub replay: u64,
    pub general_rules: u64,
}

impl DetectorErrors {
    pub fn total(&self) -> u64 {
        self.drop + self.tamper + self.replay + self.general_rules
    }
}

/// The fixed-order detector chain.
pub struct DetectorChain {
    drop: DropDetector,
    tamper: TamperDetector,
    replay: ReplayDetector,
    general: GeneralRulesDetector,
    errors: DetectorErrors,
}

impl DetectorChain {
    pub fn new(
        drop: DropDetector,
        tamper: TamperDetector,
        replay: ReplayDetector,
        general: GeneralRulesDetector,
    ) -> Self {
        Self {
            drop,
            tamper,
            replay,
            general,
            errors: DetectorErrors::default(),
        }
    }

    /// Run every detector against one frame, in order. A detector
    /// failure never crosses the frame boundary.
    pub fn run(
        &mut self,
        frame: &CanFrame,
        state: &PerIdState,
        baseline: &BaselineEngine,
        params: &EffectiveParams,
    ) -> Vec<Alert> {
        let mut alerts = Vec::new();

        let stages: [(&mut dyn Detector, &mut u64); 4] = [
            (&mut self.drop, &mut self.errors.drop),
            (&mut self.tamper, &mut self.errors.tamper),
            (&mut self.replay, &mut self.errors.replay),
            (&mut self.general, &mut self.errors.general_rules),
        ];

        for (detector, error_counter) in stages {
            match detector.detect(frame, state, baseline, params) {
                Ok(mut found) => alerts.append(&mut found),
                Err(e) => {
                    *error_counter += 1;
                    error!(
                        detector = detector.name(),
                        can_id = format_args!("{:#x}", frame.can_id),
                        "detector failed: {e}"
                    );
                }
            }
        }

        alerts
    }

    pub fn errors(&self) -> DetectorErrors {
        self.errors
    }

    /// Tell the general-rules detector that the baseline froze, which
    /// opens its shadow window.
    pub fn notify_baseline_ready(&mut self, now: f64) {
        self.general.on_baseline_ready(now);
    }

    /// Unknown IDs whose shadow window expired with auto-add enabled;
    /// the orchestrator applies these to the baseline between frames.
    pub fn drain_pending_baseline_adds(&mut self) -> Vec<u32> {
        self.general.drain_pending_adds()
    }
}
