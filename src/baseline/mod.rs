//! Baseline learning engine.
//!
//! During the learning window the engine accumulates per-ID
//! statistics; at the close of learning it freezes into a read-only
//! [`Baseline`]. A frozen baseline never mutates, with one sanctioned
//! exception: the general-rules detector may append *untrained*
//! entries for IDs that survive their shadow window.

pub mod persist;

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::{LearningSettings, TamperSettings};
use crate::error::{IdsError, Result};
use crate::state::{PerIdState, Welford};
use crate::types::CanFrame;

/// Common counter step sizes worth recognizing.
const COUNTER_STEPS: [u8; 5] = [1, 2, 4, 8, 16];

/// Fraction of increments that must agree before a byte counts as a
/// counter.
const COUNTER_CONSISTENCY: f64 = 0.7;

/// How one payload position behaved during learning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ByteBehavior {
    /// Same value in every observed frame.
    Static { value: u8 },
    /// Monotonic increment with wrap-around.
    Counter { step: u8, modulus: u16 },
    /// Free-moving within an observed range.
    Variable { min: u8, max: u8 },
    /// Too few observations to classify.
    Rare,
}

/// Frozen per-ID profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdBaseline {
    pub iat_mean: f64,
    pub iat_sigma: f64,
    pub iat_samples: u64,
    pub learned_dlcs: BTreeSet<u8>,
    pub entropy_mean: f64,
    pub entropy_sigma: f64,
    pub entropy_samples: u64,
    pub byte_behavior: [ByteBehavior; 8],
    pub frame_count: u64,
    /// Expected frame period, derived from the IAT mean.
    pub learned_period: f64,
    /// False for IDs that never reached the sample threshold (or were
    /// shadow-added); tamper suppresses byte/entropy rules for them.
    pub trained: bool,
}

impl IdBaseline {
    /// An entry for an ID admitted without learning data.
    pub fn untrained() -> Self {
        Self {
            iat_mean: 0.0,
            iat_sigma: 0.0,
            iat_samples: 0,
            learned_dlcs: BTreeSet::new(),
            entropy_mean: 0.0,
            entropy_sigma: 0.0,
            entropy_samples: 0,
            byte_behavior: [ByteBehavior::Rare; 8],
            frame_count: 0,
            learned_period: 0.0,
            trained: false,
        }
    }

    /// The fixed value at `position`, when classified static.
    pub fn static_byte(&self, position: usize) -> Option<u8> {
        match self.byte_behavior.get(position) {
            Some(ByteBehavior::Static { value }) => Some(*value),
            _ => None,
        }
    }
}

/// Read-only map of frozen profiles.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct Baseline {
    ids: HashMap<u32, IdBaseline>,
}

impl Baseline {
    pub fn lookup(&self, can_id: u32) -> Option<&IdBaseline> {
        self.ids.get(&can_id)
    }

    pub fn contains(&self, can_id: u32) -> bool {
        self.ids.contains_key(&can_id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&u32, &IdBaseline)> {
        self.ids.iter()
    }

    /// Admit an ID as untrained; existing entries are left untouched.
    pub fn add_untrained(&mut self, can_id: u32) {
        self.ids.entry(can_id).or_insert_with(IdBaseline::untrained);
    }

    pub(crate) fn insert(&mut self, can_id: u32, profile: IdBaseline) {
        self.ids.insert(can_id, profile);
    }
}

impl FromIterator<(u32, IdBaseline)> for Baseline {
    fn from_iter<T: IntoIterator<Item = (u32, IdBaseline)>>(iter: T) -> Self {
        Self {
            ids: iter.into_iter().collect(),
        }
    }
}

// =============================================================================
// Learning accumulators
// =============================================================================

/// Per-position learning accumulator: O(1) memory regardless of the
/// learning window length.
#[derive(Debug, Clone)]
struct BytePosLearning {
    samples: u64,
    min: u8,
    max: u8,
    seen: [bool; 256],
    unique: u16,
    prev: Option<u8>,
    /// Histogram of increments mod 256 between consecutive samples.
    diffs: Box<[u32; 256]>,
}

impl Default for BytePosLearning {
    fn default() -> Self {
        Self {
            samples: 0,
            min: u8::MAX,
            max: 0,
            seen: [false; 256],
            unique: 0,
            prev: None,
            diffs: Box::new([0u32; 256]),
        }
    }
}

impl BytePosLearning {
    fn push(&mut self, value: u8) {
        self.samples += 1;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        if !self.seen[value as usize] {
            self.seen[value as usize] = true;
            self.unique += 1;
        }
        if let Some(prev) = self.prev {
            self.diffs[value.wrapping_sub(prev) as usize] += 1;
        }
        self.prev = Some(value);
    }

    fn classify(&self, learning: &LearningSettings, tamper: &TamperSettings) -> ByteBehavior {
        if self.samples == 0 {
            return ByteBehavior::Rare;
        }
        if self.unique == 1 {
            return ByteBehavior::Static { value: self.min };
        }

        let counter_cfg = &tamper.byte_behavior_params.counter_byte_params;
        if counter_cfg.detect_simple_counters
            && self.samples >= learning.min_counter_samples
        {
            let total: u64 = self.diffs.iter().map(|&c| c as u64).sum();
            if total > 0 {
                let (step, count) = self
                    .diffs
                    .iter()
                    .enumerate()
                    .max_by_key(|(_, &c)| c)
                    .map(|(d, &c)| (d as u8, c as u64))
                    .unwrap_or((0, 0));
                let consistency = count as f64 / total as f64;
                if consistency > COUNTER_CONSISTENCY && COUNTER_STEPS.contains(&step) {
                    return ByteBehavior::Counter {
                        step,
                        modulus: counter_cfg.max_value_before_rollover_guess + 1,
                    };
                }
            }
        }

        ByteBehavior::Variable {
            min: self.min,
            max: self.max,
        }
    }
}

/// Per-ID learning accumulator.
#[derive(Debug, Clone, Default)]
struct IdLearning {
    iat: Welford,
    dlcs: BTreeSet<u8>,
    entropy: Welford,
    bytes: [BytePosLearning; 8],
    frame_count: u64,
}

/// Engine lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EngineMode {
    Open,
    Frozen,
}

/// Learns per-ID profiles and answers lookups once frozen.
pub struct BaselineEngine {
    mode: EngineMode,
    learning_cfg: LearningSettings,
    tamper_cfg: TamperSettings,
    learning: HashMap<u32, IdLearning>,
    baseline: Baseline,
}

impl BaselineEngine {
    pub fn new(learning_cfg: LearningSettings, tamper_cfg: TamperSettings) -> Self {
        info!(
            window_sec = learning_cfg.initial_learning_window_sec,
            min_samples = learning_cfg.min_samples_for_stable_baseline,
            "initializing baseline engine"
        );
        Self {
            mode: EngineMode::Open,
            learning_cfg,
            tamper_cfg,
            learning: HashMap::new(),
            baseline: Baseline::default(),
        }
    }

    /// Rehydrate a frozen engine from a persisted baseline.
    pub fn from_frozen(
        baseline: Baseline,
        learning_cfg: LearningSettings,
        tamper_cfg: TamperSettings,
    ) -> Self {
        Self {
            mode: EngineMode::Frozen,
            learning_cfg,
            tamper_cfg,
            learning: HashMap::new(),
            baseline,
        }
    }

    pub fn is_frozen(&self) -> bool {
        self.mode == EngineMode::Frozen
    }

    /// Fold one frame's view into the learning statistics.
    ///
    /// Only valid while open; observing a frozen engine is a contract
    /// violation.
    pub fn observe(&mut self, frame: &CanFrame, state: &PerIdState) -> Result<()> {
        if self.mode == EngineMode::Frozen {
            return Err(IdsError::WrongMode("observe on frozen baseline"));
        }

        let data = self.learning.entry(frame.can_id).or_default();
        data.frame_count += 1;
        data.dlcs.insert(frame.dlc);

        if let Some(iat) = state.last_iat {
            data.iat.push(iat);
        }

        if self.tamper_cfg.entropy_params.enabled
            && frame.dlc >= self.tamper_cfg.payload_analysis_min_dlc
        {
            data.entropy.push(frame.payload_entropy());
        }

        if self.tamper_cfg.byte_behavior_params.enabled {
            for (pos, &byte) in frame.payload().iter().enumerate() {
                data.bytes[pos].push(byte);
            }
        }

        Ok(())
    }

    /// Close learning: classify every accumulated ID and freeze.
    pub fn freeze(&mut self, now: f64) -> Result<()> {
        if self.mode == EngineMode::Frozen {
            return Err(IdsError::WrongMode("freeze on frozen baseline"));
        }

        let min_samples = self.learning_cfg.min_samples_for_stable_baseline;
        for (can_id, data) in self.learning.drain() {
            let trained = data.frame_count >= min_samples;
            let byte_behavior = std::array::from_fn(|pos| {
                data.bytes[pos].classify(&self.learning_cfg, &self.tamper_cfg)
            });
            let iat_mean = data.iat.mean();
            let profile = IdBaseline {
                iat_mean,
                iat_sigma: data.iat.sigma(),
                iat_samples: data.iat.count(),
                learned_dlcs: data.dlcs,
                entropy_mean: data.entropy.mean(),
                entropy_sigma: data.entropy.sigma(),
                entropy_samples: data.entropy.count(),
                byte_behavior,
                frame_count: data.frame_count,
                learned_period: iat_mean,
                trained,
            };
            debug!(
                can_id = format_args!("{can_id:#x}"),
                frames = profile.frame_count,
                trained,
                "finalized baseline"
            );
            self.baseline.insert(can_id, profile);
        }

        self.mode = EngineMode::Frozen;
        info!(
            ids = self.baseline.len(),
            at = now,
            "baseline frozen"
        );
        Ok(())
    }

    /// Frozen-only lookup; partial baselines never leak.
    pub fn lookup(&self, can_id: u32) -> Option<&IdBaseline> {
        if self.mode == EngineMode::Frozen {
            self.baseline.lookup(can_id)
        } else {
            None
        }
    }

    pub fn contains(&self, can_id: u32) -> bool {
        self.mode == EngineMode::Frozen && self.baseline.contains(can_id)
    }

    /// Admit an unknown ID as untrained (shadow auto-add path).
    pub fn add_untrained(&mut self, can_id: u32) -> Result<()> {
        if self.mode != EngineMode::Frozen {
            return Err(IdsError::WrongMode("add_untrained on open baseline"));
        }
        self.baseline.add_untrained(can_id);
        Ok(())
    }

    /// The frozen map, for persistence.
    pub fn frozen_baseline(&self) -> Result<&Baseline> {
        if self.mode != EngineMode::Frozen {
            return Err(IdsError::WrongMode("snapshot of open baseline"));
        }
        Ok(&self.baseline)
    }

    pub fn learning_id_count(&self) -> usize {
        self.learning.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StateSettings;
    use crate::state::{StateManager, UpdateOptions};

    fn frame(ts: f64, id: u32, payload: &[u8]) -> CanFrame {
        CanFrame::new(ts, id, payload).unwrap()
    }

    fn engine() -> BaselineEngine {
        BaselineEngine::new(
            LearningSettings {
                min_samples_for_stable_baseline: 10,
                min_counter_samples: 5,
                ..LearningSettings::default()
            },
            TamperSettings::default(),
        )
    }

    fn learn_stream(
        engine: &mut BaselineEngine,
        frames: impl Iterator<Item = CanFrame>,
    ) -> StateManager {
        let mut mgr = StateManager::new(StateSettings::default());
        let opts = UpdateOptions {
            heartbeat_exempt: false,
            sequence_length: 5,
        };
        for f in frames {
            let state = mgr.update(&f, opts);
            engine.observe(&f, state).unwrap();
        }
        mgr
    }

    #[test]
    fn test_iat_statistics_learned() {
        let mut eng = engine();
        learn_stream(
            &mut eng,
            (0..100).map(|i| frame(i as f64 * 0.01, 0x100, &[0x00])),
        );
        eng.freeze(1.0).unwrap();
        let profile = eng.lookup(0x100).unwrap();
        assert!((profile.iat_mean - 0.01).abs() < 1e-9);
        assert!(profile.iat_sigma < 1e-9);
        assert_eq!(profile.iat_samples, 99);
        assert!(profile.trained);
    }

    #[test]
    fn test_lookup_during_learning_returns_none() {
        let mut eng = engine();
        learn_stream(&mut eng, (0..5).map(|i| frame(i as f64, 0x100, &[0])));
        assert!(eng.lookup(0x100).is_none());
        assert!(!eng.contains(0x100));
    }

    #[test]
    fn test_observe_after_freeze_is_wrong_mode() {
        let mut eng = engine();
        let mgr = learn_stream(&mut eng, (0..5).map(|i| frame(i as f64, 0x100, &[0])));
        eng.freeze(5.0).unwrap();
        let err = eng
            .observe(&frame(6.0, 0x100, &[0]), mgr.get(0x100).unwrap())
            .unwrap_err();
        assert!(matches!(err, IdsError::WrongMode(_)));
    }

    #[test]
    fn test_static_byte_classification() {
        let mut eng = engine();
        learn_stream(
            &mut eng,
            (0..50).map(|i| frame(i as f64 * 0.01, 0x153, &[0x00, (i * 37 % 256) as u8])),
        );
        eng.freeze(1.0).unwrap();
        let profile = eng.lookup(0x153).unwrap();
        assert_eq!(profile.byte_behavior[0], ByteBehavior::Static { value: 0x00 });
        assert_eq!(profile.static_byte(0), Some(0x00));
        assert!(matches!(
            profile.byte_behavior[1],
            ByteBehavior::Variable { .. }
        ));
        assert_eq!(profile.byte_behavior[5], ByteBehavior::Rare);
    }

    #[test]
    fn test_counter_byte_classification() {
        let mut eng = engine();
        learn_stream(
            &mut eng,
            (0..300).map(|i| frame(i as f64 * 0.01, 0x200, &[(i % 256) as u8])),
        );
        eng.freeze(5.0).unwrap();
        let profile = eng.lookup(0x200).unwrap();
        assert_eq!(
            profile.byte_behavior[0],
            ByteBehavior::Counter {
                step: 1,
                modulus: 256
            }
        );
    }

    #[test]
    fn test_counter_survives_wraparound() {
        let mut eng = engine();
        // Start near the top so the stream wraps 255 -> 0.
        learn_stream(
            &mut eng,
            (0..100).map(|i| frame(i as f64 * 0.01, 0x200, &[((200 + i * 2) % 256) as u8])),
        );
        eng.freeze(5.0).unwrap();
        let profile = eng.lookup(0x200).unwrap();
        assert_eq!(
            profile.byte_behavior[0],
            ByteBehavior::Counter {
                step: 2,
                modulus: 256
            }
        );
    }

    #[test]
    fn test_dlc_whitelist() {
        let mut eng = engine();
        let frames = (0..20).map(|i| {
            if i % 2 == 0 {
                frame(i as f64 * 0.1, 0x316, &[0; 8])
            } else {
                frame(i as f64 * 0.1, 0x316, &[0; 4])
            }
        });
        learn_stream(&mut eng, frames);
        eng.freeze(2.0).unwrap();
        let profile = eng.lookup(0x316).unwrap();
        assert_eq!(
            profile.learned_dlcs.iter().copied().collect::<Vec<_>>(),
            vec![4, 8]
        );
    }

    #[test]
    fn test_untrained_below_sample_threshold() {
        let mut eng = engine();
        learn_stream(&mut eng, (0..3).map(|i| frame(i as f64, 0x400, &[0])));
        eng.freeze(3.0).unwrap();
        let profile = eng.lookup(0x400).unwrap();
        assert!(!profile.trained);
        assert!(eng.contains(0x400));
    }

    #[test]
    fn test_frozen_baseline_immutable_lookups() {
        let mut eng = engine();
        learn_stream(
            &mut eng,
            (0..20).map(|i| frame(i as f64 * 0.01, 0x100, &[i as u8])),
        );
        eng.freeze(1.0).unwrap();
        let first = eng.lookup(0x100).unwrap().clone();
        let second = eng.lookup(0x100).unwrap().clone();
        assert_eq!(first, second);
    }

    #[test]
    fn test_add_untrained_does_not_clobber() {
        let mut eng = engine();
        learn_stream(
            &mut eng,
            (0..20).map(|i| frame(i as f64 * 0.01, 0x100, &[0])),
        );
        eng.freeze(1.0).unwrap();
        let before = eng.lookup(0x100).unwrap().clone();
        eng.add_untrained(0x100).unwrap();
        assert_eq!(eng.lookup(0x100).unwrap(), &before);

        eng.add_untrained(0x999).unwrap();
        assert!(!eng.lookup(0x999).unwrap().trained);
    }
}
