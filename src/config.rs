//! Configuration for the detection core.
//!
//! Loaded from a JSON file. Unknown keys are rejected at load, and all
//! thresholds are range-checked before the pipeline starts so that a
//! bad value can never surface mid-stream.
//!
//! Per-ID overrides live under `"ids"`, keyed by hex arbitration ID
//! (`"0x316"`). Resolution is ID-specific-then-global and is performed
//! once at load into an effective-parameter table.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{IdsError, Result};

/// Root configuration structure
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Baseline learning settings
    pub learning: LearningSettings,

    /// Drop (missing frame) detection settings
    pub drop: DropSettings,

    /// Tamper (payload/DLC deviation) detection settings
    pub tamper: TamperSettings,

    /// Replay detection settings
    pub replay: ReplaySettings,

    /// General rules (unknown ID) settings
    pub general_rules: GeneralRulesSettings,

    /// Alert throttling settings
    pub throttle: ThrottleSettings,

    /// State manager memory ceilings
    pub state: StateSettings,

    /// Alert sink configuration
    pub alerts: AlertOutputSettings,

    /// Seconds between periodic stats records
    pub stats_interval_sec: u64,

    /// Per-ID overrides, keyed by hex arbitration ID ("0x316")
    pub ids: HashMap<String, IdOverrides>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            learning: LearningSettings::default(),
            drop: DropSettings::default(),
            tamper: TamperSettings::default(),
            replay: ReplaySettings::default(),
            general_rules: GeneralRulesSettings::default(),
            throttle: ThrottleSettings::default(),
            state: StateSettings::default(),
            alerts: AlertOutputSettings::default(),
            stats_interval_sec: 60,
            ids: HashMap::new(),
        }
    }
}

// =============================================================================
// Group settings
// =============================================================================

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LearningSettings {
    /// Length of the learning window, in seconds of stream time
    pub initial_learning_window_sec: u64,
    /// Frames an ID needs before its baseline counts as trained
    pub min_samples_for_stable_baseline: u64,
    /// Entropy observations required before entropy rules apply
    pub min_entropy_samples: u64,
    /// Samples required before a byte may classify as a counter
    pub min_counter_samples: u64,
}

impl Default for LearningSettings {
    fn default() -> Self {
        Self {
            initial_learning_window_sec: 300,
            min_samples_for_stable_baseline: 100,
            min_entropy_samples: 100,
            min_counter_samples: 20,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DropSettings {
    /// Detector on/off switch
    pub enabled: bool,
    /// Sigma multiplier for the missing-frame threshold
    pub missing_frame_sigma: f64,
    /// Estimated missing frames tolerated before alerting
    pub consecutive_missing_allowed: u32,
    /// IAT ceiling as a multiple of the learned mean
    pub max_iat_factor: f64,
    /// Treat DLC=0 frames as heartbeats that do not reset the IAT tracker
    pub treat_dlc_zero_as_special: bool,
}

impl Default for DropSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            missing_frame_sigma: 3.5,
            consecutive_missing_allowed: 2,
            max_iat_factor: 2.5,
            treat_dlc_zero_as_special: false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DlcLearningMode {
    StrictWhitelist,
    /// No adaptation algorithm is defined upstream; behaves as
    /// strict_whitelist.
    Adaptive,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TamperSettings {
    /// Detector on/off switch
    pub enabled: bool,
    /// How learned DLC sets are enforced
    pub dlc_learning_mode: DlcLearningMode,
    /// Payloads shorter than this are skipped for entropy analysis
    pub payload_analysis_min_dlc: u8,
    /// Entropy anomaly rule
    pub entropy_params: EntropyParams,
    /// Byte behavior rules
    pub byte_behavior_params: ByteBehaviorParams,
}

impl Default for TamperSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            dlc_learning_mode: DlcLearningMode::StrictWhitelist,
            payload_analysis_min_dlc: 1,
            entropy_params: EntropyParams::default(),
            byte_behavior_params: ByteBehaviorParams::default(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EntropyParams {
    pub enabled: bool,
    /// Deviations beyond sigma_threshold x entropy_sigma alert
    pub sigma_threshold: f64,
}

impl Default for EntropyParams {
    fn default() -> Self {
        Self {
            enabled: true,
            sigma_threshold: 3.0,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ByteBehaviorParams {
    pub enabled: bool,
    /// Static positions that must mismatch before one alert fires
    pub static_byte_mismatch_threshold: u32,
    pub counter_byte_params: CounterByteParams,
}

impl Default for ByteBehaviorParams {
    fn default() -> Self {
        Self {
            enabled: true,
            static_byte_mismatch_threshold: 1,
            counter_byte_params: CounterByteParams::default(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CounterByteParams {
    pub detect_simple_counters: bool,
    /// Counter modulus guess is this value + 1
    pub max_value_before_rollover_guess: u16,
    /// Step deviation tolerated before a counter byte counts as anomalous
    pub allowed_counter_skips: u32,
}

impl Default for CounterByteParams {
    fn default() -> Self {
        Self {
            detect_simple_counters: true,
            max_value_before_rollover_guess: 255,
            allowed_counter_skips: 2,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReplaySettings {
    /// Detector on/off switch
    pub enabled: bool,
    /// Fast-replay floor as a fraction of learned mean IAT
    pub min_iat_factor_for_fast_replay: f64,
    /// Absolute fast-replay floor, milliseconds
    pub absolute_min_iat_ms: f64,
    pub identical_payload_params: IdenticalPayloadParams,
    pub sequence_replay_params: SequenceReplayParams,
}

impl Default for ReplaySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            min_iat_factor_for_fast_replay: 0.3,
            absolute_min_iat_ms: 0.5,
            identical_payload_params: IdenticalPayloadParams::default(),
            sequence_replay_params: SequenceReplayParams::default(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IdenticalPayloadParams {
    pub enabled: bool,
    /// Window over which repetitions are counted, milliseconds
    pub time_window_ms: f64,
    /// Occurrences (including the current frame) that trigger an alert
    pub repetition_threshold: u32,
}

impl Default for IdenticalPayloadParams {
    fn default() -> Self {
        Self {
            enabled: true,
            time_window_ms: 1000.0,
            repetition_threshold: 3,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SequenceReplayParams {
    pub enabled: bool,
    /// Payload hashes per matched window
    pub sequence_length: usize,
    /// Prior appearances older than this are ignored, seconds
    pub max_sequence_age_sec: f64,
    /// Prior appearances closer than this are normal traffic, seconds
    pub min_interval_between_sequences_sec: f64,
}

impl Default for SequenceReplayParams {
    fn default() -> Self {
        Self {
            enabled: true,
            sequence_length: 5,
            max_sequence_age_sec: 300.0,
            min_interval_between_sequences_sec: 2.0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownIdLearningMode {
    Strict,
    Shadow,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GeneralRulesSettings {
    pub detect_unknown_id: UnknownIdParams,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UnknownIdParams {
    pub enabled: bool,
    pub learning_mode: UnknownIdLearningMode,
    /// Per-ID grace period after the baseline freezes, seconds
    pub shadow_duration_sec: f64,
    /// Add IDs that survive their shadow window as untrained entries
    pub auto_add_to_baseline: bool,
}

impl Default for UnknownIdParams {
    fn default() -> Self {
        Self {
            enabled: true,
            learning_mode: UnknownIdLearningMode::Strict,
            shadow_duration_sec: 60.0,
            auto_add_to_baseline: false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ThrottleSettings {
    /// Alerts per (can_id, alert_type) per second
    pub max_alerts_per_id_per_sec: u32,
    /// Alerts per second across all IDs
    pub global_max_alerts_per_sec: u32,
    /// Same (can_id, alert_type) within this window is suppressed
    pub cooldown_ms: u64,
}

impl Default for ThrottleSettings {
    fn default() -> Self {
        Self {
            max_alerts_per_id_per_sec: 3,
            global_max_alerts_per_sec: 20,
            cooldown_ms: 250,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StateSettings {
    /// Soft ceiling on tracked IDs before pressure cleanup
    pub max_tracked_ids: usize,
    /// Records unseen for this long are evicted, seconds
    pub eviction_age_sec: f64,
    /// Seconds between cadence eviction passes
    pub cleanup_interval_sec: f64,
    /// IAT ring capacity per ID
    pub iat_history_cap: usize,
    /// Payload-hash ring capacity per ID
    pub payload_hash_history_cap: usize,
    /// Byte-history ring capacity per position
    pub byte_history_cap: usize,
    /// Sequence buffer capacity per ID
    pub sequence_buffer_cap: usize,
    /// Historical sequence windows kept per ID
    pub sequence_history_cap: usize,
    /// Process memory ceiling, MiB
    pub memory_limit_mb: u64,
}

impl Default for StateSettings {
    fn default() -> Self {
        Self {
            max_tracked_ids: 5000,
            eviction_age_sec: 600.0,
            cleanup_interval_sec: 300.0,
            iat_history_cap: 1000,
            payload_hash_history_cap: 100,
            byte_history_cap: 50,
            sequence_buffer_cap: 20,
            sequence_history_cap: 1000,
            memory_limit_mb: 1024,
        }
    }
}

/// Which sink an alert severity routes to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    Console,
    Text,
    Json,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AlertOutputSettings {
    /// Directory for rolling alert logs
    pub output_dir: PathBuf,
    pub console_enabled: bool,
    pub text_log_enabled: bool,
    pub json_log_enabled: bool,
    /// Severity to sink routing; missing severities fall back to the
    /// built-in default
    pub routing: HashMap<String, Vec<SinkKind>>,
}

impl Default for AlertOutputSettings {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("logs"),
            console_enabled: true,
            text_log_enabled: true,
            json_log_enabled: true,
            routing: HashMap::new(),
        }
    }
}

impl AlertOutputSettings {
    /// Sinks for a severity: configured routing, or the built-in
    /// default (low: json; medium: json+text; high/critical: all).
    pub fn sinks_for(&self, severity: crate::types::Severity) -> Vec<SinkKind> {
        use crate::types::Severity;
        if let Some(sinks) = self.routing.get(&severity.to_string()) {
            return sinks.clone();
        }
        match severity {
            Severity::Low => vec![SinkKind::Json],
            Severity::Medium => vec![SinkKind::Json, SinkKind::Text],
            Severity::High | Severity::Critical => {
                vec![SinkKind::Console, SinkKind::Text, SinkKind::Json]
            }
        }
    }
}

// =============================================================================
// Per-ID overrides
// =============================================================================

/// Partial override of detection settings for one arbitration ID.
///
/// Any field left `None` falls through to the global value.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IdOverrides {
    pub drop: Option<DropOverride>,
    pub tamper: Option<TamperOverride>,
    pub replay: Option<ReplayOverride>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DropOverride {
    pub enabled: Option<bool>,
    pub missing_frame_sigma: Option<f64>,
    pub consecutive_missing_allowed: Option<u32>,
    pub max_iat_factor: Option<f64>,
    pub treat_dlc_zero_as_special: Option<bool>,
}

impl DropOverride {
    fn apply(&self, base: &DropSettings) -> DropSettings {
        DropSettings {
            enabled: self.enabled.unwrap_or(base.enabled),
            missing_frame_sigma: self.missing_frame_sigma.unwrap_or(base.missing_frame_sigma),
            consecutive_missing_allowed: self
                .consecutive_missing_allowed
                .unwrap_or(base.consecutive_missing_allowed),
            max_iat_factor: self.max_iat_factor.unwrap_or(base.max_iat_factor),
            treat_dlc_zero_as_special: self
                .treat_dlc_zero_as_special
                .unwrap_or(base.treat_dlc_zero_as_special),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TamperOverride {
    pub enabled: Option<bool>,
    pub dlc_learning_mode: Option<DlcLearningMode>,
    pub payload_analysis_min_dlc: Option<u8>,
    pub entropy_params: Option<EntropyParams>,
    pub byte_behavior_params: Option<ByteBehaviorParams>,
}

impl TamperOverride {
    fn apply(&self, base: &TamperSettings) -> TamperSettings {
        TamperSettings {
            enabled: self.enabled.unwrap_or(base.enabled),
            dlc_learning_mode: self.dlc_learning_mode.unwrap_or(base.dlc_learning_mode),
            payload_analysis_min_dlc: self
                .payload_analysis_min_dlc
                .unwrap_or(base.payload_analysis_min_dlc),
            entropy_params: self
                .entropy_params
                .clone()
                .unwrap_or_else(|| base.entropy_params.clone()),
            byte_behavior_params: self
                .byte_behavior_params
                .clone()
                .unwrap_or_else(|| base.byte_behavior_params.clone()),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReplayOverride {
    pub enabled: Option<bool>,
    pub min_iat_factor_for_fast_replay: Option<f64>,
    pub absolute_min_iat_ms: Option<f64>,
    pub identical_payload_params: Option<IdenticalPayloadParams>,
    pub sequence_replay_params: Option<SequenceReplayParams>,
}

impl ReplayOverride {
    fn apply(&self, base: &ReplaySettings) -> ReplaySettings {
        ReplaySettings {
            enabled: self.enabled.unwrap_or(base.enabled),
            min_iat_factor_for_fast_replay: self
                .min_iat_factor_for_fast_replay
                .unwrap_or(base.min_iat_factor_for_fast_replay),
            absolute_min_iat_ms: self.absolute_min_iat_ms.unwrap_or(base.absolute_min_iat_ms),
            identical_payload_params: self
                .identical_payload_params
                .clone()
                .unwrap_or_else(|| base.identical_payload_params.clone()),
            sequence_replay_params: self
                .sequence_replay_params
                .clone()
                .unwrap_or_else(|| base.sequence_replay_params.clone()),
        }
    }
}

/// Fully-resolved detection parameters for one ID.
#[derive(Clone, Debug)]
pub struct EffectiveParams {
    pub drop: DropSettings,
    pub tamper: TamperSettings,
    pub replay: ReplaySettings,
}

impl Config {
    /// Load configuration from a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            IdsError::Config(format!("failed to read {}: {e}", path.as_ref().display()))
        })?;
        Self::from_json(&content)
    }

    /// Parse configuration from a JSON string
    pub fn from_json(content: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(content)
            .map_err(|e| IdsError::Config(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Range-check every threshold; fatal at startup on violation.
    pub fn validate(&self) -> Result<()> {
        fn positive(name: &str, v: f64) -> Result<()> {
            if v > 0.0 && v.is_finite() {
                Ok(())
            } else {
                Err(IdsError::Config(format!("{name} must be positive, got {v}")))
            }
        }

        if self.learning.initial_learning_window_sec == 0 {
            return Err(IdsError::Config(
                "learning.initial_learning_window_sec must be nonzero".into(),
            ));
        }
        positive("drop.missing_frame_sigma", self.drop.missing_frame_sigma)?;
        positive("drop.max_iat_factor", self.drop.max_iat_factor)?;
        positive(
            "tamper.entropy_params.sigma_threshold",
            self.tamper.entropy_params.sigma_threshold,
        )?;
        if self.tamper.payload_analysis_min_dlc > 8 {
            return Err(IdsError::Config(
                "tamper.payload_analysis_min_dlc must be 0-8".into(),
            ));
        }
        positive(
            "replay.min_iat_factor_for_fast_replay",
            self.replay.min_iat_factor_for_fast_replay,
        )?;
        if self.replay.min_iat_factor_for_fast_replay >= 1.0 {
            return Err(IdsError::Config(
                "replay.min_iat_factor_for_fast_replay must be below 1.0".into(),
            ));
        }
        if !(2..=64).contains(&self.replay.sequence_replay_params.sequence_length) {
            return Err(IdsError::Config(
                "replay.sequence_replay_params.sequence_length must be 2-64".into(),
            ));
        }
        if self.replay.identical_payload_params.repetition_threshold < 2 {
            return Err(IdsError::Config(
                "replay.identical_payload_params.repetition_threshold must be at least 2".into(),
            ));
        }
        if self.throttle.max_alerts_per_id_per_sec == 0
            || self.throttle.global_max_alerts_per_sec == 0
        {
            return Err(IdsError::Config("throttle rates must be nonzero".into()));
        }
        if self.state.max_tracked_ids == 0 {
            return Err(IdsError::Config("state.max_tracked_ids must be nonzero".into()));
        }
        positive(
            "general_rules.detect_unknown_id.shadow_duration_sec",
            self.general_rules.detect_unknown_id.shadow_duration_sec,
        )?;
        for key in self.ids.keys() {
            parse_hex_id(key)?;
        }
        Ok(())
    }

    /// Build the ID-specific-then-global resolution table.
    pub fn resolve_overrides(&self) -> Result<HashMap<u32, EffectiveParams>> {
        let mut resolved = HashMap::with_capacity(self.ids.len());
        for (key, overrides) in &self.ids {
            let can_id = parse_hex_id(key)?;
            resolved.insert(
                can_id,
                EffectiveParams {
                    drop: overrides
                        .drop
                        .as_ref()
                        .map(|o| o.apply(&self.drop))
                        .unwrap_or_else(|| self.drop.clone()),
                    tamper: overrides
                        .tamper
                        .as_ref()
                        .map(|o| o.apply(&self.tamper))
                        .unwrap_or_else(|| self.tamper.clone()),
                    replay: overrides
                        .replay
                        .as_ref()
                        .map(|o| o.apply(&self.replay))
                        .unwrap_or_else(|| self.replay.clone()),
                },
            );
        }
        Ok(resolved)
    }

    /// Global parameters as an effective view (the fallback row).
    pub fn global_params(&self) -> EffectiveParams {
        EffectiveParams {
            drop: self.drop.clone(),
            tamper: self.tamper.clone(),
            replay: self.replay.clone(),
        }
    }
}

/// Parse a `"0x316"`-style arbitration ID key.
pub fn parse_hex_id(key: &str) -> Result<u32> {
    let digits = key
        .strip_prefix("0x")
        .or_else(|| key.strip_prefix("0X"))
        .unwrap_or(key);
    u32::from_str_radix(digits, 16)
        .map_err(|_| IdsError::Config(format!("invalid CAN ID key {key:?}")))
}
