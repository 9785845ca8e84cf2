//! Pipeline orchestrator.
//!
//! Single-threaded and fully synchronous: one frame is processed end
//! to end (state update, then learning or detection, then alert
//! policy) before the next is accepted. The only other thread is the
//! low-priority maintenance task, which talks to the pipeline through
//! a command channel drained between frames.

mod memory;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use tracing::{debug, error, info, warn};

use crate::alerting::AlertManager;
use crate::baseline::{persist, Baseline, BaselineEngine};
use crate::config::{Config, EffectiveParams};
use crate::detect::{
    DetectorChain, DropDetector, GeneralRulesDetector, ReplayDetector, TamperDetector,
};
use crate::error::{IdsError, Result};
use crate::source::FrameSource;
use crate::state::{StateManager, UpdateOptions};
use crate::types::CanFrame;
pub use memory::{MemoryLevel, MemoryMonitor};

/// Commands the maintenance task may inject between frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaintenanceCmd {
    Evict,
    Report,
}

/// Where the pipeline currently is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    /// Accumulating the baseline; detectors are not invoked.
    Learning,
    /// Baseline frozen, general-rules shadow window still open.
    Shadow,
    /// Full detection.
    Detecting,
}

/// Interval between real-time source polls when no frame is ready.
const IDLE_POLL: Duration = Duration::from_millis(1);

/// Source failures tolerated (with exponential backoff) in real-time
/// mode before giving up.
const SOURCE_RETRY_LIMIT: u32 = 5;

/// Frames between memory-pressure checks.
const MEMORY_CHECK_INTERVAL: u64 = 1024;

pub struct Pipeline {
    config: Config,
    default_params: EffectiveParams,
    id_params: HashMap<u32, EffectiveParams>,
    state: StateManager,
    baseline: BaselineEngine,
    chain: DetectorChain,
    alerts: AlertManager,
    memory: MemoryMonitor,

    learning: bool,
    learning_start: Option<f64>,
    learning_end: Option<f64>,
    /// Stream time detection became active: the freeze point, or the
    /// first frame when a persisted baseline was loaded.
    baseline_ready_at: Option<f64>,
    /// One-way flag; set exactly when learning ends.
    baseline_ready: bool,

    frames_processed: u64,
    malformed_frames: u64,
    last_stream_time: f64,
    last_stats_emit: f64,

    shutdown: Arc<AtomicBool>,
    maintenance_rx: Option<Receiver<MaintenanceCmd>>,
}

impl Pipeline {
    /// A pipeline that starts in learning mode.
    pub fn learn(config: Config, alerts: AlertManager) -> Result<Self> {
        let baseline = BaselineEngine::new(config.learning.clone(), config.tamper.clone());
        Self::build(config, baseline, alerts, true)
    }

    /// A pipeline that starts detecting against a loaded baseline.
    pub fn detect(config: Config, baseline: Baseline, alerts: AlertManager) -> Result<Self> {
        let engine =
            BaselineEngine::from_frozen(baseline, config.learning.clone(), config.tamper.clone());
        let mut pipeline = Self::build(config, engine, alerts, false)?;
        pipeline.baseline_ready = true;
        Ok(pipeline)
    }

    fn build(
        config: Config,
        baseline: BaselineEngine,
        alerts: AlertManager,
        learning: bool,
    ) -> Result<Self> {
        let id_params = config.resolve_overrides()?;
        let default_params = config.global_params();
        let chain = DetectorChain::new(
            DropDetector::new(),
            TamperDetector::new(config.learning.clone()),
            ReplayDetector::new(),
            GeneralRulesDetector::new(config.general_rules.detect_unknown_id.clone()),
        );
        let memory = MemoryMonitor::new(config.state.memory_limit_mb);
        Ok(Self {
            state: StateManager::new(config.state.clone()),
            baseline,
            chain,
            alerts,
            memory,
            default_params,
            id_params,
            learning,
            learning_start: None,
            learning_end: None,
            baseline_ready_at: None,
            baseline_ready: !learning,
            frames_processed: 0,
            malformed_frames: 0,
            last_stream_time: 0.0,
            last_stats_emit: 0.0,
            shutdown: Arc::new(AtomicBool::new(false)),
            maintenance_rx: None,
            config,
        })
    }

    /// Handle polled by signal handlers to request a drain-and-exit.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Attach the maintenance command channel.
    pub fn set_maintenance_channel(&mut self, rx: Receiver<MaintenanceCmd>) {
        self.maintenance_rx = Some(rx);
    }

    pub fn phase(&self) -> RunPhase {
        if !self.baseline_ready {
            return RunPhase::Learning;
        }
        let shadow_cfg = &self.config.general_rules.detect_unknown_id;
        let in_shadow = matches!(
            shadow_cfg.learning_mode,
            crate::config::UnknownIdLearningMode::Shadow
        ) && self
            .baseline_ready_at
            .map(|at| self.last_stream_time <= at + shadow_cfg.shadow_duration_sec)
            .unwrap_or(false);
        if in_shadow {
            RunPhase::Shadow
        } else {
            RunPhase::Detecting
        }
    }

    pub fn baseline_ready(&self) -> bool {
        self.baseline_ready
    }

    pub fn frames_processed(&self) -> u64 {
        self.frames_processed
    }

    pub fn baseline_engine(&self) -> &BaselineEngine {
        &self.baseline
    }

    pub fn alert_manager(&self) -> &AlertManager {
        &self.alerts
    }

    /// Drive the pipeline from a source until end-of-stream or
    /// shutdown. Returns the number of frames processed.
    pub fn run<S: FrameSource>(&mut self, source: &mut S) -> Result<u64> {
        let mut source_failures = 0u32;
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                info!("shutdown requested, draining");
                break;
            }
            self.drain_maintenance();

            match source.next_frame() {
                Ok(Some(frame)) => {
                    source_failures = 0;
                    self.process_frame(&frame)?;
                }
                Ok(None) => {
                    if source.is_realtime() && !source.is_exhausted() {
                        // No frame ready; cap busy-wait CPU.
                        std::thread::sleep(IDLE_POLL);
                        continue;
                    }
                    break;
                }
                Err(e) => {
                    if !source.is_realtime() {
                        // Offline sources treat failure as end of
                        // stream.
                        warn!("source failed, treating as end-of-stream: {e}");
                        break;
                    }
                    source_failures += 1;
                    if source_failures > SOURCE_RETRY_LIMIT {
                        error!("source failed {source_failures} times, giving up");
                        return Err(e);
                    }
                    let backoff = IDLE_POLL * 2u32.pow(source_failures);
                    warn!(
                        attempt = source_failures,
                        backoff_ms = backoff.as_millis() as u64,
                        "source failure, backing off: {e}"
                    );
                    std::thread::sleep(backoff);
                }
            }
        }

        self.finish(source)?;
        Ok(self.frames_processed)
    }

    /// Process one frame end to end.
    pub fn process_frame(&mut self, frame: &CanFrame) -> Result<()> {
        self.frames_processed += 1;
        self.last_stream_time = frame.timestamp;

        // Close the learning window before this frame is examined so
        // the transition frame is already subject to detection.
        if self.learning {
            let start = *self.learning_start.get_or_insert(frame.timestamp);
            let window = self.config.learning.initial_learning_window_sec as f64;
            if frame.timestamp >= start + window {
                self.freeze_baseline(frame.timestamp)?;
            }
        } else if self.baseline_ready_at.is_none() {
            // Loaded-baseline run: the shadow window opens at the
            // first frame.
            self.baseline_ready_at = Some(frame.timestamp);
            self.chain.notify_baseline_ready(frame.timestamp);
        }

        let params = self
            .id_params
            .get(&frame.can_id)
            .unwrap_or(&self.default_params);
        let opts = UpdateOptions {
            heartbeat_exempt: params.drop.treat_dlc_zero_as_special && frame.dlc == 0,
            sequence_length: params.replay.sequence_replay_params.sequence_length,
        };
        let state = self.state.update(frame, opts);

        if self.learning {
            self.baseline.observe(frame, state)?;
        } else {
            let alerts = self.chain.run(frame, state, &self.baseline, params);
            for alert in alerts {
                self.alerts.process(alert);
            }
            for can_id in self.chain.drain_pending_baseline_adds() {
                self.baseline.add_untrained(can_id)?;
            }
        }

        if self.frames_processed % MEMORY_CHECK_INTERVAL == 0 {
            self.check_memory(frame.timestamp)?;
        }

        let interval = self.config.stats_interval_sec as f64;
        if interval > 0.0 && frame.timestamp - self.last_stats_emit >= interval {
            self.emit_stats();
            self.last_stats_emit = frame.timestamp;
        }

        Ok(())
    }

    /// Count a frame the source rejected as malformed.
    pub fn note_malformed(&mut self) {
        self.malformed_frames += 1;
    }

    fn freeze_baseline(&mut self, now: f64) -> Result<()> {
        self.baseline.freeze(now)?;
        self.learning = false;
        self.learning_end = Some(now);
        self.baseline_ready_at = Some(now);
        self.baseline_ready = true;
        self.chain.notify_baseline_ready(now);
        info!(at = now, "learning window closed, detection active");
        Ok(())
    }

    fn drain_maintenance(&mut self) {
        let Some(rx) = &self.maintenance_rx else {
            return;
        };
        loop {
            match rx.try_recv() {
                Ok(MaintenanceCmd::Evict) => {
                    debug!("maintenance eviction pass");
                    self.state
                        .evict_stale(self.last_stream_time, self.config.state.eviction_age_sec);
                    self.alerts
                        .forget_before(self.last_stream_time - self.config.state.eviction_age_sec);
                }
                Ok(MaintenanceCmd::Report) => self.emit_stats(),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
    }

    fn check_memory(&mut self, now: f64) -> Result<()> {
        let estimate = self.state.estimated_bytes();
        match self.memory.level(estimate) {
            MemoryLevel::Ok => {}
            MemoryLevel::Soft => {
                warn!("memory above soft threshold, proactive eviction");
                self.state
                    .cleanup_if_pressure(self.config.state.max_tracked_ids / 2, now);
            }
            MemoryLevel::Aggressive => {
                warn!("memory above aggressive threshold");
                self.state
                    .evict_stale(now, self.config.state.eviction_age_sec / 10.0);
                self.state.cleanup_if_pressure(1, now);
            }
            MemoryLevel::Exhausted { used_mb, limit_mb } => {
                return Err(IdsError::MemoryExhausted { used_mb, limit_mb });
            }
        }
        Ok(())
    }

    fn emit_stats(&self) {
        let alert_stats = self.alerts.stats();
        let detector_errors = self.chain.errors();
        info!(
            frames = self.frames_processed,
            malformed = self.malformed_frames,
            tracked_ids = self.state.tracked_ids(),
            phase = ?self.phase(),
            alerts_emitted = alert_stats.emitted,
            alerts_dropped = alert_stats.dropped(),
            sink_errors = alert_stats.sink_errors,
            detector_errors = detector_errors.total(),
            "pipeline stats"
        );
    }

    /// Drain, flush sinks, emit the final stats record.
    fn finish<S: FrameSource>(&mut self, source: &mut S) -> Result<()> {
        // A learning run that hits end-of-stream before the window
        // closes still produces a baseline.
        if self.learning && self.learning_start.is_some() {
            self.freeze_baseline(self.last_stream_time)?;
        }
        source.close()?;
        self.alerts.flush();
        self.emit_stats();
        Ok(())
    }

    /// Persist the frozen baseline.
    pub fn save_baseline<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        persist::save(self.baseline.frozen_baseline()?, path)
    }
}

/// Spawn the low-priority maintenance task.
///
/// Sends `Evict` every `evict_interval` and `Report` every
/// `report_interval`; exits when the shutdown flag is raised or the
/// channel disconnects.
pub fn spawn_maintenance(
    tx: Sender<MaintenanceCmd>,
    evict_interval: Duration,
    report_interval: Duration,
    shutdown: Arc<AtomicBool>,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let tick = Duration::from_millis(200);
        let mut since_evict = Duration::ZERO;
        let mut since_report = Duration::ZERO;
        while !shutdown.load(Ordering::Relaxed) {
            std::thread::sleep(tick);
            since_evict += tick;
            since_report += tick;
            if since_evict >= evict_interval {
                since_evict = Duration::ZERO;
                if tx.send(MaintenanceCmd::Evict).is_err() {
                    return;
                }
            }
            if since_report >= report_interval {
                since_report = Duration::ZERO;
                if tx.send(MaintenanceCmd::Report).is_err() {
                    return;
                }
            }
        }
    })
}
