//! Per-ID state tracking.
//!
//! Maintains a bounded table of [`PerIdState`] records, one per
//! observed arbitration ID. The hot-path `update` is O(1); memory is
//! bounded by the tracked-ID ceiling and the per-record ring caps.

pub mod per_id;
pub mod ring;

use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use tracing::{debug, info, warn};

use crate::config::StateSettings;
use crate::types::CanFrame;
pub use per_id::PerIdState;
pub use ring::{RingBuffer, Welford, WindowStats};

/// Knobs that vary per frame rather than per manager.
#[derive(Debug, Clone, Copy)]
pub struct UpdateOptions {
    /// DLC=0 heartbeat frames leave the IAT tracker untouched.
    pub heartbeat_exempt: bool,
    /// Trailing-window length for sequence matching.
    pub sequence_length: usize,
}

/// Counters accumulated over a run.
#[derive(Debug, Clone, Default)]
pub struct StateStats {
    pub updates: u64,
    pub states_created: u64,
    pub evictions: u64,
    pub pressure_cleanups: u64,
}

/// Table of per-ID records with bounded memory.
pub struct StateManager {
    settings: StateSettings,
    states: HashMap<u32, PerIdState>,
    last_cleanup: f64,
    stats: StateStats,
}

impl StateManager {
    pub fn new(settings: StateSettings) -> Self {
        info!(
            max_tracked_ids = settings.max_tracked_ids,
            eviction_age_sec = settings.eviction_age_sec,
            "initializing state manager"
        );
        Self {
            states: HashMap::new(),
            last_cleanup: 0.0,
            stats: StateStats::default(),
            settings,
        }
    }

    /// Fold a frame into its ID's record and return the updated view.
    ///
    /// Never fails and never drops the frame; when the tracked set is
    /// full it evicts first and then proceeds.
    pub fn update(&mut self, frame: &CanFrame, opts: UpdateOptions) -> &PerIdState {
        let now = frame.timestamp;
        self.stats.updates += 1;

        if !self.states.contains_key(&frame.can_id) {
            if self.states.len() >= self.settings.max_tracked_ids {
                self.cleanup_if_pressure(self.settings.max_tracked_ids, now);
            }
            self.states.insert(
                frame.can_id,
                PerIdState::new(frame.can_id, now, &self.settings),
            );
            self.stats.states_created += 1;
            debug!(can_id = format_args!("{:#x}", frame.can_id), "tracking new ID");
        }

        // Cadence cleanup rides on stream time.
        if now - self.last_cleanup > self.settings.cleanup_interval_sec {
            self.evict_stale(now, self.settings.eviction_age_sec);
            self.last_cleanup = now;
        }

        let seq_cap = self.settings.sequence_history_cap;
        let state = self
            .states
            .get_mut(&frame.can_id)
            .expect("record exists after insert");

        state.frame_count += 1;
        state.last_active = now;

        if opts.heartbeat_exempt {
            // Heartbeat frames carry no IAT of their own and do not
            // reset the tracker for the real traffic behind them.
            state.last_iat = None;
        } else {
            match state.last_timestamp {
                Some(prev) if prev < now => {
                    let iat = now - prev;
                    state.last_iat = Some(iat);
                    state.iat_history.push(iat);
                }
                _ => state.last_iat = None,
            }
            state.last_timestamp = Some(now);
        }

        let hash = frame.payload_hash();
        state.payload_hash_history.push((now, hash));

        for (pos, &byte) in frame.payload().iter().enumerate() {
            state.byte_history[pos].push(byte);
        }

        state.prev_payload = state.last_payload.take();
        let mut bytes = [0u8; 8];
        bytes[..frame.payload().len()].copy_from_slice(frame.payload());
        state.last_payload = Some((bytes, frame.dlc));

        state.sequence_buffer.push(hash);
        state.prev_window_seen = None;
        if state.sequence_buffer.len() >= opts.sequence_length {
            let window_hash = tuple_hash(state.sequence_buffer.tail(opts.sequence_length));
            state.prev_window_seen = state.sequence_history.get(&window_hash).copied();
            if state.sequence_history.len() >= seq_cap
                && !state.sequence_history.contains_key(&window_hash)
            {
                // Make room by dropping the stalest window.
                if let Some(oldest) = state
                    .sequence_history
                    .iter()
                    .min_by(|a, b| a.1.total_cmp(b.1))
                    .map(|(k, _)| *k)
                {
                    state.sequence_history.remove(&oldest);
                }
            }
            state.sequence_history.insert(window_hash, now);
        }

        state
    }

    /// Read-only lookup.
    pub fn get(&self, can_id: u32) -> Option<&PerIdState> {
        self.states.get(&can_id)
    }

    /// Remove records unseen for longer than `max_age`, and prune
    /// per-record sequence windows past their useful age.
    pub fn evict_stale(&mut self, now: f64, max_age: f64) {
        let before = self.states.len();
        self.states.retain(|_, s| s.last_active >= now - max_age);
        let evicted = before - self.states.len();
        if evicted > 0 {
            self.stats.evictions += evicted as u64;
            debug!(evicted, remaining = self.states.len(), "evicted stale IDs");
        }

        let window_cutoff = now - max_age;
        for state in self.states.values_mut() {
            state.sequence_history.retain(|_, ts| *ts > window_cutoff);
            state
                .payload_hash_history
                .drain_front_while(|(ts, _)| *ts < window_cutoff);
        }
    }

    /// Evict the oldest 25% of records by last-seen when the tracked
    /// set exceeds `soft_limit`; IDs active within the last second are
    /// always preserved.
    pub fn cleanup_if_pressure(&mut self, soft_limit: usize, now: f64) {
        if self.states.len() < soft_limit {
            return;
        }
        self.stats.pressure_cleanups += 1;

        let mut by_age: Vec<(u32, f64)> = self
            .states
            .iter()
            .map(|(id, s)| (*id, s.last_active))
            .collect();
        by_age.sort_by(|a, b| a.1.total_cmp(&b.1));

        let target = (self.states.len() / 4).max(1);
        let recent_cutoff = now - 1.0;
        let mut evicted = 0;
        for (id, last_active) in by_age {
            if evicted >= target {
                break;
            }
            if last_active >= recent_cutoff {
                // The list is age-sorted; everything after is recent too.
                break;
            }
            self.states.remove(&id);
            evicted += 1;
        }
        self.stats.evictions += evicted as u64;
        warn!(
            evicted,
            remaining = self.states.len(),
            "memory pressure cleanup"
        );
    }

    pub fn tracked_ids(&self) -> usize {
        self.states.len()
    }

    pub fn stats(&self) -> &StateStats {
        &self.stats
    }

    /// Deterministic estimate of tracked-state heap usage.
    pub fn estimated_bytes(&self) -> usize {
        self.states.values().map(|s| s.estimated_bytes()).sum()
    }
}

/// Order-sensitive 64-bit hash of a hash-window.
fn tuple_hash<'a>(window: impl Iterator<Item = &'a u64>) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    for h in window {
        h.hash(&mut hasher);
    }
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(ts: f64, id: u32, payload: &[u8]) -> CanFrame {
        CanFrame::new(ts, id, payload).unwrap()
    }

    fn opts() -> UpdateOptions {
        UpdateOptions {
            heartbeat_exempt: false,
            sequence_length: 3,
        }
    }

    #[test]
    fn test_first_frame_has_no_iat() {
        let mut mgr = StateManager::new(StateSettings::default());
        let state = mgr.update(&frame(1.0, 0x100, &[1, 2]), opts());
        assert_eq!(state.frame_count, 1);
        assert!(state.last_iat.is_none());
    }

    #[test]
    fn test_iat_tracking() {
        let mut mgr = StateManager::new(StateSettings::default());
        mgr.update(&frame(1.00, 0x100, &[1]), opts());
        let state = mgr.update(&frame(1.01, 0x100, &[1]), opts());
        assert!((state.last_iat.unwrap() - 0.01).abs() < 1e-9);
        assert_eq!(state.iat_history.len(), 1);
    }

    #[test]
    fn test_heartbeat_does_not_reset_iat_tracker() {
        let mut mgr = StateManager::new(StateSettings::default());
        mgr.update(&frame(1.00, 0x100, &[1]), opts());
        let hb = UpdateOptions {
            heartbeat_exempt: true,
            ..opts()
        };
        let state = mgr.update(&frame(1.50, 0x100, &[]), hb);
        assert!(state.last_iat.is_none());
        assert_eq!(state.last_timestamp, Some(1.00));

        // The next real frame measures against the pre-heartbeat time.
        let state = mgr.update(&frame(2.00, 0x100, &[1]), opts());
        assert!((state.last_iat.unwrap() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_non_monotonic_timestamp_yields_no_iat() {
        let mut mgr = StateManager::new(StateSettings::default());
        mgr.update(&frame(2.0, 0x100, &[1]), opts());
        let state = mgr.update(&frame(1.5, 0x100, &[1]), opts());
        assert!(state.last_iat.is_none());
    }

    #[test]
    fn test_byte_history_per_position() {
        let mut mgr = StateManager::new(StateSettings::default());
        mgr.update(&frame(1.0, 0x100, &[0xAA, 0x01]), opts());
        let state = mgr.update(&frame(1.1, 0x100, &[0xAA, 0x02]), opts());
        assert_eq!(state.byte_history[0].len(), 2);
        assert_eq!(state.byte_history[1].len(), 2);
        assert_eq!(state.byte_history[2].len(), 0);
        assert_eq!(state.prev_byte(1), Some(0x01));
    }

    #[test]
    fn test_sequence_window_reobservation() {
        let mut mgr = StateManager::new(StateSettings::default());
        let payloads: [&[u8]; 3] = [&[1], &[2], &[3]];
        let mut ts = 0.0;
        for p in payloads {
            ts += 0.01;
            mgr.update(&frame(ts, 0x100, p), opts());
        }
        assert!(mgr.get(0x100).unwrap().prev_window_seen.is_none());
        let first_window_ts = ts;

        // Replay the same three payloads later.
        ts = 10.0;
        for p in payloads {
            ts += 0.01;
            mgr.update(&frame(ts, 0x100, p), opts());
        }
        let seen = mgr.get(0x100).unwrap().prev_window_seen.unwrap();
        assert!((seen - first_window_ts).abs() < 1e-9);
    }

    #[test]
    fn test_evict_stale() {
        let mut mgr = StateManager::new(StateSettings::default());
        mgr.update(&frame(1.0, 0x100, &[1]), opts());
        mgr.update(&frame(500.0, 0x200, &[1]), opts());
        mgr.evict_stale(500.0, 100.0);
        assert!(mgr.get(0x100).is_none());
        assert!(mgr.get(0x200).is_some());
    }

    #[test]
    fn test_pressure_cleanup_preserves_recent() {
        let settings = StateSettings {
            max_tracked_ids: 8,
            ..StateSettings::default()
        };
        let mut mgr = StateManager::new(settings);
        for i in 0..8u32 {
            mgr.update(&frame(i as f64, 0x100 + i, &[1]), opts());
        }
        // Forcing a ninth ID triggers the 25% pressure sweep.
        mgr.update(&frame(8.0, 0x999, &[1]), opts());
        assert!(mgr.tracked_ids() <= 8);
        assert!(mgr.get(0x999).is_some());
        // Oldest ID went first.
        assert!(mgr.get(0x100).is_none());
    }

    #[test]
    fn test_memory_is_bounded_per_id() {
        let settings = StateSettings {
            iat_history_cap: 10,
            payload_hash_history_cap: 10,
            byte_history_cap: 10,
            sequence_buffer_cap: 5,
            sequence_history_cap: 10,
            ..StateSettings::default()
        };
        let mut mgr = StateManager::new(settings);
        for i in 0..10_000 {
            let ts = i as f64 * 0.01;
            mgr.update(&frame(ts, 0x100, &[(i % 256) as u8, 0xFF]), opts());
        }
        let state = mgr.get(0x100).unwrap();
        assert_eq!(state.iat_history.len(), 10);
        assert_eq!(state.payload_hash_history.len(), 10);
        assert!(state.sequence_history.len() <= 10);
        assert_eq!(state.frame_count, 10_000);
    }
}
