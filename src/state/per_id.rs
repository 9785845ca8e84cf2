//! Per-ID tracked state.

use std::collections::HashMap;

use crate::config::StateSettings;
use crate::state::ring::{RingBuffer, WindowStats};

/// Everything the detectors may read about one arbitration ID.
///
/// All histories are bounded rings, so a record's memory is O(1).
/// Detectors borrow records read-only; only the state manager writes.
#[derive(Debug)]
pub struct PerIdState {
    pub can_id: u32,
    /// Stream time of the first frame for this ID.
    pub first_seen: f64,
    /// Stream time of the last frame that reset the IAT tracker.
    pub last_timestamp: Option<f64>,
    /// IAT of the current frame, absent on the first frame of an ID,
    /// after a non-monotonic timestamp, or on a heartbeat-exempt frame.
    pub last_iat: Option<f64>,
    /// Sliding IAT statistics.
    pub iat_history: WindowStats,
    /// `(timestamp, payload_hash)` of recent frames.
    pub payload_hash_history: RingBuffer<(f64, u64)>,
    /// Recently observed values per payload position.
    pub byte_history: [RingBuffer<u8>; 8],
    /// Payload hashes of the last frames, for sequence matching.
    pub sequence_buffer: RingBuffer<u64>,
    /// Tuple-hash of trailing windows -> stream time last observed.
    /// Bounded to `sequence_history_cap`.
    pub sequence_history: HashMap<u64, f64>,
    /// When the current trailing window was previously observed, set
    /// during update so detectors can stay read-only.
    pub prev_window_seen: Option<f64>,
    /// Payload of the frame before the current one.
    pub prev_payload: Option<([u8; 8], u8)>,
    /// Payload of the current frame.
    pub last_payload: Option<([u8; 8], u8)>,
    /// Total frames seen for this ID.
    pub frame_count: u64,
    /// Stream time this ID was last seen at all (heartbeats included);
    /// drives eviction.
    pub last_active: f64,
}

impl PerIdState {
    pub fn new(can_id: u32, timestamp: f64, settings: &StateSettings) -> Self {
        Self {
            can_id,
            first_seen: timestamp,
            last_timestamp: None,
            last_iat: None,
            iat_history: WindowStats::new(settings.iat_history_cap),
            payload_hash_history: RingBuffer::new(settings.payload_hash_history_cap),
            byte_history: std::array::from_fn(|_| RingBuffer::new(settings.byte_history_cap)),
            sequence_buffer: RingBuffer::new(settings.sequence_buffer_cap),
            sequence_history: HashMap::new(),
            prev_window_seen: None,
            prev_payload: None,
            last_payload: None,
            frame_count: 0,
            last_active: timestamp,
        }
    }

    /// Payload hashes observed within `window_sec` of `now`, current
    /// frame included.
    pub fn hashes_within(&self, now: f64, window_sec: f64) -> impl Iterator<Item = u64> + '_ {
        let cutoff = now - window_sec;
        self.payload_hash_history
            .iter()
            .filter(move |(ts, _)| *ts > cutoff)
            .map(|(_, h)| *h)
    }

    /// Byte value at `position` in the previous frame, if it carried one.
    pub fn prev_byte(&self, position: usize) -> Option<u8> {
        let (bytes, dlc) = self.prev_payload?;
        if position < dlc as usize {
            Some(bytes[position])
        } else {
            None
        }
    }

    /// Rough per-record heap footprint, for memory pressure estimates.
    pub fn estimated_bytes(&self) -> usize {
        let rings = self.iat_history.len() * 8
            + self.payload_hash_history.len() * 16
            + self.byte_history.iter().map(|r| r.len()).sum::<usize>()
            + self.sequence_buffer.len() * 8
            + self.sequence_history.len() * 16;
        std::mem::size_of::<Self>() + rings
    }
}
