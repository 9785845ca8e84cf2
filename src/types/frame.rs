//! CAN frame value type.
//!
//! A frame is immutable once constructed. Validation happens at
//! construction so the rest of the pipeline never sees a frame whose
//! DLC disagrees with its payload or whose arbitration ID is out of
//! range.

use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::error::{IdsError, Result};

/// Largest valid 29-bit extended arbitration ID.
pub const MAX_EXTENDED_ID: u32 = 0x1FFF_FFFF;

/// Largest valid 11-bit standard arbitration ID.
pub const MAX_STANDARD_ID: u32 = 0x7FF;

/// A single classical CAN frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CanFrame {
    /// Capture time in seconds, monotonically non-decreasing across
    /// the stream.
    pub timestamp: f64,
    /// 11- or 29-bit arbitration ID.
    pub can_id: u32,
    /// Data length code, 0-8.
    pub dlc: u8,
    /// Payload bytes; only the first `dlc` are meaningful.
    payload: [u8; 8],
}

impl CanFrame {
    /// Build a frame, validating ID range and DLC/payload agreement.
    pub fn new(timestamp: f64, can_id: u32, payload: &[u8]) -> Result<Self> {
        if can_id > MAX_EXTENDED_ID {
            return Err(IdsError::MalformedFrame(format!(
                "arbitration ID {can_id:#x} exceeds 29 bits"
            )));
        }
        if payload.len() > 8 {
            return Err(IdsError::MalformedFrame(format!(
                "payload of {} bytes exceeds classical CAN limit",
                payload.len()
            )));
        }
        if !timestamp.is_finite() || timestamp < 0.0 {
            return Err(IdsError::MalformedFrame(format!(
                "invalid timestamp {timestamp}"
            )));
        }
        let mut bytes = [0u8; 8];
        bytes[..payload.len()].copy_from_slice(payload);
        Ok(Self {
            timestamp,
            can_id,
            dlc: payload.len() as u8,
            payload: bytes,
        })
    }

    /// Build a frame with an explicit DLC; rejects DLC/payload mismatch.
    pub fn with_dlc(timestamp: f64, can_id: u32, dlc: u8, payload: &[u8]) -> Result<Self> {
        if dlc as usize != payload.len() {
            return Err(IdsError::MalformedFrame(format!(
                "DLC {dlc} disagrees with payload of {} bytes",
                payload.len()
            )));
        }
        Self::new(timestamp, can_id, payload)
    }

    /// The meaningful payload bytes.
    pub fn payload(&self) -> &[u8] {
        &self.payload[..self.dlc as usize]
    }

    /// True when the arbitration ID fits the 11-bit standard format.
    pub fn is_standard_id(&self) -> bool {
        self.can_id <= MAX_STANDARD_ID
    }

    /// 64-bit hash over `(dlc, payload)`.
    ///
    /// Only used as an equality key within short time windows, so
    /// the default SipHash collision rate is acceptable.
    pub fn payload_hash(&self) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.dlc.hash(&mut hasher);
        self.payload().hash(&mut hasher);
        hasher.finish()
    }

    /// Shannon entropy of the payload byte distribution, in bits.
    ///
    /// Range [0, 8] for classical CAN payloads. Empty payloads score 0.
    pub fn payload_entropy(&self) -> f64 {
        payload_entropy(self.payload())
    }
}

impl std::fmt::Display for CanFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "({:.6}) {:03X}#{}",
            self.timestamp,
            self.can_id,
            self.payload()
                .iter()
                .map(|b| format!("{b:02X}"))
                .collect::<String>()
        )
    }
}

/// Shannon entropy (log base 2) of a byte slice's value distribution.
pub fn payload_entropy(bytes: &[u8]) -> f64 {
    if bytes.is_empty() {
        return 0.0;
    }
    let mut counts = [0u32; 256];
    for &b in bytes {
        counts[b as usize] += 1;
    }
    let n = bytes.len() as f64;
    counts
        .iter()
        .filter(|&&c| c > 0)
        .map(|&c| {
            let p = c as f64 / n;
            -p * p.log2()
        })
        .sum()
}
