//! Offline CAN trace parsing.
//!
//! Two line layouts are recognized:
//!
//! ```text
//! Timestamp:          0.000271        ID: 0080    000    DLC: 8    00 17 dc 09 16 11 16 bb
//! (1698765432.123456) can0 316#05200A
//! ```
//!
//! Malformed lines are counted and skipped; they never abort the
//! stream and never produce an alert.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use tracing::{info, warn};

use crate::error::{IdsError, Result};
use crate::types::CanFrame;

use super::FrameSource;

/// Parser statistics, reported at end of stream.
#[derive(Debug, Clone, Copy, Default)]
pub struct TraceStats {
    pub lines: u64,
    pub parsed: u64,
    pub malformed: u64,
}

pub struct TraceFileSource {
    reader: Option<BufReader<File>>,
    stats: TraceStats,
}

impl TraceFileSource {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref()).map_err(|e| {
            IdsError::Source(format!("cannot open {}: {e}", path.as_ref().display()))
        })?;
        info!(path = %path.as_ref().display(), "opened trace file");
        Ok(Self {
            reader: Some(BufReader::new(file)),
            stats: TraceStats::default(),
        })
    }

    pub fn stats(&self) -> TraceStats {
        self.stats
    }
}

impl FrameSource for TraceFileSource {
    fn next_frame(&mut self) -> Result<Option<CanFrame>> {
        let Some(reader) = self.reader.as_mut() else {
            return Ok(None);
        };
        let mut line = String::new();
        loop {
            line.clear();
            let read = reader
                .read_line(&mut line)
                .map_err(|e| IdsError::Source(format!("trace read: {e}")))?;
            if read == 0 {
                info!(
                    lines = self.stats.lines,
                    parsed = self.stats.parsed,
                    malformed = self.stats.malformed,
                    "trace exhausted"
                );
                self.reader = None;
                return Ok(None);
            }
            self.stats.lines += 1;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            match parse_trace_line(trimmed) {
                Ok(frame) => {
                    self.stats.parsed += 1;
                    return Ok(Some(frame));
                }
                Err(e) => {
                    self.stats.malformed += 1;
                    warn!(line = self.stats.lines, "skipping malformed line: {e}");
                }
            }
        }
    }

    fn close(&mut self) -> Result<()> {
        self.reader = None;
        Ok(())
    }

    fn is_exhausted(&self) -> bool {
        self.reader.is_none()
    }
}

/// Parse one trace line in either recognized layout.
pub fn parse_trace_line(line: &str) -> Result<CanFrame> {
    if line.starts_with('(') {
        parse_candump_line(line)
    } else if line.starts_with("Timestamp:") {
        parse_columnar_line(line)
    } else {
        Err(IdsError::MalformedFrame(format!(
            "unrecognized trace layout: {line:?}"
        )))
    }
}

/// `(1698765432.123456) can0 316#05200A00` candump log layout.
fn parse_candump_line(line: &str) -> Result<CanFrame> {
    let malformed = |what: &str| IdsError::MalformedFrame(format!("{what} in {line:?}"));

    let close = line.find(')').ok_or_else(|| malformed("unterminated timestamp"))?;
    let timestamp: f64 = line[1..close]
        .parse()
        .map_err(|_| malformed("bad timestamp"))?;

    let rest = line[close + 1..].trim_start();
    // Skip the interface column.
    let (_, frame_part) = rest
        .split_once(char::is_whitespace)
        .ok_or_else(|| malformed("missing frame column"))?;
    let (id_part, data_part) = frame_part
        .trim()
        .split_once('#')
        .ok_or_else(|| malformed("missing '#' separator"))?;

    let can_id =
        u32::from_str_radix(id_part, 16).map_err(|_| malformed("bad arbitration ID"))?;
    let payload = parse_hex_bytes(data_part)
        .ok_or_else(|| malformed("bad payload hex"))?;
    CanFrame::new(timestamp, can_id, &payload)
}

/// `Timestamp: <ts> ID: <hex> <flags> DLC: <n> <hex bytes>` layout.
fn parse_columnar_line(line: &str) -> Result<CanFrame> {
    let malformed = |what: &str| IdsError::MalformedFrame(format!("{what} in {line:?}"));

    let mut tokens = line.split_whitespace();
    if tokens.next() != Some("Timestamp:") {
        return Err(malformed("missing Timestamp column"));
    }
    let timestamp: f64 = tokens
        .next()
        .ok_or_else(|| malformed("missing timestamp"))?
        .parse()
        .map_err(|_| malformed("bad timestamp"))?;
    if tokens.next() != Some("ID:") {
        return Err(malformed("missing ID column"));
    }
    let id_token = tokens.next().ok_or_else(|| malformed("missing ID"))?;
    // Some capture tools tag injected frames; the tag is not part of
    // the arbitration ID.
    let id_token = id_token.strip_suffix("ATK").unwrap_or(id_token);
    let can_id = u32::from_str_radix(id_token, 16).map_err(|_| malformed("bad ID"))?;

    // Flags column between ID and DLC.
    tokens.next().ok_or_else(|| malformed("missing flags column"))?;
    if tokens.next() != Some("DLC:") {
        return Err(malformed("missing DLC column"));
    }
    let dlc: u8 = tokens
        .next()
        .ok_or_else(|| malformed("missing DLC"))?
        .parse()
        .map_err(|_| malformed("bad DLC"))?;

    let mut payload = Vec::with_capacity(dlc as usize);
    for token in tokens {
        let byte = u8::from_str_radix(token, 16).map_err(|_| malformed("bad payload byte"))?;
        payload.push(byte);
    }
    CanFrame::with_dlc(timestamp, can_id, dlc, &payload)
}

fn parse_hex_bytes(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).ok())
        .collect()
}
