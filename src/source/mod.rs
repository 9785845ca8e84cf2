//! Frame sources.
//!
//! A source yields timestamped frames; `None` means end-of-stream for
//! offline sources and no-data-yet for real-time ones. The pipeline
//! never blocks inside a source: real-time pacing returns control so
//! the read loop can yield.

pub mod trace;

use std::time::Instant;

use crate::error::Result;
use crate::types::CanFrame;
pub use trace::TraceFileSource;

pub trait FrameSource {
    /// The next frame, or `None` (end-of-stream when offline,
    /// no-data-yet when real-time).
    fn next_frame(&mut self) -> Result<Option<CanFrame>>;

    /// Release underlying resources.
    fn close(&mut self) -> Result<()>;

    /// Real-time sources may return `None` before end-of-stream; the
    /// read loop yields 1 ms between polls for them.
    fn is_realtime(&self) -> bool {
        false
    }

    /// True once the source cannot produce further frames.
    fn is_exhausted(&self) -> bool;
}

/// In-memory source over a prepared frame sequence.
///
/// Used by tests and by callers that feed frames programmatically.
pub struct MemorySource {
    frames: std::collections::VecDeque<CanFrame>,
}

impl MemorySource {
    pub fn new(frames: impl IntoIterator<Item = CanFrame>) -> Self {
        Self {
            frames: frames.into_iter().collect(),
        }
    }
}

impl FrameSource for MemorySource {
    fn next_frame(&mut self) -> Result<Option<CanFrame>> {
        Ok(self.frames.pop_front())
    }

    fn close(&mut self) -> Result<()> {
        self.frames.clear();
        Ok(())
    }

    fn is_exhausted(&self) -> bool {
        self.frames.is_empty()
    }
}

/// Replays an offline trace at its recorded cadence.
///
/// Wall-clock pacing makes an offline capture behave like a live bus:
/// a frame is released only once its timestamp offset has elapsed.
pub struct PacedReplaySource<S: FrameSource> {
    inner: S,
    started: Option<(Instant, f64)>,
    pending: Option<CanFrame>,
    exhausted: bool,
}

impl<S: FrameSource> PacedReplaySource<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            started: None,
            pending: None,
            exhausted: false,
        }
    }
}

impl<S: FrameSource> FrameSource for PacedReplaySource<S> {
    fn next_frame(&mut self) -> Result<Option<CanFrame>> {
        if self.exhausted {
            return Ok(None);
        }
        if self.pending.is_none() {
            match self.inner.next_frame()? {
                Some(frame) => self.pending = Some(frame),
                None => {
                    self.exhausted = true;
                    return Ok(None);
                }
            }
        }

        let frame = self.pending.as_ref().expect("pending frame present");
        let (epoch, first_ts) = *self
            .started
            .get_or_insert_with(|| (Instant::now(), frame.timestamp));
        let due = frame.timestamp - first_ts;
        if epoch.elapsed().as_secs_f64() >= due {
            Ok(self.pending.take())
        } else {
            // Not due yet; the caller yields and polls again.
            Ok(None)
        }
    }

    fn close(&mut self) -> Result<()> {
        self.inner.close()
    }

    fn is_realtime(&self) -> bool {
        true
    }

    fn is_exhausted(&self) -> bool {
        self.exhausted
    }
}
