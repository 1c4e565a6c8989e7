//! Gapless playback scheduling
//!
//! Keeps a virtual timeline on the sink's clock. Each decoded buffer starts
//! exactly where the previous one ends, or at the current device time if the
//! timeline has fallen behind, so network jitter never produces gaps or
//! overlaps. An interruption cuts everything off and rewinds the timeline.

use std::collections::HashSet;

use super::audio::PlaybackBuffer;
use super::device::{BufferId, PlaybackSink};
use crate::Result;

/// Where a buffer landed on the timeline
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledBuffer {
    pub id: BufferId,
    pub start: f64,
    pub duration: f64,
}

/// Back-to-back scheduler over a [`PlaybackSink`]
///
/// All mutation goes through `&mut self`, so scheduling and interruption are
/// serialized by whoever owns the scheduler.
pub struct PlaybackScheduler {
    sink: Box<dyn PlaybackSink>,
    next_start_time: f64,
    active: HashSet<BufferId>,
    next_id: BufferId,
}

impl PlaybackScheduler {
    /// Wrap an opened sink
    #[must_use]
    pub fn new(sink: Box<dyn PlaybackSink>) -> Self {
        Self {
            sink,
            next_start_time: 0.0,
            active: HashSet::new(),
            next_id: 0,
        }
    }

    /// Queue a buffer directly after everything already scheduled
    ///
    /// # Errors
    ///
    /// Returns error if the sink rejects the buffer; the timeline is unchanged
    pub fn schedule(&mut self, buffer: PlaybackBuffer) -> Result<ScheduledBuffer> {
        let now = self.sink.current_time();
        let start = self.next_start_time.max(now);
        let duration = buffer.duration();
        let id = self.next_id;

        self.sink.start(id, buffer, start)?;

        self.next_id += 1;
        self.next_start_time = start + duration;
        self.active.insert(id);

        tracing::trace!(id, start, duration, "buffer scheduled");
        Ok(ScheduledBuffer {
            id,
            start,
            duration,
        })
    }

    /// Stop every pending or playing buffer and rewind the timeline
    ///
    /// Returns the number of buffers cut off.
    pub fn interrupt(&mut self) -> usize {
        let stopped = self.active.len();
        for id in self.active.drain() {
            self.sink.stop(id);
        }
        self.next_start_time = 0.0;
        tracing::debug!(stopped, "playback interrupted");
        stopped
    }

    /// Record that a buffer finished on its own
    ///
    /// Returns false for buffers already stopped by an interruption.
    pub fn complete(&mut self, id: BufferId) -> bool {
        self.active.remove(&id)
    }

    /// Virtual time at which the next buffer would start (0 after an interrupt)
    #[must_use]
    pub const fn next_start_time(&self) -> f64 {
        self.next_start_time
    }

    /// Number of buffers currently pending or playing
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Current device clock
    #[must_use]
    pub fn current_time(&self) -> f64 {
        self.sink.current_time()
    }

    /// Stop everything and release the sink
    pub fn close(&mut self) {
        self.interrupt();
        self.sink.close();
    }
}
