//! Playback scheduler (jitter buffer) for the downlink audio stream.
//!
//! Decoded chunks arrive whenever the network delivers them; the output
//! device consumes them in real time. The scheduler reconciles the two by
//! keeping a `next_start` cursor on the output clock's timeline: chunks
//! are laid out back-to-back from that cursor, and the cursor is slid
//! forward to `now + MIN_LOOKAHEAD` whenever playback has fallen behind,
//! so nothing is ever scheduled into the past.
//!
//! `flush()` is the barge-in primitive: every chunk that has not finished
//! playing is cancelled (mid-chunk if necessary) and the cursor re-anchors.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use super::clock::OutputClock;

/// Scheduling margin between "now" and the next planned start, absorbs
/// host-timing jitter in steady state.
pub const MIN_LOOKAHEAD: Duration = Duration::from_millis(50);
/// Larger margin used when a session activates, absorbs
/// connection-establishment jitter.
pub const STARTUP_LOOKAHEAD: Duration = Duration::from_millis(100);

pub type ChunkId = u64;

/// A playback unit the scheduler has handed to the sink but not yet
/// confirmed finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledChunk {
    pub id: ChunkId,
    pub planned_start: Duration,
    pub duration: Duration,
}

impl ScheduledChunk {
    fn end(&self) -> Duration {
        self.planned_start + self.duration
    }
}

/// Output-device seam. The real implementation writes to ALSA from a
/// dedicated thread; tests record calls.
pub trait PlaybackSink: Send {
    /// Begin playing `samples` exactly at `start` on the output clock.
    fn start_at(&mut self, id: ChunkId, samples: Vec<f32>, start: Duration);

    /// Stop a chunk, mid-sample if it is currently playing.
    /// Cancelling an unknown or already-finished chunk is a no-op.
    fn cancel(&mut self, id: ChunkId);
}

pub struct PlaybackScheduler {
    clock: Arc<dyn OutputClock>,
    sink: Box<dyn PlaybackSink>,
    sample_rate: u32,
    next_start: Duration,
    pending: VecDeque<ScheduledChunk>,
    active: bool,
    next_id: ChunkId,
}

impl PlaybackScheduler {
    pub fn new(clock: Arc<dyn OutputClock>, sink: Box<dyn PlaybackSink>, sample_rate: u32) -> Self {
        Self {
            clock,
            sink,
            sample_rate,
            next_start: Duration::ZERO,
            pending: VecDeque::new(),
            active: false,
            next_id: 0,
        }
    }

    /// Accept chunks; re-anchor the start cursor with the startup margin.
    pub fn activate(&mut self) {
        self.active = true;
        self.next_start = self.clock.now() + STARTUP_LOOKAHEAD;
        log::debug!("scheduler active, first start at {:?}", self.next_start);
    }

    /// Stop accepting chunks and flush whatever is queued. Chunks that
    /// arrive after this are discarded, never played.
    pub fn deactivate(&mut self) {
        self.active = false;
        self.flush();
    }

    /// Queue one decoded chunk for gapless playback after everything
    /// already queued.
    pub fn schedule(&mut self, samples: Vec<f32>) {
        if !self.active {
            log::trace!("dropping {} samples, scheduler inactive", samples.len());
            return;
        }
        self.reap_finished();

        let duration = Duration::from_secs_f64(samples.len() as f64 / self.sample_rate as f64);

        // Jitter absorption: if playback fell behind (or this is the first
        // chunk after a stall), slide forward instead of scheduling into
        // the past.
        let min_start = self.clock.now() + MIN_LOOKAHEAD;
        if self.next_start < min_start {
            self.next_start = min_start;
        }

        let chunk = ScheduledChunk {
            id: self.next_id,
            planned_start: self.next_start,
            duration,
        };
        self.next_id += 1;

        self.sink.start_at(chunk.id, samples, chunk.planned_start);
        self.pending.push_back(chunk);
        self.next_start += duration;
    }

    /// Cancel every chunk that has not finished playing and re-anchor the
    /// cursor. Flushing an empty scheduler is a no-op apart from the
    /// re-anchor.
    pub fn flush(&mut self) {
        self.reap_finished();
        if !self.pending.is_empty() {
            log::debug!("flushing {} pending chunks", self.pending.len());
        }
        while let Some(chunk) = self.pending.pop_front() {
            self.sink.cancel(chunk.id);
        }
        self.next_start = self.clock.now() + MIN_LOOKAHEAD;
    }

    /// Drop chunks whose playback window has fully elapsed; they no
    /// longer need cancelling.
    fn reap_finished(&mut self) {
        let now = self.clock.now();
        while matches!(self.pending.front(), Some(c) if c.end() <= now) {
            self.pending.pop_front();
        }
    }

    #[cfg(test)]
    fn pending_len(&mut self) -> usize {
        self.reap_finished();
        self.pending.len()
    }

    #[cfg(test)]
    fn next_start(&self) -> Duration {
        self.next_start
    }
}
