//! audio - PCM wire codec, capture pipeline, and playback scheduling.
//!
//! Uses ALSA for audio I/O; capture and playback each run on a dedicated
//! OS thread while the scheduler itself is plain synchronous state driven
//! by the session's event loop.

mod alsa_device;
pub mod capture;
pub mod clock;
pub mod pcm;
pub mod scheduler;
mod sink;

use std::sync::Arc;

use anyhow::Result;

use capture::{CaptureHandle, CapturePipeline};
use clock::OutputClock;
use scheduler::PlaybackSink;
use sink::AlsaSink;

use crate::config::{CAPTURE_SAMPLE_RATE, PLAYBACK_SAMPLE_RATE};

/// Acquisition seam over the audio hardware, so the session state
/// machine is testable without a sound card.
pub trait AudioBackend: Send {
    /// Acquire the playback device and return a sink bound to `clock`.
    fn open_sink(&mut self, clock: Arc<dyn OutputClock>) -> Result<Box<dyn PlaybackSink>>;

    /// Acquire the capture device and start feeding `pipeline`.
    fn start_capture(&mut self, pipeline: CapturePipeline) -> Result<CaptureHandle>;
}

/// The real ALSA backend.
pub struct AlsaBackend {
    capture_device: String,
    playback_device: String,
}

impl AlsaBackend {
    pub fn new(capture_device: &str, playback_device: &str) -> Self {
        Self {
            capture_device: capture_device.to_string(),
            playback_device: playback_device.to_string(),
        }
    }
}

impl AudioBackend for AlsaBackend {
    fn open_sink(&mut self, clock: Arc<dyn OutputClock>) -> Result<Box<dyn PlaybackSink>> {
        let sink = AlsaSink::open(&self.playback_device, PLAYBACK_SAMPLE_RATE, clock)?;
        Ok(Box::new(sink))
    }

    fn start_capture(&mut self, pipeline: CapturePipeline) -> Result<CaptureHandle> {
        capture::start_capture(&self.capture_device, CAPTURE_SAMPLE_RATE, pipeline)
    }
}
