//! Capture pipeline: mic device → fixed-size blocks → wire frames → uplink.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::thread::{self, JoinHandle};

use anyhow::Result;
use tokio::sync::mpsc;

use super::alsa_device;
use super::pcm;
use crate::net_link::NetCommand;

/// Bridges the continuous device sample stream into discrete fixed-size
/// wire frames.
///
/// Frames produced while the link is closed are dropped, never queued:
/// stale microphone audio is worthless and a backlog on a live mic feed
/// only adds latency once the link comes back.
pub struct CapturePipeline {
    block: Vec<f32>,
    block_size: usize,
    link_open: Arc<AtomicBool>,
    net_tx: mpsc::Sender<NetCommand>,
}

impl CapturePipeline {
    pub fn new(
        block_size: usize,
        link_open: Arc<AtomicBool>,
        net_tx: mpsc::Sender<NetCommand>,
    ) -> Self {
        Self {
            block: Vec::with_capacity(block_size),
            block_size,
            link_open,
            net_tx,
        }
    }

    /// Accumulate device samples; encode and forward each complete block.
    /// Returns the number of frames forwarded to the link.
    pub fn push_samples(&mut self, samples: &[f32]) -> usize {
        let mut forwarded = 0;
        for &s in samples {
            self.block.push(s);
            if self.block.len() == self.block_size {
                // No point encoding a block that is going nowhere.
                if !self.link_open.load(Ordering::Relaxed) {
                    log::trace!("Link closed, dropping capture block");
                    self.block.clear();
                    continue;
                }
                let frame = pcm::encode_frame(&self.block);
                self.block.clear();
                if self
                    .net_tx
                    .blocking_send(NetCommand::SendBinary(frame))
                    .is_err()
                {
                    log::warn!("Net link gone, dropping capture frame");
                    return forwarded;
                }
                forwarded += 1;
            }
        }
        forwarded
    }
}

/// Handle to a running capture thread.
pub struct CaptureHandle {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl CaptureHandle {
    pub(crate) fn new(running: Arc<AtomicBool>, handle: Option<JoinHandle<()>>) -> Self {
        Self { running, handle }
    }

    /// Signal the thread to stop and wait for it to finish.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Open the capture device and spawn the recording thread.
///
/// The device is opened on the thread (the PCM handle never crosses
/// threads); open failure is reported back so a session start can fail
/// cleanly.
pub fn start_capture(
    device: &str,
    sample_rate: u32,
    pipeline: CapturePipeline,
) -> Result<CaptureHandle> {
    let running = Arc::new(AtomicBool::new(true));
    let (ready_tx, ready_rx) = std_mpsc::sync_channel(1);
    let device = device.to_string();

    let handle = {
        let running = running.clone();
        thread::Builder::new()
            .name("audio-record".into())
            .spawn(move || {
                if let Err(e) = record_thread(&device, sample_rate, pipeline, &running, ready_tx) {
                    log::error!("Recording thread error: {}", e);
                }
            })?
    };

    ready_rx
        .recv()
        .map_err(|_| anyhow::anyhow!("Capture thread exited before reporting ready"))??;

    Ok(CaptureHandle::new(running, Some(handle)))
}

fn record_thread(
    device: &str,
    sample_rate: u32,
    mut pipeline: CapturePipeline,
    running: &AtomicBool,
    ready_tx: std_mpsc::SyncSender<Result<()>>,
) -> Result<()> {
    let (pcm, params) = match alsa_device::open_capture(device, sample_rate) {
        Ok(v) => {
            let _ = ready_tx.send(Ok(()));
            v
        }
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return Ok(());
        }
    };

    let period_size = params.period_size;
    let mut read_buf = vec![0i16; period_size];
    let mut norm_buf = vec![0f32; period_size];

    let io = pcm.io_i16()?;

    log::info!(
        "Recording started: rate={}, period={}",
        params.sample_rate,
        period_size,
    );

    while running.load(Ordering::Relaxed) {
        // Read one period from ALSA
        match io.readi(&mut read_buf) {
            Ok(frames) => {
                for i in 0..frames {
                    norm_buf[i] = pcm::sample_to_f32(read_buf[i]);
                }
                pipeline.push_samples(&norm_buf[..frames]);
            }
            Err(e) => {
                log::warn!("ALSA capture error: {}, recovering...", e);
                if let Err(e2) = pcm.prepare() {
                    log::error!("Failed to recover PCM capture: {}", e2);
                    break;
                }
            }
        }
    }

    log::info!("Recording stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CAPTURE_BLOCK_SAMPLES;

    fn pipeline(open: bool) -> (CapturePipeline, mpsc::Receiver<NetCommand>, Arc<AtomicBool>) {
        let link_open = Arc::new(AtomicBool::new(open));
        let (tx, rx) = mpsc::channel(16);
        (
            CapturePipeline::new(CAPTURE_BLOCK_SAMPLES, link_open.clone(), tx),
            rx,
            link_open,
        )
    }

    #[test]
    fn emits_whole_blocks_only() {
        let (mut pipe, mut rx, _open) = pipeline(true);

        // 6000 samples: one full block forwarded, 1904 held back.
        assert_eq!(pipe.push_samples(&vec![0.25; 6000]), 1);
        match rx.try_recv() {
            Ok(NetCommand::SendBinary(frame)) => {
                assert_eq!(frame.len(), CAPTURE_BLOCK_SAMPLES * 2);
            }
            other => panic!("expected one binary frame, got {:?}", other),
        }
        assert!(rx.try_recv().is_err());

        // The remainder completes the next block.
        assert_eq!(pipe.push_samples(&vec![0.25; CAPTURE_BLOCK_SAMPLES - 1904]), 1);
        assert!(matches!(rx.try_recv(), Ok(NetCommand::SendBinary(_))));
    }

    #[test]
    fn frames_are_dropped_while_link_closed() {
        let (mut pipe, mut rx, open) = pipeline(false);

        assert_eq!(pipe.push_samples(&vec![0.5; CAPTURE_BLOCK_SAMPLES * 2]), 0);
        assert!(rx.try_recv().is_err());

        // Reopening forwards fresh frames but never the dropped ones.
        open.store(true, Ordering::Relaxed);
        assert_eq!(pipe.push_samples(&vec![0.5; CAPTURE_BLOCK_SAMPLES]), 1);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }
}
