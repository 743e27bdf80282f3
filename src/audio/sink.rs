//! ALSA-backed playback sink.
//!
//! Real-time output runs on a dedicated OS thread (NOT a tokio task) to
//! avoid contention with the async network tasks. The thread owns the PCM
//! handle and keeps a `tail` cursor marking the end of all audio handed
//! to the device: a chunk whose planned start butts up against that tail
//! is written immediately and the blocking `writei` paces the stream, so
//! the device buffer never drains between contiguous chunks. Only a
//! chunk with a genuine gap before it waits for its start time.
//!
//! Cancellation reaches three places: the queue (chunk not yet written),
//! the write loop (chunk being written), and the device buffer itself
//! (chunk fully written but still draining), which is discarded with
//! `pcm.drop()`.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::Result;

use super::alsa_device;
use super::clock::OutputClock;
use super::pcm::sample_to_i16;
use super::scheduler::{ChunkId, PlaybackSink};

enum SinkCommand {
    Play {
        id: ChunkId,
        samples: Vec<f32>,
        start: Duration,
    },
    Cancel(ChunkId),
    Shutdown,
}

/// Poll interval while no chunk is queued.
const IDLE_WAIT: Duration = Duration::from_millis(500);

pub struct AlsaSink {
    tx: Sender<SinkCommand>,
    handle: Option<JoinHandle<()>>,
}

impl AlsaSink {
    /// Open the playback device and spawn the output thread.
    ///
    /// The device is opened on the thread itself (the PCM handle never
    /// crosses threads); open failure is reported back so a session
    /// start can fail cleanly.
    pub fn open(device: &str, sample_rate: u32, clock: Arc<dyn OutputClock>) -> Result<Self> {
        let (tx, rx) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);
        let device = device.to_string();

        let handle = thread::Builder::new()
            .name("audio-play".into())
            .spawn(move || play_loop(&device, sample_rate, rx, clock, ready_tx))?;

        ready_rx
            .recv()
            .map_err(|_| anyhow::anyhow!("Playback thread exited before reporting ready"))??;

        Ok(Self {
            tx,
            handle: Some(handle),
        })
    }
}

impl PlaybackSink for AlsaSink {
    fn start_at(&mut self, id: ChunkId, samples: Vec<f32>, start: Duration) {
        if self
            .tx
            .send(SinkCommand::Play { id, samples, start })
            .is_err()
        {
            log::warn!("Playback thread gone, dropping chunk {}", id);
        }
    }

    fn cancel(&mut self, id: ChunkId) {
        let _ = self.tx.send(SinkCommand::Cancel(id));
    }
}

impl Drop for AlsaSink {
    fn drop(&mut self) {
        let _ = self.tx.send(SinkCommand::Shutdown);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

struct Queued {
    id: ChunkId,
    samples: Vec<f32>,
    start: Duration,
}

struct SinkState {
    queue: VecDeque<Queued>,
    /// End time of all audio handed to the device so far.
    tail: Duration,
    /// Chunk most recently written in full; its samples may still be
    /// draining inside the device buffer until the recorded end time.
    draining: Option<(ChunkId, Duration)>,
}

impl SinkState {
    fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            tail: Duration::ZERO,
            draining: None,
        }
    }
}

/// What the caller must do after applying a command.
#[derive(Debug, PartialEq, Eq)]
enum Applied {
    Kept,
    /// Cancelled audio is sitting in the device buffer; discard it.
    DropDevice,
    Shutdown,
}

/// True once `start` may begin writing: immediately when it is
/// contiguous with audio already written (or already due), otherwise
/// not until the clock reaches it.
fn ready_to_write(start: Duration, tail: Duration, now: Duration) -> bool {
    start <= tail || start <= now
}

fn apply_command(cmd: SinkCommand, state: &mut SinkState, now: Duration) -> Applied {
    match cmd {
        SinkCommand::Play { id, samples, start } => {
            state.queue.push_back(Queued { id, samples, start });
            Applied::Kept
        }
        SinkCommand::Cancel(id) => {
            state.queue.retain(|q| q.id != id);
            if let Some((draining_id, end)) = state.draining {
                if draining_id == id {
                    state.draining = None;
                    if end > now {
                        // Still audible: dump the device buffer.
                        state.tail = now;
                        return Applied::DropDevice;
                    }
                    // Already played out, nothing left to stop.
                }
            }
            Applied::Kept
        }
        SinkCommand::Shutdown => Applied::Shutdown,
    }
}

fn play_loop(
    device: &str,
    sample_rate: u32,
    rx: Receiver<SinkCommand>,
    clock: Arc<dyn OutputClock>,
    ready_tx: mpsc::SyncSender<Result<()>>,
) {
    let (pcm, params) = match alsa_device::open_playback(device, sample_rate) {
        Ok(v) => {
            let _ = ready_tx.send(Ok(()));
            v
        }
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    let io = match pcm.io_i16() {
        Ok(io) => io,
        Err(e) => {
            log::error!("Failed to get PCM IO handle: {}", e);
            return;
        }
    };

    let mut state = SinkState::new();

    log::info!(
        "Playback started: rate={}, period={}",
        params.sample_rate,
        params.period_size,
    );

    'outer: loop {
        // Wait for a command, except while the front chunk is ready to
        // write; a chunk behind a genuine gap waits out the gap here.
        let now = clock.now();
        let timeout = match state.queue.front() {
            Some(q) if ready_to_write(q.start, state.tail, now) => Duration::ZERO,
            Some(q) => q.start.saturating_sub(now),
            None => IDLE_WAIT,
        };
        if !timeout.is_zero() {
            match rx.recv_timeout(timeout) {
                Ok(cmd) => match apply_command(cmd, &mut state, clock.now()) {
                    Applied::Kept => {}
                    Applied::DropDevice => drop_device_buffer(&pcm),
                    Applied::Shutdown => break,
                },
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        while let Ok(cmd) = rx.try_recv() {
            match apply_command(cmd, &mut state, clock.now()) {
                Applied::Kept => {}
                Applied::DropDevice => drop_device_buffer(&pcm),
                Applied::Shutdown => break 'outer,
            }
        }

        // Write every chunk that is due or contiguous with audio already
        // written; the blocking writei is the pacer, so back-to-back
        // chunks keep the device buffer fed across their boundary.
        while matches!(state.queue.front(), Some(q) if ready_to_write(q.start, state.tail, clock.now()))
        {
            let Some(chunk) = state.queue.pop_front() else { break };
            match play_chunk(
                &pcm,
                &io,
                chunk,
                &rx,
                &mut state,
                &*clock,
                params.period_size,
                params.sample_rate,
            ) {
                Ok(false) => {}
                Ok(true) => break 'outer,
                Err(e) => {
                    log::error!("Playback device error: {}", e);
                    break 'outer;
                }
            }
        }
    }

    log::info!("Playback stopped");
}

/// Discard whatever the device has buffered and re-arm it.
fn drop_device_buffer(pcm: &alsa::pcm::PCM) {
    let _ = pcm.drop();
    if let Err(e) = pcm.prepare() {
        log::error!("Failed to re-arm PCM after drop: {}", e);
    }
}

/// Write one chunk to the device, polling for cancellation between
/// period writes. Returns true if a shutdown was requested mid-chunk.
#[allow(clippy::too_many_arguments)]
fn play_chunk(
    pcm: &alsa::pcm::PCM,
    io: &alsa::pcm::IO<'_, i16>,
    chunk: Queued,
    rx: &Receiver<SinkCommand>,
    state: &mut SinkState,
    clock: &dyn OutputClock,
    period_size: usize,
    sample_rate: u32,
) -> Result<bool> {
    let data: Vec<i16> = chunk.samples.iter().map(|&s| sample_to_i16(s)).collect();
    let duration = Duration::from_secs_f64(data.len() as f64 / sample_rate as f64);

    let mut written = 0;
    let mut retry_count = 0u32;
    while written < data.len() {
        // Honor mid-chunk cancellation and keep later chunks queued.
        while let Ok(cmd) = rx.try_recv() {
            match cmd {
                SinkCommand::Cancel(id) if id == chunk.id => {
                    // Abrupt stop: discard whatever the device buffered.
                    drop_device_buffer(pcm);
                    state.draining = None;
                    state.tail = clock.now();
                    return Ok(false);
                }
                other => match apply_command(other, state, clock.now()) {
                    Applied::Kept => {}
                    Applied::DropDevice => drop_device_buffer(pcm),
                    Applied::Shutdown => {
                        let _ = pcm.drop();
                        return Ok(true);
                    }
                },
            }
        }

        let end = (written + period_size).min(data.len());
        match io.writei(&data[written..end]) {
            Ok(n) => {
                written += n;
                retry_count = 0;
            }
            Err(e) => {
                log::warn!("ALSA XRUN or error: {}, recovering...", e);
                retry_count += 1;
                pcm.prepare()?;
                // The device persistently cannot keep up; drop the rest
                // of this chunk rather than spin.
                if retry_count >= 3 {
                    log::error!(
                        "Max recovery retries reached. Dropping {} unwritten samples.",
                        data.len() - written
                    );
                    break;
                }
            }
        }
    }

    // The chunk now lives in the device buffer until its planned end;
    // remember it so a later cancel can still silence it.
    let end = chunk.start + duration;
    state.tail = end;
    state.draining = Some((chunk.id, end));
    Ok(false)
}
