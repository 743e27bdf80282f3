//! Session controller: lifecycle state machine and inbound demux.
//!
//! One session owns the transport link, the capture thread, and the
//! playback scheduler. Inbound traffic is demultiplexed by frame type:
//! text frames are control messages, binary frames are audio. The tag is
//! the transport's, content is never sniffed.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Result, bail};
use tokio::sync::mpsc;

use crate::audio::AudioBackend;
use crate::audio::capture::{CaptureHandle, CapturePipeline};
use crate::audio::clock::OutputClock;
use crate::audio::pcm;
use crate::audio::scheduler::PlaybackScheduler;
use crate::config::{CAPTURE_BLOCK_SAMPLES, Config, PLAYBACK_SAMPLE_RATE};
use crate::net_link::{NetCommand, NetEvent, Transport};
use crate::protocol::{ClientCommand, ServerMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Starting,
    Streaming,
    Stopping,
}

/// What the caller's event loop should do after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Terminated,
}

pub struct Session {
    state: SessionState,
    config: Config,
    transport: Box<dyn Transport>,
    backend: Box<dyn AudioBackend>,
    clock: Arc<dyn OutputClock>,
    link_open: Arc<AtomicBool>,
    scheduler: Option<PlaybackScheduler>,
    capture: Option<CaptureHandle>,
    net_tx: Option<mpsc::Sender<NetCommand>>,
    rx_event: Option<mpsc::Receiver<NetEvent>>,
}

impl Session {
    pub fn new(
        config: Config,
        transport: Box<dyn Transport>,
        backend: Box<dyn AudioBackend>,
        clock: Arc<dyn OutputClock>,
    ) -> Self {
        Self {
            state: SessionState::Idle,
            config,
            transport,
            backend,
            clock,
            link_open: Arc::new(AtomicBool::new(false)),
            scheduler: None,
            capture: None,
            net_tx: None,
            rx_event: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Bring the session up. A no-op outside `Idle` (UI double-clicks
    /// are expected). Any acquisition failure tears everything back
    /// down to `Idle` before the error is returned.
    pub async fn start(&mut self) -> Result<()> {
        if self.state != SessionState::Idle {
            log::debug!("start() ignored in state {:?}", self.state);
            return Ok(());
        }
        self.state = SessionState::Starting;

        match self.bring_up().await {
            Ok(()) => {
                self.state = SessionState::Streaming;
                log::info!("Session streaming");
                Ok(())
            }
            Err(e) => {
                log::error!("Session start failed: {}", e);
                self.teardown();
                Err(e)
            }
        }
    }

    async fn bring_up(&mut self) -> Result<()> {
        let (net_tx, mut rx_event) = self.transport.connect().await?;

        match rx_event.recv().await {
            Some(NetEvent::Connected) => {}
            other => bail!("Transport failed to open (got {:?})", other),
        }
        self.link_open.store(true, Ordering::SeqCst);

        let sink = self.backend.open_sink(self.clock.clone())?;
        let mut scheduler = PlaybackScheduler::new(self.clock.clone(), sink, PLAYBACK_SAMPLE_RATE);

        let pipeline = CapturePipeline::new(
            CAPTURE_BLOCK_SAMPLES,
            self.link_open.clone(),
            net_tx.clone(),
        );
        let capture = self.backend.start_capture(pipeline)?;

        scheduler.activate();

        // Fixed opening payload, prompts the remote side to start talking.
        let greeting = serde_json::to_string(&ClientCommand::greeting(self.config.greeting_text))?;
        net_tx
            .send(NetCommand::SendText(greeting))
            .await
            .map_err(|_| anyhow::anyhow!("Net link closed before greeting"))?;

        self.net_tx = Some(net_tx);
        self.rx_event = Some(rx_event);
        self.scheduler = Some(scheduler);
        self.capture = Some(capture);
        Ok(())
    }

    /// Tear the session down. A no-op outside `Streaming`.
    pub fn stop(&mut self) {
        if self.state != SessionState::Streaming {
            log::debug!("stop() ignored in state {:?}", self.state);
            return;
        }
        self.state = SessionState::Stopping;
        log::info!("Stopping session");
        self.teardown();
    }

    /// Next inbound transport event; `None` once the link is gone.
    pub async fn next_event(&mut self) -> Option<NetEvent> {
        match self.rx_event.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }

    /// Demultiplex one inbound event.
    pub fn handle_net_event(&mut self, event: NetEvent) -> Flow {
        match event {
            NetEvent::Text(text) => {
                self.process_control(&text);
                Flow::Continue
            }
            NetEvent::Binary(data) => {
                let samples = pcm::decode_frame(&data);
                if let Some(scheduler) = self.scheduler.as_mut() {
                    scheduler.schedule(samples);
                }
                Flow::Continue
            }
            NetEvent::Connected => {
                self.link_open.store(true, Ordering::SeqCst);
                Flow::Continue
            }
            NetEvent::Disconnected => {
                // Terminal during streaming: release everything exactly
                // as stop() would, so nothing leaks on abnormal exit.
                if self.state == SessionState::Streaming {
                    log::warn!("Transport closed during streaming, tearing down");
                    self.state = SessionState::Stopping;
                    self.teardown();
                }
                Flow::Terminated
            }
        }
    }

    fn process_control(&mut self, text: &str) {
        let msg: ServerMessage = match serde_json::from_str(text) {
            Ok(msg) => msg,
            Err(e) => {
                // Malformed control traffic is not fatal.
                log::trace!("Ignoring unparseable control message: {}", e);
                return;
            }
        };
        if msg.interrupted == Some(true) {
            log::info!("Barge-in: flushing queued playback");
            if let Some(scheduler) = self.scheduler.as_mut() {
                scheduler.flush();
            }
        }
    }

    fn teardown(&mut self) {
        if let Some(mut scheduler) = self.scheduler.take() {
            scheduler.deactivate();
        }
        if let Some(mut capture) = self.capture.take() {
            capture.stop();
        }
        self.link_open.store(false, Ordering::SeqCst);
        // Dropping the command sender closes the socket task.
        self.net_tx = None;
        self.rx_event = None;
        self.state = SessionState::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::clock::StreamClock;
    use crate::audio::scheduler::{ChunkId, PlaybackSink};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Debug, PartialEq, Eq)]
    enum SinkCall {
        Start(ChunkId),
        Cancel(ChunkId),
    }

    type SinkLog = Arc<Mutex<Vec<SinkCall>>>;

    struct TestSink(SinkLog);

    impl PlaybackSink for TestSink {
        fn start_at(&mut self, id: ChunkId, _samples: Vec<f32>, _start: Duration) {
            self.0.lock().unwrap().push(SinkCall::Start(id));
        }
        fn cancel(&mut self, id: ChunkId) {
            self.0.lock().unwrap().push(SinkCall::Cancel(id));
        }
    }

    struct TestBackend {
        sink_log: SinkLog,
        fail_capture: bool,
    }

    impl AudioBackend for TestBackend {
        fn open_sink(&mut self, _clock: Arc<dyn OutputClock>) -> Result<Box<dyn PlaybackSink>> {
            Ok(Box::new(TestSink(self.sink_log.clone())))
        }

        fn start_capture(&mut self, _pipeline: CapturePipeline) -> Result<CaptureHandle> {
            if self.fail_capture {
                bail!("Permission denied");
            }
            Ok(CaptureHandle::new(Arc::new(AtomicBool::new(true)), None))
        }
    }

    /// Transport whose far side is the test: events are injected through
    /// `events`, outbound commands observed through the returned receiver.
    struct TestTransport {
        wiring: Option<(mpsc::Sender<NetCommand>, mpsc::Receiver<NetEvent>)>,
    }

    #[async_trait]
    impl Transport for TestTransport {
        async fn connect(&mut self) -> Result<(mpsc::Sender<NetCommand>, mpsc::Receiver<NetEvent>)> {
            match self.wiring.take() {
                Some(pair) => Ok(pair),
                None => bail!("Connection refused"),
            }
        }
    }

    struct Harness {
        session: Session,
        events: mpsc::Sender<NetEvent>,
        outbound: mpsc::Receiver<NetCommand>,
        sink_log: SinkLog,
    }

    async fn harness_with(fail_capture: bool) -> Harness {
        let (tx_cmd, rx_cmd) = mpsc::channel(100);
        let (tx_event, rx_event) = mpsc::channel(100);
        tx_event.send(NetEvent::Connected).await.unwrap();

        let sink_log: SinkLog = Arc::new(Mutex::new(Vec::new()));
        let session = Session::new(
            Config::default(),
            Box::new(TestTransport {
                wiring: Some((tx_cmd, rx_event)),
            }),
            Box::new(TestBackend {
                sink_log: sink_log.clone(),
                fail_capture,
            }),
            StreamClock::new(),
        );
        Harness {
            session,
            events: tx_event,
            outbound: rx_cmd,
            sink_log,
        }
    }

    async fn streaming_harness() -> Harness {
        let mut h = harness_with(false).await;
        h.session.start().await.unwrap();
        assert_eq!(h.session.state(), SessionState::Streaming);
        h
    }

    fn audio_frame(samples: usize) -> NetEvent {
        NetEvent::Binary(pcm::encode_frame(&vec![0.1; samples]))
    }

    #[tokio::test]
    async fn start_sends_greeting() {
        let mut h = streaming_harness().await;
        match h.outbound.try_recv() {
            Ok(NetCommand::SendText(json)) => {
                assert!(json.contains(r#""cmd":"text""#), "{}", json);
            }
            other => panic!("expected greeting, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn start_twice_is_a_noop() {
        let mut h = streaming_harness().await;
        let _ = h.outbound.try_recv();

        // Second start: still streaming, no second greeting.
        h.session.start().await.unwrap();
        assert_eq!(h.session.state(), SessionState::Streaming);
        assert!(h.outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn stop_twice_is_a_noop() {
        let mut h = streaming_harness().await;
        h.session.stop();
        assert_eq!(h.session.state(), SessionState::Idle);
        h.session.stop();
        assert_eq!(h.session.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn binary_frames_reach_the_sink() {
        let mut h = streaming_harness().await;
        assert_eq!(h.session.handle_net_event(audio_frame(4096)), Flow::Continue);
        assert_eq!(*h.sink_log.lock().unwrap(), vec![SinkCall::Start(0)]);
    }

    #[tokio::test]
    async fn interrupt_flushes_pending_playback() {
        let mut h = streaming_harness().await;
        h.session.handle_net_event(audio_frame(4096));
        h.session.handle_net_event(audio_frame(4096));

        let flow = h
            .session
            .handle_net_event(NetEvent::Text(r#"{"interrupted": true}"#.into()));
        assert_eq!(flow, Flow::Continue);

        let log = h.sink_log.lock().unwrap();
        assert_eq!(
            *log,
            vec![
                SinkCall::Start(0),
                SinkCall::Start(1),
                SinkCall::Cancel(0),
                SinkCall::Cancel(1),
            ]
        );
    }

    #[tokio::test]
    async fn malformed_and_unrecognized_control_is_ignored() {
        let mut h = streaming_harness().await;
        h.session.handle_net_event(audio_frame(4096));

        let flow = h.session.handle_net_event(NetEvent::Text("not json".into()));
        assert_eq!(flow, Flow::Continue);
        let flow = h
            .session
            .handle_net_event(NetEvent::Text(r#"{"turn_complete": true}"#.into()));
        assert_eq!(flow, Flow::Continue);

        // Nothing was flushed.
        assert_eq!(*h.sink_log.lock().unwrap(), vec![SinkCall::Start(0)]);
        assert_eq!(h.session.state(), SessionState::Streaming);
    }

    #[tokio::test]
    async fn disconnect_during_streaming_releases_everything() {
        let mut h = streaming_harness().await;
        h.session.handle_net_event(audio_frame(4096));

        assert_eq!(
            h.session.handle_net_event(NetEvent::Disconnected),
            Flow::Terminated
        );
        assert_eq!(h.session.state(), SessionState::Idle);
        assert!(!h.session.link_open.load(Ordering::SeqCst));
        assert!(h.session.scheduler.is_none());
        assert!(h.session.capture.is_none());
        assert!(h.session.net_tx.is_none());

        // Teardown flushed the chunk that was still queued.
        assert_eq!(
            *h.sink_log.lock().unwrap(),
            vec![SinkCall::Start(0), SinkCall::Cancel(0)]
        );

        // A late chunk is discarded, never played.
        h.session.handle_net_event(audio_frame(4096));
        assert_eq!(h.sink_log.lock().unwrap().len(), 2);
        drop(h.events);
    }

    #[tokio::test]
    async fn capture_failure_returns_to_idle() {
        let mut h = harness_with(true).await;
        assert!(h.session.start().await.is_err());
        assert_eq!(h.session.state(), SessionState::Idle);
        assert!(!h.session.link_open.load(Ordering::SeqCst));
        assert!(h.session.scheduler.is_none());
    }

    #[tokio::test]
    async fn connect_failure_returns_to_idle() {
        let sink_log: SinkLog = Arc::new(Mutex::new(Vec::new()));
        let mut session = Session::new(
            Config::default(),
            Box::new(TestTransport { wiring: None }),
            Box::new(TestBackend {
                sink_log,
                fail_capture: false,
            }),
            StreamClock::new(),
        );
        assert!(session.start().await.is_err());
        assert_eq!(session.state(), SessionState::Idle);
    }
}
