//! # Voice Session Controller
//!
//! Owns every resource of the one active voice session: the transport
//! connection, the microphone capture, and the two pump tasks that move data
//! between them and the speakers.
//!
//! ## Lifecycle:
//! 1. **start**: connect the transport (setup frame goes out), then acquire the
//!    microphone, then spawn the pumps. A failure at any step releases whatever
//!    was already acquired.
//! 2. **running**: captured frames flow to the endpoint, inbound audio flows to
//!    playback, inbound text is broadcast as [`VoiceEvent::Text`].
//! 3. **stop**: disconnect capture → stop tracks → close capture → close
//!    transport. Each step is skipped if the resource never existed and its
//!    failure is logged, never propagated.
//!
//! ## Liveness:
//! Every session carries an `Arc<AtomicBool>`. Pumps read it fresh before
//! touching anything, and `stop` clears it first, so nothing that resolves
//! after `stop` returns can send a frame or play a clip.

use crate::audio::buffer::AudioFrame;
use crate::audio::capture::{encode_frame, CaptureBackend, CaptureHandle};
use crate::audio::playback::{PlaybackSink, PlaybackStage};
use crate::config::AppConfig;
use crate::error::{VoiceError, VoiceResult};
use crate::transport::protocol::{interpret_control, ControlEvent, InboundFrame, SetupFrame};
use crate::transport::session::{SendOutcome, TransportEvent, TransportSession};
use crate::voice::events::{MetricsSnapshot, SessionState, VoiceEvent, VoiceMetrics};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const EVENT_CAPACITY: usize = 256;

/// Result of a start request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// A new session is running
    Started(Uuid),
    /// A session was already running; nothing new was created
    AlreadyActive(Uuid),
}

impl StartOutcome {
    pub fn session_id(&self) -> Uuid {
        match self {
            StartOutcome::Started(id) | StartOutcome::AlreadyActive(id) => *id,
        }
    }
}

/// Resources of the running session.
struct ActiveSession {
    id: Uuid,
    live: Arc<AtomicBool>,
    transport: Arc<TransportSession>,
    capture: Option<Box<dyn CaptureHandle>>,
    tasks: Vec<JoinHandle<()>>,
}

/// A start that has not finished yet; `stop` uses it to cancel.
struct PendingStart {
    live: Arc<AtomicBool>,
    transport: Arc<TransportSession>,
}

/// Controls the voice pipeline. Shared as `Arc<VoiceController>`.
pub struct VoiceController {
    config: Arc<RwLock<AppConfig>>,
    capture: Arc<dyn CaptureBackend>,
    playback: Arc<dyn PlaybackSink>,
    active: tokio::sync::Mutex<Option<ActiveSession>>,
    pending: Mutex<Option<PendingStart>>,
    state: watch::Sender<SessionState>,
    recording: watch::Sender<bool>,
    /// Id of the running session, readable without waiting on a start
    current: watch::Sender<Option<Uuid>>,
    events: broadcast::Sender<VoiceEvent>,
    metrics: Arc<VoiceMetrics>,
}

impl VoiceController {
    /// Create an idle controller.
    ///
    /// ## Parameters:
    /// - `config`: Shared settings, read at every start so runtime updates apply
    ///   to the next session
    /// - `capture`: Microphone backend
    /// - `playback`: Output for response audio
    pub fn new(
        config: Arc<RwLock<AppConfig>>,
        capture: Arc<dyn CaptureBackend>,
        playback: Arc<dyn PlaybackSink>,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(SessionState::Idle);
        let (recording, _) = watch::channel(false);
        let (current, _) = watch::channel(None);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            config,
            capture,
            playback,
            active: tokio::sync::Mutex::new(None),
            pending: Mutex::new(None),
            state,
            recording,
            current,
            events,
            metrics: Arc::new(VoiceMetrics::default()),
        })
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn is_recording(&self) -> bool {
        *self.recording.borrow()
    }

    /// Observable "is recording" flag.
    pub fn watch_recording(&self) -> watch::Receiver<bool> {
        self.recording.subscribe()
    }

    /// Stream of UI notifications, inbound control text included.
    pub fn subscribe(&self) -> broadcast::Receiver<VoiceEvent> {
        self.events.subscribe()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Id of the running session, if any.
    pub fn session_id(&self) -> Option<Uuid> {
        *self.current.borrow()
    }

    /// Start a voice session.
    ///
    /// ## Returns:
    /// - `Ok(Started(id))`: transport open, setup sent, microphone streaming
    /// - `Ok(AlreadyActive(id))`: a session was already running; nothing changed
    /// - `Err(PermissionDenied)`: no microphone; the connection was torn down
    /// - `Err(Connection)`: the endpoint could not be reached
    /// - `Err(Cancelled)`: `stop` was called before the start completed
    pub async fn start(self: &Arc<Self>) -> VoiceResult<StartOutcome> {
        let mut active = self.active.lock().await;
        if let Some(session) = active.as_ref() {
            debug!(session_id = %session.id, "Voice session already active");
            return Ok(StartOutcome::AlreadyActive(session.id));
        }

        let config = match self.config.read() {
            Ok(config) => config.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        let id = Uuid::new_v4();
        let live = Arc::new(AtomicBool::new(true));
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(TransportSession::new(transport_tx));

        self.set_pending(Some(PendingStart {
            live: live.clone(),
            transport: transport.clone(),
        }));
        self.set_state(SessionState::Connecting);
        info!(session_id = %id, "Starting voice session");

        let result = self.acquire(&config, &live, &transport).await;
        self.set_pending(None);

        let (capture, frames_rx) = match result {
            Ok(acquired) => {
                debug!(session_id = %id, device_rate = acquired.0.sample_rate(), "Capture acquired");
                acquired
            }
            Err(err) => {
                // A stop that raced the start reports whatever the interrupted step returned
                let err = if live.swap(false, Ordering::AcqRel) {
                    err
                } else {
                    VoiceError::Cancelled
                };
                transport.close().await;
                self.set_state(SessionState::Closed);
                if err != VoiceError::Cancelled {
                    error!(session_id = %id, "Voice session failed to start: {}", err);
                    self.metrics.record_error();
                    self.emit(VoiceEvent::Error {
                        session_id: Some(id),
                        message: err.to_string(),
                    });
                }
                return Err(err);
            }
        };

        let capture_pump = tokio::spawn(pump_capture(
            frames_rx,
            transport.clone(),
            live.clone(),
            config.audio.target_sample_rate,
            self.metrics.clone(),
        ));
        let inbound_pump = tokio::spawn(pump_inbound(InboundPump {
            controller: Arc::downgrade(self),
            session_id: id,
            live: live.clone(),
            events: transport_rx,
            playback: PlaybackStage::new(self.playback.clone(), config.audio.receive_sample_rate),
        }));

        *active = Some(ActiveSession {
            id,
            live,
            transport,
            capture: Some(capture),
            tasks: vec![capture_pump, inbound_pump],
        });

        // Published under the guard so a concurrent stop always sees Open first
        self.metrics.record_session_started();
        self.current.send_replace(Some(id));
        self.set_state(SessionState::Open);
        self.recording.send_replace(true);
        self.emit(VoiceEvent::SessionStarted { session_id: id });
        self.emit(VoiceEvent::Recording { recording: true });
        drop(active);
        info!(session_id = %id, "Voice session started");

        Ok(StartOutcome::Started(id))
    }

    /// Connect, then open the microphone. Checks liveness after every
    /// suspension point.
    async fn acquire(
        &self,
        config: &AppConfig,
        live: &Arc<AtomicBool>,
        transport: &Arc<TransportSession>,
    ) -> VoiceResult<(Box<dyn CaptureHandle>, UnboundedReceiver<AudioFrame>)> {
        let setup = SetupFrame::from_config(config);
        let timeout = Duration::from_millis(config.voice.connect_timeout_ms);
        transport
            .connect(&config.voice.endpoint_url(), &setup, timeout)
            .await?;
        if !live.load(Ordering::Acquire) {
            return Err(VoiceError::Cancelled);
        }

        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let backend = self.capture.clone();
        let frame_size = config.audio.frame_size;
        let mut capture = tokio::task::spawn_blocking(move || backend.open(frame_size, frames_tx))
            .await
            .map_err(|e| VoiceError::Device(format!("Capture setup task failed: {}", e)))??;

        if !live.load(Ordering::Acquire) {
            release_capture(&mut capture);
            return Err(VoiceError::Cancelled);
        }
        Ok((capture, frames_rx))
    }

    /// Stop the voice session. Idempotent, never fails, safe from any state.
    pub async fn stop(&self) {
        // Cancel a start that is still connecting or opening the microphone
        let pending = self
            .pending
            .lock()
            .ok()
            .and_then(|slot| slot.as_ref().map(|p| (p.live.clone(), p.transport.clone())));
        if let Some((live, transport)) = pending {
            live.store(false, Ordering::Release);
            transport.close().await;
        }

        // Held through teardown so a new start cannot interleave with it
        let mut active = self.active.lock().await;
        match active.take() {
            Some(session) => self.teardown(session).await,
            None => debug!("Stop requested with no active voice session"),
        }
    }

    /// Stop only if `id` is still the active session. Used when the transport
    /// ends on its own so a newer session is never torn down by a stale one.
    async fn stop_session(&self, id: Uuid) {
        let mut active = self.active.lock().await;
        let session = match active.as_ref() {
            Some(session) if session.id == id => active.take(),
            _ => None,
        };
        if let Some(session) = session {
            self.teardown(session).await;
        }
    }

    async fn teardown(&self, mut session: ActiveSession) {
        let id = session.id;
        session.live.store(false, Ordering::Release);
        self.set_state(SessionState::Closing);

        if let Some(mut capture) = session.capture.take() {
            let released = tokio::task::spawn_blocking(move || release_capture(&mut capture)).await;
            if let Err(err) = released {
                warn!(session_id = %id, "Capture teardown task failed: {}", err);
            }
        }

        session.transport.close().await;
        debug!(
            session_id = %id,
            sent = session.transport.frames_sent(),
            dropped = session.transport.frames_dropped(),
            "Transport released"
        );

        // Wait for the pumps so nothing they were midway through outlives stop()
        for task in session.tasks.drain(..) {
            task.abort();
            let _ = task.await;
        }

        self.current.send_replace(None);
        self.set_state(SessionState::Closed);
        self.recording.send_replace(false);
        self.emit(VoiceEvent::SessionStopped { session_id: id });
        self.emit(VoiceEvent::Recording { recording: false });
        info!(session_id = %id, "Voice session stopped");
    }

    fn set_pending(&self, pending: Option<PendingStart>) {
        if let Ok(mut slot) = self.pending.lock() {
            *slot = pending;
        }
    }

    fn set_state(&self, state: SessionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            self.emit(VoiceEvent::State { state });
        }
    }

    fn emit(&self, event: VoiceEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

/// Run the three capture teardown steps, logging each failure and continuing.
fn release_capture(capture: &mut Box<dyn CaptureHandle>) {
    if let Err(err) = capture.disconnect() {
        warn!("Capture disconnect failed: {}", err);
    }
    if let Err(err) = capture.stop_tracks() {
        warn!("Stopping capture tracks failed: {}", err);
    }
    if let Err(err) = capture.close() {
        warn!("Closing capture failed: {}", err);
    }
}

/// Captured frame → outbound realtime-input frame.
async fn pump_capture(
    mut frames: UnboundedReceiver<AudioFrame>,
    transport: Arc<TransportSession>,
    live: Arc<AtomicBool>,
    target_rate: u32,
    metrics: Arc<VoiceMetrics>,
) {
    while let Some(frame) = frames.recv().await {
        if !live.load(Ordering::Acquire) {
            break;
        }
        metrics.record_frame_captured();

        let outbound = encode_frame(&frame, target_rate);
        match transport.send(&outbound).await {
            SendOutcome::Sent => metrics.record_frame_sent(),
            SendOutcome::Dropped => metrics.record_frame_dropped(),
            SendOutcome::Failed => {
                metrics.record_error();
                break;
            }
        }
    }
    debug!("Capture pump finished");
}

struct InboundPump {
    controller: Weak<VoiceController>,
    session_id: Uuid,
    live: Arc<AtomicBool>,
    events: UnboundedReceiver<TransportEvent>,
    playback: PlaybackStage,
}

/// Transport events → playback, UI events, or session teardown.
async fn pump_inbound(mut pump: InboundPump) {
    while let Some(event) = pump.events.recv().await {
        if !pump.live.load(Ordering::Acquire) {
            break;
        }
        let Some(controller) = pump.controller.upgrade() else {
            break;
        };

        match event {
            TransportEvent::Frame(InboundFrame::Audio(bytes)) => {
                play(&controller, pump.playback.handle_frame(&bytes));
            }
            TransportEvent::Frame(InboundFrame::Text(text)) => {
                for control in interpret_control(&text) {
                    handle_control(&controller, &pump, control);
                }
            }
            TransportEvent::Error(message) => {
                controller.metrics.record_error();
                controller.emit(VoiceEvent::Error {
                    session_id: Some(pump.session_id),
                    message: format!("Connection error: {}", message),
                });
                end_session(controller, pump.session_id);
                break;
            }
            TransportEvent::Closed(reason) => {
                info!(session_id = %pump.session_id, ?reason, "Voice endpoint ended the session");
                end_session(controller, pump.session_id);
                break;
            }
        }
    }
    debug!("Inbound pump finished");
}

fn handle_control(controller: &VoiceController, pump: &InboundPump, control: ControlEvent) {
    let session_id = pump.session_id;
    match control {
        ControlEvent::SetupComplete => debug!(%session_id, "Endpoint acknowledged setup"),
        ControlEvent::Text(text) => controller.emit(VoiceEvent::Text { session_id, text }),
        ControlEvent::Audio(pcm) => play(controller, pump.playback.play_pcm(&pcm)),
        ControlEvent::TurnComplete => controller.emit(VoiceEvent::TurnComplete { session_id }),
        ControlEvent::Interrupted => controller.emit(VoiceEvent::Interrupted { session_id }),
    }
}

fn play(controller: &VoiceController, result: VoiceResult<bool>) {
    match result {
        Ok(true) => controller.metrics.record_clip_played(),
        Ok(false) => {}
        Err(err) => {
            controller.metrics.record_error();
            warn!("Playback failed: {}", err);
        }
    }
}

/// Tear the session down from a separate task; teardown aborts this pump.
fn end_session(controller: Arc<VoiceController>, session_id: Uuid) {
    tokio::spawn(async move {
        controller.stop_session(session_id).await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::convert;
    use crate::transport::loopback::LoopbackServer;
    use std::sync::atomic::AtomicUsize;
    use tokio_tungstenite::tungstenite::Message;

    /// Microphone stand-in: hands the frame sender back to the test.
    #[derive(Default)]
    struct FakeCapture {
        deny: bool,
        open_delay: Option<Duration>,
        opened: AtomicUsize,
        live_graphs: Arc<AtomicUsize>,
        frames: Mutex<Option<mpsc::UnboundedSender<AudioFrame>>>,
        calls: Arc<Mutex<Vec<&'static str>>>,
    }

    struct FakeHandle {
        live_graphs: Arc<AtomicUsize>,
        calls: Arc<Mutex<Vec<&'static str>>>,
        closed: bool,
    }

    impl CaptureBackend for FakeCapture {
        fn open(
            &self,
            _frame_size: usize,
            frames: mpsc::UnboundedSender<AudioFrame>,
        ) -> VoiceResult<Box<dyn CaptureHandle>> {
            if self.deny {
                return Err(VoiceError::PermissionDenied("microphone blocked".to_string()));
            }
            self.opened.fetch_add(1, Ordering::SeqCst);
            self.live_graphs.fetch_add(1, Ordering::SeqCst);
            *self.frames.lock().unwrap() = Some(frames);
            if let Some(delay) = self.open_delay {
                std::thread::sleep(delay);
            }
            Ok(Box::new(FakeHandle {
                live_graphs: self.live_graphs.clone(),
                calls: self.calls.clone(),
                closed: false,
            }))
        }
    }

    impl CaptureHandle for FakeHandle {
        fn sample_rate(&self) -> u32 {
            16_000
        }

        fn disconnect(&mut self) -> VoiceResult<()> {
            self.calls.lock().unwrap().push("disconnect");
            Ok(())
        }

        fn stop_tracks(&mut self) -> VoiceResult<()> {
            self.calls.lock().unwrap().push("stop_tracks");
            // A failing step must not prevent the rest of the teardown
            Err(VoiceError::Device("track already ended".to_string()))
        }

        fn close(&mut self) -> VoiceResult<()> {
            self.calls.lock().unwrap().push("close");
            if !self.closed {
                self.closed = true;
                self.live_graphs.fetch_sub(1, Ordering::SeqCst);
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        clips: Mutex<Vec<Vec<u8>>>,
    }

    impl PlaybackSink for RecordingSink {
        fn play(&self, wav: Vec<u8>) -> VoiceResult<()> {
            self.clips.lock().unwrap().push(wav);
            Ok(())
        }
    }

    struct Harness {
        server: LoopbackServer,
        capture: Arc<FakeCapture>,
        sink: Arc<RecordingSink>,
        controller: Arc<VoiceController>,
    }

    async fn harness(capture: FakeCapture) -> Harness {
        let server = LoopbackServer::start().await;
        let mut config = AppConfig::default();
        config.voice.endpoint = server.url.clone();
        config.voice.connect_timeout_ms = 5_000;

        let capture = Arc::new(capture);
        let sink = Arc::new(RecordingSink::default());
        let controller = VoiceController::new(
            Arc::new(RwLock::new(config)),
            capture.clone(),
            sink.clone(),
        );
        Harness {
            server,
            capture,
            sink,
            controller,
        }
    }

    async fn eventually(mut condition: impl FnMut() -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn assert_no_error_events(events: &mut broadcast::Receiver<VoiceEvent>) {
        while let Ok(event) = events.try_recv() {
            assert!(!matches!(event, VoiceEvent::Error { .. }), "unexpected {:?}", event);
        }
    }

    fn push_frame(capture: &FakeCapture, value: f32) -> bool {
        let frames = capture.frames.lock().unwrap();
        frames
            .as_ref()
            .map(|tx| {
                tx.send(AudioFrame {
                    samples: vec![value; 160],
                    sample_rate: 16_000,
                })
                .is_ok()
            })
            .unwrap_or(false)
    }

    #[tokio::test]
    async fn test_stop_before_start_leaves_idle() {
        let h = harness(FakeCapture::default()).await;
        h.controller.stop().await;
        h.controller.stop().await;
        assert_eq!(h.controller.state(), SessionState::Idle);
        assert!(!h.controller.is_recording());
        assert_eq!(h.server.connections(), 0);
    }

    #[tokio::test]
    async fn test_double_start_creates_one_session() {
        let mut h = harness(FakeCapture::default()).await;

        let first = h.controller.start().await.unwrap();
        let second = h.controller.start().await.unwrap();
        assert!(matches!(first, StartOutcome::Started(_)));
        assert_eq!(second, StartOutcome::AlreadyActive(first.session_id()));

        assert!(h.server.next_text().await.contains("\"setup\""));
        assert_eq!(h.server.connections(), 1);
        assert_eq!(h.capture.opened.load(Ordering::SeqCst), 1);
        assert_eq!(h.capture.live_graphs.load(Ordering::SeqCst), 1);
        assert!(h.controller.is_recording());
        assert_eq!(h.controller.state(), SessionState::Open);

        h.controller.stop().await;
        assert_eq!(h.capture.live_graphs.load(Ordering::SeqCst), 0);
        assert_eq!(
            *h.capture.calls.lock().unwrap(),
            vec!["disconnect", "stop_tracks", "close"]
        );
        assert_eq!(h.controller.state(), SessionState::Closed);
        assert!(!h.controller.is_recording());
        h.server.wait_for_open(0).await;
    }

    #[tokio::test]
    async fn test_captured_frames_are_sent_until_stop() {
        let mut h = harness(FakeCapture::default()).await;
        h.controller.start().await.unwrap();
        assert!(h.server.next_text().await.contains("\"setup\""));

        assert!(push_frame(&h.capture, 0.5));
        let frame: serde_json::Value = serde_json::from_str(&h.server.next_text().await).unwrap();
        let chunk = frame["realtimeInput"]["media_chunks"][0].as_str().unwrap();
        assert_eq!(convert::from_base64(chunk).unwrap(), vec![16384; 160]);

        h.controller.stop().await;
        // Late frames from the device are never transmitted
        push_frame(&h.capture, 0.25);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(h.server.drain_texts().is_empty());
        assert_eq!(h.controller.metrics().frames_sent, 1);
    }

    #[tokio::test]
    async fn test_permission_denied_tears_down_connection() {
        let mut h = harness(FakeCapture {
            deny: true,
            ..FakeCapture::default()
        })
        .await;
        let mut events = h.controller.subscribe();

        let result = h.controller.start().await;
        assert!(matches!(result, Err(VoiceError::PermissionDenied(_))));
        // The transport connected first, then was torn down
        assert!(h.server.next_text().await.contains("\"setup\""));
        assert_eq!(h.server.connections(), 1);
        h.server.wait_for_open(0).await;
        assert_eq!(h.controller.state(), SessionState::Closed);
        assert!(!h.controller.is_recording());
        assert_eq!(h.controller.session_id(), None);

        let mut saw_error = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, VoiceEvent::Error { .. }) {
                saw_error = true;
            }
        }
        assert!(saw_error);

        // The controller is usable again afterwards
        h.controller.stop().await;
        assert_eq!(h.controller.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_inbound_binary_is_played() {
        let h = harness(FakeCapture::default()).await;
        h.controller.start().await.unwrap();

        let pcm = [10i16, -10, 20, -20];
        h.server.push(Message::Binary(convert::pcm_to_le_bytes(&pcm)));
        eventually(|| !h.sink.clips.lock().unwrap().is_empty()).await;

        let clips = h.sink.clips.lock().unwrap().clone();
        assert_eq!(clips[0], convert::to_wav_container(&pcm, 24_000));
        assert_eq!(h.controller.metrics().clips_played, 1);

        h.controller.stop().await;
    }

    #[tokio::test]
    async fn test_inbound_text_surfaces_as_event() {
        let h = harness(FakeCapture::default()).await;
        let started = h.controller.start().await.unwrap();
        let mut events = h.controller.subscribe();

        h.server.push(Message::Text(
            r#"{"serverContent":{"modelTurn":{"parts":[{"text":"Hi!"}]},"turnComplete":true}}"#.to_string(),
        ));

        let expected_text = VoiceEvent::Text {
            session_id: started.session_id(),
            text: "Hi!".to_string(),
        };
        let next = tokio::time::timeout(Duration::from_secs(5), events.recv()).await.unwrap().unwrap();
        assert_eq!(next, expected_text);
        let next = tokio::time::timeout(Duration::from_secs(5), events.recv()).await.unwrap().unwrap();
        assert_eq!(
            next,
            VoiceEvent::TurnComplete {
                session_id: started.session_id()
            }
        );

        h.controller.stop().await;
    }

    #[tokio::test]
    async fn test_remote_close_ends_session() {
        let mut h = harness(FakeCapture::default()).await;
        h.controller.start().await.unwrap();
        let mut recording = h.controller.watch_recording();
        assert!(*recording.borrow());

        h.server.push(Message::Close(None));
        tokio::time::timeout(Duration::from_secs(5), recording.wait_for(|on| !*on))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(h.capture.live_graphs.load(Ordering::SeqCst), 0);
        assert_eq!(h.controller.session_id(), None);

        // A fresh start after the endpoint hung up opens a new connection
        assert!(matches!(h.controller.start().await, Ok(StartOutcome::Started(_))));
        assert!(h.server.next_text().await.contains("\"setup\""));
        assert!(h.server.next_text().await.contains("\"setup\""));
        assert_eq!(h.server.connections(), 2);
        h.controller.stop().await;
    }

    #[tokio::test]
    async fn test_stop_while_connecting_cancels_start() {
        // The endpoint takes the TCP connection but never completes the upgrade
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut config = AppConfig::default();
        config.voice.endpoint = format!("ws://{}", listener.local_addr().unwrap());
        config.voice.connect_timeout_ms = 3_000;
        let holder = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(tcp);
        });

        let capture = Arc::new(FakeCapture::default());
        let controller = VoiceController::new(
            Arc::new(RwLock::new(config)),
            capture.clone(),
            Arc::new(RecordingSink::default()),
        );
        let mut events = controller.subscribe();

        let starting = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.start().await })
        };
        eventually(|| controller.state() == SessionState::Connecting).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        // Status reads do not wait for the handshake
        assert_eq!(controller.session_id(), None);

        let stopping = std::time::Instant::now();
        controller.stop().await;
        assert!(stopping.elapsed() < Duration::from_secs(1), "stop waited for the handshake");

        let result = tokio::time::timeout(Duration::from_secs(1), starting)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, Err(VoiceError::Cancelled));
        assert_eq!(capture.opened.load(Ordering::SeqCst), 0);
        assert_eq!(capture.live_graphs.load(Ordering::SeqCst), 0);
        assert_eq!(controller.state(), SessionState::Closed);
        assert!(!controller.is_recording());
        assert_eq!(controller.metrics().errors, 0);
        assert_no_error_events(&mut events);
        holder.abort();
    }

    #[tokio::test]
    async fn test_stop_while_opening_microphone_cancels_start() {
        let mut h = harness(FakeCapture {
            open_delay: Some(Duration::from_millis(300)),
            ..FakeCapture::default()
        })
        .await;
        let mut events = h.controller.subscribe();

        let starting = {
            let controller = h.controller.clone();
            tokio::spawn(async move { controller.start().await })
        };
        eventually(|| h.capture.opened.load(Ordering::SeqCst) == 1).await;

        h.controller.stop().await;
        let result = starting.await.unwrap();
        assert_eq!(result, Err(VoiceError::Cancelled));

        // The microphone opened late is released, the connection is closed
        assert_eq!(h.capture.live_graphs.load(Ordering::SeqCst), 0);
        assert_eq!(
            *h.capture.calls.lock().unwrap(),
            vec!["disconnect", "stop_tracks", "close"]
        );
        assert!(h.server.next_text().await.contains("\"setup\""));
        assert_eq!(h.server.connections(), 1);
        h.server.wait_for_open(0).await;

        assert_eq!(h.controller.state(), SessionState::Closed);
        assert!(!h.controller.is_recording());
        assert_eq!(h.controller.session_id(), None);
        assert_eq!(h.controller.metrics().sessions_started, 0);
        assert_no_error_events(&mut events);
    }

    #[tokio::test]
    async fn test_inbound_audio_after_stop_is_not_played() {
        let h = harness(FakeCapture::default()).await;
        h.controller.start().await.unwrap();

        let bytes = convert::pcm_to_le_bytes(&[100i16; 64]);
        for _ in 0..20 {
            h.server.push(Message::Binary(bytes.clone()));
        }
        h.controller.stop().await;
        let played = h.sink.clips.lock().unwrap().len();

        h.server.push(Message::Binary(bytes));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.sink.clips.lock().unwrap().len(), played);
        assert_eq!(h.controller.metrics().clips_played, played as u64);
    }
}
