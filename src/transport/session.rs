//! # Transport Session
//!
//! One WebSocket connection to the streaming endpoint, driven through an
//! explicit state machine:
//!
//! ```text
//! Idle -> Connecting -> Open -> Closing -> Closed
//!                        \______________/^  (error or remote close)
//! ```
//!
//! ## Responsibilities:
//! - Send the setup frame immediately after the handshake completes
//! - Send outbound frames only while Open; anything else is dropped, not queued
//! - Forward every inbound frame and the final close/error as [`TransportEvent`]s
//!
//! The session never reconnects. A dropped connection ends the voice turn and
//! the owner decides what to tear down.

use crate::error::{VoiceError, VoiceResult};
use crate::transport::protocol::{InboundFrame, OutboundFrame, SetupFrame};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// Upper bound on the close handshake.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Connection lifecycle of a transport session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportState {
    Idle,
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Everything the connection reports back to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Frame(InboundFrame),
    /// The socket failed; the session is already Closed
    Error(String),
    /// The remote side closed the socket, with its reason if it gave one
    Closed(Option<String>),
}

/// What happened to one outbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// The session was not Open; the frame was discarded
    Dropped,
    /// The write failed; the session is now Closed
    Failed,
}

/// A single-use WebSocket session. Once Closed it stays Closed.
pub struct TransportSession {
    state: Arc<Mutex<TransportState>>,
    sink: Arc<tokio::sync::Mutex<Option<WsSink>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    events: UnboundedSender<TransportEvent>,
    /// Raised by `close`; an in-flight handshake gives up as soon as it is set
    cancel: watch::Sender<bool>,
    sent: AtomicU64,
    dropped: AtomicU64,
}

impl TransportSession {
    /// Create an idle session that will report to `events`.
    pub fn new(events: UnboundedSender<TransportEvent>) -> Self {
        Self {
            state: Arc::new(Mutex::new(TransportState::Idle)),
            sink: Arc::new(tokio::sync::Mutex::new(None)),
            reader: Mutex::new(None),
            events,
            cancel: watch::channel(false).0,
            sent: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> TransportState {
        read_state(&self.state)
    }

    /// Frames written to the socket so far (setup included).
    pub fn frames_sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Frames discarded because the session was not Open.
    pub fn frames_dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Open the connection and declare the session with `setup`.
    ///
    /// ## Parameters:
    /// - `url`: Full endpoint URL, API key included
    /// - `setup`: Sent as the very first frame once the handshake completes
    /// - `timeout`: Upper bound on the handshake
    ///
    /// ## Returns:
    /// - `Ok(())`: The session is Open and the setup frame was written
    /// - `Err(Connection)`: Handshake failed, timed out, or the setup write failed
    /// - `Err(Cancelled)`: [`close`](Self::close) was called before or while connecting
    pub async fn connect(&self, url: &str, setup: &SetupFrame, timeout: Duration) -> VoiceResult<()> {
        {
            let mut state = lock_state(&self.state);
            if *state == TransportState::Closed {
                return Err(VoiceError::Cancelled);
            }
            if *state != TransportState::Idle {
                return Err(VoiceError::Connection(format!(
                    "Transport session cannot connect from state {:?}",
                    *state
                )));
            }
            *state = TransportState::Connecting;
        }

        debug!(endpoint = %redact_key(url), "Connecting to voice endpoint");
        let mut cancelled = self.cancel.subscribe();
        let handshake = tokio::select! {
            result = tokio::time::timeout(timeout, connect_async(url)) => result,
            _ = cancelled.wait_for(|cancelled| *cancelled) => {
                set_state(&self.state, TransportState::Closed);
                debug!("Handshake abandoned: transport closed while connecting");
                return Err(VoiceError::Cancelled);
            }
        };
        let ws = match handshake {
            Ok(Ok((ws, _response))) => ws,
            Ok(Err(err)) => {
                set_state(&self.state, TransportState::Closed);
                return Err(VoiceError::Connection(format!("WebSocket handshake failed: {}", err)));
            }
            Err(_) => {
                set_state(&self.state, TransportState::Closed);
                return Err(VoiceError::Connection(format!(
                    "WebSocket handshake timed out after {} ms",
                    timeout.as_millis()
                )));
            }
        };

        let (sink, stream) = ws.split();
        *self.sink.lock().await = Some(sink);

        let opened = {
            let mut state = lock_state(&self.state);
            if *state == TransportState::Connecting {
                *state = TransportState::Open;
                true
            } else {
                false
            }
        };

        if !opened {
            // Closed while the handshake was in flight
            if let Some(mut sink) = self.sink.lock().await.take() {
                let _ = tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await;
            }
            return Err(VoiceError::Cancelled);
        }

        let reader = tokio::spawn(read_loop(stream, self.state.clone(), self.events.clone()));
        if let Ok(mut slot) = self.reader.lock() {
            *slot = Some(reader);
        }
        info!("Voice endpoint connected");

        match self.send(&OutboundFrame::Setup(setup.clone())).await {
            SendOutcome::Sent => Ok(()),
            SendOutcome::Dropped => Err(VoiceError::Cancelled),
            SendOutcome::Failed => Err(VoiceError::Connection("Failed to send setup frame".to_string())),
        }
    }

    /// Write one frame if the session is Open.
    ///
    /// Late sends during teardown are expected and only logged at debug level.
    pub async fn send(&self, frame: &OutboundFrame) -> SendOutcome {
        let state = self.state();
        if state != TransportState::Open {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            debug!(kind = ?frame.kind(), ?state, "Dropping outbound frame: transport not open");
            return SendOutcome::Dropped;
        }

        let json = match frame.to_json() {
            Ok(json) => json,
            Err(err) => {
                warn!("{}", err);
                return SendOutcome::Failed;
            }
        };

        let mut sink = self.sink.lock().await;
        let Some(writer) = sink.as_mut() else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return SendOutcome::Dropped;
        };

        let written = writer.send(Message::Text(json)).await;
        match written {
            Ok(()) => {
                self.sent.fetch_add(1, Ordering::Relaxed);
                SendOutcome::Sent
            }
            Err(err) => {
                sink.take();
                if mark_closed(&self.state) {
                    let _ = self.events.send(TransportEvent::Error(format!("Write failed: {}", err)));
                }
                warn!(error = %err, "Outbound write failed, transport closed");
                SendOutcome::Failed
            }
        }
    }

    /// Close the session and release the socket. Safe from any state.
    ///
    /// Idle goes straight to Closed, Connecting is cancelled, Open passes
    /// through Closing and performs the close handshake, Closed only releases
    /// whatever is left of the socket.
    pub async fn close(&self) {
        self.cancel.send_replace(true);
        let handshake = {
            let mut state = lock_state(&self.state);
            match *state {
                TransportState::Closing => return,
                TransportState::Open => {
                    *state = TransportState::Closing;
                    true
                }
                _ => {
                    *state = TransportState::Closed;
                    false
                }
            }
        };

        let sink = self.sink.lock().await.take();
        if let (Some(mut sink), true) = (sink, handshake) {
            match tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await {
                Ok(Ok(())) => debug!("Close frame sent"),
                Ok(Err(err)) => debug!(error = %err, "Close handshake failed"),
                Err(_) => debug!("Close handshake timed out"),
            }
        }

        if let Some(reader) = self.reader.lock().ok().and_then(|mut slot| slot.take()) {
            reader.abort();
        }

        set_state(&self.state, TransportState::Closed);
        if handshake {
            info!("Voice endpoint connection closed");
        }
    }
}

impl Drop for TransportSession {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.get_mut().ok().and_then(|slot| slot.take()) {
            reader.abort();
        }
    }
}

/// Forward inbound frames until the socket ends.
async fn read_loop(
    mut stream: SplitStream<WsStream>,
    state: Arc<Mutex<TransportState>>,
    events: UnboundedSender<TransportEvent>,
) {
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => {
                let _ = events.send(TransportEvent::Frame(InboundFrame::Text(text)));
            }
            Ok(Message::Binary(bytes)) => {
                let _ = events.send(TransportEvent::Frame(InboundFrame::Audio(bytes)));
            }
            Ok(Message::Close(frame)) => {
                let reason = frame
                    .map(|f| f.reason.to_string())
                    .filter(|reason| !reason.is_empty());
                if mark_closed(&state) {
                    info!(?reason, "Voice endpoint closed the connection");
                    let _ = events.send(TransportEvent::Closed(reason));
                }
                return;
            }
            Ok(_) => {}
            Err(err) => {
                if mark_closed(&state) {
                    warn!(error = %err, "Voice endpoint connection failed");
                    let _ = events.send(TransportEvent::Error(err.to_string()));
                }
                return;
            }
        }
    }

    if mark_closed(&state) {
        let _ = events.send(TransportEvent::Closed(None));
    }
}

fn lock_state(state: &Mutex<TransportState>) -> std::sync::MutexGuard<'_, TransportState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn read_state(state: &Mutex<TransportState>) -> TransportState {
    *lock_state(state)
}

fn set_state(state: &Mutex<TransportState>, next: TransportState) {
    *lock_state(state) = next;
}

/// Move an Open session to Closed. Returns false if the owner was already
/// closing it, in which case no event should be reported.
fn mark_closed(state: &Mutex<TransportState>) -> bool {
    let mut state = lock_state(state);
    let was_open = *state == TransportState::Open;
    *state = TransportState::Closed;
    was_open
}

/// Keep API keys out of the logs.
fn redact_key(url: &str) -> String {
    match url.find("key=") {
        Some(index) => {
            let tail = &url[index + 4..];
            let end = tail.find('&').map(|i| index + 4 + i).unwrap_or(url.len());
            format!("{}***{}", &url[..index + 4], &url[end..])
        }
        None => url.to_string(),
    }
}
