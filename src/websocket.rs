//! # Voice Event WebSocket
//!
//! The browser UI connects to `/ws/voice` to drive the voice session and to
//! follow it: recording flag, state changes, and the conversational text that
//! belongs in the chat history.
//!
//! ## WebSocket Protocol:
//! 1. **Connection**: The server immediately sends the current `recording` and
//!    `state` so the UI can render without polling
//! 2. **Control**: `start_voice` / `stop_voice` from the client
//! 3. **Events**: Every [`VoiceEvent`] is forwarded as JSON tagged by `type`
//! 4. **Heartbeat**: `ping` every 30 s; no client traffic for 60 s closes the socket
//!
//! ## Message Format:
//! - **Client → Server**: `{"type": "start_voice"}`, `{"type": "stop_voice"}`,
//!   `{"type": "ping", "timestamp": 1}`, `{"type": "pong", "timestamp": 1}`
//! - **Server → Client**: voice events plus `ping`, `pong` and `error`

use crate::state::AppState;
use crate::voice::{StartOutcome, VoiceController, VoiceEvent};

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info, warn};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Messages the UI may send.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    StartVoice,
    StopVoice,
    Ping { timestamp: u64 },
    Pong { timestamp: u64 },
}

/// Socket-level messages that are not voice events.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SocketMessage {
    Ping { timestamp: u64 },
    Pong { timestamp: u64 },
    Error { code: String, message: String },
}

/// One actor per connected UI.
pub struct VoiceEventSocket {
    voice: Arc<VoiceController>,
    last_heartbeat: Instant,
}

impl VoiceEventSocket {
    pub fn new(voice: Arc<VoiceController>) -> Self {
        Self {
            voice,
            last_heartbeat: Instant::now(),
        }
    }

    fn send_json<T: Serialize>(&self, ctx: &mut ws::WebsocketContext<Self>, message: &T) {
        match serde_json::to_string(message) {
            Ok(json) => ctx.text(json),
            Err(err) => warn!("Failed to encode WebSocket message: {}", err),
        }
    }

    fn send_error(&self, ctx: &mut ws::WebsocketContext<Self>, code: &str, message: &str) {
        self.send_json(
            ctx,
            &SocketMessage::Error {
                code: code.to_string(),
                message: message.to_string(),
            },
        );
        warn!("WebSocket error {}: {}", code, message);
    }

    fn handle_client_message(&mut self, message: ClientMessage, ctx: &mut ws::WebsocketContext<Self>) {
        match message {
            ClientMessage::StartVoice => {
                let voice = self.voice.clone();
                let start = async move { voice.start().await };
                ctx.spawn(start.into_actor(self).map(|result, act, ctx| match result {
                    // Started is broadcast to every socket; only the caller hears about a no-op
                    Ok(StartOutcome::AlreadyActive(session_id)) => {
                        act.send_json(ctx, &VoiceEvent::SessionStarted { session_id });
                    }
                    Ok(StartOutcome::Started(_)) => {}
                    // Failures are broadcast as error events by the controller
                    Err(err) => debug!("start_voice from WebSocket failed: {}", err),
                }));
            }
            ClientMessage::StopVoice => {
                let voice = self.voice.clone();
                ctx.spawn(async move { voice.stop().await }.into_actor(self));
            }
            ClientMessage::Ping { timestamp } => {
                self.send_json(ctx, &SocketMessage::Pong { timestamp });
            }
            ClientMessage::Pong { .. } => {}
        }
    }
}

impl Actor for VoiceEventSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!("Voice event WebSocket connected");

        self.send_json(ctx, &VoiceEvent::Recording {
            recording: self.voice.is_recording(),
        });
        self.send_json(ctx, &VoiceEvent::State {
            state: self.voice.state(),
        });
        ctx.add_stream(BroadcastStream::new(self.voice.subscribe()));

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!("WebSocket heartbeat timeout, closing connection");
                ctx.stop();
                return;
            }
            let timestamp = chrono::Utc::now().timestamp_millis().max(0) as u64;
            act.send_json(ctx, &SocketMessage::Ping { timestamp });
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        // The voice session outlives the UI socket; closing a tab does not stop it
        info!("Voice event WebSocket disconnected");
    }
}

/// Voice events → client.
impl StreamHandler<Result<VoiceEvent, BroadcastStreamRecvError>> for VoiceEventSocket {
    fn handle(&mut self, item: Result<VoiceEvent, BroadcastStreamRecvError>, ctx: &mut Self::Context) {
        match item {
            Ok(event) => self.send_json(ctx, &event),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!(skipped, "Voice event socket lagged behind");
                self.send_error(ctx, "lagged", &format!("{} voice events were skipped", skipped));
            }
        }
    }

    // The event stream ending must not close the socket
    fn finished(&mut self, _ctx: &mut Self::Context) {}
}

/// Client frames.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for VoiceEventSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        self.last_heartbeat = Instant::now();
        match msg {
            Ok(ws::Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(message) => self.handle_client_message(message, ctx),
                Err(err) => self.send_error(ctx, "invalid_message", &err.to_string()),
            },
            Ok(ws::Message::Binary(_)) => {
                self.send_error(ctx, "unsupported", "Binary messages are not accepted on this socket");
            }
            Ok(ws::Message::Ping(bytes)) => ctx.pong(&bytes),
            Ok(ws::Message::Pong(_)) => {}
            Ok(ws::Message::Close(reason)) => {
                debug!(?reason, "Client closed voice event WebSocket");
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) | Ok(ws::Message::Nop) => {}
            Err(err) => {
                warn!("WebSocket protocol error: {}", err);
                ctx.stop();
            }
        }
    }
}

/// Upgrade `GET /ws/voice` to a [`VoiceEventSocket`].
pub async fn voice_websocket(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    info!("New voice WebSocket connection from: {:?}", req.connection_info().peer_addr());
    ws::start(VoiceEventSocket::new(app_state.voice.clone()), &req, stream)
}
