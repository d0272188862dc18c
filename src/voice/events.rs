//! Notifications and counters the voice controller publishes to the UI.

use crate::transport::session::TransportState;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Lifecycle of the active voice session. Same states as the transport it wraps.
pub type SessionState = TransportState;

/// Broadcast to every event subscriber (the `/ws/voice` sockets).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VoiceEvent {
    SessionStarted { session_id: Uuid },
    SessionStopped { session_id: Uuid },
    Recording { recording: bool },
    State { state: SessionState },
    /// Conversational text from the endpoint, to append to the chat history
    Text { session_id: Uuid, text: String },
    TurnComplete { session_id: Uuid },
    Interrupted { session_id: Uuid },
    Error { session_id: Option<Uuid>, message: String },
}

/// Pipeline counters.
///
/// ## Thread Safety:
/// Plain atomics; updated from the pump tasks and read by the HTTP handlers
/// without any lock.
#[derive(Debug, Default)]
pub struct VoiceMetrics {
    frames_captured: AtomicU64,
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
    clips_played: AtomicU64,
    sessions_started: AtomicU64,
    errors: AtomicU64,
}

/// Point-in-time copy of [`VoiceMetrics`] for JSON responses.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub frames_captured: u64,
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub clips_played: u64,
    pub sessions_started: u64,
    pub errors: u64,
}

impl VoiceMetrics {
    pub fn record_frame_captured(&self) {
        self.frames_captured.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_frame_sent(&self) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_frame_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_clip_played(&self) {
        self.clips_played.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_session_started(&self) {
        self.sessions_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            clips_played: self.clips_played.load(Ordering::Relaxed),
            sessions_started: self.sessions_started.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}
