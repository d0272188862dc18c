//! # Voice Session
//!
//! The collaborator interface the UI talks to: start, stop, an "is recording"
//! observable and a stream of events carrying inbound text.

pub mod controller;
pub mod events;

pub use controller::{StartOutcome, VoiceController};
pub use events::VoiceEvent;
