//! # Audio Pipeline
//!
//! Everything that touches samples: capture from the microphone, conversion to
//! the endpoint's wire format, and playback of responses.
//!
//! ## Key Components:
//! - **Buffer**: Regroups device callbacks into fixed-size mono frames
//! - **Capture**: Microphone stream on its own thread
//! - **Convert**: Quantize, downsample, base64 and WAV helpers
//! - **Playback**: Fire-and-forget clip output
//!
//! ## Audio Formats:
//! - **Outbound**: 16kHz, 16-bit PCM, mono, little-endian, base64 in JSON
//! - **Inbound**: 24kHz, 16-bit PCM, mono, little-endian, raw binary frames

pub mod buffer;
pub mod capture;
pub mod convert;
pub mod playback;
