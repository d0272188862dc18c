//! # Capture Frame Assembly
//!
//! Audio devices hand the input callback blocks of whatever size suits the
//! driver, interleaved across however many channels the device has. The rest
//! of the pipeline wants fixed-size mono frames, so this buffer sits inside the
//! capture callback and regroups the samples.
//!
//! ## Key Features:
//! - **Downmix**: Interleaved multi-channel input is averaged to mono
//! - **Fixed framing**: Emits frames of exactly `frame_size` samples
//! - **No retention**: Partial data waits for the next callback; complete frames
//!   are handed out immediately and never kept

use std::collections::VecDeque;

/// One block of captured mono audio at the device's native rate.
///
/// Samples are floats in [-1.0, 1.0]. Ownership is transient: the frame is
/// consumed by the converter as soon as it is received.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

/// Configuration for frame assembly.
#[derive(Debug, Clone)]
pub struct FrameBufferConfig {
    /// Device sample rate (tagged onto every frame)
    pub sample_rate: u32,

    /// Interleaved channel count delivered by the device
    pub channels: u16,

    /// Samples per emitted frame
    pub frame_size: usize,
}

/// Regroups device callback data into fixed-size mono frames.
///
/// ## Memory Management:
/// Holds at most `frame_size - 1` samples between calls.
pub struct FrameBuffer {
    pending: VecDeque<f32>,
    config: FrameBufferConfig,
}

impl FrameBuffer {
    /// Create a new frame buffer. A frame size or channel count of zero is
    /// treated as one.
    pub fn new(mut config: FrameBufferConfig) -> Self {
        config.frame_size = config.frame_size.max(1);
        config.channels = config.channels.max(1);
        Self {
            pending: VecDeque::with_capacity(config.frame_size),
            config,
        }
    }

    /// Append interleaved device samples and return every frame completed by them.
    ///
    /// A trailing partial interleave group (fewer samples than channels) is
    /// dropped; drivers never split a group across callbacks in practice.
    pub fn push_interleaved(&mut self, data: &[f32]) -> Vec<AudioFrame> {
        let channels = self.config.channels as usize;
        if channels == 1 {
            self.pending.extend(data.iter().copied());
        } else {
            for group in data.chunks_exact(channels) {
                let mono = group.iter().sum::<f32>() / channels as f32;
                self.pending.push_back(mono);
            }
        }

        let mut frames = Vec::new();
        while self.pending.len() >= self.config.frame_size {
            let samples: Vec<f32> = self.pending.drain(..self.config.frame_size).collect();
            frames.push(AudioFrame {
                samples,
                sample_rate: self.config.sample_rate,
            });
        }
        frames
    }
}
