//! # Microphone Capture
//!
//! Acquires the default input device and delivers fixed-size mono frames to the
//! voice session over a channel.
//!
//! ## Threading:
//! Device streams are not `Send`, so each capture owns a dedicated
//! `voice-capture` thread that builds the stream, keeps it alive, and obeys
//! teardown commands. The input callback itself is statically defined here:
//! it downmixes, frames, and forwards, and nothing else.
//!
//! ## Teardown order:
//! 1. **disconnect**: the callback stops forwarding frames immediately
//! 2. **stop_tracks**: the device stream is paused
//! 3. **close**: the stream is dropped and the thread joined

use crate::audio::buffer::{AudioFrame, FrameBuffer, FrameBufferConfig};
use crate::audio::convert;
use crate::error::{VoiceError, VoiceResult};
use crate::transport::protocol::OutboundFrame;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc};
use std::thread::{self, JoinHandle};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

/// Something that can hand out microphone streams.
///
/// ## Why a trait:
/// The session controller only needs "open a capture that feeds this channel";
/// tests drive the controller with an in-memory source instead of hardware.
pub trait CaptureBackend: Send + Sync + 'static {
    /// Acquire the microphone and start delivering frames of `frame_size`
    /// samples to `frames`. Blocks until the device is running or has failed.
    fn open(
        &self,
        frame_size: usize,
        frames: UnboundedSender<AudioFrame>,
    ) -> VoiceResult<Box<dyn CaptureHandle>>;
}

/// A running capture graph. Each teardown step may fail independently.
pub trait CaptureHandle: Send {
    /// Native rate of the frames this capture produces.
    fn sample_rate(&self) -> u32;

    /// Stop forwarding frames. Frames produced afterwards are discarded.
    fn disconnect(&mut self) -> VoiceResult<()>;

    /// Stop the device tracks.
    fn stop_tracks(&mut self) -> VoiceResult<()>;

    /// Release the processing context. Further calls are no-ops.
    fn close(&mut self) -> VoiceResult<()>;
}

/// Turn one captured frame into a transport-ready realtime-input frame.
///
/// quantize → resample to `target_rate` → base64.
pub fn encode_frame(frame: &AudioFrame, target_rate: u32) -> OutboundFrame {
    let pcm = convert::quantize(&frame.samples);
    let pcm = convert::resample(&pcm, frame.sample_rate, target_rate);
    OutboundFrame::audio(convert::to_base64(&pcm))
}

/// Capture from the host's default input device.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalCapture;

enum DeviceCommand {
    Pause(std_mpsc::Sender<VoiceResult<()>>),
    Close,
}

impl CaptureBackend for CpalCapture {
    fn open(
        &self,
        frame_size: usize,
        frames: UnboundedSender<AudioFrame>,
    ) -> VoiceResult<Box<dyn CaptureHandle>> {
        let forwarding = Arc::new(AtomicBool::new(true));
        let (ready_tx, ready_rx) = std_mpsc::channel::<VoiceResult<u32>>();
        let (command_tx, command_rx) = std_mpsc::channel::<DeviceCommand>();

        let thread_forwarding = forwarding.clone();
        let thread = thread::Builder::new()
            .name("voice-capture".into())
            .spawn(move || run_device_thread(frame_size, frames, thread_forwarding, ready_tx, command_rx))
            .map_err(|e| VoiceError::Device(format!("Failed to spawn capture thread: {}", e)))?;

        match ready_rx.recv() {
            Ok(Ok(sample_rate)) => {
                info!(sample_rate, frame_size, "Microphone capture started");
                Ok(Box::new(CpalCaptureHandle {
                    sample_rate,
                    forwarding,
                    commands: Some(command_tx),
                    thread: Some(thread),
                }))
            }
            Ok(Err(err)) => {
                let _ = thread.join();
                Err(err)
            }
            Err(_) => {
                let _ = thread.join();
                Err(VoiceError::Device("Capture thread exited before the device was ready".to_string()))
            }
        }
    }
}

/// Body of the `voice-capture` thread: own the stream until told to close.
fn run_device_thread(
    frame_size: usize,
    frames: UnboundedSender<AudioFrame>,
    forwarding: Arc<AtomicBool>,
    ready: std_mpsc::Sender<VoiceResult<u32>>,
    commands: std_mpsc::Receiver<DeviceCommand>,
) {
    let (stream, sample_rate) = match open_input_stream(frame_size, frames, forwarding) {
        Ok(opened) => opened,
        Err(err) => {
            let _ = ready.send(Err(err));
            return;
        }
    };
    let _ = ready.send(Ok(sample_rate));

    // A dropped sender ends the loop just like an explicit Close.
    for command in commands {
        match command {
            DeviceCommand::Pause(reply) => {
                let result = stream
                    .pause()
                    .map_err(|e| VoiceError::Device(format!("Failed to stop input stream: {}", e)));
                let _ = reply.send(result);
            }
            DeviceCommand::Close => break,
        }
    }

    drop(stream);
    debug!("Capture stream released");
}

fn open_input_stream(
    frame_size: usize,
    frames: UnboundedSender<AudioFrame>,
    forwarding: Arc<AtomicBool>,
) -> VoiceResult<(cpal::Stream, u32)> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| VoiceError::PermissionDenied("No input device available".to_string()))?;

    let supported = device.default_input_config().map_err(|e| match e {
        cpal::DefaultStreamConfigError::DeviceNotAvailable => {
            VoiceError::PermissionDenied("Input device is not available".to_string())
        }
        other => VoiceError::Device(format!("Failed to query input config: {}", other)),
    })?;

    let sample_format = supported.sample_format();
    let config: cpal::StreamConfig = supported.into();
    let sample_rate = config.sample_rate.0;

    debug!(
        device = %device.name().unwrap_or_else(|_| "unknown".to_string()),
        sample_rate,
        channels = config.channels,
        format = ?sample_format,
        "Opening input stream"
    );

    let buffer = FrameBuffer::new(FrameBufferConfig {
        sample_rate,
        channels: config.channels,
        frame_size,
    });

    let stream = match sample_format {
        SampleFormat::F32 => build_stream::<f32>(&device, &config, buffer, frames, forwarding),
        SampleFormat::I16 => build_stream::<i16>(&device, &config, buffer, frames, forwarding),
        SampleFormat::U16 => build_stream::<u16>(&device, &config, buffer, frames, forwarding),
        other => {
            return Err(VoiceError::Device(format!("Unsupported input sample format: {:?}", other)));
        }
    }
    .map_err(|e| match e {
        cpal::BuildStreamError::DeviceNotAvailable => {
            VoiceError::PermissionDenied("Input device is not available".to_string())
        }
        other => VoiceError::Device(format!("Failed to build input stream: {}", other)),
    })?;

    stream
        .play()
        .map_err(|e| VoiceError::Device(format!("Failed to start input stream: {}", e)))?;

    Ok((stream, sample_rate))
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut buffer: FrameBuffer,
    frames: UnboundedSender<AudioFrame>,
    forwarding: Arc<AtomicBool>,
) -> Result<cpal::Stream, cpal::BuildStreamError>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let mut scratch: Vec<f32> = Vec::new();
    device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            if !forwarding.load(Ordering::Acquire) {
                return;
            }
            scratch.clear();
            scratch.extend(data.iter().map(|&sample| f32::from_sample(sample)));
            for frame in buffer.push_interleaved(&scratch) {
                if frames.send(frame).is_err() {
                    // Receiver gone: the session ended
                    forwarding.store(false, Ordering::Release);
                    return;
                }
            }
        },
        |err| warn!(error = %err, "Input stream error"),
        None,
    )
}

/// Handle to a capture running on its own thread.
pub struct CpalCaptureHandle {
    sample_rate: u32,
    forwarding: Arc<AtomicBool>,
    commands: Option<std_mpsc::Sender<DeviceCommand>>,
    thread: Option<JoinHandle<()>>,
}

impl CaptureHandle for CpalCaptureHandle {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn disconnect(&mut self) -> VoiceResult<()> {
        self.forwarding.store(false, Ordering::Release);
        Ok(())
    }

    fn stop_tracks(&mut self) -> VoiceResult<()> {
        let Some(commands) = &self.commands else {
            return Ok(());
        };
        let (reply_tx, reply_rx) = std_mpsc::channel();
        commands
            .send(DeviceCommand::Pause(reply_tx))
            .map_err(|_| VoiceError::Device("Capture thread is gone".to_string()))?;
        reply_rx
            .recv()
            .map_err(|_| VoiceError::Device("Capture thread did not answer".to_string()))?
    }

    fn close(&mut self) -> VoiceResult<()> {
        self.forwarding.store(false, Ordering::Release);
        if let Some(commands) = self.commands.take() {
            let _ = commands.send(DeviceCommand::Close);
        }
        if let Some(thread) = self.thread.take() {
            thread
                .join()
                .map_err(|_| VoiceError::Device("Capture thread panicked".to_string()))?;
        }
        Ok(())
    }
}

impl Drop for CpalCaptureHandle {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!("Capture teardown on drop failed: {}", err);
        }
    }
}
