//! # Response Playback
//!
//! Plays inbound PCM from the voice endpoint as soon as it arrives.
//!
//! ## Flow:
//! binary frame → i16 LE samples @ receive rate → WAV container → output device
//!
//! Playback is fire-and-forget: every clip starts immediately and clips that
//! overlap in time are mixed, not queued.

use crate::audio::convert;
use crate::error::{VoiceError, VoiceResult};

use rodio::{OutputStream, Source};
use std::io::Cursor;
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::thread;
use tracing::{debug, info, warn};

/// Destination for encoded audio clips.
pub trait PlaybackSink: Send + Sync + 'static {
    /// Start playing one WAV clip. Must not block until the clip ends.
    fn play(&self, wav: Vec<u8>) -> VoiceResult<()>;
}

/// Turns inbound PCM into playable clips for a [`PlaybackSink`].
#[derive(Clone)]
pub struct PlaybackStage {
    sink: Arc<dyn PlaybackSink>,
    sample_rate: u32,
}

impl PlaybackStage {
    pub fn new(sink: Arc<dyn PlaybackSink>, sample_rate: u32) -> Self {
        Self { sink, sample_rate }
    }

    /// Play one binary frame of little-endian 16-bit PCM.
    ///
    /// ## Returns:
    /// - `Ok(true)`: A clip was handed to the sink
    /// - `Ok(false)`: The frame held no complete sample and was skipped
    pub fn handle_frame(&self, bytes: &[u8]) -> VoiceResult<bool> {
        let pcm = convert::pcm_from_le_bytes(bytes);
        self.play_pcm(&pcm)
    }

    /// Play already-decoded PCM, e.g. inline audio from a JSON message.
    pub fn play_pcm(&self, pcm: &[i16]) -> VoiceResult<bool> {
        if pcm.is_empty() {
            return Ok(false);
        }
        let wav = convert::to_wav_container(pcm, self.sample_rate);
        self.sink.play(wav)?;
        Ok(true)
    }
}

/// Default output device, owned by a `voice-playback` thread.
///
/// Output streams are not `Send`, so the thread holds the stream for the life
/// of the process and receives clips over a channel.
pub struct RodioPlayback {
    clips: Mutex<std_mpsc::Sender<Vec<u8>>>,
}

impl RodioPlayback {
    /// Spawn the playback thread. A missing output device is not an error:
    /// clips are then discarded with a warning.
    pub fn start() -> VoiceResult<Self> {
        let (clips_tx, clips_rx) = std_mpsc::channel::<Vec<u8>>();
        thread::Builder::new()
            .name("voice-playback".into())
            .spawn(move || run_output_thread(clips_rx))
            .map_err(|e| VoiceError::Playback(format!("Failed to spawn playback thread: {}", e)))?;
        Ok(Self {
            clips: Mutex::new(clips_tx),
        })
    }
}

impl PlaybackSink for RodioPlayback {
    fn play(&self, wav: Vec<u8>) -> VoiceResult<()> {
        let clips = self
            .clips
            .lock()
            .map_err(|_| VoiceError::Playback("Playback channel poisoned".to_string()))?;
        clips
            .send(wav)
            .map_err(|_| VoiceError::Playback("Playback thread is gone".to_string()))
    }
}

fn run_output_thread(clips: std_mpsc::Receiver<Vec<u8>>) {
    let (_stream, handle) = match OutputStream::try_default() {
        Ok(output) => output,
        Err(err) => {
            warn!(error = %err, "No audio output device, voice responses will be silent");
            for _ in clips {}
            return;
        }
    };
    info!("Audio output ready");

    for wav in clips {
        let decoder = match rodio::Decoder::new(Cursor::new(wav)) {
            Ok(decoder) => decoder,
            Err(err) => {
                warn!(error = %err, "Discarding undecodable clip");
                continue;
            }
        };
        let duration = decoder.total_duration();
        if let Err(err) = handle.play_raw(decoder.convert_samples()) {
            warn!(error = %err, "Failed to play clip");
            continue;
        }
        debug!(?duration, "Clip started");
    }
    debug!("Playback thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;

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

    #[test]
    fn test_binary_frame_becomes_wav_clip() {
        let sink = Arc::new(RecordingSink::default());
        let stage = PlaybackStage::new(sink.clone(), 24_000);

        let frame = convert::pcm_to_le_bytes(&[100, -100, 0]);
        assert!(stage.handle_frame(&frame).unwrap());

        let clips = sink.clips.lock().unwrap();
        assert_eq!(clips.len(), 1);
        assert_eq!(clips[0], convert::to_wav_container(&[100, -100, 0], 24_000));
    }

    #[test]
    fn test_empty_frame_is_skipped() {
        let sink = Arc::new(RecordingSink::default());
        let stage = PlaybackStage::new(sink.clone(), 24_000);

        assert!(!stage.handle_frame(&[]).unwrap());
        assert!(!stage.handle_frame(&[7]).unwrap());
        assert!(sink.clips.lock().unwrap().is_empty());
    }

    #[test]
    fn test_overlapping_frames_are_not_merged() {
        let sink = Arc::new(RecordingSink::default());
        let stage = PlaybackStage::new(sink.clone(), 24_000);

        stage.play_pcm(&[1; 10]).unwrap();
        stage.play_pcm(&[2; 10]).unwrap();
        assert_eq!(sink.clips.lock().unwrap().len(), 2);
    }
}
