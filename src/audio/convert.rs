//! # Sample Conversion
//!
//! Pure numeric transforms between the representations the voice pipeline
//! passes around:
//!
//! ```text
//! f32 frame ──quantize──▶ i16 PCM ──resample──▶ i16 PCM @16k ──to_base64──▶ realtime frame
//! binary frame ──pcm_from_le_bytes──▶ i16 PCM @24k ──to_wav_container──▶ playback
//! ```
//!
//! ## PCM Format:
//! - **Bit Depth**: 16-bit signed
//! - **Channels**: Mono (1 channel)
//! - **Encoding**: Little-endian
//!
//! Every function here is deterministic; the same input always yields the same
//! bytes, which is what makes the container round-trip testable.

use crate::error::{VoiceError, VoiceResult};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use byteorder::{ByteOrder, LittleEndian};
use tracing::warn;

/// Size of the RIFF/WAVE header written by [`to_wav_container`].
pub const WAV_HEADER_LEN: usize = 44;

/// Convert float samples in [-1.0, 1.0] to 16-bit PCM.
///
/// ## Conversion:
/// - Samples are clamped to [-1.0, 1.0] first
/// - Positive values scale by 32767, negative values by 32768, so both ends of
///   the i16 range are reachable
/// - The scaled value is rounded to the nearest integer
/// - NaN becomes silence
pub fn quantize(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&sample| {
            if sample.is_nan() {
                return 0;
            }
            let clamped = sample.clamp(-1.0, 1.0);
            let scaled = if clamped < 0.0 { clamped * 32768.0 } else { clamped * 32767.0 };
            scaled.round() as i16
        })
        .collect()
}

/// Downsample PCM by block averaging, or fail on an unsupported rate pair.
///
/// ## Algorithm:
/// With `ratio = source_rate / target_rate`, output sample `i` is the mean of the
/// input samples whose index falls in `[round(i * ratio), round((i + 1) * ratio))`,
/// rounded and clamped to the i16 range. The output holds
/// `round(len / ratio)` samples. An interval with no input sample in it (only
/// possible at the tail) repeats the previous output value.
///
/// ## Errors:
/// `UnsupportedRate` when `target_rate > source_rate` or either rate is zero.
pub fn try_resample(samples: &[i16], source_rate: u32, target_rate: u32) -> VoiceResult<Vec<i16>> {
    if source_rate == target_rate {
        return Ok(samples.to_vec());
    }
    if source_rate == 0 || target_rate == 0 || target_rate > source_rate {
        return Err(VoiceError::UnsupportedRate { source_rate, target_rate });
    }

    let ratio = source_rate as f64 / target_rate as f64;
    let output_len = (samples.len() as f64 / ratio).round() as usize;
    let mut output = Vec::with_capacity(output_len);

    let mut offset = 0usize;
    let mut previous = 0i16;
    for i in 0..output_len {
        let next_offset = (((i + 1) as f64) * ratio).round() as usize;
        let end = next_offset.min(samples.len());

        let block = if offset < end { &samples[offset..end] } else { &[][..] };
        let value = if block.is_empty() {
            previous
        } else {
            let sum: i64 = block.iter().map(|&s| s as i64).sum();
            let mean = sum as f64 / block.len() as f64;
            mean.round().clamp(i16::MIN as f64, i16::MAX as f64) as i16
        };

        output.push(value);
        previous = value;
        offset = next_offset;
    }

    Ok(output)
}

/// Downsample PCM, passing the input through unchanged on an unsupported rate pair.
///
/// An upsampling request is a caller configuration error rather than a runtime
/// fault, so the pipeline keeps running and the condition is logged.
pub fn resample(samples: &[i16], source_rate: u32, target_rate: u32) -> Vec<i16> {
    match try_resample(samples, source_rate, target_rate) {
        Ok(resampled) => resampled,
        Err(err) => {
            warn!(source_rate, target_rate, "{}; passing audio through unchanged", err);
            samples.to_vec()
        }
    }
}

/// Serialize PCM samples to their little-endian byte representation.
pub fn pcm_to_le_bytes(samples: &[i16]) -> Vec<u8> {
    let mut bytes = vec![0u8; samples.len() * 2];
    LittleEndian::write_i16_into(samples, &mut bytes);
    bytes
}

/// Interpret little-endian bytes as 16-bit PCM samples.
///
/// A trailing odd byte cannot form a sample and is ignored.
pub fn pcm_from_le_bytes(bytes: &[u8]) -> Vec<i16> {
    let even_len = bytes.len() - bytes.len() % 2;
    let mut samples = vec![0i16; even_len / 2];
    LittleEndian::read_i16_into(&bytes[..even_len], &mut samples);
    samples
}

/// Standard base64 of the little-endian PCM buffer.
pub fn to_base64(samples: &[i16]) -> String {
    STANDARD.encode(pcm_to_le_bytes(samples))
}

/// Decode standard base64 back into PCM samples.
pub fn from_base64(encoded: &str) -> VoiceResult<Vec<i16>> {
    let bytes = STANDARD
        .decode(encoded)
        .map_err(|e| VoiceError::Protocol(format!("Invalid base64 audio: {}", e)))?;
    if bytes.len() % 2 != 0 {
        return Err(VoiceError::Protocol("Audio data length must be even for 16-bit samples".to_string()));
    }
    Ok(pcm_from_le_bytes(&bytes))
}

/// Wrap raw PCM in a minimal uncompressed WAV container.
///
/// ## Layout (all integers little-endian):
/// | Offset | Field                         |
/// |--------|-------------------------------|
/// | 0      | `RIFF`, chunk size = 36 + N   |
/// | 8      | `WAVE`                        |
/// | 12     | `fmt `, 16, format 1 (PCM)    |
/// | 22     | channels 1, sample rate       |
/// | 28     | byte rate, block align 2, 16  |
/// | 36     | `data`, data size = N         |
/// | 44     | N bytes of samples            |
pub fn to_wav_container(samples: &[i16], sample_rate: u32) -> Vec<u8> {
    let data_len = samples.len() * 2;
    let (riff_size, data_size) = chunk_sizes(data_len);
    let mut out = vec![0u8; WAV_HEADER_LEN + data_len];

    out[0..4].copy_from_slice(b"RIFF");
    LittleEndian::write_u32(&mut out[4..8], riff_size);
    out[8..12].copy_from_slice(b"WAVE");

    out[12..16].copy_from_slice(b"fmt ");
    LittleEndian::write_u32(&mut out[16..20], 16); // fmt chunk size
    LittleEndian::write_u16(&mut out[20..22], 1); // PCM
    LittleEndian::write_u16(&mut out[22..24], 1); // mono
    LittleEndian::write_u32(&mut out[24..28], sample_rate);
    LittleEndian::write_u32(&mut out[28..32], sample_rate.saturating_mul(2));
    LittleEndian::write_u16(&mut out[32..34], 2); // block align
    LittleEndian::write_u16(&mut out[34..36], 16); // bits per sample

    out[36..40].copy_from_slice(b"data");
    LittleEndian::write_u32(&mut out[40..44], data_size);
    LittleEndian::write_i16_into(samples, &mut out[WAV_HEADER_LEN..]);

    out
}

/// RIFF and data chunk sizes for `data_len` bytes, saturated at the
/// 32-bit limit of the header fields.
fn chunk_sizes(data_len: usize) -> (u32, u32) {
    let data_size = u32::try_from(data_len).unwrap_or(u32::MAX);
    (data_size.saturating_add(36), data_size)
}
