//! # PCM16 Codec
//!
//! Converts between normalized `f32` samples and the signed 16-bit
//! little-endian PCM the realtime service speaks, wrapped in base64 for the
//! JSON control channel.
//!
//! ## Sample Mapping:
//! - Negative samples scale by 32768, positive samples by 32767, so -1.0 maps
//!   to `i16::MIN` and 1.0 to `i16::MAX` without overflow
//! - Decoding applies the inverse scale per sign, keeping decoded samples in [-1.0, 1.0]
//! - Values outside [-1.0, 1.0] are clamped before scaling

use crate::error::DecodeError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use std::io::Cursor;
use std::time::Duration;

/// Base64 text of PCM16 little-endian mono audio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedAudioChunk(String);

impl EncodedAudioChunk {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

/// Decoded audio ready to hand to a playback sink.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayableAudioBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl PlayableAudioBuffer {
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate as f64)
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Convert one normalized sample to PCM16.
pub fn float_to_pcm16(sample: f32) -> i16 {
    let s = sample.clamp(-1.0, 1.0);
    if s < 0.0 {
        (s * 32768.0).round() as i16
    } else {
        (s * 32767.0).round() as i16
    }
}

/// Convert one PCM16 sample back to a normalized float.
pub fn pcm16_to_float(sample: i16) -> f32 {
    if sample < 0 {
        sample as f32 / 32768.0
    } else {
        sample as f32 / 32767.0
    }
}

/// Encode normalized samples as base64 PCM16 little-endian.
pub fn encode(samples: &[f32]) -> EncodedAudioChunk {
    let pcm: Vec<i16> = samples.iter().map(|&s| float_to_pcm16(s)).collect();
    let mut bytes = vec![0u8; pcm.len() * 2];
    LittleEndian::write_i16_into(&pcm, &mut bytes);
    EncodedAudioChunk(STANDARD.encode(bytes))
}

/// Decode raw PCM16 little-endian bytes.
///
/// ## Errors:
/// - `DecodeError::Empty` for an empty payload
/// - `DecodeError::OddLength` when the bytes cannot hold whole 16-bit samples
pub fn decode_pcm16(bytes: &[u8], sample_rate: u32) -> Result<PlayableAudioBuffer, DecodeError> {
    if bytes.is_empty() {
        return Err(DecodeError::Empty);
    }
    if bytes.len() % 2 != 0 {
        return Err(DecodeError::OddLength(bytes.len()));
    }

    let mut cursor = Cursor::new(bytes);
    let mut samples = Vec::with_capacity(bytes.len() / 2);
    while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
        samples.push(pcm16_to_float(sample));
    }

    Ok(PlayableAudioBuffer { samples, sample_rate })
}

/// Decode a base64 PCM16 payload as received in `response.audio.delta`.
pub fn decode(payload: &str, sample_rate: u32) -> Result<PlayableAudioBuffer, DecodeError> {
    let bytes = STANDARD
        .decode(payload.trim())
        .map_err(|e| DecodeError::Base64(e.to_string()))?;
    decode_pcm16(&bytes, sample_rate)
}
