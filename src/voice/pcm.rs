//! Linear PCM conversions and the base64 framing used on the wire.
//!
//! Outbound audio is 16-bit little-endian mono PCM at the capture rate,
//! inbound agent audio the same format at the playback rate. Both directions
//! carry it base64-encoded inside JSON.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use super::error::DecodeError;

/// f32 (-1..1) → i16, clamping out-of-range input.
pub fn f32_to_pcm16(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&s| (s.clamp(-1.0, 1.0) * 32767.0) as i16)
        .collect()
}

/// i16 → f32 normalized by 32768, so the range is [-1.0, 1.0).
#[inline]
pub fn pcm16_to_f32(sample: i16) -> f32 {
    sample as f32 / 32768.0
}

pub fn pcm16_to_le_bytes(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        bytes.extend_from_slice(&s.to_le_bytes());
    }
    bytes
}

pub fn le_bytes_to_pcm16(bytes: &[u8]) -> Result<Vec<i16>, DecodeError> {
    if bytes.len() % 2 != 0 {
        return Err(DecodeError::OddLength(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}

pub fn encode_base64_pcm16(samples: &[i16]) -> String {
    BASE64.encode(pcm16_to_le_bytes(samples))
}

pub fn decode_base64_pcm16(data: &str) -> Result<Vec<i16>, DecodeError> {
    let bytes = BASE64.decode(data.trim())?;
    le_bytes_to_pcm16(&bytes)
}

/// Number of samples covering `ms` milliseconds at `sample_rate`.
#[inline]
pub fn samples_for_ms(sample_rate: u32, ms: u64) -> usize {
    (sample_rate as u64 * ms / 1000) as usize
}
