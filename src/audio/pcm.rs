//! 16-bit linear PCM wire codec.
//!
//! The wire format is raw signed 16-bit little-endian mono PCM with no
//! header or length prefix; frame boundaries are the transport's message
//! boundaries. Both directions are pure, total functions: out-of-range
//! input is clamped, never rejected.

use bytes::{Buf, BufMut};

/// Quantize one normalized sample to a signed 16-bit value.
///
/// Clamps to [-1.0, 1.0] first so extreme input cannot wrap around.
#[inline]
pub fn sample_to_i16(s: f32) -> i16 {
    (s.clamp(-1.0, 1.0) * 32767.0).round() as i16
}

/// Widen one 16-bit sample back to a normalized float.
#[inline]
pub fn sample_to_f32(v: i16) -> f32 {
    v as f32 / 32767.0
}

/// Encode a block of normalized samples into a wire frame.
pub fn encode_frame(samples: &[f32]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        frame.put_i16_le(sample_to_i16(s));
    }
    frame
}

/// Decode a wire frame into normalized samples.
///
/// Frames carry whole samples by contract; a trailing odd byte is ignored.
pub fn decode_frame(mut frame: &[u8]) -> Vec<f32> {
    let mut samples = Vec::with_capacity(frame.len() / 2);
    while frame.len() >= 2 {
        samples.push(sample_to_f32(frame.get_i16_le()));
    }
    samples
}
