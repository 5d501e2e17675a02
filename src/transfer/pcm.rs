//! Float32 to 16-bit PCM conversion.

/// Converts one Float32 sample in [-1, 1] to a signed 16-bit sample.
///
/// Input is clamped to [-1, 1], scaled by 32768 for negatives and 32767 for
/// non-negatives, and truncated toward zero. The asymmetric scale uses the
/// full signed range without overflowing at -1.0.
#[inline]
pub fn encode_sample(x: f32) -> i16 {
    let clamped = x.clamp(-1.0, 1.0);
    let scaled = if clamped < 0.0 {
        clamped * 32768.0
    } else {
        clamped * 32767.0
    };
    scaled as i16
}

/// Converts a Float32 buffer to 16-bit PCM, preserving length and order.
pub fn encode_i16(samples: &[f32]) -> Vec<i16> {
    samples.iter().map(|&x| encode_sample(x)).collect()
}
