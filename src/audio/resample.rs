//! Sample-rate conversion between the narrowband telephony leg and the
//! wideband conferencing fabric, plus a general path for decoded assets.

use super::frame::{FABRIC_SAMPLE_RATE, TELEPHONY_SAMPLE_RATE};

/// Upsample by an integer factor using linear interpolation.
pub fn upsample(input: &[i16], factor: usize) -> Vec<i16> {
    if factor <= 1 || input.is_empty() {
        return input.to_vec();
    }

    let mut out = Vec::with_capacity(input.len() * factor);
    for (i, &cur) in input.iter().enumerate() {
        let next = input.get(i + 1).copied().unwrap_or(cur);
        for step in 0..factor {
            let t = step as f32 / factor as f32;
            let sample = cur as f32 + (next as f32 - cur as f32) * t;
            out.push(sample as i16);
        }
    }
    out
}

/// Downsample by an integer factor, averaging each window to suppress
/// aliasing rather than bare decimation.
pub fn downsample(input: &[i16], factor: usize) -> Vec<i16> {
    if factor <= 1 || input.is_empty() {
        return input.to_vec();
    }

    input
        .chunks(factor)
        .map(|window| {
            let sum: i32 = window.iter().map(|&s| s as i32).sum();
            (sum / window.len() as i32) as i16
        })
        .collect()
}

/// Telephony frame (8 kHz) to fabric rate (48 kHz).
pub fn telephony_to_fabric(input: &[i16]) -> Vec<i16> {
    upsample(input, (FABRIC_SAMPLE_RATE / TELEPHONY_SAMPLE_RATE) as usize)
}

/// Fabric frame (48 kHz) to telephony rate (8 kHz).
pub fn fabric_to_telephony(input: &[i16]) -> Vec<i16> {
    downsample(input, (FABRIC_SAMPLE_RATE / TELEPHONY_SAMPLE_RATE) as usize)
}

/// Arbitrary-ratio linear resampling, used for decoded assets whose native
/// rate need not divide the mix rate.
pub fn resample_linear(input: &[i16], from_rate: u32, to_rate: u32) -> Vec<i16> {
    if from_rate == to_rate || input.is_empty() {
        return input.to_vec();
    }

    let ratio = from_rate as f64 / to_rate as f64;
    let out_len = (input.len() as f64 / ratio).ceil() as usize;
    let mut out = Vec::with_capacity(out_len);

    for i in 0..out_len {
        let pos = i as f64 * ratio;
        let idx = pos as usize;
        let frac = pos - idx as f64;
        let cur = input.get(idx).copied().unwrap_or(0) as f64;
        let next = input.get(idx + 1).copied().unwrap_or(cur as i16) as f64;
        out.push((cur + (next - cur) * frac) as i16);
    }

    out
}
