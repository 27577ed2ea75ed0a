//! Display-only level estimation for mixer sources and the master bus.

/// RMS level of a sample window, scaled to 0-100.
///
/// 0 is silence, 100 is a full-scale square wave. The result is clamped so
/// clipping input never reads above 100. Values are for display only and are
/// never fed back into gain decisions.
pub fn level_of(samples: &[i16]) -> u8 {
    if samples.is_empty() {
        return 0;
    }

    let sum_sq: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    let rms = (sum_sq / samples.len() as f64).sqrt();
    let scaled = rms / i16::MAX as f64 * 100.0;
    scaled.clamp(0.0, 100.0).round() as u8
}

/// Same scale for an i32 accumulator bus (pre-clamp master samples).
pub fn level_of_bus(bus: &[i32]) -> u8 {
    if bus.is_empty() {
        return 0;
    }

    let sum_sq: f64 = bus.iter().map(|&s| (s as f64) * (s as f64)).sum();
    let rms = (sum_sq / bus.len() as f64).sqrt();
    let scaled = rms / i16::MAX as f64 * 100.0;
    scaled.clamp(0.0, 100.0).round() as u8
}
