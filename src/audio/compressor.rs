//! Master-bus dynamics compression.
//!
//! The master bus sums every unmuted source in i32 headroom; this soft-knee
//! compressor absorbs summation overflow before the bus is narrowed back to
//! i16 for the sinks. Threshold, ratio, knee, attack and release are fixed.

const THRESHOLD_DB: f32 = -12.0;
const RATIO: f32 = 4.0;
const KNEE_DB: f32 = 6.0;
const ATTACK_MS: f32 = 5.0;
const RELEASE_MS: f32 = 50.0;

const FLOOR_DB: f32 = -96.0;

pub struct Compressor {
    attack_coeff: f32,
    release_coeff: f32,
    /// Smoothed gain reduction in dB (<= 0).
    envelope_db: f32,
}

impl Compressor {
    pub fn new(sample_rate: u32) -> Self {
        let sr = sample_rate as f32;
        Self {
            attack_coeff: (-1.0 / (ATTACK_MS * 0.001 * sr)).exp(),
            release_coeff: (-1.0 / (RELEASE_MS * 0.001 * sr)).exp(),
            envelope_db: 0.0,
        }
    }

    /// Compress a summed i32 bus down to i16 output samples.
    pub fn process(&mut self, bus: &[i32]) -> Vec<i16> {
        let mut out = Vec::with_capacity(bus.len());

        for &s in bus {
            let x = s as f32 / i16::MAX as f32;
            let level_db = if x.abs() > 0.0 {
                (20.0 * x.abs().log10()).max(FLOOR_DB)
            } else {
                FLOOR_DB
            };

            let reduction_db = self.gain_reduction_db(level_db);

            // Attack when reduction deepens, release when it eases.
            let coeff = if reduction_db < self.envelope_db {
                self.attack_coeff
            } else {
                self.release_coeff
            };
            self.envelope_db = coeff * self.envelope_db + (1.0 - coeff) * reduction_db;

            let gain = 10f32.powf(self.envelope_db / 20.0);
            let compressed = x * gain * i16::MAX as f32;
            out.push(compressed.clamp(i16::MIN as f32, i16::MAX as f32) as i16);
        }

        out
    }

    /// Static soft-knee gain computer: desired reduction (dB, <= 0) at a level.
    fn gain_reduction_db(&self, level_db: f32) -> f32 {
        let over = level_db - THRESHOLD_DB;
        let half_knee = KNEE_DB / 2.0;

        let out_db = if over <= -half_knee {
            level_db
        } else if over < half_knee {
            // Quadratic interpolation through the knee region.
            let t = over + half_knee;
            level_db + (1.0 / RATIO - 1.0) * t * t / (2.0 * KNEE_DB)
        } else {
            THRESHOLD_DB + over / RATIO
        };

        out_db - level_db
    }
}
