//! Post-reconstruction cleanup.
//!
//! Griffin-Lim leaves low-frequency drift and leakage above the spectrogram's
//! top band. [`clean_reconstruction`] band-limits each channel with
//! second-order Butterworth sections, then levels the clip: gain to a target
//! RMS followed by peak normalization with a small headroom.

use std::f64::consts::PI;

use crate::config::SpectrogramParams;

/// Q of a second-order Butterworth section.
const BUTTERWORTH_Q: f64 = std::f64::consts::FRAC_1_SQRT_2;

/// High-pass corner never goes below this, so DC is always removed.
const MIN_HIGHPASS_HZ: f64 = 20.0;

/// RMS level the clip is brought to before peak normalization.
pub const TARGET_DBFS: f64 = -12.0;

/// Headroom left below full scale by peak normalization.
pub const HEADROOM_DB: f64 = 0.1;

/// Normalized biquad coefficients (Audio EQ Cookbook).
#[derive(Debug, Clone, Copy)]
pub struct BiquadCoeffs {
    pub b0: f64,
    pub b1: f64,
    pub b2: f64,
    pub a1: f64,
    pub a2: f64,
}

impl BiquadCoeffs {
    pub fn lowpass(cutoff: f64, q: f64, sample_rate: f64) -> Self {
        let (cos_omega, alpha) = omega_terms(cutoff, q, sample_rate);
        let b1 = 1.0 - cos_omega;
        Self::normalized(b1 / 2.0, b1, b1 / 2.0, 1.0 + alpha, -2.0 * cos_omega, 1.0 - alpha)
    }

    pub fn highpass(cutoff: f64, q: f64, sample_rate: f64) -> Self {
        let (cos_omega, alpha) = omega_terms(cutoff, q, sample_rate);
        let b0 = (1.0 + cos_omega) / 2.0;
        Self::normalized(b0, -(1.0 + cos_omega), b0, 1.0 + alpha, -2.0 * cos_omega, 1.0 - alpha)
    }

    fn normalized(b0: f64, b1: f64, b2: f64, a0: f64, a1: f64, a2: f64) -> Self {
        Self {
            b0: b0 / a0,
            b1: b1 / a0,
            b2: b2 / a0,
            a1: a1 / a0,
            a2: a2 / a0,
        }
    }
}

fn omega_terms(frequency: f64, q: f64, sample_rate: f64) -> (f64, f64) {
    // Q below 0.5 makes alpha blow up near Nyquist.
    let q = q.max(0.5);
    let omega = 2.0 * PI * frequency / sample_rate;
    (omega.cos(), omega.sin() / (2.0 * q))
}

/// Direct form I biquad.
#[derive(Debug, Clone)]
pub struct Biquad {
    coeffs: BiquadCoeffs,
    x1: f64,
    x2: f64,
    y1: f64,
    y2: f64,
}

impl Biquad {
    pub fn new(coeffs: BiquadCoeffs) -> Self {
        Self {
            coeffs,
            x1: 0.0,
            x2: 0.0,
            y1: 0.0,
            y2: 0.0,
        }
    }

    pub fn process(&mut self, x: f64) -> f64 {
        let c = &self.coeffs;
        let y = c.b0 * x + c.b1 * self.x1 + c.b2 * self.x2 - c.a1 * self.y1 - c.a2 * self.y2;
        self.x2 = self.x1;
        self.x1 = x;
        self.y2 = self.y1;
        self.y1 = y;
        y
    }

    pub fn process_buffer(&mut self, samples: &mut [f32]) {
        for s in samples.iter_mut() {
            *s = self.process(*s as f64) as f32;
        }
    }
}

/// RMS level relative to full scale. Silence is `-inf`.
pub fn dbfs(samples: &[f32]) -> f64 {
    if samples.is_empty() {
        return f64::NEG_INFINITY;
    }
    let mean_sq = samples.iter().map(|&s| (s as f64) * (s as f64)).sum::<f64>() / samples.len() as f64;
    10.0 * mean_sq.log10()
}

/// Scale so the RMS level lands on `target_dbfs`. No-op on silence.
pub fn apply_gain_to_dbfs(samples: &mut [f32], target_dbfs: f64) {
    let current = dbfs(samples);
    if !current.is_finite() {
        return;
    }
    let gain = 10f64.powf((target_dbfs - current) / 20.0) as f32;
    for s in samples.iter_mut() {
        *s *= gain;
    }
}

/// Peak-normalize so the largest magnitude sits `headroom_db` below full scale.
pub fn normalize_peak(samples: &mut [f32], headroom_db: f64) {
    let max_abs = samples.iter().map(|s| s.abs()).fold(0.0f32, f32::max);
    if max_abs > 1e-8 {
        let target = 10f64.powf(-headroom_db / 20.0) as f32;
        let scale = target / max_abs;
        for s in samples.iter_mut() {
            *s *= scale;
        }
    }
}

/// Band-limit every channel to the spectrogram's frequency range, then level the
/// clip across all channels together.
pub fn clean_reconstruction(channels: &mut [Vec<f32>], params: &SpectrogramParams) {
    let sample_rate = params.sample_rate as f64;
    let highpass_hz = params.min_frequency.max(MIN_HIGHPASS_HZ);
    let lowpass_hz = params.max_frequency.min(0.45 * sample_rate);

    for channel in channels.iter_mut() {
        Biquad::new(BiquadCoeffs::highpass(highpass_hz, BUTTERWORTH_Q, sample_rate))
            .process_buffer(channel);
        Biquad::new(BiquadCoeffs::lowpass(lowpass_hz, BUTTERWORTH_Q, sample_rate))
            .process_buffer(channel);
    }

    // Level on the joint signal so stereo balance survives.
    let mut joint: Vec<f32> = channels.iter().flatten().copied().collect();
    let before = joint.iter().map(|s| s.abs()).fold(0.0f32, f32::max);
    apply_gain_to_dbfs(&mut joint, TARGET_DBFS);
    // Peak normalization runs last and sets the final level.
    normalize_peak(&mut joint, HEADROOM_DB);
    let after = joint.iter().map(|s| s.abs()).fold(0.0f32, f32::max);
    if before > 1e-8 {
        let scale = after / before;
        for channel in channels.iter_mut() {
            for s in channel.iter_mut() {
                *s *= scale;
            }
        }
    }
}
