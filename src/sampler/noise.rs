//! Seeded initial latent noise and blending between seeds.
//!
//! Noise is drawn on the host from a ChaCha8 stream so that a seed gives the
//! same latents on every device and backend.

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};

use super::{ConditioningBlend, NoiseBlend};

/// Above this |cos θ| the two vectors are treated as parallel and lerped.
const SLERP_DOT_THRESHOLD: f64 = 0.9995;

/// `len` standard-normal samples from `seed`.
pub fn seeded_noise(seed: u64, len: usize) -> Vec<f32> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    (0..len)
        .map(|_| {
            let value: f32 = StandardNormal.sample(&mut rng);
            value
        })
        .collect()
}

/// Initial noise for a blend: the endpoint's own noise when the blend
/// collapses to one state, otherwise both seeds mixed per `blend.noise`.
pub fn blend_noise(blend: &ConditioningBlend, len: usize) -> Vec<f32> {
    if let Some(state) = blend.endpoint() {
        return seeded_noise(state.seed(), len);
    }
    let start = seeded_noise(blend.start.seed(), len);
    let end = seeded_noise(blend.end.seed(), len);
    match blend.noise {
        NoiseBlend::Spherical => slerp(blend.t, &start, &end),
        NoiseBlend::Linear => lerp(blend.t, &start, &end),
    }
}

pub fn lerp(t: f64, v0: &[f32], v1: &[f32]) -> Vec<f32> {
    v0.iter()
        .zip(v1)
        .map(|(&a, &b)| ((1.0 - t) * a as f64 + t * b as f64) as f32)
        .collect()
}

/// Spherical linear interpolation; falls back to [`lerp`] for (anti)parallel inputs.
pub fn slerp(t: f64, v0: &[f32], v1: &[f32]) -> Vec<f32> {
    if t <= 0.0 {
        return v0.to_vec();
    }
    if t >= 1.0 {
        return v1.to_vec();
    }

    let norm = |v: &[f32]| v.iter().map(|&x| (x as f64).powi(2)).sum::<f64>().sqrt();
    let denom = norm(v0) * norm(v1);
    if denom == 0.0 {
        return lerp(t, v0, v1);
    }
    let dot: f64 = v0
        .iter()
        .zip(v1)
        .map(|(&a, &b)| a as f64 * b as f64)
        .sum::<f64>()
        / denom;
    if dot.abs() > SLERP_DOT_THRESHOLD {
        return lerp(t, v0, v1);
    }

    let theta_0 = dot.acos();
    let sin_theta_0 = theta_0.sin();
    let theta_t = theta_0 * t;
    let s0 = (theta_0 - theta_t).sin() / sin_theta_0;
    let s1 = theta_t.sin() / sin_theta_0;
    v0.iter()
        .zip(v1)
        .map(|(&a, &b)| (s0 * a as f64 + s1 * b as f64) as f32)
        .collect()
}
