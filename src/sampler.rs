//! Conditioned spectrogram sampling.
//!
//! A [`ConditionedSampler`] turns a conditioning state (prompt, seed,
//! denoising strength, guidance scale), or a blend of two states, into a
//! spectrogram image. [`diffusion::DiffusionSampler`] is the latent-diffusion
//! implementation; anything else with the same contract (including test
//! doubles) can stand in for it.

pub mod diffusion;
pub mod noise;

use image::GrayImage;

pub use crate::config::NoiseBlend;
use crate::Result;
use crate::spectrogram::SpectrogramImage;

/// Parameters that fully determine one sampling call, together with the
/// optional init image.
///
/// `denoising` is clamped into [0, 1] and `guidance` to ≥ 0 at construction.
#[derive(Debug, Clone, PartialEq)]
pub struct ConditioningState {
    prompt: String,
    seed: u64,
    denoising: f64,
    guidance: f64,
}

impl ConditioningState {
    pub fn new(prompt: impl Into<String>, seed: u64, denoising: f64, guidance: f64) -> Self {
        Self {
            prompt: prompt.into(),
            seed,
            denoising: finite_or_zero(denoising).clamp(0.0, 1.0),
            guidance: finite_or_zero(guidance).max(0.0),
        }
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn denoising(&self) -> f64 {
        self.denoising
    }

    pub fn guidance(&self) -> f64 {
        self.guidance
    }
}

fn finite_or_zero(value: f64) -> f64 {
    if value.is_finite() { value } else { 0.0 }
}

/// A point `t` on the path between two conditioning states.
///
/// Guidance and denoising lerp linearly; the prompt embeddings lerp; the
/// initial noise follows `noise`. At `t = 0` (or when both ends are equal)
/// the blend is exactly `start`; at `t = 1` exactly `end`.
#[derive(Debug, Clone, PartialEq)]
pub struct ConditioningBlend {
    pub start: ConditioningState,
    pub end: ConditioningState,
    pub t: f64,
    pub noise: NoiseBlend,
}

impl ConditioningBlend {
    pub fn single(state: ConditioningState) -> Self {
        Self {
            end: state.clone(),
            start: state,
            t: 0.0,
            noise: NoiseBlend::Spherical,
        }
    }

    pub fn between(
        start: ConditioningState,
        end: ConditioningState,
        t: f64,
        noise: NoiseBlend,
    ) -> Self {
        Self {
            start,
            end,
            t: finite_or_zero(t).clamp(0.0, 1.0),
            noise,
        }
    }

    /// The endpoint this blend collapses to, if any.
    pub fn endpoint(&self) -> Option<&ConditioningState> {
        if self.start == self.end || self.t <= 0.0 {
            Some(&self.start)
        } else if self.t >= 1.0 {
            Some(&self.end)
        } else {
            None
        }
    }

    pub fn guidance(&self) -> f64 {
        match self.endpoint() {
            Some(state) => state.guidance,
            None => lerp(self.start.guidance, self.end.guidance, self.t),
        }
    }

    pub fn denoising(&self) -> f64 {
        match self.endpoint() {
            Some(state) => state.denoising,
            None => lerp(self.start.denoising, self.end.denoising, self.t),
        }
    }
}

fn lerp(a: f64, b: f64, t: f64) -> f64 {
    a + (b - a) * t
}

/// Produces spectrogram images from conditioning.
///
/// Implementations must be deterministic for a fixed blend, init image, mask
/// and model. Numerical failures are reported as
/// [`Error::SamplingFailed`](crate::Error::SamplingFailed), never as an image.
pub trait ConditionedSampler: Send {
    /// - `init_image`: img2img starting point; pure noise when absent
    /// - `mask`: white pixels keep the init image, black pixels are regenerated
    fn sample(
        &mut self,
        blend: &ConditioningBlend,
        init_image: Option<&SpectrogramImage>,
        mask: Option<&GrayImage>,
    ) -> Result<SpectrogramImage>;

    fn sample_state(
        &mut self,
        state: &ConditioningState,
        init_image: Option<&SpectrogramImage>,
        mask: Option<&GrayImage>,
    ) -> Result<SpectrogramImage> {
        self.sample(&ConditioningBlend::single(state.clone()), init_image, mask)
    }
}

impl<S: ConditionedSampler + ?Sized> ConditionedSampler for Box<S> {
    fn sample(
        &mut self,
        blend: &ConditioningBlend,
        init_image: Option<&SpectrogramImage>,
        mask: Option<&GrayImage>,
    ) -> Result<SpectrogramImage> {
        (**self).sample(blend, init_image, mask)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(prompt: &str, seed: u64, denoising: f64, guidance: f64) -> ConditioningState {
        ConditioningState::new(prompt, seed, denoising, guidance)
    }

    #[test]
    fn state_clamps_parameters() {
        let s = state("x", 1, 1.7, -3.0);
        assert_eq!(s.denoising(), 1.0);
        assert_eq!(s.guidance(), 0.0);
        let s = state("x", 1, f64::NAN, f64::INFINITY);
        assert_eq!(s.denoising(), 0.0);
        assert_eq!(s.guidance(), 0.0);
    }

    #[test]
    fn blend_endpoints_are_exact() {
        let a = state("jazz", 1, 0.5, 5.0);
        let b = state("rock", 2, 0.9, 9.0);
        let at_start = ConditioningBlend::between(a.clone(), b.clone(), 0.0, NoiseBlend::Linear);
        let at_end = ConditioningBlend::between(a.clone(), b.clone(), 1.0, NoiseBlend::Linear);
        assert_eq!(at_start.endpoint(), Some(&a));
        assert_eq!(at_end.endpoint(), Some(&b));
        assert_eq!(at_end.guidance(), 9.0);
    }

    #[test]
    fn blend_scalars_lerp() {
        let a = state("jazz", 1, 0.5, 5.0);
        let b = state("rock", 2, 0.9, 9.0);
        let mid = ConditioningBlend::between(a, b, 0.25, NoiseBlend::Spherical);
        assert!(mid.endpoint().is_none());
        assert!((mid.guidance() - 6.0).abs() < 1e-12);
        assert!((mid.denoising() - 0.6).abs() < 1e-12);
    }

    #[test]
    fn identical_ends_collapse_regardless_of_t() {
        let a = state("folk", 42, 0.75, 7.0);
        let blend = ConditioningBlend::between(a.clone(), a.clone(), 0.6, NoiseBlend::Spherical);
        assert_eq!(blend.endpoint(), Some(&a));
        assert_eq!(blend.guidance(), 7.0);
    }
}
