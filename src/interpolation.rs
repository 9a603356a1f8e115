//! Interpolation between two conditioning states.
//!
//! The path from `start` to `end` is cut into `step_count` segments, giving
//! `step_count + 1` points `t_i = i / step_count` (both endpoints included).
//! For a position `alpha` only the points that bracket it are sampled:
//!
//! - `alpha` on a point: that point's image, unmodified
//! - `alpha` inside a segment: the two neighbouring images blended pixel-wise
//!   by the position within the segment
//!
//! When `start == end` the path is degenerate and exactly one sampling call is
//! made, whatever `alpha` is.

use std::time::Instant;

use image::GrayImage;

use crate::sampler::{ConditionedSampler, ConditioningBlend, ConditioningState, NoiseBlend};
use crate::spectrogram::SpectrogramImage;
use crate::{Error, Result};

/// Distance below which `alpha` counts as sitting on a path point.
const BOUNDARY_EPSILON: f64 = 1e-9;

/// One interpolation request.
#[derive(Debug, Clone)]
pub struct InterpolationSpec {
    pub start: ConditioningState,
    pub end: ConditioningState,
    /// Position along the path; clamped into [0, 1], NaN reads as 0.
    pub alpha: f64,
    pub step_count: usize,
    /// img2img starting point for every sampled point.
    pub seed_image: Option<SpectrogramImage>,
    /// Inpainting mask over the seed image: white keeps the seed image,
    /// black is regenerated, grey blends. Ignored without a seed image.
    pub mask: Option<GrayImage>,
    /// Checked before each sampling call; a sample in flight is never interrupted.
    pub deadline: Option<Instant>,
}

impl InterpolationSpec {
    /// Degenerate path: one state, `alpha` irrelevant.
    pub fn single(state: ConditioningState, seed_image: Option<SpectrogramImage>) -> Self {
        Self {
            end: state.clone(),
            start: state,
            alpha: 0.0,
            step_count: 1,
            seed_image,
            mask: None,
            deadline: None,
        }
    }

    pub fn between(
        start: ConditioningState,
        end: ConditioningState,
        alpha: f64,
        step_count: usize,
    ) -> Self {
        Self {
            start,
            end,
            alpha,
            step_count,
            seed_image: None,
            mask: None,
            deadline: None,
        }
    }

    pub fn with_seed_image(mut self, image: SpectrogramImage) -> Self {
        self.seed_image = Some(image);
        self
    }

    /// Regenerate only the black regions of the seed image; white is kept.
    pub fn with_mask(mut self, mask: GrayImage) -> Self {
        self.mask = Some(mask);
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Where `alpha` falls on a path of `step_count` segments.
#[derive(Debug, Clone, Copy, PartialEq)]
enum PathPosition {
    /// Exactly on point `i`.
    Point(usize),
    /// Between points `lower` and `lower + 1`.
    Segment { lower: usize, fraction: f64 },
}

fn locate(alpha: f64, step_count: usize) -> PathPosition {
    let alpha = if alpha.is_nan() { 0.0 } else { alpha.clamp(0.0, 1.0) };
    let scaled = alpha * step_count as f64;
    let lower = (scaled.floor() as usize).min(step_count);
    let fraction = scaled - lower as f64;
    if fraction < BOUNDARY_EPSILON {
        PathPosition::Point(lower)
    } else if 1.0 - fraction < BOUNDARY_EPSILON {
        PathPosition::Point(lower + 1)
    } else {
        PathPosition::Segment { lower, fraction }
    }
}

/// Drives a [`ConditionedSampler`] along interpolation paths.
pub struct InterpolationEngine<S> {
    sampler: S,
    noise_blend: NoiseBlend,
}

impl<S: ConditionedSampler> InterpolationEngine<S> {
    pub fn new(sampler: S, noise_blend: NoiseBlend) -> Self {
        Self {
            sampler,
            noise_blend,
        }
    }

    pub fn sampler(&self) -> &S {
        &self.sampler
    }

    pub fn sampler_mut(&mut self) -> &mut S {
        &mut self.sampler
    }

    pub fn into_sampler(self) -> S {
        self.sampler
    }

    /// Produce the image at `spec.alpha`.
    ///
    /// Any sampling failure aborts the run; partial results are discarded.
    pub fn run(&mut self, spec: &InterpolationSpec) -> Result<SpectrogramImage> {
        if spec.step_count == 0 {
            return Err(Error::Config("step_count must be at least 1".into()));
        }

        if spec.start == spec.end {
            tracing::debug!(seed = spec.start.seed(), "single-state path");
            check_deadline(spec, 0)?;
            return self.sampler.sample(
                &ConditioningBlend::single(spec.start.clone()),
                spec.seed_image.as_ref(),
                spec.mask.as_ref(),
            );
        }

        match locate(spec.alpha, spec.step_count) {
            PathPosition::Point(i) => {
                tracing::debug!(point = i, steps = spec.step_count, "alpha on path point");
                self.sample_point(spec, i)
            }
            PathPosition::Segment { lower, fraction } => {
                tracing::debug!(
                    lower,
                    fraction,
                    steps = spec.step_count,
                    "alpha inside segment"
                );
                let a = self.sample_point(spec, lower)?;
                let b = self.sample_point(spec, lower + 1)?;
                a.blend(&b, fraction)
            }
        }
    }

    fn sample_point(&mut self, spec: &InterpolationSpec, index: usize) -> Result<SpectrogramImage> {
        check_deadline(spec, index)?;
        let t = index as f64 / spec.step_count as f64;
        let blend = ConditioningBlend::between(spec.start.clone(), spec.end.clone(), t, self.noise_blend);
        self.sampler
            .sample(&blend, spec.seed_image.as_ref(), spec.mask.as_ref())
    }
}

fn check_deadline(spec: &InterpolationSpec, step: usize) -> Result<()> {
    match spec.deadline {
        Some(deadline) if Instant::now() >= deadline => Err(Error::DeadlineExceeded { step }),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeSampler, test_params};
    use image::{Luma, RgbImage};

    fn engine() -> InterpolationEngine<FakeSampler> {
        InterpolationEngine::new(FakeSampler::new(test_params(), 16), NoiseBlend::Spherical)
    }

    fn jazz() -> ConditioningState {
        ConditioningState::new("jazz", 1, 0.75, 7.0)
    }

    fn rock() -> ConditioningState {
        ConditioningState::new("rock", 2, 0.75, 7.0)
    }

    #[test]
    fn locate_points_and_segments() {
        assert_eq!(locate(0.0, 4), PathPosition::Point(0));
        assert_eq!(locate(1.0, 4), PathPosition::Point(4));
        assert_eq!(locate(0.5, 4), PathPosition::Point(2));
        assert_eq!(
            locate(0.25, 1),
            PathPosition::Segment {
                lower: 0,
                fraction: 0.25
            }
        );
        assert_eq!(locate(f64::NAN, 3), PathPosition::Point(0));
        assert_eq!(locate(7.0, 3), PathPosition::Point(3));
    }

    #[test]
    fn locate_snaps_float_noise_to_point() {
        // 0.3 * 10 = 3.0000000000000004
        assert_eq!(locate(0.3, 10), PathPosition::Point(3));
        assert_eq!(locate(0.7, 10), PathPosition::Point(7));
    }

    #[test]
    fn identical_endpoints_sample_once_and_ignore_alpha() {
        let mut engine = engine();
        let a = engine
            .run(&InterpolationSpec::between(jazz(), jazz(), 0.1, 4))
            .unwrap();
        let b = engine
            .run(&InterpolationSpec::between(jazz(), jazz(), 0.9, 4))
            .unwrap();
        assert_eq!(engine.sampler().call_count(), 2, "one call per run");
        assert_eq!(a, b);
    }

    #[test]
    fn alpha_zero_matches_start_alone() {
        let mut engine = engine();
        let expected = engine.sampler().render(&jazz());
        let image = engine
            .run(&InterpolationSpec::between(jazz(), rock(), 0.0, 3))
            .unwrap();
        assert_eq!(image.image(), &expected);
        assert_eq!(engine.sampler().call_count(), 1);
    }

    #[test]
    fn alpha_one_matches_end_alone() {
        let mut engine = engine();
        let expected = engine.sampler().render(&rock());
        let image = engine
            .run(&InterpolationSpec::between(jazz(), rock(), 1.0, 3))
            .unwrap();
        assert_eq!(image.image(), &expected);
    }

    #[test]
    fn boundary_hit_returns_point_unmodified() {
        let mut engine = engine();
        let image = engine
            .run(&InterpolationSpec::between(jazz(), rock(), 0.5, 4))
            .unwrap();

        let calls = engine.sampler().calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 1);
        assert!((calls[0].blend.t - 0.5).abs() < 1e-12);

        let mut direct = FakeSampler::new(test_params(), 16);
        let expected = direct.sample(&calls[0].blend, None, None).unwrap();
        assert_eq!(image, expected);
    }

    #[test]
    fn inside_segment_blends_bracketing_points() {
        let mut engine = engine();
        let image = engine
            .run(&InterpolationSpec::between(jazz(), rock(), 0.25, 2))
            .unwrap();

        let calls = engine.sampler().calls.lock().unwrap().clone();
        let ts: Vec<f64> = calls.iter().map(|c| c.blend.t).collect();
        assert_eq!(ts, vec![0.0, 0.5]);

        let mut direct = FakeSampler::new(test_params(), 16);
        let a = direct.sample(&calls[0].blend, None, None).unwrap();
        let b = direct.sample(&calls[1].blend, None, None).unwrap();
        assert_eq!(image, a.blend(&b, 0.5).unwrap());
    }

    #[test]
    fn blends_carry_the_configured_noise_policy() {
        let mut engine =
            InterpolationEngine::new(FakeSampler::new(test_params(), 16), NoiseBlend::Linear);
        engine
            .run(&InterpolationSpec::between(jazz(), rock(), 0.6, 1))
            .unwrap();
        let calls = engine.sampler().calls.lock().unwrap().clone();
        assert!(calls.iter().all(|c| c.blend.noise == NoiseBlend::Linear));
    }

    #[test]
    fn sampling_failure_aborts_whole_run() {
        let mut sampler = FakeSampler::new(test_params(), 16);
        sampler.fail_at = vec![1.0];
        let mut engine = InterpolationEngine::new(sampler, NoiseBlend::Spherical);
        let result = engine.run(&InterpolationSpec::between(jazz(), rock(), 0.75, 2));
        assert!(matches!(result, Err(Error::SamplingFailed(_))));
    }

    #[test]
    fn expired_deadline_stops_before_sampling() {
        let mut engine = engine();
        let spec = InterpolationSpec::between(jazz(), rock(), 0.25, 2).with_deadline(Instant::now());
        let result = engine.run(&spec);
        assert!(matches!(result, Err(Error::DeadlineExceeded { step: 0 })));
        assert_eq!(engine.sampler().call_count(), 0);
    }

    #[test]
    fn far_deadline_does_not_interfere() {
        let mut engine = engine();
        let spec = InterpolationSpec::between(jazz(), rock(), 0.25, 2)
            .with_deadline(Instant::now() + std::time::Duration::from_secs(60));
        assert!(engine.run(&spec).is_ok());
    }

    #[test]
    fn seed_image_and_mask_reach_every_call() {
        let mut engine = engine();
        let seed = SpectrogramImage::new(RgbImage::new(16, 64), test_params());
        let spec = InterpolationSpec::between(jazz(), rock(), 0.3, 1)
            .with_seed_image(seed)
            .with_mask(GrayImage::from_pixel(16, 64, Luma([255])));
        engine.run(&spec).unwrap();
        let calls = engine.sampler().calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 2);
        assert!(calls.iter().all(|c| c.had_init_image && c.had_mask));
    }

    #[test]
    fn zero_steps_rejected() {
        let mut engine = engine();
        let result = engine.run(&InterpolationSpec::between(jazz(), rock(), 0.5, 0));
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
