//! Shared fixtures for unit tests: small codec parameters, synthetic audio,
//! and a deterministic stand-in for the diffusion model.

use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::{Arc, Mutex};

use image::{GrayImage, Rgb, RgbImage};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::audio::AudioSegment;
use crate::config::{EngineConfig, ModelConfig, SpectrogramParams};
use crate::sampler::{ConditionedSampler, ConditioningBlend, ConditioningState};
use crate::spectrogram::SpectrogramImage;
use crate::{Error, Result};

/// 8 kHz, 10 ms hop, 50 ms window, 100 ms FFT, 64 mel bins up to 3.5 kHz.
pub fn test_params() -> SpectrogramParams {
    SpectrogramParams {
        sample_rate: 8000,
        step_size_ms: 10,
        window_duration_ms: 50,
        padded_duration_ms: 100,
        num_frequencies: 64,
        max_frequency: 3500.0,
        max_mel_iters: 50,
        num_griffin_lim_iters: 16,
        ..Default::default()
    }
}

/// Engine config over [`test_params`] with 64×64 model images.
pub fn test_engine_config(seed_image_dir: &std::path::Path) -> EngineConfig {
    EngineConfig {
        spectrogram: test_params(),
        model: ModelConfig {
            width: 64,
            height: 64,
            ..Default::default()
        },
        seed_image_dir: seed_image_dir.to_path_buf(),
        ..Default::default()
    }
}

/// 440 Hz + 1200 Hz mono test signal.
pub fn two_tone(sample_rate: u32, seconds: f64) -> AudioSegment {
    let len = (seconds * sample_rate as f64) as usize;
    let samples = (0..len)
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            0.3 * (std::f32::consts::TAU * 440.0 * t).sin()
                + 0.2 * (std::f32::consts::TAU * 1200.0 * t).sin()
        })
        .collect();
    AudioSegment::new(samples, sample_rate, 1).unwrap()
}

/// One recorded [`FakeSampler::sample`] call.
#[derive(Debug, Clone)]
pub struct SampleCall {
    pub blend: ConditioningBlend,
    pub had_init_image: bool,
    pub had_mask: bool,
}

/// Deterministic sampler: pixels are a pure function of the conditioning.
///
/// Each endpoint state hashes to a seed for a smooth random image; blends
/// mix the two endpoint images by `t`. An init image, when given, is mixed
/// in with weight `1 - denoising`.
#[derive(Clone)]
pub struct FakeSampler {
    params: SpectrogramParams,
    width: u32,
    pub calls: Arc<Mutex<Vec<SampleCall>>>,
    /// Fail every call whose `t` is in this list.
    pub fail_at: Vec<f64>,
}

impl FakeSampler {
    pub fn new(params: SpectrogramParams, width: u32) -> Self {
        Self {
            params,
            width,
            calls: Arc::new(Mutex::new(Vec::new())),
            fail_at: Vec::new(),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// The image a single state produces without an init image.
    pub fn render(&self, state: &ConditioningState) -> RgbImage {
        let mut hasher = DefaultHasher::new();
        state.prompt().hash(&mut hasher);
        state.seed().hash(&mut hasher);
        state.guidance().to_bits().hash(&mut hasher);
        state.denoising().to_bits().hash(&mut hasher);
        let mut rng = ChaCha8Rng::seed_from_u64(hasher.finish());

        let height = self.params.num_frequencies as u32;
        let mut image = RgbImage::new(self.width, height);
        let rows: Vec<u8> = (0..height).map(|_| rng.random_range(0..=255u8)).collect();
        for (x, y, pixel) in image.enumerate_pixels_mut() {
            let jitter = rng.random_range(0..8u8);
            let v = rows[y as usize].saturating_add(jitter).saturating_sub((x % 4) as u8);
            *pixel = Rgb([v, v, v]);
        }
        image
    }
}

impl ConditionedSampler for FakeSampler {
    fn sample(
        &mut self,
        blend: &ConditioningBlend,
        init_image: Option<&SpectrogramImage>,
        mask: Option<&GrayImage>,
    ) -> Result<SpectrogramImage> {
        self.calls.lock().unwrap().push(SampleCall {
            blend: blend.clone(),
            had_init_image: init_image.is_some(),
            had_mask: mask.is_some(),
        });
        if self.fail_at.iter().any(|&t| (t - blend.t).abs() < 1e-9) {
            return Err(Error::SamplingFailed(format!("diverged at t={}", blend.t)));
        }

        let image = match blend.endpoint() {
            Some(state) => SpectrogramImage::new(self.render(state), self.params.clone()),
            None => {
                let a = SpectrogramImage::new(self.render(&blend.start), self.params.clone());
                let b = SpectrogramImage::new(self.render(&blend.end), self.params.clone());
                a.blend(&b, blend.t)?
            }
        };
        match init_image {
            Some(init) if init.image().dimensions() == image.image().dimensions() => {
                init.blend(&image, blend.denoising())
            }
            _ => Ok(image),
        }
    }
}
