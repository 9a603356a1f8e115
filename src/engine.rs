//! Audio synthesis: prompt → spectrogram → waveform → MP3 data URI.
//!
//! [`AudioSynthesisEngine`] owns the sampler (through an
//! [`InterpolationEngine`]), the spectrogram codec and the seed image store.
//! Each call is a blocking unit of work; callers that share one engine across
//! requests serialize access (see [`crate::manager`]).

use std::time::Instant;

use candle_core::Device;
use serde::{Deserialize, Deserializer, Serialize};

use crate::Result;
use crate::audio::{AudioSegment, mp3_data_uri};
use crate::config::EngineConfig;
use crate::interpolation::{InterpolationEngine, InterpolationSpec};
use crate::sampler::diffusion::DiffusionSampler;
use crate::sampler::{ConditionedSampler, ConditioningState};
use crate::seed_images::SeedImageStore;
use crate::spectrogram::{SpectrogramCodec, SpectrogramImage};

/// Single-prompt generation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateRequest {
    pub prompt: String,
    /// Negative JSON seeds are accepted and reinterpreted as their two's
    /// complement `u64`.
    #[serde(deserialize_with = "seed_from_json")]
    pub seed: u64,
    /// Accepted for forward compatibility; has no effect on a single prompt.
    /// `None` uses the configured default.
    #[serde(default)]
    pub alpha: Option<f64>,
    #[serde(default, alias = "seed_image")]
    pub seed_image_name: Option<String>,
}

impl GenerateRequest {
    pub fn new(prompt: impl Into<String>, seed: u64) -> Self {
        Self {
            prompt: prompt.into(),
            seed,
            alpha: None,
            seed_image_name: None,
        }
    }
}

fn seed_from_json<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Seed {
        Unsigned(u64),
        Signed(i64),
    }
    Ok(match Seed::deserialize(deserializer)? {
        Seed::Unsigned(seed) => seed,
        Seed::Signed(seed) => seed as u64,
    })
}

/// Two-state interpolation request.
#[derive(Debug, Clone)]
pub struct InterpolateRequest {
    pub start: ConditioningState,
    pub end: ConditioningState,
    pub alpha: f64,
    /// `None` uses the configured step count.
    pub step_count: Option<usize>,
    pub seed_image_name: Option<String>,
    pub deadline: Option<Instant>,
}

/// A generated clip.
#[derive(Debug, Clone)]
pub struct SynthesizedClip {
    /// `data:audio/mpeg;base64,<payload>`
    pub audio: String,
    /// Sample count / sample rate of the returned audio.
    pub duration_s: f64,
    pub spectrogram: SpectrogramImage,
    pub segment: AudioSegment,
}

pub struct AudioSynthesisEngine<S> {
    config: EngineConfig,
    codec: SpectrogramCodec,
    seed_images: SeedImageStore,
    interpolation: InterpolationEngine<S>,
}

impl AudioSynthesisEngine<DiffusionSampler> {
    /// Load the diffusion model onto `device` and build the engine around it.
    pub fn load(config: EngineConfig, device: &Device) -> Result<Self> {
        config.validate()?;
        let sampler = DiffusionSampler::load(&config.model, config.spectrogram.clone(), device)?;
        Self::new(config, sampler)
    }
}

impl<S: ConditionedSampler> AudioSynthesisEngine<S> {
    pub fn new(config: EngineConfig, sampler: S) -> Result<Self> {
        config.validate()?;
        let codec = SpectrogramCodec::new(config.spectrogram.clone())?;
        let seed_images = SeedImageStore::from_config(&config);
        let interpolation = InterpolationEngine::new(sampler, config.model.noise_blend);
        Ok(Self {
            config,
            codec,
            seed_images,
            interpolation,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn codec(&self) -> &SpectrogramCodec {
        &self.codec
    }

    pub fn seed_images(&self) -> &SeedImageStore {
        &self.seed_images
    }

    pub fn sampler(&self) -> &S {
        self.interpolation.sampler()
    }

    /// Generate a clip from one prompt at the configured denoising and guidance.
    ///
    /// A missing seed image is replaced by the default asset; `alpha` is
    /// carried along but the path is degenerate, so it changes nothing.
    pub fn generate(&mut self, request: &GenerateRequest) -> Result<SynthesizedClip> {
        let started = Instant::now();
        tracing::info!(
            prompt = %request.prompt,
            seed = request.seed,
            seed_image = ?request.seed_image_name,
            "generate"
        );

        let state = ConditioningState::new(
            request.prompt.as_str(),
            request.seed,
            self.config.denoising,
            self.config.guidance,
        );
        let seed_image = self
            .seed_images
            .resolve(request.seed_image_name.as_deref(), &self.codec)?;
        let spec = InterpolationSpec {
            alpha: request.alpha.unwrap_or(self.config.alpha),
            step_count: self.config.step_count,
            ..InterpolationSpec::single(state, Some(seed_image))
        };

        let image = self.interpolation.run(&spec)?;
        let clip = self.render(image)?;
        tracing::info!(
            duration_s = clip.duration_s,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "generated clip"
        );
        Ok(clip)
    }

    /// Generate the clip at `alpha` between two distinct conditioning states.
    pub fn interpolate(&mut self, request: &InterpolateRequest) -> Result<SynthesizedClip> {
        let started = Instant::now();
        tracing::info!(
            start = %request.start.prompt(),
            end = %request.end.prompt(),
            alpha = request.alpha,
            "interpolate"
        );

        let seed_image = self
            .seed_images
            .resolve(request.seed_image_name.as_deref(), &self.codec)?;
        let mut spec = InterpolationSpec::between(
            request.start.clone(),
            request.end.clone(),
            request.alpha,
            request.step_count.unwrap_or(self.config.step_count),
        )
        .with_seed_image(seed_image);
        spec.deadline = request.deadline;

        let image = self.interpolation.run(&spec)?;
        let clip = self.render(image)?;
        tracing::info!(
            duration_s = clip.duration_s,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "interpolated clip"
        );
        Ok(clip)
    }

    /// Encode audio into the spectrogram representation the model works in.
    pub fn audio_to_spectrogram(&self, audio: &AudioSegment) -> Result<SpectrogramImage> {
        self.codec.encode(audio)
    }

    fn render(&self, spectrogram: SpectrogramImage) -> Result<SynthesizedClip> {
        let segment = self
            .codec
            .decode(&spectrogram, true)?
            .truncated(self.config.max_clip_seconds);
        let audio = mp3_data_uri(&segment)?;
        Ok(SynthesizedClip {
            audio,
            duration_s: segment.duration_seconds(),
            spectrogram,
            segment,
        })
    }
}
