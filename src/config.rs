//! Deployment configuration.
//!
//! Defaults reproduce the riffusion v1 setup: 44.1 kHz mono, 512 mel bins over
//! 0–10 kHz, 10 ms hop, 512×512 model images (≈5.1 s of audio per image).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Mel frequency scale used to map FFT bins onto image rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MelScale {
    /// `mel = 2595 * log10(1 + f / 700)`, unnormalized triangles.
    Htk,
    /// Slaney scale with area-normalized triangles.
    Slaney,
}

/// Parameters shared by the encode and decode paths of the spectrogram codec.
///
/// Must be identical on both sides: an image produced under one parameter set
/// and decoded under another is rejected with [`Error::ShapeMismatch`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpectrogramParams {
    /// Two-channel spectrograms (G = left, B = right) instead of mono.
    pub stereo: bool,
    pub sample_rate: u32,
    /// Hop between STFT frames.
    pub step_size_ms: u32,
    /// Hann window length.
    pub window_duration_ms: u32,
    /// FFT size (window is zero-padded to this length).
    pub padded_duration_ms: u32,
    /// Number of mel bins, i.e. image height.
    pub num_frequencies: usize,
    pub min_frequency: f64,
    pub max_frequency: f64,
    pub mel_scale: MelScale,
    /// Projected-gradient iterations for the mel → linear inversion.
    pub max_mel_iters: usize,
    pub num_griffin_lim_iters: usize,
    pub griffin_lim_momentum: f64,
    /// Exponent applied to normalized magnitudes before quantization.
    pub power_for_image: f64,
    /// Magnitude that maps to pixel value 0 for images without a measured maximum.
    pub max_value: f32,
}

impl Default for SpectrogramParams {
    fn default() -> Self {
        Self {
            stereo: false,
            sample_rate: 44100,
            step_size_ms: 10,
            window_duration_ms: 100,
            padded_duration_ms: 400,
            num_frequencies: 512,
            min_frequency: 0.0,
            max_frequency: 10000.0,
            mel_scale: MelScale::Htk,
            max_mel_iters: 200,
            num_griffin_lim_iters: 32,
            griffin_lim_momentum: 0.99,
            power_for_image: 0.25,
            max_value: 30e6,
        }
    }
}

impl SpectrogramParams {
    pub fn num_channels(&self) -> u16 {
        if self.stereo { 2 } else { 1 }
    }

    pub fn hop_length(&self) -> usize {
        ms_to_samples(self.step_size_ms, self.sample_rate)
    }

    pub fn win_length(&self) -> usize {
        ms_to_samples(self.window_duration_ms, self.sample_rate)
    }

    pub fn n_fft(&self) -> usize {
        ms_to_samples(self.padded_duration_ms, self.sample_rate)
    }

    /// One-sided FFT bins (`n_fft / 2 + 1`).
    pub fn num_stft_bins(&self) -> usize {
        self.n_fft() / 2 + 1
    }

    /// Number of waveform samples per channel reconstructed from `frames` columns.
    pub fn samples_for_frames(&self, frames: usize) -> usize {
        self.hop_length() * frames.saturating_sub(1)
    }

    /// Reject parameter sets the codec cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            return Err(Error::Config("sample_rate must be positive".into()));
        }
        if self.hop_length() == 0 || self.win_length() == 0 {
            return Err(Error::Config(format!(
                "hop ({}) and window ({}) must be at least one sample",
                self.hop_length(),
                self.win_length()
            )));
        }
        if self.win_length() > self.n_fft() {
            return Err(Error::Config(format!(
                "window length {} exceeds FFT size {}",
                self.win_length(),
                self.n_fft()
            )));
        }
        if self.num_frequencies == 0 {
            return Err(Error::Config("num_frequencies must be positive".into()));
        }
        let nyquist = self.sample_rate as f64 / 2.0;
        if !(self.min_frequency >= 0.0 && self.min_frequency < self.max_frequency)
            || self.max_frequency > nyquist
        {
            return Err(Error::Config(format!(
                "frequency range [{}, {}] must lie within [0, {nyquist}]",
                self.min_frequency, self.max_frequency
            )));
        }
        if self.power_for_image <= 0.0 {
            return Err(Error::Config("power_for_image must be positive".into()));
        }
        Ok(())
    }
}

fn ms_to_samples(ms: u32, sample_rate: u32) -> usize {
    (ms as u64 * sample_rate as u64 / 1000) as usize
}

/// How the initial latent noise of two seeds is blended along an interpolation path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoiseBlend {
    /// Spherical interpolation, keeps the blended noise on the Gaussian shell.
    Spherical,
    Linear,
}

/// Where the diffusion weights come from and how they run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// HuggingFace repository of the spectrogram diffusion checkpoint.
    pub checkpoint: String,
    /// Repository providing the CLIP `tokenizer.json`.
    pub tokenizer_repo: String,
    pub unet_weights: String,
    pub vae_weights: String,
    pub text_encoder_weights: String,
    pub tokenizer_file: String,
    /// Local directory holding the files above; skips the hub download when set.
    pub local_dir: Option<PathBuf>,
    /// CUDA device ordinal. Ignored when CUDA is unavailable.
    pub cuda_device: usize,
    /// Run in half precision (accelerators only).
    pub half_precision: bool,
    pub width: usize,
    pub height: usize,
    pub num_inference_steps: usize,
    pub noise_blend: NoiseBlend,
    pub use_flash_attn: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            checkpoint: "riffusion/riffusion-model-v1".to_string(),
            tokenizer_repo: "openai/clip-vit-base-patch32".to_string(),
            unet_weights: "unet/diffusion_pytorch_model.safetensors".to_string(),
            vae_weights: "vae/diffusion_pytorch_model.safetensors".to_string(),
            text_encoder_weights: "text_encoder/model.safetensors".to_string(),
            tokenizer_file: "tokenizer.json".to_string(),
            local_dir: None,
            cuda_device: 0,
            half_precision: false,
            width: 512,
            height: 512,
            num_inference_steps: 20,
            noise_blend: NoiseBlend::Spherical,
            use_flash_attn: false,
        }
    }
}

/// Everything the synthesis engine needs at process start.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub spectrogram: SpectrogramParams,
    pub model: ModelConfig,
    /// Directory of `<name>.png` seed images.
    pub seed_image_dir: PathBuf,
    /// Seed image used when the requested one does not exist.
    pub default_seed_image: String,
    pub denoising: f64,
    pub guidance: f64,
    /// Blend position; accepted but has no effect in single-prompt mode.
    pub alpha: f64,
    /// Segments along an interpolation path between distinct endpoints.
    pub step_count: usize,
    /// Returned clips are truncated to this length.
    pub max_clip_seconds: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            spectrogram: SpectrogramParams::default(),
            model: ModelConfig::default(),
            seed_image_dir: default_seed_image_dir(),
            default_seed_image: "og_beat".to_string(),
            denoising: 0.75,
            guidance: 7.0,
            alpha: 0.25,
            step_count: 1,
            max_clip_seconds: 10.0,
        }
    }
}

impl EngineConfig {
    /// Load a JSON config file; missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.spectrogram.validate()?;
        if self.step_count == 0 {
            return Err(Error::Config("step_count must be at least 1".into()));
        }
        if self.model.width % 8 != 0 || self.model.height % 8 != 0 {
            return Err(Error::Config(format!(
                "model resolution {}x{} must be a multiple of 8",
                self.model.width, self.model.height
            )));
        }
        if self.model.height != self.spectrogram.num_frequencies {
            return Err(Error::Config(format!(
                "model image height {} does not match num_frequencies {}",
                self.model.height, self.spectrogram.num_frequencies
            )));
        }
        if self.max_clip_seconds <= 0.0 {
            return Err(Error::Config("max_clip_seconds must be positive".into()));
        }
        Ok(())
    }
}

fn default_seed_image_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join("photong").join("seed_images"))
        .unwrap_or_else(|| PathBuf::from("seed_images"))
}
