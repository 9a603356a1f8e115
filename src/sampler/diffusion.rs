//! Latent-diffusion sampler: Stable Diffusion v1 img2img over spectrogram images.
//!
//! ```text
//! prompt ─→ CLIP ─→ cond ┐
//! ""     ─→ CLIP ─→ uncond ┴→ UNet (CFG) × DDIM steps ─→ VAE decode ─→ RGB
//! seed image ─→ VAE encode ─→ noised to t_start ┘
//! ```
//!
//! Weights come from a local directory or the HuggingFace hub. The CLIP
//! tokenizer is fetched separately since the checkpoint repo ships only the
//! slow-tokenizer files.

use std::collections::{HashMap, VecDeque};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::path::PathBuf;
use std::time::Instant;

use candle_core::{DType, Device, IndexOp, Module, Tensor};
use candle_transformers::models::stable_diffusion::{
    self, StableDiffusionConfig,
    clip::ClipTextTransformer,
    ddim::DDIMSchedulerConfig,
    schedulers::{Scheduler, SchedulerConfig},
    unet_2d::UNet2DConditionModel,
    vae::AutoEncoderKL,
};
use hf_hub::api::sync::Api;
use image::imageops::{self, FilterType};
use image::{GrayImage, RgbImage};
use tokenizers::Tokenizer;

use super::{ConditionedSampler, ConditioningBlend, noise};
use crate::config::{ModelConfig, SpectrogramParams};
use crate::spectrogram::SpectrogramImage;
use crate::{Error, Result};

/// SD v1 VAE latent scaling factor.
const LATENT_SCALE: f64 = 0.18215;

const LATENT_CHANNELS: usize = 4;

/// Seed-image encodings kept per process.
const MAX_CACHED_INIT_LATENTS: usize = 16;

/// Local paths of everything the sampler loads.
#[derive(Debug, Clone)]
struct ModelFiles {
    unet: PathBuf,
    vae: PathBuf,
    text_encoder: PathBuf,
    tokenizer: PathBuf,
}

impl ModelFiles {
    fn resolve(config: &ModelConfig) -> Result<Self> {
        match &config.local_dir {
            Some(dir) => {
                let file = |name: &str| -> Result<PathBuf> {
                    let path = dir.join(name);
                    if path.is_file() {
                        Ok(path)
                    } else {
                        Err(Error::ModelUnavailable(format!(
                            "missing model file {}",
                            path.display()
                        )))
                    }
                };
                Ok(Self {
                    unet: file(&config.unet_weights)?,
                    vae: file(&config.vae_weights)?,
                    text_encoder: file(&config.text_encoder_weights)?,
                    tokenizer: file(&config.tokenizer_file)?,
                })
            }
            None => {
                let unavailable = |e: hf_hub::api::sync::ApiError| {
                    Error::ModelUnavailable(format!("hub download: {e}"))
                };
                let api = Api::new().map_err(unavailable)?;
                let repo = api.model(config.checkpoint.clone());
                tracing::info!(checkpoint = %config.checkpoint, "fetching diffusion weights");
                Ok(Self {
                    unet: repo.get(&config.unet_weights).map_err(unavailable)?,
                    vae: repo.get(&config.vae_weights).map_err(unavailable)?,
                    text_encoder: repo.get(&config.text_encoder_weights).map_err(unavailable)?,
                    tokenizer: api
                        .model(config.tokenizer_repo.clone())
                        .get(&config.tokenizer_file)
                        .map_err(unavailable)?,
                })
            }
        }
    }
}

/// Resident diffusion model context.
///
/// Holds device memory for the lifetime of the value; drop it to release.
pub struct DiffusionSampler {
    params: SpectrogramParams,
    device: Device,
    dtype: DType,
    width: usize,
    height: usize,
    tokenizer: Tokenizer,
    pad_id: u32,
    max_tokens: usize,
    text_model: ClipTextTransformer,
    unet: UNet2DConditionModel,
    vae: AutoEncoderKL,
    num_inference_steps: usize,
    /// VAE posterior draws keyed by init-image content and seed.
    init_latents: HashMap<u64, Tensor>,
    /// Insertion order of `init_latents`, oldest first.
    init_latent_order: VecDeque<u64>,
}

impl DiffusionSampler {
    /// Load tokenizer, CLIP, UNet and VAE onto `device`.
    ///
    /// Every failure here is [`Error::ModelUnavailable`].
    pub fn load(config: &ModelConfig, params: SpectrogramParams, device: &Device) -> Result<Self> {
        if config.height != params.num_frequencies {
            return Err(Error::Config(format!(
                "model height {} does not match num_frequencies {}",
                config.height, params.num_frequencies
            )));
        }
        let files = ModelFiles::resolve(config)?;
        let dtype = if config.half_precision && !device.is_cpu() {
            DType::F16
        } else {
            DType::F32
        };
        let unavailable =
            |what: &'static str| move |e: candle_core::Error| Error::ModelUnavailable(format!("{what}: {e}"));

        let sd = StableDiffusionConfig::v1_5(None, Some(config.height), Some(config.width));

        tracing::info!(path = ?files.tokenizer, "loading CLIP tokenizer");
        let tokenizer = Tokenizer::from_file(&files.tokenizer)?;
        let pad_token = sd
            .clip
            .pad_with
            .clone()
            .unwrap_or_else(|| "<|endoftext|>".to_string());
        let pad_id = *tokenizer
            .get_vocab(true)
            .get(&pad_token)
            .ok_or_else(|| Error::ModelUnavailable(format!("tokenizer lacks {pad_token}")))?;

        tracing::info!(path = ?files.text_encoder, "loading text encoder");
        let text_model =
            stable_diffusion::build_clip_transformer(&sd.clip, &files.text_encoder, device, dtype)
                .map_err(unavailable("text encoder"))?;
        tracing::info!(path = ?files.unet, "loading UNet");
        let unet = sd
            .build_unet(&files.unet, device, LATENT_CHANNELS, config.use_flash_attn, dtype)
            .map_err(unavailable("unet"))?;
        tracing::info!(path = ?files.vae, "loading VAE");
        let vae = sd
            .build_vae(&files.vae, device, dtype)
            .map_err(unavailable("vae"))?;

        if device.is_cpu() {
            tracing::warn!(
                "CPU RNG cannot be seeded; seed-image encodings are stable per process only"
            );
        }

        tracing::info!(
            device = ?device,
            ?dtype,
            width = config.width,
            height = config.height,
            steps = config.num_inference_steps,
            "diffusion sampler ready"
        );
        Ok(Self {
            params,
            device: device.clone(),
            dtype,
            width: config.width,
            height: config.height,
            tokenizer,
            pad_id,
            max_tokens: sd.clip.max_position_embeddings,
            text_model,
            unet,
            vae,
            num_inference_steps: config.num_inference_steps,
            init_latents: HashMap::new(),
            init_latent_order: VecDeque::new(),
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    fn latent_dims(&self) -> (usize, usize, usize, usize) {
        (1, LATENT_CHANNELS, self.height / 8, self.width / 8)
    }

    fn tokenize(&self, prompt: &str) -> Result<Tensor> {
        let encoding = self
            .tokenizer
            .encode(prompt, true)
            .map_err(|e| Error::SamplingFailed(format!("tokenize: {e}")))?;
        let mut ids = encoding.get_ids().to_vec();
        ids.truncate(self.max_tokens);
        ids.resize(self.max_tokens, self.pad_id);
        Tensor::new(ids.as_slice(), &self.device)
            .and_then(|t| t.unsqueeze(0))
            .map_err(sampling_failed)
    }

    /// `[uncond; cond]` text embeddings for a blend.
    fn text_embeddings(&self, blend: &ConditioningBlend) -> Result<Tensor> {
        let (start, end) = match blend.endpoint() {
            Some(state) => (self.tokenize(state.prompt())?, None),
            None => (
                self.tokenize(blend.start.prompt())?,
                Some(self.tokenize(blend.end.prompt())?),
            ),
        };
        let uncond = self.tokenize("")?;

        let embed = || -> candle_core::Result<Tensor> {
            let mut cond = self.text_model.forward(&start)?;
            if let Some(end) = &end {
                let end = self.text_model.forward(end)?;
                cond = ((cond * (1.0 - blend.t))? + (end * blend.t)?)?;
            }
            let uncond = self.text_model.forward(&uncond)?;
            Tensor::cat(&[uncond, cond], 0)?.to_dtype(self.dtype)
        };
        embed().map_err(sampling_failed)
    }

    /// VAE encoding of an init image, memoized by pixel content and seed.
    fn encode_init(&mut self, image: &RgbImage, seed: u64) -> Result<Tensor> {
        let key = init_latent_key(image, seed);
        if let Some(latents) = self.init_latents.get(&key) {
            return Ok(latents.clone());
        }

        if let Err(e) = self.device.set_seed(seed) {
            tracing::debug!(%e, seed, "device RNG not seedable; posterior draw is unseeded");
        }
        let pixels = self.image_tensor(image).map_err(sampling_failed)?;
        let latents = self
            .vae
            .encode(&pixels)
            .and_then(|dist| dist.sample())
            .and_then(|sample| sample * LATENT_SCALE)
            .map_err(sampling_failed)?;

        while self.init_latent_order.len() >= MAX_CACHED_INIT_LATENTS {
            if let Some(oldest) = self.init_latent_order.pop_front() {
                self.init_latents.remove(&oldest);
            }
        }
        self.init_latent_order.push_back(key);
        self.init_latents.insert(key, latents.clone());
        Ok(latents)
    }

    /// `[1, 3, H, W]` in [-1, 1], resized to the model resolution.
    fn image_tensor(&self, image: &RgbImage) -> candle_core::Result<Tensor> {
        let (w, h) = (self.width as u32, self.height as u32);
        let resized = if image.dimensions() == (w, h) {
            image.clone()
        } else {
            imageops::resize(image, w, h, FilterType::Lanczos3)
        };
        Tensor::from_vec(resized.into_raw(), (self.height, self.width, 3), &self.device)?
            .permute((2, 0, 1))?
            .to_dtype(DType::F32)?
            .affine(2.0 / 255.0, -1.0)?
            .unsqueeze(0)?
            .to_dtype(self.dtype)
    }

    /// `[1, 1, H/8, W/8]` keep-weights from a mask image.
    fn mask_tensor(&self, mask: &GrayImage) -> candle_core::Result<Tensor> {
        let (_, _, lh, lw) = self.latent_dims();
        Tensor::from_vec(mask_weights(mask, lw, lh), (1, 1, lh, lw), &self.device)?
            .to_dtype(self.dtype)
    }

    fn scheduler(&self) -> candle_core::Result<Box<dyn Scheduler>> {
        DDIMSchedulerConfig::default().build(self.num_inference_steps)
    }

    /// Run the denoising loop and decode to `[3, H, W]` floats in ~[0, 1].
    fn denoise(
        &self,
        text_embeddings: &Tensor,
        noise: &Tensor,
        init_latents: Option<&Tensor>,
        mask: Option<&Tensor>,
        guidance: f64,
        denoising: f64,
    ) -> candle_core::Result<Tensor> {
        let mut scheduler = self.scheduler()?;
        let timesteps = scheduler.timesteps().to_vec();
        let n = timesteps.len();

        let (mut latents, t_start) = match init_latents {
            Some(init) => {
                let t_start = n - ((n as f64 * denoising).floor() as usize).min(n);
                match timesteps.get(t_start) {
                    Some(&t) => (scheduler.add_noise(init, noise.clone(), t)?, t_start),
                    None => (init.clone(), n),
                }
            }
            None => ((noise * scheduler.init_noise_sigma())?, 0),
        };

        for (index, &timestep) in timesteps.iter().enumerate().skip(t_start) {
            let model_input = Tensor::cat(&[&latents, &latents], 0)?;
            let noise_pred = self
                .unet
                .forward(&model_input, timestep as f64, text_embeddings)?;
            let chunks = noise_pred.chunk(2, 0)?;
            let (uncond, cond) = (&chunks[0], &chunks[1]);
            let guided = (uncond + ((cond - uncond)? * guidance)?)?;
            latents = scheduler.step(&guided, timestep, &latents)?;

            // White mask pixels keep the init image, black ones are regenerated.
            if let (Some(init), Some(mask)) = (init_latents, mask) {
                let kept = match timesteps.get(index + 1) {
                    Some(&next) => scheduler.add_noise(init, noise.clone(), next)?,
                    None => init.clone(),
                };
                latents = (kept.broadcast_mul(mask)? + latents.broadcast_mul(&mask.affine(-1.0, 1.0)?)?)?;
            }
            tracing::trace!(step = index, timestep, "denoise");
        }

        let decoded = self.vae.decode(&(latents / LATENT_SCALE)?)?;
        ((decoded / 2.0)? + 0.5)?
            .to_dtype(DType::F32)?
            .to_device(&Device::Cpu)?
            .i(0)
    }
}

impl ConditionedSampler for DiffusionSampler {
    fn sample(
        &mut self,
        blend: &ConditioningBlend,
        init_image: Option<&SpectrogramImage>,
        mask: Option<&GrayImage>,
    ) -> Result<SpectrogramImage> {
        if let Some(init) = init_image {
            if init.params() != &self.params {
                return Err(Error::shape(
                    format!("{:?}", self.params),
                    format!("{:?}", init.params()),
                ));
            }
        }

        let started = Instant::now();
        let text_embeddings = self.text_embeddings(blend)?;

        let dims = self.latent_dims();
        let noise_values = noise::blend_noise(blend, dims.0 * dims.1 * dims.2 * dims.3);
        let noise = Tensor::from_vec(noise_values, dims, &self.device)
            .and_then(|t| t.to_dtype(self.dtype))
            .map_err(sampling_failed)?;

        let seed = blend.endpoint().unwrap_or(&blend.start).seed();
        let init_latents = match init_image {
            Some(init) => Some(self.encode_init(init.image(), seed)?),
            None => None,
        };
        let mask = match mask {
            Some(mask) => Some(self.mask_tensor(mask).map_err(sampling_failed)?),
            None => None,
        };

        let decoded = self
            .denoise(
                &text_embeddings,
                &noise,
                init_latents.as_ref(),
                mask.as_ref(),
                blend.guidance(),
                blend.denoising(),
            )
            .map_err(sampling_failed)?;

        // [3, H, W] → HWC
        let values: Vec<f32> = decoded
            .permute((1, 2, 0))
            .and_then(|t| t.flatten_all())
            .and_then(|t| t.to_vec1())
            .map_err(sampling_failed)?;
        if values.iter().any(|v| !v.is_finite()) {
            return Err(Error::SamplingFailed(
                "non-finite values in decoded image".into(),
            ));
        }
        let pixels: Vec<u8> = values
            .iter()
            .map(|v| (v.clamp(0.0, 1.0) * 255.0).round() as u8)
            .collect();
        let image = RgbImage::from_raw(self.width as u32, self.height as u32, pixels)
            .ok_or_else(|| Error::SamplingFailed("decoded image has wrong size".into()))?;

        tracing::debug!(
            guidance = blend.guidance(),
            denoising = blend.denoising(),
            t = blend.t,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "sampled spectrogram"
        );
        Ok(SpectrogramImage::new(image, self.params.clone()))
    }
}

fn sampling_failed(error: candle_core::Error) -> Error {
    Error::SamplingFailed(error.to_string())
}

/// Cache key for a VAE posterior draw: the draw depends on both the pixels
/// and the seed the device RNG was set to.
fn init_latent_key(image: &RgbImage, seed: u64) -> u64 {
    let mut hasher = DefaultHasher::new();
    image.dimensions().hash(&mut hasher);
    image.as_raw().hash(&mut hasher);
    seed.hash(&mut hasher);
    hasher.finish()
}

/// Row-major keep-weights in [0, 1] at latent resolution: white (255) keeps
/// the init image, black (0) is fully regenerated.
fn mask_weights(mask: &GrayImage, latent_width: usize, latent_height: usize) -> Vec<f32> {
    imageops::resize(
        mask,
        latent_width as u32,
        latent_height as u32,
        FilterType::Triangle,
    )
    .into_raw()
    .into_iter()
    .map(|v| v as f32 / 255.0)
    .collect()
}
