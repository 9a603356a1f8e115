//! Seed image assets for img2img sampling.
//!
//! Assets are `<dir>/<name>.png`. A request for a name that does not exist
//! silently falls back to the configured default asset, and if that is
//! missing too, to a built-in beat rendered through the codec. Resolution
//! therefore only fails when an asset exists but cannot be decoded.

use std::f32::consts::TAU;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::Result;
use crate::audio::AudioSegment;
use crate::config::EngineConfig;
use crate::spectrogram::{SpectrogramCodec, SpectrogramImage};

const BEAT_BPM: f32 = 120.0;
const BEAT_SEED: u64 = 0x0b_ea7;

#[derive(Debug, Clone)]
pub struct SeedImageStore {
    dir: PathBuf,
    default_name: String,
    /// Frames of the built-in default (model image width).
    width: u32,
    /// Rendered once, for the codec params it was rendered with.
    builtin: OnceLock<SpectrogramImage>,
}

impl SeedImageStore {
    pub fn new(dir: impl Into<PathBuf>, default_name: impl Into<String>, width: u32) -> Self {
        Self {
            dir: dir.into(),
            default_name: default_name.into(),
            width,
            builtin: OnceLock::new(),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(
            &config.seed_image_dir,
            &config.default_seed_image,
            config.model.width as u32,
        )
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Look up `name`, falling back to the default asset and then the built-in beat.
    pub fn resolve(&self, name: Option<&str>, codec: &SpectrogramCodec) -> Result<SpectrogramImage> {
        if let Some(name) = name {
            match self.asset_path(name) {
                Some(path) => {
                    tracing::debug!(name, "using seed image");
                    return SpectrogramImage::open(&path, codec.params().clone());
                }
                None => tracing::warn!(
                    name,
                    default = %self.default_name,
                    "seed image not found, using default"
                ),
            }
        }

        match self.asset_path(&self.default_name) {
            Some(path) => SpectrogramImage::open(&path, codec.params().clone()),
            None => {
                tracing::warn!(
                    dir = %self.dir.display(),
                    default = %self.default_name,
                    "default seed image missing, rendering built-in beat"
                );
                self.builtin_default(codec)
            }
        }
    }

    /// Names of all `.png` assets in the directory, sorted.
    pub fn list(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().and_then(|e| e.to_str()) == Some("png"))
            .filter_map(|path| path.file_stem().and_then(|s| s.to_str()).map(String::from))
            .filter(|name| is_valid_name(name))
            .collect();
        names.sort();
        names
    }

    /// Spectrogram of a four-on-the-floor kick with off-beat hats, `width` frames long.
    pub fn builtin_default(&self, codec: &SpectrogramCodec) -> Result<SpectrogramImage> {
        match self.builtin.get() {
            Some(image) if image.params() == codec.params() => Ok(image.clone()),
            Some(_) => self.render_builtin(codec),
            None => {
                let image = self.render_builtin(codec)?;
                Ok(self.builtin.get_or_init(|| image).clone())
            }
        }
    }

    fn render_builtin(&self, codec: &SpectrogramCodec) -> Result<SpectrogramImage> {
        let params = codec.params();
        let len = params.samples_for_frames(self.width as usize);
        let samples = render_beat(params.sample_rate, len.max(params.hop_length()));
        codec.encode(&AudioSegment::new(samples, params.sample_rate, 1)?)
    }

    fn asset_path(&self, name: &str) -> Option<PathBuf> {
        if !is_valid_name(name) {
            return None;
        }
        let path = self.dir.join(format!("{name}.png"));
        path.is_file().then_some(path)
    }
}

/// `[A-Za-z0-9_-]+`; keeps lookups inside the asset directory.
fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn render_beat(sample_rate: u32, len: usize) -> Vec<f32> {
    let sr = sample_rate as f32;
    let beat = (60.0 / BEAT_BPM * sr) as usize;
    let mut rng = ChaCha8Rng::seed_from_u64(BEAT_SEED);
    let mut out = vec![0.0f32; len];

    for start in (0..len).step_by(beat.max(1)) {
        // Kick: pitch drops 150 → 50 Hz over ~80 ms.
        let mut phase = 0.0f32;
        for (i, sample) in out[start..].iter_mut().take(beat).enumerate() {
            let t = i as f32 / sr;
            let freq = 50.0 + 100.0 * (-t / 0.03).exp();
            phase += TAU * freq / sr;
            *sample += 0.8 * (-t / 0.12).exp() * phase.sin();
        }
        // Hat on the off-beat.
        let hat = start + beat / 2;
        for (i, sample) in out.iter_mut().skip(hat).take(beat / 2).enumerate() {
            let t = i as f32 / sr;
            *sample += 0.15 * (-t / 0.02).exp() * rng.random_range(-1.0f32..1.0);
        }
    }
    out
}
