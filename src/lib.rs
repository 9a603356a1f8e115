//! Image-to-music generation in pure Rust.
//!
//! Music is produced as a mel spectrogram image by a text-conditioned latent
//! diffusion model (candle), then turned back into audio by mel inversion and
//! Griffin-Lim phase reconstruction, and delivered as an MP3 data URI.
//!
//! ## Architecture
//!
//! ```text
//! image → caption service → prompt service ─┐
//!                                           ↓
//!            prompt + seed ─→ InterpolationEngine ─→ ConditionedSampler (UNet + VAE)
//!                                           ↓
//!                                  SpectrogramImage
//!                                           ↓
//!                  SpectrogramCodec (mel⁻¹ + Griffin-Lim)
//!                                           ↓
//!                                AudioSegment → MP3 data URI
//! ```
//!
//! ## Modules
//!
//! - [`spectrogram`]: STFT, mel filterbank and the audio ⇄ image codec
//! - [`sampler`]: conditioning states and the diffusion sampler
//! - [`interpolation`]: sampling along a path between two conditioning states
//! - [`engine`]: prompt → clip synthesis
//! - [`manager`]: resident model context with a serialized request queue
//! - [`orchestrator`]: the image → caption → prompt → clip chain

pub mod audio;
pub mod config;
pub mod engine;
pub mod interpolation;
pub mod manager;
pub mod orchestrator;
pub mod sampler;
pub mod seed_images;
pub mod spectrogram;

mod error;
#[cfg(test)]
mod testing;

pub use error::{Error, Result};
