//! Spectrogram images: the representation the diffusion model works in.
//!
//! [`SpectrogramCodec`] maps audio to a mel spectrogram image and back. The
//! forward path is a plain STFT + mel projection; the inverse needs a phase
//! estimate, recovered with Griffin-Lim.

pub mod codec;
pub mod image;
pub mod mel;
pub mod stft;

pub use codec::SpectrogramCodec;
pub use image::SpectrogramImage;
