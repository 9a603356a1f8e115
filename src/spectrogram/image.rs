//! The image-domain form of a spectrogram.
//!
//! Layout:
//! - width = STFT frames, height = mel bins, row 0 = highest frequency
//! - pixel = `255 - round(255 * (mel / max_value) ^ power)`, so silence is white
//! - mono is written to all three RGB channels and read back from R;
//!   stereo uses G (left) and B (right) with R left at 0

use std::io::Cursor;
use std::path::Path;

use image::{ImageFormat, Rgb, RgbImage};

use crate::config::SpectrogramParams;
use crate::{Error, Result};

/// Mel magnitudes per channel: `mel[channel][mel_bin][frame]`.
pub type MelChannels = Vec<Vec<Vec<f32>>>;

/// A quantized spectrogram plus the parameters that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct SpectrogramImage {
    image: RgbImage,
    params: SpectrogramParams,
    max_value: f32,
}

impl SpectrogramImage {
    /// Wrap an RGB image (e.g. model output) under the configured `max_value`.
    pub fn new(image: RgbImage, params: SpectrogramParams) -> Self {
        let max_value = params.max_value;
        Self {
            image,
            params,
            max_value,
        }
    }

    pub fn with_max_value(image: RgbImage, params: SpectrogramParams, max_value: f32) -> Self {
        Self {
            image,
            params,
            max_value,
        }
    }

    /// Quantize mel magnitudes into an image. The peak magnitude becomes `max_value`.
    pub fn from_mel(mel: &MelChannels, params: SpectrogramParams) -> Result<Self> {
        let channels = params.num_channels() as usize;
        if mel.len() != channels {
            return Err(Error::shape(
                format!("{channels} channel(s)"),
                format!("{} channel(s)", mel.len()),
            ));
        }
        let height = params.num_frequencies;
        let width = mel[0].first().map(Vec::len).unwrap_or(0);
        for channel in mel {
            if channel.len() != height || channel.iter().any(|row| row.len() != width) {
                return Err(Error::shape(
                    format!("{height} mel rows of {width} frames"),
                    format!("{} rows", channel.len()),
                ));
            }
        }

        let peak = mel
            .iter()
            .flatten()
            .flatten()
            .copied()
            .fold(0.0f32, f32::max);
        let max_value = if peak > 0.0 { peak } else { 1.0 };
        let power = params.power_for_image;

        let quantize = |value: f32| -> u8 {
            let normalized = (value / max_value).clamp(0.0, 1.0) as f64;
            (255.0 - 255.0 * normalized.powf(power)).round().clamp(0.0, 255.0) as u8
        };

        let mut image = RgbImage::new(width as u32, height as u32);
        for y in 0..height {
            let bin = height - 1 - y;
            for x in 0..width {
                let pixel = if params.stereo {
                    Rgb([0, quantize(mel[0][bin][x]), quantize(mel[1][bin][x])])
                } else {
                    let v = quantize(mel[0][bin][x]);
                    Rgb([v, v, v])
                };
                image.put_pixel(x as u32, y as u32, pixel);
            }
        }

        Ok(Self {
            image,
            params,
            max_value,
        })
    }

    /// Undo quantization: back to mel magnitudes scaled by `max_value`.
    pub fn to_mel(&self) -> MelChannels {
        let height = self.image.height() as usize;
        let width = self.image.width() as usize;
        let inverse_power = 1.0 / self.params.power_for_image;
        let planes: &[usize] = if self.params.stereo { &[1, 2] } else { &[0] };

        planes
            .iter()
            .map(|&plane| {
                let mut rows = vec![vec![0.0f32; width]; height];
                for (x, y, pixel) in self.image.enumerate_pixels() {
                    let normalized = (255.0 - pixel.0[plane] as f64) / 255.0;
                    let bin = height - 1 - y as usize;
                    rows[bin][x as usize] =
                        (normalized.powf(inverse_power) * self.max_value as f64) as f32;
                }
                rows
            })
            .collect()
    }

    /// Pixel-wise linear blend: `(1 - fraction) * self + fraction * other`.
    pub fn blend(&self, other: &SpectrogramImage, fraction: f64) -> Result<Self> {
        if self.image.dimensions() != other.image.dimensions() || self.params != other.params {
            return Err(Error::shape(
                format!("{:?}", self.image.dimensions()),
                format!("{:?}", other.image.dimensions()),
            ));
        }
        let fraction = fraction.clamp(0.0, 1.0);
        let mut image = self.image.clone();
        for (dst, src) in image.iter_mut().zip(other.image.iter()) {
            let mixed = (1.0 - fraction) * *dst as f64 + fraction * *src as f64;
            *dst = mixed.round().clamp(0.0, 255.0) as u8;
        }
        let max_value = ((1.0 - fraction) * self.max_value as f64
            + fraction * other.max_value as f64) as f32;
        Ok(Self {
            image,
            params: self.params.clone(),
            max_value,
        })
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn params(&self) -> &SpectrogramParams {
        &self.params
    }

    pub fn max_value(&self) -> f32 {
        self.max_value
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub fn into_image(self) -> RgbImage {
        self.image
    }

    /// Encode the pixels as PNG. `max_value` is not stored.
    pub fn to_png(&self) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        self.image
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)?;
        Ok(bytes)
    }

    /// Decode a PNG (any color type) under the given parameters.
    pub fn from_png(bytes: &[u8], params: SpectrogramParams) -> Result<Self> {
        let image = image::load_from_memory_with_format(bytes, ImageFormat::Png)?.to_rgb8();
        Ok(Self::new(image, params))
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, self.to_png()?)?;
        Ok(())
    }

    pub fn open(path: impl AsRef<Path>, params: SpectrogramParams) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)?;
        Self::from_png(&bytes, params)
            .map_err(|e| Error::Asset(format!("{}: {e}", path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(stereo: bool) -> SpectrogramParams {
        SpectrogramParams {
            stereo,
            num_frequencies: 4,
            ..Default::default()
        }
    }

    fn ramp(height: usize, width: usize, scale: f32) -> Vec<Vec<f32>> {
        (0..height)
            .map(|bin| (0..width).map(|x| scale * (bin * width + x) as f32).collect())
            .collect()
    }

    #[test]
    fn quantization_layout() {
        let mel = vec![ramp(4, 3, 1.0)];
        let spec = SpectrogramImage::from_mel(&mel, params(false)).unwrap();
        assert_eq!(spec.width(), 3);
        assert_eq!(spec.height(), 4);
        assert_eq!(spec.max_value(), 11.0);

        // Peak (top bin, last frame) is black at row 0; silence (bin 0, frame 0) is white at the bottom.
        assert_eq!(spec.image().get_pixel(2, 0).0, [0, 0, 0]);
        assert_eq!(spec.image().get_pixel(0, 3).0, [255, 255, 255]);
    }

    #[test]
    fn dequantize_close_to_input() {
        let mel = vec![ramp(4, 8, 0.5)];
        let spec = SpectrogramImage::from_mel(&mel, params(false)).unwrap();
        let back = spec.to_mel();
        let max = spec.max_value();
        for (row_in, row_out) in mel[0].iter().zip(&back[0]) {
            for (a, b) in row_in.iter().zip(row_out) {
                assert!((a - b).abs() / max < 0.05, "{a} vs {b}");
            }
        }
    }

    #[test]
    fn stereo_uses_green_and_blue() {
        let left = ramp(4, 2, 1.0);
        let right = vec![vec![0.0; 2]; 4];
        let spec = SpectrogramImage::from_mel(&vec![left, right], params(true)).unwrap();
        let pixel = spec.image().get_pixel(1, 0).0;
        assert_eq!(pixel[0], 0);
        assert_eq!(pixel[1], 0, "loudest left cell is black in G");
        assert_eq!(pixel[2], 255, "silent right channel is white in B");
        assert_eq!(spec.to_mel().len(), 2);
    }

    #[test]
    fn rejects_wrong_row_count() {
        let mel = vec![ramp(3, 2, 1.0)];
        let result = SpectrogramImage::from_mel(&mel, params(false));
        assert!(matches!(result, Err(Error::ShapeMismatch { .. })));
    }

    #[test]
    fn silence_quantizes_to_white() {
        let mel = vec![vec![vec![0.0; 5]; 4]];
        let spec = SpectrogramImage::from_mel(&mel, params(false)).unwrap();
        assert!(spec.image().pixels().all(|p| p.0 == [255, 255, 255]));
    }

    #[test]
    fn blend_endpoints_and_midpoint() {
        let black = SpectrogramImage::new(RgbImage::from_pixel(2, 4, Rgb([0, 0, 0])), params(false));
        let white =
            SpectrogramImage::new(RgbImage::from_pixel(2, 4, Rgb([255, 255, 255])), params(false));
        assert_eq!(black.blend(&white, 0.0).unwrap(), black);
        assert_eq!(black.blend(&white, 1.0).unwrap().image(), white.image());
        let mid = black.blend(&white, 0.5).unwrap();
        assert!(mid.image().pixels().all(|p| p.0 == [128, 128, 128]));
    }

    #[test]
    fn png_roundtrip_preserves_pixels() {
        let mel = vec![ramp(4, 6, 2.0)];
        let spec = SpectrogramImage::from_mel(&mel, params(false)).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spec.png");
        spec.save(&path).unwrap();
        let loaded = SpectrogramImage::open(&path, params(false)).unwrap();
        assert_eq!(loaded.image(), spec.image());
        assert_eq!(loaded.max_value(), params(false).max_value);
    }
}
