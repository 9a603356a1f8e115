//! Audio segments and containers.
//!
//! Reconstructed waveforms leave the pipeline as an [`AudioSegment`] and are
//! packed into MP3 (for transport, as a base64 data URI) or WAV (for files).

pub mod filters;
mod mp3;
mod wav;

pub use mp3::{MP3_DATA_URI_PREFIX, encode_mp3, mp3_data_uri};
pub use wav::{read_wav, write_wav};

use std::path::Path;

use crate::{Error, Result};

/// Decoded waveform: interleaved f32 samples in [-1, 1].
///
/// Immutable once built; transforms return a new segment.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioSegment {
    samples: Vec<f32>,
    sample_rate: u32,
    channels: u16,
}

impl AudioSegment {
    pub fn new(samples: Vec<f32>, sample_rate: u32, channels: u16) -> Result<Self> {
        if sample_rate == 0 || channels == 0 {
            return Err(Error::Config(format!(
                "invalid audio layout: {sample_rate} Hz, {channels} channels"
            )));
        }
        if samples.len() % channels as usize != 0 {
            return Err(Error::Config(format!(
                "{} samples do not divide into {channels} channels",
                samples.len()
            )));
        }
        Ok(Self {
            samples,
            sample_rate,
            channels,
        })
    }

    /// Interleave per-channel sample vectors of equal length.
    pub fn from_channels(channels: &[Vec<f32>], sample_rate: u32) -> Result<Self> {
        let frames = channels.first().map(Vec::len).unwrap_or(0);
        if channels.iter().any(|c| c.len() != frames) {
            return Err(Error::Config("channel lengths differ".into()));
        }
        let mut samples = Vec::with_capacity(frames * channels.len());
        for i in 0..frames {
            for channel in channels {
                samples.push(channel[i]);
            }
        }
        Self::new(samples, sample_rate, channels.len() as u16)
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Samples per channel.
    pub fn num_frames(&self) -> usize {
        self.samples.len() / self.channels as usize
    }

    /// Sample count / sample rate.
    pub fn duration_seconds(&self) -> f64 {
        self.num_frames() as f64 / self.sample_rate as f64
    }

    /// De-interleave into one vector per channel.
    pub fn channel_data(&self) -> Vec<Vec<f32>> {
        let n = self.channels as usize;
        (0..n)
            .map(|ch| self.samples.iter().skip(ch).step_by(n).copied().collect())
            .collect()
    }

    /// Average all channels into one.
    pub fn to_mono(&self) -> AudioSegment {
        let n = self.channels as usize;
        let samples = self
            .samples
            .chunks_exact(n)
            .map(|frame| frame.iter().sum::<f32>() / n as f32)
            .collect();
        AudioSegment {
            samples,
            sample_rate: self.sample_rate,
            channels: 1,
        }
    }

    /// Keep at most `seconds` of audio.
    pub fn truncated(&self, seconds: f64) -> AudioSegment {
        let max_frames = (seconds.max(0.0) * self.sample_rate as f64).floor() as usize;
        let keep = self.num_frames().min(max_frames) * self.channels as usize;
        AudioSegment {
            samples: self.samples[..keep].to_vec(),
            sample_rate: self.sample_rate,
            channels: self.channels,
        }
    }
}

/// Supported output container formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioFormat {
    Wav,
    Mp3,
}

impl AudioFormat {
    /// Parse a file extension (case-insensitive).
    pub fn parse(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "wav" => Some(Self::Wav),
            "mp3" => Some(Self::Mp3),
            _ => None,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Wav => "wav",
            Self::Mp3 => "mp3",
        }
    }
}

/// Write a segment to `path`, picking the container from the extension.
pub fn write_audio(path: impl AsRef<Path>, segment: &AudioSegment) -> Result<()> {
    let path = path.as_ref();
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("wav");
    match AudioFormat::parse(ext) {
        Some(AudioFormat::Wav) => write_wav(path, segment),
        Some(AudioFormat::Mp3) => {
            let bytes = encode_mp3(segment)?;
            std::fs::write(path, bytes)?;
            Ok(())
        }
        None => Err(Error::Config(format!(
            "unsupported output format '{ext}'. Use .wav or .mp3"
        ))),
    }
}
