use crate::audio::{AudioSegment, filters};
use crate::config::SpectrogramParams;
use crate::{Error, Result};

use super::image::{MelChannels, SpectrogramImage};
use super::mel::MelFilterbank;
use super::stft::Stft;

/// Waveforms are analysed at int16 amplitude so that magnitudes line up with
/// `SpectrogramParams::max_value`.
const INT16_SCALE: f32 = 32767.0;

/// Audio ↔ spectrogram image conversion for one parameter set.
///
/// The transforms are planned once at construction; the codec holds no
/// mutable state and can be shared between threads.
pub struct SpectrogramCodec {
    params: SpectrogramParams,
    stft: Stft,
    mel: MelFilterbank,
}

impl SpectrogramCodec {
    pub fn new(params: SpectrogramParams) -> Result<Self> {
        params.validate()?;
        let stft = Stft::new(params.n_fft(), params.win_length(), params.hop_length());
        let mel = MelFilterbank::new(
            params.n_fft(),
            params.num_frequencies,
            params.sample_rate,
            params.min_frequency,
            params.max_frequency,
            params.mel_scale,
        );
        tracing::debug!(
            n_fft = params.n_fft(),
            hop = params.hop_length(),
            mels = params.num_frequencies,
            "spectrogram codec ready"
        );
        Ok(Self { params, stft, mel })
    }

    pub fn params(&self) -> &SpectrogramParams {
        &self.params
    }

    /// Audio → image. Energy outside `[min_frequency, max_frequency]` is dropped.
    ///
    /// The segment must be at the codec's sample rate; channel count is
    /// adapted (downmix or duplicate) to the configured layout.
    pub fn encode(&self, audio: &AudioSegment) -> Result<SpectrogramImage> {
        if audio.sample_rate() != self.params.sample_rate {
            return Err(Error::shape(
                format!("{} Hz audio", self.params.sample_rate),
                format!("{} Hz", audio.sample_rate()),
            ));
        }
        let hop = self.params.hop_length();
        if audio.num_frames() < hop {
            return Err(Error::shape(
                format!("at least {hop} samples per channel"),
                format!("{}", audio.num_frames()),
            ));
        }

        let channels = match (self.params.stereo, audio.channels()) {
            (false, 1) => audio.channel_data(),
            (false, _) => audio.to_mono().channel_data(),
            (true, 1) => {
                let mono = audio.samples().to_vec();
                vec![mono.clone(), mono]
            }
            (true, _) => audio.channel_data().into_iter().take(2).collect(),
        };

        let mel: MelChannels = channels
            .iter()
            .map(|channel| self.mel_spectrogram(channel))
            .collect();
        SpectrogramImage::from_mel(&mel, self.params.clone())
    }

    /// `[mel_bin][frame]` magnitudes of one channel.
    fn mel_spectrogram(&self, samples: &[f32]) -> Vec<Vec<f32>> {
        let scaled: Vec<f32> = samples.iter().map(|s| s * INT16_SCALE).collect();
        let frames = self.stft.magnitudes(&scaled);

        let mut mel = vec![vec![0.0f32; frames.len()]; self.mel.num_mels()];
        for (t, frame) in frames.iter().enumerate() {
            for (bin, value) in self.mel.apply(frame).into_iter().enumerate() {
                mel[bin][t] = value;
            }
        }
        mel
    }

    /// Image → audio via mel inversion and Griffin-Lim phase retrieval.
    ///
    /// With `apply_filters`, the result is band-limited to the parameter
    /// range and leveled. Without, it is only scaled down to full scale when
    /// the reconstruction overshoots, which happens whenever the image was
    /// dequantized against a `max_value` above the clip's own peak.
    pub fn decode(&self, image: &SpectrogramImage, apply_filters: bool) -> Result<AudioSegment> {
        self.check_shape(image)?;

        let started = std::time::Instant::now();
        let length = self.params.samples_for_frames(image.width() as usize);
        let mut channels: Vec<Vec<f32>> = image
            .to_mel()
            .iter()
            .map(|mel| self.reconstruct_channel(mel, length))
            .collect();

        if apply_filters {
            filters::clean_reconstruction(&mut channels, &self.params);
        } else {
            fit_full_scale(&mut channels);
        }

        tracing::debug!(
            frames = image.width(),
            samples = length,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "decoded spectrogram"
        );
        AudioSegment::from_channels(&channels, self.params.sample_rate)
    }

    fn reconstruct_channel(&self, mel: &[Vec<f32>], length: usize) -> Vec<f32> {
        let num_frames = mel.first().map(Vec::len).unwrap_or(0);
        let mut column = vec![0.0f32; mel.len()];
        let magnitudes: Vec<Vec<f32>> = (0..num_frames)
            .map(|t| {
                for (slot, row) in column.iter_mut().zip(mel) {
                    *slot = row[t];
                }
                self.mel.invert(&column, self.params.max_mel_iters)
            })
            .collect();

        self.stft
            .griffin_lim(
                &magnitudes,
                self.params.num_griffin_lim_iters,
                self.params.griffin_lim_momentum,
                length,
            )
            .into_iter()
            .map(|s| s / INT16_SCALE)
            .collect()
    }

    fn check_shape(&self, image: &SpectrogramImage) -> Result<()> {
        if image.params() != &self.params {
            return Err(Error::shape(
                format!("{:?}", self.params),
                format!("{:?}", image.params()),
            ));
        }
        let height = self.params.num_frequencies;
        if image.height() as usize != height || image.width() < 2 {
            return Err(Error::shape(
                format!("{height} rows and at least 2 columns"),
                format!("{}x{}", image.width(), image.height()),
            ));
        }
        Ok(())
    }
}

/// Scale all channels by one factor so the joint peak is at most 1.0.
fn fit_full_scale(channels: &mut [Vec<f32>]) {
    let peak = channels
        .iter()
        .flatten()
        .fold(0.0f32, |peak, s| peak.max(s.abs()));
    if peak > 1.0 {
        for s in channels.iter_mut().flatten() {
            *s /= peak;
        }
    }
}
