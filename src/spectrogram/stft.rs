//! Short-time Fourier transform, its inverse, and Griffin-Lim phase retrieval.
//!
//! Framing matches a centered STFT:
//! - Window: periodic Hann of `win_length`, zero-padded (centered) to `n_fft`
//! - Padding: reflect, `n_fft / 2` on both sides
//! - Frames: `1 + len / hop`
//! - Inverse: windowed overlap-add divided by the squared-window envelope

use std::sync::Arc;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};

/// Fixed seed for the initial phase estimate, so reconstruction is repeatable.
const PHASE_INIT_SEED: u64 = 0x5eed_9a5e;

/// One-sided spectrum per frame: `frames[frame][bin]`.
pub type Spectrum = Vec<Vec<Complex<f32>>>;

/// Planned forward/inverse transforms for one framing configuration.
pub struct Stft {
    n_fft: usize,
    hop_length: usize,
    window: Vec<f32>,
    forward: Arc<dyn Fft<f32>>,
    inverse: Arc<dyn Fft<f32>>,
}

impl Stft {
    pub fn new(n_fft: usize, win_length: usize, hop_length: usize) -> Self {
        let win_length = win_length.min(n_fft);
        let offset = (n_fft - win_length) / 2;
        let mut window = vec![0.0f32; n_fft];
        for (i, w) in hann_window(win_length).into_iter().enumerate() {
            window[offset + i] = w as f32;
        }

        let mut planner = FftPlanner::new();
        let forward = planner.plan_fft_forward(n_fft);
        let inverse = planner.plan_fft_inverse(n_fft);

        Self {
            n_fft,
            hop_length,
            window,
            forward,
            inverse,
        }
    }

    /// `n_fft / 2 + 1`.
    pub fn num_bins(&self) -> usize {
        self.n_fft / 2 + 1
    }

    pub fn num_frames(&self, signal_len: usize) -> usize {
        1 + signal_len / self.hop_length
    }

    /// Complex one-sided STFT of a mono signal.
    pub fn forward(&self, signal: &[f32]) -> Spectrum {
        let pad = self.n_fft / 2;
        let padded = reflect_pad(signal, pad, pad);
        let num_frames = self.num_frames(signal.len());
        let num_bins = self.num_bins();

        let mut buffer = vec![Complex::new(0.0f32, 0.0); self.n_fft];
        let mut frames = Vec::with_capacity(num_frames);
        for frame_idx in 0..num_frames {
            let start = frame_idx * self.hop_length;
            for (i, slot) in buffer.iter_mut().enumerate() {
                *slot = Complex::new(padded[start + i] * self.window[i], 0.0);
            }
            self.forward.process(&mut buffer);
            frames.push(buffer[..num_bins].to_vec());
        }
        frames
    }

    /// Magnitude spectrogram, `[frame][bin]`.
    pub fn magnitudes(&self, signal: &[f32]) -> Vec<Vec<f32>> {
        self.forward(signal)
            .into_iter()
            .map(|frame| frame.iter().map(|c| c.norm()).collect())
            .collect()
    }

    /// Inverse STFT, trimmed to `length` samples.
    pub fn inverse(&self, frames: &[Vec<Complex<f32>>], length: usize) -> Vec<f32> {
        let n_fft = self.n_fft;
        let num_bins = self.num_bins();
        let total = n_fft + self.hop_length * frames.len().saturating_sub(1);
        let mut output = vec![0.0f32; total];
        let mut envelope = vec![0.0f32; total];
        let mut buffer = vec![Complex::new(0.0f32, 0.0); n_fft];
        let scale = 1.0 / n_fft as f32;

        for (frame_idx, frame) in frames.iter().enumerate() {
            // Rebuild the Hermitian-symmetric full spectrum.
            for (k, slot) in buffer.iter_mut().enumerate() {
                *slot = if k < num_bins {
                    frame[k]
                } else {
                    frame[n_fft - k].conj()
                };
            }
            buffer[0].im = 0.0;
            if n_fft % 2 == 0 {
                buffer[n_fft / 2].im = 0.0;
            }
            self.inverse.process(&mut buffer);

            let start = frame_idx * self.hop_length;
            for i in 0..n_fft {
                let w = self.window[i];
                output[start + i] += buffer[i].re * scale * w;
                envelope[start + i] += w * w;
            }
        }

        for (sample, &env) in output.iter_mut().zip(&envelope) {
            if env > 1e-11 {
                *sample /= env;
            }
        }

        let start = n_fft / 2;
        let mut trimmed: Vec<f32> = output.into_iter().skip(start).take(length).collect();
        trimmed.resize(length, 0.0);
        trimmed
    }

    /// Recover a waveform from magnitudes alone.
    ///
    /// Fast Griffin-Lim: alternate ISTFT/STFT projections for `n_iter`
    /// iterations, with momentum on the phase update. The initial phase is drawn
    /// from a fixed-seed generator.
    pub fn griffin_lim(
        &self,
        magnitudes: &[Vec<f32>],
        n_iter: usize,
        momentum: f64,
        length: usize,
    ) -> Vec<f32> {
        let mut rng = ChaCha8Rng::seed_from_u64(PHASE_INIT_SEED);
        let mut angles: Spectrum = magnitudes
            .iter()
            .map(|frame| {
                frame
                    .iter()
                    .map(|_| Complex::from_polar(1.0f32, rng.random::<f32>() * std::f32::consts::TAU))
                    .collect()
            })
            .collect();

        let momentum = (momentum / (1.0 + momentum)) as f32;
        let mut previous: Option<Spectrum> = None;

        for iteration in 0..n_iter {
            let estimate = self.inverse(&apply_phase(magnitudes, &angles), length);
            let rebuilt = self.forward(&estimate);

            for (frame_idx, frame) in angles.iter_mut().enumerate() {
                for (bin, angle) in frame.iter_mut().enumerate() {
                    let mut value = rebuilt[frame_idx][bin];
                    if let Some(prev) = &previous {
                        value -= prev[frame_idx][bin] * momentum;
                    }
                    *angle = value / (value.norm() + 1e-16);
                }
            }
            previous = Some(rebuilt);

            if iteration % 8 == 0 {
                tracing::trace!(iteration, "griffin-lim");
            }
        }

        self.inverse(&apply_phase(magnitudes, &angles), length)
    }
}

fn apply_phase(magnitudes: &[Vec<f32>], angles: &[Vec<Complex<f32>>]) -> Spectrum {
    magnitudes
        .iter()
        .zip(angles)
        .map(|(mags, phases)| mags.iter().zip(phases).map(|(&m, &p)| p * m).collect())
        .collect()
}

/// Periodic Hann window of the given length.
pub fn hann_window(length: usize) -> Vec<f64> {
    (0..length)
        .map(|i| {
            let phase = 2.0 * std::f64::consts::PI * i as f64 / length as f64;
            0.5 * (1.0 - phase.cos())
        })
        .collect()
}

/// Reflect-pad a signal on both sides.
///
/// Signals shorter than the padding clamp to their edge samples; an empty
/// signal pads with zeros.
pub fn reflect_pad(signal: &[f32], pad_left: usize, pad_right: usize) -> Vec<f32> {
    let len = signal.len();
    if len == 0 {
        return vec![0.0; pad_left + pad_right];
    }
    let mut padded = Vec::with_capacity(pad_left + len + pad_right);

    // Left reflection: signal[pad_left], signal[pad_left-1], ..., signal[1]
    for i in (1..=pad_left).rev() {
        padded.push(signal[i.min(len - 1)]);
    }

    padded.extend_from_slice(signal);

    // Right reflection: signal[len-2], signal[len-3], ...
    for i in 0..pad_right {
        let idx = len.saturating_sub(2 + i);
        padded.push(signal[idx]);
    }

    padded
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f32, sample_rate: f32, len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| (std::f32::consts::TAU * freq * i as f32 / sample_rate).sin())
            .collect()
    }

    #[test]
    fn hann_window_properties() {
        let w = hann_window(2048);
        assert_eq!(w.len(), 2048);
        assert!(w[0].abs() < 1e-10);
        assert!((w[1024] - 1.0).abs() < 1e-10);
        assert!((w[100] - w[2048 - 100]).abs() < 1e-10);
    }

    #[test]
    fn reflect_pad_basic() {
        let padded = reflect_pad(&[1.0, 2.0, 3.0, 4.0, 5.0], 2, 2);
        assert_eq!(padded, vec![3.0, 2.0, 1.0, 2.0, 3.0, 4.0, 5.0, 4.0, 3.0]);
    }

    #[test]
    fn reflect_pad_degenerate_inputs() {
        assert_eq!(reflect_pad(&[], 2, 1), vec![0.0; 3]);
        assert_eq!(reflect_pad(&[7.0], 2, 2), vec![7.0; 5]);
    }

    #[test]
    fn stft_output_shape() {
        let stft = Stft::new(800, 400, 80);
        let frames = stft.forward(&vec![0.0; 8000]);
        assert_eq!(frames.len(), 101);
        assert_eq!(frames[0].len(), 401);
    }

    #[test]
    fn stft_peak_at_tone_bin() {
        // 8 kHz, n_fft 800 → 10 Hz bins; a 1 kHz tone lands on bin 100.
        let stft = Stft::new(800, 400, 80);
        let mags = stft.magnitudes(&sine(1000.0, 8000.0, 8000));
        let frame = &mags[50];
        let peak_bin = frame
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap();
        assert_eq!(peak_bin, 100);
    }

    #[test]
    fn istft_inverts_stft() {
        let stft = Stft::new(512, 400, 100);
        let signal = sine(440.0, 8000.0, 4000);
        let frames = stft.forward(&signal);
        let rebuilt = stft.inverse(&frames, signal.len());
        assert_eq!(rebuilt.len(), signal.len());
        let max_err = signal
            .iter()
            .zip(&rebuilt)
            .map(|(a, b)| (a - b).abs())
            .fold(0.0f32, f32::max);
        assert!(max_err < 1e-3, "max reconstruction error {max_err}");
    }

    #[test]
    fn griffin_lim_recovers_magnitudes() {
        let stft = Stft::new(512, 400, 100);
        let signal = sine(500.0, 8000.0, 6000);
        let target = stft.magnitudes(&signal);
        let rebuilt = stft.griffin_lim(&target, 32, 0.99, signal.len());
        let achieved = stft.magnitudes(&rebuilt);

        let total: f32 = target.iter().flatten().sum();
        let error: f32 = target
            .iter()
            .flatten()
            .zip(achieved.iter().flatten())
            .map(|(a, b)| (a - b).abs())
            .sum();
        let relative = error / total;
        assert!(relative < 0.25, "spectral convergence error {relative}");
    }

    #[test]
    fn griffin_lim_is_deterministic() {
        let stft = Stft::new(256, 200, 50);
        let target = stft.magnitudes(&sine(300.0, 8000.0, 2000));
        let a = stft.griffin_lim(&target, 4, 0.99, 2000);
        let b = stft.griffin_lim(&target, 4, 0.99, 2000);
        assert_eq!(a, b);
    }
}
