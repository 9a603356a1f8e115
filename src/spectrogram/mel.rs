//! Mel filterbank: linear FFT bins ↔ image rows.
//!
//! Filters are triangular on either the HTK or the Slaney mel scale. Each
//! filter touches only a handful of FFT bins, so the bank is stored sparsely
//! and both the forward map and its non-negative least-squares inverse run in
//! time proportional to the number of non-zero weights.

use crate::config::MelScale;

/// One triangular filter: `weights[i]` applies to bin `start + i`.
#[derive(Debug, Clone)]
struct SparseFilter {
    start: usize,
    weights: Vec<f32>,
}

/// Sparse mel filterbank of `num_mels` filters over `num_bins` FFT bins.
#[derive(Debug, Clone)]
pub struct MelFilterbank {
    filters: Vec<SparseFilter>,
    num_bins: usize,
    /// Sum of weights per filter.
    row_sums: Vec<f32>,
    /// Upper bound on the largest eigenvalue of `Fᵀ F`.
    lipschitz: f32,
}

impl MelFilterbank {
    pub fn new(
        n_fft: usize,
        num_mels: usize,
        sample_rate: u32,
        f_min: f64,
        f_max: f64,
        scale: MelScale,
    ) -> Self {
        let dense = mel_filterbank(n_fft, num_mels, sample_rate, f_min, f_max, scale);
        let num_bins = n_fft / 2 + 1;

        let filters: Vec<SparseFilter> = dense
            .iter()
            .map(|row| {
                let first = row.iter().position(|&w| w > 0.0);
                let last = row.iter().rposition(|&w| w > 0.0);
                match (first, last) {
                    (Some(first), Some(last)) => SparseFilter {
                        start: first,
                        weights: row[first..=last].iter().map(|&w| w as f32).collect(),
                    },
                    _ => SparseFilter {
                        start: 0,
                        weights: Vec::new(),
                    },
                }
            })
            .collect();

        let row_sums: Vec<f32> = filters.iter().map(|f| f.weights.iter().sum()).collect();
        let mut col_sums = vec![0.0f32; num_bins];
        for filter in &filters {
            for (i, &w) in filter.weights.iter().enumerate() {
                col_sums[filter.start + i] += w;
            }
        }
        let max_row = row_sums.iter().copied().fold(0.0f32, f32::max);
        let max_col = col_sums.iter().copied().fold(0.0f32, f32::max);

        let empty = filters.iter().filter(|f| f.weights.is_empty()).count();
        if empty > 0 {
            tracing::warn!(
                empty,
                num_mels,
                "mel filters without any FFT bin; increase n_fft or reduce num_frequencies"
            );
        }

        Self {
            filters,
            num_bins,
            row_sums,
            lipschitz: (max_row * max_col).max(f32::EPSILON),
        }
    }

    pub fn num_mels(&self) -> usize {
        self.filters.len()
    }

    pub fn num_bins(&self) -> usize {
        self.num_bins
    }

    /// Project one linear-magnitude frame onto the mel bins.
    pub fn apply(&self, linear: &[f32]) -> Vec<f32> {
        self.filters
            .iter()
            .map(|filter| {
                filter
                    .weights
                    .iter()
                    .zip(&linear[filter.start..])
                    .map(|(w, x)| w * x)
                    .sum()
            })
            .collect()
    }

    /// `out = Fᵀ mel`
    fn apply_transpose(&self, mel: &[f32], out: &mut [f32]) {
        out.fill(0.0);
        for (filter, &m) in self.filters.iter().zip(mel) {
            if m == 0.0 {
                continue;
            }
            for (i, &w) in filter.weights.iter().enumerate() {
                out[filter.start + i] += w * m;
            }
        }
    }

    /// Estimate a non-negative linear-magnitude frame whose mel projection
    /// matches `mel`.
    ///
    /// Starts from each bin's share of the overlapping filters' energy, then
    /// runs `iterations` steps of projected gradient descent on
    /// `‖F x − mel‖²` subject to `x ≥ 0`. Bins outside every filter stay zero.
    pub fn invert(&self, mel: &[f32], iterations: usize) -> Vec<f32> {
        let mut densities = vec![0.0f32; mel.len()];
        for ((d, &m), &sum) in densities.iter_mut().zip(mel).zip(&self.row_sums) {
            if sum > 0.0 {
                *d = m / sum;
            }
        }
        let mut x = vec![0.0f32; self.num_bins];
        self.apply_transpose(&densities, &mut x);

        let step = 1.0 / self.lipschitz;
        let mut gradient = vec![0.0f32; self.num_bins];
        for _ in 0..iterations {
            let residual: Vec<f32> = self
                .apply(&x)
                .iter()
                .zip(mel)
                .map(|(projected, target)| projected - target)
                .collect();
            if residual.iter().all(|r| r.abs() < 1e-9) {
                break;
            }
            self.apply_transpose(&residual, &mut gradient);
            for (xi, gi) in x.iter_mut().zip(&gradient) {
                *xi = (*xi - step * gi).max(0.0);
            }
        }
        x
    }
}

/// Build a dense triangular mel filterbank.
///
/// Returns `n_mels` filters, each with `n_fft/2 + 1` weights. HTK filters peak
/// at 1; Slaney filters are area-normalized by `2 / (f_right - f_left)`.
fn mel_filterbank(
    n_fft: usize,
    n_mels: usize,
    sample_rate: u32,
    f_min: f64,
    f_max: f64,
    scale: MelScale,
) -> Vec<Vec<f64>> {
    let num_bins = n_fft / 2 + 1;
    let sr = sample_rate as f64;

    let (to_mel, to_hz): (fn(f64) -> f64, fn(f64) -> f64) = match scale {
        MelScale::Htk => (hz_to_mel_htk, mel_to_hz_htk),
        MelScale::Slaney => (hz_to_mel_slaney, mel_to_hz_slaney),
    };

    // Mel scale conversion points (n_mels + 2 edges).
    let mel_min = to_mel(f_min);
    let mel_max = to_mel(f_max);
    let hz_points: Vec<f64> = (0..=(n_mels + 1))
        .map(|i| to_hz(mel_min + (mel_max - mel_min) * i as f64 / (n_mels + 1) as f64))
        .collect();

    // FFT bin frequencies.
    let bin_freqs: Vec<f64> = (0..num_bins)
        .map(|i| sr * i as f64 / n_fft as f64)
        .collect();

    (0..n_mels)
        .map(|i| {
            let f_left = hz_points[i];
            let f_center = hz_points[i + 1];
            let f_right = hz_points[i + 2];
            let norm = match scale {
                MelScale::Htk => 1.0,
                MelScale::Slaney => 2.0 / (f_right - f_left),
            };

            bin_freqs
                .iter()
                .map(|&f| {
                    if f < f_left || f > f_right {
                        0.0
                    } else if f <= f_center {
                        norm * (f - f_left) / (f_center - f_left)
                    } else {
                        norm * (f_right - f) / (f_right - f_center)
                    }
                })
                .collect()
        })
        .collect()
}

fn hz_to_mel_htk(hz: f64) -> f64 {
    2595.0 * (1.0 + hz / 700.0).log10()
}

fn mel_to_hz_htk(mel: f64) -> f64 {
    700.0 * (10f64.powf(mel / 2595.0) - 1.0)
}

/// Convert frequency in Hz to Slaney mel scale.
///
/// Below 1000 Hz: linear mapping (mel = 3 * f / 200).
/// Above 1000 Hz: logarithmic (mel = 15 + 27 * ln(f / 1000) / ln(6.4)).
fn hz_to_mel_slaney(hz: f64) -> f64 {
    if hz < 1000.0 {
        3.0 * hz / 200.0
    } else {
        15.0 + 27.0 * (hz / 1000.0).ln() / (6.4_f64).ln()
    }
}

fn mel_to_hz_slaney(mel: f64) -> f64 {
    if mel < 15.0 {
        200.0 * mel / 3.0
    } else {
        1000.0 * ((mel - 15.0) * (6.4_f64).ln() / 27.0).exp()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_bank() -> MelFilterbank {
        MelFilterbank::new(800, 64, 8000, 0.0, 3500.0, MelScale::Htk)
    }

    #[test]
    fn mel_conversion_roundtrip() {
        for &freq in &[40.0, 100.0, 440.0, 1000.0, 4000.0, 10000.0] {
            let htk = mel_to_hz_htk(hz_to_mel_htk(freq));
            let slaney = mel_to_hz_slaney(hz_to_mel_slaney(freq));
            assert!((freq - htk).abs() < 0.01, "htk roundtrip failed for {freq} Hz");
            assert!((freq - slaney).abs() < 0.01, "slaney roundtrip failed for {freq} Hz");
        }
    }

    #[test]
    fn htk_1000hz_is_1000_mel() {
        assert!((hz_to_mel_htk(1000.0) - 1000.0).abs() < 0.1);
    }

    #[test]
    fn filterbank_shape() {
        let fb = mel_filterbank(2048, 128, 44100, 0.0, 10000.0, MelScale::Htk);
        assert_eq!(fb.len(), 128);
        assert_eq!(fb[0].len(), 1025);
    }

    #[test]
    fn every_filter_touches_a_bin() {
        let bank = MelFilterbank::new(17640, 512, 44100, 0.0, 10000.0, MelScale::Htk);
        assert_eq!(bank.num_mels(), 512);
        assert_eq!(bank.num_bins(), 8821);
        assert!(bank.row_sums.iter().all(|&s| s > 0.0));
    }

    #[test]
    fn bins_outside_range_are_dropped() {
        let bank = small_bank();
        // 3.9 kHz sits above max_frequency: no mel row responds.
        let mut linear = vec![0.0f32; bank.num_bins()];
        linear[390] = 1.0;
        assert!(bank.apply(&linear).iter().all(|&m| m == 0.0));
    }

    #[test]
    fn apply_matches_dense() {
        let dense = mel_filterbank(800, 64, 8000, 0.0, 3500.0, MelScale::Htk);
        let bank = small_bank();
        let linear: Vec<f32> = (0..401).map(|i| (i % 7) as f32).collect();
        let sparse = bank.apply(&linear);
        for (row, &value) in dense.iter().zip(&sparse) {
            let expected: f64 = row.iter().zip(&linear).map(|(w, x)| w * *x as f64).sum();
            assert!((expected as f32 - value).abs() < 1e-3);
        }
    }

    #[test]
    fn invert_is_nonnegative_and_consistent() {
        let bank = small_bank();
        let linear: Vec<f32> = (0..401)
            .map(|i| if i < 350 { 1.0 + (i as f32 / 40.0).sin() } else { 0.0 })
            .collect();
        let mel = bank.apply(&linear);
        let recovered = bank.invert(&mel, 200);

        assert!(recovered.iter().all(|&x| x >= 0.0));
        let reprojected = bank.apply(&recovered);
        let err: f32 = mel.iter().zip(&reprojected).map(|(a, b)| (a - b).abs()).sum();
        let total: f32 = mel.iter().sum();
        assert!(err / total < 0.05, "relative mel error {}", err / total);
    }

    #[test]
    fn invert_silence_is_silence() {
        let bank = small_bank();
        let recovered = bank.invert(&vec![0.0; 64], 50);
        assert!(recovered.iter().all(|&x| x == 0.0));
    }
}
