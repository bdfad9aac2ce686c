// Mel filter bank
// Triangular filters spaced linearly in mel between fmin and fmax (HTK mel scale)

use super::spectrogram::FeatureError;

/// Convert Hz to mel (HTK formula)
pub fn hz_to_mel(hz: f64) -> f64 {
    2595.0 * (1.0 + hz / 700.0).log10()
}

/// Convert mel to Hz (HTK formula)
pub fn mel_to_hz(mel: f64) -> f64 {
    700.0 * (10f64.powf(mel / 2595.0) - 1.0)
}

/// One triangular filter, stored as its non-zero span of FFT bins
#[derive(Debug, Clone, PartialEq)]
struct MelFilter {
    start_bin: usize,
    weights: Vec<f64>,
}

/// `n_mels x (fft_size / 2 + 1)` weight matrix, held sparsely.
///
/// A pure function of its parameters; two banks built from the same
/// parameters are equal.
#[derive(Debug, Clone, PartialEq)]
pub struct MelFilterBank {
    sample_rate: u32,
    fft_size: usize,
    filters: Vec<MelFilter>,
    centers_hz: Vec<f64>,
}

impl MelFilterBank {
    pub fn new(
        sample_rate: u32,
        fft_size: usize,
        n_mels: usize,
        fmin: f64,
        fmax: f64,
    ) -> Result<Self, FeatureError> {
        if sample_rate == 0 || fft_size == 0 || n_mels == 0 {
            return Err(FeatureError::InvalidConfig(format!(
                "filter bank needs non-zero sizes (sample_rate {}, fft_size {}, n_mels {})",
                sample_rate, fft_size, n_mels
            )));
        }
        if !(fmin >= 0.0 && fmin < fmax) {
            return Err(FeatureError::InvalidConfig(format!(
                "fmin {} must be non-negative and below fmax {}",
                fmin, fmax
            )));
        }

        // n_mels + 2 edges: filter m spans points m, m+1, m+2
        let mel_min = hz_to_mel(fmin);
        let mel_max = hz_to_mel(fmax);
        let step = (mel_max - mel_min) / (n_mels + 1) as f64;
        let points: Vec<f64> = (0..n_mels + 2)
            .map(|i| mel_to_hz(mel_min + step * i as f64))
            .collect();

        let n_bins = fft_size / 2 + 1;
        let bin_hz = f64::from(sample_rate) / fft_size as f64;

        let filters = points
            .windows(3)
            .map(|edges| {
                let (left, center, right) = (edges[0], edges[1], edges[2]);
                let mut start_bin = None;
                let mut weights = Vec::new();

                for k in 0..n_bins {
                    let f = k as f64 * bin_hz;
                    let w = if f > left && f <= center {
                        (f - left) / (center - left)
                    } else if f > center && f < right {
                        (right - f) / (right - center)
                    } else {
                        0.0
                    };

                    if w > 0.0 {
                        let start = *start_bin.get_or_insert(k);
                        // Triangles are convex, so the non-zero span is contiguous
                        weights.resize(k - start, 0.0);
                        weights.push(w);
                    }
                }

                MelFilter {
                    start_bin: start_bin.unwrap_or(0),
                    weights,
                }
            })
            .collect();

        let centers_hz = points[1..=n_mels].to_vec();

        Ok(MelFilterBank {
            sample_rate,
            fft_size,
            filters,
            centers_hz,
        })
    }

    pub fn n_mels(&self) -> usize {
        self.filters.len()
    }

    pub fn n_bins(&self) -> usize {
        self.fft_size / 2 + 1
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Center frequency in Hz of each filter
    pub fn centers_hz(&self) -> &[f64] {
        &self.centers_hz
    }

    /// Weight of FFT bin `bin` in filter `mel`
    pub fn weight(&self, mel: usize, bin: usize) -> f64 {
        self.filters
            .get(mel)
            .and_then(|filter| {
                bin.checked_sub(filter.start_bin)
                    .and_then(|offset| filter.weights.get(offset))
            })
            .copied()
            .unwrap_or(0.0)
    }

    /// Project a power spectrum (`n_bins` values) onto the filters
    pub fn apply(&self, power: &[f32]) -> Vec<f64> {
        self.filters
            .iter()
            .map(|filter| {
                power
                    .iter()
                    .skip(filter.start_bin)
                    .zip(&filter.weights)
                    .map(|(&p, &w)| f64::from(p) * w)
                    .sum()
            })
            .collect()
    }
}
