// Spectral feature extraction
// Hann-windowed STFT -> power -> mel projection -> per-frame relative dB

use rayon::prelude::*;
use realfft::{RealFftPlanner, RealToComplex};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

use super::buffer::SampleBuffer;
use super::mel::MelFilterBank;

/// Added to mel energies before the dB ratio so silent bands stay finite
pub const DB_EPSILON: f64 = 1e-10;

#[derive(Debug, Error)]
pub enum FeatureError {
    #[error("Invalid feature configuration: {0}")]
    InvalidConfig(String),

    #[error("Sample rate mismatch: featurizer expects {expected} Hz, buffer is {actual} Hz")]
    SampleRateMismatch { expected: u32, actual: u32 },

    #[error("FFT failed: {0}")]
    Fft(String),
}

/// STFT and mel parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    /// FFT window size in samples (power of 2)
    pub fft_size: usize,

    /// Advance between frames in samples
    pub hop_size: usize,

    /// Number of mel bands per frame
    pub n_mels: usize,

    /// Lowest filter edge in Hz
    pub fmin: f32,

    /// Highest filter edge in Hz; `None` means Nyquist
    pub fmax: Option<f32>,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        FeatureConfig {
            fft_size: 2048,
            hop_size: 512,
            n_mels: 229,
            fmin: 30.0,
            fmax: None,
        }
    }
}

impl FeatureConfig {
    /// Upper filter edge for a given sample rate
    pub fn resolved_fmax(&self, sample_rate: u32) -> f32 {
        self.fmax.unwrap_or(sample_rate as f32 / 2.0)
    }

    pub fn validate(&self, sample_rate: u32) -> Result<(), FeatureError> {
        if sample_rate == 0 {
            return Err(FeatureError::InvalidConfig("sample rate must be non-zero".into()));
        }
        if self.fft_size == 0 || !self.fft_size.is_power_of_two() {
            return Err(FeatureError::InvalidConfig(format!(
                "fft_size {} must be a non-zero power of two",
                self.fft_size
            )));
        }
        if self.hop_size == 0 {
            return Err(FeatureError::InvalidConfig("hop_size must be non-zero".into()));
        }
        if self.n_mels == 0 {
            return Err(FeatureError::InvalidConfig("n_mels must be non-zero".into()));
        }

        let nyquist = sample_rate as f32 / 2.0;
        let fmax = self.resolved_fmax(sample_rate);
        if fmax > nyquist {
            return Err(FeatureError::InvalidConfig(format!(
                "fmax {} Hz exceeds Nyquist {} Hz",
                fmax, nyquist
            )));
        }
        if !(self.fmin >= 0.0 && self.fmin < fmax) {
            return Err(FeatureError::InvalidConfig(format!(
                "fmin {} Hz must be non-negative and below fmax {} Hz",
                self.fmin, fmax
            )));
        }
        Ok(())
    }

    /// Frames produced for `sample_count` samples (short inputs count as one padded frame)
    pub fn frame_count(&self, sample_count: usize) -> usize {
        sample_count.saturating_sub(self.fft_size) / self.hop_size + 1
    }
}

/// Time x mel-band matrix of frame-relative dB values
#[derive(Debug, Clone, PartialEq)]
pub struct Spectrogram {
    frames: Vec<Vec<f32>>,
    n_mels: usize,
    hop_size: usize,
    fft_size: usize,
    sample_rate: u32,
    band_centers_hz: Vec<f64>,
}

impl Spectrogram {
    /// Build from precomputed frames. All frames must have `band_centers_hz.len()` values.
    pub fn from_frames(
        frames: Vec<Vec<f32>>,
        band_centers_hz: Vec<f64>,
        hop_size: usize,
        fft_size: usize,
        sample_rate: u32,
    ) -> Result<Self, FeatureError> {
        let n_mels = band_centers_hz.len();
        if n_mels == 0 || hop_size == 0 || sample_rate == 0 {
            return Err(FeatureError::InvalidConfig(
                "spectrogram needs bands, a hop size and a sample rate".into(),
            ));
        }
        if let Some(bad) = frames.iter().position(|f| f.len() != n_mels) {
            return Err(FeatureError::InvalidConfig(format!(
                "frame {} has {} bands, expected {}",
                bad,
                frames[bad].len(),
                n_mels
            )));
        }
        Ok(Spectrogram {
            frames,
            n_mels,
            hop_size,
            fft_size,
            sample_rate,
            band_centers_hz,
        })
    }

    pub fn frames(&self) -> &[Vec<f32>] {
        &self.frames
    }

    pub fn frame(&self, index: usize) -> Option<&[f32]> {
        self.frames.get(index).map(Vec::as_slice)
    }

    pub fn num_frames(&self) -> usize {
        self.frames.len()
    }

    pub fn n_mels(&self) -> usize {
        self.n_mels
    }

    pub fn hop_size(&self) -> usize {
        self.hop_size
    }

    pub fn fft_size(&self) -> usize {
        self.fft_size
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Center frequency in Hz of each band
    pub fn band_centers_hz(&self) -> &[f64] {
        &self.band_centers_hz
    }

    /// Start time of frame `index` in seconds
    pub fn frame_time_secs(&self, index: usize) -> f64 {
        (index * self.hop_size) as f64 / f64::from(self.sample_rate)
    }

    /// Row-major copy of all values, `num_frames * n_mels` long
    pub fn flatten(&self) -> Vec<f32> {
        self.frames.iter().flatten().copied().collect()
    }
}

/// Converts sample buffers into mel spectrograms.
///
/// The FFT plan, window and filter bank are built once and reused for every
/// buffer at the configured sample rate.
pub struct SpectralFeaturizer {
    config: FeatureConfig,
    sample_rate: u32,
    filter_bank: MelFilterBank,
    window: Vec<f32>,
    fft: Arc<dyn RealToComplex<f32>>,
}

impl SpectralFeaturizer {
    pub fn new(config: FeatureConfig, sample_rate: u32) -> Result<Self, FeatureError> {
        config.validate(sample_rate)?;

        let filter_bank = MelFilterBank::new(
            sample_rate,
            config.fft_size,
            config.n_mels,
            f64::from(config.fmin),
            f64::from(config.resolved_fmax(sample_rate)),
        )?;

        let mut planner = RealFftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(config.fft_size);

        Ok(SpectralFeaturizer {
            window: hann_window(config.fft_size),
            config,
            sample_rate,
            filter_bank,
            fft,
        })
    }

    pub fn config(&self) -> &FeatureConfig {
        &self.config
    }

    pub fn filter_bank(&self) -> &MelFilterBank {
        &self.filter_bank
    }

    /// Compute the spectrogram of `buffer`. Frames are analysed in parallel; order is kept.
    pub fn compute(&self, buffer: &SampleBuffer) -> Result<Spectrogram, FeatureError> {
        if buffer.sample_rate() != self.sample_rate {
            return Err(FeatureError::SampleRateMismatch {
                expected: self.sample_rate,
                actual: buffer.sample_rate(),
            });
        }

        let fft_size = self.config.fft_size;
        let hop_size = self.config.hop_size;

        // Zero-pad short input to a single frame
        let padded;
        let samples = if buffer.len() < fft_size {
            let mut data = buffer.samples().to_vec();
            data.resize(fft_size, 0.0);
            padded = data;
            padded.as_slice()
        } else {
            buffer.samples()
        };

        let num_frames = self.config.frame_count(samples.len());

        let frames = (0..num_frames)
            .into_par_iter()
            .map_init(
                || {
                    (
                        self.fft.make_input_vec(),
                        self.fft.make_output_vec(),
                        self.fft.make_scratch_vec(),
                    )
                },
                |(input, spectrum, scratch), t| {
                    let start = t * hop_size;
                    let frame = &samples[start..start + fft_size];
                    for ((dst, &s), &w) in input.iter_mut().zip(frame).zip(&self.window) {
                        *dst = s * w;
                    }

                    self.fft
                        .process_with_scratch(input, spectrum, scratch)
                        .map_err(|e| FeatureError::Fft(e.to_string()))?;

                    let power: Vec<f32> = spectrum.iter().map(|c| c.norm_sqr()).collect();
                    Ok(relative_db(&self.filter_bank.apply(&power)))
                },
            )
            .collect::<Result<Vec<_>, FeatureError>>()?;

        log::debug!(
            "Computed {} frames x {} mel bands ({} samples, fft {}, hop {})",
            frames.len(),
            self.config.n_mels,
            buffer.len(),
            fft_size,
            hop_size
        );

        Spectrogram::from_frames(
            frames,
            self.filter_bank.centers_hz().to_vec(),
            hop_size,
            fft_size,
            self.sample_rate,
        )
    }
}

/// Periodic Hann window
fn hann_window(n: usize) -> Vec<f32> {
    (0..n)
        .map(|i| 0.5 * (1.0 - (2.0 * std::f32::consts::PI * i as f32 / n as f32).cos()))
        .collect()
}

/// dB relative to the loudest band of the frame; the loudest band is exactly 0
fn relative_db(mel_energies: &[f64]) -> Vec<f32> {
    let max = mel_energies.iter().copied().fold(0.0f64, f64::max);
    mel_energies
        .iter()
        .map(|&e| (10.0 * ((e + DB_EPSILON) / (max + DB_EPSILON)).log10()) as f32)
        .collect()
}
