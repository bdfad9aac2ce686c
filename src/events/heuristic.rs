// Heuristic onset detection and drum classification
// Spectral flux onsets, then a fixed decision tree over per-frame spectral shape

use serde::{Deserialize, Serialize};

use crate::audio::Spectrogram;
use crate::events::types::{DrumClass, EventMap};

// Decision constants. Empirical, with no documented derivation.
// TODO: calibrate against a labelled drum set before changing any of them.
pub const KICK_MAX_CENTROID_HZ: f64 = 150.0;
pub const SNARE_MAX_CENTROID_HZ: f64 = 350.0;
pub const SNARE_MIN_ZCR: f64 = 0.1;
pub const HIGH_FREQ_CUTOFF_HZ: f64 = 3000.0;
pub const HIGH_FREQ_MIN_ENERGY: f64 = 0.5;
pub const CRASH_MIN_CENTROID_HZ: f64 = 3000.0;
pub const CRASH_MIN_ZCR: f64 = 0.2;
pub const TOM_MAX_CENTROID_HZ: f64 = 1000.0;
pub const TOM_LOW_MAX_CENTROID_HZ: f64 = 500.0;
pub const TOM_MID_MAX_CENTROID_HZ: f64 = 750.0;
pub const FLUX_STD_FACTOR: f64 = 0.5;

pub const KICK_VELOCITY: u8 = 90;
pub const SNARE_VELOCITY: u8 = 80;
pub const CYMBAL_VELOCITY: u8 = 70;
pub const TOM_VELOCITY: u8 = 70;
pub const DEFAULT_VELOCITY: u8 = 64;

/// Tunable thresholds for the onset picker and the classifier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeuristicThresholds {
    /// Onset threshold = mean(flux) + factor * std(flux)
    pub flux_std_factor: f64,

    pub kick_max_centroid_hz: f64,
    pub snare_max_centroid_hz: f64,
    pub snare_min_zcr: f64,

    /// Bands centred above this count toward high-frequency energy
    pub high_freq_cutoff_hz: f64,
    pub high_freq_min_energy: f64,
    pub crash_min_centroid_hz: f64,
    pub crash_min_zcr: f64,

    pub tom_max_centroid_hz: f64,
    pub tom_low_max_centroid_hz: f64,
    pub tom_mid_max_centroid_hz: f64,

    pub kick_velocity: u8,
    pub snare_velocity: u8,
    pub cymbal_velocity: u8,
    pub tom_velocity: u8,
    pub default_velocity: u8,
}

impl Default for HeuristicThresholds {
    fn default() -> Self {
        HeuristicThresholds {
            flux_std_factor: FLUX_STD_FACTOR,
            kick_max_centroid_hz: KICK_MAX_CENTROID_HZ,
            snare_max_centroid_hz: SNARE_MAX_CENTROID_HZ,
            snare_min_zcr: SNARE_MIN_ZCR,
            high_freq_cutoff_hz: HIGH_FREQ_CUTOFF_HZ,
            high_freq_min_energy: HIGH_FREQ_MIN_ENERGY,
            crash_min_centroid_hz: CRASH_MIN_CENTROID_HZ,
            crash_min_zcr: CRASH_MIN_ZCR,
            tom_max_centroid_hz: TOM_MAX_CENTROID_HZ,
            tom_low_max_centroid_hz: TOM_LOW_MAX_CENTROID_HZ,
            tom_mid_max_centroid_hz: TOM_MID_MAX_CENTROID_HZ,
            kick_velocity: KICK_VELOCITY,
            snare_velocity: SNARE_VELOCITY,
            cymbal_velocity: CYMBAL_VELOCITY,
            tom_velocity: TOM_VELOCITY,
            default_velocity: DEFAULT_VELOCITY,
        }
    }
}

/// Spectral shape of one frame, as seen by the classifier
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameFeatures {
    /// Energy-weighted mean band frequency in Hz
    pub centroid_hz: f64,

    /// Fraction of slope sign changes across adjacent bands
    pub zcr: f64,

    /// Linear energy in bands centred above the high-frequency cutoff
    pub high_freq_energy: f64,
}

/// Spectral flux: summed positive band increases from the previous frame. Frame 0 is 0.
pub fn onset_envelope(spectrogram: &Spectrogram) -> Vec<f64> {
    let frames = spectrogram.frames();
    let mut flux = Vec::with_capacity(frames.len());

    if !frames.is_empty() {
        flux.push(0.0);
    }
    for pair in frames.windows(2) {
        let rise: f64 = pair[1]
            .iter()
            .zip(&pair[0])
            .map(|(&cur, &prev)| f64::from((cur - prev).max(0.0)))
            .sum();
        flux.push(rise);
    }

    flux
}

/// Frames whose flux beats `mean + std_factor * std` and both neighbours.
///
/// A flat envelope (zero deviation) has no onsets.
pub fn pick_onsets(flux: &[f64], std_factor: f64) -> Vec<usize> {
    if flux.len() < 3 {
        return Vec::new();
    }

    let n = flux.len() as f64;
    let mean = flux.iter().sum::<f64>() / n;
    let variance = flux.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
    let std = variance.sqrt();
    if std == 0.0 {
        return Vec::new();
    }

    let threshold = mean + std_factor * std;

    (1..flux.len() - 1)
        .filter(|&t| flux[t] > threshold && flux[t] > flux[t - 1] && flux[t] > flux[t + 1])
        .collect()
}

/// Centroid, zero-crossing proxy and high-frequency energy of a dB frame
pub fn frame_features(frame: &[f32], band_centers_hz: &[f64], high_freq_cutoff_hz: f64) -> FrameFeatures {
    // Back to linear energy relative to the frame maximum
    let energy: Vec<f64> = frame.iter().map(|&v| 10f64.powf(f64::from(v) / 10.0)).collect();

    let mut total = 0.0;
    let mut weighted = 0.0;
    let mut high_freq_energy = 0.0;
    for (&e, &f) in energy.iter().zip(band_centers_hz) {
        if e > 0.0 {
            total += e;
            weighted += e * f;
            if f > high_freq_cutoff_hz {
                high_freq_energy += e;
            }
        }
    }
    let centroid_hz = if total > 0.0 { weighted / total } else { 0.0 };

    let zcr = if frame.len() > 2 {
        let slopes: Vec<f32> = frame.windows(2).map(|w| w[1] - w[0]).collect();
        let changes = slopes.windows(2).filter(|s| s[0] * s[1] < 0.0).count();
        changes as f64 / (frame.len() - 2) as f64
    } else {
        0.0
    };

    FrameFeatures {
        centroid_hz,
        zcr,
        high_freq_energy,
    }
}

/// Rule-based onset detector and classifier over a mel spectrogram
#[derive(Debug, Clone, Default)]
pub struct HeuristicOnsetStrategy {
    thresholds: HeuristicThresholds,
}

impl HeuristicOnsetStrategy {
    pub fn new(thresholds: HeuristicThresholds) -> Self {
        HeuristicOnsetStrategy { thresholds }
    }

    pub fn thresholds(&self) -> &HeuristicThresholds {
        &self.thresholds
    }

    /// Decision tree, first match wins
    pub fn classify(&self, features: &FrameFeatures) -> (DrumClass, u8) {
        let t = &self.thresholds;
        let FrameFeatures {
            centroid_hz,
            zcr,
            high_freq_energy,
        } = *features;

        if centroid_hz < t.kick_max_centroid_hz {
            (DrumClass::Kick, t.kick_velocity)
        } else if centroid_hz < t.snare_max_centroid_hz && zcr > t.snare_min_zcr {
            (DrumClass::Snare, t.snare_velocity)
        } else if high_freq_energy > t.high_freq_min_energy {
            if centroid_hz > t.crash_min_centroid_hz && zcr > t.crash_min_zcr {
                (DrumClass::Crash, t.cymbal_velocity)
            } else {
                (DrumClass::HiHatClosed, t.cymbal_velocity)
            }
        } else if centroid_hz < t.tom_max_centroid_hz {
            let class = if centroid_hz < t.tom_low_max_centroid_hz {
                DrumClass::TomLow
            } else if centroid_hz < t.tom_mid_max_centroid_hz {
                DrumClass::TomMid
            } else {
                DrumClass::TomHigh
            };
            (class, t.tom_velocity)
        } else {
            (DrumClass::HiHatClosed, t.default_velocity)
        }
    }

    /// Onset frame indices for a spectrogram
    pub fn detect_onsets(&self, spectrogram: &Spectrogram) -> Vec<usize> {
        pick_onsets(&onset_envelope(spectrogram), self.thresholds.flux_std_factor)
    }

    /// Detect and classify onsets. Pure and deterministic; cannot fail.
    pub fn detect(&self, spectrogram: &Spectrogram) -> EventMap {
        let mut events = EventMap::new();

        for t in self.detect_onsets(spectrogram) {
            let Some(frame) = spectrogram.frame(t) else {
                continue;
            };
            let features = frame_features(
                frame,
                spectrogram.band_centers_hz(),
                self.thresholds.high_freq_cutoff_hz,
            );
            let (class, velocity) = self.classify(&features);
            events.push(class, spectrogram.frame_time_secs(t), velocity);
        }

        log::debug!(
            "Heuristic detector found {} onsets in {} frames",
            events.total(),
            spectrogram.num_frames()
        );

        events
    }
}
