// Model-based drum detection
// Runs a pretrained onset/velocity model and maps its key activations to drum classes

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::audio::Spectrogram;
use crate::events::backend::DetectorError;
use crate::events::types::{DrumClass, EventMap};

/// Output tensor holding per-key onset probabilities
pub const ONSET_OUTPUT: &str = "onset_probs";
/// Output tensor holding per-key velocities in [0, 1]
pub const VELOCITY_OUTPUT: &str = "velocity_values";

/// Minimum onset probability for a peak
pub const ONSET_THRESHOLD: f32 = 0.3;

pub const DEFAULT_INFERENCE_TIMEOUT: Duration = Duration::from_secs(30);

/// Model key columns feeding each drum class. Contiguous, half-open, non-overlapping.
pub const KEY_RANGES: [(DrumClass, Range<usize>); 9] = [
    (DrumClass::Kick, 35..37),
    (DrumClass::Snare, 37..41),
    (DrumClass::HiHatClosed, 41..44),
    (DrumClass::HiHatOpen, 44..46),
    (DrumClass::Crash, 46..50),
    (DrumClass::Ride, 50..53),
    (DrumClass::TomLow, 53..55),
    (DrumClass::TomMid, 55..58),
    (DrumClass::TomHigh, 58..60),
];

/// Number of key columns a model output must have to cover every range
pub const REQUIRED_KEYS: usize = 60;

type CancelHook = Box<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct CancelState {
    cancelled: AtomicBool,
    hook: Mutex<Option<CancelHook>>,
}

/// Shared flag raised when the caller stops waiting for an inference.
///
/// A backend that cannot poll the flag mid-call registers a hook with
/// [`on_cancel`](Self::on_cancel) to abort its run instead.
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<CancelState>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.cancelled.store(true, Ordering::SeqCst);
        let hook = self.0.hook.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(hook) = hook.as_ref() {
            hook();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.cancelled.load(Ordering::SeqCst)
    }

    /// Run `hook` on cancellation, replacing any earlier hook. Runs it at once
    /// if the flag is already raised.
    pub fn on_cancel(&self, hook: impl Fn() + Send + Sync + 'static) {
        let mut slot = self.0.hook.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_cancelled() {
            hook();
        }
        *slot = Some(Box::new(hook));
    }

    /// Drop the registered hook once the guarded call has returned
    pub fn clear_hook(&self) {
        let mut slot = self.0.hook.lock().unwrap_or_else(PoisonError::into_inner);
        *slot = None;
    }
}

impl fmt::Debug for CancelFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelFlag")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Model input tensor `[1, frames, n_mels, 1]`, row-major
#[derive(Debug, Clone, PartialEq)]
pub struct ModelInput {
    data: Vec<f32>,
    frames: usize,
    n_mels: usize,
}

impl ModelInput {
    pub fn from_spectrogram(spectrogram: &Spectrogram) -> Self {
        ModelInput {
            data: spectrogram.flatten(),
            frames: spectrogram.num_frames(),
            n_mels: spectrogram.n_mels(),
        }
    }

    pub fn shape(&self) -> [usize; 4] {
        [1, self.frames, self.n_mels, 1]
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn n_mels(&self) -> usize {
        self.n_mels
    }
}

/// A `[frames, keys]` activation matrix
#[derive(Debug, Clone, PartialEq)]
pub struct ActivationCurves {
    frames: usize,
    keys: usize,
    values: Vec<f32>,
}

impl ActivationCurves {
    pub fn new(frames: usize, keys: usize, values: Vec<f32>) -> Result<Self, DetectorError> {
        let expected = frames.checked_mul(keys).ok_or_else(|| {
            DetectorError::MalformedOutput(format!("{} x {} values overflows", frames, keys))
        })?;
        if values.len() != expected {
            return Err(DetectorError::MalformedOutput(format!(
                "expected {} x {} values, got {}",
                frames,
                keys,
                values.len()
            )));
        }
        Ok(ActivationCurves {
            frames,
            keys,
            values,
        })
    }

    /// Accept `[1, frames, keys]` or `[frames, keys]`
    pub fn from_tensor(shape: &[usize], values: Vec<f32>) -> Result<Self, DetectorError> {
        match shape {
            [1, frames, keys] | [frames, keys] => Self::new(*frames, *keys, values),
            other => Err(DetectorError::MalformedOutput(format!(
                "unexpected output shape {:?}",
                other
            ))),
        }
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn keys(&self) -> usize {
        self.keys
    }

    pub fn get(&self, frame: usize, key: usize) -> f32 {
        self.values[frame * self.keys + key]
    }

    /// (frame, key) of the first NaN or infinite value
    pub fn first_non_finite(&self) -> Option<(usize, usize)> {
        self.values
            .iter()
            .position(|v| !v.is_finite())
            .map(|i| (i / self.keys, i % self.keys))
    }

    /// Activation of one key over time
    pub fn key_curve(&self, key: usize) -> Vec<f32> {
        (0..self.frames).map(|t| self.get(t, key)).collect()
    }
}

/// Aligned onset and velocity activations
#[derive(Debug, Clone, PartialEq)]
pub struct ModelOutput {
    pub onset_probs: ActivationCurves,
    pub velocities: ActivationCurves,
}

impl ModelOutput {
    /// Check both curves cover `frames` frames and every mapped key, with finite values
    pub fn validate(&self, frames: usize) -> Result<(), DetectorError> {
        for (name, curves) in [
            (ONSET_OUTPUT, &self.onset_probs),
            (VELOCITY_OUTPUT, &self.velocities),
        ] {
            if curves.frames() != frames {
                return Err(DetectorError::MalformedOutput(format!(
                    "{} has {} frames, input had {}",
                    name,
                    curves.frames(),
                    frames
                )));
            }
            if curves.keys() < REQUIRED_KEYS {
                return Err(DetectorError::MalformedOutput(format!(
                    "{} has {} keys, need at least {}",
                    name,
                    curves.keys(),
                    REQUIRED_KEYS
                )));
            }
            if let Some((frame, key)) = curves.first_non_finite() {
                return Err(DetectorError::MalformedOutput(format!(
                    "{} has a non-finite value at frame {}, key {}",
                    name, frame, key
                )));
            }
        }
        Ok(())
    }
}

/// A loaded inference model. Implementations run on a blocking thread and
/// should return early once `cancel` is raised.
pub trait DrumModel: Send + Sync {
    fn infer(&self, input: &ModelInput, cancel: &CancelFlag) -> Result<ModelOutput, DetectorError>;
}

/// Frames above `threshold` that beat both neighbours. Edge frames never qualify.
pub fn pick_probability_peaks(curve: &[f32], threshold: f32) -> Vec<usize> {
    if curve.len() < 3 {
        return Vec::new();
    }
    (1..curve.len() - 1)
        .filter(|&t| curve[t] > threshold && curve[t] > curve[t - 1] && curve[t] > curve[t + 1])
        .collect()
}

/// Scale a [0, 1] model velocity to MIDI 1..=127. NaN maps to 1.
pub fn scale_velocity(value: f32) -> u8 {
    if value.is_nan() {
        return 1;
    }
    (value * 127.0).round().clamp(1.0, 127.0) as u8
}

/// Turn model output into drum events.
///
/// Keys of the same class peaking on the same frame merge into one event
/// carrying the highest velocity.
pub fn events_from_output(
    output: &ModelOutput,
    hop_size: usize,
    sample_rate: u32,
    threshold: f32,
) -> Result<EventMap, DetectorError> {
    output.validate(output.onset_probs.frames())?;
    let mut events = EventMap::new();

    for (class, keys) in KEY_RANGES.iter() {
        let mut peaks: BTreeMap<usize, u8> = BTreeMap::new();
        for key in keys.clone() {
            for frame in pick_probability_peaks(&output.onset_probs.key_curve(key), threshold) {
                let velocity = scale_velocity(output.velocities.get(frame, key));
                let slot = peaks.entry(frame).or_insert(velocity);
                *slot = (*slot).max(velocity);
            }
        }

        for (frame, velocity) in peaks {
            let time_secs = (frame * hop_size) as f64 / f64::from(sample_rate);
            events.push(*class, time_secs, velocity);
        }
    }

    Ok(events)
}

/// Detects drums with a loaded model under a wall-clock budget
#[derive(Clone)]
pub struct ModelInferenceStrategy {
    model: Arc<dyn DrumModel>,
    timeout: Duration,
    threshold: f32,
}

impl ModelInferenceStrategy {
    pub fn new(model: Arc<dyn DrumModel>) -> Self {
        ModelInferenceStrategy {
            model,
            timeout: DEFAULT_INFERENCE_TIMEOUT,
            threshold: ONSET_THRESHOLD,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run inference on a blocking thread. On timeout the cancel flag is raised
    /// and the pending result is dropped; no partial events are returned.
    pub async fn detect(&self, spectrogram: &Spectrogram) -> Result<EventMap, DetectorError> {
        let input = ModelInput::from_spectrogram(spectrogram);
        let frames = input.frames();
        let model = Arc::clone(&self.model);
        let cancel = CancelFlag::new();
        let worker_cancel = cancel.clone();

        // The input buffer moves into the task and is dropped there on every path
        let task = tokio::task::spawn_blocking(move || model.infer(&input, &worker_cancel));

        let output = match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(result)) => result?,
            Ok(Err(e)) => {
                return Err(DetectorError::ModelUnavailable(format!(
                    "inference task failed: {e}"
                )))
            }
            Err(_) => {
                cancel.cancel();
                log::warn!("Model inference exceeded {:?}, cancelling", self.timeout);
                return Err(DetectorError::InferenceTimeout(self.timeout));
            }
        };

        output.validate(frames)?;

        let events = events_from_output(
            &output,
            spectrogram.hop_size(),
            spectrogram.sample_rate(),
            self.threshold,
        )?;
        log::debug!("Model detector found {} events", events.total());
        Ok(events)
    }
}
