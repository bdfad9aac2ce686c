// Event detector backend abstraction
// One detector per pipeline run: a loaded model or the heuristic fallback

use serde::Serialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::audio::Spectrogram;
use crate::events::heuristic::HeuristicOnsetStrategy;
use crate::events::model::ModelInferenceStrategy;
use crate::events::types::EventMap;

/// Recoverable detector failures. The pipeline answers all of them by falling
/// back to the heuristic detector.
#[derive(Debug, Clone, Error)]
pub enum DetectorError {
    #[error("Model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("Model inference timed out after {0:?}")]
    InferenceTimeout(Duration),

    #[error("Malformed model output: {0}")]
    MalformedOutput(String),
}

/// Which detector produced an event map
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorKind {
    Model,
    Heuristic,
}

impl fmt::Display for DetectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DetectorKind::Model => f.write_str("model"),
            DetectorKind::Heuristic => f.write_str("heuristic"),
        }
    }
}

/// Detection strategy, chosen once per run
#[derive(Clone)]
pub enum EventDetector {
    Model(ModelInferenceStrategy),
    Heuristic(HeuristicOnsetStrategy),
}

impl EventDetector {
    pub fn kind(&self) -> DetectorKind {
        match self {
            EventDetector::Model(_) => DetectorKind::Model,
            EventDetector::Heuristic(_) => DetectorKind::Heuristic,
        }
    }

    /// Convert a spectrogram into drum events. The heuristic variant never fails.
    pub async fn detect(&self, spectrogram: &Spectrogram) -> Result<EventMap, DetectorError> {
        match self {
            EventDetector::Model(strategy) => strategy.detect(spectrogram).await,
            EventDetector::Heuristic(strategy) => Ok(strategy.detect(spectrogram)),
        }
    }
}

impl Default for EventDetector {
    fn default() -> Self {
        EventDetector::Heuristic(HeuristicOnsetStrategy::default())
    }
}
