// Transcriber configuration
// JSON-loadable settings for every pipeline stage, with defaults and validation

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::audio::FeatureConfig;
use crate::events::HeuristicThresholds;
use crate::midi::EncodeOptions;

/// Default rate the decoder resamples to
pub const DEFAULT_SAMPLE_RATE: u32 = 16_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    ParseError(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscriberConfig {
    /// Rate the decoder resamples to, in Hz
    pub sample_rate: u32,

    pub features: FeatureConfig,

    /// Model URL or local path; `None` runs the heuristic detector only
    pub model: Option<String>,

    /// Wall-clock budget for one model inference
    pub inference_timeout_ms: u64,

    /// Substitute a synthetic click train when decoding fails
    pub synthesize_on_decode_failure: bool,

    pub note_duration_secs: f64,
    pub ticks_per_quarter: u16,
    pub tempo_bpm: f64,

    pub heuristic: HeuristicThresholds,
}

impl Default for TranscriberConfig {
    fn default() -> Self {
        let encode = EncodeOptions::default();
        TranscriberConfig {
            sample_rate: DEFAULT_SAMPLE_RATE,
            features: FeatureConfig::default(),
            model: None,
            inference_timeout_ms: 30_000,
            synthesize_on_decode_failure: true,
            note_duration_secs: encode.note_duration_secs,
            ticks_per_quarter: encode.ticks_per_quarter,
            tempo_bpm: encode.tempo_bpm,
            heuristic: HeuristicThresholds::default(),
        }
    }
}

impl TranscriberConfig {
    /// Load from a JSON file; missing fields take their defaults
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: TranscriberConfig = serde_json::from_str(&contents)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.features
            .validate(self.sample_rate)
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        self.encode_options()
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        if self.inference_timeout_ms == 0 {
            return Err(ConfigError::Invalid("inference_timeout_ms must be non-zero".into()));
        }
        if let Some(model) = &self.model {
            if model.trim().is_empty() {
                return Err(ConfigError::Invalid("model source is empty".into()));
            }
        }
        Ok(())
    }

    pub fn inference_timeout(&self) -> Duration {
        Duration::from_millis(self.inference_timeout_ms)
    }

    pub fn encode_options(&self) -> EncodeOptions {
        EncodeOptions {
            ticks_per_quarter: self.ticks_per_quarter,
            tempo_bpm: self.tempo_bpm,
            note_duration_secs: self.note_duration_secs,
            ..EncodeOptions::default()
        }
    }
}
