// Transcription pipeline
// decode -> featurize -> detect (model, else heuristic) -> encode, with fallback and tracing

use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::audio::{AudioDecoder, AudioError, DecodeStatus, FeatureError, SpectralFeaturizer, Spectrogram};
use crate::config::{ConfigError, TranscriberConfig};
use crate::events::{
    DetectorKind, EventDetector, EventMap, HeuristicOnsetStrategy, ModelCache,
    ModelInferenceStrategy, ModelSource,
};
use crate::midi::{EncodeError, EventEncoder};

use super::trace::{TraceEntry, TraceWriter};

/// States a run moves through. `Done` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Decoding,
    Featurizing,
    DetectingModel,
    DetectingHeuristic,
    Encoding,
    Done,
    Failed,
}

impl PipelineStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStage::Decoding => "decoding",
            PipelineStage::Featurizing => "featurizing",
            PipelineStage::DetectingModel => "detecting_model",
            PipelineStage::DetectingHeuristic => "detecting_heuristic",
            PipelineStage::Encoding => "encoding",
            PipelineStage::Done => "done",
            PipelineStage::Failed => "failed",
        }
    }

    /// Progress checkpoint reported on entering the stage
    pub fn progress(&self) -> f32 {
        match self {
            PipelineStage::Decoding => 0.1,
            PipelineStage::Featurizing => 0.4,
            PipelineStage::DetectingModel => 0.5,
            PipelineStage::DetectingHeuristic => 0.6,
            PipelineStage::Encoding => 0.8,
            PipelineStage::Done | PipelineStage::Failed => 1.0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineStage::Done | PipelineStage::Failed)
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fatal pipeline failures. Detector problems never show up here.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    #[error("Decoding failed: {0}")]
    Decode(#[from] AudioError),

    #[error("Feature extraction failed: {0}")]
    Featurize(#[from] FeatureError),

    #[error("Encoding failed: {0}")]
    Encode(#[from] EncodeError),

    #[error("{stage} task failed: {message}")]
    Task {
        stage: PipelineStage,
        message: String,
    },
}

impl PipelineError {
    /// Stage the run failed in; `None` for configuration errors raised before a run
    pub fn stage(&self) -> Option<PipelineStage> {
        match self {
            PipelineError::InvalidConfig(_) => None,
            PipelineError::Decode(_) => Some(PipelineStage::Decoding),
            PipelineError::Featurize(_) => Some(PipelineStage::Featurizing),
            PipelineError::Encode(_) => Some(PipelineStage::Encoding),
            PipelineError::Task { stage, .. } => Some(*stage),
        }
    }
}

/// Result of one run: the MIDI bytes plus what happened along the way
#[derive(Debug, Clone, Serialize)]
pub struct Transcription {
    pub run_id: Uuid,

    #[serde(skip)]
    pub midi: Vec<u8>,

    pub events: EventMap,

    /// Healthy or degraded decode; degraded output came from a synthetic signal
    pub decode_status: DecodeStatus,

    pub detector: DetectorKind,

    /// Why the model detector was not used, when one was configured
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<String>,

    /// States visited, in order
    pub stages: Vec<PipelineStage>,

    pub frame_count: usize,
    pub duration_secs: f64,
}

impl Transcription {
    pub fn is_degraded(&self) -> bool {
        matches!(self.decode_status, DecodeStatus::Degraded { .. })
    }
}

/// Stage bookkeeping for one run
struct RunState<'a> {
    run_id: Uuid,
    stages: Vec<PipelineStage>,
    trace: Option<&'a TraceWriter>,
}

impl<'a> RunState<'a> {
    fn new(trace: Option<&'a TraceWriter>) -> Self {
        RunState {
            run_id: Uuid::new_v4(),
            stages: Vec::new(),
            trace,
        }
    }

    fn enter(&mut self, stage: PipelineStage, message: &str, data: Option<serde_json::Value>) {
        log::debug!("[{}] {} ({})", self.run_id, stage, message);
        self.stages.push(stage);

        if let Some(writer) = self.trace {
            let mut entry = TraceEntry::for_stage(self.run_id, stage, message);
            entry.data = data;
            if let Err(e) = writer.write(&entry) {
                log::warn!("Failed to write trace entry to {}: {}", writer.path().display(), e);
            }
        }
    }

    fn fail(&mut self, error: PipelineError) -> PipelineError {
        log::error!("[{}] Transcription failed: {}", self.run_id, error);
        let data = serde_json::json!({
            "failed_stage": error.stage().map(|s| s.as_str()),
        });
        self.enter(PipelineStage::Failed, &error.to_string(), Some(data));
        error
    }
}

/// Orchestrates one transcription per call. Cheap to share; concurrent calls
/// only share the model cache.
pub struct TranscriptionPipeline {
    config: TranscriberConfig,
    cache: Arc<ModelCache>,
    decoder: AudioDecoder,
    featurizer: Arc<SpectralFeaturizer>,
    heuristic: HeuristicOnsetStrategy,
    encoder: EventEncoder,
}

impl TranscriptionPipeline {
    pub fn new(config: TranscriberConfig, cache: Arc<ModelCache>) -> Result<Self, PipelineError> {
        config.validate()?;

        let decoder = AudioDecoder::new(config.sample_rate)
            .with_synthetic_fallback(config.synthesize_on_decode_failure);
        let featurizer = SpectralFeaturizer::new(config.features.clone(), config.sample_rate)?;
        let heuristic = HeuristicOnsetStrategy::new(config.heuristic.clone());
        let encoder = EventEncoder::new(config.encode_options())?;

        Ok(TranscriptionPipeline {
            config,
            cache,
            decoder,
            featurizer: Arc::new(featurizer),
            heuristic,
            encoder,
        })
    }

    pub fn config(&self) -> &TranscriberConfig {
        &self.config
    }

    /// Transcribe a complete encoded recording to MIDI
    pub async fn transcribe(&self, audio: &[u8]) -> Result<Transcription, PipelineError> {
        self.transcribe_with_trace(audio, None).await
    }

    /// Like [`transcribe`](Self::transcribe), also appending stage entries to `trace`
    pub async fn transcribe_with_trace(
        &self,
        audio: &[u8],
        trace: Option<&TraceWriter>,
    ) -> Result<Transcription, PipelineError> {
        let mut run = RunState::new(trace);
        log::info!("[{}] Transcribing {} bytes of audio", run.run_id, audio.len());

        // Decoding
        run.enter(PipelineStage::Decoding, "Decoding audio", None);
        let decoder = self.decoder.clone();
        let bytes = audio.to_vec();
        let decoded = match tokio::task::spawn_blocking(move || decoder.decode(&bytes)).await {
            Ok(Ok(decoded)) => decoded,
            Ok(Err(e)) => return Err(run.fail(PipelineError::Decode(e))),
            Err(e) => {
                return Err(run.fail(PipelineError::Task {
                    stage: PipelineStage::Decoding,
                    message: e.to_string(),
                }))
            }
        };
        if let DecodeStatus::Degraded { reason } = &decoded.status {
            log::warn!("[{}] Continuing with synthetic audio: {}", run.run_id, reason);
        }
        let duration_secs = decoded.buffer.duration_secs();

        // Featurizing
        run.enter(PipelineStage::Featurizing, "Computing mel spectrogram", None);
        let featurizer = Arc::clone(&self.featurizer);
        let buffer = decoded.buffer;
        let spectrogram = match tokio::task::spawn_blocking(move || featurizer.compute(&buffer)).await {
            Ok(Ok(spectrogram)) => spectrogram,
            Ok(Err(e)) => return Err(run.fail(PipelineError::Featurize(e))),
            Err(e) => {
                return Err(run.fail(PipelineError::Task {
                    stage: PipelineStage::Featurizing,
                    message: e.to_string(),
                }))
            }
        };

        // Detecting
        let (events, detector, fallback_reason) = self.detect(&mut run, &spectrogram).await;

        // Encoding
        run.enter(
            PipelineStage::Encoding,
            "Writing MIDI",
            Some(serde_json::json!({ "events": events.total() })),
        );
        let midi = match self.encoder.encode(&events) {
            Ok(midi) => midi,
            Err(e) => return Err(run.fail(PipelineError::Encode(e))),
        };

        run.enter(
            PipelineStage::Done,
            "Transcription complete",
            Some(serde_json::json!({
                "detector": detector,
                "degraded": matches!(decoded.status, DecodeStatus::Degraded { .. }),
                "counts": events.counts(),
            })),
        );
        log::info!(
            "[{}] Transcribed {:.2}s into {} events with the {} detector",
            run.run_id,
            duration_secs,
            events.total(),
            detector
        );

        Ok(Transcription {
            run_id: run.run_id,
            midi,
            events,
            decode_status: decoded.status,
            detector,
            fallback_reason,
            stages: run.stages,
            frame_count: spectrogram.num_frames(),
            duration_secs,
        })
    }

    /// Try the model if one is configured and loads; otherwise, or on any
    /// detector error, run the heuristic once. Never fails.
    async fn detect(
        &self,
        run: &mut RunState<'_>,
        spectrogram: &Spectrogram,
    ) -> (EventMap, DetectorKind, Option<String>) {
        let mut fallback_reason = None;

        if let Some(detector) = self.model_detector(run, &mut fallback_reason).await {
            run.enter(PipelineStage::DetectingModel, "Running model inference", None);
            match detector.detect(spectrogram).await {
                Ok(events) => return (events, DetectorKind::Model, None),
                Err(e) => {
                    log::warn!("[{}] Model detection failed, using heuristic: {}", run.run_id, e);
                    fallback_reason = Some(e.to_string());
                }
            }
        }

        let detector = EventDetector::Heuristic(self.heuristic.clone());
        let data = fallback_reason
            .as_ref()
            .map(|reason| serde_json::json!({ "fallback_reason": reason }));
        run.enter(PipelineStage::DetectingHeuristic, "Detecting onsets heuristically", data);

        let events = match detector.detect(spectrogram).await {
            Ok(events) => events,
            Err(e) => {
                // Unreachable for the heuristic variant
                log::error!("[{}] Heuristic detector returned an error: {}", run.run_id, e);
                EventMap::new()
            }
        };
        (events, DetectorKind::Heuristic, fallback_reason)
    }

    async fn model_detector(
        &self,
        run: &RunState<'_>,
        fallback_reason: &mut Option<String>,
    ) -> Option<EventDetector> {
        let source = ModelSource::parse(self.config.model.as_deref()?);
        match self.cache.get_or_load(&source).await {
            Ok(model) => Some(EventDetector::Model(
                ModelInferenceStrategy::new(model).with_timeout(self.config.inference_timeout()),
            )),
            Err(e) => {
                log::warn!("[{}] Model {} unavailable: {}", run.run_id, source, e);
                *fallback_reason = Some(e.to_string());
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::cache::tests::CountingLoader;
    use crate::events::model::tests::{ScriptedModel, StallingModel, TruncatingModel};
    use crate::events::{DetectorError, DrumClass, DrumModel, ModelLoader};
    use crate::pipeline::trace::read_trace_file;
    use hound::{SampleFormat, WavSpec, WavWriter};
    use std::io::Cursor;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;

    /// Loader that hands out one prebuilt model for any source
    struct FixedLoader(Arc<dyn DrumModel>);

    impl ModelLoader for FixedLoader {
        fn load(&self, _source: &ModelSource) -> Result<Arc<dyn DrumModel>, DetectorError> {
            Ok(Arc::clone(&self.0))
        }
    }

    fn silent_wav(frames: usize) -> Vec<u8> {
        let spec = WavSpec {
            channels: 1,
            sample_rate: 16000,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = WavWriter::new(&mut cursor, spec).unwrap();
            for _ in 0..frames {
                writer.write_sample(0i16).unwrap();
            }
            writer.finalize().unwrap();
        }
        cursor.into_inner()
    }

    fn float_wav(samples: &[f32]) -> Vec<u8> {
        let spec = WavSpec {
            channels: 1,
            sample_rate: 16000,
            bits_per_sample: 32,
            sample_format: SampleFormat::Float,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = WavWriter::new(&mut cursor, spec).unwrap();
            for &sample in samples {
                writer.write_sample(sample).unwrap();
            }
            writer.finalize().unwrap();
        }
        cursor.into_inner()
    }

    fn model_config(timeout_ms: u64) -> TranscriberConfig {
        TranscriberConfig {
            model: Some("/models/drums.onnx".into()),
            inference_timeout_ms: timeout_ms,
            ..TranscriberConfig::default()
        }
    }

    fn pipeline_with_model(config: TranscriberConfig, model: Arc<dyn DrumModel>) -> TranscriptionPipeline {
        let cache = Arc::new(ModelCache::new(Arc::new(FixedLoader(model))));
        TranscriptionPipeline::new(config, cache).unwrap()
    }

    fn heuristic_pipeline() -> TranscriptionPipeline {
        TranscriptionPipeline::new(TranscriberConfig::default(), Arc::new(ModelCache::default())).unwrap()
    }

    #[test]
    fn test_stage_names_and_progress() {
        assert_eq!(PipelineStage::DetectingModel.as_str(), "detecting_model");
        assert_eq!(PipelineStage::Encoding.progress(), 0.8);
        assert!(PipelineStage::Failed.is_terminal());
        assert!(!PipelineStage::Encoding.is_terminal());
        assert_eq!(
            serde_json::to_string(&PipelineStage::DetectingHeuristic).unwrap(),
            "\"detecting_heuristic\""
        );
    }

    #[tokio::test]
    async fn test_silent_wav_produces_empty_midi() {
        let result = heuristic_pipeline().transcribe(&silent_wav(16000)).await.unwrap();

        assert_eq!(&result.midi[..4], b"MThd");
        assert!(result.events.is_empty());
        assert!(!result.is_degraded());
        assert_eq!(result.detector, DetectorKind::Heuristic);
        assert!(result.fallback_reason.is_none());
        assert_eq!(result.frame_count, 28);
        assert!((result.duration_secs - 1.0).abs() < 1e-9);
        assert_eq!(
            result.stages,
            vec![
                PipelineStage::Decoding,
                PipelineStage::Featurizing,
                PipelineStage::DetectingHeuristic,
                PipelineStage::Encoding,
                PipelineStage::Done,
            ]
        );
    }

    #[tokio::test]
    async fn test_kick_pulse_train_becomes_kicks() {
        let mut samples = vec![0.0f32; 32000];
        let mut centre = 1280;
        while centre + 320 < samples.len() {
            for i in centre - 320..=centre + 320 {
                samples[i] += 0.8 * (1.0 - (i as f32 - centre as f32).abs() / 320.0);
            }
            centre += 3072;
        }

        let result = heuristic_pipeline().transcribe(&float_wav(&samples)).await.unwrap();
        assert!(result.events.hits(DrumClass::Kick).len() >= 8);
        assert_eq!(result.events.total(), result.events.hits(DrumClass::Kick).len());
    }

    #[tokio::test]
    async fn test_corrupt_input_degrades() {
        let result = heuristic_pipeline()
            .transcribe(b"definitely not audio")
            .await
            .unwrap();

        assert!(result.is_degraded());
        assert_eq!(&result.midi[..4], b"MThd");
        assert_eq!(result.stages.last(), Some(&PipelineStage::Done));
    }

    #[tokio::test]
    async fn test_strict_decode_fails_and_traces() {
        let temp_dir = TempDir::new().unwrap();
        let writer = TraceWriter::new(temp_dir.path().join("trace.jsonl"));
        let config = TranscriberConfig {
            synthesize_on_decode_failure: false,
            ..TranscriberConfig::default()
        };
        let pipeline = TranscriptionPipeline::new(config, Arc::new(ModelCache::default())).unwrap();

        let error = pipeline
            .transcribe_with_trace(b"definitely not audio", Some(&writer))
            .await
            .unwrap_err();
        assert!(matches!(error, PipelineError::Decode(_)));
        assert_eq!(error.stage(), Some(PipelineStage::Decoding));

        let entries = read_trace_file(writer.path()).unwrap();
        let stages: Vec<&str> = entries.iter().map(|e| e.stage.as_str()).collect();
        assert_eq!(stages, vec!["decoding", "failed"]);
        assert_eq!(entries[1].data.as_ref().unwrap()["failed_stage"], "decoding");
    }

    #[tokio::test]
    async fn test_trace_entries_share_run_id() {
        let temp_dir = TempDir::new().unwrap();
        let writer = TraceWriter::new(temp_dir.path().join("trace.jsonl"));

        let result = heuristic_pipeline()
            .transcribe_with_trace(&silent_wav(8000), Some(&writer))
            .await
            .unwrap();

        let entries = read_trace_file(writer.path()).unwrap();
        assert_eq!(entries.len(), result.stages.len());
        assert!(entries.iter().all(|e| e.run_id == result.run_id));
        assert!(entries.windows(2).all(|w| w[0].progress < w[1].progress));
        assert_eq!(entries.last().unwrap().stage, "done");
    }

    #[tokio::test]
    async fn test_unwritable_trace_does_not_fail_run() {
        let writer = TraceWriter::new("/nonexistent/dir/trace.jsonl".into());
        let result = heuristic_pipeline()
            .transcribe_with_trace(&silent_wav(8000), Some(&writer))
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_model_success() {
        let model = Arc::new(ScriptedModel::new(vec![(2, 38, 0.8, 0.5)]));
        let pipeline = pipeline_with_model(model_config(30_000), model.clone());

        let result = pipeline.transcribe(&silent_wav(16000)).await.unwrap();

        assert_eq!(result.detector, DetectorKind::Model);
        assert!(result.fallback_reason.is_none());
        assert_eq!(result.events.total(), 1);
        let snare = result.events.hits(DrumClass::Snare);
        assert_eq!(snare.len(), 1);
        assert_eq!(snare[0].velocity, 64);
        assert!((snare[0].time_secs - 0.064).abs() < 1e-9);
        assert!(result.stages.contains(&PipelineStage::DetectingModel));
        assert!(!result.stages.contains(&PipelineStage::DetectingHeuristic));
        assert_eq!(model.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_inference_timeout_falls_back_once() {
        let model = Arc::new(StallingModel {
            saw_cancel: Arc::new(AtomicBool::new(false)),
        });
        let pipeline = pipeline_with_model(model_config(50), model);

        let result = pipeline.transcribe(&silent_wav(16000)).await.unwrap();

        assert_eq!(result.detector, DetectorKind::Heuristic);
        assert!(result.fallback_reason.as_deref().unwrap().contains("timed out"));
        let count = |stage: PipelineStage| result.stages.iter().filter(|s| **s == stage).count();
        assert_eq!(count(PipelineStage::DetectingModel), 1);
        assert_eq!(count(PipelineStage::DetectingHeuristic), 1);
        assert_eq!(result.stages.last(), Some(&PipelineStage::Done));
    }

    #[tokio::test]
    async fn test_malformed_output_falls_back() {
        let pipeline = pipeline_with_model(model_config(30_000), Arc::new(TruncatingModel));

        let result = pipeline.transcribe(&silent_wav(16000)).await.unwrap();

        assert_eq!(result.detector, DetectorKind::Heuristic);
        assert!(result.fallback_reason.as_deref().unwrap().contains("Malformed"));
    }

    #[tokio::test]
    async fn test_nan_velocity_falls_back_to_heuristic() {
        let model = Arc::new(ScriptedModel::new(vec![(2, 38, 0.8, f32::NAN)]));
        let pipeline = pipeline_with_model(model_config(30_000), model);

        let result = pipeline.transcribe(&silent_wav(16000)).await.unwrap();

        assert_eq!(result.detector, DetectorKind::Heuristic);
        assert!(result.fallback_reason.as_deref().unwrap().contains("non-finite"));
        assert_eq!(&result.midi[..4], b"MThd");
        assert_eq!(result.stages.last(), Some(&PipelineStage::Done));
    }

    #[tokio::test]
    async fn test_load_failure_skips_model_stage() {
        let cache = Arc::new(ModelCache::new(Arc::new(CountingLoader::failing())));
        let pipeline = TranscriptionPipeline::new(model_config(30_000), cache).unwrap();

        let result = pipeline.transcribe(&silent_wav(16000)).await.unwrap();

        assert_eq!(result.detector, DetectorKind::Heuristic);
        assert!(result.fallback_reason.is_some());
        assert!(!result.stages.contains(&PipelineStage::DetectingModel));
        assert!(result.stages.contains(&PipelineStage::DetectingHeuristic));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_runs_share_model() {
        let loader = Arc::new(CountingLoader::ok());
        let cache = Arc::new(ModelCache::new(loader.clone()));
        let pipeline = Arc::new(TranscriptionPipeline::new(model_config(30_000), cache).unwrap());
        let audio = Arc::new(silent_wav(8000));

        let tasks: Vec<_> = (0..4)
            .map(|_| {
                let pipeline = Arc::clone(&pipeline);
                let audio = Arc::clone(&audio);
                tokio::spawn(async move { pipeline.transcribe(&audio).await })
            })
            .collect();

        let mut run_ids = Vec::new();
        for task in tasks {
            let result = task.await.unwrap().unwrap();
            assert_eq!(result.detector, DetectorKind::Model);
            run_ids.push(result.run_id);
        }
        run_ids.sort();
        run_ids.dedup();
        assert_eq!(run_ids.len(), 4);
        assert_eq!(loader.loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = TranscriberConfig {
            inference_timeout_ms: 0,
            ..TranscriberConfig::default()
        };
        let result = TranscriptionPipeline::new(config, Arc::new(ModelCache::default()));
        assert!(matches!(result, Err(PipelineError::InvalidConfig(_))));
    }
}
