// ONNX Runtime model backend
// Loads drum transcription models from disk or HTTP and runs them with ort

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use ort::session::{RunOptions, Session};
use ort::value::{DynValue, Tensor};

use crate::events::backend::DetectorError;
use crate::events::cache::{ModelLoader, ModelSource};
use crate::events::model::{
    ActivationCurves, CancelFlag, DrumModel, ModelInput, ModelOutput, ONSET_OUTPUT, VELOCITY_OUTPUT,
};

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(120);

/// A drum model backed by an ONNX Runtime session.
/// `Session::run` needs `&mut self`, so the session sits behind a mutex.
pub struct OnnxDrumModel {
    session: Mutex<Session>,
}

impl OnnxDrumModel {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DetectorError> {
        let session = Session::builder()
            .map_err(|e| DetectorError::ModelUnavailable(format!("session builder: {e}")))?
            .commit_from_memory(bytes)
            .map_err(|e| DetectorError::ModelUnavailable(format!("load model: {e}")))?;
        Ok(OnnxDrumModel {
            session: Mutex::new(session),
        })
    }
}

fn extract_curves(value: Option<&DynValue>, name: &str) -> Result<ActivationCurves, DetectorError> {
    let value =
        value.ok_or_else(|| DetectorError::MalformedOutput(format!("missing output `{name}`")))?;
    let (shape, data) = value
        .try_extract_tensor::<f32>()
        .map_err(|e| DetectorError::MalformedOutput(format!("extract `{name}`: {e}")))?;
    let dims = shape
        .iter()
        .map(|&d| usize::try_from(d))
        .collect::<Result<Vec<usize>, _>>()
        .map_err(|_| DetectorError::MalformedOutput(format!("`{name}` has unresolved shape {shape:?}")))?;
    ActivationCurves::from_tensor(&dims, data.to_vec())
}

impl DrumModel for OnnxDrumModel {
    fn infer(&self, input: &ModelInput, cancel: &CancelFlag) -> Result<ModelOutput, DetectorError> {
        let shape: Vec<i64> = input.shape().iter().map(|&d| d as i64).collect();
        let tensor = Tensor::from_array((shape, input.data().to_vec()))
            .map_err(|e| DetectorError::ModelUnavailable(format!("input tensor: {e}")))?;

        let run_options = Arc::new(
            RunOptions::new()
                .map_err(|e| DetectorError::ModelUnavailable(format!("run options: {e}")))?,
        );
        let terminate = Arc::clone(&run_options);
        cancel.on_cancel(move || {
            if let Err(e) = terminate.terminate() {
                log::warn!("Failed to terminate ONNX run: {}", e);
            }
        });

        let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        let result = session.run_with_options(ort::inputs![tensor], &run_options);
        cancel.clear_hook();

        if cancel.is_cancelled() {
            return Err(DetectorError::ModelUnavailable("inference cancelled".into()));
        }
        let outputs = result.map_err(|e| DetectorError::ModelUnavailable(format!("inference: {e}")))?;

        Ok(ModelOutput {
            onset_probs: extract_curves(outputs.get(ONSET_OUTPUT), ONSET_OUTPUT)?,
            velocities: extract_curves(outputs.get(VELOCITY_OUTPUT), VELOCITY_OUTPUT)?,
        })
    }
}

/// Reads model bytes from a local path or fetches them over HTTP
#[derive(Debug, Clone, Default)]
pub struct OnnxLoader;

impl OnnxLoader {
    fn fetch(&self, source: &ModelSource) -> Result<Vec<u8>, DetectorError> {
        match source {
            ModelSource::Path(path) => std::fs::read(path).map_err(|e| {
                DetectorError::ModelUnavailable(format!("read {}: {e}", path.display()))
            }),
            ModelSource::Url(url) => {
                let client = reqwest::blocking::Client::builder()
                    .timeout(DOWNLOAD_TIMEOUT)
                    .build()
                    .map_err(|e| DetectorError::ModelUnavailable(format!("http client: {e}")))?;
                let response = client
                    .get(url)
                    .send()
                    .and_then(|r| r.error_for_status())
                    .map_err(|e| DetectorError::ModelUnavailable(format!("download {url}: {e}")))?;
                let bytes = response
                    .bytes()
                    .map_err(|e| DetectorError::ModelUnavailable(format!("download {url}: {e}")))?;
                Ok(bytes.to_vec())
            }
        }
    }
}

impl ModelLoader for OnnxLoader {
    fn load(&self, source: &ModelSource) -> Result<Arc<dyn DrumModel>, DetectorError> {
        let bytes = self.fetch(source)?;
        log::info!("Fetched {} bytes of model data from {}", bytes.len(), source);
        Ok(Arc::new(OnnxDrumModel::from_bytes(&bytes)?))
    }
}
