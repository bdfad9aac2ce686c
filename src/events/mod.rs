// Event detection module
// Drum onset detection strategies, model loading, and event types

pub mod backend;
pub mod cache;
pub mod heuristic;
pub mod model;
#[cfg(feature = "onnx")]
pub mod onnx;
pub mod types;

pub use backend::{DetectorError, DetectorKind, EventDetector};
pub use cache::{default_loader, ModelCache, ModelLoader, ModelSource, UnsupportedLoader};
pub use heuristic::{HeuristicOnsetStrategy, HeuristicThresholds};
pub use model::{CancelFlag, DrumModel, ModelInferenceStrategy, ModelInput, ModelOutput};
pub use types::{DrumClass, DrumEvent, EventMap, Hit};
