// Drumscribe - drum transcription from recorded audio to General MIDI
// Module declarations

pub mod audio;
pub mod config;
pub mod events;
pub mod midi;
pub mod pipeline;

pub use config::{ConfigError, TranscriberConfig};
pub use events::{DrumClass, DrumEvent, EventMap, ModelCache, ModelSource};
pub use midi::{EncodeOptions, EventEncoder};
pub use pipeline::{PipelineError, PipelineStage, Transcription, TranscriptionPipeline};
