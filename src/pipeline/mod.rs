// Pipeline execution and monitoring module
// Orchestrates audio-to-MIDI transcription runs and records their progress

pub mod trace;
pub mod transcribe;

pub use trace::{read_trace_file, TraceEntry, TraceError, TraceWriter};
pub use transcribe::{PipelineError, PipelineStage, Transcription, TranscriptionPipeline};
