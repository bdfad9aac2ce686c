// Pipeline progress tracing
// Append-only JSONL trace of stage transitions for one or more transcription runs

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

use super::transcribe::PipelineStage;

/// Errors that can occur during trace operations
#[derive(Debug, Error)]
pub enum TraceError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

/// One stage transition of a transcription run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEntry {
    /// RFC 3339 timestamp of when this entry was created
    pub timestamp: String,

    /// Run this entry belongs to
    pub run_id: Uuid,

    /// Stage name (e.g. "decoding", "detecting_model", "done")
    pub stage: String,

    /// Progress [0.0, 1.0]
    pub progress: f32,

    pub message: String,

    /// Optional structured data (event counts, fallback reasons, ...)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl TraceEntry {
    pub fn new(run_id: Uuid, stage: impl Into<String>, progress: f32, message: impl Into<String>) -> Self {
        TraceEntry {
            timestamp: Utc::now().to_rfc3339(),
            run_id,
            stage: stage.into(),
            progress: progress.clamp(0.0, 1.0),
            message: message.into(),
            data: None,
        }
    }

    /// Entry for entering `stage`, at that stage's progress checkpoint
    pub fn for_stage(run_id: Uuid, stage: PipelineStage, message: impl Into<String>) -> Self {
        Self::new(run_id, stage.as_str(), stage.progress(), message)
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Serialize to JSON line (with newline)
    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        let json = serde_json::to_string(self)?;
        Ok(format!("{}\n", json))
    }
}

/// Appends trace entries to a JSONL file, creating it on first write
#[derive(Debug, Clone)]
pub struct TraceWriter {
    file_path: PathBuf,
}

impl TraceWriter {
    pub fn new(file_path: PathBuf) -> Self {
        TraceWriter { file_path }
    }

    pub fn write(&self, entry: &TraceEntry) -> Result<(), TraceError> {
        let json_line = entry.to_json_line()?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.file_path)?;
        file.write_all(json_line.as_bytes())?;
        file.flush()?;

        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.file_path
    }
}

/// Read trace entries from a JSONL file, skipping blank lines
pub fn read_trace_file(path: &Path) -> Result<Vec<TraceEntry>, TraceError> {
    let contents = std::fs::read_to_string(path)?;
    contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).map_err(TraceError::from))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_entry_for_stage() {
        let run_id = Uuid::new_v4();
        let entry = TraceEntry::for_stage(run_id, PipelineStage::Featurizing, "Computing mel spectrogram");

        assert_eq!(entry.run_id, run_id);
        assert_eq!(entry.stage, "featurizing");
        assert_eq!(entry.progress, 0.4);
        assert!(entry.data.is_none());
    }

    #[test]
    fn test_entry_with_data() {
        let entry = TraceEntry::for_stage(Uuid::new_v4(), PipelineStage::Done, "Finished")
            .with_data(serde_json::json!({ "events": 12 }));
        assert_eq!(entry.data.unwrap()["events"], 12);
    }

    #[test]
    fn test_progress_clamping() {
        let low = TraceEntry::new(Uuid::nil(), "test", -0.5, "test");
        assert_eq!(low.progress, 0.0);

        let high = TraceEntry::new(Uuid::nil(), "test", 1.5, "test");
        assert_eq!(high.progress, 1.0);
    }

    #[test]
    fn test_trace_writer_appends() {
        let temp_dir = TempDir::new().unwrap();
        let trace_path = temp_dir.path().join("trace.jsonl");
        let writer = TraceWriter::new(trace_path.clone());
        let run_id = Uuid::new_v4();

        writer
            .write(&TraceEntry::for_stage(run_id, PipelineStage::Decoding, "Start"))
            .unwrap();
        writer
            .write(&TraceEntry::for_stage(run_id, PipelineStage::Done, "Done"))
            .unwrap();

        let entries = read_trace_file(&trace_path).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].stage, "decoding");
        assert_eq!(entries[0].progress, 0.1);
        assert_eq!(entries[1].progress, 1.0);
        assert!(entries.iter().all(|e| e.run_id == run_id));
    }

    #[test]
    fn test_json_line_format() {
        let entry = TraceEntry::new(Uuid::nil(), "encoding", 0.8, "Writing MIDI");
        let json_line = entry.to_json_line().unwrap();

        assert!(json_line.ends_with('\n'));
        let parsed: TraceEntry = serde_json::from_str(json_line.trim()).unwrap();
        assert_eq!(parsed.stage, "encoding");
        assert!(!json_line.contains("\"data\""));
    }

    #[test]
    fn test_read_rejects_corrupt_line() {
        let temp_dir = TempDir::new().unwrap();
        let trace_path = temp_dir.path().join("trace.jsonl");
        std::fs::write(&trace_path, "{\"stage\": 1}\n").unwrap();

        assert!(matches!(
            read_trace_file(&trace_path),
            Err(TraceError::SerializationError(_))
        ));
    }
}
