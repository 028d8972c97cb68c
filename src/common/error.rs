use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("unsupported format '{extension}' (supported: {supported})")]
    UnsupportedFormat { extension: String, supported: String },

    #[error("source file not found or empty: {path}")]
    SourceNotFound { path: PathBuf },

    #[error("extraction failed for {path}: {message}")]
    ExtractionFailed { path: PathBuf, message: String },

    #[error("could not detect a usable structure: {message}")]
    StructureUndetected { message: String },

    #[error("record validation failed: {message}")]
    RecordValidation { message: String },

    #[error("external service call failed: {message}")]
    ExternalService { message: String },

    #[error("persistence failed, run rolled back: {message}")]
    PersistenceFailed { message: String },

    #[error("checkpoint error: {message}")]
    Checkpoint { message: String },

    #[error("configuration error: {message}")]
    Config { message: String },

    #[error("JSON deserialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

impl PipelineError {
    /// True for errors that poison a single record rather than the run.
    pub fn is_record_level(&self) -> bool {
        matches!(self, PipelineError::RecordValidation { .. })
    }
}
