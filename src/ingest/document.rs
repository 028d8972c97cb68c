//! Document and image extractor. There is no column structure to find;
//! the external vision capability transcribes the document and the guided
//! extractor later works from the full text. This is the only extractor
//! allowed to call the external capability.

use super::{truncate_chars, DetectedSource, TextContent};
use crate::app::ports::ClassifierPort;
use crate::common::error::{PipelineError, Result};
use std::fs;
use std::path::Path;
use tracing::info;

pub async fn extract(
    path: &Path,
    detected: &DetectedSource,
    classifier: &dyn ClassifierPort,
    sample_chars: usize,
) -> Result<TextContent> {
    let bytes = fs::read(path).map_err(|e| PipelineError::ExtractionFailed {
        path: path.to_path_buf(),
        message: format!("read failed: {}", e),
    })?;

    let filename = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("document");

    info!(
        "🖼️ transcribing {} ({}, {} bytes)",
        filename,
        detected.media_type,
        bytes.len()
    );
    let full = classifier
        .transcribe(filename, detected.media_type, &bytes)
        .await?;

    if full.trim().is_empty() {
        return Err(PipelineError::ExtractionFailed {
            path: path.to_path_buf(),
            message: "transcription came back empty".to_string(),
        });
    }

    let sample = truncate_chars(&full, sample_chars);
    Ok(TextContent { sample, full })
}
