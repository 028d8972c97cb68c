//! Source format detection and the extractors behind it.
//!
//! Detection is extension-first with one content sniff: a `.txt` whose head
//! carries OFX markers is treated as the exchange format, not free text.

pub mod delimited;
pub mod document;
pub mod exchange;
pub mod spreadsheet;

use crate::app::ports::ClassifierPort;
use crate::common::error::{PipelineError, Result};
use crate::domain::RawRecord;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

pub const SUPPORTED_EXTENSIONS: &[&str] = &[
    "csv", "txt", "xls", "xlsx", "xlsm", "ofx", "pdf", "jpg", "jpeg", "png", "webp", "gif",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceFormat {
    DelimitedText,
    Spreadsheet,
    StandardizedExchange,
    DocumentImage,
    ScannedDocument,
}

impl SourceFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceFormat::DelimitedText => "delimited-text",
            SourceFormat::Spreadsheet => "spreadsheet",
            SourceFormat::StandardizedExchange => "standardized-exchange",
            SourceFormat::DocumentImage => "document-image",
            SourceFormat::ScannedDocument => "scanned-document",
        }
    }

    /// Formats whose extractor already yields parsed records, skipping
    /// structure interpretation entirely.
    pub fn is_standard(&self) -> bool {
        matches!(self, SourceFormat::StandardizedExchange)
    }
}

impl std::fmt::Display for SourceFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Detection result: category plus the media type implied by the extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DetectedSource {
    pub format: SourceFormat,
    pub media_type: &'static str,
}

/// Decide a file's category from its path. No side effects beyond reading
/// a small head for the OFX sniff.
pub fn detect_format(path: &Path) -> Result<DetectedSource> {
    let metadata = fs::metadata(path).map_err(|_| PipelineError::SourceNotFound {
        path: path.to_path_buf(),
    })?;
    if metadata.len() == 0 {
        return Err(PipelineError::SourceNotFound {
            path: path.to_path_buf(),
        });
    }

    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
        .unwrap_or_default();

    let detected = match extension.as_str() {
        "csv" => DetectedSource {
            format: SourceFormat::DelimitedText,
            media_type: "text/csv",
        },
        "txt" => {
            if head_looks_like_ofx(path)? {
                DetectedSource {
                    format: SourceFormat::StandardizedExchange,
                    media_type: "application/x-ofx",
                }
            } else {
                DetectedSource {
                    format: SourceFormat::DelimitedText,
                    media_type: "text/plain",
                }
            }
        }
        "xls" => DetectedSource {
            format: SourceFormat::Spreadsheet,
            media_type: "application/vnd.ms-excel",
        },
        "xlsx" | "xlsm" => DetectedSource {
            format: SourceFormat::Spreadsheet,
            media_type: "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        },
        "ofx" => DetectedSource {
            format: SourceFormat::StandardizedExchange,
            media_type: "application/x-ofx",
        },
        "pdf" => DetectedSource {
            format: SourceFormat::ScannedDocument,
            media_type: "application/pdf",
        },
        "jpg" | "jpeg" => DetectedSource {
            format: SourceFormat::DocumentImage,
            media_type: "image/jpeg",
        },
        "png" => DetectedSource {
            format: SourceFormat::DocumentImage,
            media_type: "image/png",
        },
        "webp" => DetectedSource {
            format: SourceFormat::DocumentImage,
            media_type: "image/webp",
        },
        "gif" => DetectedSource {
            format: SourceFormat::DocumentImage,
            media_type: "image/gif",
        },
        _ => {
            return Err(PipelineError::UnsupportedFormat {
                extension: if extension.is_empty() {
                    "(none)".to_string()
                } else {
                    extension
                },
                supported: SUPPORTED_EXTENSIONS.join(", "),
            })
        }
    };

    Ok(detected)
}

fn head_looks_like_ofx(path: &Path) -> Result<bool> {
    let bytes = fs::read(path)?;
    let head: String = decode_bytes(&bytes.iter().take(512).copied().collect::<Vec<u8>>())
        .0
        .to_uppercase();
    Ok(head.contains("OFXHEADER") || head.contains("<OFX"))
}

/// Trial-decode: strict UTF-8 first, then windows-1252, then a raw
/// latin-1 byte map that cannot fail.
pub(crate) fn decode_bytes(bytes: &[u8]) -> (String, &'static str) {
    if let Ok(text) = std::str::from_utf8(bytes) {
        return (text.to_string(), "utf-8");
    }
    let (decoded, _, had_errors) = encoding_rs::WINDOWS_1252.decode(bytes);
    if !had_errors {
        return (decoded.into_owned(), "windows-1252");
    }
    (bytes.iter().map(|&b| b as char).collect(), "latin-1")
}

/// Tabular content: rows already split into cells, plus the bounded sample
/// the structure interpreter works from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableContent {
    pub rows: Vec<Vec<String>>,
    pub delimiter: Option<char>,
    pub encoding: String,
    /// Extractor tag carried into record provenance.
    pub method: String,
    pub sample: String,
}

/// Transcribed text for sources without any tabular structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextContent {
    pub sample: String,
    pub full: String,
}

/// What an extractor hands the rest of the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ExtractedContent {
    Table(TableContent),
    Records(Vec<RawRecord>),
    Text(TextContent),
}

impl ExtractedContent {
    pub fn kind(&self) -> &'static str {
        match self {
            ExtractedContent::Table(_) => "table",
            ExtractedContent::Records(_) => "records",
            ExtractedContent::Text(_) => "text",
        }
    }
}

/// Run the extractor matching the detected category.
pub async fn extract(
    path: &Path,
    detected: &DetectedSource,
    classifier: &dyn ClassifierPort,
    sample_lines: usize,
    sample_chars: usize,
) -> Result<ExtractedContent> {
    match detected.format {
        SourceFormat::DelimitedText => {
            delimited::extract(path, sample_lines, sample_chars).map(ExtractedContent::Table)
        }
        SourceFormat::Spreadsheet => {
            spreadsheet::extract(path, sample_lines, sample_chars).map(ExtractedContent::Table)
        }
        SourceFormat::StandardizedExchange => {
            exchange::extract(path).map(ExtractedContent::Records)
        }
        SourceFormat::DocumentImage | SourceFormat::ScannedDocument => {
            document::extract(path, detected, classifier, sample_chars)
                .await
                .map(ExtractedContent::Text)
        }
    }
}

/// Truncate on a char boundary; samples go to an external service with a
/// fixed budget.
pub(crate) fn truncate_chars(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    fn write_file(dir: &tempfile::TempDir, name: &str, content: &[u8]) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(content).unwrap();
        path
    }

    #[test]
    fn detects_csv_as_delimited_text() {
        let dir = tempdir().unwrap();
        let path = write_file(&dir, "movements.csv", b"Fecha;Concepto;Importe\n");
        let detected = detect_format(&path).unwrap();
        assert_eq!(detected.format, SourceFormat::DelimitedText);
        assert_eq!(detected.media_type, "text/csv");
    }

    #[test]
    fn detects_ofx_inside_txt_by_content() {
        let dir = tempdir().unwrap();
        let path = write_file(&dir, "export.txt", b"OFXHEADER:100\nDATA:OFXSGML\n");
        let detected = detect_format(&path).unwrap();
        assert_eq!(detected.format, SourceFormat::StandardizedExchange);
    }

    #[test]
    fn plain_txt_stays_delimited() {
        let dir = tempdir().unwrap();
        let path = write_file(&dir, "notes.txt", b"Fecha,Concepto,Importe\n");
        let detected = detect_format(&path).unwrap();
        assert_eq!(detected.format, SourceFormat::DelimitedText);
    }

    #[test]
    fn detects_images_and_documents() {
        let dir = tempdir().unwrap();
        let png = write_file(&dir, "scan.png", b"\x89PNG\r\n");
        let pdf = write_file(&dir, "statement.pdf", b"%PDF-1.4");
        assert_eq!(
            detect_format(&png).unwrap().format,
            SourceFormat::DocumentImage
        );
        assert_eq!(
            detect_format(&pdf).unwrap().format,
            SourceFormat::ScannedDocument
        );
    }

    #[test]
    fn unsupported_extension_names_itself_and_the_supported_set() {
        let dir = tempdir().unwrap();
        let path = write_file(&dir, "statement.docx", b"PK");
        let err = detect_format(&path).unwrap_err();
        match err {
            PipelineError::UnsupportedFormat {
                extension,
                supported,
            } => {
                assert_eq!(extension, "docx");
                assert!(supported.contains("csv"));
                assert!(supported.contains("ofx"));
            }
            other => panic!("expected UnsupportedFormat, got {other:?}"),
        }
    }

    #[test]
    fn missing_and_empty_files_are_source_not_found() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("nope.csv");
        assert!(matches!(
            detect_format(&missing),
            Err(PipelineError::SourceNotFound { .. })
        ));

        let empty = write_file(&dir, "empty.csv", b"");
        assert!(matches!(
            detect_format(&empty),
            Err(PipelineError::SourceNotFound { .. })
        ));
    }

    #[test]
    fn decode_prefers_utf8_then_windows_1252() {
        let (text, encoding) = decode_bytes("Café".as_bytes());
        assert_eq!(text, "Café");
        assert_eq!(encoding, "utf-8");

        // 0xE9 is é in windows-1252 and invalid as a UTF-8 start byte here.
        let (text, encoding) = decode_bytes(&[b'C', b'a', b'f', 0xE9]);
        assert_eq!(text, "Café");
        assert_eq!(encoding, "windows-1252");
    }
}
