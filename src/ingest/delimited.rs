//! Delimited-text extractor: delimiter and encoding are both detected, the
//! file is split into cells, and a bounded sample is kept for the
//! structure interpreter.

use super::{decode_bytes, truncate_chars, TableContent};
use crate::common::error::{PipelineError, Result};
use std::fs;
use std::path::Path;
use tracing::debug;

const DELIMITER_CANDIDATES: [char; 3] = [',', ';', '\t'];

pub fn extract(path: &Path, sample_lines: usize, sample_chars: usize) -> Result<TableContent> {
    let bytes = fs::read(path).map_err(|e| PipelineError::ExtractionFailed {
        path: path.to_path_buf(),
        message: format!("read failed: {}", e),
    })?;
    let (text, encoding) = decode_bytes(&bytes);

    let first_line = text.lines().next().unwrap_or_default();
    let delimiter = detect_delimiter(first_line);
    debug!(
        "📄 delimited source {}: encoding={}, delimiter={:?}",
        path.display(),
        encoding,
        delimiter
    );

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter as u8)
        .has_headers(false)
        .flexible(true)
        .from_reader(text.as_bytes());

    let mut rows: Vec<Vec<String>> = Vec::new();
    for result in reader.records() {
        let record = result.map_err(|e| PipelineError::ExtractionFailed {
            path: path.to_path_buf(),
            message: format!("csv parse error: {}", e),
        })?;
        let cells: Vec<String> = record.iter().map(|c| c.to_string()).collect();
        if cells.iter().all(|c| c.trim().is_empty()) {
            continue;
        }
        rows.push(cells);
    }

    if rows.is_empty() {
        return Err(PipelineError::ExtractionFailed {
            path: path.to_path_buf(),
            message: "no rows found".to_string(),
        });
    }

    let sample_text = text
        .lines()
        .take(sample_lines)
        .collect::<Vec<_>>()
        .join("\n");

    Ok(TableContent {
        rows,
        delimiter: Some(delimiter),
        encoding: encoding.to_string(),
        method: "delimited".to_string(),
        sample: truncate_chars(&sample_text, sample_chars),
    })
}

/// Most frequent candidate in the first line wins; ties and all-zero counts
/// resolve to the earliest candidate (comma).
pub fn detect_delimiter(first_line: &str) -> char {
    let mut best = DELIMITER_CANDIDATES[0];
    let mut best_count = 0usize;
    for candidate in DELIMITER_CANDIDATES {
        let count = first_line.matches(candidate).count();
        if count > best_count {
            best = candidate;
            best_count = count;
        }
    }
    best
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
    fn detects_semicolon_delimiter() {
        assert_eq!(detect_delimiter("Fecha;Concepto;Importe"), ';');
        assert_eq!(detect_delimiter("date,description,amount"), ',');
        assert_eq!(detect_delimiter("a\tb\tc"), '\t');
        // Tie between comma and semicolon resolves to comma.
        assert_eq!(detect_delimiter("a,b;c"), ',');
        assert_eq!(detect_delimiter("no delimiters here"), ',');
    }

    #[test]
    fn splits_rows_on_detected_delimiter() {
        let dir = tempdir().unwrap();
        let path = write_file(
            &dir,
            "movements.csv",
            b"Fecha;Concepto;Importe\n15/12/2024;TRANSFERENCIA NOMINA;2500,00\n16/12/2024;PAGO AMAZON;-45,99\n",
        );
        let table = extract(&path, 25, 2000).unwrap();
        assert_eq!(table.delimiter, Some(';'));
        assert_eq!(table.rows.len(), 3);
        assert_eq!(table.rows[1][1], "TRANSFERENCIA NOMINA");
        assert_eq!(table.rows[2][2], "-45,99");
    }

    #[test]
    fn decodes_windows_1252_content() {
        let dir = tempdir().unwrap();
        // "PAGO CAFÉ" with É as the single 0xC9 byte.
        let mut content = b"Fecha;Concepto;Importe\n15/12/2024;PAGO CAF".to_vec();
        content.push(0xC9);
        content.extend_from_slice(b";-3,50\n");
        let path = write_file(&dir, "latin.csv", &content);

        let table = extract(&path, 25, 2000).unwrap();
        assert_eq!(table.encoding, "windows-1252");
        assert_eq!(table.rows[1][1], "PAGO CAFÉ");
    }

    #[test]
    fn sample_is_bounded_by_lines_and_chars() {
        let dir = tempdir().unwrap();
        let mut content = String::from("Fecha;Concepto;Importe\n");
        for i in 0..100 {
            content.push_str(&format!("15/12/2024;ROW {};1,00\n", i));
        }
        let path = write_file(&dir, "long.csv", content.as_bytes());

        let table = extract(&path, 5, 2000).unwrap();
        assert_eq!(table.sample.lines().count(), 5);
        assert_eq!(table.rows.len(), 101);
    }

    #[test]
    fn blank_only_file_is_extraction_failed() {
        let dir = tempdir().unwrap();
        let path = write_file(&dir, "blank.csv", b"\n\n\n");
        assert!(matches!(
            extract(&path, 25, 2000),
            Err(PipelineError::ExtractionFailed { .. })
        ));
    }
}
