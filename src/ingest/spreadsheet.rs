//! Spreadsheet extractor. Picks the most plausible sheet by name, renders
//! every cell to text and hands the rows over in the same shape as
//! delimited input.

use super::{truncate_chars, TableContent};
use crate::common::error::{PipelineError, Result};
use calamine::{open_workbook_auto, Data, Reader};
use std::path::Path;
use tracing::debug;

const SHEET_NAME_HINTS: [&str; 5] = [
    "movimientos",
    "transacciones",
    "extracto",
    "movements",
    "transactions",
];

pub fn extract(path: &Path, sample_lines: usize, sample_chars: usize) -> Result<TableContent> {
    let mut workbook = open_workbook_auto(path).map_err(|e| PipelineError::ExtractionFailed {
        path: path.to_path_buf(),
        message: format!("failed to open workbook: {}", e),
    })?;

    let sheet_names: Vec<String> = workbook.sheet_names().to_vec();
    if sheet_names.is_empty() {
        return Err(PipelineError::ExtractionFailed {
            path: path.to_path_buf(),
            message: "workbook contains no sheets".to_string(),
        });
    }

    let sheet_name = choose_sheet(&sheet_names);
    debug!("📊 spreadsheet {}: using sheet '{}'", path.display(), sheet_name);

    let range = workbook
        .worksheet_range(&sheet_name)
        .map_err(|e| PipelineError::ExtractionFailed {
            path: path.to_path_buf(),
            message: format!("failed to read sheet '{}': {}", sheet_name, e),
        })?;

    let mut rows: Vec<Vec<String>> = Vec::new();
    for row in range.rows() {
        let cells: Vec<String> = row.iter().map(cell_to_string).collect();
        if cells.iter().all(|c| c.trim().is_empty()) {
            continue;
        }
        rows.push(cells);
    }

    if rows.is_empty() {
        return Err(PipelineError::ExtractionFailed {
            path: path.to_path_buf(),
            message: format!("sheet '{}' has no data rows", sheet_name),
        });
    }

    let sample_text = rows
        .iter()
        .take(sample_lines)
        .map(|cells| cells.join("\t"))
        .collect::<Vec<_>>()
        .join("\n");

    Ok(TableContent {
        rows,
        delimiter: None,
        encoding: "native".to_string(),
        method: "spreadsheet".to_string(),
        sample: truncate_chars(&sample_text, sample_chars),
    })
}

/// Prefer a sheet whose name suggests bank movements, else the first one.
fn choose_sheet(names: &[String]) -> String {
    names
        .iter()
        .find(|name| {
            let lowered = name.to_lowercase();
            SHEET_NAME_HINTS.iter().any(|hint| lowered.contains(hint))
        })
        .unwrap_or(&names[0])
        .clone()
}

fn cell_to_string(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.clone(),
        Data::Float(f) => {
            if f.fract() == 0.0 && f.abs() < 1e15 {
                format!("{}", *f as i64)
            } else {
                format!("{}", f)
            }
        }
        Data::Int(i) => i.to_string(),
        Data::Bool(b) => b.to_string(),
        Data::DateTime(dt) => match dt.as_datetime() {
            Some(naive) => {
                if naive.time() == chrono::NaiveTime::MIN {
                    naive.date().format("%Y-%m-%d").to_string()
                } else {
                    naive.format("%Y-%m-%d %H:%M:%S").to_string()
                }
            }
            None => format!("{}", dt.as_f64()),
        },
        Data::DateTimeIso(s) | Data::DurationIso(s) => s.clone(),
        Data::Error(_) => String::new(),
    }
}
