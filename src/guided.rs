//! Guided extraction: re-read the extracted content under the structure plan
//! and emit raw transaction candidates.
//!
//! Row-level problems (missing date, missing amount, zero debit and credit)
//! skip the row and keep going. Only content-level mismatches abort.

use crate::app::ports::ClassifierPort;
use crate::common::error::{PipelineError, Result};
use crate::domain::RawRecord;
use crate::ingest::{ExtractedContent, TableContent};
use crate::interpret::{AmountColumns, ColumnMap, StructurePlan};
use crate::normalize;
use tracing::{debug, info, warn};

/// Produce raw records for the plan. `source_row` is the 1-based position in
/// the original content so review messages can point at the right line.
pub async fn extract_candidates(
    content: &ExtractedContent,
    plan: &StructurePlan,
    classifier: &dyn ClassifierPort,
) -> Result<Vec<RawRecord>> {
    match (plan, content) {
        (StructurePlan::Standard, ExtractedContent::Records(records)) => Ok(records.clone()),
        (StructurePlan::Mapped(map), ExtractedContent::Table(table)) => {
            Ok(from_table(table, map))
        }
        (StructurePlan::Freeform, ExtractedContent::Text(text)) => {
            match classifier.extract_transactions(&text.full).await {
                Ok(records) => {
                    info!("📄 freeform extraction produced {} candidates", records.len());
                    Ok(records)
                }
                Err(e) => {
                    warn!("⚠️ freeform extraction failed: {}", e);
                    Ok(Vec::new())
                }
            }
        }
        (plan, content) => Err(PipelineError::StructureUndetected {
            message: format!(
                "plan {:?} does not apply to {} content",
                plan,
                content.kind()
            ),
        }),
    }
}

fn from_table(table: &TableContent, map: &ColumnMap) -> Vec<RawRecord> {
    let mut records = Vec::new();
    let skip = usize::from(map.has_header);

    for (i, row) in table.rows.iter().enumerate().skip(skip) {
        let source_row = i + 1;
        let date = cell(row, map.date);
        if date.is_empty() {
            debug!("row {} skipped: empty date", source_row);
            continue;
        }

        let amount = match map.amounts {
            AmountColumns::Single(col) => {
                let raw = cell(row, col);
                if raw.is_empty() {
                    debug!("row {} skipped: empty amount", source_row);
                    continue;
                }
                raw.to_string()
            }
            AmountColumns::DebitCredit { debit, credit } => {
                match signed_from_pair(cell(row, debit), cell(row, credit)) {
                    Some(signed) => signed,
                    None => {
                        debug!("row {} skipped: no debit or credit movement", source_row);
                        continue;
                    }
                }
            }
        };

        let reference = map
            .reference
            .map(|col| cell(row, col))
            .filter(|r| !r.is_empty())
            .map(str::to_string);

        records.push(RawRecord {
            date: date.to_string(),
            description: cell(row, map.description).to_string(),
            amount,
            reference,
            source_row: Some(source_row),
            extracted_by: table.method.clone(),
        });
    }

    records
}

/// Collapse a debit/credit pair into one signed amount string. Debit wins
/// when both carry a value; a pair with no movement yields None.
fn signed_from_pair(debit_raw: &str, credit_raw: &str) -> Option<String> {
    let debit = parse_lenient(debit_raw);
    let credit = parse_lenient(credit_raw);
    if debit != 0.0 {
        Some(format!("{:.2}", -debit.abs()))
    } else if credit != 0.0 {
        Some(format!("{:.2}", credit))
    } else {
        None
    }
}

fn parse_lenient(raw: &str) -> f64 {
    if raw.trim().is_empty() {
        return 0.0;
    }
    normalize::parse_amount(raw).unwrap_or(0.0)
}

fn cell(row: &[String], index: usize) -> &str {
    row.get(index).map(|c| c.trim()).unwrap_or("")
}
