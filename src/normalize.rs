//! Validation and normalization of raw candidates.
//!
//! Record-level failures never abort the batch; each one becomes a
//! `RecordError` carried alongside the survivors.

use crate::common::error::{PipelineError, Result};
use crate::domain::{NormalizedRecord, RawRecord, RecordError};
use chrono::{Datelike, NaiveDate};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info};

const DATE_FORMATS: [&str; 5] = ["%Y-%m-%d", "%d/%m/%Y", "%d-%m-%Y", "%d.%m.%Y", "%Y/%m/%d"];

static CURRENCY_CODE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(EUR|USD|GBP)\b").expect("currency code regex"));

static LOOSE_DATE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{1,4})[/\-.](\d{1,2})[/\-.](\d{1,4})$").expect("loose date regex"));

/// Parse a raw amount string into a signed value.
///
/// Currency symbols, ISO currency codes and whitespace are stripped first.
/// With both separators present, whichever appears later is the decimal
/// mark. A lone comma is a decimal mark only when it sits within the last
/// three characters; otherwise it groups thousands. A lone dot parses as
/// written.
pub fn parse_amount(raw: &str) -> Result<f64> {
    let stripped = CURRENCY_CODE_RE.replace_all(raw, "");
    let cleaned: String = stripped
        .chars()
        .filter(|c| !c.is_whitespace() && !matches!(c, '€' | '$' | '£'))
        .collect();
    if cleaned.is_empty() {
        return Err(PipelineError::RecordValidation {
            message: format!("empty amount '{}'", raw),
        });
    }

    let normalized = match (cleaned.rfind('.'), cleaned.rfind(',')) {
        (Some(dot), Some(comma)) => {
            if comma > dot {
                cleaned.replace('.', "").replace(',', ".")
            } else {
                cleaned.replace(',', "")
            }
        }
        (None, Some(comma)) => {
            if cleaned.len() - comma <= 3 {
                let (head, tail) = cleaned.split_at(comma);
                format!("{}.{}", head.replace(',', ""), &tail[1..])
            } else {
                cleaned.replace(',', "")
            }
        }
        _ => cleaned,
    };

    normalized.parse::<f64>().map_err(|_| PipelineError::RecordValidation {
        message: format!("unparseable amount '{}'", raw),
    })
}

/// Parse a raw date string. Known formats are tried in order; a trailing
/// time component is dropped; the last resort is a separator-agnostic match
/// that infers field order from where the 4-digit year sits.
pub fn parse_date(raw: &str) -> Result<NaiveDate> {
    let trimmed = raw.trim();
    if let Some(date) = parse_date_token(trimmed) {
        return Ok(date);
    }
    if let Some(first) = trimmed.split_whitespace().next() {
        if first != trimmed {
            if let Some(date) = parse_date_token(first) {
                return Ok(date);
            }
        }
    }
    Err(PipelineError::RecordValidation {
        message: format!("unparseable date '{}'", raw),
    })
}

fn parse_date_token(token: &str) -> Option<NaiveDate> {
    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(token, format) {
            // chrono's %Y accepts "24" as year 24. Two-digit years are
            // ambiguous; never guess a century.
            if date.year() >= 1000 {
                return Some(date);
            }
        }
    }

    let caps = LOOSE_DATE_RE.captures(token)?;
    let (a, b, c) = (&caps[1], &caps[2], &caps[3]);
    let (year, month, day) = if a.len() == 4 {
        (a, b, c)
    } else if c.len() == 4 {
        (c, b, a)
    } else {
        return None;
    };
    NaiveDate::from_ymd_opt(
        year.parse().ok()?,
        month.parse().ok()?,
        day.parse().ok()?,
    )
}

/// Trim and collapse internal whitespace runs to single spaces.
pub fn clean_text(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Normalize a batch of candidates, splitting survivors from rejects.
pub fn normalize_batch(candidates: &[RawRecord]) -> (Vec<NormalizedRecord>, Vec<RecordError>) {
    let mut records = Vec::with_capacity(candidates.len());
    let mut errors = Vec::new();

    for raw in candidates {
        match normalize_one(raw) {
            Ok(record) => records.push(record),
            Err(e) => {
                debug!("record rejected: {}", e);
                errors.push(RecordError {
                    source_row: raw.source_row,
                    input: format!("{} | {} | {}", raw.date, raw.description, raw.amount),
                    message: e.to_string(),
                });
            }
        }
    }

    info!("✅ normalized {} records ({} rejected)", records.len(), errors.len());
    (records, errors)
}

fn normalize_one(raw: &RawRecord) -> Result<NormalizedRecord> {
    let date = parse_date(&raw.date)?;
    let amount = parse_amount(&raw.amount)?;
    let description = clean_text(&raw.description);
    if description.is_empty() {
        return Err(PipelineError::RecordValidation {
            message: "empty description".to_string(),
        });
    }
    let reference = raw
        .reference
        .as_deref()
        .map(clean_text)
        .filter(|r| !r.is_empty());

    Ok(NormalizedRecord::new(
        date,
        amount,
        description,
        reference,
        raw.source_row,
        raw.extracted_by.clone(),
    ))
}
