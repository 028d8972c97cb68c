//! OFX extractor. The format is SGML-ish and banks rarely close tags, so
//! parsing is a tolerant tag scan per `<STMTTRN>` block rather than a
//! strict document parse. No structure interpretation is ever needed here.

use super::decode_bytes;
use crate::common::error::{PipelineError, Result};
use crate::domain::RawRecord;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

static TAG_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)<(DTPOSTED|TRNAMT|MEMO|NAME|FITID)>([^<\r\n]*)").unwrap()
});

pub fn extract(path: &Path) -> Result<Vec<RawRecord>> {
    let bytes = fs::read(path).map_err(|e| PipelineError::ExtractionFailed {
        path: path.to_path_buf(),
        message: format!("read failed: {}", e),
    })?;
    let (text, _) = decode_bytes(&bytes);

    let upper = text.to_uppercase();
    if !upper.contains("<OFX") && !upper.contains("OFXHEADER") {
        return Err(PipelineError::ExtractionFailed {
            path: path.to_path_buf(),
            message: "missing OFX markers".to_string(),
        });
    }

    let mut records = Vec::new();
    for (index, block) in text.split("<STMTTRN>").skip(1).enumerate() {
        let body = block.split("</STMTTRN>").next().unwrap_or(block);

        let mut tags: HashMap<String, String> = HashMap::new();
        for capture in TAG_RE.captures_iter(body) {
            let tag = capture[1].to_uppercase();
            let value = capture[2].trim().to_string();
            tags.entry(tag).or_insert(value);
        }
        if tags.is_empty() {
            continue;
        }

        let date = tags
            .get("DTPOSTED")
            .map(|raw| format_posted_date(raw))
            .unwrap_or_default();
        let amount = tags.get("TRNAMT").cloned().unwrap_or_default();
        let description = tags
            .get("MEMO")
            .filter(|memo| !memo.is_empty())
            .or_else(|| tags.get("NAME"))
            .cloned()
            .unwrap_or_default();
        let reference = tags.get("FITID").filter(|id| !id.is_empty()).cloned();

        records.push(RawRecord {
            date,
            description,
            amount,
            reference,
            source_row: Some(index + 1),
            extracted_by: "exchange".to_string(),
        });
    }

    if records.is_empty() {
        return Err(PipelineError::ExtractionFailed {
            path: path.to_path_buf(),
            message: "no transactions found".to_string(),
        });
    }

    Ok(records)
}

/// DTPOSTED carries `YYYYMMDD` with optional time and timezone suffixes.
/// The fixed schema lets us canonicalize to ISO right away.
fn format_posted_date(raw: &str) -> String {
    let digits: String = raw.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.len() >= 8 {
        format!("{}-{}-{}", &digits[0..4], &digits[4..6], &digits[6..8])
    } else {
        raw.trim().to_string()
    }
}
