//! Structure interpreter: turns a bounded text sample into a column map.
//!
//! The external hypothesis is untrusted input. Anything unusable (a failed
//! call, broken indices, missing required kinds) degrades to the keyword
//! heuristic over the header row; only when both paths fail does the file
//! (not the run) error out.

use crate::app::ports::{ClassifierPort, ColumnGuess, StructureHypothesis};
use crate::common::error::{PipelineError, Result};
use crate::ingest::ExtractedContent;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{info, warn};

const DATE_KEYWORDS: [&str; 7] = [
    "fecha",
    "date",
    "fec",
    "f.valor",
    "f. valor",
    "f.operacion",
    "datetime",
];
const DESCRIPTION_KEYWORDS: [&str; 6] = [
    "concepto",
    "descripcion",
    "description",
    "desc",
    "detalle",
    "observaciones",
];
const AMOUNT_KEYWORDS: [&str; 7] = [
    "importe", "amount", "monto", "cantidad", "valor", "debe", "haber",
];
const REFERENCE_KEYWORDS: [&str; 5] = ["referencia", "reference", "ref", "num", "numero"];

const DEBIT_KEYWORDS: [&str; 3] = ["debe", "cargo", "debit"];
const CREDIT_KEYWORDS: [&str; 3] = ["haber", "abono", "credit"];

/// Where the winning column map came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MapOrigin {
    External,
    Keywords,
}

/// One or two amount columns. Two means a debit/credit pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AmountColumns {
    Single(usize),
    DebitCredit { debit: usize, credit: usize },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnMap {
    pub has_header: bool,
    pub date: usize,
    pub description: usize,
    pub amounts: AmountColumns,
    pub reference: Option<usize>,
    pub origin: MapOrigin,
}

/// How the guided extractor should re-read the source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StructurePlan {
    /// Records were already parsed against a fixed schema.
    Standard,
    /// Tabular content with an identified column layout.
    Mapped(ColumnMap),
    /// Free text; transactions come from the external capability.
    Freeform,
}

impl StructurePlan {
    pub fn describe(&self) -> String {
        match self {
            StructurePlan::Standard => "standard: true".to_string(),
            StructurePlan::Freeform => "freeform text".to_string(),
            StructurePlan::Mapped(map) => {
                let amounts = match map.amounts {
                    AmountColumns::Single(i) => format!("amount={}", i),
                    AmountColumns::DebitCredit { debit, credit } => {
                        format!("debit={}, credit={}", debit, credit)
                    }
                };
                format!(
                    "header={}, date={}, description={}, {}, reference={:?} ({:?})",
                    map.has_header, map.date, map.description, amounts, map.reference, map.origin
                )
            }
        }
    }
}

/// Derive a plan for the extracted content. Never raises for tabular input
/// unless both interpretation paths come up empty.
pub async fn interpret(
    content: &ExtractedContent,
    classifier: &dyn ClassifierPort,
) -> Result<StructurePlan> {
    let table = match content {
        ExtractedContent::Records(_) => return Ok(StructurePlan::Standard),
        ExtractedContent::Text(_) => return Ok(StructurePlan::Freeform),
        ExtractedContent::Table(table) => table,
    };

    let width = table.rows.iter().map(Vec::len).max().unwrap_or(0);

    match classifier.interpret_structure(&table.sample).await {
        Ok(hypothesis) => {
            if let Some(map) = map_from_hypothesis(&hypothesis, width) {
                info!("🧭 structure from external hypothesis: {:?}", map);
                return Ok(StructurePlan::Mapped(map));
            }
            warn!("🤔 structure hypothesis unusable, trying header keywords");
        }
        Err(e) => {
            warn!("⚠️ structure interpretation call failed ({}), trying header keywords", e);
        }
    }

    let header = table.rows.first().ok_or_else(|| PipelineError::StructureUndetected {
        message: "table has no rows".to_string(),
    })?;

    match keyword_map(header) {
        Some(map) => {
            info!("🧭 structure from header keywords: {:?}", map);
            Ok(StructurePlan::Mapped(map))
        }
        None => Err(PipelineError::StructureUndetected {
            message:
                "neither the external hypothesis nor header keywords identified date, description and amount columns"
                    .to_string(),
        }),
    }
}

/// Validate an untrusted hypothesis into a column map. Indices must fit the
/// table, required kinds must be present, and no column may be claimed twice.
pub fn map_from_hypothesis(hypothesis: &StructureHypothesis, width: usize) -> Option<ColumnMap> {
    let usable: Vec<&ColumnGuess> = hypothesis
        .columns
        .iter()
        .filter(|c| c.index < width)
        .collect();

    let mut used: HashSet<usize> = HashSet::new();

    let date = usable
        .iter()
        .find(|c| kind_is(&c.kind, &["date", "fecha"]))
        .map(|c| c.index)?;
    used.insert(date);

    let description = usable
        .iter()
        .find(|c| kind_is(&c.kind, &["text", "texto", "string"]) && !used.contains(&c.index))
        .map(|c| c.index)?;
    used.insert(description);

    let numbers: Vec<&&ColumnGuess> = usable
        .iter()
        .filter(|c| {
            kind_is(&c.kind, &["number", "numero", "numeric", "amount", "importe"])
                && !used.contains(&c.index)
        })
        .collect();
    let amounts = match numbers.len() {
        0 => return None,
        1 => AmountColumns::Single(numbers[0].index),
        _ => pair_debit_credit(
            numbers[0].index,
            numbers[0].name.as_deref(),
            numbers[1].index,
            numbers[1].name.as_deref(),
        ),
    };
    match amounts {
        AmountColumns::Single(i) => {
            used.insert(i);
        }
        AmountColumns::DebitCredit { debit, credit } => {
            used.insert(debit);
            used.insert(credit);
        }
    }

    let reference = usable
        .iter()
        .find(|c| {
            kind_is(&c.kind, &["reference", "referencia", "ref"]) && !used.contains(&c.index)
        })
        .map(|c| c.index);

    Some(ColumnMap {
        has_header: hypothesis.has_header.unwrap_or(true),
        date,
        description,
        amounts,
        reference,
        origin: MapOrigin::External,
    })
}

/// Header-keyword fallback: case-insensitive substring match, first match
/// per type wins, scanning left to right. Each column is claimed once.
pub fn keyword_map(header: &[String]) -> Option<ColumnMap> {
    let lowered: Vec<String> = header.iter().map(|h| h.trim().to_lowercase()).collect();
    let mut used: HashSet<usize> = HashSet::new();

    let date = claim(&lowered, &mut used, &DATE_KEYWORDS)?;
    let description = claim(&lowered, &mut used, &DESCRIPTION_KEYWORDS)?;

    let amount_cols: Vec<usize> = (0..lowered.len())
        .filter(|i| !used.contains(i))
        .filter(|&i| AMOUNT_KEYWORDS.iter().any(|kw| lowered[i].contains(kw)))
        .collect();
    if amount_cols.is_empty() {
        return None;
    }
    let debit = amount_cols
        .iter()
        .copied()
        .find(|&i| DEBIT_KEYWORDS.iter().any(|kw| lowered[i].contains(kw)));
    let credit = amount_cols
        .iter()
        .copied()
        .find(|&i| CREDIT_KEYWORDS.iter().any(|kw| lowered[i].contains(kw)));
    let amounts = match (debit, credit) {
        (Some(debit), Some(credit)) if debit != credit => {
            used.insert(debit);
            used.insert(credit);
            AmountColumns::DebitCredit { debit, credit }
        }
        _ => {
            used.insert(amount_cols[0]);
            AmountColumns::Single(amount_cols[0])
        }
    };

    let reference = claim(&lowered, &mut used, &REFERENCE_KEYWORDS);

    Some(ColumnMap {
        has_header: true,
        date,
        description,
        amounts,
        reference,
        origin: MapOrigin::Keywords,
    })
}

fn claim(lowered: &[String], used: &mut HashSet<usize>, keywords: &[&str]) -> Option<usize> {
    let found = (0..lowered.len())
        .filter(|i| !used.contains(i))
        .find(|&i| keywords.iter().any(|kw| lowered[i].contains(kw)))?;
    used.insert(found);
    Some(found)
}

fn kind_is(kind: &str, accepted: &[&str]) -> bool {
    let kind = kind.trim().to_lowercase();
    accepted.iter().any(|a| kind == *a)
}

fn pair_debit_credit(
    first: usize,
    first_name: Option<&str>,
    second: usize,
    second_name: Option<&str>,
) -> AmountColumns {
    let names = [
        (first, first_name.unwrap_or("").to_lowercase()),
        (second, second_name.unwrap_or("").to_lowercase()),
    ];
    let debit = names
        .iter()
        .find(|(_, name)| DEBIT_KEYWORDS.iter().any(|kw| name.contains(kw)))
        .map(|(i, _)| *i);
    let credit = names
        .iter()
        .find(|(_, name)| CREDIT_KEYWORDS.iter().any(|kw| name.contains(kw)))
        .map(|(i, _)| *i);

    match (debit, credit) {
        (Some(debit), Some(credit)) if debit != credit => {
            AmountColumns::DebitCredit { debit, credit }
        }
        (Some(debit), None) => AmountColumns::DebitCredit {
            debit,
            credit: if debit == first { second } else { first },
        },
        (None, Some(credit)) => AmountColumns::DebitCredit {
            debit: if credit == first { second } else { first },
            credit,
        },
        // No names to go by: positional convention, debit first.
        _ => AmountColumns::DebitCredit {
            debit: first,
            credit: second,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::ports::CategoryJudgment;
    use crate::domain::RawRecord;
    use crate::ingest::TableContent;
    use async_trait::async_trait;

    struct NoHypothesis;

    #[async_trait]
    impl ClassifierPort for NoHypothesis {
        async fn classify(&self, _description: &str, _amount: f64) -> Result<CategoryJudgment> {
            Err(PipelineError::ExternalService {
                message: "unavailable".to_string(),
            })
        }

        async fn interpret_structure(&self, _sample: &str) -> Result<StructureHypothesis> {
            Err(PipelineError::ExternalService {
                message: "unavailable".to_string(),
            })
        }

        async fn transcribe(
            &self,
            _filename: &str,
            _media_type: &str,
            _bytes: &[u8],
        ) -> Result<String> {
            Err(PipelineError::ExternalService {
                message: "unavailable".to_string(),
            })
        }

        async fn extract_transactions(&self, _text: &str) -> Result<Vec<RawRecord>> {
            Ok(Vec::new())
        }

        async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(Vec::new())
        }
    }

    fn header(cells: &[&str]) -> Vec<String> {
        cells.iter().map(|c| c.to_string()).collect()
    }

    fn table_of(rows: Vec<Vec<String>>) -> ExtractedContent {
        ExtractedContent::Table(TableContent {
            sample: rows
                .iter()
                .map(|r| r.join(";"))
                .collect::<Vec<_>>()
                .join("\n"),
            rows,
            delimiter: Some(';'),
            encoding: "utf-8".to_string(),
            method: "delimited".to_string(),
        })
    }

    #[tokio::test]
    async fn failed_hypothesis_degrades_to_keywords() {
        let content = table_of(vec![
            header(&["Fecha", "Concepto", "Importe"]),
            header(&["15/12/2024", "NOMINA EMPRESA", "2500,00"]),
        ]);
        let plan = interpret(&content, &NoHypothesis).await.unwrap();
        match plan {
            StructurePlan::Mapped(map) => {
                assert_eq!(map.origin, MapOrigin::Keywords);
                assert_eq!(map.date, 0);
            }
            other => panic!("expected mapped plan, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn undetectable_structure_is_an_error() {
        let content = table_of(vec![
            header(&["aaa", "bbb"]),
            header(&["ccc", "ddd"]),
        ]);
        let err = interpret(&content, &NoHypothesis).await.unwrap_err();
        assert!(matches!(err, PipelineError::StructureUndetected { .. }));
    }

    #[test]
    fn keyword_fallback_maps_spanish_header() {
        let map = keyword_map(&header(&["Fecha", "Concepto", "Importe"])).unwrap();
        assert_eq!(map.date, 0);
        assert_eq!(map.description, 1);
        assert_eq!(map.amounts, AmountColumns::Single(2));
        assert_eq!(map.reference, None);
        assert_eq!(map.origin, MapOrigin::Keywords);
        assert!(map.has_header);
    }

    #[test]
    fn keyword_fallback_detects_debit_credit_pair() {
        let map = keyword_map(&header(&["Fecha", "Concepto", "Debe", "Haber", "Ref"])).unwrap();
        assert_eq!(
            map.amounts,
            AmountColumns::DebitCredit { debit: 2, credit: 3 }
        );
        assert_eq!(map.reference, Some(4));
    }

    #[test]
    fn value_date_column_is_not_stolen_by_amount_keywords() {
        // "F.Valor" matches a date keyword and contains "valor"; claiming it
        // for dates first must leave "Importe" as the amount column.
        let map = keyword_map(&header(&["F.Valor", "Concepto", "Importe"])).unwrap();
        assert_eq!(map.date, 0);
        assert_eq!(map.amounts, AmountColumns::Single(2));
    }

    #[test]
    fn header_without_amounts_is_unmapped() {
        assert!(keyword_map(&header(&["Fecha", "Concepto", "Notas"])).is_none());
        assert!(keyword_map(&header(&["15/12/2024", "PAGO", "-45,99"])).is_none());
    }

    #[test]
    fn hypothesis_with_valid_columns_maps() {
        let hypothesis = StructureHypothesis {
            has_header: Some(true),
            delimiter: Some(";".to_string()),
            columns: vec![
                ColumnGuess {
                    index: 0,
                    name: Some("Fecha".to_string()),
                    kind: "fecha".to_string(),
                    example: Some("15/12/2024".to_string()),
                },
                ColumnGuess {
                    index: 1,
                    name: Some("Concepto".to_string()),
                    kind: "texto".to_string(),
                    example: None,
                },
                ColumnGuess {
                    index: 2,
                    name: Some("Importe".to_string()),
                    kind: "numero".to_string(),
                    example: Some("-45,99".to_string()),
                },
            ],
            notes: None,
        };
        let map = map_from_hypothesis(&hypothesis, 3).unwrap();
        assert_eq!(map.date, 0);
        assert_eq!(map.description, 1);
        assert_eq!(map.amounts, AmountColumns::Single(2));
        assert_eq!(map.origin, MapOrigin::External);
    }

    #[test]
    fn hypothesis_with_out_of_range_indices_is_rejected() {
        let hypothesis = StructureHypothesis {
            has_header: Some(true),
            delimiter: None,
            columns: vec![
                ColumnGuess {
                    index: 7,
                    name: None,
                    kind: "date".to_string(),
                    example: None,
                },
                ColumnGuess {
                    index: 8,
                    name: None,
                    kind: "text".to_string(),
                    example: None,
                },
            ],
            notes: None,
        };
        assert!(map_from_hypothesis(&hypothesis, 3).is_none());
    }

    #[test]
    fn hypothesis_debit_credit_pairs_by_name() {
        let hypothesis = StructureHypothesis {
            has_header: Some(true),
            delimiter: None,
            columns: vec![
                ColumnGuess {
                    index: 0,
                    name: None,
                    kind: "date".to_string(),
                    example: None,
                },
                ColumnGuess {
                    index: 1,
                    name: None,
                    kind: "text".to_string(),
                    example: None,
                },
                ColumnGuess {
                    index: 2,
                    name: Some("Haber".to_string()),
                    kind: "number".to_string(),
                    example: None,
                },
                ColumnGuess {
                    index: 3,
                    name: Some("Debe".to_string()),
                    kind: "number".to_string(),
                    example: None,
                },
            ],
            notes: None,
        };
        let map = map_from_hypothesis(&hypothesis, 4).unwrap();
        assert_eq!(
            map.amounts,
            AmountColumns::DebitCredit { debit: 3, credit: 2 }
        );
    }
}
