//! Offline classifier. Keyword lookups and hashed embeddings keep the whole
//! pipeline runnable with no network and no API key; capabilities that only
//! make sense against a real model backend return errors and let callers
//! degrade the way they would on an outage.

use crate::app::ports::{CategoryJudgment, ClassifierPort, StructureHypothesis};
use crate::common::error::{PipelineError, Result};
use crate::domain::RawRecord;
use async_trait::async_trait;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

const EMBEDDING_DIM: usize = 64;

/// Spanish general chart of accounts, the slice bank movements land in.
pub const CATEGORY_CATALOG: &[(&str, &str)] = &[
    ("600", "Compras de mercaderías"),
    ("621", "Arrendamientos y cánones"),
    ("625", "Primas de seguros"),
    ("626", "Servicios bancarios y similares"),
    ("628", "Suministros"),
    ("629", "Otros servicios"),
    ("640", "Sueldos y salarios"),
    ("662", "Intereses de deudas"),
    ("678", "Gastos excepcionales"),
    ("700", "Ventas de mercaderías"),
    ("705", "Prestaciones de servicios"),
    ("769", "Otros ingresos financieros"),
];

pub fn category_name(code: &str) -> Option<&'static str> {
    CATEGORY_CATALOG
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, name)| *name)
}

const KEYWORD_RULES: &[(&[&str], &str, f64)] = &[
    (&["iberdrola", "endesa", "naturgy", "luz", "agua", "gas"], "628", 0.9),
    (&["nomina", "payroll"], "640", 0.86),
    (&["seguro", "mapfre", "axa"], "625", 0.85),
    (&["comision", "mantenimiento"], "626", 0.85),
    (&["amazon", "compra"], "600", 0.8),
    (&["alquiler", "arrendamiento"], "621", 0.8),
    (&["interes", "intereses"], "662", 0.8),
];

#[derive(Debug, Default, Clone)]
pub struct StubClassifier;

impl StubClassifier {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ClassifierPort for StubClassifier {
    async fn classify(&self, description: &str, amount: f64) -> Result<CategoryJudgment> {
        let lowered = description.to_lowercase();

        if lowered.contains("transferencia") && amount > 0.0 {
            return Ok(CategoryJudgment {
                category: "700".to_string(),
                confidence: 0.8,
                rationale: Some("offline match: incoming transfer".to_string()),
            });
        }

        for (keywords, category, confidence) in KEYWORD_RULES {
            if let Some(keyword) = keywords.iter().find(|k| lowered.contains(*k)) {
                return Ok(CategoryJudgment {
                    category: (*category).to_string(),
                    confidence: *confidence,
                    rationale: Some(format!("offline match: '{}'", keyword)),
                });
            }
        }

        Ok(CategoryJudgment {
            category: "629".to_string(),
            confidence: 0.5,
            rationale: Some("offline classifier has no match for this description".to_string()),
        })
    }

    async fn interpret_structure(&self, _sample: &str) -> Result<StructureHypothesis> {
        Err(PipelineError::ExternalService {
            message: "structure hypothesis requires the http provider".to_string(),
        })
    }

    async fn transcribe(
        &self,
        filename: &str,
        _media_type: &str,
        _bytes: &[u8],
    ) -> Result<String> {
        Err(PipelineError::ExternalService {
            message: format!(
                "transcribing '{}' requires the http provider",
                filename
            ),
        })
    }

    async fn extract_transactions(&self, _text: &str) -> Result<Vec<RawRecord>> {
        Ok(Vec::new())
    }

    /// Token-bucket embedding: every lowercase token adds weight to one of
    /// 64 hashed buckets, then the vector is L2-normalized. Texts sharing
    /// tokens land close together, which is all reconciliation needs.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| token_vector(t)).collect())
    }
}

fn token_vector(text: &str) -> Vec<f32> {
    let mut vector = vec![0.0f32; EMBEDDING_DIM];
    for token in text.to_lowercase().split_whitespace() {
        let mut hasher = DefaultHasher::new();
        token.hash(&mut hasher);
        vector[(hasher.finish() % EMBEDDING_DIM as u64) as usize] += 1.0;
    }
    let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for value in &mut vector {
            *value /= norm;
        }
    }
    vector
}
