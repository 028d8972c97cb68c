//! OpenAI-style HTTP adapter for the external classifier capabilities.
//!
//! Chat completions carry classification, structure hypotheses, document
//! transcription and freeform extraction; the embeddings endpoint backs
//! approximate reconciliation. Model output is treated as untrusted: JSON is
//! dug out of whatever prose or fencing surrounds it, and anything that
//! still fails to parse is an `ExternalService` error for the caller to
//! degrade on.

use crate::app::ports::{CategoryJudgment, ClassifierPort, StructureHypothesis};
use crate::common::error::{PipelineError, Result};
use crate::config::ExternalConfig;
use crate::domain::RawRecord;
use crate::observability::metrics as obs;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::warn;

pub struct HttpClassifier {
    client: reqwest::Client,
    base_url: String,
    model: String,
    embedding_model: String,
    api_key: String,
    max_attempts: u32,
    transcription_max_tokens: u32,
}

impl HttpClassifier {
    pub fn new(config: &ExternalConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env).map_err(|_| PipelineError::Config {
            message: format!(
                "environment variable {} is not set (required by the http provider)",
                config.api_key_env
            ),
        })?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| PipelineError::ExternalService {
                message: format!("failed to build http client: {}", e),
            })?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            embedding_model: config.embedding_model.clone(),
            api_key,
            max_attempts: config.max_attempts.max(1),
            transcription_max_tokens: config.transcription_max_tokens,
        })
    }

    async fn chat(&self, messages: Value, max_tokens: Option<u32>) -> Result<String> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "temperature": 0,
        });
        if let Some(max_tokens) = max_tokens {
            body["max_tokens"] = max_tokens.into();
        }

        let response = self.post_with_retry(&url, &body).await;
        obs::external_call("chat", response.is_ok());
        let response = response?;

        response["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| PipelineError::ExternalService {
                message: "chat response has no message content".to_string(),
            })
    }

    /// Exponential backoff between attempts. Client errors other than 429
    /// fail fast; nothing about a bad request improves with retries.
    async fn post_with_retry(&self, url: &str, body: &Value) -> Result<Value> {
        let mut delay = Duration::from_secs(1);
        let mut last_error = String::new();

        for attempt in 1..=self.max_attempts {
            match self
                .client
                .post(url)
                .bearer_auth(&self.api_key)
                .json(body)
                .send()
                .await
            {
                Ok(response) if response.status().is_success() => {
                    return response.json::<Value>().await.map_err(|e| {
                        PipelineError::ExternalService {
                            message: format!("malformed response body: {}", e),
                        }
                    });
                }
                Ok(response) => {
                    let status = response.status();
                    last_error = format!("http {}", status);
                    if status.is_client_error()
                        && status != reqwest::StatusCode::TOO_MANY_REQUESTS
                    {
                        break;
                    }
                }
                Err(e) => last_error = e.to_string(),
            }

            if attempt < self.max_attempts {
                warn!(
                    "⚠️ call to {} failed ({}), attempt {}/{}, backing off {:?}",
                    url, last_error, attempt, self.max_attempts, delay
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
        }

        Err(PipelineError::ExternalService {
            message: format!("request to {} failed: {}", url, last_error),
        })
    }
}

#[async_trait]
impl ClassifierPort for HttpClassifier {
    async fn classify(&self, description: &str, amount: f64) -> Result<CategoryJudgment> {
        let messages = json!([
            {
                "role": "system",
                "content": "You classify bank account movements into Spanish general \
                            chart of accounts codes (e.g. 600, 628, 629, 640, 700). \
                            Reply with JSON only: \
                            {\"category\": \"<code>\", \"confidence\": <0.0-1.0>, \"rationale\": \"<short reason>\"}"
            },
            {
                "role": "user",
                "content": format!("Description: {}\nAmount: {:.2}", description, amount)
            }
        ]);
        let content = self.chat(messages, None).await?;
        let payload: JudgmentPayload = parse_model_json(&content)?;

        Ok(CategoryJudgment {
            category: payload.category,
            confidence: payload.confidence.clamp(0.0, 1.0),
            rationale: payload.rationale,
        })
    }

    async fn interpret_structure(&self, sample: &str) -> Result<StructureHypothesis> {
        let messages = json!([
            {
                "role": "system",
                "content": "You identify the column layout of bank statement exports. \
                            Reply with JSON only: \
                            {\"has_header\": <bool>, \"delimiter\": \"<char or null>\", \
                            \"columns\": [{\"index\": <0-based>, \"name\": \"<header or null>\", \
                            \"kind\": \"date|text|number|reference\", \"example\": \"<cell or null>\"}], \
                            \"notes\": \"<anything unusual>\"}"
            },
            { "role": "user", "content": sample }
        ]);
        let content = self.chat(messages, None).await?;
        parse_model_json(&content)
    }

    async fn transcribe(&self, filename: &str, media_type: &str, bytes: &[u8]) -> Result<String> {
        let data_url = format!("data:{};base64,{}", media_type, STANDARD.encode(bytes));
        let messages = json!([
            {
                "role": "user",
                "content": [
                    {
                        "type": "text",
                        "text": format!(
                            "Transcribe every transaction visible in this bank document ({}). \
                             Keep dates, descriptions and amounts exactly as printed, one movement per line.",
                            filename
                        )
                    },
                    { "type": "image_url", "image_url": { "url": data_url } }
                ]
            }
        ]);
        self.chat(messages, Some(self.transcription_max_tokens)).await
    }

    async fn extract_transactions(&self, text: &str) -> Result<Vec<RawRecord>> {
        let messages = json!([
            {
                "role": "system",
                "content": "You extract bank movements from transcribed statement text. \
                            Reply with a JSON array only: \
                            [{\"date\": \"<as printed>\", \"description\": \"<as printed>\", \
                            \"amount\": \"<signed, as printed>\", \"reference\": \"<or null>\"}]"
            },
            { "role": "user", "content": text }
        ]);
        let content = self.chat(messages, None).await?;
        let payloads: Vec<TransactionPayload> = parse_model_json(&content)?;

        Ok(payloads
            .into_iter()
            .map(|p| RawRecord {
                date: p.date,
                description: p.description,
                amount: value_to_amount_string(&p.amount),
                reference: p.reference.filter(|r| !r.trim().is_empty()),
                source_row: None,
                extracted_by: "external".to_string(),
            })
            .collect())
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/embeddings", self.base_url);
        let body = json!({ "model": self.embedding_model, "input": texts });

        let response = self.post_with_retry(&url, &body).await;
        obs::external_call("embeddings", response.is_ok());
        let response = response?;

        let data = response["data"]
            .as_array()
            .ok_or_else(|| PipelineError::ExternalService {
                message: "embeddings response has no data array".to_string(),
            })?;
        let vectors: Vec<Vec<f32>> = data
            .iter()
            .map(|item| {
                item["embedding"]
                    .as_array()
                    .map(|values| {
                        values
                            .iter()
                            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
                            .collect()
                    })
                    .ok_or_else(|| PipelineError::ExternalService {
                        message: "embeddings item has no vector".to_string(),
                    })
            })
            .collect::<Result<_>>()?;

        if vectors.len() != texts.len() {
            return Err(PipelineError::ExternalService {
                message: format!(
                    "asked for {} embeddings, got {}",
                    texts.len(),
                    vectors.len()
                ),
            });
        }
        Ok(vectors)
    }
}

#[derive(Debug, Deserialize)]
struct JudgmentPayload {
    category: String,
    #[serde(default)]
    confidence: f64,
    #[serde(default)]
    rationale: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TransactionPayload {
    date: String,
    description: String,
    #[serde(default)]
    amount: Value,
    #[serde(default)]
    reference: Option<String>,
}

/// Models send amounts as strings or bare numbers depending on mood.
fn value_to_amount_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => String::new(),
    }
}

fn parse_model_json<T: serde::de::DeserializeOwned>(content: &str) -> Result<T> {
    let block = extract_json_block(content)?;
    serde_json::from_str(block).map_err(|e| PipelineError::ExternalService {
        message: format!("model returned unparseable JSON: {}", e),
    })
}

/// Dig the JSON block out of a model reply that may wrap it in markdown
/// fences or surrounding prose.
fn extract_json_block(response: &str) -> Result<&str> {
    let trimmed = response.trim();

    if let Some(start) = trimmed.find("```json") {
        let after_fence = &trimmed[start + 7..];
        if let Some(end) = after_fence.find("```") {
            return Ok(after_fence[..end].trim());
        }
    }

    if let Some(start) = trimmed.find("```") {
        let after_fence = &trimmed[start + 3..];
        if let Some(end) = after_fence.find("```") {
            let block = after_fence[..end].trim();
            if block.starts_with('{') || block.starts_with('[') {
                return Ok(block);
            }
        }
    }

    let object = trimmed
        .find('{')
        .zip(trimmed.rfind('}'))
        .filter(|(start, end)| start < end);
    let array = trimmed
        .find('[')
        .zip(trimmed.rfind(']'))
        .filter(|(start, end)| start < end);
    // Prefer whichever block opens first
    let block = match (object, array) {
        (Some(o), Some(a)) => Some(if o.0 < a.0 { o } else { a }),
        (Some(o), None) => Some(o),
        (None, Some(a)) => Some(a),
        (None, None) => None,
    };
    if let Some((start, end)) = block {
        return Ok(&trimmed[start..=end]);
    }

    Err(PipelineError::ExternalService {
        message: "no JSON block found in model response".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_block_survives_fences_and_prose() {
        let fenced = "Here you go:\n```json\n{\"category\": \"628\"}\n```";
        assert_eq!(extract_json_block(fenced).unwrap(), "{\"category\": \"628\"}");

        let bare_fence = "```\n[{\"date\": \"15/12/2024\"}]\n```";
        assert_eq!(
            extract_json_block(bare_fence).unwrap(),
            "[{\"date\": \"15/12/2024\"}]"
        );

        let prose = "The answer is {\"category\": \"629\", \"confidence\": 0.4} I think";
        assert_eq!(
            extract_json_block(prose).unwrap(),
            "{\"category\": \"629\", \"confidence\": 0.4}"
        );

        assert!(extract_json_block("no json here").is_err());
    }

    #[test]
    fn judgment_parses_with_and_without_rationale() {
        let full: JudgmentPayload =
            parse_model_json("{\"category\": \"628\", \"confidence\": 0.92, \"rationale\": \"utility\"}")
                .unwrap();
        assert_eq!(full.category, "628");
        assert_eq!(full.confidence, 0.92);

        let sparse: JudgmentPayload = parse_model_json("{\"category\": \"629\"}").unwrap();
        assert_eq!(sparse.confidence, 0.0);
        assert!(sparse.rationale.is_none());
    }

    #[test]
    fn transaction_amounts_accept_numbers_and_strings() {
        let body = r#"[
            {"date": "15/12/2024", "description": "NOMINA", "amount": 2500.0},
            {"date": "16/12/2024", "description": "COMPRA", "amount": "-45,99", "reference": " "}
        ]"#;
        let payloads: Vec<TransactionPayload> = parse_model_json(body).unwrap();
        assert_eq!(value_to_amount_string(&payloads[0].amount), "2500.0");
        assert_eq!(value_to_amount_string(&payloads[1].amount), "-45,99");
    }

    #[test]
    fn structure_hypothesis_parses_from_model_shape() {
        let body = r#"{
            "has_header": true,
            "delimiter": ";",
            "columns": [
                {"index": 0, "name": "Fecha", "kind": "date", "example": "15/12/2024"},
                {"index": 1, "name": "Concepto", "kind": "text"},
                {"index": 2, "name": "Importe", "kind": "number"}
            ]
        }"#;
        let hypothesis: StructureHypothesis = parse_model_json(body).unwrap();
        assert_eq!(hypothesis.has_header, Some(true));
        assert_eq!(hypothesis.columns.len(), 3);
        assert_eq!(hypothesis.columns[2].kind, "number");
    }
}
