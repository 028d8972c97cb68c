use crate::common::error::{PipelineError, Result};
use crate::domain::RuleCondition;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Classifier backend selection for the external capability adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClassifierProvider {
    /// Deterministic offline classifier, no network.
    Stub,
    /// OpenAI-style chat/embeddings endpoint over HTTP.
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExternalConfig {
    pub provider: ClassifierProvider,
    pub base_url: String,
    pub model: String,
    pub embedding_model: String,
    /// Environment variable holding the API key, never the key itself.
    pub api_key_env: String,
    /// Attempts per call, exponential backoff between them.
    pub max_attempts: u32,
    /// Concurrent in-flight classifier calls per run.
    pub max_concurrency: usize,
    /// Token budget for document transcription.
    pub transcription_max_tokens: u32,
    pub timeout_seconds: u64,
}

impl Default for ExternalConfig {
    fn default() -> Self {
        Self {
            provider: ClassifierProvider::Stub,
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            embedding_model: "text-embedding-3-small".to_string(),
            api_key_env: "BANKPIPE_API_KEY".to_string(),
            max_attempts: 3,
            max_concurrency: 4,
            transcription_max_tokens: 2500,
            timeout_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Starting confidence before frequency weighting.
    pub base_confidence: f64,
    /// Description prefix length used for the similarity lookup.
    pub prefix_len: usize,
    /// Prior decisions consulted per record, at most.
    pub max_matches: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            base_confidence: 0.85,
            prefix_len: 20,
            max_matches: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// Days either side of the record date an approximate match may sit.
    pub date_window_days: i64,
    /// Absolute amount difference tolerated by the approximate tier.
    pub amount_tolerance: f64,
    /// Embedding similarity below this is not proposed at all.
    pub similarity_floor: f64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            date_window_days: 3,
            amount_tolerance: 0.0,
            similarity_floor: 0.70,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Decisions below this confidence are routed to human review.
    pub review_threshold: f64,
    /// Reconciliation proposals at or above this are auto-approved.
    pub auto_approve_threshold: f64,
    /// Confidence assigned by the rule tier.
    pub rule_confidence: f64,
    /// Category assigned when the external classifier degrades.
    pub fallback_category: String,
    /// Lines fed to the structure interpreter.
    pub sample_lines: usize,
    /// Character cap on any sample sent to the external classifier.
    pub sample_chars: usize,
    pub checkpoint_dir: PathBuf,
    pub history: HistoryConfig,
    pub reconcile: ReconcileConfig,
    pub external: ExternalConfig,
    /// Active rules, highest priority first after sorting.
    pub rules: Vec<RuleCondition>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            review_threshold: 0.75,
            auto_approve_threshold: 0.95,
            rule_confidence: 1.0,
            fallback_category: "629".to_string(),
            sample_lines: 25,
            sample_chars: 2000,
            checkpoint_dir: PathBuf::from("checkpoints"),
            history: HistoryConfig::default(),
            reconcile: ReconcileConfig::default(),
            external: ExternalConfig::default(),
            rules: Vec::new(),
        }
    }
}

impl AppConfig {
    /// Load from an explicit path, or from `bankpipe.toml` when present,
    /// falling back to defaults so the CLI works out of the box.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let candidate = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("bankpipe.toml"));

        if !candidate.exists() {
            if path.is_some() {
                return Err(PipelineError::Config {
                    message: format!("config file '{}' does not exist", candidate.display()),
                });
            }
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&candidate).map_err(|e| PipelineError::Config {
            message: format!("failed to read config file '{}': {}", candidate.display(), e),
        })?;
        let config: AppConfig = toml::from_str(&content).map_err(|e| PipelineError::Config {
            message: format!("failed to parse '{}': {}", candidate.display(), e),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("review_threshold", self.review_threshold),
            ("auto_approve_threshold", self.auto_approve_threshold),
            ("rule_confidence", self.rule_confidence),
            ("history.base_confidence", self.history.base_confidence),
            ("reconcile.similarity_floor", self.reconcile.similarity_floor),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(PipelineError::Config {
                    message: format!("{} must be within 0.0..=1.0, got {}", name, value),
                });
            }
        }
        if self.external.max_concurrency == 0 {
            return Err(PipelineError::Config {
                message: "external.max_concurrency must be at least 1".to_string(),
            });
        }
        if self.external.max_attempts == 0 {
            return Err(PipelineError::Config {
                message: "external.max_attempts must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{RuleField, RuleOperator};
    use std::io::Write;

    #[test]
    fn defaults_match_documented_thresholds() {
        let config = AppConfig::default();
        assert_eq!(config.review_threshold, 0.75);
        assert_eq!(config.auto_approve_threshold, 0.95);
        assert_eq!(config.rule_confidence, 1.0);
        assert_eq!(config.history.base_confidence, 0.85);
        assert_eq!(config.history.prefix_len, 20);
        assert_eq!(config.history.max_matches, 5);
        assert_eq!(config.reconcile.date_window_days, 3);
        assert_eq!(config.external.max_attempts, 3);
    }

    #[test]
    fn parses_rules_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bankpipe.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        write!(
            file,
            r#"
review_threshold = 0.8

[[rules]]
operator = "contains"
value = "iberdrola"
category = "628"
priority = 10

[[rules]]
field = "reference"
operator = "prefix"
value = "INV-"
category = "700"
"#
        )
        .unwrap();

        let config = AppConfig::load(Some(&path)).unwrap();
        assert_eq!(config.review_threshold, 0.8);
        assert_eq!(config.rules.len(), 2);
        assert_eq!(config.rules[0].field, RuleField::Description);
        assert_eq!(config.rules[0].operator, RuleOperator::Contains);
        assert_eq!(config.rules[0].priority, 10);
        assert_eq!(config.rules[1].field, RuleField::Reference);
        assert_eq!(config.rules[1].priority, 0);
    }

    #[test]
    fn rejects_out_of_range_threshold() {
        let config = AppConfig {
            review_threshold: 1.5,
            ..AppConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
