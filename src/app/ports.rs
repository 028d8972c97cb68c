use crate::common::error::Result;
use crate::domain::{
    ClassificationDecision, LedgerEntry, NormalizedRecord, RawRecord, ReconciliationProposal,
    RuleCondition,
};
use crate::pipeline::state::PipelineState;
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Structured judgment returned by the external classifier for one record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryJudgment {
    pub category: String,
    pub confidence: f64,
    pub rationale: Option<String>,
}

/// Untrusted structural hypothesis for a text sample. Every field is
/// optional on purpose; the interpreter validates before use.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StructureHypothesis {
    pub has_header: Option<bool>,
    pub delimiter: Option<String>,
    #[serde(default)]
    pub columns: Vec<ColumnGuess>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnGuess {
    pub index: usize,
    pub name: Option<String>,
    /// date | text | number | reference (Spanish synonyms tolerated).
    pub kind: String,
    pub example: Option<String>,
}

/// The external classifier/embedding/vision capability. Calls are
/// best-effort: adapters retry transient failures, callers degrade on error.
#[async_trait]
pub trait ClassifierPort: Send + Sync {
    async fn classify(&self, description: &str, amount: f64) -> Result<CategoryJudgment>;

    async fn interpret_structure(&self, sample: &str) -> Result<StructureHypothesis>;

    /// Transcribe a document or image into plain text.
    async fn transcribe(&self, filename: &str, media_type: &str, bytes: &[u8]) -> Result<String>;

    /// Pull transaction candidates straight out of free text.
    async fn extract_transactions(&self, text: &str) -> Result<Vec<RawRecord>>;

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// The external ledger store. Persistence is atomic per call: either the
/// whole batch lands or none of it does.
#[async_trait]
pub trait LedgerPort: Send + Sync {
    async fn exists_by_hash(&self, hash: &str) -> Result<bool>;

    async fn find_entries_for_period(
        &self,
        account: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<LedgerEntry>>;

    async fn persist_records(&self, records: &[NormalizedRecord]) -> Result<()>;

    async fn persist_decisions(&self, decisions: &[ClassificationDecision]) -> Result<()>;

    async fn persist_proposals(&self, proposals: &[ReconciliationProposal]) -> Result<()>;
}

/// Active rules for a tenant. Never mutated mid-run.
#[async_trait]
pub trait RuleSource: Send + Sync {
    async fn active_rules(&self, tenant: &str) -> Result<Vec<RuleCondition>>;
}

/// Prior human-validated decisions, looked up by description similarity.
#[async_trait]
pub trait HistorySource: Send + Sync {
    /// Categories of validated decisions whose description contains the
    /// prefix, most recent first, at most `limit` of them.
    async fn find_similar(
        &self,
        tenant: &str,
        description_prefix: &str,
        limit: usize,
    ) -> Result<Vec<String>>;
}

/// Where paused runs live between the pause and the human feedback.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn save(&self, state: &PipelineState) -> Result<()>;

    async fn load(&self, run_id: Uuid) -> Result<PipelineState>;

    async fn discard(&self, run_id: Uuid) -> Result<()>;
}
