use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Candidate movement straight out of an extractor. Every field is still
/// free text; the validator decides what survives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawRecord {
    pub date: String,
    pub description: String,
    pub amount: String,
    pub reference: Option<String>,
    /// 1-based line or row in the source file, when known.
    pub source_row: Option<usize>,
    /// Which extractor produced this candidate.
    pub extracted_by: String,
}

/// Canonical movement. Immutable once stored; the hash is the dedup key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub id: Uuid,
    pub date: NaiveDate,
    /// Signed, currency-agnostic. Positive = inflow.
    pub amount: f64,
    pub description: String,
    pub reference: Option<String>,
    pub hash: String,
    pub source_row: Option<usize>,
    pub extracted_by: String,
}

impl NormalizedRecord {
    pub fn new(
        date: NaiveDate,
        amount: f64,
        description: String,
        reference: Option<String>,
        source_row: Option<usize>,
        extracted_by: String,
    ) -> Self {
        let hash = content_hash(date, &description, amount, reference.as_deref());
        Self {
            id: Uuid::new_v4(),
            date,
            amount,
            description,
            reference,
            hash,
            source_row,
            extracted_by,
        }
    }
}

/// Deterministic fingerprint of the semantic fields only. Provenance
/// (source row, extractor name) never feeds the hash, so the same movement
/// uploaded via different formats collapses to one record.
pub fn content_hash(
    date: NaiveDate,
    description: &str,
    amount: f64,
    reference: Option<&str>,
) -> String {
    let mut basis = format!("{}|{}|{:.2}", date.format("%Y-%m-%d"), description, amount);
    if let Some(reference) = reference {
        basis.push('|');
        basis.push_str(reference);
    }
    let digest = Sha256::digest(basis.as_bytes());
    hex::encode(digest)[..16].to_string()
}

/// How a classification decision was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClassificationMethod {
    Rule,
    History,
    External,
    Manual,
}

impl ClassificationMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClassificationMethod::Rule => "rule",
            ClassificationMethod::History => "history",
            ClassificationMethod::External => "external",
            ClassificationMethod::Manual => "manual",
        }
    }
}

impl std::fmt::Display for ClassificationMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One decision per record per run. A manual correction overwrites category,
/// method and confidence but keeps the earlier provenance in the rationale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationDecision {
    pub record_id: Uuid,
    pub category: String,
    /// 0.0 to 1.0.
    pub confidence: f64,
    pub method: ClassificationMethod,
    pub rationale: Option<String>,
    pub needs_review: bool,
}

/// Which record field a rule inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleField {
    Description,
    Reference,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleOperator {
    Contains,
    Equals,
    Prefix,
}

/// Deterministic classification rule. Evaluated in descending priority,
/// first match wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleCondition {
    #[serde(default = "RuleCondition::default_field")]
    pub field: RuleField,
    pub operator: RuleOperator,
    pub value: String,
    pub category: String,
    #[serde(default)]
    pub priority: i32,
}

impl RuleCondition {
    fn default_field() -> RuleField {
        RuleField::Description
    }
}

/// Entry already living in the external ledger, as returned by the
/// ledger collaborator for a reconciliation period.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: String,
    pub date: NaiveDate,
    pub amount: f64,
    pub description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchKind {
    Exact,
    Approximate,
}

impl MatchKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchKind::Exact => "exact",
            MatchKind::Approximate => "approximate",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProposalStatus {
    AutoApproved,
    PendingReview,
    Validated,
    Rejected,
}

impl ProposalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProposalStatus::AutoApproved => "auto-approved",
            ProposalStatus::PendingReview => "pending-review",
            ProposalStatus::Validated => "validated",
            ProposalStatus::Rejected => "rejected",
        }
    }
}

/// Candidate pairing between a bank record and a ledger entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationProposal {
    pub id: Uuid,
    pub record_id: Uuid,
    pub entry_id: String,
    pub confidence: f64,
    pub kind: MatchKind,
    pub detail: String,
    pub status: ProposalStatus,
}

/// Per-record failure collected during validation. Never aborts the batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordError {
    pub source_row: Option<usize>,
    pub input: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunStatus {
    Completed,
    CompletedWithErrors,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Completed => "completed",
            RunStatus::CompletedWithErrors => "completed-with-errors",
        }
    }
}

/// Decision counts per cascade tier, for the run report.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DecisionTotals {
    pub rule: usize,
    pub history: usize,
    pub external: usize,
    pub manual: usize,
    pub needing_review: usize,
}

impl DecisionTotals {
    pub fn tally(decisions: &[ClassificationDecision]) -> Self {
        let mut totals = DecisionTotals::default();
        for decision in decisions {
            match decision.method {
                ClassificationMethod::Rule => totals.rule += 1,
                ClassificationMethod::History => totals.history += 1,
                ClassificationMethod::External => totals.external += 1,
                ClassificationMethod::Manual => totals.manual += 1,
            }
            if decision.needs_review {
                totals.needing_review += 1;
            }
        }
        totals
    }

    pub fn total(&self) -> usize {
        self.rule + self.history + self.external + self.manual
    }
}

/// Outcome of the reconciliation stage, reported at the end of a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReconciliationSummary {
    pub records: usize,
    pub matched: usize,
    pub validated: usize,
    pub rejected: usize,
    pub pending: usize,
    pub discrepancies: usize,
    /// matched / records, 0.0 when the run had no records.
    pub match_rate: f64,
}

/// Everything a caller learns about a finished run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub source: String,
    pub format: String,
    pub status: RunStatus,
    pub extracted: usize,
    pub valid: usize,
    pub errored: usize,
    pub duplicates: usize,
    pub created: usize,
    pub decisions: DecisionTotals,
    pub reconciliation: ReconciliationSummary,
    pub errors: Vec<RecordError>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}
