//! Serializable run state. Everything a stage produces lives here, so a
//! paused or faulted run can resume without recomputing earlier stages.

use crate::domain::{
    ClassificationDecision, NormalizedRecord, RawRecord, RecordError, ReconciliationProposal,
};
use crate::ingest::{ExtractedContent, SourceFormat};
use crate::interpret::StructurePlan;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use uuid::Uuid;

/// Bumped when the checkpoint layout changes shape.
pub const STATE_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PipelinePhase {
    Loading,
    Extracting,
    Interpreting,
    Parsing,
    Normalizing,
    Deduplicating,
    Storing,
    Classifying,
    ClassificationReview,
    Reconciling,
    ReconciliationReview,
    Completing,
    Completed,
    CompletedWithErrors,
    Error,
}

impl PipelinePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelinePhase::Loading => "loading",
            PipelinePhase::Extracting => "extracting",
            PipelinePhase::Interpreting => "interpreting",
            PipelinePhase::Parsing => "parsing",
            PipelinePhase::Normalizing => "normalizing",
            PipelinePhase::Deduplicating => "deduplicating",
            PipelinePhase::Storing => "storing",
            PipelinePhase::Classifying => "classifying",
            PipelinePhase::ClassificationReview => "classification-review",
            PipelinePhase::Reconciling => "reconciling",
            PipelinePhase::ReconciliationReview => "reconciliation-review",
            PipelinePhase::Completing => "completing",
            PipelinePhase::Completed => "completed",
            PipelinePhase::CompletedWithErrors => "completed-with-errors",
            PipelinePhase::Error => "error",
        }
    }

    /// Phases a run may be resumed from.
    pub fn is_review(&self) -> bool {
        matches!(
            self,
            PipelinePhase::ClassificationReview | PipelinePhase::ReconciliationReview
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelinePhase::Completed | PipelinePhase::CompletedWithErrors | PipelinePhase::Error
        )
    }
}

impl std::fmt::Display for PipelinePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reviewer verdicts handed to a resume call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Feedback {
    /// Record id -> corrected category. An empty map confirms everything.
    #[serde(default)]
    pub classification: Option<HashMap<Uuid, String>>,
    #[serde(default)]
    pub reconciliation: Option<ReconciliationFeedback>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReconciliationFeedback {
    /// Proposal ids, not record ids.
    #[serde(default)]
    pub approved: Vec<Uuid>,
    #[serde(default)]
    pub rejected: Vec<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineState {
    pub run_id: Uuid,
    pub version: u32,
    pub source_path: PathBuf,
    pub tenant: String,
    pub account: String,
    pub phase: PipelinePhase,
    pub format: Option<SourceFormat>,
    pub content: Option<ExtractedContent>,
    pub plan: Option<StructurePlan>,
    pub candidates: Vec<RawRecord>,
    pub records: Vec<NormalizedRecord>,
    pub validation_errors: Vec<RecordError>,
    pub duplicates: usize,
    pub created: usize,
    pub decisions: Vec<ClassificationDecision>,
    pub proposals: Vec<ReconciliationProposal>,
    /// Records reconciliation could not account for.
    pub discrepancies: Vec<Uuid>,
    pub feedback: Option<Feedback>,
    /// Set when a stage failed; phase is Error and prior results stand.
    pub fault: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PipelineState {
    pub fn new(source_path: PathBuf, tenant: &str, account: &str) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            version: STATE_VERSION,
            source_path,
            tenant: tenant.to_string(),
            account: account.to_string(),
            phase: PipelinePhase::Loading,
            format: None,
            content: None,
            plan: None,
            candidates: Vec::new(),
            records: Vec::new(),
            validation_errors: Vec::new(),
            duplicates: 0,
            created: 0,
            decisions: Vec::new(),
            proposals: Vec::new(),
            discrepancies: Vec::new(),
            feedback: None,
            fault: None,
            started_at: now,
            updated_at: now,
        }
    }

    pub fn advance(&mut self, phase: PipelinePhase) {
        self.phase = phase;
        self.updated_at = Utc::now();
    }

    pub fn fail(&mut self, at: PipelinePhase, message: &str) {
        self.fault = Some(format!("{}: {}", at, message));
        self.phase = PipelinePhase::Error;
        self.updated_at = Utc::now();
    }
}
