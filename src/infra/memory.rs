//! In-memory adapters for the ledger, rule and history ports. The process
//! keeps everything behind one async mutex, so a cloned handle shares state
//! with its origin. Used by the CLI for single-shot runs and by tests.

use crate::app::ports::{HistorySource, LedgerPort, RuleSource};
use crate::common::error::{PipelineError, Result};
use crate::domain::{
    ClassificationDecision, LedgerEntry, NormalizedRecord, ReconciliationProposal, RuleCondition,
};
use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Default)]
struct LedgerState {
    hashes: HashSet<String>,
    entries: Vec<LedgerEntry>,
    records: Vec<NormalizedRecord>,
    decisions: Vec<ClassificationDecision>,
    proposals: Vec<ReconciliationProposal>,
    record_calls: usize,
    decision_calls: usize,
    proposal_calls: usize,
    fail_persist: bool,
}

/// Single-account in-memory ledger. Records persisted through it become
/// visible to later hash lookups, which is what makes re-runs idempotent.
#[derive(Clone, Default)]
pub struct MemoryLedger {
    state: Arc<Mutex<LedgerState>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with pre-existing ledger entries, e.g. loaded from a JSON file.
    pub fn with_entries(entries: Vec<LedgerEntry>) -> Self {
        Self {
            state: Arc::new(Mutex::new(LedgerState {
                entries,
                ..LedgerState::default()
            })),
        }
    }

    pub async fn stored_records(&self) -> Vec<NormalizedRecord> {
        self.state.lock().await.records.clone()
    }

    pub async fn stored_decisions(&self) -> Vec<ClassificationDecision> {
        self.state.lock().await.decisions.clone()
    }

    pub async fn stored_proposals(&self) -> Vec<ReconciliationProposal> {
        self.state.lock().await.proposals.clone()
    }

    pub async fn record_calls(&self) -> usize {
        self.state.lock().await.record_calls
    }

    pub async fn decision_calls(&self) -> usize {
        self.state.lock().await.decision_calls
    }

    pub async fn proposal_calls(&self) -> usize {
        self.state.lock().await.proposal_calls
    }

    /// Make every persist call fail, for exercising rollback paths.
    pub async fn fail_persist(&self, fail: bool) {
        self.state.lock().await.fail_persist = fail;
    }
}

#[async_trait]
impl LedgerPort for MemoryLedger {
    async fn exists_by_hash(&self, hash: &str) -> Result<bool> {
        Ok(self.state.lock().await.hashes.contains(hash))
    }

    async fn find_entries_for_period(
        &self,
        _account: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<LedgerEntry>> {
        // One ledger per process; the account filter is a no-op here.
        let state = self.state.lock().await;
        Ok(state
            .entries
            .iter()
            .filter(|e| e.date >= start && e.date <= end)
            .cloned()
            .collect())
    }

    async fn persist_records(&self, records: &[NormalizedRecord]) -> Result<()> {
        let mut state = self.state.lock().await;
        state.record_calls += 1;
        if state.fail_persist {
            return Err(PipelineError::PersistenceFailed {
                message: "ledger rejected the record batch".to_string(),
            });
        }
        for record in records {
            state.hashes.insert(record.hash.clone());
        }
        state.records.extend_from_slice(records);
        Ok(())
    }

    async fn persist_decisions(&self, decisions: &[ClassificationDecision]) -> Result<()> {
        let mut state = self.state.lock().await;
        state.decision_calls += 1;
        if state.fail_persist {
            return Err(PipelineError::PersistenceFailed {
                message: "ledger rejected the decision batch".to_string(),
            });
        }
        state.decisions.extend_from_slice(decisions);
        Ok(())
    }

    async fn persist_proposals(&self, proposals: &[ReconciliationProposal]) -> Result<()> {
        let mut state = self.state.lock().await;
        state.proposal_calls += 1;
        if state.fail_persist {
            return Err(PipelineError::PersistenceFailed {
                message: "ledger rejected the proposal batch".to_string(),
            });
        }
        state.proposals.extend_from_slice(proposals);
        Ok(())
    }
}

/// Per-tenant rule lists held in memory, fixed at construction.
#[derive(Clone, Default)]
pub struct MemoryRuleSource {
    rules: HashMap<String, Vec<RuleCondition>>,
}

impl MemoryRuleSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rules(mut self, tenant: &str, rules: Vec<RuleCondition>) -> Self {
        self.rules.insert(tenant.to_string(), rules);
        self
    }
}

#[async_trait]
impl RuleSource for MemoryRuleSource {
    async fn active_rules(&self, tenant: &str) -> Result<Vec<RuleCondition>> {
        Ok(self.rules.get(tenant).cloned().unwrap_or_default())
    }
}

/// Prior validated classifications per tenant, newest last in the backing
/// vec and therefore returned newest first.
#[derive(Clone, Default)]
pub struct MemoryHistorySource {
    validated: Arc<Mutex<HashMap<String, Vec<(String, String)>>>>,
}

impl MemoryHistorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record_validated(&self, tenant: &str, description: &str, category: &str) {
        let mut validated = self.validated.lock().await;
        validated
            .entry(tenant.to_string())
            .or_default()
            .push((description.to_lowercase(), category.to_string()));
    }
}

#[async_trait]
impl HistorySource for MemoryHistorySource {
    async fn find_similar(
        &self,
        tenant: &str,
        description_prefix: &str,
        limit: usize,
    ) -> Result<Vec<String>> {
        let needle = description_prefix.to_lowercase();
        if needle.is_empty() {
            return Ok(Vec::new());
        }
        let validated = self.validated.lock().await;
        Ok(validated
            .get(tenant)
            .map(|entries| {
                entries
                    .iter()
                    .rev()
                    .filter(|(description, _)| description.contains(&needle))
                    .take(limit)
                    .map(|(_, category)| category.clone())
                    .collect()
            })
            .unwrap_or_default())
    }
}
