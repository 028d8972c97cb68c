//! Sequential stage driver. Each stage reads what earlier stages left in the
//! state and writes its own results back, so pausing for review or faulting
//! mid-run never loses completed work.

use crate::app::ports::{CheckpointStore, ClassifierPort, HistorySource, LedgerPort, RuleSource};
use crate::classify::{apply_corrections, DecisionCascade};
use crate::common::error::{PipelineError, Result};
use crate::config::AppConfig;
use crate::domain::{
    ClassificationDecision, DecisionTotals, ProposalStatus, ReconciliationProposal, RunReport,
    RunStatus,
};
use crate::observability::metrics as obs;
use crate::pipeline::state::{PipelinePhase, PipelineState};
use crate::reconcile::MatchEngine;
use crate::{dedup, guided, ingest, interpret, normalize, reconcile};
use chrono::{Duration, Utc};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::state::Feedback;

/// How a run ended for the caller: finished, or parked for a reviewer.
#[derive(Debug)]
pub enum RunOutcome {
    Completed(RunReport),
    AwaitingReview {
        run_id: Uuid,
        phase: PipelinePhase,
        pending_decisions: Vec<ClassificationDecision>,
        pending_proposals: Vec<ReconciliationProposal>,
    },
}

enum StageFlow {
    Continue(PipelinePhase),
    Pause,
    Finish(Box<RunReport>),
}

pub struct PipelineRunner {
    config: AppConfig,
    classifier: Arc<dyn ClassifierPort>,
    ledger: Arc<dyn LedgerPort>,
    rules: Arc<dyn RuleSource>,
    history: Arc<dyn HistorySource>,
    checkpoints: Arc<dyn CheckpointStore>,
}

impl PipelineRunner {
    pub fn new(
        config: AppConfig,
        classifier: Arc<dyn ClassifierPort>,
        ledger: Arc<dyn LedgerPort>,
        rules: Arc<dyn RuleSource>,
        history: Arc<dyn HistorySource>,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> Self {
        Self {
            config,
            classifier,
            ledger,
            rules,
            history,
            checkpoints,
        }
    }

    /// Process one source file from scratch.
    pub async fn run(&self, source: &Path, tenant: &str, account: &str) -> Result<RunOutcome> {
        let state = PipelineState::new(source.to_path_buf(), tenant, account);
        info!(
            "🚀 run {} starting for {} (tenant {})",
            state.run_id,
            source.display(),
            tenant
        );
        obs::run_started();
        self.drive(state).await
    }

    /// Pick a paused run back up with reviewer feedback. Earlier stage
    /// results come from the checkpoint and are never recomputed.
    pub async fn resume(&self, run_id: Uuid, feedback: Feedback) -> Result<RunOutcome> {
        let mut state = self.checkpoints.load(run_id).await?;
        if !state.phase.is_review() {
            return Err(PipelineError::Checkpoint {
                message: format!(
                    "run {} is in phase '{}', not awaiting review",
                    run_id, state.phase
                ),
            });
        }
        info!("▶️ resuming run {} at {}", run_id, state.phase);
        state.feedback = Some(feedback);
        self.drive(state).await
    }

    async fn drive(&self, mut state: PipelineState) -> Result<RunOutcome> {
        loop {
            let phase = state.phase;
            let snapshot = state.clone();
            let started = Instant::now();

            let flow = match self.step(&mut state).await {
                Ok(flow) => flow,
                Err(e) => {
                    error!("❌ run {} failed during {}: {}", state.run_id, phase, e);
                    obs::run_failed(phase.as_str());
                    let mut faulted = snapshot;
                    faulted.fail(phase, &e.to_string());
                    if let Err(save_err) = self.checkpoints.save(&faulted).await {
                        warn!(
                            "⚠️ could not checkpoint faulted run {}: {}",
                            faulted.run_id, save_err
                        );
                    }
                    return Err(e);
                }
            };
            obs::stage_completed(phase.as_str(), started.elapsed().as_secs_f64());

            match flow {
                StageFlow::Continue(next) => state.advance(next),
                StageFlow::Pause => {
                    self.checkpoints.save(&state).await?;
                    obs::run_paused(state.phase.as_str());
                    info!(
                        "⏸️ run {} paused at {} awaiting review",
                        state.run_id, state.phase
                    );
                    return Ok(self.awaiting(&state));
                }
                StageFlow::Finish(report) => {
                    obs::run_completed(report.status.as_str());
                    return Ok(RunOutcome::Completed(*report));
                }
            }
        }
    }

    fn awaiting(&self, state: &PipelineState) -> RunOutcome {
        let pending_decisions = if state.phase == PipelinePhase::ClassificationReview {
            state
                .decisions
                .iter()
                .filter(|d| d.needs_review)
                .cloned()
                .collect()
        } else {
            Vec::new()
        };
        let pending_proposals = if state.phase == PipelinePhase::ReconciliationReview {
            state
                .proposals
                .iter()
                .filter(|p| p.status == ProposalStatus::PendingReview)
                .cloned()
                .collect()
        } else {
            Vec::new()
        };
        RunOutcome::AwaitingReview {
            run_id: state.run_id,
            phase: state.phase,
            pending_decisions,
            pending_proposals,
        }
    }

    async fn step(&self, state: &mut PipelineState) -> Result<StageFlow> {
        match state.phase {
            PipelinePhase::Loading => self.load(state),
            PipelinePhase::Extracting => self.extract(state).await,
            PipelinePhase::Interpreting => self.interpret(state).await,
            PipelinePhase::Parsing => self.parse(state).await,
            PipelinePhase::Normalizing => self.normalize(state),
            PipelinePhase::Deduplicating => self.dedup(state).await,
            PipelinePhase::Storing => self.store(state).await,
            PipelinePhase::Classifying => self.classify(state).await,
            PipelinePhase::ClassificationReview => self.apply_classification_review(state).await,
            PipelinePhase::Reconciling => self.reconcile(state).await,
            PipelinePhase::ReconciliationReview => self.apply_reconciliation_review(state).await,
            PipelinePhase::Completing => self.complete(state).await,
            terminal => Err(PipelineError::Checkpoint {
                message: format!("run {} already reached '{}'", state.run_id, terminal),
            }),
        }
    }

    fn load(&self, state: &mut PipelineState) -> Result<StageFlow> {
        let detected = ingest::detect_format(&state.source_path)?;
        info!(
            "📄 {} detected as {} ({})",
            state.source_path.display(),
            detected.format,
            detected.media_type
        );
        state.format = Some(detected.format);
        Ok(StageFlow::Continue(PipelinePhase::Extracting))
    }

    async fn extract(&self, state: &mut PipelineState) -> Result<StageFlow> {
        let detected = ingest::detect_format(&state.source_path)?;
        let content = ingest::extract(
            &state.source_path,
            &detected,
            self.classifier.as_ref(),
            self.config.sample_lines,
            self.config.sample_chars,
        )
        .await?;
        info!("📄 extracted {} content", content.kind());
        state.content = Some(content);
        Ok(StageFlow::Continue(PipelinePhase::Interpreting))
    }

    async fn interpret(&self, state: &mut PipelineState) -> Result<StageFlow> {
        let content = state
            .content
            .as_ref()
            .ok_or_else(|| missing_state(state.run_id, "extracted content"))?;
        let plan = interpret::interpret(content, self.classifier.as_ref()).await?;
        info!("🧭 structure plan: {}", plan.describe());
        state.plan = Some(plan);
        Ok(StageFlow::Continue(PipelinePhase::Parsing))
    }

    async fn parse(&self, state: &mut PipelineState) -> Result<StageFlow> {
        let content = state
            .content
            .as_ref()
            .ok_or_else(|| missing_state(state.run_id, "extracted content"))?;
        let plan = state
            .plan
            .as_ref()
            .ok_or_else(|| missing_state(state.run_id, "structure plan"))?;
        let candidates = guided::extract_candidates(content, plan, self.classifier.as_ref()).await?;
        info!("📄 {} candidate records", candidates.len());
        obs::records_extracted(candidates.len() as u64);
        state.candidates = candidates;
        Ok(StageFlow::Continue(PipelinePhase::Normalizing))
    }

    fn normalize(&self, state: &mut PipelineState) -> Result<StageFlow> {
        let (records, errors) = normalize::normalize_batch(&state.candidates);
        obs::records_rejected(errors.len() as u64);
        state.records = records;
        state.validation_errors = errors;
        Ok(StageFlow::Continue(PipelinePhase::Deduplicating))
    }

    async fn dedup(&self, state: &mut PipelineState) -> Result<StageFlow> {
        let outcome = dedup::filter_new(std::mem::take(&mut state.records), self.ledger.as_ref()).await?;
        state.duplicates = outcome.duplicates();
        state.records = outcome.fresh;
        Ok(StageFlow::Continue(PipelinePhase::Storing))
    }

    async fn store(&self, state: &mut PipelineState) -> Result<StageFlow> {
        if state.records.is_empty() {
            info!("📭 nothing new to store");
        } else {
            self.ledger.persist_records(&state.records).await?;
            info!("💾 stored {} records", state.records.len());
        }
        state.created = state.records.len();
        obs::records_created(state.created as u64);
        Ok(StageFlow::Continue(PipelinePhase::Classifying))
    }

    async fn classify(&self, state: &mut PipelineState) -> Result<StageFlow> {
        if state.records.is_empty() {
            return Ok(StageFlow::Continue(PipelinePhase::Reconciling));
        }

        let mut rules = self.config.rules.clone();
        match self.rules.active_rules(&state.tenant).await {
            Ok(more) => rules.extend(more),
            Err(e) => warn!("⚠️ rule source unavailable, using configured rules only: {}", e),
        }

        let cascade = DecisionCascade::new(
            &self.config,
            &state.tenant,
            rules,
            Arc::clone(&self.history),
            Arc::clone(&self.classifier),
        );
        state.decisions = cascade.classify_batch(&state.records).await;

        let pending = state.decisions.iter().filter(|d| d.needs_review).count();
        if pending > 0 {
            info!("🧑‍⚖️ {} decisions need review before anything is persisted", pending);
            state.advance(PipelinePhase::ClassificationReview);
            return Ok(StageFlow::Pause);
        }

        self.ledger.persist_decisions(&state.decisions).await?;
        Ok(StageFlow::Continue(PipelinePhase::Reconciling))
    }

    async fn apply_classification_review(&self, state: &mut PipelineState) -> Result<StageFlow> {
        let corrections = state
            .feedback
            .as_ref()
            .and_then(|f| f.classification.clone());
        let Some(corrections) = corrections else {
            info!("⏸️ run {} still awaiting classification feedback", state.run_id);
            return Ok(StageFlow::Pause);
        };

        let applied = apply_corrections(&mut state.decisions, &corrections);
        if applied < corrections.len() {
            warn!(
                "⚠️ {} corrections referenced unknown records",
                corrections.len() - applied
            );
        }
        info!("✍️ applied {} manual corrections", applied);

        if !state.decisions.is_empty() {
            self.ledger.persist_decisions(&state.decisions).await?;
        }
        Ok(StageFlow::Continue(PipelinePhase::Reconciling))
    }

    async fn reconcile(&self, state: &mut PipelineState) -> Result<StageFlow> {
        if state.records.is_empty() {
            return Ok(StageFlow::Continue(PipelinePhase::Completing));
        }

        let window = Duration::days(self.config.reconcile.date_window_days);
        let dates: Vec<_> = state.records.iter().map(|r| r.date).collect();
        let (start, end) = match (dates.iter().min(), dates.iter().max()) {
            (Some(&min), Some(&max)) => (min - window, max + window),
            _ => return Ok(StageFlow::Continue(PipelinePhase::Completing)),
        };

        let entries = self
            .ledger
            .find_entries_for_period(&state.account, start, end)
            .await?;
        info!(
            "🔗 reconciling {} records against {} ledger entries ({} to {})",
            state.records.len(),
            entries.len(),
            start,
            end
        );

        let engine = MatchEngine::new(&self.config.reconcile, self.config.auto_approve_threshold);
        let (proposals, discrepancies) = engine
            .propose(&state.records, &entries, self.classifier.as_ref())
            .await;
        if !discrepancies.is_empty() {
            warn!("⚠️ {} records have no ledger counterpart", discrepancies.len());
        }
        state.proposals = proposals;
        state.discrepancies = discrepancies;

        let pending = state
            .proposals
            .iter()
            .filter(|p| p.status == ProposalStatus::PendingReview)
            .count();
        let has_verdicts = state
            .feedback
            .as_ref()
            .is_some_and(|f| f.reconciliation.is_some());
        if pending > 0 && !has_verdicts {
            info!("🧑‍⚖️ {} reconciliation proposals need review", pending);
            state.advance(PipelinePhase::ReconciliationReview);
            return Ok(StageFlow::Pause);
        }

        self.settle_proposals(state).await?;
        Ok(StageFlow::Continue(PipelinePhase::Completing))
    }

    async fn apply_reconciliation_review(&self, state: &mut PipelineState) -> Result<StageFlow> {
        let has_verdicts = state
            .feedback
            .as_ref()
            .is_some_and(|f| f.reconciliation.is_some());
        if !has_verdicts {
            info!("⏸️ run {} still awaiting reconciliation feedback", state.run_id);
            return Ok(StageFlow::Pause);
        }
        self.settle_proposals(state).await?;
        Ok(StageFlow::Continue(PipelinePhase::Completing))
    }

    async fn settle_proposals(&self, state: &mut PipelineState) -> Result<()> {
        let verdicts = state
            .feedback
            .as_ref()
            .and_then(|f| f.reconciliation.clone())
            .unwrap_or_default();
        reconcile::finalize(&mut state.proposals, &verdicts.approved, &verdicts.rejected);
        if !state.proposals.is_empty() {
            self.ledger.persist_proposals(&state.proposals).await?;
        }
        Ok(())
    }

    async fn complete(&self, state: &mut PipelineState) -> Result<StageFlow> {
        let status = if state.validation_errors.is_empty() {
            RunStatus::Completed
        } else {
            RunStatus::CompletedWithErrors
        };

        let report = RunReport {
            run_id: state.run_id,
            source: state.source_path.display().to_string(),
            format: state
                .format
                .map(|f| f.as_str().to_string())
                .unwrap_or_else(|| "unknown".to_string()),
            status,
            extracted: state.candidates.len(),
            valid: state.candidates.len() - state.validation_errors.len(),
            errored: state.validation_errors.len(),
            duplicates: state.duplicates,
            created: state.created,
            decisions: DecisionTotals::tally(&state.decisions),
            reconciliation: reconcile::summarize(
                state.records.len(),
                &state.proposals,
                state.discrepancies.len(),
            ),
            errors: state.validation_errors.clone(),
            started_at: state.started_at,
            finished_at: Utc::now(),
        };

        if let Err(e) = self.checkpoints.discard(state.run_id).await {
            warn!("⚠️ could not discard checkpoint for {}: {}", state.run_id, e);
        }
        state.advance(match status {
            RunStatus::Completed => PipelinePhase::Completed,
            RunStatus::CompletedWithErrors => PipelinePhase::CompletedWithErrors,
        });
        info!(
            "✅ run {} {}: {} created, {} duplicates, {} errors",
            state.run_id,
            status.as_str(),
            report.created,
            report.duplicates,
            report.errored
        );
        Ok(StageFlow::Finish(Box::new(report)))
    }
}

fn missing_state(run_id: Uuid, what: &str) -> PipelineError {
    PipelineError::Checkpoint {
        message: format!("run {} checkpoint is missing {}", run_id, what),
    }
}
