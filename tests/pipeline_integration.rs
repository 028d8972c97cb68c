use anyhow::Result;
use bankpipe::app::ports::CheckpointStore;
use bankpipe::config::AppConfig;
use bankpipe::domain::{
    ClassificationMethod, LedgerEntry, MatchKind, ProposalStatus, RuleCondition, RuleField,
    RuleOperator, RunStatus,
};
use bankpipe::infra::checkpoints::FileCheckpointStore;
use bankpipe::infra::memory::{MemoryHistorySource, MemoryLedger, MemoryRuleSource};
use bankpipe::infra::stub::StubClassifier;
use bankpipe::pipeline::{
    Feedback, PipelinePhase, PipelineRunner, ReconciliationFeedback, RunOutcome,
};
use bankpipe::PipelineError;
use chrono::NaiveDate;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tempfile::tempdir;
use uuid::Uuid;

fn contains_rule(value: &str, category: &str) -> RuleCondition {
    RuleCondition {
        field: RuleField::Description,
        operator: RuleOperator::Contains,
        value: value.to_string(),
        category: category.to_string(),
        priority: 10,
    }
}

fn test_config(checkpoint_dir: &Path, rules: Vec<RuleCondition>) -> AppConfig {
    AppConfig {
        checkpoint_dir: checkpoint_dir.to_path_buf(),
        rules,
        ..AppConfig::default()
    }
}

fn test_runner(config: AppConfig, ledger: MemoryLedger) -> PipelineRunner {
    let checkpoint_dir = config.checkpoint_dir.clone();
    PipelineRunner::new(
        config,
        Arc::new(StubClassifier::new()),
        Arc::new(ledger),
        Arc::new(MemoryRuleSource::new()),
        Arc::new(MemoryHistorySource::new()),
        Arc::new(FileCheckpointStore::new(checkpoint_dir)),
    )
}

fn write_statement(dir: &Path, name: &str, body: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    path
}

const TWO_MOVEMENTS: &str = "Fecha;Concepto;Importe\n\
    15/12/2024;TRANSFERENCIA NOMINA;2.500,00\n\
    16/12/2024;PAGO AMAZON;-45,99\n";

#[tokio::test]
async fn test_clean_csv_run_completes() -> Result<()> {
    let workspace = tempdir()?;
    let statement = write_statement(workspace.path(), "movimientos.csv", TWO_MOVEMENTS);
    let config = test_config(
        &workspace.path().join("checkpoints"),
        vec![
            contains_rule("nomina", "700"),
            contains_rule("amazon", "600"),
        ],
    );
    let ledger = MemoryLedger::new();
    let runner = test_runner(config, ledger.clone());

    let outcome = runner.run(&statement, "default", "main").await?;

    let RunOutcome::Completed(report) = outcome else {
        panic!("expected a completed run");
    };
    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.format, "delimited-text");
    assert_eq!(report.extracted, 2);
    assert_eq!(report.valid, 2);
    assert_eq!(report.created, 2);
    assert_eq!(report.duplicates, 0);
    assert_eq!(report.decisions.rule, 2);
    assert_eq!(report.decisions.needing_review, 0);

    // Locale-ambiguous amounts came out signed and canonical
    let stored = ledger.stored_records().await;
    assert_eq!(stored.len(), 2);
    assert_eq!(stored[0].amount, 2500.00);
    assert_eq!(stored[1].amount, -45.99);
    assert_eq!(
        stored[0].date,
        NaiveDate::from_ymd_opt(2024, 12, 15).unwrap()
    );

    let decisions = ledger.stored_decisions().await;
    assert_eq!(decisions.len(), 2);
    assert!(decisions
        .iter()
        .all(|d| d.method == ClassificationMethod::Rule && d.confidence == 1.0));
    Ok(())
}

#[tokio::test]
async fn test_low_confidence_pauses_then_resume_persists_once() -> Result<()> {
    let workspace = tempdir()?;
    let statement = write_statement(
        workspace.path(),
        "movimientos.csv",
        "Fecha;Concepto;Importe\n15/12/2024;CUOTA COWORKING DICIEMBRE;-150,00\n",
    );
    let checkpoint_dir = workspace.path().join("checkpoints");
    let config = test_config(&checkpoint_dir, Vec::new());
    let ledger = MemoryLedger::new();
    let runner = test_runner(config, ledger.clone());

    // No rule, no history, stub has no keyword for it: lands at 0.5 and pauses
    let outcome = runner.run(&statement, "default", "main").await?;
    let RunOutcome::AwaitingReview {
        run_id,
        phase,
        pending_decisions,
        ..
    } = outcome
    else {
        panic!("expected the run to pause for review");
    };
    assert_eq!(phase, PipelinePhase::ClassificationReview);
    assert_eq!(pending_decisions.len(), 1);
    assert!(pending_decisions[0].needs_review);
    assert_eq!(ledger.decision_calls().await, 0);

    // Reviewer corrects the category, run continues to the end
    let mut corrections = HashMap::new();
    corrections.insert(pending_decisions[0].record_id, "621".to_string());
    let feedback = Feedback {
        classification: Some(corrections),
        reconciliation: None,
    };
    let outcome = runner.resume(run_id, feedback).await?;

    let RunOutcome::Completed(report) = outcome else {
        panic!("expected the resumed run to complete");
    };
    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.decisions.manual, 1);
    assert_eq!(report.decisions.needing_review, 0);
    assert_eq!(ledger.decision_calls().await, 1);

    let decisions = ledger.stored_decisions().await;
    assert_eq!(decisions[0].category, "621");
    assert_eq!(decisions[0].method, ClassificationMethod::Manual);
    assert_eq!(decisions[0].confidence, 1.0);

    // Checkpoint is gone once the run finished
    let store = FileCheckpointStore::new(&checkpoint_dir);
    assert!(store.load(run_id).await.is_err());
    Ok(())
}

#[tokio::test]
async fn test_rerunning_the_same_statement_stores_nothing_new() -> Result<()> {
    let workspace = tempdir()?;
    let statement = write_statement(workspace.path(), "movimientos.csv", TWO_MOVEMENTS);
    let config = test_config(
        &workspace.path().join("checkpoints"),
        vec![
            contains_rule("nomina", "700"),
            contains_rule("amazon", "600"),
        ],
    );
    let ledger = MemoryLedger::new();
    let runner = test_runner(config, ledger.clone());

    let first = runner.run(&statement, "default", "main").await?;
    let RunOutcome::Completed(first) = first else {
        panic!("expected a completed run");
    };
    assert_eq!(first.created, 2);

    let second = runner.run(&statement, "default", "main").await?;
    let RunOutcome::Completed(second) = second else {
        panic!("expected a completed run");
    };
    assert_eq!(second.created, 0);
    assert_eq!(second.duplicates, 2);

    // Second run never touched the record store
    assert_eq!(ledger.stored_records().await.len(), 2);
    assert_eq!(ledger.record_calls().await, 1);
    Ok(())
}

#[tokio::test]
async fn test_exact_match_reconciles_and_unmatched_becomes_discrepancy() -> Result<()> {
    let workspace = tempdir()?;
    let statement = write_statement(
        workspace.path(),
        "movimientos.csv",
        "Fecha;Concepto;Importe\n\
         15/12/2024;TRANSFERENCIA NOMINA ACME;2.500,00\n\
         16/12/2024;PAGO AMAZON;-45,99\n",
    );
    let config = test_config(
        &workspace.path().join("checkpoints"),
        vec![
            contains_rule("nomina", "700"),
            contains_rule("amazon", "600"),
        ],
    );
    let ledger = MemoryLedger::with_entries(vec![LedgerEntry {
        id: "asiento-1".to_string(),
        date: NaiveDate::from_ymd_opt(2024, 12, 15).unwrap(),
        amount: 2500.00,
        description: "Transferencia nomina acme".to_string(),
    }]);
    let runner = test_runner(config, ledger.clone());

    let outcome = runner.run(&statement, "default", "main").await?;

    let RunOutcome::Completed(report) = outcome else {
        panic!("expected a completed run");
    };
    let recon = &report.reconciliation;
    assert_eq!(recon.records, 2);
    assert_eq!(recon.matched, 1);
    assert_eq!(recon.validated, 1);
    assert_eq!(recon.pending, 0);
    assert_eq!(recon.discrepancies, 1);
    assert_eq!(recon.match_rate, 0.5);

    let proposals = ledger.stored_proposals().await;
    assert_eq!(proposals.len(), 1);
    assert_eq!(proposals[0].entry_id, "asiento-1");
    assert_eq!(proposals[0].kind, MatchKind::Exact);
    assert_eq!(proposals[0].status, ProposalStatus::Validated);
    assert_eq!(ledger.proposal_calls().await, 1);
    Ok(())
}

#[tokio::test]
async fn test_approximate_match_pauses_for_review_then_validates() -> Result<()> {
    let workspace = tempdir()?;
    let statement = write_statement(
        workspace.path(),
        "movimientos.csv",
        "Fecha;Concepto;Importe\n15/12/2024;ALQUILER OFICINA CENTRO;-850,00\n",
    );
    let config = test_config(
        &workspace.path().join("checkpoints"),
        vec![contains_rule("alquiler", "621")],
    );
    // Same amount two days later, similar wording: approximate tier material
    let ledger = MemoryLedger::with_entries(vec![LedgerEntry {
        id: "asiento-7".to_string(),
        date: NaiveDate::from_ymd_opt(2024, 12, 17).unwrap(),
        amount: -850.00,
        description: "alquiler oficina".to_string(),
    }]);
    let runner = test_runner(config, ledger.clone());

    let outcome = runner.run(&statement, "default", "main").await?;
    let RunOutcome::AwaitingReview {
        run_id,
        phase,
        pending_proposals,
        ..
    } = outcome
    else {
        panic!("expected the run to pause for reconciliation review");
    };
    assert_eq!(phase, PipelinePhase::ReconciliationReview);
    assert_eq!(pending_proposals.len(), 1);
    assert_eq!(pending_proposals[0].kind, MatchKind::Approximate);
    assert_eq!(pending_proposals[0].status, ProposalStatus::PendingReview);
    assert_eq!(ledger.proposal_calls().await, 0);

    let feedback = Feedback {
        classification: None,
        reconciliation: Some(ReconciliationFeedback {
            approved: vec![pending_proposals[0].id],
            rejected: Vec::new(),
        }),
    };
    let outcome = runner.resume(run_id, feedback).await?;

    let RunOutcome::Completed(report) = outcome else {
        panic!("expected the resumed run to complete");
    };
    assert_eq!(report.reconciliation.validated, 1);
    assert_eq!(report.reconciliation.pending, 0);

    let proposals = ledger.stored_proposals().await;
    assert_eq!(proposals.len(), 1);
    assert_eq!(proposals[0].status, ProposalStatus::Validated);
    assert_eq!(ledger.proposal_calls().await, 1);
    Ok(())
}

#[tokio::test]
async fn test_storage_fault_checkpoints_the_last_good_state() -> Result<()> {
    let workspace = tempdir()?;
    let statement = write_statement(workspace.path(), "movimientos.csv", TWO_MOVEMENTS);
    let checkpoint_dir = workspace.path().join("checkpoints");
    let config = test_config(
        &checkpoint_dir,
        vec![
            contains_rule("nomina", "700"),
            contains_rule("amazon", "600"),
        ],
    );
    let ledger = MemoryLedger::new();
    ledger.fail_persist(true).await;
    let runner = test_runner(config, ledger.clone());

    let err = runner
        .run(&statement, "default", "main")
        .await
        .expect_err("persistence was rigged to fail");
    assert!(matches!(err, PipelineError::PersistenceFailed { .. }));

    // The faulted run left exactly one checkpoint carrying the work done
    // before the failing stage
    let run_id = single_checkpoint_id(&checkpoint_dir);
    let store = FileCheckpointStore::new(&checkpoint_dir);
    let state = store.load(run_id).await?;
    assert_eq!(state.phase, PipelinePhase::Error);
    assert!(state.fault.as_deref().unwrap_or("").contains("storing"));
    assert_eq!(state.records.len(), 2);
    Ok(())
}

fn single_checkpoint_id(dir: &Path) -> Uuid {
    let names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().to_string())
        .collect();
    assert_eq!(names.len(), 1, "expected one checkpoint, found {names:?}");
    names[0]
        .trim_end_matches(".json")
        .parse()
        .expect("checkpoint file name is the run id")
}
