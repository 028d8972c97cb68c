use bankpipe::config::AppConfig;
use bankpipe::domain::{LedgerEntry, RunReport};
use bankpipe::infra;
use bankpipe::infra::checkpoints::FileCheckpointStore;
use bankpipe::infra::memory::{MemoryHistorySource, MemoryLedger, MemoryRuleSource};
use bankpipe::infra::stub::category_name;
use bankpipe::observability::{logging, metrics};
use bankpipe::pipeline::{Feedback, PipelineRunner, RunOutcome};
use bankpipe::{ingest, interpret};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "bankpipe")]
#[command(about = "Bank statement ingestion, classification and reconciliation pipeline")]
#[command(version = "0.1.0")]
struct Cli {
    /// Config file (defaults to ./bankpipe.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Detect the format of a statement file without processing it
    Detect {
        /// Statement file to examine
        #[arg(long)]
        file: PathBuf,
    },
    /// Extract a statement and show the structure a run would work with
    Inspect {
        /// Statement file to examine
        #[arg(long)]
        file: PathBuf,
    },
    /// Process a statement end to end
    Run {
        /// Statement file to process
        #[arg(long)]
        file: PathBuf,
        /// Tenant scope for rules and history lookups
        #[arg(long, default_value = "default")]
        tenant: String,
        /// Ledger account reconciled against
        #[arg(long, default_value = "main")]
        account: String,
        /// JSON file with existing ledger entries to reconcile against
        #[arg(long)]
        ledger: Option<PathBuf>,
        /// Print the report as JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Resume a paused run with reviewer feedback
    Resume {
        /// Run to resume
        #[arg(long)]
        run_id: Uuid,
        /// JSON feedback file
        #[arg(long)]
        feedback: PathBuf,
        /// Print the report as JSON instead of text
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    logging::init_logging();
    metrics::init_metrics();

    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.as_deref())?;
    config.validate()?;

    match cli.command {
        Commands::Detect { file } => {
            let detected = ingest::detect_format(&file)?;
            println!("📄 {}", file.display());
            println!("   Format: {}", detected.format.as_str());
            println!("   Media type: {}", detected.media_type);
        }
        Commands::Inspect { file } => {
            let classifier = infra::classifier_for(config.external.provider, &config.external)?;
            let detected = ingest::detect_format(&file)?;
            let content = ingest::extract(
                &file,
                &detected,
                classifier.as_ref(),
                config.sample_lines,
                config.sample_chars,
            )
            .await?;
            let plan = interpret::interpret(&content, classifier.as_ref()).await?;

            println!("📄 {} ({})", file.display(), detected.format.as_str());
            println!("   Content: {}", content.kind());
            println!("   Plan: {}", plan.describe());
            match &content {
                ingest::ExtractedContent::Table(table) => {
                    println!(
                        "   Delimiter: {:?}  encoding: {}  rows: {}",
                        table.delimiter,
                        table.encoding,
                        table.rows.len()
                    );
                    println!("\n{}", table.sample);
                }
                ingest::ExtractedContent::Text(text) => println!("\n{}", text.sample),
                ingest::ExtractedContent::Records(records) => {
                    println!("   Standardized records: {}", records.len());
                }
            }
        }
        Commands::Run {
            file,
            tenant,
            account,
            ledger,
            json,
        } => {
            let ledger_store = match ledger {
                Some(path) => MemoryLedger::with_entries(load_entries(&path)?),
                None => MemoryLedger::new(),
            };
            let runner = build_runner(&config, ledger_store)?;
            match runner.run(&file, &tenant, &account).await {
                Ok(outcome) => render_outcome(&outcome, json)?,
                Err(e) => {
                    println!("❌ Run failed: {}", e);
                    return Err(e.into());
                }
            }
        }
        Commands::Resume {
            run_id,
            feedback,
            json,
        } => {
            let payload: Feedback = serde_json::from_str(&std::fs::read_to_string(&feedback)?)?;
            let runner = build_runner(&config, MemoryLedger::new())?;
            match runner.resume(run_id, payload).await {
                Ok(outcome) => render_outcome(&outcome, json)?,
                Err(e) => {
                    println!("❌ Resume failed: {}", e);
                    return Err(e.into());
                }
            }
        }
    }

    Ok(())
}

fn build_runner(config: &AppConfig, ledger: MemoryLedger) -> anyhow::Result<PipelineRunner> {
    let classifier = infra::classifier_for(config.external.provider, &config.external)?;
    Ok(PipelineRunner::new(
        config.clone(),
        classifier,
        Arc::new(ledger),
        Arc::new(MemoryRuleSource::new()),
        Arc::new(MemoryHistorySource::new()),
        Arc::new(FileCheckpointStore::new(config.checkpoint_dir.clone())),
    ))
}

fn load_entries(path: &Path) -> anyhow::Result<Vec<LedgerEntry>> {
    let body = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&body)?)
}

fn render_outcome(outcome: &RunOutcome, json: bool) -> anyhow::Result<()> {
    match outcome {
        RunOutcome::Completed(report) => {
            if json {
                println!("{}", serde_json::to_string_pretty(report)?);
            } else {
                print_report(report);
            }
        }
        RunOutcome::AwaitingReview {
            run_id,
            phase,
            pending_decisions,
            pending_proposals,
        } => {
            if json {
                let body = serde_json::json!({
                    "run_id": run_id,
                    "phase": phase,
                    "pending_decisions": pending_decisions,
                    "pending_proposals": pending_proposals,
                });
                println!("{}", serde_json::to_string_pretty(&body)?);
                return Ok(());
            }

            println!("⏸️  Run {} paused at {}", run_id, phase);
            if !pending_decisions.is_empty() {
                println!("\n🧑‍⚖️ Decisions needing review:");
                for decision in pending_decisions {
                    println!(
                        "   {}  {} {}  confidence {:.2}  {}",
                        decision.record_id,
                        decision.category,
                        category_name(&decision.category).unwrap_or("?"),
                        decision.confidence,
                        decision.rationale.as_deref().unwrap_or("-")
                    );
                }
                println!("\n   Feedback shape: {{\"classification\": {{\"<record-id>\": \"<category>\"}}}}");
                println!("   An empty mapping confirms every decision as proposed.");
            }
            if !pending_proposals.is_empty() {
                println!("\n🔗 Reconciliation proposals needing review:");
                for proposal in pending_proposals {
                    println!(
                        "   {}  record {} -> entry {}  {}  confidence {:.2}  {}",
                        proposal.id,
                        proposal.record_id,
                        proposal.entry_id,
                        proposal.kind.as_str(),
                        proposal.confidence,
                        proposal.detail
                    );
                }
                println!("\n   Feedback shape: {{\"reconciliation\": {{\"approved\": [\"<proposal-id>\"], \"rejected\": [\"<proposal-id>\"]}}}}");
            }
            println!(
                "\n   Resume with: bankpipe resume --run-id {} --feedback <file>",
                run_id
            );
        }
    }
    Ok(())
}

fn print_report(report: &RunReport) {
    println!("\n📊 Run {} ({}):", report.run_id, report.source);
    println!("   Status: {}", report.status.as_str());
    println!("   Format: {}", report.format);
    println!(
        "   Extracted: {}   valid: {}   rejected: {}",
        report.extracted, report.valid, report.errored
    );
    println!(
        "   Duplicates skipped: {}   stored: {}",
        report.duplicates, report.created
    );
    let decisions = &report.decisions;
    println!(
        "   Decisions: {} rule, {} history, {} external, {} manual ({} flagged for review)",
        decisions.rule,
        decisions.history,
        decisions.external,
        decisions.manual,
        decisions.needing_review
    );
    let recon = &report.reconciliation;
    println!(
        "   Reconciliation: {}/{} matched ({:.0}%), {} validated, {} rejected, {} pending, {} discrepancies",
        recon.matched,
        recon.records,
        recon.match_rate * 100.0,
        recon.validated,
        recon.rejected,
        recon.pending,
        recon.discrepancies
    );

    if !report.errors.is_empty() {
        println!("\n⚠️  Rejected rows:");
        for error in &report.errors {
            match error.source_row {
                Some(row) => println!("   row {}: {} ({})", row, error.message, error.input),
                None => println!("   {} ({})", error.message, error.input),
            }
        }
    }
}
