//! Duplicate suppression by content hash, within the batch and against the
//! ledger. Re-running the same source must create nothing new.

use crate::app::ports::LedgerPort;
use crate::common::error::Result;
use crate::domain::NormalizedRecord;
use std::collections::HashSet;
use tracing::{debug, info};

#[derive(Debug, Default)]
pub struct DedupOutcome {
    pub fresh: Vec<NormalizedRecord>,
    pub in_batch: usize,
    pub existing: usize,
}

impl DedupOutcome {
    pub fn duplicates(&self) -> usize {
        self.in_batch + self.existing
    }
}

/// Keep the first occurrence of each hash in the batch, then drop anything
/// the ledger already holds. Order of survivors is preserved.
pub async fn filter_new(
    records: Vec<NormalizedRecord>,
    ledger: &dyn LedgerPort,
) -> Result<DedupOutcome> {
    let mut outcome = DedupOutcome::default();
    let mut seen: HashSet<String> = HashSet::new();

    for record in records {
        if !seen.insert(record.hash.clone()) {
            debug!("in-batch duplicate {} (row {:?})", record.hash, record.source_row);
            outcome.in_batch += 1;
            continue;
        }
        if ledger.exists_by_hash(&record.hash).await? {
            debug!("already persisted {} (row {:?})", record.hash, record.source_row);
            outcome.existing += 1;
            continue;
        }
        outcome.fresh.push(record);
    }

    info!(
        "🔄 dedup kept {} of {} records ({} in-batch, {} existing)",
        outcome.fresh.len(),
        outcome.fresh.len() + outcome.duplicates(),
        outcome.in_batch,
        outcome.existing
    );
    Ok(outcome)
}
