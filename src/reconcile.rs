//! Reconciliation against ledger entries for the statement period.
//!
//! Two tiers: an exact pass (same date, same amount, equal or contained
//! description) and an approximate pass (amount within tolerance, date
//! within the window, embedding similarity over the floor). Each ledger
//! entry is consumed by at most one proposal; records left without any
//! proposal are flagged as discrepancies.

use crate::app::ports::ClassifierPort;
use crate::config::ReconcileConfig;
use crate::domain::{
    LedgerEntry, MatchKind, NormalizedRecord, ProposalStatus, ReconciliationProposal,
    ReconciliationSummary,
};
use crate::normalize::clean_text;
use std::collections::HashSet;
use tracing::{info, warn};
use uuid::Uuid;

/// Half a cent. Amounts closer than this are the same amount.
const AMOUNT_EPS: f64 = 0.005;

pub struct MatchEngine {
    date_window_days: i64,
    amount_tolerance: f64,
    similarity_floor: f64,
    auto_approve_threshold: f64,
}

impl MatchEngine {
    pub fn new(config: &ReconcileConfig, auto_approve_threshold: f64) -> Self {
        Self {
            date_window_days: config.date_window_days,
            amount_tolerance: config.amount_tolerance,
            similarity_floor: config.similarity_floor,
            auto_approve_threshold,
        }
    }

    /// Propose at most one pairing per record. Returns the proposals plus the
    /// ids of records no ledger entry accounted for.
    pub async fn propose(
        &self,
        records: &[NormalizedRecord],
        entries: &[LedgerEntry],
        classifier: &dyn ClassifierPort,
    ) -> (Vec<ReconciliationProposal>, Vec<Uuid>) {
        let mut proposals = Vec::new();
        let mut consumed = vec![false; entries.len()];
        let mut matched: HashSet<usize> = HashSet::new();

        self.exact_pass(records, entries, &mut consumed, &mut matched, &mut proposals);
        self.approximate_pass(records, entries, classifier, &mut consumed, &mut matched, &mut proposals)
            .await;

        let discrepancies: Vec<Uuid> = records
            .iter()
            .enumerate()
            .filter(|(i, _)| !matched.contains(i))
            .map(|(_, r)| r.id)
            .collect();

        info!(
            "🔗 reconciliation proposed {} pairings, {} discrepancies",
            proposals.len(),
            discrepancies.len()
        );
        (proposals, discrepancies)
    }

    fn exact_pass(
        &self,
        records: &[NormalizedRecord],
        entries: &[LedgerEntry],
        consumed: &mut [bool],
        matched: &mut HashSet<usize>,
        proposals: &mut Vec<ReconciliationProposal>,
    ) {
        for (ri, record) in records.iter().enumerate() {
            let record_desc = canon(&record.description);
            let mut equal: Option<usize> = None;
            let mut contained: Option<usize> = None;

            for (ei, entry) in entries.iter().enumerate() {
                if consumed[ei]
                    || entry.date != record.date
                    || (entry.amount - record.amount).abs() > AMOUNT_EPS
                {
                    continue;
                }
                let entry_desc = canon(&entry.description);
                if entry_desc == record_desc {
                    equal = Some(ei);
                    break;
                }
                if contained.is_none()
                    && !entry_desc.is_empty()
                    && !record_desc.is_empty()
                    && (entry_desc.contains(&record_desc) || record_desc.contains(&entry_desc))
                {
                    contained = Some(ei);
                }
            }

            if let Some(ei) = equal.or(contained) {
                consumed[ei] = true;
                matched.insert(ri);
                let how = if equal.is_some() { "equal" } else { "contained" };
                proposals.push(self.proposal(
                    record.id,
                    &entries[ei].id,
                    1.0,
                    MatchKind::Exact,
                    format!("same date, same amount, description {}", how),
                ));
            }
        }
    }

    /// Embedding failures skip this tier rather than failing the run.
    async fn approximate_pass(
        &self,
        records: &[NormalizedRecord],
        entries: &[LedgerEntry],
        classifier: &dyn ClassifierPort,
        consumed: &mut [bool],
        matched: &mut HashSet<usize>,
        proposals: &mut Vec<ReconciliationProposal>,
    ) {
        if records.len() == matched.len() || consumed.iter().all(|c| *c) {
            return;
        }

        let texts: Vec<String> = records
            .iter()
            .map(|r| r.description.clone())
            .chain(entries.iter().map(|e| e.description.clone()))
            .collect();
        let vectors = match classifier.embed(&texts).await {
            Ok(vectors) if vectors.len() == texts.len() => vectors,
            Ok(vectors) => {
                warn!(
                    "⚠️ embedding count mismatch ({} for {} texts), skipping approximate tier",
                    vectors.len(),
                    texts.len()
                );
                return;
            }
            Err(e) => {
                warn!("⚠️ embedding failed ({}), skipping approximate tier", e);
                return;
            }
        };
        let (record_vecs, entry_vecs) = vectors.split_at(records.len());

        for (ri, record) in records.iter().enumerate() {
            if matched.contains(&ri) {
                continue;
            }
            let mut best: Option<(usize, f64, i64)> = None;
            for (ei, entry) in entries.iter().enumerate() {
                if consumed[ei]
                    || (entry.amount - record.amount).abs() > self.amount_tolerance + AMOUNT_EPS
                {
                    continue;
                }
                let days = (entry.date - record.date).num_days().abs();
                if days > self.date_window_days {
                    continue;
                }
                let similarity = f64::from(cosine_similarity(&record_vecs[ri], &entry_vecs[ei]));
                if similarity < self.similarity_floor {
                    continue;
                }
                let better = match best {
                    None => true,
                    Some((_, s, d)) => similarity > s || (similarity == s && days < d),
                };
                if better {
                    best = Some((ei, similarity, days));
                }
            }

            if let Some((ei, similarity, days)) = best {
                consumed[ei] = true;
                matched.insert(ri);
                proposals.push(self.proposal(
                    record.id,
                    &entries[ei].id,
                    similarity,
                    MatchKind::Approximate,
                    format!("{} days apart, similarity {:.2}", days, similarity),
                ));
            }
        }
    }

    fn proposal(
        &self,
        record_id: Uuid,
        entry_id: &str,
        confidence: f64,
        kind: MatchKind,
        detail: String,
    ) -> ReconciliationProposal {
        let status = if confidence >= self.auto_approve_threshold {
            ProposalStatus::AutoApproved
        } else {
            ProposalStatus::PendingReview
        };
        ReconciliationProposal {
            id: Uuid::new_v4(),
            record_id,
            entry_id: entry_id.to_string(),
            confidence,
            kind,
            detail,
            status,
        }
    }
}

/// Settle proposals after review. Explicit verdicts win; auto-approved
/// proposals left alone become validated; anything else stays pending.
pub fn finalize(
    proposals: &mut [ReconciliationProposal],
    approved: &[Uuid],
    rejected: &[Uuid],
) {
    for proposal in proposals.iter_mut() {
        if rejected.contains(&proposal.id) {
            proposal.status = ProposalStatus::Rejected;
        } else if approved.contains(&proposal.id)
            || proposal.status == ProposalStatus::AutoApproved
        {
            proposal.status = ProposalStatus::Validated;
        }
    }
}

pub fn summarize(
    records: usize,
    proposals: &[ReconciliationProposal],
    discrepancies: usize,
) -> ReconciliationSummary {
    let mut summary = ReconciliationSummary {
        records,
        matched: proposals.len(),
        discrepancies,
        ..ReconciliationSummary::default()
    };
    for proposal in proposals {
        match proposal.status {
            ProposalStatus::Validated => summary.validated += 1,
            ProposalStatus::Rejected => summary.rejected += 1,
            ProposalStatus::AutoApproved | ProposalStatus::PendingReview => summary.pending += 1,
        }
    }
    summary.match_rate = if records == 0 {
        0.0
    } else {
        proposals.len() as f64 / records as f64
    };
    summary
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

fn canon(description: &str) -> String {
    clean_text(description).to_lowercase()
}
