//! Three-tier decision cascade: deterministic rules, then decision history,
//! then the external classifier. A record settled by an earlier tier never
//! reaches a later one.

pub mod rules;

use crate::app::ports::{ClassifierPort, HistorySource};
use crate::common::error::{PipelineError, Result};
use crate::config::AppConfig;
use crate::domain::{
    ClassificationDecision, ClassificationMethod, NormalizedRecord, RuleCondition, RuleField,
    RuleOperator,
};
use rules::RuleEngine;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub struct DecisionCascade {
    engine: RuleEngine,
    history: Arc<dyn HistorySource>,
    external: Arc<dyn ClassifierPort>,
    tenant: String,
    review_threshold: f64,
    rule_confidence: f64,
    fallback_category: String,
    history_base: f64,
    prefix_len: usize,
    max_matches: usize,
    max_concurrency: usize,
}

impl DecisionCascade {
    pub fn new(
        config: &AppConfig,
        tenant: &str,
        rules: Vec<RuleCondition>,
        history: Arc<dyn HistorySource>,
        external: Arc<dyn ClassifierPort>,
    ) -> Self {
        Self {
            engine: RuleEngine::new(rules),
            history,
            external,
            tenant: tenant.to_string(),
            review_threshold: config.review_threshold,
            rule_confidence: config.rule_confidence,
            fallback_category: config.fallback_category.clone(),
            history_base: config.history.base_confidence,
            prefix_len: config.history.prefix_len,
            max_matches: config.history.max_matches,
            max_concurrency: config.external.max_concurrency,
        }
    }

    /// Decide a category for every record, in record order. Tier failures
    /// degrade (history errors fall through, external errors produce the
    /// fallback decision), so the batch always comes back complete.
    pub async fn classify_batch(
        &self,
        records: &[NormalizedRecord],
    ) -> Vec<ClassificationDecision> {
        let mut slots: Vec<Option<ClassificationDecision>> = vec![None; records.len()];
        let mut unresolved: Vec<usize> = Vec::new();

        for (i, record) in records.iter().enumerate() {
            if let Some(rule) = self.engine.evaluate(record) {
                debug!("record {} settled by rule -> {}", record.id, rule.category);
                slots[i] = Some(self.decision(
                    record.id,
                    rule.category.clone(),
                    self.rule_confidence,
                    ClassificationMethod::Rule,
                    Some(describe_rule(rule)),
                ));
                continue;
            }
            if let Some(decision) = self.from_history(record).await {
                slots[i] = Some(decision);
                continue;
            }
            unresolved.push(i);
        }

        if !unresolved.is_empty() {
            info!(
                "🤖 {} of {} records go to the external classifier",
                unresolved.len(),
                records.len()
            );
            self.resolve_external(records, &unresolved, &mut slots).await;
        }

        let decisions: Vec<ClassificationDecision> = slots.into_iter().flatten().collect();
        info!(
            "📊 classified {} records ({} flagged for review)",
            decisions.len(),
            decisions.iter().filter(|d| d.needs_review).count()
        );
        decisions
    }

    async fn from_history(&self, record: &NormalizedRecord) -> Option<ClassificationDecision> {
        let prefix: String = record.description.chars().take(self.prefix_len).collect();
        let similar = match self
            .history
            .find_similar(&self.tenant, &prefix, self.max_matches)
            .await
        {
            Ok(similar) => similar,
            Err(e) => {
                warn!("⚠️ history lookup failed for {}: {}", record.id, e);
                return None;
            }
        };
        if similar.is_empty() {
            return None;
        }

        let (category, count) = mode_with_count(&similar)?;
        let raw = self.history_base * (count as f64 / similar.len() as f64);
        let confidence = (raw * 100.0).round() / 100.0;
        debug!(
            "record {} settled by history -> {} ({}/{} similar)",
            record.id,
            category,
            count,
            similar.len()
        );
        Some(self.decision(
            record.id,
            category,
            confidence,
            ClassificationMethod::History,
            Some(format!(
                "{} of {} similar past records share this category",
                count,
                similar.len()
            )),
        ))
    }

    /// Tier three, bounded by a semaphore. Join or call failures become the
    /// fallback decision instead of sinking the batch.
    async fn resolve_external(
        &self,
        records: &[NormalizedRecord],
        unresolved: &[usize],
        slots: &mut [Option<ClassificationDecision>],
    ) {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrency.max(1)));
        let mut handles = Vec::with_capacity(unresolved.len());

        for &i in unresolved {
            let record = records[i].clone();
            let external = Arc::clone(&self.external);
            let semaphore = Arc::clone(&semaphore);
            handles.push((
                i,
                record.id,
                tokio::spawn(async move {
                    let _permit = semaphore.acquire_owned().await.map_err(|_| {
                        PipelineError::ExternalService {
                            message: "classifier semaphore closed".to_string(),
                        }
                    })?;
                    external.classify(&record.description, record.amount).await
                }),
            ));
        }

        for (i, record_id, handle) in handles {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(e) => Err(PipelineError::ExternalService {
                    message: format!("classification task failed: {}", e),
                }),
            };
            slots[i] = Some(match outcome {
                Ok(judgment) if !judgment.category.trim().is_empty() => self.decision(
                    record_id,
                    judgment.category,
                    judgment.confidence.clamp(0.0, 1.0),
                    ClassificationMethod::External,
                    judgment.rationale,
                ),
                Ok(_) => {
                    warn!("⚠️ external classifier returned an empty category for {}", record_id);
                    self.fallback(record_id, "empty category from external classifier")
                }
                Err(e) => {
                    warn!("⚠️ external classification failed for {}: {}", record_id, e);
                    self.fallback(record_id, &e.to_string())
                }
            });
        }
    }

    fn decision(
        &self,
        record_id: Uuid,
        category: String,
        confidence: f64,
        method: ClassificationMethod,
        rationale: Option<String>,
    ) -> ClassificationDecision {
        ClassificationDecision {
            record_id,
            category,
            confidence,
            method,
            rationale,
            needs_review: confidence < self.review_threshold,
        }
    }

    fn fallback(&self, record_id: Uuid, reason: &str) -> ClassificationDecision {
        self.decision(
            record_id,
            self.fallback_category.clone(),
            0.5,
            ClassificationMethod::External,
            Some(format!("fallback: {}", reason)),
        )
    }
}

/// Overwrite reviewed decisions with human corrections. The prior category
/// and method survive in the rationale.
pub fn apply_corrections(
    decisions: &mut [ClassificationDecision],
    corrections: &HashMap<Uuid, String>,
) -> usize {
    let mut applied = 0;
    for decision in decisions.iter_mut() {
        if let Some(category) = corrections.get(&decision.record_id) {
            decision.rationale = Some(format!(
                "manual correction (was {} via {})",
                decision.category, decision.method
            ));
            decision.category = category.clone();
            decision.confidence = 1.0;
            decision.method = ClassificationMethod::Manual;
            decision.needs_review = false;
            applied += 1;
        }
    }
    applied
}

/// Most frequent entry; ties go to the one seen first.
fn mode_with_count(categories: &[String]) -> Option<(String, usize)> {
    let mut counts: Vec<(String, usize)> = Vec::new();
    for category in categories {
        match counts.iter_mut().find(|(c, _)| c == category) {
            Some(entry) => entry.1 += 1,
            None => counts.push((category.clone(), 1)),
        }
    }
    let mut best: Option<(String, usize)> = None;
    for (category, count) in counts {
        let replace = match &best {
            Some((_, best_count)) => count > *best_count,
            None => true,
        };
        if replace {
            best = Some((category, count));
        }
    }
    best
}

fn describe_rule(rule: &RuleCondition) -> String {
    let field = match rule.field {
        RuleField::Description => "description",
        RuleField::Reference => "reference",
    };
    let operator = match rule.operator {
        RuleOperator::Contains => "contains",
        RuleOperator::Equals => "equals",
        RuleOperator::Prefix => "starts with",
    };
    format!("rule: {} {} '{}'", field, operator, rule.value)
}
