//! Deterministic rule tier. Rules are evaluated in descending priority and
//! the first hit wins; matching is case-insensitive.

use crate::domain::{NormalizedRecord, RuleCondition, RuleField, RuleOperator};

pub struct RuleEngine {
    rules: Vec<RuleCondition>,
}

impl RuleEngine {
    /// Sort is stable, so rules sharing a priority keep their given order.
    pub fn new(mut rules: Vec<RuleCondition>) -> Self {
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));
        Self { rules }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn evaluate(&self, record: &NormalizedRecord) -> Option<&RuleCondition> {
        self.rules.iter().find(|rule| matches(rule, record))
    }
}

fn matches(rule: &RuleCondition, record: &NormalizedRecord) -> bool {
    let subject = match rule.field {
        RuleField::Description => record.description.as_str(),
        RuleField::Reference => match record.reference.as_deref() {
            Some(reference) => reference,
            None => return false,
        },
    };
    let subject = subject.to_lowercase();
    let value = rule.value.to_lowercase();

    match rule.operator {
        RuleOperator::Contains => subject.contains(&value),
        RuleOperator::Equals => subject == value,
        RuleOperator::Prefix => subject.starts_with(&value),
    }
}
