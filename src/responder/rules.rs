//! Auto-response ruleset.
//!
//! The ruleset is swapped as a whole; readers evaluate an `Arc` snapshot so
//! a concurrent replacement never mixes old and new rules.

use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, info};

use super::template::WELCOME_NEW_LEAD;
use crate::models::{AutoResponseRule, ConversationCategory};

/// Condition key: minimum classification confidence for the rule to fire.
pub const CONDITION_MIN_CONFIDENCE: &str = "min_confidence";

pub fn default_rules() -> Vec<AutoResponseRule> {
    vec![AutoResponseRule {
        trigger_category: ConversationCategory::NewLead,
        conditions: serde_json::Map::new(),
        template_id: WELCOME_NEW_LEAD.to_string(),
        delay_seconds: 0,
    }]
}

/// Whether `rule` fires for a conversation classified as `category` with
/// `confidence`. Unrecognised condition keys are ignored.
pub fn rule_matches(rule: &AutoResponseRule, category: ConversationCategory, confidence: f64) -> bool {
    if rule.trigger_category != category {
        return false;
    }
    for (key, value) in &rule.conditions {
        match (key.as_str(), value.as_f64()) {
            (CONDITION_MIN_CONFIDENCE, Some(min)) if confidence < min => return false,
            (CONDITION_MIN_CONFIDENCE, _) => {}
            (other, _) => debug!(condition = other, "Ignoring unknown rule condition"),
        }
    }
    true
}

pub struct RuleStore {
    rules: RwLock<Arc<Vec<AutoResponseRule>>>,
}

impl Default for RuleStore {
    fn default() -> Self {
        Self::new(default_rules())
    }
}

impl RuleStore {
    pub fn new(rules: Vec<AutoResponseRule>) -> Self {
        Self {
            rules: RwLock::new(Arc::new(rules)),
        }
    }

    pub fn snapshot(&self) -> Arc<Vec<AutoResponseRule>> {
        Arc::clone(&self.rules.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Replace the whole ruleset.
    pub fn replace(&self, rules: Vec<AutoResponseRule>) {
        let count = rules.len();
        *self.rules.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(rules);
        info!(rules = count, "Auto-response ruleset replaced");
    }

    /// First matching rule in the current snapshot.
    pub fn find(&self, category: ConversationCategory, confidence: f64) -> Option<AutoResponseRule> {
        self.snapshot()
            .iter()
            .find(|r| rule_matches(r, category, confidence))
            .cloned()
    }
}
