//! Keyword rule tier.
//!
//! A fixed, ordered list of (category, keywords). The first category with a
//! keyword that appears as a case-insensitive substring of the conversation
//! text wins.

use tracing::debug;

use crate::models::ConversationCategory;

/// Confidence of a keyword hit.
pub const RULE_MATCH_CONFIDENCE: f64 = 0.6;

/// Confidence when nothing matched.
pub const RULE_MISS_CONFIDENCE: f64 = 0.3;

/// Keyword table in priority order.
pub static CLASSIFICATION_RULES: &[(ConversationCategory, &[&str])] = &[
    (
        ConversationCategory::NewLead,
        &["interested", "quote", "estimate", "pricing", "new customer"],
    ),
    (
        ConversationCategory::QuoteRequest,
        &["quote", "estimate", "price", "cost"],
    ),
    (
        ConversationCategory::StatusUpdate,
        &["status", "update", "progress", "check in"],
    ),
    (
        ConversationCategory::Reminder,
        &["reminder", "appointment", "schedule", "upcoming"],
    ),
    (
        ConversationCategory::Spam,
        &["unsubscribe", "spam", "stop", "remove"],
    ),
    (
        ConversationCategory::Support,
        &["help", "support", "issue", "problem", "fix"],
    ),
    (ConversationCategory::Other, &[]),
];

/// Outcome of the rule tier.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleMatch {
    pub category: ConversationCategory,
    pub confidence: f64,
    pub reasoning: String,
}

/// Classify `text` against [`CLASSIFICATION_RULES`].
pub fn classify_with_rules(text: &str) -> RuleMatch {
    let lowered = text.to_lowercase();
    for (category, keywords) in CLASSIFICATION_RULES {
        if let Some(keyword) = keywords.iter().find(|kw| lowered.contains(**kw)) {
            debug!(category = %category, keyword, "Rule tier matched");
            return RuleMatch {
                category: *category,
                confidence: RULE_MATCH_CONFIDENCE,
                reasoning: format!("Matched keyword '{keyword}' for category '{category}'."),
            };
        }
    }
    RuleMatch {
        category: ConversationCategory::Other,
        confidence: RULE_MISS_CONFIDENCE,
        reasoning: "No keyword match found.".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_follows_category_priority() {
        let order: Vec<ConversationCategory> =
            CLASSIFICATION_RULES.iter().map(|(c, _)| *c).collect();
        assert_eq!(order, ConversationCategory::ALL.to_vec());
    }

    #[test]
    fn earlier_category_wins_on_shared_keyword() {
        // "quote" is listed under both new_lead and quote_request.
        let m = classify_with_rules("Could I get a QUOTE please?");
        assert_eq!(m.category, ConversationCategory::NewLead);
        assert_eq!(m.confidence, RULE_MATCH_CONFIDENCE);
        assert!(m.reasoning.contains("'quote'"));
    }

    #[test]
    fn matches_are_substrings() {
        // "price" inside "priceless" still counts.
        let m = classify_with_rules("that was priceless");
        assert_eq!(m.category, ConversationCategory::QuoteRequest);
    }

    #[test]
    fn multi_word_keyword() {
        let m = classify_with_rules("just wanted to check in on the job");
        assert_eq!(m.category, ConversationCategory::StatusUpdate);
    }

    #[test]
    fn no_match_defaults_to_other() {
        let m = classify_with_rules("hello there");
        assert_eq!(m.category, ConversationCategory::Other);
        assert_eq!(m.confidence, RULE_MISS_CONFIDENCE);
    }
}
