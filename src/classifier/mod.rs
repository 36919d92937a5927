//! Conversation intent classification.
//!
//! The AI tier is tried first and accepted at confidence ≥ 0.7. Otherwise
//! the keyword rule tier is accepted at ≥ 0.5. Otherwise the conversation
//! is committed as `other` with confidence 0. Exactly one result is
//! committed per classification.

pub mod ai;
pub mod engine;
pub mod rules;

pub use ai::{AiVerdict, RetryPolicy, classify_with_retry, parse_classification};
pub use engine::{ClassificationEngine, SERVICE_NAME};
pub use rules::{CLASSIFICATION_RULES, RuleMatch, classify_with_rules};
