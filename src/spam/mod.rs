//! Spam scoring.
//!
//! `score = 0.5·content + 0.3·reputation + 0.2·timing`. Block at ≥ 0.8,
//! flag at ≥ 0.6, otherwise allow.

pub mod content;
pub mod engine;
pub mod limits;
pub mod reputation;

pub use content::{ContentAnalysis, SPAM_KEYWORDS, analyze_content};
pub use engine::{SERVICE_NAME, SpamEngine};
pub use limits::{RateLimiter, ReputationCache};
pub use reputation::{
    HttpReputationLookup, ReputationLookup, ReputationScore, ReputationService, ReputationSource,
    heuristic_reputation,
};
