//! Topic pattern matching with AMQP semantics.
//!
//! Keys and patterns are dot-separated words. In a pattern `*` matches
//! exactly one word and `#` matches zero or more words.

use crate::error::BusError;

/// A validated binding pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicPattern {
    raw: String,
    segments: Vec<String>,
}

impl TopicPattern {
    pub fn parse(pattern: &str) -> Result<Self, BusError> {
        if pattern.is_empty() {
            return Err(BusError::InvalidPattern(pattern.to_string()));
        }
        let segments: Vec<String> = pattern.split('.').map(String::from).collect();
        for segment in &segments {
            let wildcard_mixed =
                segment.len() > 1 && (segment.contains('*') || segment.contains('#'));
            if segment.is_empty() || wildcard_mixed {
                return Err(BusError::InvalidPattern(pattern.to_string()));
            }
        }
        Ok(Self {
            raw: pattern.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn matches(&self, routing_key: &str) -> bool {
        let words: Vec<&str> = routing_key.split('.').collect();
        let pattern: Vec<&str> = self.segments.iter().map(String::as_str).collect();
        match_segments(&pattern, &words)
    }
}

fn match_segments(pattern: &[&str], words: &[&str]) -> bool {
    match pattern.split_first() {
        None => words.is_empty(),
        Some((&"#", rest)) => {
            // Consume zero words, then try consuming one at a time.
            (0..=words.len()).any(|skip| match_segments(rest, &words[skip..]))
        }
        Some((&"*", rest)) => !words.is_empty() && match_segments(rest, &words[1..]),
        Some((literal, rest)) => {
            words.first().is_some_and(|w| w == literal) && match_segments(rest, &words[1..])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn m(pattern: &str, key: &str) -> bool {
        TopicPattern::parse(pattern).unwrap().matches(key)
    }

    #[test]
    fn literal_match() {
        assert!(m("conversation.updated.created", "conversation.updated.created"));
        assert!(!m("conversation.updated.created", "conversation.updated.updated"));
    }

    #[test]
    fn star_matches_exactly_one_word() {
        assert!(m("conversation.updated.*", "conversation.updated.created"));
        assert!(!m("conversation.updated.*", "conversation.updated"));
        assert!(!m("message.received.*", "message.received.sms.unknown"));
        assert!(m("message.received.*.*", "message.received.sms.unknown"));
    }

    #[test]
    fn hash_matches_zero_or_more() {
        assert!(m("message.received.#", "message.received"));
        assert!(m("message.received.#", "message.received.sms"));
        assert!(m("message.received.#", "message.received.sms.unknown"));
        assert!(m("#", "anything.at.all"));
        assert!(m("#.failed", "message.sent.sms.failed"));
        assert!(!m("#.failed", "message.sent.sms.delivered"));
    }

    #[test]
    fn rejects_malformed_patterns() {
        assert!(TopicPattern::parse("").is_err());
        assert!(TopicPattern::parse("a..b").is_err());
        assert!(TopicPattern::parse("a.b*").is_err());
        assert!(TopicPattern::parse("a.#x").is_err());
    }
}
