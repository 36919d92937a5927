//! Content signal: keyword hits and structural patterns.

use std::sync::LazyLock;

use regex::Regex;

/// Score added per keyword or pattern hit.
pub const HIT_WEIGHT: f64 = 0.2;

pub static SPAM_KEYWORDS: &[&str] = &[
    "free",
    "win",
    "winner",
    "prize",
    "cash",
    "urgent",
    "claim",
    "click",
    "buy now",
    "limited offer",
];

struct StructuralPattern {
    label: &'static str,
    regex: Regex,
}

static SPAM_PATTERNS: LazyLock<Vec<StructuralPattern>> = LazyLock::new(|| {
    [
        ("long digit run", r"\b\d{10,}\b"),
        ("URL", r"https?://[\w./-]+"),
        ("long uppercase run", r"[A-Z]{5,}"),
    ]
    .into_iter()
    .filter_map(|(label, pattern)| {
        Regex::new(pattern)
            .ok()
            .map(|regex| StructuralPattern { label, regex })
    })
    .collect()
});

#[derive(Debug, Clone, PartialEq)]
pub struct ContentAnalysis {
    /// Capped at 1.0.
    pub score: f64,
    pub reasons: Vec<String>,
}

/// Score message text. Keywords match as case-insensitive substrings;
/// each keyword and each pattern counts once.
pub fn analyze_content(text: &str) -> ContentAnalysis {
    let lowered = text.to_lowercase();
    let mut hits = 0u32;
    let mut reasons = Vec::new();

    for keyword in SPAM_KEYWORDS {
        if lowered.contains(keyword) {
            hits += 1;
            reasons.push(format!("Keyword detected: '{keyword}'"));
        }
    }
    for pattern in SPAM_PATTERNS.iter() {
        if pattern.regex.is_match(text) {
            hits += 1;
            reasons.push(format!(
                "Pattern matched: {} ({})",
                pattern.label,
                pattern.regex.as_str()
            ));
        }
    }

    ContentAnalysis {
        score: (f64::from(hits) * HIT_WEIGHT).min(1.0),
        reasons,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_message_scores_zero() {
        let a = analyze_content("Hi, can you come look at my sink tomorrow?");
        assert_eq!(a.score, 0.0);
        assert!(a.reasons.is_empty());
    }

    #[test]
    fn three_keywords_and_url_cap_at_one() {
        let a = analyze_content("URGENT winner! claim your cash prize at http://x.co/p");
        // urgent, win, winner, prize, cash, claim + URL + uppercase run
        assert_eq!(a.score, 1.0);
        assert!(a.reasons.iter().any(|r| r.contains("URL")));
        assert!(a.reasons.iter().any(|r| r.contains("'claim'")));
    }

    #[test]
    fn each_signal_adds_a_fifth() {
        let a = analyze_content("call 15551234567 now");
        assert!((a.score - 0.2).abs() < 1e-9);
        assert_eq!(a.reasons.len(), 1);
        assert!(a.reasons[0].contains("long digit run"));

        let b = analyze_content("Get it free, click here");
        assert!((b.score - 0.4).abs() < 1e-9);
    }

    #[test]
    fn multi_word_keywords() {
        let a = analyze_content("limited offer, buy now");
        assert_eq!(a.reasons.len(), 2);
    }

    #[test]
    fn short_digit_runs_and_short_caps_do_not_match() {
        assert_eq!(analyze_content("call 555 1234, ASAP").score, 0.0);
    }
}
