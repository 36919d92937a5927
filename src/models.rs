//! Domain types shared by every engine.
//!
//! Messages are immutable after ingestion apart from their conversation
//! assignment. Conversations grow monotonically; classification overwrites
//! `category`/`confidence` as a unit.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum stored message body length, in characters.
pub const MAX_CONTENT_CHARS: usize = 1600;

static E164: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\+?[1-9]\d{1,14}$").expect("E.164 regex is valid")
});

/// Whether `phone` is an E.164 number (leading `+` optional).
pub fn is_valid_phone(phone: &str) -> bool {
    E164.is_match(phone)
}

// ── Message ─────────────────────────────────────────────────────────

/// Inbound communication medium.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Sms,
    Call,
    Voicemail,
    Email,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sms => "sms",
            Self::Call => "call",
            Self::Voicemail => "voicemail",
            Self::Email => "email",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sms" => Ok(Self::Sms),
            "call" => Ok(Self::Call),
            "voicemail" => Ok(Self::Voicemail),
            "email" => Ok(Self::Email),
            other => Err(format!("unknown message type: {other}")),
        }
    }
}

/// A stored inbound message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub message_id: Uuid,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    #[serde(rename = "from")]
    pub from_phone: String,
    #[serde(rename = "to")]
    pub to_phone: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub customer_id: Option<Uuid>,
    #[serde(default)]
    pub conversation_id: Option<Uuid>,
}

impl Message {
    /// Create a fresh message with a new id and no conversation.
    pub fn new(
        message_type: MessageType,
        from_phone: impl Into<String>,
        to_phone: impl Into<String>,
        content: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            message_type,
            from_phone: from_phone.into(),
            to_phone: to_phone.into(),
            content: content.into(),
            timestamp,
            customer_id: None,
            conversation_id: None,
        }
    }
}

// ── Conversation ────────────────────────────────────────────────────

/// Intent category assigned to a conversation.
///
/// Declaration order is the rule-tier priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationCategory {
    NewLead,
    QuoteRequest,
    StatusUpdate,
    Reminder,
    Spam,
    Support,
    Other,
}

impl ConversationCategory {
    /// Every category, in priority order.
    pub const ALL: [ConversationCategory; 7] = [
        Self::NewLead,
        Self::QuoteRequest,
        Self::StatusUpdate,
        Self::Reminder,
        Self::Spam,
        Self::Support,
        Self::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NewLead => "new_lead",
            Self::QuoteRequest => "quote_request",
            Self::StatusUpdate => "status_update",
            Self::Reminder => "reminder",
            Self::Spam => "spam",
            Self::Support => "support",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for ConversationCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConversationCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase();
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == normalized)
            .ok_or_else(|| format!("unknown category: {s}"))
    }
}

/// A group of related messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub conversation_id: Uuid,
    /// Member message ids in arrival order, no duplicates.
    pub message_ids: Vec<Uuid>,
    pub category: Option<ConversationCategory>,
    pub confidence: Option<f64>,
    pub customer_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    /// A new, empty, unclassified conversation opened at `created_at`.
    pub fn open(created_at: DateTime<Utc>, customer_id: Option<Uuid>) -> Self {
        Self {
            conversation_id: Uuid::new_v4(),
            message_ids: Vec::new(),
            category: None,
            confidence: None,
            customer_id,
            created_at,
            updated_at: Utc::now(),
        }
    }
}

// ── Decision results ────────────────────────────────────────────────

/// Which classification tier produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationTier {
    Ai,
    Rule,
    Default,
}

impl ClassificationTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ai => "ai",
            Self::Rule => "rule",
            Self::Default => "default",
        }
    }
}

/// The single committed classification of a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub conversation_id: Uuid,
    pub category: ConversationCategory,
    pub confidence: f64,
    pub reasoning: String,
    pub tier: ClassificationTier,
}

/// Outcome of a spam evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpamAction {
    Allow,
    Flag,
    Block,
}

impl SpamAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Flag => "flag",
            Self::Block => "block",
        }
    }
}

impl fmt::Display for SpamAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Weighted multi-signal spam verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpamEvaluation {
    pub is_spam: bool,
    pub score: f64,
    pub reasons: Vec<String>,
    pub action: SpamAction,
}

/// Delivery state of an outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Pending,
    Delivered,
    Failed,
}

impl DeliveryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of an outbound delivery attempt. Always produced, never raised.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryStatus {
    /// Internal id; gateway ids live in the external id mapping table.
    pub message_id: Uuid,
    pub status: DeliveryState,
    pub delivered_at: DateTime<Utc>,
    pub error_message: Option<String>,
}

impl DeliveryStatus {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            status: DeliveryState::Failed,
            delivered_at: Utc::now(),
            error_message: Some(error.into()),
        }
    }
}

/// Trigger for an automated reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoResponseRule {
    pub trigger_category: ConversationCategory,
    #[serde(default)]
    pub conditions: serde_json::Map<String, serde_json::Value>,
    pub template_id: String,
    #[serde(default)]
    pub delay_seconds: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phone_validation() {
        assert!(is_valid_phone("+15551234567"));
        assert!(is_valid_phone("15551234567"));
        assert!(!is_valid_phone("+05551234567"));
        assert!(!is_valid_phone("555-123-4567"));
        assert!(!is_valid_phone("+1234567890123456"));
        assert!(!is_valid_phone(""));
    }

    #[test]
    fn category_parse_is_case_insensitive() {
        assert_eq!(
            "Quote_Request".parse::<ConversationCategory>().unwrap(),
            ConversationCategory::QuoteRequest
        );
        assert!("escalation".parse::<ConversationCategory>().is_err());
    }

    #[test]
    fn message_serializes_with_wire_names() {
        let msg = Message::new(
            MessageType::Sms,
            "+15551234567",
            "+15557654321",
            "hello",
            Utc::now(),
        );
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "sms");
        assert_eq!(json["from"], "+15551234567");
        assert_eq!(json["to"], "+15557654321");
    }

    #[test]
    fn category_order_is_priority_order() {
        assert_eq!(ConversationCategory::ALL[0], ConversationCategory::NewLead);
        assert_eq!(ConversationCategory::ALL[6], ConversationCategory::Other);
    }
}
