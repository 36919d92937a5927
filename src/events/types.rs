//! Event envelope, wire codec, and routing keys.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{BusError, HandlerError};
use crate::models::{ConversationCategory, DeliveryState, MessageType, SpamAction};

// ── Event ───────────────────────────────────────────────────────────

/// Kind of domain event carried on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    MessageReceived,
    ConversationUpdated,
    ConversationCategorized,
    MessageFlagged,
    MessageSent,
    CustomerCreated,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MessageReceived => "MESSAGE_RECEIVED",
            Self::ConversationUpdated => "CONVERSATION_UPDATED",
            Self::ConversationCategorized => "CONVERSATION_CATEGORIZED",
            Self::MessageFlagged => "MESSAGE_FLAGGED",
            Self::MessageSent => "MESSAGE_SENT",
            Self::CustomerCreated => "CUSTOMER_CREATED",
        }
    }
}

/// Immutable domain event.
///
/// `trace_id` is shared by every event caused by the same originating
/// request; use [`Event::caused_by`] when publishing in reaction to another
/// event so it carries over.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_id: Uuid,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub trace_id: Uuid,
    pub source_service: String,
    pub payload: serde_json::Value,
}

impl Event {
    /// Start a new causal chain.
    pub fn new(
        event_type: EventType,
        source_service: impl Into<String>,
        trace_id: Uuid,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type,
            timestamp: Utc::now(),
            trace_id,
            source_service: source_service.into(),
            payload,
        }
    }

    /// A follow-up event in the same trace as `parent`.
    pub fn caused_by(
        parent: &Event,
        event_type: EventType,
        source_service: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self::new(event_type, source_service, parent.trace_id, payload)
    }

    /// Required string field of the payload.
    pub fn payload_str(&self, field: &str) -> Result<&str, HandlerError> {
        match self.payload.get(field) {
            Some(serde_json::Value::String(s)) if !s.is_empty() => Ok(s),
            Some(serde_json::Value::Null) | None => Err(HandlerError::MissingField {
                event_id: self.event_id,
                field: field.to_string(),
            }),
            Some(serde_json::Value::String(_)) => Err(HandlerError::MissingField {
                event_id: self.event_id,
                field: field.to_string(),
            }),
            Some(other) => Err(HandlerError::MalformedField {
                event_id: self.event_id,
                field: field.to_string(),
                reason: format!("expected string, got {other}"),
            }),
        }
    }

    /// Required UUID field of the payload.
    pub fn payload_uuid(&self, field: &str) -> Result<Uuid, HandlerError> {
        let raw = self.payload_str(field)?;
        Uuid::parse_str(raw).map_err(|e| HandlerError::MalformedField {
            event_id: self.event_id,
            field: field.to_string(),
            reason: e.to_string(),
        })
    }
}

// ── Wire format ─────────────────────────────────────────────────────

pub const HEADER_EVENT_TYPE: &str = "event_type";
pub const HEADER_TRACE_ID: &str = "trace_id";
pub const HEADER_SOURCE_SERVICE: &str = "source_service";
pub const HEADER_CONTENT_TYPE: &str = "content_type";

/// A serialized event as it travels through the exchange: JSON body plus
/// routing headers.
#[derive(Debug, Clone, PartialEq)]
pub struct WireMessage {
    pub routing_key: String,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl WireMessage {
    pub fn encode(event: &Event, routing_key: &str) -> Result<Self, BusError> {
        let body = serde_json::to_vec(event).map_err(|e| BusError::Codec(e.to_string()))?;
        let mut headers = BTreeMap::new();
        headers.insert(HEADER_EVENT_TYPE.into(), event.event_type.as_str().into());
        headers.insert(HEADER_TRACE_ID.into(), event.trace_id.to_string());
        headers.insert(HEADER_SOURCE_SERVICE.into(), event.source_service.clone());
        headers.insert(HEADER_CONTENT_TYPE.into(), "application/json".into());
        Ok(Self {
            routing_key: routing_key.to_string(),
            headers,
            body,
        })
    }

    pub fn decode(&self) -> Result<Event, BusError> {
        serde_json::from_slice(&self.body).map_err(|e| BusError::Codec(e.to_string()))
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

// ── Routing keys ────────────────────────────────────────────────────

/// Routing key builders. Keys carry the decision outcome so consumers can
/// filter on it.
pub mod routing {
    use super::*;

    /// `message.received.{type}.{customer_status}`
    pub fn message_received(message_type: MessageType, known_customer: bool) -> String {
        let status = if known_customer { "known" } else { "unknown" };
        format!("message.received.{message_type}.{status}")
    }

    /// `conversation.updated.{action}`
    pub fn conversation_updated(action: &str) -> String {
        format!("conversation.updated.{action}")
    }

    /// `conversation.categorized.{category}.{confidence_percent}`
    pub fn conversation_categorized(category: ConversationCategory, confidence: f64) -> String {
        format!(
            "conversation.categorized.{category}.{}",
            confidence_percent(confidence)
        )
    }

    /// `message.flagged.{action}.{score_bucket}`
    pub fn message_flagged(action: SpamAction, score: f64) -> String {
        format!("message.flagged.{action}.{}", score_bucket(score))
    }

    /// `message.sent.{method}.{status}`
    pub fn message_sent(method: &str, status: DeliveryState) -> String {
        format!("message.sent.{method}.{status}")
    }

    /// Confidence as a truncated integer percentage, 0..=100.
    pub fn confidence_percent(confidence: f64) -> u32 {
        (confidence.clamp(0.0, 1.0) * 100.0).floor() as u32
    }

    /// Score rounded down to its decile, as a percentage (0, 10, ..., 100).
    pub fn score_bucket(score: f64) -> u32 {
        ((score.clamp(0.0, 1.0) * 10.0).floor() as u32) * 10
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event() -> Event {
        Event::new(
            EventType::MessageReceived,
            "ingest",
            Uuid::new_v4(),
            serde_json::json!({"message_id": Uuid::new_v4().to_string(), "content": "hi"}),
        )
    }

    #[test]
    fn wire_round_trip_preserves_identity() {
        let event = sample_event();
        let wire = WireMessage::encode(&event, "message.received.sms.unknown").unwrap();
        let decoded = wire.decode().unwrap();
        assert_eq!(decoded.event_id, event.event_id);
        assert_eq!(decoded.trace_id, event.trace_id);
        assert_eq!(decoded.payload, event.payload);
        assert_eq!(decoded, event);
    }

    #[test]
    fn wire_headers_carry_routing_metadata() {
        let event = sample_event();
        let wire = WireMessage::encode(&event, "message.received.sms.unknown").unwrap();
        assert_eq!(wire.header(HEADER_EVENT_TYPE), Some("MESSAGE_RECEIVED"));
        assert_eq!(
            wire.header(HEADER_TRACE_ID),
            Some(event.trace_id.to_string().as_str())
        );
        assert_eq!(wire.header(HEADER_SOURCE_SERVICE), Some("ingest"));
    }

    #[test]
    fn decode_rejects_garbage() {
        let wire = WireMessage {
            routing_key: "x.y".into(),
            headers: BTreeMap::new(),
            body: b"not json".to_vec(),
        };
        assert!(matches!(wire.decode(), Err(BusError::Codec(_))));
    }

    #[test]
    fn caused_by_propagates_trace() {
        let parent = sample_event();
        let child = Event::caused_by(
            &parent,
            EventType::ConversationUpdated,
            "conversation-grouper",
            serde_json::json!({}),
        );
        assert_eq!(child.trace_id, parent.trace_id);
        assert_ne!(child.event_id, parent.event_id);
    }

    #[test]
    fn payload_accessors() {
        let id = Uuid::new_v4();
        let event = Event::new(
            EventType::ConversationUpdated,
            "t",
            Uuid::new_v4(),
            serde_json::json!({"conversation_id": id.to_string(), "bad": "nope", "num": 3, "empty": ""}),
        );
        assert_eq!(event.payload_uuid("conversation_id").unwrap(), id);
        assert!(matches!(
            event.payload_uuid("missing"),
            Err(HandlerError::MissingField { .. })
        ));
        assert!(matches!(
            event.payload_uuid("bad"),
            Err(HandlerError::MalformedField { .. })
        ));
        assert!(matches!(
            event.payload_str("num"),
            Err(HandlerError::MalformedField { .. })
        ));
        assert!(matches!(
            event.payload_str("empty"),
            Err(HandlerError::MissingField { .. })
        ));
    }

    #[test]
    fn event_type_serializes_screaming_snake() {
        let json = serde_json::to_value(EventType::ConversationCategorized).unwrap();
        assert_eq!(json, "CONVERSATION_CATEGORIZED");
    }

    #[test]
    fn routing_keys() {
        assert_eq!(
            routing::message_received(MessageType::Sms, false),
            "message.received.sms.unknown"
        );
        assert_eq!(
            routing::conversation_categorized(ConversationCategory::NewLead, 0.85),
            "conversation.categorized.new_lead.85"
        );
        assert_eq!(
            routing::conversation_categorized(ConversationCategory::Other, 0.0),
            "conversation.categorized.other.0"
        );
        assert_eq!(
            routing::message_flagged(SpamAction::Block, 0.91),
            "message.flagged.block.90"
        );
        assert_eq!(
            routing::message_sent("sms", DeliveryState::Failed),
            "message.sent.sms.failed"
        );
    }

    #[test]
    fn confidence_percent_truncates() {
        assert_eq!(routing::confidence_percent(0.7), 70);
        assert_eq!(routing::confidence_percent(0.999), 99);
        assert_eq!(routing::confidence_percent(1.0), 100);
        assert_eq!(routing::confidence_percent(1.7), 100);
    }
}
