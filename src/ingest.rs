//! Ingestion boundary.
//!
//! Validates and normalizes inbound messages, persists them, and announces
//! them on the bus. Nothing invalid gets past this point.

use std::sync::{Arc, LazyLock};

use chrono::{DateTime, SecondsFormat, Utc};
use regex::Regex;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::IngestError;
use crate::events::{Event, EventPublisher, EventType, routing};
use crate::models::{MAX_CONTENT_CHARS, Message, MessageType, is_valid_phone};
use crate::store::Database;

pub const SERVICE_NAME: &str = "ingest";

static SCRIPT_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<script\b[^>]*>.*?</script\s*>").expect("script regex is valid")
});

/// An inbound message as received from a channel.
#[derive(Debug, Clone, Deserialize)]
pub struct IncomingMessage {
    #[serde(rename = "type", default = "default_message_type")]
    pub message_type: MessageType,
    pub from: String,
    pub to: String,
    pub content: String,
    /// Provider timestamp; defaults to receipt time.
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub customer_id: Option<Uuid>,
}

fn default_message_type() -> MessageType {
    MessageType::Sms
}

/// Remove `<script>` blocks, trim, and cap at [`MAX_CONTENT_CHARS`].
pub fn sanitize_content(raw: &str) -> String {
    let stripped = SCRIPT_BLOCK.replace_all(raw, "");
    stripped.trim().chars().take(MAX_CONTENT_CHARS).collect()
}

pub struct IngestService {
    db: Arc<dyn Database>,
    publisher: Arc<dyn EventPublisher>,
}

impl IngestService {
    pub fn new(db: Arc<dyn Database>, publisher: Arc<dyn EventPublisher>) -> Self {
        Self { db, publisher }
    }

    /// Validate, store and publish `message.received.{type}.{known|unknown}`.
    ///
    /// The message is committed before publishing; a failed publish is
    /// reported but the stored message stays.
    pub async fn receive(
        &self,
        incoming: IncomingMessage,
        trace_id: Uuid,
    ) -> Result<Message, IngestError> {
        for (field, value) in [("from", &incoming.from), ("to", &incoming.to)] {
            if !is_valid_phone(value) {
                warn!(trace_id = %trace_id, field, value = %value, "Rejected invalid phone number");
                return Err(IngestError::InvalidPhone {
                    field: field.to_string(),
                    value: value.clone(),
                });
            }
        }

        let content = sanitize_content(&incoming.content);
        if content.is_empty() {
            return Err(IngestError::EmptyContent);
        }

        let mut message = Message::new(
            incoming.message_type,
            incoming.from,
            incoming.to,
            content,
            incoming.timestamp.unwrap_or_else(Utc::now),
        );
        message.customer_id = incoming.customer_id;

        self.db.insert_message(&message).await?;

        let event = Event::new(
            EventType::MessageReceived,
            SERVICE_NAME,
            trace_id,
            json!({
                "message_id": message.message_id.to_string(),
                "type": message.message_type.as_str(),
                "from": message.from_phone,
                "to": message.to_phone,
                "content": message.content,
                "timestamp": message.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true),
                "customer_id": message.customer_id.map(|id| id.to_string()),
            }),
        );
        let key = routing::message_received(message.message_type, message.customer_id.is_some());
        if !self.publisher.publish(&event, &key) {
            return Err(IngestError::PublishFailed(message.message_id));
        }

        info!(
            trace_id = %trace_id,
            message_id = %message.message_id,
            routing_key = %key,
            "Message ingested"
        );
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::TopicExchange;
    use crate::store::LibSqlBackend;

    fn incoming(from: &str, content: &str) -> IncomingMessage {
        IncomingMessage {
            message_type: MessageType::Sms,
            from: from.into(),
            to: "+15557654321".into(),
            content: content.into(),
            timestamp: None,
            customer_id: None,
        }
    }

    async fn setup() -> (IngestService, Arc<LibSqlBackend>, Arc<TopicExchange>) {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let exchange = TopicExchange::new("test", 16);
        exchange.bind("tap", "message.received.#").unwrap();
        (IngestService::new(db.clone(), exchange.clone()), db, exchange)
    }

    #[test]
    fn strips_scripts_and_truncates() {
        assert_eq!(
            sanitize_content("hi <SCRIPT type=\"x\">alert(1)</script > there"),
            "hi  there"
        );
        let long = "a".repeat(MAX_CONTENT_CHARS + 50);
        assert_eq!(sanitize_content(&long).chars().count(), MAX_CONTENT_CHARS);
    }

    #[test]
    fn deserializes_wire_shape() {
        let msg: IncomingMessage = serde_json::from_str(
            r#"{"type":"voicemail","from":"+15551234567","to":"+15557654321","content":"call me"}"#,
        )
        .unwrap();
        assert_eq!(msg.message_type, MessageType::Voicemail);
        assert!(msg.timestamp.is_none());
    }

    #[tokio::test]
    async fn valid_message_is_stored_and_published() {
        let (service, db, exchange) = setup().await;
        let trace = Uuid::new_v4();
        let stored = service
            .receive(incoming("+15551234567", "looking for a quote"), trace)
            .await
            .unwrap();

        assert_eq!(db.get_message(stored.message_id).await.unwrap().unwrap().content, "looking for a quote");

        let mut rx = exchange.queue("tap").unwrap().take_receiver().unwrap();
        let delivery = rx.try_recv().unwrap();
        assert_eq!(delivery.message.routing_key, "message.received.sms.unknown");
        let event = delivery.message.decode().unwrap();
        assert_eq!(event.trace_id, trace);
        assert_eq!(event.payload_uuid("message_id").unwrap(), stored.message_id);
    }

    #[tokio::test]
    async fn known_customer_changes_routing_key() {
        let (service, _, exchange) = setup().await;
        let mut msg = incoming("+15551234567", "hello");
        msg.customer_id = Some(Uuid::new_v4());
        service.receive(msg, Uuid::new_v4()).await.unwrap();

        let mut rx = exchange.queue("tap").unwrap().take_receiver().unwrap();
        assert_eq!(rx.try_recv().unwrap().message.routing_key, "message.received.sms.known");
    }

    #[tokio::test]
    async fn invalid_input_never_reaches_the_bus() {
        let (service, db, exchange) = setup().await;
        assert!(matches!(
            service.receive(incoming("555-1234", "hi"), Uuid::new_v4()).await,
            Err(IngestError::InvalidPhone { .. })
        ));
        assert!(matches!(
            service
                .receive(incoming("+15551234567", "<script>x</script>  "), Uuid::new_v4())
                .await,
            Err(IngestError::EmptyContent)
        ));
        assert_eq!(exchange.queue("tap").unwrap().stats().published, 0);
        assert!(db.list_conversations(10).await.unwrap().is_empty());
    }
}
