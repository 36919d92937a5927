//! Conversation grouping.
//!
//! A batch is grouped when it spans at most two hours, has exactly one
//! sender and one recipient, and every message shares at least one word
//! with the first message. Grouped batches join the sender's conversation
//! created within two hours of the batch start, or open a new one.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Duration;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::error::{BusError, Error, GroupingError, HandlerError};
use crate::events::{Event, EventConsumer, EventPublisher, EventType, routing};
use crate::models::{Conversation, Message};
use crate::store::Database;

/// Service identity on the bus.
pub const SERVICE_NAME: &str = "conversation-grouper";

/// Maximum span of a batch, and the conversation lookup radius.
pub const GROUPING_WINDOW_SECS: i64 = 2 * 60 * 60;

fn window() -> Duration {
    Duration::seconds(GROUPING_WINDOW_SECS)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupingAction {
    Created,
    Updated,
    NotGrouped,
}

impl GroupingAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::NotGrouped => "not_grouped",
        }
    }
}

/// Result of a grouping decision.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupingOutcome {
    /// `None` when not grouped.
    pub conversation_id: Option<Uuid>,
    pub action: GroupingAction,
    /// Conversation size after the update, or the batch size when not grouped.
    pub message_count: usize,
    /// Members added by this call.
    pub added: usize,
    /// Summary of the batch that was examined.
    pub summary: ConversationSummary,
}

/// Human-readable description of a message set.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversationSummary {
    pub summary: String,
    /// Fraction of messages sharing a word with the first message.
    pub confidence: f64,
}

fn word_set(content: &str) -> HashSet<String> {
    content
        .split_whitespace()
        .map(|w| w.to_lowercase())
        .collect()
}

/// Whether a batch belongs together.
///
/// A batch of fewer than two messages carries no grouping signal and is
/// never grouped.
pub fn should_group(messages: &[Message]) -> bool {
    if messages.len() < 2 {
        return false;
    }

    let (min, max) = messages.iter().fold(
        (messages[0].timestamp, messages[0].timestamp),
        |(lo, hi), m| (lo.min(m.timestamp), hi.max(m.timestamp)),
    );
    if max - min > window() {
        return false;
    }

    let senders: HashSet<&str> = messages.iter().map(|m| m.from_phone.as_str()).collect();
    let recipients: HashSet<&str> = messages.iter().map(|m| m.to_phone.as_str()).collect();
    if senders.len() != 1 || recipients.len() != 1 {
        return false;
    }

    let keywords = word_set(&messages[0].content);
    messages[1..]
        .iter()
        .all(|m| !keywords.is_disjoint(&word_set(&m.content)))
}

pub fn summarize(messages: &[Message]) -> ConversationSummary {
    let Some(first) = messages.first() else {
        return ConversationSummary {
            summary: String::new(),
            confidence: 0.0,
        };
    };
    let keywords = word_set(&first.content);
    let overlapping = messages
        .iter()
        .filter(|m| !keywords.is_disjoint(&word_set(&m.content)))
        .count();
    ConversationSummary {
        summary: format!(
            "{} messages between {} and {}.",
            messages.len(),
            first.from_phone,
            first.to_phone
        ),
        confidence: overlapping as f64 / messages.len() as f64,
    }
}

/// Assigns messages to conversations and publishes `CONVERSATION_UPDATED`.
pub struct GroupingEngine {
    db: Arc<dyn Database>,
    publisher: Arc<dyn EventPublisher>,
    /// Serializes find-or-create so racing batches cannot open duplicate
    /// conversations for the same window.
    write_lock: Mutex<()>,
}

impl GroupingEngine {
    pub fn new(db: Arc<dyn Database>, publisher: Arc<dyn EventPublisher>) -> Self {
        Self {
            db,
            publisher,
            write_lock: Mutex::new(()),
        }
    }

    pub fn register(self: &Arc<Self>, consumer: &mut EventConsumer) -> Result<(), BusError> {
        let engine = Arc::clone(self);
        consumer.subscribe_fn("message.received.#", move |event| {
            let engine = Arc::clone(&engine);
            async move { engine.handle_message_received(event).await }
        })
    }

    /// Group the given messages in the order given.
    ///
    /// Messages that already belong to a conversation pull the batch into
    /// that conversation, wherever its window lies. Re-grouping members only
    /// is a no-op that reports `updated` and never opens a conversation.
    pub async fn group_messages(
        &self,
        message_ids: &[Uuid],
    ) -> Result<GroupingOutcome, GroupingError> {
        let _guard = self.write_lock.lock().await;

        let mut messages = self.db.get_messages(message_ids).await?;
        messages.sort_by_key(|m| {
            let received = message_ids.iter().position(|id| *id == m.message_id);
            (m.timestamp, received)
        });
        let Some(first) = messages.first() else {
            return Err(GroupingError::NoMessages);
        };
        let summary = summarize(&messages);

        if !should_group(&messages) {
            return Ok(GroupingOutcome {
                conversation_id: None,
                action: GroupingAction::NotGrouped,
                message_count: messages.len(),
                added: 0,
                summary,
            });
        }

        let pending: Vec<Uuid> = messages
            .iter()
            .filter(|m| m.conversation_id.is_none())
            .map(|m| m.message_id)
            .collect();

        let (conversation_id, action) = match messages.iter().find_map(|m| m.conversation_id) {
            Some(existing) => (existing, GroupingAction::Updated),
            None => match self
                .db
                .find_conversation_in_window(
                    &first.from_phone,
                    first.timestamp - window(),
                    first.timestamp + window(),
                )
                .await?
            {
                Some(conversation) => (conversation.conversation_id, GroupingAction::Updated),
                None => {
                    let customer_id = messages.iter().find_map(|m| m.customer_id);
                    let conversation = Conversation::open(first.timestamp, customer_id);
                    self.db.create_conversation(&conversation).await?;
                    (conversation.conversation_id, GroupingAction::Created)
                }
            },
        };

        let added = if pending.is_empty() {
            0
        } else {
            self.db.append_messages(conversation_id, &pending).await?
        };
        let message_count = self
            .db
            .get_conversation(conversation_id)
            .await?
            .map(|c| c.message_ids.len())
            .unwrap_or(added);

        debug!(
            conversation_id = %conversation_id,
            action = action.as_str(),
            added,
            message_count,
            "Grouping decision"
        );
        Ok(GroupingOutcome {
            conversation_id: Some(conversation_id),
            action,
            message_count,
            added,
            summary,
        })
    }

    /// `message.received.#` handler. The batch is every message on the same
    /// sender/recipient pair in the window ending at the new message.
    pub async fn handle_message_received(&self, event: Event) -> Result<(), HandlerError> {
        let message_id = event.payload_uuid("message_id")?;
        let message = self
            .db
            .get_message(message_id)
            .await
            .map_err(|e| Error::from(GroupingError::from(e)))?
            .ok_or_else(|| Error::from(GroupingError::NoMessages))?;

        let batch = self
            .db
            .messages_between(
                &message.from_phone,
                &message.to_phone,
                message.timestamp - window(),
                message.timestamp,
            )
            .await
            .map_err(|e| Error::from(GroupingError::from(e)))?;
        let mut ids: Vec<Uuid> = batch.iter().map(|m| m.message_id).collect();
        if !ids.contains(&message_id) {
            ids.push(message_id);
        }

        let outcome = self.group_messages(&ids).await.map_err(Error::from)?;

        let Some(conversation_id) = outcome.conversation_id else {
            info!(
                trace_id = %event.trace_id,
                message_id = %message_id,
                batch = outcome.message_count,
                "Messages not grouped"
            );
            return Ok(());
        };

        if outcome.added == 0 {
            debug!(
                trace_id = %event.trace_id,
                conversation_id = %conversation_id,
                "No new members, nothing to publish"
            );
            return Ok(());
        }

        info!(
            trace_id = %event.trace_id,
            conversation_id = %conversation_id,
            action = outcome.action.as_str(),
            message_count = outcome.message_count,
            "Conversation updated"
        );

        let outbound = Event::caused_by(
            &event,
            EventType::ConversationUpdated,
            SERVICE_NAME,
            json!({
                "conversation_id": conversation_id.to_string(),
                "action": outcome.action.as_str(),
                "message_count": outcome.message_count,
                "message_id": message_id.to_string(),
                "summary": outcome.summary.summary,
                "summary_confidence": outcome.summary.confidence,
            }),
        );
        let key = routing::conversation_updated(outcome.action.as_str());
        if !self.publisher.publish(&outbound, &key) {
            error!(
                trace_id = %event.trace_id,
                conversation_id = %conversation_id,
                routing_key = %key,
                "Grouping committed but event publish failed"
            );
        }
        Ok(())
    }
}
