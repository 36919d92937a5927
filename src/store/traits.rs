//! Backend-agnostic persistence trait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::models::{ClassificationResult, Conversation, DeliveryStatus, Message, SpamEvaluation};

/// An outbound reply as recorded by the responder.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryRecord {
    pub conversation_id: Uuid,
    pub recipient: String,
    pub content: String,
    pub status: DeliveryStatus,
}

/// Persistence used by the ingestion boundary and every engine.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn init_schema(&self) -> Result<(), DatabaseError>;

    // ── Messages ────────────────────────────────────────────────────

    async fn insert_message(&self, message: &Message) -> Result<(), DatabaseError>;

    async fn get_message(&self, id: Uuid) -> Result<Option<Message>, DatabaseError>;

    /// Fetch messages by id, ordered by `(timestamp, id)`. Unknown ids are
    /// skipped.
    async fn get_messages(&self, ids: &[Uuid]) -> Result<Vec<Message>, DatabaseError>;

    /// Messages from `from_phone` to `to_phone` with `since <= timestamp <= until`,
    /// oldest first.
    async fn messages_between(
        &self,
        from_phone: &str,
        to_phone: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<Message>, DatabaseError>;

    // ── Conversations ───────────────────────────────────────────────

    /// Insert a conversation row. Members are added with
    /// [`append_messages`](Self::append_messages).
    async fn create_conversation(&self, conversation: &Conversation) -> Result<(), DatabaseError>;

    async fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>, DatabaseError>;

    /// Earliest conversation containing a message sent from or to `phone`,
    /// created within `[start, end]`.
    async fn find_conversation_in_window(
        &self,
        phone: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Option<Conversation>, DatabaseError>;

    /// Append messages in order. Messages that already belong to any
    /// conversation are left alone. Returns how many were added.
    async fn append_messages(
        &self,
        conversation_id: Uuid,
        message_ids: &[Uuid],
    ) -> Result<usize, DatabaseError>;

    /// Member messages in arrival order.
    async fn conversation_messages(
        &self,
        conversation_id: Uuid,
    ) -> Result<Vec<Message>, DatabaseError>;

    /// Overwrite category, confidence and reasoning as one update.
    async fn update_classification(
        &self,
        result: &ClassificationResult,
    ) -> Result<(), DatabaseError>;

    /// Most recently updated first.
    async fn list_conversations(&self, limit: usize) -> Result<Vec<Conversation>, DatabaseError>;

    // ── Decisions ───────────────────────────────────────────────────

    async fn record_spam_evaluation(
        &self,
        message_id: Uuid,
        evaluation: &SpamEvaluation,
    ) -> Result<(), DatabaseError>;

    /// Latest evaluation for a message.
    async fn get_spam_evaluation(
        &self,
        message_id: Uuid,
    ) -> Result<Option<SpamEvaluation>, DatabaseError>;

    async fn record_delivery(&self, record: &DeliveryRecord) -> Result<(), DatabaseError>;

    async fn list_deliveries(
        &self,
        conversation_id: Uuid,
    ) -> Result<Vec<DeliveryRecord>, DatabaseError>;

    // ── External ids ────────────────────────────────────────────────

    /// Remember that `external_id` in `system` refers to `internal_id`.
    /// Re-mapping an existing external id keeps the first mapping.
    async fn map_external_id(
        &self,
        system: &str,
        external_id: &str,
        internal_id: Uuid,
    ) -> Result<Uuid, DatabaseError>;

    async fn resolve_external_id(
        &self,
        system: &str,
        external_id: &str,
    ) -> Result<Option<Uuid>, DatabaseError>;
}
