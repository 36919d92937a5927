//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::models::{
    ClassificationResult, Conversation, ConversationCategory, DeliveryState, DeliveryStatus,
    Message, MessageType, SpamAction, SpamEvaluation,
};
use crate::store::migrations;
use crate::store::traits::{Database, DeliveryRecord};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        backend.init_schema().await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn member_ids(&self, conversation_id: Uuid) -> Result<Vec<Uuid>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT message_id FROM conversation_messages
                 WHERE conversation_id = ?1 ORDER BY position ASC",
                params![conversation_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("member_ids: {e}")))?;

        let mut ids = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let raw: String = row.get(0).map_err(row_err)?;
            ids.push(parse_uuid(&raw)?);
        }
        Ok(ids)
    }

    async fn load_conversations(
        &self,
        rows: &mut libsql::Rows,
    ) -> Result<Vec<Conversation>, DatabaseError> {
        let mut conversations = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            conversations.push(row_to_conversation(&row)?);
        }
        for conversation in &mut conversations {
            conversation.message_ids = self.member_ids(conversation.conversation_id).await?;
        }
        Ok(conversations)
    }

    async fn query_messages(
        &self,
        op: &str,
        sql: &str,
        values: Vec<libsql::Value>,
    ) -> Result<Vec<Message>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, values)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut messages = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            messages.push(row_to_message(&row)?);
        }
        Ok(messages)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Fixed-width UTC timestamp; sorts lexically in time order.
fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_uuid(s: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s).map_err(|e| DatabaseError::Serialization(format!("bad uuid '{s}': {e}")))
}

fn parse_optional_uuid(s: Option<String>) -> Result<Option<Uuid>, DatabaseError> {
    s.as_deref().map(parse_uuid).transpose()
}

fn row_err(e: libsql::Error) -> DatabaseError {
    DatabaseError::Query(format!("row parse: {e}"))
}

/// Convert `Option<String>` to libsql Value.
fn opt_text(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

fn str_to_delivery_state(s: &str) -> DeliveryState {
    match s {
        "delivered" => DeliveryState::Delivered,
        "pending" => DeliveryState::Pending,
        _ => DeliveryState::Failed,
    }
}

fn str_to_spam_action(s: &str) -> SpamAction {
    match s {
        "block" => SpamAction::Block,
        "flag" => SpamAction::Flag,
        _ => SpamAction::Allow,
    }
}

const MESSAGE_COLUMNS: &str =
    "id, message_type, from_phone, to_phone, content, timestamp, customer_id, conversation_id";

const CONVERSATION_COLUMNS: &str = "id, category, confidence, customer_id, created_at, updated_at";

fn row_to_message(row: &libsql::Row) -> Result<Message, DatabaseError> {
    let id: String = row.get(0).map_err(row_err)?;
    let message_type: String = row.get(1).map_err(row_err)?;
    let timestamp: String = row.get(5).map_err(row_err)?;

    Ok(Message {
        message_id: parse_uuid(&id)?,
        message_type: message_type
            .parse::<MessageType>()
            .map_err(DatabaseError::Serialization)?,
        from_phone: row.get(2).map_err(row_err)?,
        to_phone: row.get(3).map_err(row_err)?,
        content: row.get(4).map_err(row_err)?,
        timestamp: parse_datetime(&timestamp),
        customer_id: parse_optional_uuid(row.get(6).ok())?,
        conversation_id: parse_optional_uuid(row.get(7).ok())?,
    })
}

/// Conversation row without members; callers fill `message_ids`.
fn row_to_conversation(row: &libsql::Row) -> Result<Conversation, DatabaseError> {
    let id: String = row.get(0).map_err(row_err)?;
    let category: Option<String> = row.get(1).ok();
    let created: String = row.get(4).map_err(row_err)?;
    let updated: String = row.get(5).map_err(row_err)?;

    Ok(Conversation {
        conversation_id: parse_uuid(&id)?,
        message_ids: Vec::new(),
        category: category
            .map(|c| c.parse::<ConversationCategory>())
            .transpose()
            .map_err(DatabaseError::Serialization)?,
        confidence: row.get::<f64>(2).ok(),
        customer_id: parse_optional_uuid(row.get(3).ok())?,
        created_at: parse_datetime(&created),
        updated_at: parse_datetime(&updated),
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Messages ────────────────────────────────────────────────────

    async fn insert_message(&self, message: &Message) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO messages (id, message_type, from_phone, to_phone, content,
                    timestamp, customer_id, conversation_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    message.message_id.to_string(),
                    message.message_type.as_str(),
                    message.from_phone.as_str(),
                    message.to_phone.as_str(),
                    message.content.as_str(),
                    ts(&message.timestamp),
                    opt_text(message.customer_id.map(|u| u.to_string())),
                    opt_text(message.conversation_id.map(|u| u.to_string())),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_message: {e}")))?;

        debug!(message_id = %message.message_id, "Message inserted into DB");
        Ok(())
    }

    async fn get_message(&self, id: Uuid) -> Result<Option<Message>, DatabaseError> {
        let mut found = self
            .query_messages(
                "get_message",
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                vec![libsql::Value::Text(id.to_string())],
            )
            .await?;
        Ok(found.pop())
    }

    async fn get_messages(&self, ids: &[Uuid]) -> Result<Vec<Message>, DatabaseError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; ids.len()].join(", ");
        self.query_messages(
            "get_messages",
            &format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id IN ({placeholders})
                 ORDER BY timestamp ASC, id ASC"
            ),
            ids.iter()
                .map(|id| libsql::Value::Text(id.to_string()))
                .collect(),
        )
        .await
    }

    async fn messages_between(
        &self,
        from_phone: &str,
        to_phone: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<Message>, DatabaseError> {
        self.query_messages(
            "messages_between",
            &format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE from_phone = ?1 AND to_phone = ?2 AND timestamp >= ?3 AND timestamp <= ?4
                 ORDER BY timestamp ASC, id ASC"
            ),
            vec![
                libsql::Value::Text(from_phone.to_string()),
                libsql::Value::Text(to_phone.to_string()),
                libsql::Value::Text(ts(&since)),
                libsql::Value::Text(ts(&until)),
            ],
        )
        .await
    }

    // ── Conversations ───────────────────────────────────────────────

    async fn create_conversation(&self, conversation: &Conversation) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO conversations (id, category, confidence, customer_id, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    conversation.conversation_id.to_string(),
                    opt_text(conversation.category.map(|c| c.as_str().to_string())),
                    conversation
                        .confidence
                        .map(libsql::Value::Real)
                        .unwrap_or(libsql::Value::Null),
                    opt_text(conversation.customer_id.map(|u| u.to_string())),
                    ts(&conversation.created_at),
                    ts(&conversation.updated_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("create_conversation: {e}")))?;

        debug!(conversation_id = %conversation.conversation_id, "Conversation created");
        Ok(())
    }

    async fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_conversation: {e}")))?;

        Ok(self.load_conversations(&mut rows).await?.pop())
    }

    async fn find_conversation_in_window(
        &self,
        phone: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Option<Conversation>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT DISTINCT c.id, c.category, c.confidence, c.customer_id, c.created_at, c.updated_at
                 FROM conversations c
                 JOIN conversation_messages cm ON cm.conversation_id = c.id
                 JOIN messages m ON m.id = cm.message_id
                 WHERE (m.from_phone = ?1 OR m.to_phone = ?1)
                   AND c.created_at >= ?2 AND c.created_at <= ?3
                 ORDER BY c.created_at ASC, c.id ASC
                 LIMIT 1",
                params![phone, ts(&start), ts(&end)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("find_conversation_in_window: {e}")))?;

        Ok(self.load_conversations(&mut rows).await?.pop())
    }

    async fn append_messages(
        &self,
        conversation_id: Uuid,
        message_ids: &[Uuid],
    ) -> Result<usize, DatabaseError> {
        let conv = conversation_id.to_string();
        let mut added = 0;
        for message_id in message_ids {
            let msg = message_id.to_string();
            // UNIQUE(message_id) makes re-adding a member, or stealing a
            // message from another conversation, a no-op.
            let inserted = self
                .conn()
                .execute(
                    "INSERT OR IGNORE INTO conversation_messages (conversation_id, message_id, position)
                     SELECT ?1, m.id,
                        (SELECT COALESCE(MAX(position), -1) + 1
                         FROM conversation_messages WHERE conversation_id = ?1)
                     FROM messages m WHERE m.id = ?2",
                    params![conv.as_str(), msg.as_str()],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("append_messages: {e}")))?;

            if inserted > 0 {
                self.conn()
                    .execute(
                        "UPDATE messages SET conversation_id = ?1 WHERE id = ?2",
                        params![conv.as_str(), msg.as_str()],
                    )
                    .await
                    .map_err(|e| DatabaseError::Query(format!("append_messages: {e}")))?;
                added += 1;
            }
        }

        if added > 0 {
            self.conn()
                .execute(
                    "UPDATE conversations SET updated_at = ?1 WHERE id = ?2",
                    params![ts(&Utc::now()), conv.as_str()],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("append_messages: {e}")))?;
        }
        debug!(conversation_id = %conversation_id, added, "Messages appended");
        Ok(added)
    }

    async fn conversation_messages(
        &self,
        conversation_id: Uuid,
    ) -> Result<Vec<Message>, DatabaseError> {
        self.query_messages(
            "conversation_messages",
            "SELECT m.id, m.message_type, m.from_phone, m.to_phone, m.content, m.timestamp,
                    m.customer_id, m.conversation_id
             FROM conversation_messages cm
             JOIN messages m ON m.id = cm.message_id
             WHERE cm.conversation_id = ?1
             ORDER BY cm.position ASC",
            vec![libsql::Value::Text(conversation_id.to_string())],
        )
        .await
    }

    async fn update_classification(
        &self,
        result: &ClassificationResult,
    ) -> Result<(), DatabaseError> {
        let updated = self
            .conn()
            .execute(
                "UPDATE conversations
                 SET category = ?1, confidence = ?2, reasoning = ?3, tier = ?4, updated_at = ?5
                 WHERE id = ?6",
                params![
                    result.category.as_str(),
                    result.confidence,
                    result.reasoning.as_str(),
                    result.tier.as_str(),
                    ts(&Utc::now()),
                    result.conversation_id.to_string(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_classification: {e}")))?;

        if updated == 0 {
            return Err(DatabaseError::NotFound {
                entity: "conversation".into(),
                id: result.conversation_id.to_string(),
            });
        }
        Ok(())
    }

    async fn list_conversations(&self, limit: usize) -> Result<Vec<Conversation>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {CONVERSATION_COLUMNS} FROM conversations
                     ORDER BY updated_at DESC LIMIT ?1"
                ),
                params![limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_conversations: {e}")))?;

        self.load_conversations(&mut rows).await
    }

    // ── Decisions ───────────────────────────────────────────────────

    async fn record_spam_evaluation(
        &self,
        message_id: Uuid,
        evaluation: &SpamEvaluation,
    ) -> Result<(), DatabaseError> {
        let reasons = serde_json::to_string(&evaluation.reasons)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        self.conn()
            .execute(
                "INSERT INTO spam_evaluations (message_id, is_spam, score, action, reasons, evaluated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    message_id.to_string(),
                    evaluation.is_spam as i64,
                    evaluation.score,
                    evaluation.action.as_str(),
                    reasons,
                    ts(&Utc::now()),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_spam_evaluation: {e}")))?;
        Ok(())
    }

    async fn get_spam_evaluation(
        &self,
        message_id: Uuid,
    ) -> Result<Option<SpamEvaluation>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT is_spam, score, action, reasons FROM spam_evaluations
                 WHERE message_id = ?1 ORDER BY id DESC LIMIT 1",
                params![message_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_spam_evaluation: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let is_spam: i64 = row.get(0).map_err(row_err)?;
                let action: String = row.get(2).map_err(row_err)?;
                let reasons: String = row.get(3).map_err(row_err)?;
                Ok(Some(SpamEvaluation {
                    is_spam: is_spam != 0,
                    score: row.get(1).map_err(row_err)?,
                    reasons: serde_json::from_str(&reasons)
                        .map_err(|e| DatabaseError::Serialization(e.to_string()))?,
                    action: str_to_spam_action(&action),
                }))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_spam_evaluation: {e}"))),
        }
    }

    async fn record_delivery(&self, record: &DeliveryRecord) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO deliveries (id, conversation_id, recipient, content, status,
                    error_message, delivered_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    record.status.message_id.to_string(),
                    record.conversation_id.to_string(),
                    record.recipient.as_str(),
                    record.content.as_str(),
                    record.status.status.as_str(),
                    opt_text(record.status.error_message.clone()),
                    ts(&record.status.delivered_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_delivery: {e}")))?;
        Ok(())
    }

    async fn list_deliveries(
        &self,
        conversation_id: Uuid,
    ) -> Result<Vec<DeliveryRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, recipient, content, status, error_message, delivered_at
                 FROM deliveries WHERE conversation_id = ?1 ORDER BY delivered_at ASC",
                params![conversation_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_deliveries: {e}")))?;

        let mut records = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let id: String = row.get(0).map_err(row_err)?;
            let status: String = row.get(3).map_err(row_err)?;
            let delivered_at: String = row.get(5).map_err(row_err)?;
            records.push(DeliveryRecord {
                conversation_id,
                recipient: row.get(1).map_err(row_err)?,
                content: row.get(2).map_err(row_err)?,
                status: DeliveryStatus {
                    message_id: parse_uuid(&id)?,
                    status: str_to_delivery_state(&status),
                    delivered_at: parse_datetime(&delivered_at),
                    error_message: row.get(4).ok(),
                },
            });
        }
        Ok(records)
    }

    // ── External ids ────────────────────────────────────────────────

    async fn map_external_id(
        &self,
        system: &str,
        external_id: &str,
        internal_id: Uuid,
    ) -> Result<Uuid, DatabaseError> {
        self.conn()
            .execute(
                "INSERT OR IGNORE INTO external_ids (system, external_id, internal_id)
                 VALUES (?1, ?2, ?3)",
                params![system, external_id, internal_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("map_external_id: {e}")))?;

        self.resolve_external_id(system, external_id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "external_id".into(),
                id: format!("{system}:{external_id}"),
            })
    }

    async fn resolve_external_id(
        &self,
        system: &str,
        external_id: &str,
    ) -> Result<Option<Uuid>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT internal_id FROM external_ids WHERE system = ?1 AND external_id = ?2",
                params![system, external_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("resolve_external_id: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let raw: String = row.get(0).map_err(row_err)?;
                Ok(Some(parse_uuid(&raw)?))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("resolve_external_id: {e}"))),
        }
    }
}
