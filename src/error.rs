//! Error types for the communications pipeline.

use std::time::Duration;

use uuid::Uuid;

/// Top-level error type for the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Event bus error: {0}")]
    Bus(#[from] BusError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Classification error: {0}")]
    Classification(#[from] ClassificationError),

    #[error("Grouping error: {0}")]
    Grouping(#[from] GroupingError),

    #[error("Spam scoring error: {0}")]
    Spam(#[from] SpamError),

    #[error("Responder error: {0}")]
    Responder(#[from] ResponderError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Ingest error: {0}")]
    Ingest(#[from] IngestError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Event bus errors.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Exchange {0} is closed")]
    Closed(String),

    #[error("Queue {0} is already being consumed")]
    AlreadyConsuming(String),

    #[error("Pattern {pattern} already has a handler on queue {queue}")]
    DuplicateHandler { queue: String, pattern: String },

    #[error("Invalid topic pattern '{0}'")]
    InvalidPattern(String),

    #[error("Wire codec error: {0}")]
    Codec(String),
}

/// Errors raised by an event handler. Any of these causes a negative
/// acknowledgement of the delivery.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("Event {event_id} is missing required field '{field}'")]
    MissingField { event_id: Uuid, field: String },

    #[error("Event {event_id} has malformed field '{field}': {reason}")]
    MalformedField {
        event_id: Uuid,
        field: String,
        reason: String,
    },

    #[error("No handler bound for pattern '{0}'")]
    NoHandler(String),

    #[error("Handler panicked: {0}")]
    Panicked(String),

    #[error(transparent)]
    Engine(#[from] Error),
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Classification engine errors.
#[derive(Debug, thiserror::Error)]
pub enum ClassificationError {
    #[error("Conversation {0} not found")]
    ConversationNotFound(Uuid),

    #[error("Conversation {0} has no messages")]
    EmptyConversation(Uuid),

    #[error("AI classification gave up after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("Unparseable classifier output: {0}")]
    Parse(String),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Grouping engine errors.
#[derive(Debug, thiserror::Error)]
pub enum GroupingError {
    #[error("No messages found for the provided ids")]
    NoMessages,

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Spam scoring errors.
#[derive(Debug, thiserror::Error)]
pub enum SpamError {
    #[error("Reputation lookup failed: {0}")]
    LookupFailed(String),

    #[error("Reputation lookup timed out after {0:?}")]
    LookupTimeout(Duration),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Auto-response errors.
#[derive(Debug, thiserror::Error)]
pub enum ResponderError {
    #[error("Template {0} not found")]
    TemplateNotFound(String),

    #[error("Template {template_id} has unresolved placeholder '{placeholder}'")]
    UnresolvedPlaceholder {
        template_id: String,
        placeholder: String,
    },

    #[error("Conversation {0} not found")]
    ConversationNotFound(Uuid),

    #[error("Conversation {0} has no recipient")]
    NoRecipient(Uuid),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// SMS gateway errors. Send failures are folded into a failed
/// `DeliveryStatus`; only gateway construction surfaces them.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("SMS gateway not configured")]
    NotConfigured,

    #[error("Gateway {gateway} rejected the message: {reason}")]
    Rejected { gateway: String, reason: String },

    #[error("HTTP error: {0}")]
    Http(String),
}

/// Ingestion boundary errors.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("Invalid {field} phone number: {value}")]
    InvalidPhone { field: String, value: String },

    #[error("Message content is empty")]
    EmptyContent,

    #[error("Event publish failed for message {0}")]
    PublishFailed(Uuid),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Result type alias for the pipeline.
pub type Result<T> = std::result::Result<T, Error>;
