//! Two-tier classification with confidence gating.

use std::sync::Arc;

use serde_json::json;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::ai::{RetryPolicy, classify_with_retry};
use super::rules::classify_with_rules;
use crate::config::ClassifierConfig;
use crate::error::{BusError, ClassificationError, Error, HandlerError};
use crate::events::{Event, EventConsumer, EventPublisher, EventType, routing};
use crate::llm::{AiClassifier, ClassifyRequest};
use crate::models::{ClassificationResult, ClassificationTier, ConversationCategory};
use crate::store::Database;

/// Service identity on the bus.
pub const SERVICE_NAME: &str = "classifier-agent";

/// Reasoning recorded when neither tier was confident.
pub const DEFAULT_REASONING: &str = "no confident classification";

/// Classifies conversations and publishes `CONVERSATION_CATEGORIZED`.
pub struct ClassificationEngine {
    db: Arc<dyn Database>,
    publisher: Arc<dyn EventPublisher>,
    ai: Option<Arc<dyn AiClassifier>>,
    retry: RetryPolicy,
    ai_threshold: f64,
    rule_threshold: f64,
}

impl ClassificationEngine {
    pub fn new(
        db: Arc<dyn Database>,
        publisher: Arc<dyn EventPublisher>,
        ai: Option<Arc<dyn AiClassifier>>,
        config: &ClassifierConfig,
    ) -> Self {
        Self {
            db,
            publisher,
            ai,
            retry: RetryPolicy {
                max_attempts: config.max_attempts,
                backoff_unit: config.backoff_unit,
            },
            ai_threshold: config.ai_threshold,
            rule_threshold: config.rule_threshold,
        }
    }

    /// Bind the engine's handlers on its consumer.
    pub fn register(self: &Arc<Self>, consumer: &mut EventConsumer) -> Result<(), BusError> {
        for pattern in ["conversation.updated.created", "conversation.updated.updated"] {
            let engine = Arc::clone(self);
            consumer.subscribe_fn(pattern, move |event| {
                let engine = Arc::clone(&engine);
                async move { engine.handle_conversation_updated(event).await }
            })?;
        }
        Ok(())
    }

    /// Pick exactly one of the AI result, the rule result or the default.
    pub async fn decide(
        &self,
        conversation_id: Uuid,
        text: &str,
        context: serde_json::Map<String, serde_json::Value>,
    ) -> ClassificationResult {
        if let Some(ai) = &self.ai {
            let request = ClassifyRequest {
                text: text.to_string(),
                categories: ConversationCategory::ALL
                    .iter()
                    .map(|c| c.as_str().to_string())
                    .collect(),
                context,
            };
            match classify_with_retry(ai.as_ref(), &request, self.retry).await {
                Ok(verdict) if verdict.confidence >= self.ai_threshold => {
                    return ClassificationResult {
                        conversation_id,
                        category: verdict.category,
                        confidence: verdict.confidence,
                        reasoning: verdict.reasoning,
                        tier: ClassificationTier::Ai,
                    };
                }
                Ok(verdict) => debug!(
                    conversation_id = %conversation_id,
                    confidence = verdict.confidence,
                    "AI tier below threshold, falling back to rules"
                ),
                Err(e) => warn!(
                    conversation_id = %conversation_id,
                    error = %e,
                    "AI tier failed, falling back to rules"
                ),
            }
        }

        let rule = classify_with_rules(text);
        if rule.confidence >= self.rule_threshold {
            return ClassificationResult {
                conversation_id,
                category: rule.category,
                confidence: rule.confidence,
                reasoning: rule.reasoning,
                tier: ClassificationTier::Rule,
            };
        }

        ClassificationResult {
            conversation_id,
            category: ConversationCategory::Other,
            confidence: 0.0,
            reasoning: DEFAULT_REASONING.to_string(),
            tier: ClassificationTier::Default,
        }
    }

    /// Classify a stored conversation and commit the result.
    pub async fn classify_conversation(
        &self,
        conversation_id: Uuid,
    ) -> Result<ClassificationResult, ClassificationError> {
        self.reclassify(conversation_id).await.map(|(result, _)| result)
    }

    /// Like [`classify_conversation`](Self::classify_conversation), also
    /// returning the category committed before this call.
    async fn reclassify(
        &self,
        conversation_id: Uuid,
    ) -> Result<(ClassificationResult, Option<ConversationCategory>), ClassificationError> {
        let conversation = self
            .db
            .get_conversation(conversation_id)
            .await?
            .ok_or(ClassificationError::ConversationNotFound(conversation_id))?;

        let messages = self.db.conversation_messages(conversation_id).await?;
        if messages.is_empty() {
            return Err(ClassificationError::EmptyConversation(conversation_id));
        }
        let text = messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");

        let mut context = serde_json::Map::new();
        context.insert(
            "customer_id".into(),
            conversation
                .customer_id
                .map(|id| json!(id.to_string()))
                .unwrap_or(serde_json::Value::Null),
        );

        let result = self.decide(conversation_id, &text, context).await;
        self.db.update_classification(&result).await?;

        info!(
            conversation_id = %conversation_id,
            category = %result.category,
            confidence = result.confidence,
            tier = result.tier.as_str(),
            "Conversation classified"
        );
        Ok((result, conversation.category))
    }

    /// `conversation.updated.*` handler.
    pub async fn handle_conversation_updated(&self, event: Event) -> Result<(), HandlerError> {
        let conversation_id = event.payload_uuid("conversation_id")?;
        debug!(
            trace_id = %event.trace_id,
            conversation_id = %conversation_id,
            "Classifying conversation"
        );

        let (result, previous) = self
            .reclassify(conversation_id)
            .await
            .map_err(Error::from)?;

        let outbound = Event::caused_by(
            &event,
            EventType::ConversationCategorized,
            SERVICE_NAME,
            json!({
                "conversation_id": conversation_id.to_string(),
                "category": result.category.as_str(),
                "confidence": result.confidence,
                "reasoning": result.reasoning,
                "tier": result.tier.as_str(),
                "previous_category": previous.map(|c| c.as_str()),
                "category_changed": previous != Some(result.category),
            }),
        );
        let key = routing::conversation_categorized(result.category, result.confidence);
        if !self.publisher.publish(&outbound, &key) {
            error!(
                trace_id = %event.trace_id,
                conversation_id = %conversation_id,
                routing_key = %key,
                "Classification committed but event publish failed"
            );
        }
        Ok(())
    }
}
