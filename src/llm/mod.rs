//! LLM integration for conversation classification.
//!
//! The classifier engine only needs free-form text back; parsing and retry
//! live in the engine. [`OpenAiClassifier`] speaks the chat-completions API
//! over `reqwest`.

mod openai;

pub use openai::OpenAiClassifier;

use async_trait::async_trait;

use crate::error::LlmError;

/// Max tokens for a classification call.
pub const CLASSIFY_MAX_TOKENS: u32 = 256;

/// Temperature for classification.
pub const CLASSIFY_TEMPERATURE: f32 = 0.2;

/// Input to an AI classification call.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifyRequest {
    /// Conversation text, one message per line.
    pub text: String,
    /// Allowed category names.
    pub categories: Vec<String>,
    /// Extra facts about the conversation (customer id, ...).
    pub context: serde_json::Map<String, serde_json::Value>,
}

/// External classifier collaborator. Returns raw model output that is
/// expected to contain one JSON object somewhere in it.
#[async_trait]
pub trait AiClassifier: Send + Sync {
    fn model_name(&self) -> &str;

    async fn classify(&self, request: &ClassifyRequest) -> Result<String, LlmError>;
}

pub fn build_system_prompt() -> String {
    "You are a classification assistant.".to_string()
}

pub fn build_user_prompt(request: &ClassifyRequest) -> String {
    let context = serde_json::Value::Object(request.context.clone());
    format!(
        "You are an expert conversation classifier. \
         Classify the following conversation into one of these categories: [{}]. \
         Respond ONLY in valid JSON with the following fields: category, confidence, reasoning. \
         Example: {{\"category\": \"support\", \"confidence\": 0.92, \"reasoning\": \"The user asked for help.\"}}\n\
         Conversation: {}\nContext: {}",
        request.categories.join(", "),
        request.text,
        context
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_prompt_lists_categories_and_context() {
        let mut context = serde_json::Map::new();
        context.insert("customer_id".into(), serde_json::Value::Null);
        let request = ClassifyRequest {
            text: "need a quote\nfor a fence".into(),
            categories: vec!["new_lead".into(), "other".into()],
            context,
        };
        let prompt = build_user_prompt(&request);
        assert!(prompt.contains("[new_lead, other]"));
        assert!(prompt.contains("need a quote\nfor a fence"));
        assert!(prompt.contains("\"customer_id\":null"));
        assert!(prompt.contains("category, confidence, reasoning"));
    }
}
