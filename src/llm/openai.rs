//! OpenAI chat-completions client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{
    AiClassifier, CLASSIFY_MAX_TOKENS, CLASSIFY_TEMPERATURE, ClassifyRequest, build_system_prompt,
    build_user_prompt,
};
use crate::config::ClassifierConfig;
use crate::error::LlmError;

const PROVIDER: &str = "openai";

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Chat-completions classifier.
pub struct OpenAiClassifier {
    client: reqwest::Client,
    api_key: SecretString,
    api_base: String,
    model: String,
}

impl OpenAiClassifier {
    pub fn new(
        api_key: SecretString,
        api_base: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LlmError::RequestFailed {
                provider: PROVIDER.to_string(),
                reason: format!("Failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            client,
            api_key,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            model: model.into(),
        })
    }

    /// `None` when no API key is configured.
    pub fn from_config(config: &ClassifierConfig) -> Result<Option<Self>, LlmError> {
        match &config.api_key {
            None => Ok(None),
            Some(key) => Self::new(
                key.clone(),
                &config.base_url,
                &config.model,
                config.request_timeout,
            )
            .map(Some),
        }
    }
}

fn retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[async_trait]
impl AiClassifier for OpenAiClassifier {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn classify(&self, request: &ClassifyRequest) -> Result<String, LlmError> {
        let body = ChatCompletionRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: build_system_prompt(),
                },
                ChatMessage {
                    role: "user",
                    content: build_user_prompt(request),
                },
            ],
            max_tokens: CLASSIFY_MAX_TOKENS,
            temperature: CLASSIFY_TEMPERATURE,
        };

        let url = format!("{}/chat/completions", self.api_base);
        debug!(model = %self.model, "Sending classification request");

        let response = self
            .client
            .post(&url)
            .bearer_auth(self.api_key.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::RequestFailed {
                provider: PROVIDER.to_string(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(LlmError::RateLimited {
                provider: PROVIDER.to_string(),
                retry_after: retry_after(response.headers()),
            });
        }
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(LlmError::AuthFailed {
                provider: PROVIDER.to_string(),
            });
        }
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(LlmError::RequestFailed {
                provider: PROVIDER.to_string(),
                reason: format!("HTTP {status}: {error_text}"),
            });
        }

        let body = response.text().await.map_err(|e| LlmError::RequestFailed {
            provider: PROVIDER.to_string(),
            reason: e.to_string(),
        })?;
        completion_content(&body)
    }
}

/// Text of the first choice in a chat completion body.
fn completion_content(body: &str) -> Result<String, LlmError> {
    let parsed: ChatCompletionResponse = serde_json::from_str(body)?;
    parsed
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .ok_or_else(|| LlmError::InvalidResponse {
            provider: PROVIDER.to_string(),
            reason: "response has no message content".to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completion_content_extracts_first_choice() {
        let body = r#"{"choices":[{"message":{"role":"assistant","content":"{\"category\":\"support\"}"}}]}"#;
        assert_eq!(completion_content(body).unwrap(), r#"{"category":"support"}"#);

        assert!(matches!(
            completion_content("<html>bad gateway</html>"),
            Err(LlmError::Json(_))
        ));
        assert!(matches!(
            completion_content(r#"{"choices":[]}"#),
            Err(LlmError::InvalidResponse { .. })
        ));
    }

    #[test]
    fn from_config_without_key_is_none() {
        let config = ClassifierConfig::default();
        assert!(OpenAiClassifier::from_config(&config).unwrap().is_none());
    }

    #[test]
    fn from_config_with_key_constructs() {
        let config = ClassifierConfig {
            api_key: Some(SecretString::from("sk-test")),
            base_url: "https://api.example.com/v1/".into(),
            ..ClassifierConfig::default()
        };
        let client = OpenAiClassifier::from_config(&config).unwrap().unwrap();
        assert_eq!(client.model_name(), "gpt-4-turbo");
        assert_eq!(client.api_base, "https://api.example.com/v1");
    }

    #[test]
    fn request_body_shape() {
        let body = ChatCompletionRequest {
            model: "gpt-4-turbo",
            messages: vec![ChatMessage {
                role: "user",
                content: "hi".into(),
            }],
            max_tokens: CLASSIFY_MAX_TOKENS,
            temperature: CLASSIFY_TEMPERATURE,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["model"], "gpt-4-turbo");
        assert_eq!(json["max_tokens"], 256);
        assert_eq!(json["messages"][0]["role"], "user");
    }

    #[test]
    fn response_without_content_is_tolerated_by_serde() {
        let parsed: ChatCompletionResponse =
            serde_json::from_str(r#"{"choices":[{"message":{"role":"assistant"}}]}"#).unwrap();
        assert!(parsed.choices[0].message.content.is_none());
    }

    #[test]
    fn retry_after_header_parsing() {
        let mut headers = reqwest::header::HeaderMap::new();
        assert_eq!(retry_after(&headers), None);
        headers.insert(reqwest::header::RETRY_AFTER, "7".parse().unwrap());
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(7)));
    }
}
