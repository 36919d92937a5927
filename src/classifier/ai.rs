//! AI tier: response parsing and the bounded retry loop.

use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::error::{ClassificationError, LlmError};
use crate::llm::{AiClassifier, ClassifyRequest};
use crate::models::ConversationCategory;

/// A parsed AI classification.
#[derive(Debug, Clone, PartialEq)]
pub struct AiVerdict {
    pub category: ConversationCategory,
    pub confidence: f64,
    pub reasoning: String,
}

#[derive(Debug, Deserialize)]
struct RawVerdict {
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    confidence: Option<serde_json::Value>,
    #[serde(default)]
    reasoning: Option<String>,
}

/// The substring from the first `{` to the last `}`.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

/// Parse free-form model output into a verdict.
///
/// Unknown categories become `other`; confidence is clamped to `[0, 1]` and
/// may be a number or a numeric string. No JSON object, invalid JSON, or a
/// non-numeric confidence is an error (and retried by the caller).
pub fn parse_classification(raw: &str) -> Result<AiVerdict, ClassificationError> {
    let json = extract_json_object(raw)
        .ok_or_else(|| ClassificationError::Parse("no JSON object in response".to_string()))?;
    let verdict: RawVerdict = serde_json::from_str(json)
        .map_err(|e| ClassificationError::Parse(format!("JSON parse error: {e}")))?;

    let category = verdict
        .category
        .as_deref()
        .and_then(|c| c.parse::<ConversationCategory>().ok())
        .unwrap_or(ConversationCategory::Other);

    let confidence = match verdict.confidence {
        None | Some(serde_json::Value::Null) => 0.0,
        Some(serde_json::Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(serde_json::Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| ClassificationError::Parse(format!("confidence '{s}' is not a number")))?,
        Some(other) => {
            return Err(ClassificationError::Parse(format!(
                "confidence has unexpected type: {other}"
            )));
        }
    };
    if !confidence.is_finite() {
        return Err(ClassificationError::Parse("confidence is not finite".to_string()));
    }

    Ok(AiVerdict {
        category,
        confidence: confidence.clamp(0.0, 1.0),
        reasoning: verdict.reasoning.unwrap_or_default(),
    })
}

/// Exponential backoff with jitter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_unit: Duration,
}

impl RetryPolicy {
    /// Delay after failed attempt `attempt` (0-based): `(2^attempt + jitter) * unit`.
    pub fn delay(&self, attempt: u32, jitter: f64) -> Duration {
        let factor = 2f64.powi(attempt.min(16) as i32) + jitter.clamp(0.0, 1.0);
        self.backoff_unit.mul_f64(factor)
    }
}

/// Call the classifier until it yields a parseable verdict.
///
/// Rate limits, transport failures and parse failures are retried alike.
/// Authentication failures are returned immediately.
pub async fn classify_with_retry(
    client: &dyn AiClassifier,
    request: &ClassifyRequest,
    policy: RetryPolicy,
) -> Result<AiVerdict, ClassificationError> {
    let mut last_error = String::from("no attempts made");

    for attempt in 0..policy.max_attempts {
        let outcome = match client.classify(request).await {
            Ok(raw) => parse_classification(&raw),
            Err(e @ LlmError::AuthFailed { .. }) => return Err(ClassificationError::Llm(e)),
            Err(e) => Err(ClassificationError::Llm(e)),
        };

        let err = match outcome {
            Ok(verdict) => return Ok(verdict),
            Err(e) => e,
        };
        last_error = err.to_string();

        if attempt + 1 < policy.max_attempts {
            let mut delay = policy.delay(attempt, rand::random::<f64>());
            if let ClassificationError::Llm(LlmError::RateLimited {
                retry_after: Some(after),
                ..
            }) = &err
            {
                delay = delay.max(*after);
            }
            warn!(
                model = client.model_name(),
                attempt = attempt + 1,
                max_attempts = policy.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "AI classification attempt failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    Err(ClassificationError::RetriesExhausted {
        attempts: policy.max_attempts,
        last_error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Replays canned responses in order; repeats the last one.
    struct StubClassifier {
        responses: Mutex<Vec<Result<String, LlmError>>>,
        calls: Mutex<u32>,
    }

    impl StubClassifier {
        fn new(responses: Vec<Result<String, LlmError>>) -> Self {
            Self {
                responses: Mutex::new(responses),
                calls: Mutex::new(0),
            }
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl AiClassifier for StubClassifier {
        fn model_name(&self) -> &str {
            "stub"
        }

        async fn classify(&self, _request: &ClassifyRequest) -> Result<String, LlmError> {
            *self.calls.lock().unwrap() += 1;
            let mut responses = self.responses.lock().unwrap();
            if responses.len() > 1 {
                responses.remove(0)
            } else {
                match &responses[0] {
                    Ok(s) => Ok(s.clone()),
                    Err(_) => Err(LlmError::RequestFailed {
                        provider: "stub".into(),
                        reason: "down".into(),
                    }),
                }
            }
        }
    }

    fn request() -> ClassifyRequest {
        ClassifyRequest {
            text: "hi".into(),
            categories: vec![],
            context: serde_json::Map::new(),
        }
    }

    fn instant() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 5,
            backoff_unit: Duration::ZERO,
        }
    }

    #[test]
    fn parses_json_surrounded_by_prose() {
        let raw = "Sure! Here you go:\n{\"category\": \"new_lead\", \"confidence\": 0.85, \"reasoning\": \"asks for a quote\"}\nHope that helps.";
        let v = parse_classification(raw).unwrap();
        assert_eq!(v.category, ConversationCategory::NewLead);
        assert_eq!(v.confidence, 0.85);
        assert_eq!(v.reasoning, "asks for a quote");
    }

    #[test]
    fn parses_fenced_json() {
        let raw = "```json\n{\"category\": \"Support\", \"confidence\": \"0.9\"}\n```";
        let v = parse_classification(raw).unwrap();
        assert_eq!(v.category, ConversationCategory::Support);
        assert_eq!(v.confidence, 0.9);
        assert_eq!(v.reasoning, "");
    }

    #[test]
    fn unknown_category_becomes_other_and_confidence_clamps() {
        let v = parse_classification(r#"{"category": "escalation", "confidence": 1.7}"#).unwrap();
        assert_eq!(v.category, ConversationCategory::Other);
        assert_eq!(v.confidence, 1.0);
    }

    #[test]
    fn missing_confidence_is_zero() {
        let v = parse_classification(r#"{"category": "spam"}"#).unwrap();
        assert_eq!(v.confidence, 0.0);
    }

    #[test]
    fn rejects_unparseable_output() {
        assert!(parse_classification("I think it's a lead").is_err());
        assert!(parse_classification("} backwards {").is_err());
        assert!(parse_classification("{not json}").is_err());
        assert!(parse_classification(r#"{"confidence": "high"}"#).is_err());
        assert!(parse_classification(r#"{"confidence": [1]}"#).is_err());
    }

    #[test]
    fn backoff_grows_exponentially_with_jitter() {
        let policy = RetryPolicy {
            max_attempts: 5,
            backoff_unit: Duration::from_secs(1),
        };
        assert_eq!(policy.delay(0, 0.0), Duration::from_secs(1));
        assert_eq!(policy.delay(3, 0.0), Duration::from_secs(8));
        assert_eq!(policy.delay(1, 0.5), Duration::from_millis(2500));
    }

    #[tokio::test]
    async fn retries_parse_failures_then_succeeds() {
        let stub = StubClassifier::new(vec![
            Ok("garbage".into()),
            Err(LlmError::RateLimited {
                provider: "stub".into(),
                retry_after: None,
            }),
            Ok(r#"{"category": "reminder", "confidence": 0.8}"#.into()),
        ]);
        let v = classify_with_retry(&stub, &request(), instant()).await.unwrap();
        assert_eq!(v.category, ConversationCategory::Reminder);
        assert_eq!(stub.calls(), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let stub = StubClassifier::new(vec![Ok("still not json".into())]);
        let err = classify_with_retry(&stub, &request(), instant())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ClassificationError::RetriesExhausted { attempts: 5, .. }
        ));
        assert_eq!(stub.calls(), 5);
    }

    #[tokio::test]
    async fn auth_failure_is_not_retried() {
        let stub = StubClassifier::new(vec![
            Err(LlmError::AuthFailed {
                provider: "stub".into(),
            }),
            Ok(r#"{"category": "reminder", "confidence": 0.8}"#.into()),
        ]);
        let err = classify_with_retry(&stub, &request(), instant())
            .await
            .unwrap_err();
        assert!(matches!(err, ClassificationError::Llm(LlmError::AuthFailed { .. })));
        assert_eq!(stub.calls(), 1);
    }
}
