use std::sync::Arc;

use chrono::{DateTime, Timelike, Utc};
use serde_json::json;
use tracing::{debug, error, info};

use super::content::analyze_content;
use super::reputation::ReputationService;
use crate::config::SpamConfig;
use crate::error::{BusError, Error, HandlerError, SpamError};
use crate::events::{Event, EventConsumer, EventPublisher, EventType, routing};
use crate::models::{SpamAction, SpamEvaluation};
use crate::store::Database;

pub const SERVICE_NAME: &str = "spam-detector";

pub const CONTENT_WEIGHT: f64 = 0.5;
pub const REPUTATION_WEIGHT: f64 = 0.3;
pub const TIMING_WEIGHT: f64 = 0.2;

pub const OFF_HOURS_SCORE: f64 = 0.7;
pub const NORMAL_HOURS_SCORE: f64 = 0.1;

/// Sub-score above which a signal is called out in the reasons.
const NOTABLE_SIGNAL: f64 = 0.5;

/// Scores every received message and publishes flag/block verdicts.
pub struct SpamEngine {
    db: Arc<dyn Database>,
    publisher: Arc<dyn EventPublisher>,
    reputation: ReputationService,
    config: SpamConfig,
}

impl SpamEngine {
    pub fn new(
        db: Arc<dyn Database>,
        publisher: Arc<dyn EventPublisher>,
        reputation: ReputationService,
        config: SpamConfig,
    ) -> Self {
        Self {
            db,
            publisher,
            reputation,
            config,
        }
    }

    pub fn register(self: &Arc<Self>, consumer: &mut EventConsumer) -> Result<(), BusError> {
        let engine = Arc::clone(self);
        consumer.subscribe_fn("message.received.#", move |event| {
            let engine = Arc::clone(&engine);
            async move { engine.handle_message_received(event).await }
        })
    }

    /// 0.7 when the local hour is before the quiet-before hour or after the
    /// quiet-after hour, else 0.1.
    pub fn timing_score(&self, timestamp: DateTime<Utc>) -> f64 {
        let hour = timestamp.with_timezone(&self.config.timezone).hour();
        if hour < self.config.quiet_before_hour || hour > self.config.quiet_after_hour {
            OFF_HOURS_SCORE
        } else {
            NORMAL_HOURS_SCORE
        }
    }

    pub fn action_for(&self, score: f64) -> SpamAction {
        if score >= self.config.block_threshold {
            SpamAction::Block
        } else if score >= self.config.flag_threshold {
            SpamAction::Flag
        } else {
            SpamAction::Allow
        }
    }

    pub async fn evaluate(
        &self,
        phone: &str,
        content: &str,
        timestamp: DateTime<Utc>,
    ) -> SpamEvaluation {
        let analysis = analyze_content(content);
        let reputation = self.reputation.score(phone).await;
        let timing = self.timing_score(timestamp);

        let score = (CONTENT_WEIGHT * analysis.score.clamp(0.0, 1.0)
            + REPUTATION_WEIGHT * reputation.score.clamp(0.0, 1.0)
            + TIMING_WEIGHT * timing.clamp(0.0, 1.0))
        .clamp(0.0, 1.0);
        let action = self.action_for(score);

        let mut reasons = analysis.reasons;
        if reputation.score > NOTABLE_SIGNAL {
            reasons.push("Phone number has poor reputation.".to_string());
        }
        if timing > NOTABLE_SIGNAL {
            reasons.push("Suspicious timing pattern detected.".to_string());
        }
        reasons.push(format!("Reputation from {}.", reputation.source));

        debug!(
            phone,
            content_score = analysis.score,
            reputation_score = reputation.score,
            timing_score = timing,
            score,
            action = action.as_str(),
            "Spam evaluation"
        );

        SpamEvaluation {
            is_spam: score >= self.config.flag_threshold,
            score,
            reasons,
            action,
        }
    }

    /// `message.received.#` handler. Every verdict is recorded; only
    /// flag and block are published.
    pub async fn handle_message_received(&self, event: Event) -> Result<(), HandlerError> {
        let message_id = event.payload_uuid("message_id")?;
        let message = self
            .db
            .get_message(message_id)
            .await
            .map_err(|e| Error::from(SpamError::from(e)))?
            .ok_or_else(|| HandlerError::MalformedField {
                event_id: event.event_id,
                field: "message_id".to_string(),
                reason: format!("message {message_id} not found"),
            })?;

        let evaluation = self
            .evaluate(&message.from_phone, &message.content, message.timestamp)
            .await;
        self.db
            .record_spam_evaluation(message_id, &evaluation)
            .await
            .map_err(|e| Error::from(SpamError::from(e)))?;

        if evaluation.action == SpamAction::Allow {
            debug!(trace_id = %event.trace_id, message_id = %message_id, score = evaluation.score, "Message allowed");
            return Ok(());
        }

        info!(
            trace_id = %event.trace_id,
            message_id = %message_id,
            score = evaluation.score,
            action = evaluation.action.as_str(),
            "Message flagged"
        );

        let outbound = Event::caused_by(
            &event,
            EventType::MessageFlagged,
            SERVICE_NAME,
            json!({
                "message_id": message_id.to_string(),
                "from": message.from_phone,
                "is_spam": evaluation.is_spam,
                "score": evaluation.score,
                "action": evaluation.action.as_str(),
                "reasons": evaluation.reasons,
            }),
        );
        let key = routing::message_flagged(evaluation.action, evaluation.score);
        if !self.publisher.publish(&outbound, &key) {
            error!(
                trace_id = %event.trace_id,
                message_id = %message_id,
                routing_key = %key,
                "Spam verdict recorded but event publish failed"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::TopicExchange;
    use crate::models::{Message, MessageType};
    use crate::store::LibSqlBackend;
    use chrono::TimeZone;
    use chrono_tz::America::New_York;
    use uuid::Uuid;

    const GOOD: &str = "+15551234567";
    const BAD: &str = "+15550009999";
    const BIZ: &str = "+15557654321";

    fn ny(hour: u32, minute: u32) -> DateTime<Utc> {
        New_York
            .with_ymd_and_hms(2024, 1, 15, hour, minute, 0)
            .unwrap()
            .with_timezone(&Utc)
    }

    async fn setup() -> (Arc<SpamEngine>, Arc<LibSqlBackend>, Arc<TopicExchange>) {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let exchange = TopicExchange::new("test", 16);
        let config = SpamConfig::default();
        let reputation = ReputationService::new(None, &config);
        let engine = Arc::new(SpamEngine::new(db.clone(), exchange.clone(), reputation, config));
        (engine, db, exchange)
    }

    #[tokio::test]
    async fn timing_uses_configured_timezone() {
        let (engine, _, _) = setup().await;
        assert_eq!(engine.timing_score(ny(5, 59)), OFF_HOURS_SCORE);
        assert_eq!(engine.timing_score(ny(6, 0)), NORMAL_HOURS_SCORE);
        assert_eq!(engine.timing_score(ny(22, 30)), NORMAL_HOURS_SCORE);
        assert_eq!(engine.timing_score(ny(23, 0)), OFF_HOURS_SCORE);
    }

    #[tokio::test]
    async fn thresholds_are_inclusive() {
        let (engine, _, _) = setup().await;
        assert_eq!(engine.action_for(0.8), SpamAction::Block);
        assert_eq!(engine.action_for(0.6), SpamAction::Flag);
        assert_eq!(engine.action_for(0.59), SpamAction::Allow);
    }

    #[tokio::test]
    async fn clean_daytime_message_is_allowed() {
        let (engine, _, _) = setup().await;
        let e = engine.evaluate(GOOD, "Can you quote a new fence?", ny(10, 0)).await;
        assert_eq!(e.action, SpamAction::Allow);
        assert!(!e.is_spam);
        assert!((e.score - 0.05).abs() < 1e-9);
        assert!(e.reasons.iter().any(|r| r.contains("internal heuristic")));
    }

    #[tokio::test]
    async fn bad_number_with_spammy_content_off_hours_is_blocked() {
        let (engine, _, _) = setup().await;
        let e = engine
            .evaluate(BAD, "URGENT winner! claim your cash at http://x.co/p", ny(23, 30))
            .await;
        // 0.5 * 1.0 + 0.3 * 0.9 + 0.2 * 0.7
        assert!((e.score - 0.91).abs() < 1e-9);
        assert_eq!(e.action, SpamAction::Block);
        assert!(e.is_spam);
        assert!(e.reasons.iter().any(|r| r.contains("poor reputation")));
        assert!(e.reasons.iter().any(|r| r.contains("timing")));
    }

    #[tokio::test]
    async fn same_message_in_daytime_is_only_flagged() {
        let (engine, _, _) = setup().await;
        let e = engine
            .evaluate(BAD, "URGENT winner! claim your cash at http://x.co/p", ny(12, 0))
            .await;
        assert_eq!(e.action, SpamAction::Flag);
    }

    async fn received(db: &LibSqlBackend, from: &str, content: &str, at: DateTime<Utc>) -> Event {
        let message = Message::new(MessageType::Sms, from, BIZ, content, at);
        db.insert_message(&message).await.unwrap();
        Event::new(
            EventType::MessageReceived,
            "ingest",
            Uuid::new_v4(),
            json!({"message_id": message.message_id.to_string()}),
        )
    }

    #[tokio::test]
    async fn handler_records_every_verdict_and_publishes_only_flags() {
        let (engine, db, exchange) = setup().await;
        exchange.bind("tap", "message.flagged.#").unwrap();

        let clean = received(&db, GOOD, "see you at noon", ny(12, 0)).await;
        let clean_id = clean.payload_uuid("message_id").unwrap();
        engine.handle_message_received(clean).await.unwrap();
        let recorded = db.get_spam_evaluation(clean_id).await.unwrap().unwrap();
        assert_eq!(recorded.action, SpamAction::Allow);
        assert_eq!(exchange.queue("tap").unwrap().stats().published, 0);

        let spam = received(&db, BAD, "FREE prize, click http://win.biz now", ny(2, 0)).await;
        let trace = spam.trace_id;
        engine.handle_message_received(spam).await.unwrap();

        let mut rx = exchange.queue("tap").unwrap().take_receiver().unwrap();
        let delivery = rx.try_recv().unwrap();
        assert!(delivery.message.routing_key.starts_with("message.flagged.block."));
        let flagged = delivery.message.decode().unwrap();
        assert_eq!(flagged.trace_id, trace);
        assert_eq!(flagged.payload["action"], "block");
    }

    #[tokio::test]
    async fn handler_rejects_event_without_message_id() {
        let (engine, _, _) = setup().await;
        let event = Event::new(EventType::MessageReceived, "ingest", Uuid::new_v4(), json!({}));
        assert!(matches!(
            engine.handle_message_received(event).await,
            Err(HandlerError::MissingField { .. })
        ));
    }
}
