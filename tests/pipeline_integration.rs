//! End-to-end tests over the in-process bus.
//!
//! Each test wires the four engines to one exchange and an in-memory
//! database, spawns their consumers, and drives the pipeline through the
//! ingestion service. An observer consumer collects the outbound events.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::America::New_York;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::timeout;
use uuid::Uuid;

use comms_pipeline::classifier::ClassificationEngine;
use comms_pipeline::config::{ClassifierConfig, ResponderConfig, SpamConfig};
use comms_pipeline::error::{DeliveryError, LlmError};
use comms_pipeline::events::{
    Event, EventConsumer, EventPublisher, EventType, FailurePolicy, TopicExchange,
};
use comms_pipeline::grouping::GroupingEngine;
use comms_pipeline::ingest::{IncomingMessage, IngestService};
use comms_pipeline::llm::{AiClassifier, ClassifyRequest};
use comms_pipeline::models::{ConversationCategory, DeliveryState, MessageType, SpamAction};
use comms_pipeline::responder::{
    DeliveryService, GatewayReceipt, ResponderEngine, RuleStore, SmsGateway,
};
use comms_pipeline::spam::{ReputationService, SpamEngine};
use comms_pipeline::store::{Database, LibSqlBackend};

/// Maximum time any wait is allowed before the test counts as hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

const CUSTOMER: &str = "+15551234567";
const SPAMMER: &str = "+15550009999";
const BUSINESS: &str = "+15557654321";

/// Always answers `new_lead` with high confidence.
struct StubClassifier;

#[async_trait]
impl AiClassifier for StubClassifier {
    fn model_name(&self) -> &str {
        "stub"
    }

    async fn classify(&self, _request: &ClassifyRequest) -> Result<String, LlmError> {
        Ok(r#"Here is my answer: {"category": "new_lead", "confidence": 0.9, "reasoning": "asks for a quote"}"#.to_string())
    }
}

/// Accepts every message.
struct StubGateway;

#[async_trait]
impl SmsGateway for StubGateway {
    fn name(&self) -> &str {
        "stub"
    }

    async fn send(&self, _to: &str, _body: &str) -> Result<GatewayReceipt, DeliveryError> {
        Ok(GatewayReceipt {
            external_id: format!("SM{}", Uuid::new_v4().simple()),
            status: "sent".to_string(),
        })
    }
}

fn ny(hour: u32, minute: u32) -> DateTime<Utc> {
    New_York
        .with_ymd_and_hms(2024, 1, 15, hour, minute, 0)
        .unwrap()
        .with_timezone(&Utc)
}

struct Pipeline {
    db: Arc<LibSqlBackend>,
    exchange: Arc<TopicExchange>,
    ingest: IngestService,
    events: mpsc::UnboundedReceiver<(String, Event)>,
}

impl Pipeline {
    async fn start(policy: FailurePolicy) -> Self {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let exchange = TopicExchange::new("communication_platform", 64);

        let grouper = Arc::new(GroupingEngine::new(db.clone(), exchange.clone()));
        let mut grouper_consumer =
            EventConsumer::new(exchange.clone(), "conversation-grouper", policy);
        grouper.register(&mut grouper_consumer).unwrap();

        let classifier = Arc::new(ClassificationEngine::new(
            db.clone(),
            exchange.clone(),
            Some(Arc::new(StubClassifier) as Arc<dyn AiClassifier>),
            &ClassifierConfig::default(),
        ));
        let mut classifier_consumer =
            EventConsumer::new(exchange.clone(), "classifier-agent", policy);
        classifier.register(&mut classifier_consumer).unwrap();

        let spam_config = SpamConfig::default();
        let spam = Arc::new(SpamEngine::new(
            db.clone(),
            exchange.clone(),
            ReputationService::new(None, &spam_config),
            spam_config,
        ));
        let mut spam_consumer = EventConsumer::new(exchange.clone(), "spam-detector", policy);
        spam.register(&mut spam_consumer).unwrap();

        let responder = Arc::new(
            ResponderEngine::new(
                db.clone(),
                exchange.clone(),
                Arc::new(RuleStore::default()),
                DeliveryService::new(
                    Some(Arc::new(StubGateway) as Arc<dyn SmsGateway>),
                    db.clone(),
                ),
                ResponderConfig::default(),
            )
            .with_clock(|| ny(11, 0)),
        );
        let mut responder_consumer = EventConsumer::new(exchange.clone(), "responder", policy);
        responder.register(&mut responder_consumer).unwrap();

        let (tx, events) = mpsc::unbounded_channel();
        let mut observer = EventConsumer::new(exchange.clone(), "observer", FailurePolicy::Drop);
        for pattern in [
            "conversation.categorized.#",
            "message.flagged.#",
            "message.sent.#",
        ] {
            let tx = tx.clone();
            let label = pattern.split('.').take(2).collect::<Vec<_>>().join(".");
            observer
                .subscribe_fn(pattern, move |event| {
                    let tx = tx.clone();
                    let label = label.clone();
                    async move {
                        let _ = tx.send((label, event));
                        Ok(())
                    }
                })
                .unwrap();
        }

        for consumer in [
            grouper_consumer,
            classifier_consumer,
            spam_consumer,
            responder_consumer,
            observer,
        ] {
            tokio::spawn(consumer.start_consuming());
        }

        let ingest = IngestService::new(db.clone(), exchange.clone());
        Self {
            db,
            exchange,
            ingest,
            events,
        }
    }

    async fn send(&self, from: &str, content: &str, at: DateTime<Utc>, trace_id: Uuid) {
        self.ingest
            .receive(
                IncomingMessage {
                    message_type: MessageType::Sms,
                    from: from.to_string(),
                    to: BUSINESS.to_string(),
                    content: content.to_string(),
                    timestamp: Some(at),
                    customer_id: None,
                },
                trace_id,
            )
            .await
            .unwrap();
    }

    /// Next observed event whose kind (`message.sent`, …) matches.
    async fn next(&mut self, kind: &str) -> Event {
        timeout(TEST_TIMEOUT, async {
            loop {
                match self.events.recv().await {
                    Some((label, event)) if label == kind => return event,
                    Some(_) => continue,
                    None => panic!("observer channel closed"),
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("no {kind} event within {TEST_TIMEOUT:?}"))
    }

    async fn wait_idle(&self) {
        timeout(TEST_TIMEOUT, async {
            while !self.exchange.is_idle() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("pipeline did not go idle");
    }
}

#[tokio::test]
async fn lead_is_grouped_classified_and_answered() {
    let mut p = Pipeline::start(FailurePolicy::Drop).await;
    let trace = Uuid::new_v4();

    p.send(CUSTOMER, "looking for a quote", ny(10, 30), Uuid::new_v4())
        .await;
    p.send(CUSTOMER, "quote for a new deck please", ny(10, 31), trace)
        .await;

    let categorized = p.next("conversation.categorized").await;
    assert_eq!(categorized.trace_id, trace);
    assert_eq!(categorized.payload["category"], "new_lead");
    assert_eq!(categorized.payload["tier"], "ai");

    let sent = p.next("message.sent").await;
    assert_eq!(sent.event_type, EventType::MessageSent);
    assert_eq!(sent.trace_id, trace);
    assert_eq!(sent.payload["to"], CUSTOMER);
    assert_eq!(sent.payload["status"], "delivered");

    let conversation_id = sent.payload_uuid("conversation_id").unwrap();
    let conversation = p.db.get_conversation(conversation_id).await.unwrap().unwrap();
    assert_eq!(conversation.message_ids.len(), 2);
    assert_eq!(conversation.category, Some(ConversationCategory::NewLead));
    assert_eq!(conversation.confidence, Some(0.9));

    let deliveries = p.db.list_deliveries(conversation_id).await.unwrap();
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].status.status, DeliveryState::Delivered);

    p.wait_idle().await;
    assert_eq!(p.db.list_conversations(10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn follow_up_in_same_category_is_not_answered_twice() {
    let mut p = Pipeline::start(FailurePolicy::Drop).await;

    p.send(CUSTOMER, "looking for a quote", ny(10, 30), Uuid::new_v4())
        .await;
    p.send(CUSTOMER, "quote for a new deck please", ny(10, 31), Uuid::new_v4())
        .await;
    let first = p.next("conversation.categorized").await;
    assert_eq!(first.payload["category_changed"], true);
    let sent = p.next("message.sent").await;
    let conversation_id = sent.payload_uuid("conversation_id").unwrap();

    p.send(CUSTOMER, "it is about 300 sq ft", ny(10, 33), Uuid::new_v4())
        .await;
    let second = p.next("conversation.categorized").await;
    assert_eq!(second.payload["category_changed"], false);
    assert_eq!(second.payload["previous_category"], "new_lead");

    p.wait_idle().await;
    let conversation = p.db.get_conversation(conversation_id).await.unwrap().unwrap();
    assert_eq!(conversation.message_ids.len(), 3);
    assert_eq!(p.db.list_deliveries(conversation_id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn off_hours_spam_is_blocked_and_recorded() {
    let mut p = Pipeline::start(FailurePolicy::Drop).await;
    let trace = Uuid::new_v4();

    p.send(
        SPAMMER,
        "WINNER! claim your free cash prize at http://claim.example/now",
        ny(3, 15),
        trace,
    )
    .await;

    let flagged = p.next("message.flagged").await;
    assert_eq!(flagged.trace_id, trace);
    assert_eq!(flagged.payload["action"], "block");

    let message_id = flagged.payload_uuid("message_id").unwrap();
    let evaluation = p.db.get_spam_evaluation(message_id).await.unwrap().unwrap();
    assert_eq!(evaluation.action, SpamAction::Block);
    assert!(evaluation.is_spam);
    assert!(evaluation.score >= 0.8);
}

#[tokio::test]
async fn failing_handler_is_dead_lettered_and_replayable() {
    let p = Pipeline::start(FailurePolicy::DeadLetter).await;

    // Categorized event for a conversation that does not exist.
    let event = Event::new(
        EventType::ConversationCategorized,
        "classifier-agent",
        Uuid::new_v4(),
        json!({
            "conversation_id": Uuid::new_v4().to_string(),
            "category": "new_lead",
            "confidence": 0.9,
        }),
    );
    assert!(p.exchange.publish(&event, "conversation.categorized.new_lead.90"));
    p.wait_idle().await;

    let queue = p.exchange.queue("responder_queue").unwrap();
    let parked = queue.dead_letters();
    assert_eq!(parked.len(), 1);
    assert!(parked[0].error.contains("not found"));
    assert_eq!(queue.stats().nacked, 1);

    // Replaying fails again and parks it again.
    assert_eq!(queue.replay_dead_letters(), 1);
    timeout(TEST_TIMEOUT, async {
        while queue.stats().nacked < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("replayed delivery was not handled");
    assert_eq!(queue.dead_letters().len(), 1);
}
