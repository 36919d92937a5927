use std::mem;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::rules::RuleStore;
use super::sms::DeliveryService;
use super::template::{TemplateRegistry, business_context};
use crate::config::ResponderConfig;
use crate::error::{BusError, Error, HandlerError, ResponderError};
use crate::events::{Event, EventConsumer, EventPublisher, EventType, routing};
use crate::models::{AutoResponseRule, ConversationCategory, DeliveryStatus};
use crate::store::Database;

pub const SERVICE_NAME: &str = "responder";

/// Delivery method segment of the `message.sent` routing key.
pub const METHOD_SMS: &str = "sms";

type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// A reply that is ready to send.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedResponse {
    pub conversation_id: Uuid,
    pub recipient: String,
    pub content: String,
    pub delay: Duration,
}

/// Sends templated replies to categorized conversations during business
/// hours.
///
/// Replies with a delay run as tracked tasks. [`pending_replies`] counts
/// them so a drain can wait, and [`finish_pending`] or [`abort_pending`]
/// settles them before the exchange closes.
///
/// [`pending_replies`]: ResponderEngine::pending_replies
/// [`finish_pending`]: ResponderEngine::finish_pending
/// [`abort_pending`]: ResponderEngine::abort_pending
pub struct ResponderEngine {
    db: Arc<dyn Database>,
    publisher: Arc<dyn EventPublisher>,
    rules: Arc<RuleStore>,
    templates: TemplateRegistry,
    delivery: DeliveryService,
    config: ResponderConfig,
    clock: Clock,
    delayed: Mutex<JoinSet<()>>,
}

impl ResponderEngine {
    pub fn new(
        db: Arc<dyn Database>,
        publisher: Arc<dyn EventPublisher>,
        rules: Arc<RuleStore>,
        delivery: DeliveryService,
        config: ResponderConfig,
    ) -> Self {
        Self {
            db,
            publisher,
            rules,
            templates: TemplateRegistry::default(),
            delivery,
            config,
            clock: Arc::new(Utc::now),
            delayed: Mutex::new(JoinSet::new()),
        }
    }

    pub fn with_templates(mut self, templates: TemplateRegistry) -> Self {
        self.templates = templates;
        self
    }

    pub fn with_clock(mut self, clock: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn register(self: &Arc<Self>, consumer: &mut EventConsumer) -> Result<(), BusError> {
        let engine = Arc::clone(self);
        consumer.subscribe_fn("conversation.categorized.#", move |event| {
            let engine = Arc::clone(&engine);
            async move { engine.handle_conversation_categorized(event).await }
        })
    }

    /// Inclusive at both ends, in the configured timezone.
    pub fn within_business_hours(&self, at: DateTime<Utc>) -> bool {
        let local = at.with_timezone(&self.config.timezone).time();
        self.config.hours_start <= local && local <= self.config.hours_end
    }

    /// The rule to apply now, if any.
    pub fn should_auto_respond(
        &self,
        category: ConversationCategory,
        confidence: f64,
        at: DateTime<Utc>,
    ) -> Option<AutoResponseRule> {
        if !self.within_business_hours(at) {
            debug!(category = %category, "Outside business hours, no auto-response");
            return None;
        }
        self.rules.find(category, confidence)
    }

    /// Resolve recipient and render the reply for a matched rule.
    pub async fn plan(
        &self,
        conversation_id: Uuid,
        rule: &AutoResponseRule,
    ) -> Result<PlannedResponse, ResponderError> {
        if self.db.get_conversation(conversation_id).await?.is_none() {
            return Err(ResponderError::ConversationNotFound(conversation_id));
        }
        let recipient = self
            .db
            .conversation_messages(conversation_id)
            .await?
            .into_iter()
            .next()
            .map(|m| m.from_phone)
            .ok_or(ResponderError::NoRecipient(conversation_id))?;

        let content = self
            .templates
            .render(&rule.template_id, &business_context(&self.config))?;

        Ok(PlannedResponse {
            conversation_id,
            recipient,
            content,
            delay: Duration::from_secs(rule.delay_seconds),
        })
    }

    /// Deliver and publish `message.sent.sms.{status}`.
    pub async fn send(&self, trigger: &Event, planned: &PlannedResponse) -> DeliveryStatus {
        let status = self
            .delivery
            .deliver(planned.conversation_id, &planned.recipient, &planned.content)
            .await;

        let outbound = Event::caused_by(
            trigger,
            EventType::MessageSent,
            SERVICE_NAME,
            json!({
                "message_id": status.message_id.to_string(),
                "conversation_id": planned.conversation_id.to_string(),
                "to": planned.recipient,
                "content": planned.content,
                "method": METHOD_SMS,
                "status": status.status.as_str(),
                "error_message": status.error_message,
            }),
        );
        let key = routing::message_sent(METHOD_SMS, status.status);
        if !self.publisher.publish(&outbound, &key) {
            error!(
                trace_id = %trigger.trace_id,
                conversation_id = %planned.conversation_id,
                routing_key = %key,
                "Delivery recorded but event publish failed"
            );
        }
        status
    }

    /// `conversation.categorized.#` handler. Replies with a non-zero delay
    /// are sent from a background task after the delay.
    pub async fn handle_conversation_categorized(
        self: &Arc<Self>,
        event: Event,
    ) -> Result<(), HandlerError> {
        let conversation_id = event.payload_uuid("conversation_id")?;
        let raw_category = event.payload_str("category")?;
        let category = raw_category
            .parse::<ConversationCategory>()
            .map_err(|reason| HandlerError::MalformedField {
                event_id: event.event_id,
                field: "category".to_string(),
                reason,
            })?;
        let confidence = event
            .payload
            .get("confidence")
            .and_then(serde_json::Value::as_f64)
            .unwrap_or(0.0);

        // Reclassification of an updated conversation that kept its category.
        let changed = event
            .payload
            .get("category_changed")
            .and_then(serde_json::Value::as_bool);
        if changed == Some(false) {
            debug!(
                trace_id = %event.trace_id,
                conversation_id = %conversation_id,
                category = %category,
                "Category unchanged, already handled"
            );
            return Ok(());
        }

        let Some(rule) = self.should_auto_respond(category, confidence, (self.clock)()) else {
            debug!(
                trace_id = %event.trace_id,
                conversation_id = %conversation_id,
                category = %category,
                "No auto-response"
            );
            return Ok(());
        };

        let planned = self
            .plan(conversation_id, &rule)
            .await
            .map_err(Error::from)?;

        info!(
            trace_id = %event.trace_id,
            conversation_id = %conversation_id,
            template_id = %rule.template_id,
            delay_secs = rule.delay_seconds,
            "Auto-response triggered"
        );

        if planned.delay.is_zero() {
            self.send(&event, &planned).await;
        } else {
            let engine = Arc::clone(self);
            self.lock_delayed().spawn(async move {
                tokio::time::sleep(planned.delay).await;
                engine.send(&event, &planned).await;
            });
        }
        Ok(())
    }

    fn lock_delayed(&self) -> std::sync::MutexGuard<'_, JoinSet<()>> {
        self.delayed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Delayed replies not yet sent. Finished tasks are reaped here.
    pub fn pending_replies(&self) -> usize {
        let mut delayed = self.lock_delayed();
        while let Some(joined) = delayed.try_join_next() {
            if let Err(e) = joined {
                warn!(error = %e, "Delayed reply task did not complete");
            }
        }
        delayed.len()
    }

    /// Wait until every delayed reply, including ones scheduled meanwhile,
    /// has been sent.
    pub async fn finish_pending(&self) {
        loop {
            let mut batch = mem::take(&mut *self.lock_delayed());
            if batch.is_empty() {
                return;
            }
            while let Some(joined) = batch.join_next().await {
                if let Err(e) = joined {
                    warn!(error = %e, "Delayed reply task did not complete");
                }
            }
        }
    }

    /// Cancel delayed replies that have not been sent. Returns how many
    /// were cancelled.
    pub fn abort_pending(&self) -> usize {
        let cancelled = self.pending_replies();
        let mut delayed = self.lock_delayed();
        delayed.abort_all();
        *delayed = JoinSet::new();
        if cancelled > 0 {
            warn!(cancelled, "Cancelled delayed auto-responses");
        }
        cancelled
    }
}
