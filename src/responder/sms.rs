//! Outbound SMS: the gateway seam and the delivery service that always
//! reports a status.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use secrecy::ExposeSecret;
use serde::Deserialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::{ResponderConfig, TwilioConfig};
use crate::error::{DeliveryError, Error};
use crate::models::{DeliveryState, DeliveryStatus};
use crate::store::{Database, DeliveryRecord};

/// What the gateway reported for an accepted message.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayReceipt {
    /// Gateway-assigned id. Opaque; never parsed.
    pub external_id: String,
    pub status: String,
}

#[async_trait]
pub trait SmsGateway: Send + Sync {
    /// Mapping namespace for this gateway's ids.
    fn name(&self) -> &str;

    async fn send(&self, to: &str, body: &str) -> Result<GatewayReceipt, DeliveryError>;
}

/// Map a gateway status string onto the internal state.
pub fn map_gateway_status(status: &str) -> DeliveryState {
    match status.to_ascii_lowercase().as_str() {
        "sent" | "delivered" => DeliveryState::Delivered,
        "failed" | "undelivered" | "canceled" => DeliveryState::Failed,
        _ => DeliveryState::Pending,
    }
}

// ── Twilio ──────────────────────────────────────────────────────────

const TWILIO: &str = "twilio";

#[derive(Debug, Deserialize)]
struct TwilioMessage {
    sid: String,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TwilioError {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    code: Option<i64>,
}

/// Twilio Messages API over `reqwest`.
pub struct TwilioGateway {
    client: reqwest::Client,
    config: TwilioConfig,
}

impl TwilioGateway {
    pub fn new(config: TwilioConfig, timeout: Duration) -> Result<Self, DeliveryError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DeliveryError::Http(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    /// The configured gateway, or `None` when no credentials are set.
    pub fn from_config(config: &ResponderConfig) -> Result<Option<Arc<dyn SmsGateway>>, Error> {
        let Some(twilio) = &config.twilio else {
            return Ok(None);
        };
        let gateway = Self::new(twilio.clone(), config.gateway_timeout)?;
        Ok(Some(Arc::new(gateway)))
    }

    fn messages_url(&self) -> String {
        format!(
            "{}/Accounts/{}/Messages.json",
            self.config.api_base.trim_end_matches('/'),
            self.config.account_sid
        )
    }
}

#[async_trait]
impl SmsGateway for TwilioGateway {
    fn name(&self) -> &str {
        TWILIO
    }

    async fn send(&self, to: &str, body: &str) -> Result<GatewayReceipt, DeliveryError> {
        let form = [
            ("To", to),
            ("From", self.config.from_number.as_str()),
            ("Body", body),
        ];
        let response = self
            .client
            .post(self.messages_url())
            .basic_auth(
                &self.config.account_sid,
                Some(self.config.auth_token.expose_secret()),
            )
            .form(&form)
            .send()
            .await
            .map_err(|e| DeliveryError::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response
                .json::<TwilioError>()
                .await
                .ok()
                .map(|e| match (e.code, e.message) {
                    (Some(code), Some(msg)) => format!("{code}: {msg}"),
                    (None, Some(msg)) => msg,
                    _ => format!("HTTP {status}"),
                })
                .unwrap_or_else(|| format!("HTTP {status}"));
            return Err(DeliveryError::Rejected {
                gateway: TWILIO.to_string(),
                reason: detail,
            });
        }

        let message: TwilioMessage = response
            .json()
            .await
            .map_err(|e| DeliveryError::Http(format!("invalid response body: {e}")))?;
        Ok(GatewayReceipt {
            external_id: message.sid,
            status: message.status.unwrap_or_else(|| "queued".to_string()),
        })
    }
}

// ── Delivery service ────────────────────────────────────────────────

/// Sends through an optional gateway and records the outcome.
pub struct DeliveryService {
    gateway: Option<Arc<dyn SmsGateway>>,
    db: Arc<dyn Database>,
}

impl DeliveryService {
    pub fn new(gateway: Option<Arc<dyn SmsGateway>>, db: Arc<dyn Database>) -> Self {
        if gateway.is_none() {
            warn!("SMS gateway not configured, deliveries will fail");
        }
        Self { gateway, db }
    }

    /// Never fails: gateway problems come back as a failed status.
    pub async fn deliver(&self, conversation_id: Uuid, to: &str, content: &str) -> DeliveryStatus {
        let status = self.attempt(to, content).await;

        let record = DeliveryRecord {
            conversation_id,
            recipient: to.to_string(),
            content: content.to_string(),
            status: status.clone(),
        };
        if let Err(e) = self.db.record_delivery(&record).await {
            warn!(conversation_id = %conversation_id, error = %e, "Failed to record delivery");
        }
        status
    }

    async fn attempt(&self, to: &str, content: &str) -> DeliveryStatus {
        let Some(gateway) = &self.gateway else {
            error!(to, "Cannot send SMS: gateway not configured");
            return DeliveryStatus::failed(DeliveryError::NotConfigured.to_string());
        };

        let receipt = match gateway.send(to, content).await {
            Ok(receipt) => receipt,
            Err(e) => {
                error!(to, gateway = gateway.name(), error = %e, "SMS send failed");
                return DeliveryStatus::failed(e.to_string());
            }
        };

        let message_id = match self
            .db
            .map_external_id(gateway.name(), &receipt.external_id, Uuid::new_v4())
            .await
        {
            Ok(id) => id,
            Err(e) => {
                warn!(external_id = %receipt.external_id, error = %e, "Failed to map gateway id");
                Uuid::new_v4()
            }
        };

        let state = map_gateway_status(&receipt.status);
        info!(
            to,
            gateway = gateway.name(),
            external_id = %receipt.external_id,
            message_id = %message_id,
            status = state.as_str(),
            "SMS sent"
        );
        DeliveryStatus {
            message_id,
            status: state,
            delivered_at: Utc::now(),
            error_message: None,
        }
    }
}
