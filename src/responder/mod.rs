//! Automated replies to categorized conversations.
//!
//! A reply is sent only inside business hours and only when the current
//! ruleset has a rule for the conversation's category. Delivery never fails
//! the handler; a failed send is reported as a `failed` status.

pub mod engine;
pub mod rules;
pub mod sms;
pub mod template;

pub use engine::{PlannedResponse, ResponderEngine, SERVICE_NAME};
pub use rules::{RuleStore, default_rules, rule_matches};
pub use sms::{DeliveryService, GatewayReceipt, SmsGateway, TwilioGateway, map_gateway_status};
pub use template::{ResponseTemplate, TemplateRegistry, business_context};
