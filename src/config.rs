//! Configuration types.
//!
//! Every struct has a `Default` matching production behaviour and a
//! `from_env()` constructor that overrides individual fields.

use std::path::PathBuf;
use std::time::Duration;

use chrono::NaiveTime;
use chrono_tz::Tz;
use secrecy::SecretString;

use crate::error::ConfigError;
use crate::events::FailurePolicy;

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.trim().is_empty())
}

fn env_timezone(key: &str, default: Tz) -> Result<Tz, ConfigError> {
    match env_string(key) {
        None => Ok(default),
        Some(raw) => raw.parse::<Tz>().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("unknown timezone '{raw}'"),
        }),
    }
}

fn env_time(key: &str, default: NaiveTime) -> Result<NaiveTime, ConfigError> {
    match env_string(key) {
        None => Ok(default),
        Some(raw) => NaiveTime::parse_from_str(&raw, "%H:%M").map_err(|e| {
            ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("expected HH:MM: {e}"),
            }
        }),
    }
}

fn hm(hour: u32, minute: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(hour, minute, 0).unwrap_or(NaiveTime::MIN)
}

/// Parse `drop`, `dead_letter` or `retry:N`.
pub fn parse_failure_policy(raw: &str) -> Option<FailurePolicy> {
    match raw.trim().to_lowercase().as_str() {
        "drop" => Some(FailurePolicy::Drop),
        "dead_letter" | "dead-letter" | "dlq" => Some(FailurePolicy::DeadLetter),
        other => {
            let n: u32 = other.strip_prefix("retry:")?.parse().ok()?;
            (n > 0).then_some(FailurePolicy::Retry { max_attempts: n })
        }
    }
}

// ── Bus ─────────────────────────────────────────────────────────────

/// Event bus configuration.
#[derive(Debug, Clone)]
pub struct BusConfig {
    pub exchange_name: String,
    /// Per-queue buffer; publishes to a full queue fail instead of blocking.
    pub queue_capacity: usize,
    pub failure_policy: FailurePolicy,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            exchange_name: "communication_platform".to_string(),
            queue_capacity: 1024,
            failure_policy: FailurePolicy::Drop,
        }
    }
}

impl BusConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let failure_policy = match env_string("COMMS_BUS_FAILURE_POLICY") {
            None => defaults.failure_policy,
            Some(raw) => parse_failure_policy(&raw).ok_or_else(|| ConfigError::InvalidValue {
                key: "COMMS_BUS_FAILURE_POLICY".into(),
                message: format!("expected drop, dead_letter or retry:N, got '{raw}'"),
            })?,
        };
        Ok(Self {
            exchange_name: env_string("COMMS_BUS_EXCHANGE").unwrap_or(defaults.exchange_name),
            queue_capacity: env_parse("COMMS_BUS_QUEUE_CAPACITY")
                .unwrap_or(defaults.queue_capacity),
            failure_policy,
        })
    }
}

// ── Classifier ──────────────────────────────────────────────────────

/// Classification engine configuration.
#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    /// Without a key the AI tier is skipped.
    pub api_key: Option<SecretString>,
    pub model: String,
    pub base_url: String,
    pub request_timeout: Duration,
    pub max_attempts: u32,
    /// Backoff before retry `n` is `2^n * unit` plus up to one `unit` of jitter.
    pub backoff_unit: Duration,
    pub ai_threshold: f64,
    pub rule_threshold: f64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: "gpt-4-turbo".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            request_timeout: Duration::from_secs(30),
            max_attempts: 5,
            backoff_unit: Duration::from_secs(1),
            ai_threshold: 0.7,
            rule_threshold: 0.5,
        }
    }
}

impl ClassifierConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            api_key: env_string("OPENAI_API_KEY").map(SecretString::from),
            model: env_string("COMMS_CLASSIFIER_MODEL").unwrap_or(defaults.model),
            base_url: env_string("OPENAI_BASE_URL").unwrap_or(defaults.base_url),
            request_timeout: env_parse("COMMS_CLASSIFIER_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.request_timeout),
            max_attempts: env_parse("COMMS_CLASSIFIER_MAX_ATTEMPTS")
                .unwrap_or(defaults.max_attempts),
            backoff_unit: defaults.backoff_unit,
            ai_threshold: defaults.ai_threshold,
            rule_threshold: defaults.rule_threshold,
        }
    }
}

// ── Spam ────────────────────────────────────────────────────────────

/// Spam scoring configuration.
#[derive(Debug, Clone)]
pub struct SpamConfig {
    /// External reputation service; `None` means heuristic only.
    pub reputation_url: Option<String>,
    pub lookup_timeout: Duration,
    pub cache_ttl: Duration,
    pub rate_limit: u32,
    pub rate_window: Duration,
    pub block_threshold: f64,
    pub flag_threshold: f64,
    pub timezone: Tz,
    /// Local hour before which a message counts as off-hours.
    pub quiet_before_hour: u32,
    /// Local hour after which a message counts as off-hours.
    pub quiet_after_hour: u32,
}

impl Default for SpamConfig {
    fn default() -> Self {
        Self {
            reputation_url: None,
            lookup_timeout: Duration::from_secs(5),
            cache_ttl: Duration::from_secs(3600),
            rate_limit: 10,
            rate_window: Duration::from_secs(60),
            block_threshold: 0.8,
            flag_threshold: 0.6,
            timezone: chrono_tz::America::New_York,
            quiet_before_hour: 6,
            quiet_after_hour: 22,
        }
    }
}

impl SpamConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            reputation_url: env_string("COMMS_REPUTATION_URL"),
            lookup_timeout: env_parse("COMMS_REPUTATION_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.lookup_timeout),
            rate_limit: env_parse("COMMS_REPUTATION_RATE_LIMIT").unwrap_or(defaults.rate_limit),
            timezone: env_timezone("COMMS_SPAM_TIMEZONE", defaults.timezone)?,
            ..defaults
        })
    }
}

// ── Responder ───────────────────────────────────────────────────────

/// Values substituted into response templates.
#[derive(Debug, Clone, PartialEq)]
pub struct BusinessProfile {
    pub name: String,
    pub phone: String,
    pub email: String,
}

impl Default for BusinessProfile {
    fn default() -> Self {
        Self {
            name: "Small Biz Advisor".to_string(),
            phone: "+1234567890".to_string(),
            email: "info@smallbizadvisor.com".to_string(),
        }
    }
}

/// Twilio credentials. Absent means every delivery fails permanently.
#[derive(Debug, Clone)]
pub struct TwilioConfig {
    pub account_sid: String,
    pub auth_token: SecretString,
    pub from_number: String,
    pub api_base: String,
}

const TWILIO_CREDENTIALS: [&str; 3] = [
    "TWILIO_ACCOUNT_SID",
    "TWILIO_AUTH_TOKEN",
    "TWILIO_PHONE_NUMBER",
];

impl TwilioConfig {
    /// `None` when no credential is set. Setting only some of them is an
    /// error naming the first missing one.
    pub fn from_env() -> Result<Option<Self>, ConfigError> {
        Self::from_lookup(env_string)
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Option<Self>, ConfigError> {
        let [sid, token, from] = TWILIO_CREDENTIALS.map(|key| lookup(key));
        match (sid, token, from) {
            (None, None, None) => Ok(None),
            (Some(account_sid), Some(auth_token), Some(from_number)) => Ok(Some(Self {
                account_sid,
                auth_token: SecretString::from(auth_token),
                from_number,
                api_base: lookup("TWILIO_API_BASE")
                    .unwrap_or_else(|| "https://api.twilio.com/2010-04-01".to_string()),
            })),
            _ => {
                let missing = TWILIO_CREDENTIALS
                    .iter()
                    .find(|key| lookup(key).is_none())
                    .copied()
                    .unwrap_or(TWILIO_CREDENTIALS[0]);
                Err(ConfigError::MissingEnvVar(missing.to_string()))
            }
        }
    }
}

/// Auto-response configuration.
#[derive(Debug, Clone)]
pub struct ResponderConfig {
    /// Inclusive.
    pub hours_start: NaiveTime,
    /// Inclusive.
    pub hours_end: NaiveTime,
    pub timezone: Tz,
    pub business: BusinessProfile,
    pub twilio: Option<TwilioConfig>,
    pub gateway_timeout: Duration,
}

impl Default for ResponderConfig {
    fn default() -> Self {
        Self {
            hours_start: hm(9, 0),
            hours_end: hm(17, 0),
            timezone: chrono_tz::America::New_York,
            business: BusinessProfile::default(),
            twilio: None,
            gateway_timeout: Duration::from_secs(10),
        }
    }
}

impl ResponderConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let hours_start = env_time("COMMS_BUSINESS_HOURS_START", defaults.hours_start)?;
        let hours_end = env_time("COMMS_BUSINESS_HOURS_END", defaults.hours_end)?;
        if hours_end < hours_start {
            return Err(ConfigError::InvalidValue {
                key: "COMMS_BUSINESS_HOURS_END".into(),
                message: "business hours must not wrap midnight".into(),
            });
        }
        Ok(Self {
            hours_start,
            hours_end,
            timezone: env_timezone("COMMS_BUSINESS_TIMEZONE", defaults.timezone)?,
            business: BusinessProfile {
                name: env_string("COMMS_BUSINESS_NAME").unwrap_or(defaults.business.name),
                phone: env_string("COMMS_BUSINESS_PHONE").unwrap_or(defaults.business.phone),
                email: env_string("COMMS_BUSINESS_EMAIL").unwrap_or(defaults.business.email),
            },
            twilio: TwilioConfig::from_env()?,
            gateway_timeout: env_parse("COMMS_GATEWAY_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.gateway_timeout),
        })
    }

    /// `"09:00 - 17:00"`
    pub fn formatted_hours(&self) -> String {
        format!(
            "{} - {}",
            self.hours_start.format("%H:%M"),
            self.hours_end.format("%H:%M")
        )
    }
}

// ── Store ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub db_path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/comms-pipeline.db"),
        }
    }
}

impl StoreConfig {
    pub fn from_env() -> Self {
        Self {
            db_path: env_string("COMMS_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| Self::default().db_path),
        }
    }
}

// ── Pipeline ────────────────────────────────────────────────────────

/// Everything the binary needs.
#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    pub bus: BusConfig,
    pub classifier: ClassifierConfig,
    pub spam: SpamConfig,
    pub responder: ResponderConfig,
    pub store: StoreConfig,
    /// Daily rolling log files go here when set.
    pub log_dir: Option<PathBuf>,
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            bus: BusConfig::from_env()?,
            classifier: ClassifierConfig::from_env(),
            spam: SpamConfig::from_env()?,
            responder: ResponderConfig::from_env()?,
            store: StoreConfig::from_env(),
            log_dir: env_string("COMMS_LOG_DIR").map(PathBuf::from),
        })
    }
}
