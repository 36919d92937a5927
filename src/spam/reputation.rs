//! Reputation signal: external lookup behind a cache and rate limiter, with
//! a local heuristic fallback.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use super::limits::{RateLimiter, ReputationCache};
use crate::config::SpamConfig;
use crate::error::SpamError;

/// Score for numbers the heuristic considers bad.
pub const HEURISTIC_BAD_SCORE: f64 = 0.9;
/// Score for everything else.
pub const HEURISTIC_GOOD_SCORE: f64 = 0.1;

/// External phone reputation service. Scores are in `[0, 1]`, higher is
/// worse.
#[async_trait]
pub trait ReputationLookup: Send + Sync {
    async fn lookup(&self, phone: &str) -> Result<f64, SpamError>;
}

/// `GET {base}?phone=…` returning `{"spam_score": f64}`.
pub struct HttpReputationLookup {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct LookupResponse {
    #[serde(default)]
    spam_score: Option<f64>,
}

impl HttpReputationLookup {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, SpamError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SpamError::LookupFailed(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            timeout,
        })
    }
}

#[async_trait]
impl ReputationLookup for HttpReputationLookup {
    async fn lookup(&self, phone: &str) -> Result<f64, SpamError> {
        let response = self
            .client
            .get(&self.base_url)
            .query(&[("phone", phone)])
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    SpamError::LookupTimeout(self.timeout)
                } else {
                    SpamError::LookupFailed(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(SpamError::LookupFailed(format!("HTTP {status}")));
        }
        let body: LookupResponse = response
            .json()
            .await
            .map_err(|e| SpamError::LookupFailed(format!("invalid body: {e}")))?;
        Ok(body.spam_score.unwrap_or(0.0))
    }
}

/// Local rule used when the external service is unavailable.
pub fn heuristic_reputation(phone: &str) -> f64 {
    if phone.ends_with("9999") {
        HEURISTIC_BAD_SCORE
    } else {
        HEURISTIC_GOOD_SCORE
    }
}

/// Where a reputation score came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReputationSource {
    Cached,
    External,
    Heuristic,
}

impl fmt::Display for ReputationSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Cached => "cached external reputation",
            Self::External => "external reputation lookup",
            Self::Heuristic => "internal heuristic",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReputationScore {
    pub score: f64,
    pub source: ReputationSource,
}

/// Cache, then rate-limited lookup, then heuristic.
pub struct ReputationService {
    lookup: Option<Arc<dyn ReputationLookup>>,
    cache: ReputationCache,
    limiter: RateLimiter,
}

impl ReputationService {
    pub fn new(lookup: Option<Arc<dyn ReputationLookup>>, config: &SpamConfig) -> Self {
        Self {
            lookup,
            cache: ReputationCache::new(config.cache_ttl),
            limiter: RateLimiter::new(config.rate_limit, config.rate_window),
        }
    }

    /// Builds an [`HttpReputationLookup`] when a URL is configured.
    pub fn from_config(config: &SpamConfig) -> Result<Self, SpamError> {
        let lookup = match &config.reputation_url {
            Some(url) => Some(
                Arc::new(HttpReputationLookup::new(url, config.lookup_timeout)?)
                    as Arc<dyn ReputationLookup>,
            ),
            None => None,
        };
        Ok(Self::new(lookup, config))
    }

    pub async fn score(&self, phone: &str) -> ReputationScore {
        if let Some(score) = self.cache.get(phone) {
            return ReputationScore {
                score,
                source: ReputationSource::Cached,
            };
        }

        if let Some(lookup) = &self.lookup {
            if !self.limiter.try_acquire() {
                debug!(phone, "Reputation lookups rate limited, using heuristic");
            } else {
                match lookup.lookup(phone).await {
                    Ok(score) => {
                        let score = score.clamp(0.0, 1.0);
                        self.cache.insert(phone, score);
                        return ReputationScore {
                            score,
                            source: ReputationSource::External,
                        };
                    }
                    Err(e) => warn!(phone, error = %e, "Reputation lookup failed, using heuristic"),
                }
            }
        }

        ReputationScore {
            score: heuristic_reputation(phone),
            source: ReputationSource::Heuristic,
        }
    }
}
