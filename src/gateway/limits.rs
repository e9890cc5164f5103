use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::StoreError;

pub const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);
pub const DEFAULT_REQUESTS_PER_MINUTE: u32 = 10;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub requests_per_minute: u32,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: DEFAULT_REQUESTS_PER_MINUTE,
        }
    }
}

/// Atomic counter with expiry, keyed by string.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Increments the counter and returns the post-increment value.
    async fn incr(&self, key: &str) -> Result<i64, StoreError>;

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateDecision {
    Allowed { count: i64 },
    Limited { count: i64 },
    /// The store could not be reached; the request goes through.
    Unchecked,
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        !matches!(self, Self::Limited { .. })
    }
}

/// Fixed one-minute window per client IP.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
    limit: u32,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("limit", &self.limit)
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    pub fn new(store: Arc<dyn RateLimitStore>, config: &LimitsConfig) -> Self {
        Self {
            store,
            limit: config.requests_per_minute,
        }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn window_key(client_ip: &str) -> String {
        format!("rate:{client_ip}")
    }

    pub async fn allow(&self, client_ip: &str) -> bool {
        self.check(client_ip).await.is_allowed()
    }

    pub async fn check(&self, client_ip: &str) -> RateDecision {
        let key = Self::window_key(client_ip);
        let count = match self.store.incr(&key).await {
            Ok(count) => count,
            Err(err) => {
                // Availability of the chat path wins over strict enforcement.
                tracing::warn!(client_ip, error = %err, "rate limit store unavailable, allowing request");
                return RateDecision::Unchecked;
            }
        };

        // Only the first request of a window sets its boundary.
        if count == 1 {
            if let Err(err) = self.store.expire(&key, RATE_LIMIT_WINDOW).await {
                tracing::warn!(client_ip, error = %err, "failed to set rate limit window expiry");
            }
        }

        if count > i64::from(self.limit) {
            tracing::info!(client_ip, count, limit = self.limit, "rate limited");
            RateDecision::Limited { count }
        } else {
            RateDecision::Allowed { count }
        }
    }
}
