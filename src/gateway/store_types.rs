use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failures of the external stores behind the pipeline.
///
/// The pipeline only lets these change a response at the quota boundary
/// (fail-closed). Everywhere else they are logged and absorbed.
#[derive(Debug, Error)]
pub enum StoreError {
    #[cfg(feature = "store-redis")]
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[cfg(feature = "store-postgres")]
    #[error("postgres error: {0}")]
    Postgres(#[from] sqlx::Error),
    #[error("vector store error: {0}")]
    Vector(#[from] crate::NexusError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{operation} timed out after {after_ms}ms")]
    Timeout { operation: &'static str, after_ms: u64 },
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Bounds a store round trip so a stuck dependency cannot hold a request.
pub async fn with_timeout<T, E, F>(
    operation: &'static str,
    timeout: Duration,
    future: F,
) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, E>>,
    E: Into<StoreError>,
{
    match tokio::time::timeout(timeout, future).await {
        Ok(result) => result.map_err(Into::into),
        Err(_) => Err(StoreError::Timeout {
            operation,
            after_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }),
    }
}

/// A credential's row in the quota store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaRecord {
    pub usage_count: i64,
    pub usage_limit: i64,
}

impl QuotaRecord {
    pub fn new(usage_count: i64, usage_limit: i64) -> Self {
        Self {
            usage_count,
            usage_limit,
        }
    }

    pub fn is_under_limit(&self) -> bool {
        self.usage_count < self.usage_limit
    }
}

/// One metering event. Exactly one is emitted per chat pipeline outcome.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub credential: Option<String>,
    pub model: String,
    pub status: u16,
    pub cache_hit: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub total_requests: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

/// Request count for one hour-of-day bucket (`"HH:00"`, UTC) of the last
/// 24 hours.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphPoint {
    pub time: String,
    pub count: i64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VectorMatch {
    pub id: String,
    pub score: f32,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// Shortens a credential for log lines.
pub fn redact_credential(credential: &str) -> String {
    let visible: String = credential.chars().take(6).collect();
    if visible.len() == credential.len() {
        return "***".to_string();
    }
    format!("{visible}***")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_record_is_exclusive_at_the_ceiling() {
        assert!(QuotaRecord::new(4, 5).is_under_limit());
        assert!(!QuotaRecord::new(5, 5).is_under_limit());
        assert!(!QuotaRecord::new(9, 5).is_under_limit());
    }

    #[test]
    fn redact_credential_keeps_a_short_prefix() {
        assert_eq!(redact_credential("nk-0123456789abcdef"), "nk-012***");
        assert_eq!(redact_credential("short"), "***");
    }

    #[tokio::test]
    async fn with_timeout_reports_the_operation() {
        let err = with_timeout(
            "slow_op",
            Duration::from_millis(5),
            async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<(), StoreError>(())
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            StoreError::Timeout {
                operation: "slow_op",
                ..
            }
        ));
    }
}
