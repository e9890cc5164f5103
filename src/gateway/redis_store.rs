use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tokio::sync::OnceCell;

use super::cache::ExactCacheStore;
use super::limits::RateLimitStore;
use super::observability::StatsStore;
use super::{StatsSnapshot, StoreError, with_timeout};

const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(2);

const KEY_TOTAL_REQUESTS: &str = "stats:total_requests";
const KEY_CACHE_HITS: &str = "stats:cache_hits";
const KEY_CACHE_MISSES: &str = "stats:cache_misses";

/// Rate-limit windows, the exact cache and the stats counters.
///
/// One connection manager is created on first use and shared by every clone.
/// Keys are unprefixed unless [`RedisStore::with_prefix`] is set, so the
/// rate-limit key for an IP is literally `rate:<ip>`.
#[derive(Clone)]
pub struct RedisStore {
    client: redis::Client,
    prefix: Option<String>,
    timeout: Duration,
    connection: Arc<OnceCell<ConnectionManager>>,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("prefix", &self.prefix)
            .field("timeout", &self.timeout)
            .field("connected", &self.connection.initialized())
            .finish()
    }
}

impl RedisStore {
    pub fn new(url: impl AsRef<str>) -> Result<Self, StoreError> {
        Ok(Self {
            client: redis::Client::open(url.as_ref())?,
            prefix: None,
            timeout: DEFAULT_OPERATION_TIMEOUT,
            connection: Arc::new(OnceCell::new()),
        })
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        self.prefix = (!prefix.is_empty()).then_some(prefix);
        self
    }

    /// Bound applied to every round trip, connecting included.
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    fn key(&self, raw: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{prefix}:{raw}"),
            None => raw.to_string(),
        }
    }

    async fn connection(&self) -> Result<ConnectionManager, StoreError> {
        let manager = self
            .connection
            .get_or_try_init(|| {
                with_timeout(
                    "redis.connect",
                    self.timeout,
                    ConnectionManager::new(self.client.clone()),
                )
            })
            .await?;
        Ok(manager.clone())
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let _: String = with_timeout(
            "redis.ping",
            self.timeout,
            redis::cmd("PING").query_async(&mut conn),
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl RateLimitStore for RedisStore {
    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        let mut conn = self.connection().await?;
        with_timeout("redis.incr", self.timeout, conn.incr(self.key(key), 1_i64)).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let seconds = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
        let _: bool =
            with_timeout("redis.expire", self.timeout, conn.expire(self.key(key), seconds))
                .await?;
        Ok(())
    }
}

#[async_trait]
impl ExactCacheStore for RedisStore {
    async fn get(&self, digest: &str) -> Result<Option<Bytes>, StoreError> {
        let mut conn = self.connection().await?;
        let body: Option<Vec<u8>> =
            with_timeout("redis.get", self.timeout, conn.get(self.key(digest))).await?;
        Ok(body.map(Bytes::from))
    }

    async fn put(&self, digest: &str, body: Bytes, ttl: Duration) -> Result<(), StoreError> {
        if ttl.is_zero() {
            return Ok(());
        }
        let mut conn = self.connection().await?;
        let _: () = with_timeout(
            "redis.set_ex",
            self.timeout,
            conn.set_ex(self.key(digest), body.as_ref(), ttl.as_secs()),
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl StatsStore for RedisStore {
    async fn record(&self, cache_hit: bool) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let outcome_key = if cache_hit {
            KEY_CACHE_HITS
        } else {
            KEY_CACHE_MISSES
        };
        let mut pipe = redis::pipe();
        pipe.atomic()
            .incr(self.key(KEY_TOTAL_REQUESTS), 1_i64)
            .ignore()
            .incr(self.key(outcome_key), 1_i64)
            .ignore();
        let _: () = with_timeout("redis.stats_incr", self.timeout, pipe.query_async(&mut conn))
            .await?;
        Ok(())
    }

    async fn snapshot(&self) -> Result<StatsSnapshot, StoreError> {
        let mut conn = self.connection().await?;
        let keys = vec![
            self.key(KEY_TOTAL_REQUESTS),
            self.key(KEY_CACHE_HITS),
            self.key(KEY_CACHE_MISSES),
        ];
        let values: Vec<Option<u64>> =
            with_timeout("redis.mget", self.timeout, conn.mget(&keys)).await?;
        let value = |index: usize| values.get(index).copied().flatten().unwrap_or(0);
        Ok(StatsSnapshot {
            total_requests: value(0),
            cache_hits: value(1),
            cache_misses: value(2),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::limits::{LimitsConfig, RateLimiter};
    use crate::utils::test_support::{redis_url, unique_suffix};

    fn test_store() -> Option<RedisStore> {
        let url = redis_url()?;
        Some(
            RedisStore::new(url)
                .unwrap()
                .with_prefix(format!("nexus_test:{}", unique_suffix())),
        )
    }

    #[test]
    fn keys_are_unprefixed_by_default() {
        let store = RedisStore::new("redis://127.0.0.1/").unwrap();
        assert_eq!(store.key("rate:10.0.0.1"), "rate:10.0.0.1");
        let store = store.with_prefix("nexus");
        assert_eq!(store.key("rate:10.0.0.1"), "nexus:rate:10.0.0.1");
    }

    #[tokio::test]
    async fn unreachable_server_times_out_or_errors() {
        let store = RedisStore::new("redis://127.0.0.1:1/")
            .unwrap()
            .with_operation_timeout(Duration::from_millis(200));
        assert!(store.incr("rate:unreachable").await.is_err());
    }

    #[tokio::test]
    async fn rate_window_counts_and_expires() {
        let Some(store) = test_store() else {
            return;
        };
        let limiter = RateLimiter::new(
            Arc::new(store.clone()),
            &LimitsConfig {
                requests_per_minute: 2,
            },
        );
        assert!(limiter.allow("10.1.1.1").await);
        assert!(limiter.allow("10.1.1.1").await);
        assert!(!limiter.allow("10.1.1.1").await);
        assert!(limiter.allow("10.1.1.2").await);

        let mut conn = store.connection().await.unwrap();
        let ttl: i64 = conn
            .ttl(store.key(&RateLimiter::window_key("10.1.1.1")))
            .await
            .unwrap();
        assert!((1..=60).contains(&ttl), "ttl = {ttl}");
    }

    #[tokio::test]
    async fn exact_cache_round_trip() {
        let Some(store) = test_store() else {
            return;
        };
        assert_eq!(ExactCacheStore::get(&store, "abc").await.unwrap(), None);
        store
            .put("abc", Bytes::from_static(b"{\"ok\":true}"), Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(
            ExactCacheStore::get(&store, "abc").await.unwrap(),
            Some(Bytes::from_static(b"{\"ok\":true}"))
        );
    }

    #[tokio::test]
    async fn stats_counters() {
        let Some(store) = test_store() else {
            return;
        };
        store.record(true).await.unwrap();
        store.record(false).await.unwrap();
        assert_eq!(
            store.snapshot().await.unwrap(),
            StatsSnapshot {
                total_requests: 2,
                cache_hits: 1,
                cache_misses: 1,
            }
        );
    }
}
