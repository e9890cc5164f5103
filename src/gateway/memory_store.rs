//! Process-local implementations of every store seam.
//!
//! They back the gateway when no external store is configured and make the
//! pipeline testable without infrastructure. They share state only within one
//! process, so a horizontally scaled deployment needs the external stores.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use super::cache::ExactCacheStore;
use super::limits::RateLimitStore;
use super::metering::UsageSink;
use super::observability::StatsStore;
use super::quota::QuotaStore;
use super::semantic_cache::{VectorStore, cosine_similarity};
use super::{
    Clock, GraphPoint, QuotaRecord, StatsSnapshot, StoreError, SystemClock, UsageRecord,
    VectorMatch,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A clock tests move by hand.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_epoch_seconds: u64) -> Self {
        Self {
            now: AtomicU64::new(start_epoch_seconds),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_secs(), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_epoch_seconds(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy)]
struct Window {
    count: i64,
    expires_at: Option<u64>,
}

pub struct MemoryRateLimitStore {
    clock: Arc<dyn Clock>,
    windows: Mutex<HashMap<String, Window>>,
}

impl Default for MemoryRateLimitStore {
    fn default() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }
}

impl MemoryRateLimitStore {
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            windows: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl RateLimitStore for MemoryRateLimitStore {
    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        let now = self.clock.now_epoch_seconds();
        let mut windows = lock(&self.windows);
        // Keep only live windows.
        windows.retain(|_, window| window.expires_at.is_none_or(|at| now < at));
        let window = windows.entry(key.to_string()).or_insert(Window {
            count: 0,
            expires_at: None,
        });
        window.count = window.count.saturating_add(1);
        Ok(window.count)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        let expires_at = self.clock.now_epoch_seconds().saturating_add(ttl.as_secs());
        if let Some(window) = lock(&self.windows).get_mut(key) {
            window.expires_at = Some(expires_at);
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryQuotaStore {
    records: Mutex<HashMap<String, QuotaRecord>>,
}

impl MemoryQuotaStore {
    pub fn insert(&self, credential: impl Into<String>, record: QuotaRecord) {
        lock(&self.records).insert(credential.into(), record);
    }

    pub fn with_credential(self, credential: impl Into<String>, record: QuotaRecord) -> Self {
        self.insert(credential, record);
        self
    }

    pub fn get(&self, credential: &str) -> Option<QuotaRecord> {
        lock(&self.records).get(credential).copied()
    }
}

#[async_trait]
impl QuotaStore for MemoryQuotaStore {
    async fn lookup(&self, credential: &str) -> Result<Option<QuotaRecord>, StoreError> {
        Ok(self.get(credential))
    }

    async fn increment(&self, credential: &str) -> Result<(), StoreError> {
        if let Some(record) = lock(&self.records).get_mut(credential) {
            record.usage_count = record.usage_count.saturating_add(1);
        }
        Ok(())
    }

    async fn upgrade(&self, credential: &str, new_limit: i64) -> Result<bool, StoreError> {
        let mut records = lock(&self.records);
        let Some(record) = records.get_mut(credential) else {
            return Ok(false);
        };
        *record = QuotaRecord::new(0, new_limit);
        Ok(true)
    }
}

#[derive(Debug, Clone)]
struct CachedBody {
    body: Bytes,
    expires_at: u64,
}

pub struct MemoryExactCache {
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<String, CachedBody>>,
}

impl Default for MemoryExactCache {
    fn default() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }
}

impl MemoryExactCache {
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ExactCacheStore for MemoryExactCache {
    async fn get(&self, digest: &str) -> Result<Option<Bytes>, StoreError> {
        let now = self.clock.now_epoch_seconds();
        let mut entries = lock(&self.entries);
        let Some(entry) = entries.get(digest) else {
            return Ok(None);
        };
        if now >= entry.expires_at {
            entries.remove(digest);
            return Ok(None);
        }
        Ok(Some(entry.body.clone()))
    }

    async fn put(&self, digest: &str, body: Bytes, ttl: Duration) -> Result<(), StoreError> {
        if ttl.is_zero() {
            return Ok(());
        }
        let expires_at = self.clock.now_epoch_seconds().saturating_add(ttl.as_secs());
        lock(&self.entries).insert(digest.to_string(), CachedBody { body, expires_at });
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct StoredVector {
    values: Vec<f32>,
    metadata: serde_json::Map<String, serde_json::Value>,
}

/// Brute-force nearest neighbour over cosine similarity.
#[derive(Debug, Default)]
pub struct MemoryVectorStore {
    vectors: Mutex<HashMap<String, StoredVector>>,
}

impl MemoryVectorStore {
    pub fn len(&self) -> usize {
        lock(&self.vectors).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    async fn upsert(
        &self,
        id: &str,
        values: &[f32],
        metadata: serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), StoreError> {
        lock(&self.vectors).insert(
            id.to_string(),
            StoredVector {
                values: values.to_vec(),
                metadata,
            },
        );
        Ok(())
    }

    async fn query(&self, values: &[f32], top_k: usize) -> Result<Vec<VectorMatch>, StoreError> {
        let vectors = lock(&self.vectors);
        let mut matches: Vec<VectorMatch> = vectors
            .iter()
            .map(|(id, stored)| VectorMatch {
                id: id.clone(),
                score: cosine_similarity(values, &stored.values),
                metadata: stored.metadata.clone(),
            })
            .collect();
        matches.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
        matches.truncate(top_k);
        Ok(matches)
    }
}

const GRAPH_WINDOW_SECONDS: u64 = 24 * 60 * 60;

pub struct MemoryUsageLog {
    clock: Arc<dyn Clock>,
    records: Mutex<Vec<(u64, UsageRecord)>>,
}

impl Default for MemoryUsageLog {
    fn default() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }
}

impl MemoryUsageLog {
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            records: Mutex::new(Vec::new()),
        }
    }

    pub fn records(&self) -> Vec<UsageRecord> {
        lock(&self.records)
            .iter()
            .map(|(_, record)| record.clone())
            .collect()
    }
}

#[async_trait]
impl UsageSink for MemoryUsageLog {
    async fn record(&self, record: &UsageRecord) -> Result<(), StoreError> {
        let now = self.clock.now_epoch_seconds();
        lock(&self.records).push((now, record.clone()));
        Ok(())
    }

    async fn graph(&self) -> Result<Vec<GraphPoint>, StoreError> {
        let now = self.clock.now_epoch_seconds();
        let since = now.saturating_sub(GRAPH_WINDOW_SECONDS);
        let mut buckets: BTreeMap<String, i64> = BTreeMap::new();
        for (at, _) in lock(&self.records).iter() {
            if *at > since {
                let hour = (at / 3600) % 24;
                *buckets.entry(format!("{hour:02}:00")).or_default() += 1;
            }
        }
        Ok(buckets
            .into_iter()
            .map(|(time, count)| GraphPoint { time, count })
            .collect())
    }
}

#[derive(Debug, Default)]
pub struct MemoryStats {
    total_requests: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
}

#[async_trait]
impl StatsStore for MemoryStats {
    async fn record(&self, cache_hit: bool) -> Result<(), StoreError> {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        if cache_hit {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.cache_misses.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    async fn snapshot(&self) -> Result<StatsSnapshot, StoreError> {
        Ok(StatsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
        })
    }
}
