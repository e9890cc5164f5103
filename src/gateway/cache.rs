use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::StoreError;
use super::semantic_cache::DEFAULT_SIMILARITY_THRESHOLD;

pub const DEFAULT_EXACT_TTL_SECONDS: u64 = 24 * 60 * 60;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub exact_enabled: bool,
    pub exact_ttl_seconds: u64,
    pub semantic_enabled: bool,
    pub semantic_threshold: f32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            exact_enabled: true,
            exact_ttl_seconds: DEFAULT_EXACT_TTL_SECONDS,
            semantic_enabled: true,
            semantic_threshold: DEFAULT_SIMILARITY_THRESHOLD,
        }
    }
}

/// Which tier served a response. Rendered into the `x-cache` header.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheTier {
    Miss,
    Exact,
    Semantic,
}

impl CacheTier {
    pub fn header_value(self) -> &'static str {
        match self {
            Self::Miss => "MISS",
            Self::Exact => "HIT",
            Self::Semantic => "HIT-SEMANTIC",
        }
    }

    pub fn is_hit(self) -> bool {
        !matches!(self, Self::Miss)
    }
}

/// SHA-256 of the raw prompt bytes, lowercase hex.
///
/// No normalization: case and whitespace are significant, and neither the
/// model nor the credential takes part.
pub fn fingerprint(prompt: &str) -> String {
    let digest = Sha256::digest(prompt.as_bytes());
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

#[async_trait]
pub trait ExactCacheStore: Send + Sync {
    async fn get(&self, digest: &str) -> Result<Option<Bytes>, StoreError>;

    async fn put(&self, digest: &str, body: Bytes, ttl: Duration) -> Result<(), StoreError>;
}

#[derive(Clone)]
pub struct ExactCache {
    store: Arc<dyn ExactCacheStore>,
    ttl: Duration,
}

impl std::fmt::Debug for ExactCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExactCache")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl ExactCache {
    pub fn new(store: Arc<dyn ExactCacheStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub async fn get(&self, digest: &str) -> Result<Option<Bytes>, StoreError> {
        self.store.get(digest).await
    }

    pub async fn put(&self, digest: &str, body: Bytes) -> Result<(), StoreError> {
        self.store.put(digest, body, self.ttl).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_deterministic_sha256_hex() {
        let first = fingerprint("Hello");
        assert_eq!(first, fingerprint("Hello"));
        assert_eq!(
            first,
            "185f8db32271fe25f561a6fc938b2e264306ec304eda518007d1764826381969"
        );
        assert_eq!(first.len(), 64);
    }

    #[test]
    fn fingerprint_is_case_and_whitespace_sensitive() {
        let base = fingerprint("Hello");
        assert_ne!(base, fingerprint("hello"));
        assert_ne!(base, fingerprint("Hello "));
        assert_ne!(base, fingerprint(" Hello"));
        assert_ne!(fingerprint(""), base);
    }

    #[test]
    fn tier_header_values() {
        assert_eq!(CacheTier::Miss.header_value(), "MISS");
        assert_eq!(CacheTier::Exact.header_value(), "HIT");
        assert_eq!(CacheTier::Semantic.header_value(), "HIT-SEMANTIC");
        assert!(!CacheTier::Miss.is_hit());
        assert!(CacheTier::Semantic.is_hit());
    }
}
