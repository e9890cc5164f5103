//! Admission and caching pipeline in front of the chat providers.

pub mod cache;
pub mod config;
pub mod http;
pub mod limits;
pub mod logging;
pub mod memory_store;
pub mod metering;
pub mod observability;
#[cfg(feature = "store-postgres")]
pub mod postgres_store;
pub mod quota;
#[cfg(feature = "store-redis")]
pub mod redis_store;
pub mod router;
pub mod semantic_cache;
mod store_types;
#[cfg(feature = "store-pinecone")]
pub mod vector_store;

use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::embedding::Embedder;
use crate::providers::ChatProvider;
use crate::utils::task::BackgroundTasks;

pub use cache::{CacheConfig, CacheTier, ExactCache, ExactCacheStore, fingerprint};
pub use config::{ConfigError, Env, GatewayConfig};
pub use http::{CheckoutHandler, GatewayHttpState};
pub use limits::{LimitsConfig, RateDecision, RateLimitStore, RateLimiter};
pub use metering::{UsageMeter, UsageSink};
pub use observability::StatsStore;
#[cfg(feature = "store-postgres")]
pub use postgres_store::PostgresStore;
pub use quota::{Admission, QuotaGate, QuotaStore};
#[cfg(feature = "store-redis")]
pub use redis_store::RedisStore;
pub use router::{ProviderCredentials, ProviderFamily, ProviderRouter, Route};
pub use semantic_cache::{SemanticCache, SemanticHit, VectorStore};
pub use store_types::{
    GraphPoint, QuotaRecord, StatsSnapshot, StoreError, UsageRecord, VectorMatch,
    redact_credential, with_timeout,
};
#[cfg(feature = "store-pinecone")]
pub use vector_store::PineconeStore;

/// One chat call as the pipeline sees it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatRequest {
    pub client_ip: String,
    pub credential: Option<String>,
    pub prompt: String,
    pub model: Option<String>,
    pub request_id: String,
    /// Set when the transport could not decode the body. The request still
    /// goes through rate limiting and admission, then fails with
    /// [`GatewayError::InvalidRequest`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_error: Option<String>,
}

impl ChatRequest {
    /// The prompt, or why this request cannot be dispatched.
    fn validated_prompt(&self) -> Result<&str, GatewayError> {
        if let Some(reason) = &self.body_error {
            return Err(GatewayError::InvalidRequest {
                reason: reason.clone(),
            });
        }
        if self.prompt.trim().is_empty() {
            return Err(GatewayError::InvalidRequest {
                reason: "message must be a non-empty string".to_string(),
            });
        }
        Ok(&self.prompt)
    }
}

#[derive(Clone, Debug)]
pub struct ChatResponse {
    /// Normalized completion envelope, ready to write to the client.
    pub body: Bytes,
    pub tier: CacheTier,
    pub model: String,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("rate limit exceeded: {limit} requests per minute")]
    RateLimited { limit: u32 },
    #[error("missing credential")]
    MissingCredential,
    #[error("invalid credential")]
    InvalidCredential,
    #[error("quota exceeded: usage={usage} limit={limit}")]
    QuotaExceeded { usage: i64, limit: i64 },
    #[error("quota store unavailable: {message}")]
    QuotaUnavailable { message: String },
    #[error("upstream error: {message}")]
    Upstream { message: String },
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },
}

impl GatewayError {
    pub fn status_code(&self) -> u16 {
        match self {
            Self::RateLimited { .. } => 429,
            Self::MissingCredential | Self::InvalidCredential => 401,
            Self::QuotaExceeded { .. } => 402,
            Self::QuotaUnavailable { .. } => 503,
            Self::Upstream { .. } => 502,
            Self::InvalidRequest { .. } => 400,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "rate_limited",
            Self::MissingCredential => "missing_credential",
            Self::InvalidCredential => "invalid_credential",
            Self::QuotaExceeded { .. } => "quota_exceeded",
            Self::QuotaUnavailable { .. } => "quota_unavailable",
            Self::Upstream { .. } => "upstream_error",
            Self::InvalidRequest { .. } => "invalid_request",
        }
    }

    /// Whether the request got past admission before failing.
    fn passed_admission(&self) -> bool {
        matches!(self, Self::Upstream { .. })
    }
}

pub trait Clock: Send + Sync {
    fn now_epoch_seconds(&self) -> u64;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_epoch_seconds(&self) -> u64 {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_else(|_| std::time::Duration::from_secs(0));
        now.as_secs()
    }
}

#[derive(Serialize)]
struct CompletionEnvelope<'a> {
    choices: [CompletionChoice<'a>; 1],
}

#[derive(Serialize)]
struct CompletionChoice<'a> {
    index: u32,
    message: CompletionMessage<'a>,
}

#[derive(Serialize)]
struct CompletionMessage<'a> {
    role: &'static str,
    content: &'a str,
}

/// Renders answer text into the one shape clients ever see, whatever the
/// provider family or cache tier.
pub fn render_completion(content: &str) -> Bytes {
    let envelope = CompletionEnvelope {
        choices: [CompletionChoice {
            index: 0,
            message: CompletionMessage {
                role: "assistant",
                content,
            },
        }],
    };
    match serde_json::to_vec(&envelope) {
        Ok(body) => Bytes::from(body),
        Err(_) => Bytes::from_static(b"{\"choices\":[]}"),
    }
}

#[derive(Clone)]
struct SemanticTier {
    embedder: Arc<dyn Embedder>,
    cache: SemanticCache,
}

/// Result of the cache lookup stage.
enum Lookup {
    Hit(ChatResponse),
    /// `values` is the prompt embedding when one was computed, reused for
    /// write-back.
    Miss { values: Option<Vec<f32>> },
}

/// The pipeline. Holds only shared handles, so one instance serves every
/// concurrent request through `&self`.
pub struct Gateway {
    router: ProviderRouter,
    quota: QuotaGate,
    limiter: Option<RateLimiter>,
    exact: Option<ExactCache>,
    semantic: Option<SemanticTier>,
    meter: UsageMeter,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("router", &self.router)
            .field("limiter", &self.limiter)
            .field("exact", &self.exact)
            .field("semantic", &self.semantic.as_ref().map(|tier| &tier.cache))
            .field("meter", &self.meter)
            .finish_non_exhaustive()
    }
}

impl Gateway {
    pub fn new(router: ProviderRouter, quota_store: Arc<dyn QuotaStore>) -> Self {
        Self {
            router,
            quota: QuotaGate::new(quota_store),
            limiter: None,
            exact: None,
            semantic: None,
            meter: UsageMeter::new(),
        }
    }

    pub fn with_rate_limiter(mut self, limiter: RateLimiter) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn with_exact_cache(mut self, cache: ExactCache) -> Self {
        self.exact = Some(cache);
        self
    }

    pub fn with_semantic_cache(mut self, embedder: Arc<dyn Embedder>, cache: SemanticCache) -> Self {
        self.semantic = Some(SemanticTier { embedder, cache });
        self
    }

    pub fn with_usage_sink(mut self, sink: Arc<dyn UsageSink>) -> Self {
        self.meter = self.meter.with_sink(sink);
        self
    }

    pub fn with_stats(mut self, stats: Arc<dyn StatsStore>) -> Self {
        self.meter = self.meter.with_stats(stats);
        self
    }

    /// Where usage charges and metering run. Defaults to detached tasks.
    pub fn with_background_tasks(mut self, background: BackgroundTasks) -> Self {
        self.quota = self.quota.with_background(background.clone());
        self.meter = self.meter.with_background(background);
        self
    }

    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.router = self.router.with_default_model(model);
        self
    }

    pub fn router(&self) -> &ProviderRouter {
        &self.router
    }

    /// Zeroed counters when no stats store is attached.
    pub async fn stats(&self) -> Result<StatsSnapshot, StoreError> {
        match self.meter.stats() {
            Some(stats) => stats.snapshot().await,
            None => Ok(StatsSnapshot::default()),
        }
    }

    /// Hourly traffic for the dashboard, read from the usage sink.
    pub async fn graph(&self) -> Result<Vec<GraphPoint>, StoreError> {
        self.meter.graph().await
    }

    /// Credential check without the quota ceiling. Both allowed and
    /// exhausted credentials pass.
    pub async fn authenticate(&self, credential: Option<&str>) -> Result<QuotaRecord, GatewayError> {
        let credential = credential.ok_or(GatewayError::MissingCredential)?;
        match self.admit(credential).await? {
            Admission::Unknown => Err(GatewayError::InvalidCredential),
            Admission::Allowed(record) | Admission::Exhausted(record) => Ok(record),
        }
    }

    pub async fn upgrade(&self, credential: &str, new_limit: i64) -> Result<bool, StoreError> {
        self.quota.upgrade(credential, new_limit).await
    }

    /// Runs the full pipeline and meters the outcome exactly once.
    pub async fn handle(&self, request: ChatRequest) -> Result<ChatResponse, GatewayError> {
        let route = self.router.route(request.model.as_deref());
        tracing::info!(
            event = "gateway.request",
            request_id = %request.request_id,
            client_ip = %request.client_ip,
            model = %route.model,
            fallback = route.fallback,
        );

        let outcome = self.run(&request, &route).await;

        let (status, cache_hit, served) = match &outcome {
            Ok(response) => (200, response.tier.is_hit(), true),
            Err(err) => (err.status_code(), false, err.passed_admission()),
        };
        self.meter.emit(
            UsageRecord {
                credential: request.credential.clone(),
                model: route.model.clone(),
                status,
                cache_hit,
            },
            served,
        );

        match &outcome {
            Ok(response) => tracing::info!(
                event = "gateway.response",
                request_id = %request.request_id,
                model = %response.model,
                cache = response.tier.header_value(),
            ),
            Err(err) => tracing::info!(
                event = "gateway.error",
                request_id = %request.request_id,
                status,
                error = %err,
            ),
        }
        outcome
    }

    async fn run(&self, request: &ChatRequest, route: &Route) -> Result<ChatResponse, GatewayError> {
        if let Some(limiter) = &self.limiter {
            if !limiter.allow(&request.client_ip).await {
                return Err(GatewayError::RateLimited {
                    limit: limiter.limit(),
                });
            }
        }

        let credential = request
            .credential
            .as_deref()
            .ok_or(GatewayError::MissingCredential)?;
        match self.admit(credential).await? {
            Admission::Unknown => return Err(GatewayError::InvalidCredential),
            Admission::Exhausted(record) => {
                return Err(GatewayError::QuotaExceeded {
                    usage: record.usage_count,
                    limit: record.usage_limit,
                });
            }
            Admission::Allowed(_) => {}
        }

        // Admitted but undecodable requests are refused without a charge.
        let prompt = request.validated_prompt()?;

        self.quota.charge(credential);

        let digest = fingerprint(prompt);
        let values = match self.lookup(&digest, prompt, route).await {
            Lookup::Hit(response) => return Ok(response),
            Lookup::Miss { values } => values,
        };

        let adapter = self.router.adapter(route);
        let answer = adapter.send(prompt).await.map_err(|err| {
            tracing::warn!(
                request_id = %request.request_id,
                provider = adapter.provider(),
                model = adapter.model_id(),
                error = %err,
                "provider dispatch failed"
            );
            GatewayError::Upstream {
                message: err.to_string(),
            }
        })?;

        let body = render_completion(&answer);
        self.write_back(&digest, values.as_deref(), &answer, &body)
            .await;

        Ok(ChatResponse {
            body,
            tier: CacheTier::Miss,
            model: route.model.clone(),
        })
    }

    async fn admit(&self, credential: &str) -> Result<Admission, GatewayError> {
        self.quota.admit(credential).await.map_err(|err| {
            tracing::warn!(
                credential = %redact_credential(credential),
                operation = "quota.lookup",
                error = %err,
                "quota store unavailable, denying request"
            );
            GatewayError::QuotaUnavailable {
                message: err.to_string(),
            }
        })
    }

    /// Exact tier first, then semantic. Every failure here degrades to a miss.
    async fn lookup(&self, digest: &str, prompt: &str, route: &Route) -> Lookup {
        if let Some(exact) = &self.exact {
            match exact.get(digest).await {
                Ok(Some(body)) => {
                    return Lookup::Hit(ChatResponse {
                        body,
                        tier: CacheTier::Exact,
                        model: route.model.clone(),
                    });
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(operation = "exact_cache.get", error = %err, "exact cache lookup failed");
                }
            }
        }

        let Some(semantic) = &self.semantic else {
            return Lookup::Miss { values: None };
        };
        let values = match semantic.embedder.embed(prompt).await {
            Ok(values) => values,
            Err(err) => {
                tracing::warn!(
                    operation = "embedding",
                    model = semantic.embedder.model_id(),
                    error = %err,
                    "embedding failed, skipping semantic cache"
                );
                return Lookup::Miss { values: None };
            }
        };
        match semantic.cache.lookup(&values).await {
            Ok(Some(hit)) => {
                tracing::debug!(id = %hit.id, score = hit.score, "semantic cache hit");
                Lookup::Hit(ChatResponse {
                    body: render_completion(&hit.answer),
                    tier: CacheTier::Semantic,
                    model: route.model.clone(),
                })
            }
            Ok(None) => Lookup::Miss {
                values: Some(values),
            },
            Err(err) => {
                tracing::warn!(operation = "semantic_cache.query", error = %err, "semantic cache lookup failed");
                Lookup::Miss {
                    values: Some(values),
                }
            }
        }
    }

    async fn write_back(&self, digest: &str, values: Option<&[f32]>, answer: &str, body: &Bytes) {
        if let Some(exact) = &self.exact {
            if let Err(err) = exact.put(digest, body.clone()).await {
                tracing::warn!(operation = "exact_cache.put", error = %err, "exact cache write failed");
            }
        }
        if let (Some(semantic), Some(values)) = (&self.semantic, values) {
            if let Err(err) = semantic.cache.store(digest, values, answer).await {
                tracing::warn!(operation = "semantic_cache.upsert", error = %err, "semantic cache write failed");
            }
        }
    }
}
