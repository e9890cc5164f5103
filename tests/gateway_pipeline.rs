use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use httpmock::Method::POST;
use httpmock::MockServer;
use nexus_gateway::gateway::memory_store::{
    ManualClock, MemoryExactCache, MemoryQuotaStore, MemoryRateLimitStore, MemoryStats,
    MemoryUsageLog, MemoryVectorStore,
};
use nexus_gateway::gateway::{
    CacheTier, ChatRequest, ExactCache, Gateway, GatewayError, LimitsConfig, ProviderCredentials,
    ProviderRouter, QuotaRecord, QuotaStore, RateLimitStore, RateLimiter, SemanticCache,
    StatsSnapshot, StoreError, UsageRecord, VectorStore, render_completion,
};
use nexus_gateway::utils::task::BackgroundTasks;
use nexus_gateway::{Embedder, NexusError};
use serde_json::json;

const CREDENTIAL: &str = "nk-test";

fn completion(content: &str) -> String {
    json!({
        "id": "chatcmpl-1",
        "object": "chat.completion",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": content},
            "finish_reason": "stop"
        }]
    })
    .to_string()
}

fn router_for(upstream: &MockServer) -> ProviderRouter {
    ProviderRouter::new(
        ProviderCredentials {
            openai_api_key: "sk-openai".to_string(),
            anthropic_api_key: Some("sk-ant".to_string()),
            openai_base_url: Some(upstream.url("/v1")),
            anthropic_base_url: Some(upstream.url("/anthropic/v1")),
        },
        reqwest::Client::new(),
    )
}

/// Points at a port nothing listens on; for tests that never dispatch.
fn offline_router() -> ProviderRouter {
    ProviderRouter::new(
        ProviderCredentials {
            openai_api_key: "sk-openai".to_string(),
            openai_base_url: Some("http://127.0.0.1:9/v1".to_string()),
            ..ProviderCredentials::default()
        },
        reqwest::Client::new(),
    )
}

fn chat(prompt: &str) -> ChatRequest {
    ChatRequest {
        client_ip: "10.0.0.1".to_string(),
        credential: Some(CREDENTIAL.to_string()),
        prompt: prompt.to_string(),
        model: None,
        request_id: format!("req-{prompt}"),
        body_error: None,
    }
}

fn quota(usage_count: i64, usage_limit: i64) -> Arc<MemoryQuotaStore> {
    Arc::new(
        MemoryQuotaStore::default()
            .with_credential(CREDENTIAL, QuotaRecord::new(usage_count, usage_limit)),
    )
}

/// Same vector for every input, so any stored answer is a perfect match.
struct ConstantEmbedder(Vec<f32>);

#[async_trait]
impl Embedder for ConstantEmbedder {
    fn model_id(&self) -> &str {
        "constant"
    }

    async fn embed(&self, _text: &str) -> nexus_gateway::Result<Vec<f32>> {
        Ok(self.0.clone())
    }
}

struct FailingEmbedder;

#[async_trait]
impl Embedder for FailingEmbedder {
    fn model_id(&self) -> &str {
        "failing"
    }

    async fn embed(&self, _text: &str) -> nexus_gateway::Result<Vec<f32>> {
        Err(NexusError::InvalidResponse("embedding service down".into()))
    }
}

fn unavailable() -> StoreError {
    StoreError::Timeout {
        operation: "test",
        after_ms: 1,
    }
}

struct DownQuotaStore;

#[async_trait]
impl QuotaStore for DownQuotaStore {
    async fn lookup(&self, _credential: &str) -> Result<Option<QuotaRecord>, StoreError> {
        Err(unavailable())
    }

    async fn increment(&self, _credential: &str) -> Result<(), StoreError> {
        Err(unavailable())
    }

    async fn upgrade(&self, _credential: &str, _new_limit: i64) -> Result<bool, StoreError> {
        Err(unavailable())
    }
}

struct DownRateStore;

#[async_trait]
impl RateLimitStore for DownRateStore {
    async fn incr(&self, _key: &str) -> Result<i64, StoreError> {
        Err(unavailable())
    }

    async fn expire(&self, _key: &str, _ttl: Duration) -> Result<(), StoreError> {
        Err(unavailable())
    }
}

#[tokio::test]
async fn miss_then_exact_hit_then_quota_exhausted() {
    if nexus_gateway::utils::test_support::should_skip_httpmock() {
        return;
    }
    let upstream = MockServer::start();
    let mock = upstream.mock(|when, then| {
        when.method(POST)
            .path("/v1/chat/completions")
            .header("authorization", "Bearer sk-openai");
        then.status(200)
            .header("content-type", "application/json")
            .body(completion("Hi there"));
    });

    let background = BackgroundTasks::tracked();
    let quota_store = quota(0, 5);
    let usage = Arc::new(MemoryUsageLog::default());
    let stats = Arc::new(MemoryStats::default());
    let gateway = Gateway::new(router_for(&upstream), quota_store.clone())
        .with_exact_cache(ExactCache::new(
            Arc::new(MemoryExactCache::default()),
            Duration::from_secs(60),
        ))
        .with_usage_sink(usage.clone())
        .with_stats(stats.clone())
        .with_background_tasks(background.clone());

    let first = gateway.handle(chat("Hello")).await.unwrap();
    background.drain().await;
    assert_eq!(first.tier, CacheTier::Miss);
    assert_eq!(first.model, "gpt-3.5-turbo");
    assert_eq!(first.body, render_completion("Hi there"));
    mock.assert_calls(1);

    let second = gateway.handle(chat("Hello")).await.unwrap();
    background.drain().await;
    assert_eq!(second.tier, CacheTier::Exact);
    assert_eq!(second.body, first.body);
    mock.assert_calls(1);

    for prompt in ["p3", "p4", "p5"] {
        let response = gateway.handle(chat(prompt)).await.unwrap();
        background.drain().await;
        assert_eq!(response.tier, CacheTier::Miss);
    }
    assert_eq!(quota_store.get(CREDENTIAL), Some(QuotaRecord::new(5, 5)));

    // Cached prompts are still refused once the ceiling is reached.
    let err = gateway.handle(chat("Hello")).await.unwrap_err();
    background.drain().await;
    assert!(matches!(
        err,
        GatewayError::QuotaExceeded { usage: 5, limit: 5 }
    ));
    assert_eq!(err.status_code(), 402);
    mock.assert_calls(4);
    assert_eq!(quota_store.get(CREDENTIAL), Some(QuotaRecord::new(5, 5)));

    let records = usage.records();
    assert_eq!(records.len(), 6);
    assert!(!records[0].cache_hit);
    assert!(records[1].cache_hit);
    assert_eq!(
        records[5],
        UsageRecord {
            credential: Some(CREDENTIAL.to_string()),
            model: "gpt-3.5-turbo".to_string(),
            status: 402,
            cache_hit: false,
        }
    );

    assert_eq!(
        gateway.stats().await.unwrap(),
        StatsSnapshot {
            total_requests: 5,
            cache_hits: 1,
            cache_misses: 4,
        }
    );
}

#[tokio::test]
async fn semantic_tier_serves_near_duplicates_after_write_back() {
    if nexus_gateway::utils::test_support::should_skip_httpmock() {
        return;
    }
    let upstream = MockServer::start();
    let mock = upstream.mock(|when, then| {
        when.method(POST).path("/v1/chat/completions");
        then.status(200)
            .header("content-type", "application/json")
            .body(completion("Rust is a systems language."));
    });

    let background = BackgroundTasks::tracked();
    let vectors = Arc::new(MemoryVectorStore::default());
    let gateway = Gateway::new(router_for(&upstream), quota(0, 100))
        .with_semantic_cache(
            Arc::new(ConstantEmbedder(vec![0.6, 0.8])),
            SemanticCache::new(vectors.clone(), 0.9),
        )
        .with_background_tasks(background.clone());

    let first = gateway.handle(chat("What is Rust?")).await.unwrap();
    background.drain().await;
    assert_eq!(first.tier, CacheTier::Miss);
    assert_eq!(vectors.len(), 1);

    let second = gateway.handle(chat("what is rust")).await.unwrap();
    background.drain().await;
    assert_eq!(second.tier, CacheTier::Semantic);
    assert_eq!(second.body, render_completion("Rust is a systems language."));
    mock.assert_calls(1);
}

#[tokio::test]
async fn exact_tier_is_checked_before_semantic() {
    let vectors = Arc::new(MemoryVectorStore::default());
    let cache = SemanticCache::new(vectors.clone(), 0.5);
    cache.store("stale", &[1.0, 0.0], "semantic answer").await.unwrap();

    let exact_store = Arc::new(MemoryExactCache::default());
    let exact = ExactCache::new(exact_store, Duration::from_secs(60));
    exact
        .put(
            &nexus_gateway::gateway::fingerprint("Hello"),
            render_completion("exact answer"),
        )
        .await
        .unwrap();

    let gateway = Gateway::new(offline_router(), quota(0, 10))
        .with_exact_cache(exact)
        .with_semantic_cache(Arc::new(ConstantEmbedder(vec![1.0, 0.0])), cache);

    let response = gateway.handle(chat("Hello")).await.unwrap();
    assert_eq!(response.tier, CacheTier::Exact);
    assert_eq!(response.body, render_completion("exact answer"));

    let response = gateway.handle(chat("Hello there")).await.unwrap();
    assert_eq!(response.tier, CacheTier::Semantic);
    assert_eq!(response.body, render_completion("semantic answer"));
}

#[tokio::test]
async fn embedding_failure_degrades_to_dispatch() {
    if nexus_gateway::utils::test_support::should_skip_httpmock() {
        return;
    }
    let upstream = MockServer::start();
    let mock = upstream.mock(|when, then| {
        when.method(POST).path("/v1/chat/completions");
        then.status(200)
            .header("content-type", "application/json")
            .body(completion("fresh"));
    });

    let vectors = Arc::new(MemoryVectorStore::default());
    let gateway = Gateway::new(router_for(&upstream), quota(0, 10))
        .with_semantic_cache(
            Arc::new(FailingEmbedder),
            SemanticCache::new(vectors.clone(), 0.7),
        );

    let response = gateway.handle(chat("anything")).await.unwrap();
    assert_eq!(response.tier, CacheTier::Miss);
    assert_eq!(response.body, render_completion("fresh"));
    assert!(vectors.is_empty());
    mock.assert_calls(1);
}

#[tokio::test]
async fn below_threshold_match_is_a_miss() {
    if nexus_gateway::utils::test_support::should_skip_httpmock() {
        return;
    }
    let upstream = MockServer::start();
    let mock = upstream.mock(|when, then| {
        when.method(POST).path("/v1/chat/completions");
        then.status(200)
            .header("content-type", "application/json")
            .body(completion("fresh"));
    });

    let vectors = Arc::new(MemoryVectorStore::default());
    vectors
        .upsert(
            "orthogonal",
            &[0.0, 1.0],
            serde_json::Map::from_iter([("response".to_string(), json!("old"))]),
        )
        .await
        .unwrap();
    let gateway = Gateway::new(router_for(&upstream), quota(0, 10)).with_semantic_cache(
        Arc::new(ConstantEmbedder(vec![1.0, 0.0])),
        SemanticCache::new(vectors.clone(), 0.7),
    );

    let response = gateway.handle(chat("new question")).await.unwrap();
    assert_eq!(response.tier, CacheTier::Miss);
    assert_eq!(response.body, render_completion("fresh"));
    assert_eq!(vectors.len(), 2);
    mock.assert_calls(1);
}

#[tokio::test]
async fn unknown_model_falls_back_to_the_default_openai_model() {
    if nexus_gateway::utils::test_support::should_skip_httpmock() {
        return;
    }
    let upstream = MockServer::start();
    let mock = upstream.mock(|when, then| {
        when.method(POST)
            .path("/v1/chat/completions")
            .body_includes("\"model\":\"gpt-3.5-turbo\"");
        then.status(200)
            .header("content-type", "application/json")
            .body(completion("default model"));
    });

    let usage = Arc::new(MemoryUsageLog::default());
    let background = BackgroundTasks::tracked();
    let gateway = Gateway::new(router_for(&upstream), quota(0, 10))
        .with_usage_sink(usage.clone())
        .with_background_tasks(background.clone());

    let mut request = chat("Hi");
    request.model = Some("foo-bar".to_string());
    let response = gateway.handle(request).await.unwrap();
    background.drain().await;

    assert_eq!(response.model, "gpt-3.5-turbo");
    assert_eq!(response.body, render_completion("default model"));
    assert_eq!(usage.records()[0].model, "gpt-3.5-turbo");
    mock.assert_calls(1);
}

#[tokio::test]
async fn anthropic_models_use_the_messages_api() {
    if nexus_gateway::utils::test_support::should_skip_httpmock() {
        return;
    }
    let upstream = MockServer::start();
    let mock = upstream.mock(|when, then| {
        when.method(POST)
            .path("/anthropic/v1/messages")
            .header("x-api-key", "sk-ant")
            .body_includes("\"model\":\"claude-3-haiku-20240307\"");
        then.status(200)
            .header("content-type", "application/json")
            .body(
                json!({
                    "id": "msg_1",
                    "type": "message",
                    "content": [{"type": "text", "text": "from claude"}]
                })
                .to_string(),
            );
    });

    let gateway = Gateway::new(router_for(&upstream), quota(0, 10));
    let mut request = chat("Hi");
    request.model = Some("claude-3-haiku-20240307".to_string());
    let response = gateway.handle(request).await.unwrap();

    assert_eq!(response.model, "claude-3-haiku-20240307");
    // Same envelope as the OpenAI family.
    assert_eq!(response.body, render_completion("from claude"));
    mock.assert_calls(1);
}

#[tokio::test]
async fn upstream_failure_is_502_and_not_cached() {
    if nexus_gateway::utils::test_support::should_skip_httpmock() {
        return;
    }
    let upstream = MockServer::start();
    let mock = upstream.mock(|when, then| {
        when.method(POST).path("/v1/chat/completions");
        then.status(500)
            .header("content-type", "application/json")
            .body(json!({"error": {"message": "overloaded"}}).to_string());
    });

    let background = BackgroundTasks::tracked();
    let quota_store = quota(0, 10);
    let exact_store = Arc::new(MemoryExactCache::default());
    let usage = Arc::new(MemoryUsageLog::default());
    let gateway = Gateway::new(router_for(&upstream), quota_store.clone())
        .with_exact_cache(ExactCache::new(exact_store.clone(), Duration::from_secs(60)))
        .with_usage_sink(usage.clone())
        .with_background_tasks(background.clone());

    let err = gateway.handle(chat("Hello")).await.unwrap_err();
    background.drain().await;

    assert!(matches!(err, GatewayError::Upstream { .. }));
    assert_eq!(err.status_code(), 502);
    assert!(exact_store.is_empty());
    // The charge lands once admission succeeds, whatever dispatch does.
    assert_eq!(quota_store.get(CREDENTIAL), Some(QuotaRecord::new(1, 10)));
    assert_eq!(usage.records().len(), 1);
    assert_eq!(usage.records()[0].status, 502);
    mock.assert_calls(1);
}

#[tokio::test]
async fn credential_failures_are_metered_once() {
    let usage = Arc::new(MemoryUsageLog::default());
    let background = BackgroundTasks::tracked();
    let gateway = Gateway::new(offline_router(), quota(0, 10))
        .with_usage_sink(usage.clone())
        .with_background_tasks(background.clone());

    let mut missing = chat("Hi");
    missing.credential = None;
    let err = gateway.handle(missing).await.unwrap_err();
    assert!(matches!(err, GatewayError::MissingCredential));

    let mut invalid = chat("Hi");
    invalid.credential = Some("nk-unknown".to_string());
    let err = gateway.handle(invalid).await.unwrap_err();
    assert!(matches!(err, GatewayError::InvalidCredential));
    background.drain().await;

    let records = usage.records();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].credential, None);
    assert_eq!(records[0].status, 401);
    assert_eq!(records[1].credential.as_deref(), Some("nk-unknown"));
    assert_eq!(records[1].status, 401);
}

#[tokio::test]
async fn invalid_bodies_are_refused_after_admission_without_a_charge() {
    let quota_store = quota(0, 10);
    let usage = Arc::new(MemoryUsageLog::default());
    let stats = Arc::new(MemoryStats::default());
    let background = BackgroundTasks::tracked();
    let gateway = Gateway::new(offline_router(), quota_store.clone())
        .with_usage_sink(usage.clone())
        .with_stats(stats.clone())
        .with_background_tasks(background.clone());

    let err = gateway.handle(chat("   ")).await.unwrap_err();
    assert!(matches!(err, GatewayError::InvalidRequest { .. }));
    assert_eq!(err.status_code(), 400);

    let mut undecodable = chat("");
    undecodable.body_error = Some("invalid json body: expected value".to_string());
    match gateway.handle(undecodable).await.unwrap_err() {
        GatewayError::InvalidRequest { reason } => assert!(reason.starts_with("invalid json")),
        other => panic!("unexpected error: {other}"),
    }

    // Credential checks still come first.
    let mut anonymous = chat("");
    anonymous.credential = None;
    anonymous.body_error = Some("invalid json body".to_string());
    let err = gateway.handle(anonymous).await.unwrap_err();
    assert!(matches!(err, GatewayError::MissingCredential));
    background.drain().await;

    let statuses: Vec<u16> = usage.records().iter().map(|record| record.status).collect();
    assert_eq!(statuses, vec![400, 400, 401]);
    assert_eq!(quota_store.get(CREDENTIAL), Some(QuotaRecord::new(0, 10)));
    assert_eq!(gateway.stats().await.unwrap(), StatsSnapshot::default());
}

#[tokio::test]
async fn quota_store_outage_fails_closed() {
    let background = BackgroundTasks::tracked();
    let usage = Arc::new(MemoryUsageLog::default());
    let gateway = Gateway::new(offline_router(), Arc::new(DownQuotaStore))
        .with_usage_sink(usage.clone())
        .with_background_tasks(background.clone());

    let err = gateway.handle(chat("Hi")).await.unwrap_err();
    background.drain().await;
    assert!(matches!(err, GatewayError::QuotaUnavailable { .. }));
    assert_eq!(err.status_code(), 503);
    assert_eq!(usage.records()[0].status, 503);
}

#[tokio::test]
async fn rate_store_outage_fails_open() {
    let quota_store = quota(0, 10);
    let background = BackgroundTasks::tracked();
    let limiter = RateLimiter::new(
        Arc::new(DownRateStore),
        &LimitsConfig {
            requests_per_minute: 1,
        },
    );
    let exact = ExactCache::new(Arc::new(MemoryExactCache::default()), Duration::from_secs(60));
    exact
        .put(
            &nexus_gateway::gateway::fingerprint("Hi"),
            render_completion("cached"),
        )
        .await
        .unwrap();
    let gateway = Gateway::new(offline_router(), quota_store.clone())
        .with_rate_limiter(limiter)
        .with_exact_cache(exact)
        .with_background_tasks(background.clone());

    for _ in 0..3 {
        let response = gateway.handle(chat("Hi")).await.unwrap();
        assert_eq!(response.tier, CacheTier::Exact);
    }
    background.drain().await;
    assert_eq!(quota_store.get(CREDENTIAL), Some(QuotaRecord::new(3, 10)));
}

#[tokio::test]
async fn rate_limit_window_is_per_ip_and_resets() {
    let clock = Arc::new(ManualClock::new(1_700_000_000));
    let limiter = RateLimiter::new(
        Arc::new(MemoryRateLimitStore::with_clock(clock.clone())),
        &LimitsConfig::default(),
    );
    let usage = Arc::new(MemoryUsageLog::default());
    let background = BackgroundTasks::tracked();
    let gateway = Gateway::new(offline_router(), quota(0, 10))
        .with_rate_limiter(limiter)
        .with_usage_sink(usage.clone())
        .with_background_tasks(background.clone());

    let anonymous = |ip: &str| ChatRequest {
        client_ip: ip.to_string(),
        credential: None,
        prompt: "Hi".to_string(),
        model: None,
        request_id: "req-rate".to_string(),
        body_error: None,
    };

    // The limiter runs before authentication, so unauthenticated calls count.
    for _ in 0..10 {
        let err = gateway.handle(anonymous("10.0.0.7")).await.unwrap_err();
        assert!(matches!(err, GatewayError::MissingCredential));
    }
    let err = gateway.handle(anonymous("10.0.0.7")).await.unwrap_err();
    assert!(matches!(err, GatewayError::RateLimited { limit: 10 }));
    assert_eq!(err.status_code(), 429);

    let err = gateway.handle(anonymous("10.0.0.8")).await.unwrap_err();
    assert!(matches!(err, GatewayError::MissingCredential));

    clock.advance(Duration::from_secs(60));
    let err = gateway.handle(anonymous("10.0.0.7")).await.unwrap_err();
    assert!(matches!(err, GatewayError::MissingCredential));

    background.drain().await;
    let statuses: Vec<u16> = usage.records().iter().map(|record| record.status).collect();
    assert_eq!(statuses.len(), 13);
    assert_eq!(statuses[10], 429);
    assert_eq!(statuses.iter().filter(|status| **status == 429).count(), 1);
}
