use std::sync::Arc;

use nexus_gateway::gateway::memory_store::{MemoryQuotaStore, MemoryStats};
use nexus_gateway::gateway::{Gateway, GatewayConfig, ProviderRouter};
use nexus_gateway::providers::transport::http_client;

pub(crate) fn build_gateway(config: &GatewayConfig) -> Result<Gateway, Box<dyn std::error::Error>> {
    let http = http_client(config.upstream_timeout());
    let router = ProviderRouter::new(config.provider_credentials(), http.clone())
        .with_default_model(config.default_model.clone());

    let gateway = attach_postgres(router, config)?;
    let gateway = attach_redis(gateway, config)?;
    attach_semantic_cache(gateway, config, http)
}

#[cfg(feature = "store-postgres")]
fn attach_postgres(
    router: ProviderRouter,
    config: &GatewayConfig,
) -> Result<Gateway, Box<dyn std::error::Error>> {
    let Some(url) = config.database_url.as_deref() else {
        return Ok(without_postgres(router));
    };
    let store = Arc::new(nexus_gateway::gateway::PostgresStore::connect_lazy(
        url,
        config.store_timeout(),
    )?);
    tracing::info!("quota and usage log backed by postgres");
    Ok(Gateway::new(router, store.clone()).with_usage_sink(store))
}

#[cfg(not(feature = "store-postgres"))]
fn attach_postgres(
    router: ProviderRouter,
    config: &GatewayConfig,
) -> Result<Gateway, Box<dyn std::error::Error>> {
    if config.database_url.is_some() {
        return Err("DB_URL requires `--features store-postgres`".into());
    }
    Ok(without_postgres(router))
}

fn without_postgres(router: ProviderRouter) -> Gateway {
    tracing::warn!("DB_URL not set: no credentials are known, every chat request is unauthorized");
    Gateway::new(router, Arc::new(MemoryQuotaStore::default()))
}

#[cfg(feature = "store-redis")]
fn attach_redis(
    gateway: Gateway,
    config: &GatewayConfig,
) -> Result<Gateway, Box<dyn std::error::Error>> {
    use nexus_gateway::gateway::{ExactCache, RateLimiter, RedisStore};

    let Some(url) = config.redis_url.as_deref() else {
        return Ok(without_redis(gateway));
    };
    let store = RedisStore::new(url)?.with_operation_timeout(config.store_timeout());
    let mut gateway = gateway
        .with_rate_limiter(RateLimiter::new(Arc::new(store.clone()), &config.limits))
        .with_stats(Arc::new(store.clone()));
    if config.cache.exact_enabled {
        gateway = gateway.with_exact_cache(ExactCache::new(
            Arc::new(store),
            config.exact_cache_ttl(),
        ));
    }
    tracing::info!(
        requests_per_minute = config.limits.requests_per_minute,
        exact_cache = config.cache.exact_enabled,
        "rate limiting and exact cache backed by redis"
    );
    Ok(gateway)
}

#[cfg(not(feature = "store-redis"))]
fn attach_redis(
    gateway: Gateway,
    config: &GatewayConfig,
) -> Result<Gateway, Box<dyn std::error::Error>> {
    if config.redis_url.is_some() {
        return Err("REDIS_URL requires `--features store-redis`".into());
    }
    Ok(without_redis(gateway))
}

fn without_redis(gateway: Gateway) -> Gateway {
    tracing::warn!("REDIS_URL not set: rate limiting and exact cache disabled");
    gateway.with_stats(Arc::new(MemoryStats::default()))
}

#[cfg(feature = "store-pinecone")]
fn attach_semantic_cache(
    gateway: Gateway,
    config: &GatewayConfig,
    http: reqwest::Client,
) -> Result<Gateway, Box<dyn std::error::Error>> {
    use nexus_gateway::gateway::{PineconeStore, SemanticCache};
    use nexus_gateway::OpenAiEmbeddings;

    if !config.semantic_cache_ready() {
        tracing::info!("semantic cache disabled");
        return Ok(gateway);
    }
    let (Some(host), Some(api_key)) = (
        config.pinecone_host.as_deref(),
        config.pinecone_api_key.as_deref(),
    ) else {
        return Ok(gateway);
    };

    let vectors = PineconeStore::new(host, api_key).with_http_client(http.clone());
    let mut embedder = OpenAiEmbeddings::new(config.openai_api_key.clone()).with_http_client(http);
    if let Some(base_url) = config.openai_base_url.as_deref() {
        embedder = embedder.with_base_url(base_url);
    }
    tracing::info!(
        threshold = config.cache.semantic_threshold,
        "semantic cache backed by pinecone"
    );
    Ok(gateway.with_semantic_cache(
        Arc::new(embedder),
        SemanticCache::new(Arc::new(vectors), config.cache.semantic_threshold),
    ))
}

#[cfg(not(feature = "store-pinecone"))]
fn attach_semantic_cache(
    gateway: Gateway,
    config: &GatewayConfig,
    _http: reqwest::Client,
) -> Result<Gateway, Box<dyn std::error::Error>> {
    if config.semantic_cache_ready() {
        return Err("PINECONE_HOST requires `--features store-pinecone`".into());
    }
    Ok(gateway)
}
