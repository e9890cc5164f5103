use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::semantic_cache::VectorStore;
use super::{StoreError, VectorMatch};
use crate::providers::transport::{default_http_client, join_endpoint, post_json};

/// Pinecone index reached over its data-plane REST API.
#[derive(Clone)]
pub struct PineconeStore {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl std::fmt::Debug for PineconeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PineconeStore")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Serialize)]
struct UpsertRequest<'a> {
    vectors: [UpsertVector<'a>; 1],
}

#[derive(Debug, Serialize)]
struct UpsertVector<'a> {
    id: &'a str,
    values: &'a [f32],
    metadata: Map<String, Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryRequest<'a> {
    vector: &'a [f32],
    top_k: usize,
    include_metadata: bool,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    matches: Vec<VectorMatch>,
}

impl PineconeStore {
    /// `host` is the index host, with or without a scheme.
    pub fn new(host: impl AsRef<str>, api_key: impl Into<String>) -> Self {
        let host = host.as_ref().trim();
        let base_url = if host.starts_with("http://") || host.starts_with("https://") {
            host.to_string()
        } else {
            format!("https://{host}")
        };
        Self {
            http: default_http_client(),
            base_url,
            api_key: api_key.into(),
        }
    }

    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl VectorStore for PineconeStore {
    async fn upsert(
        &self,
        id: &str,
        values: &[f32],
        metadata: Map<String, Value>,
    ) -> Result<(), StoreError> {
        let body = UpsertRequest {
            vectors: [UpsertVector {
                id,
                values,
                metadata,
            }],
        };
        let request = self
            .http
            .post(join_endpoint(&self.base_url, "vectors/upsert"))
            .header("Api-Key", &self.api_key);
        let _: Value = post_json(request, &body).await?;
        Ok(())
    }

    async fn query(&self, values: &[f32], top_k: usize) -> Result<Vec<VectorMatch>, StoreError> {
        let body = QueryRequest {
            vector: values,
            top_k,
            include_metadata: true,
        };
        let request = self
            .http
            .post(join_endpoint(&self.base_url, "query"))
            .header("Api-Key", &self.api_key);
        let parsed: QueryResponse = post_json(request, &body).await?;
        Ok(parsed.matches)
    }
}
