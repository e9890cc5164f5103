use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::{StoreError, VectorMatch};

pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.70;
pub const ANSWER_METADATA_KEY: &str = "response";
pub const FINGERPRINT_METADATA_KEY: &str = "fingerprint";

/// External nearest-neighbour index.
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn upsert(
        &self,
        id: &str,
        values: &[f32],
        metadata: Map<String, Value>,
    ) -> Result<(), StoreError>;

    /// Ranked matches, most similar first.
    async fn query(&self, values: &[f32], top_k: usize) -> Result<Vec<VectorMatch>, StoreError>;
}

#[derive(Clone, Debug, PartialEq)]
pub struct SemanticHit {
    pub id: String,
    pub answer: String,
    pub score: f32,
}

#[derive(Clone)]
pub struct SemanticCache {
    store: Arc<dyn VectorStore>,
    threshold: f32,
}

impl std::fmt::Debug for SemanticCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SemanticCache")
            .field("threshold", &self.threshold)
            .finish_non_exhaustive()
    }
}

impl SemanticCache {
    pub fn new(store: Arc<dyn VectorStore>, threshold: f32) -> Self {
        Self { store, threshold }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// A score at exactly the threshold counts as a hit.
    pub fn accepts(&self, score: f32) -> bool {
        score >= self.threshold
    }

    /// Nearest neighbour regardless of score. Matches without a stored
    /// answer are treated as no match.
    pub async fn nearest(&self, values: &[f32]) -> Result<Option<SemanticHit>, StoreError> {
        let matches = self.store.query(values, 1).await?;
        let Some(best) = matches.into_iter().next() else {
            return Ok(None);
        };
        let Some(answer) = best
            .metadata
            .get(ANSWER_METADATA_KEY)
            .and_then(Value::as_str)
        else {
            return Ok(None);
        };
        Ok(Some(SemanticHit {
            answer: answer.to_string(),
            id: best.id,
            score: best.score,
        }))
    }

    /// Nearest neighbour that clears the threshold.
    pub async fn lookup(&self, values: &[f32]) -> Result<Option<SemanticHit>, StoreError> {
        let nearest = self.nearest(values).await?;
        Ok(nearest.filter(|hit| self.accepts(hit.score)))
    }

    /// Entries never expire.
    pub async fn store(&self, id: &str, values: &[f32], answer: &str) -> Result<(), StoreError> {
        let mut metadata = Map::new();
        metadata.insert(
            ANSWER_METADATA_KEY.to_string(),
            Value::String(answer.to_string()),
        );
        metadata.insert(
            FINGERPRINT_METADATA_KEY.to_string(),
            Value::String(id.to_string()),
        );
        self.store.upsert(id, values, metadata).await
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}
