use std::sync::Arc;

use async_trait::async_trait;

use super::observability::StatsStore;
use super::{GraphPoint, StoreError, UsageRecord, redact_credential};
use crate::utils::task::BackgroundTasks;

/// Analytics destination for usage records.
#[async_trait]
pub trait UsageSink: Send + Sync {
    async fn record(&self, record: &UsageRecord) -> Result<(), StoreError>;

    /// Hourly request counts over the last 24 hours, oldest bucket label
    /// first. Sinks without a time index report nothing.
    async fn graph(&self) -> Result<Vec<GraphPoint>, StoreError> {
        Ok(Vec::new())
    }
}

/// Fire-and-forget recorder. Nothing it does can reach the response path.
#[derive(Clone, Default)]
pub struct UsageMeter {
    sink: Option<Arc<dyn UsageSink>>,
    stats: Option<Arc<dyn StatsStore>>,
    background: BackgroundTasks,
}

impl std::fmt::Debug for UsageMeter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsageMeter")
            .field("sink", &self.sink.is_some())
            .field("stats", &self.stats.is_some())
            .finish()
    }
}

impl UsageMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(mut self, sink: Arc<dyn UsageSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_stats(mut self, stats: Arc<dyn StatsStore>) -> Self {
        self.stats = Some(stats);
        self
    }

    pub fn with_background(mut self, background: BackgroundTasks) -> Self {
        self.background = background;
        self
    }

    pub fn stats(&self) -> Option<&Arc<dyn StatsStore>> {
        self.stats.as_ref()
    }

    pub async fn graph(&self) -> Result<Vec<GraphPoint>, StoreError> {
        match &self.sink {
            Some(sink) => sink.graph().await,
            None => Ok(Vec::new()),
        }
    }

    /// `served` marks responses that got past admission; only those move the
    /// aggregate counters.
    pub fn emit(&self, record: UsageRecord, served: bool) {
        let sink = self.sink.clone();
        let stats = if served { self.stats.clone() } else { None };
        if sink.is_none() && stats.is_none() {
            return;
        }
        self.background.spawn("usage.emit", async move {
            if let Some(sink) = sink {
                if let Err(err) = sink.record(&record).await {
                    tracing::warn!(
                        credential = %record.credential.as_deref().map(redact_credential).unwrap_or_default(),
                        operation = "usage.record",
                        model = %record.model,
                        status = record.status,
                        error = %err,
                        "failed to write usage record"
                    );
                }
            }
            if let Some(stats) = stats {
                if let Err(err) = stats.record(record.cache_hit).await {
                    tracing::warn!(operation = "stats.record", error = %err, "failed to update stats");
                }
            }
        });
    }
}
