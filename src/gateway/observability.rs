use async_trait::async_trait;

use super::{StatsSnapshot, StoreError};

/// Aggregate counters behind `GET /api/stats`.
#[async_trait]
pub trait StatsStore: Send + Sync {
    /// Counts one served chat response, split by whether a cache tier answered.
    async fn record(&self, cache_hit: bool) -> Result<(), StoreError>;

    async fn snapshot(&self) -> Result<StatsSnapshot, StoreError>;
}

impl StatsSnapshot {
    /// Share of served responses that came from a cache tier.
    pub fn hit_ratio(&self) -> f64 {
        if self.total_requests == 0 {
            return 0.0;
        }
        self.cache_hits as f64 / self.total_requests as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_ratio_handles_empty_counters() {
        assert_eq!(StatsSnapshot::default().hit_ratio(), 0.0);
        let snapshot = StatsSnapshot {
            total_requests: 4,
            cache_hits: 1,
            cache_misses: 3,
        };
        assert!((snapshot.hit_ratio() - 0.25).abs() < f64::EPSILON);
    }
}
