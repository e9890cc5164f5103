use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};

use super::metering::UsageSink;
use super::quota::QuotaStore;
use super::{GraphPoint, QuotaRecord, StoreError, UsageRecord, with_timeout};

const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(2);
const DEFAULT_MAX_CONNECTIONS: u32 = 10;

const SCHEMA: &[&str] = &[
    r#"
CREATE TABLE IF NOT EXISTS users (
    id BIGSERIAL PRIMARY KEY,
    email TEXT UNIQUE,
    api_key TEXT NOT NULL UNIQUE,
    usage_count BIGINT NOT NULL DEFAULT 0,
    usage_limit BIGINT NOT NULL DEFAULT 100
)
"#,
    r#"
CREATE TABLE IF NOT EXISTS request_logs (
    id BIGSERIAL PRIMARY KEY,
    api_key TEXT,
    model TEXT NOT NULL,
    status INTEGER NOT NULL,
    is_cache_hit BOOLEAN NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#,
];

/// Credential quotas (`users`) and the analytics log (`request_logs`).
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
    timeout: Duration,
}

impl std::fmt::Debug for PostgresStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresStore")
            .field("timeout", &self.timeout)
            .field("pool_size", &self.pool.size())
            .finish()
    }
}

impl PostgresStore {
    /// Connects lazily: the pool opens connections on first use, so an
    /// unreachable database surfaces per call instead of at startup.
    pub fn connect_lazy(url: &str, timeout: Duration) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(DEFAULT_MAX_CONNECTIONS)
            .acquire_timeout(timeout)
            .connect_lazy(url)?;
        Ok(Self { pool, timeout })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            timeout: DEFAULT_OPERATION_TIMEOUT,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Creates the tables if they are missing. Registration owns real
    /// deployments' schema; this is for local setups and tests.
    pub async fn init(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            with_timeout(
                "postgres.init",
                self.timeout,
                sqlx::query(statement).execute(&self.pool),
            )
            .await?;
        }
        Ok(())
    }

    pub async fn insert_credential(
        &self,
        credential: &str,
        record: QuotaRecord,
    ) -> Result<(), StoreError> {
        with_timeout(
            "postgres.insert_credential",
            self.timeout,
            sqlx::query(
                "INSERT INTO users (api_key, usage_count, usage_limit) VALUES ($1, $2, $3) \
                 ON CONFLICT (api_key) DO UPDATE \
                 SET usage_count = EXCLUDED.usage_count, usage_limit = EXCLUDED.usage_limit",
            )
            .bind(credential)
            .bind(record.usage_count)
            .bind(record.usage_limit)
            .execute(&self.pool),
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl QuotaStore for PostgresStore {
    async fn lookup(&self, credential: &str) -> Result<Option<QuotaRecord>, StoreError> {
        let row: Option<(i64, i64)> = with_timeout(
            "postgres.lookup",
            self.timeout,
            sqlx::query_as::<_, (i64, i64)>(
                "SELECT usage_count::BIGINT, usage_limit::BIGINT FROM users WHERE api_key = $1",
            )
            .bind(credential)
            .fetch_optional(&self.pool),
        )
        .await?;
        Ok(row.map(|(usage_count, usage_limit)| QuotaRecord::new(usage_count, usage_limit)))
    }

    async fn increment(&self, credential: &str) -> Result<(), StoreError> {
        with_timeout(
            "postgres.increment",
            self.timeout,
            sqlx::query("UPDATE users SET usage_count = usage_count + 1 WHERE api_key = $1")
                .bind(credential)
                .execute(&self.pool),
        )
        .await?;
        Ok(())
    }

    async fn upgrade(&self, credential: &str, new_limit: i64) -> Result<bool, StoreError> {
        let result = with_timeout(
            "postgres.upgrade",
            self.timeout,
            sqlx::query("UPDATE users SET usage_limit = $2, usage_count = 0 WHERE api_key = $1")
                .bind(credential)
                .bind(new_limit)
                .execute(&self.pool),
        )
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl UsageSink for PostgresStore {
    async fn record(&self, record: &UsageRecord) -> Result<(), StoreError> {
        with_timeout(
            "postgres.request_log",
            self.timeout,
            sqlx::query(
                "INSERT INTO request_logs (api_key, model, status, is_cache_hit) \
                 VALUES ($1, $2, $3, $4)",
            )
            .bind(record.credential.as_deref())
            .bind(&record.model)
            .bind(i32::from(record.status))
            .bind(record.cache_hit)
            .execute(&self.pool),
        )
        .await?;
        Ok(())
    }

    async fn graph(&self) -> Result<Vec<GraphPoint>, StoreError> {
        let rows = with_timeout(
            "postgres.request_graph",
            self.timeout,
            sqlx::query_as::<_, (String, i64)>(
                "SELECT to_char(created_at AT TIME ZONE 'UTC', 'HH24:00') AS time, COUNT(*) \
                 FROM request_logs \
                 WHERE created_at > NOW() - INTERVAL '24 hours' \
                 GROUP BY 1 ORDER BY 1 ASC",
            )
            .fetch_all(&self.pool),
        )
        .await?;
        Ok(rows
            .into_iter()
            .map(|(time, count)| GraphPoint { time, count })
            .collect())
    }
}
