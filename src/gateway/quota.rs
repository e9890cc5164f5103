use std::sync::Arc;

use async_trait::async_trait;

use super::{QuotaRecord, StoreError, redact_credential};
use crate::utils::task::BackgroundTasks;

/// Credential-keyed usage counter and ceiling.
///
/// This is the only writer of `usage_count` / `usage_limit`.
#[async_trait]
pub trait QuotaStore: Send + Sync {
    /// Reads usage and ceiling in one round trip. `None` means the credential
    /// is unknown.
    async fn lookup(&self, credential: &str) -> Result<Option<QuotaRecord>, StoreError>;

    async fn increment(&self, credential: &str) -> Result<(), StoreError>;

    /// Sets a new ceiling and resets usage to zero. Returns `false` for an
    /// unknown credential.
    async fn upgrade(&self, credential: &str, new_limit: i64) -> Result<bool, StoreError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    Unknown,
    Allowed(QuotaRecord),
    Exhausted(QuotaRecord),
}

impl Admission {
    pub fn from_record(record: Option<QuotaRecord>) -> Self {
        match record {
            None => Self::Unknown,
            Some(record) if record.is_under_limit() => Self::Allowed(record),
            Some(record) => Self::Exhausted(record),
        }
    }

    pub fn allowed(&self) -> bool {
        matches!(self, Self::Allowed(_))
    }
}

#[derive(Clone)]
pub struct QuotaGate {
    store: Arc<dyn QuotaStore>,
    background: BackgroundTasks,
}

impl std::fmt::Debug for QuotaGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaGate").finish_non_exhaustive()
    }
}

impl QuotaGate {
    pub fn new(store: Arc<dyn QuotaStore>) -> Self {
        Self {
            store,
            background: BackgroundTasks::detached(),
        }
    }

    pub fn with_background(mut self, background: BackgroundTasks) -> Self {
        self.background = background;
        self
    }

    /// Store errors are returned to the caller, which must deny the request.
    pub async fn admit(&self, credential: &str) -> Result<Admission, StoreError> {
        let record = self.store.lookup(credential).await?;
        Ok(Admission::from_record(record))
    }

    /// Charges one unit without making the caller wait for it.
    pub fn charge(&self, credential: &str) {
        let store = self.store.clone();
        let credential = credential.to_string();
        self.background.spawn("quota.charge", async move {
            if let Err(err) = store.increment(&credential).await {
                tracing::warn!(
                    credential = %redact_credential(&credential),
                    operation = "quota.increment",
                    error = %err,
                    "failed to charge usage"
                );
            }
        });
    }

    pub async fn upgrade(&self, credential: &str, new_limit: i64) -> Result<bool, StoreError> {
        let upgraded = self.store.upgrade(credential, new_limit).await?;
        if upgraded {
            tracing::info!(
                credential = %redact_credential(credential),
                usage_limit = new_limit,
                "credential upgraded"
            );
        }
        Ok(upgraded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::memory_store::MemoryQuotaStore;

    #[test]
    fn admission_from_record() {
        assert_eq!(Admission::from_record(None), Admission::Unknown);
        assert!(Admission::from_record(Some(QuotaRecord::new(0, 1))).allowed());
        assert_eq!(
            Admission::from_record(Some(QuotaRecord::new(1, 1))),
            Admission::Exhausted(QuotaRecord::new(1, 1))
        );
    }

    #[tokio::test]
    async fn charges_accumulate_until_the_ceiling() {
        let store = Arc::new(
            MemoryQuotaStore::default().with_credential("nk-test", QuotaRecord::new(0, 3)),
        );
        let background = BackgroundTasks::tracked();
        let gate = QuotaGate::new(store.clone()).with_background(background.clone());

        for _ in 0..3 {
            assert!(gate.admit("nk-test").await.unwrap().allowed());
            gate.charge("nk-test");
            background.drain().await;
        }

        assert_eq!(
            gate.admit("nk-test").await.unwrap(),
            Admission::Exhausted(QuotaRecord::new(3, 3))
        );

        assert!(gate.upgrade("nk-test", 10).await.unwrap());
        assert!(gate.admit("nk-test").await.unwrap().allowed());
    }
}
