//! Detached background work.
//!
//! Usage charges and metering records are submitted here and never report
//! back to the request that produced them. Failures stay inside the task and
//! go to the log.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::task::JoinHandle;

#[derive(Clone, Debug, Default)]
pub struct BackgroundTasks {
    tracked: Option<Arc<Mutex<Vec<JoinHandle<()>>>>>,
}

impl BackgroundTasks {
    /// Fire-and-forget: handles are dropped as soon as the task is spawned.
    pub fn detached() -> Self {
        Self { tracked: None }
    }

    /// Keeps join handles so [`BackgroundTasks::drain`] can wait for them.
    ///
    /// Used by tests that need charges to land before the next admission.
    pub fn tracked() -> Self {
        Self {
            tracked: Some(Arc::new(Mutex::new(Vec::new()))),
        }
    }

    pub fn spawn<F>(&self, label: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(task);
        tracing::trace!(task = label, "background task spawned");
        if let Some(tracked) = &self.tracked {
            tracked
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(handle);
        }
    }

    pub async fn drain(&self) {
        let Some(tracked) = &self.tracked else {
            return;
        };
        loop {
            let handles: Vec<JoinHandle<()>> = {
                let mut guard = tracked.lock().unwrap_or_else(PoisonError::into_inner);
                std::mem::take(&mut *guard)
            };
            if handles.is_empty() {
                return;
            }
            for result in futures_util::future::join_all(handles).await {
                if let Err(err) = result {
                    tracing::warn!(error = %err, "background task failed to join");
                }
            }
        }
    }
}
