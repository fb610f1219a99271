//! Collapses duplicate pending submissions of an identical job.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::decision::Decision;
use crate::error::Result;
use crate::job::Job;
use crate::key::{LockKey, DEFAULT_NAMESPACE};
use crate::store::LockStore;

/// Suppresses re-submissions of a job while an identical one is pending.
///
/// "Identical" means same job class and same serialized arguments. The lock
/// is taken at enqueue and cleared just before the job body runs, so a new
/// submission is accepted as soon as the pending one starts.
#[derive(Clone)]
pub struct DedupGate {
    store: Arc<dyn LockStore>,
    namespace: String,
    expiration: Duration,
}

impl DedupGate {
    /// Create a gate whose locks expire after `expiration`.
    pub fn new(store: Arc<dyn LockStore>, expiration: Duration) -> Self {
        Self {
            store,
            namespace: DEFAULT_NAMESPACE.to_string(),
            expiration,
        }
    }

    /// Use a different key namespace.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// How long a pending lock survives if never cleared.
    pub fn expiration(&self) -> Duration {
        self.expiration
    }

    /// Decide whether `job` may be enqueued.
    ///
    /// Returns [`Decision::Proceed`] iff this call created the lock, otherwise
    /// [`Decision::Drop`]. Store failures are returned as errors.
    pub async fn on_enqueue(&self, job: &Job) -> Result<Decision> {
        let key = LockKey::for_dedup(&self.namespace, job)?;
        let value = job.serialized_arguments()?;

        let acquired = self
            .store
            .acquire(key.as_str(), &value, self.expiration)
            .await?;

        if acquired {
            debug!(key = %key, job_id = %job.id_for_log(), "Dedup lock acquired");
            Ok(Decision::Proceed)
        } else {
            debug!(key = %key, job_id = %job.id_for_log(), "Duplicate pending, dropping job");
            Ok(Decision::Drop)
        }
    }

    /// Clear the pending lock for `job`. Must run before the job body.
    ///
    /// Idempotent: clearing an absent lock succeeds.
    pub async fn on_before_perform(&self, job: &Job) -> Result<()> {
        let key = LockKey::for_dedup(&self.namespace, job)?;
        self.store.release(key.as_str()).await?;
        debug!(key = %key, job_id = %job.id_for_log(), "Dedup lock cleared");
        Ok(())
    }
}

impl std::fmt::Debug for DedupGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DedupGate")
            .field("store", &self.store.name())
            .field("namespace", &self.namespace)
            .field("expiration", &self.expiration)
            .finish()
    }
}
